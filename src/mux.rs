//! Track registration and sample routing between the codecs and the container.
//!
//! The container can only be started once both the video and the audio codec
//! have announced their output format. [`MuxSynchronizer`] counts those
//! announcements, starts the writer on the second one, and from then on routes
//! every access unit to its track. Units that arrive before the start are
//! dropped.

use anyhow::{Context, Result};
use bitmp4_codec::{AccessUnit, FormatDescriptor, TrackKind};

/// Number of tracks that must be registered before writing can begin.
pub const REQUIRED_TRACKS: usize = 2;

/// A container file that accepts tracks up front and samples afterwards.
pub trait ContainerWriter: Send {
    /// Register a track and return its index. Only valid before [`start`](Self::start).
    fn add_track(&mut self, format: &FormatDescriptor) -> Result<usize>;

    /// Write the track table. Called once, after all tracks are registered.
    fn start(&mut self) -> Result<()>;

    /// Append one access unit to the given track.
    fn write_sample(&mut self, track: usize, unit: &AccessUnit) -> Result<()>;

    /// Flush buffered samples and finalize the container.
    fn stop(&mut self) -> Result<()>;

    /// Release the underlying file handle.
    fn release(&mut self) -> Result<()>;
}

impl<W: ContainerWriter + ?Sized> ContainerWriter for Box<W> {
    fn add_track(&mut self, format: &FormatDescriptor) -> Result<usize> {
        (**self).add_track(format)
    }

    fn start(&mut self) -> Result<()> {
        (**self).start()
    }

    fn write_sample(&mut self, track: usize, unit: &AccessUnit) -> Result<()> {
        (**self).write_sample(track, unit)
    }

    fn stop(&mut self) -> Result<()> {
        (**self).stop()
    }

    fn release(&mut self) -> Result<()> {
        (**self).release()
    }
}

/// Per-track sample counters kept by the synchronizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxStats {
    /// Video samples written to the container.
    pub video_written: u64,
    /// Audio samples written to the container.
    pub audio_written: u64,
    /// Access units dropped because the container had not started yet.
    pub dropped_before_start: u64,
    /// Access units skipped because their payload was empty.
    pub skipped_empty: u64,
    /// Access units the container refused to write.
    pub write_errors: u64,
}

/// Gates container start on both format announcements and routes samples.
pub struct MuxSynchronizer<W: ContainerWriter> {
    writer: W,
    track_index: [Option<usize>; REQUIRED_TRACKS],
    registered: usize,
    started: bool,
    finished: bool,
    stats: MuxStats,
}

impl<W: ContainerWriter> MuxSynchronizer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            track_index: [None; REQUIRED_TRACKS],
            registered: 0,
            started: false,
            finished: false,
            stats: MuxStats::default(),
        }
    }

    /// Handle a format-ready event from one of the codecs.
    ///
    /// The container starts when the second distinct track registers. A repeated
    /// announcement for an already registered track is ignored.
    pub fn on_format_ready(&mut self, format: &FormatDescriptor) -> Result<()> {
        let kind = format.kind();
        if self.track_index[kind.index()].is_some() {
            tracing::warn!("Ignoring repeated {} format announcement", kind);
            return Ok(());
        }

        let index = self
            .writer
            .add_track(format)
            .with_context(|| format!("failed to register {} track", kind))?;
        self.track_index[kind.index()] = Some(index);
        self.registered += 1;
        tracing::debug!("Registered {} track as index {}", kind, index);

        if self.registered == REQUIRED_TRACKS {
            self.writer.start().context("failed to start container")?;
            self.started = true;
            tracing::info!("Muxer started with {} tracks", self.registered);
        }
        Ok(())
    }

    /// Handle a compressed access unit from one of the codecs.
    ///
    /// Returns `true` when the unit was written.
    pub fn on_access_unit(&mut self, unit: &AccessUnit) -> bool {
        if !self.started {
            self.stats.dropped_before_start += 1;
            tracing::debug!(
                "Muxer not started, dropping {} unit at {} us",
                unit.track,
                unit.pts_us
            );
            return false;
        }
        if self.finished {
            self.stats.write_errors += 1;
            tracing::warn!("Muxer already finished, dropping {} unit", unit.track);
            return false;
        }
        if unit.data.is_empty() {
            self.stats.skipped_empty += 1;
            tracing::debug!("Skipping empty {} unit at {} us", unit.track, unit.pts_us);
            return false;
        }
        let Some(index) = self.track_index[unit.track.index()] else {
            self.stats.dropped_before_start += 1;
            return false;
        };

        match self.writer.write_sample(index, unit) {
            Ok(()) => {
                match unit.track {
                    TrackKind::Video => self.stats.video_written += 1,
                    TrackKind::Audio => self.stats.audio_written += 1,
                }
                true
            }
            Err(e) => {
                self.stats.write_errors += 1;
                tracing::warn!("Failed to write {} sample: {:#}", unit.track, e);
                false
            }
        }
    }

    /// Number of tracks registered so far.
    pub fn registered_tracks(&self) -> usize {
        self.registered
    }

    /// Whether the container has been started.
    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn stats(&self) -> MuxStats {
        self.stats
    }

    /// Stop and release the container.
    ///
    /// Release runs even when stopping fails. Calling this more than once is a
    /// no-op.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let stopped = if self.started {
            self.writer.stop().context("failed to stop container")
        } else {
            Ok(())
        };
        let released = self.writer.release().context("failed to release container");
        stopped.and(released)
    }
}
