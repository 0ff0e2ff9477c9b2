//! Encode worker.
//!
//! One worker thread runs per session. It pops frames from the [`FrameQueue`],
//! converts them to YUV 4:2:0 semi-planar, feeds the video codec together with
//! a block of silence for the audio codec, and routes codec output to the
//! [`MuxSynchronizer`]. When the queue reports that the session is over it
//! flushes the codecs, finalizes the container and returns an
//! [`EncodeOutcome`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bitmp4_codec::{CodecAdapter, CodecError, CodecOutput, Frame, SubmitStatus, TrackKind};
use tokio_util::sync::CancellationToken;

use crate::mux::{ContainerWriter, MuxSynchronizer};
use crate::queue::{FrameQueue, Pop};

/// Rate used to derive presentation timestamps from the frame index.
pub const TIMESTAMP_FRAME_RATE: u64 = 20;

/// Bytes of silence submitted to the audio codec with every frame.
pub const SILENCE_CHUNK_LEN: usize = 4096;

/// How long the worker waits for a frame before re-checking cancellation.
const QUEUE_WAIT: Duration = Duration::from_millis(20);

/// Timeout passed to each codec poll.
const POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Consecutive polls without output after which draining gives up.
const MAX_EMPTY_POLLS: u32 = 50;

/// Presentation timestamp of the frame at `frame_index`, in microseconds.
pub fn presentation_time_us(frame_index: u64) -> u64 {
    frame_index * 1_000_000 / TIMESTAMP_FRAME_RATE
}

/// Statistics of a session that produced output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeSummary {
    /// File the session wrote.
    pub output_path: PathBuf,
    /// Frames that were converted and stamped.
    pub frames_added: u64,
    /// Frames dropped because conversion or submission failed.
    pub frames_skipped: u64,
    /// Frames the video codec had no room for.
    pub frames_busy: u64,
    /// Video samples written to the container.
    pub video_samples: u64,
    /// Audio samples written to the container.
    pub audio_samples: u64,
    /// Access units dropped because the container had not started yet.
    pub dropped_before_start: u64,
    /// Whether the session was ended by `stop` rather than `finish`.
    pub interrupted: bool,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeOutcome {
    /// Frames were encoded and the container was finalized.
    Completed(EncodeSummary),
    /// The container could not be started or finalized. The file at
    /// `summary.output_path` is missing or incomplete.
    Failed {
        summary: EncodeSummary,
        error: String,
    },
    /// The session ended before any frame was added. No file was written.
    NoFrames,
}

impl EncodeOutcome {
    pub fn summary(&self) -> Option<&EncodeSummary> {
        match self {
            Self::Completed(summary) | Self::Failed { summary, .. } => Some(summary),
            Self::NoFrames => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

#[derive(Debug, Default)]
struct Counters {
    frames_added: u64,
    frames_skipped: u64,
    frames_busy: u64,
    video_submitted: u64,
    video_encoded: u64,
    /// First container error seen during the session.
    container_error: Option<String>,
}

impl Counters {
    fn container_failed(&mut self, error: String) {
        tracing::error!("{}", error);
        self.container_error.get_or_insert(error);
    }
}

/// What one poll of a codec produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drained {
    Progress,
    Empty,
    EndOfStream,
    Failed,
}

/// The collaborators a session needs.
pub(crate) struct SessionParts {
    pub video: Box<dyn CodecAdapter>,
    pub audio: Box<dyn CodecAdapter>,
    pub container: Box<dyn ContainerWriter>,
}

pub(crate) struct EncodeWorker {
    queue: Arc<FrameQueue>,
    cancel: CancellationToken,
    video: Box<dyn CodecAdapter>,
    audio: Box<dyn CodecAdapter>,
    mux: MuxSynchronizer<Box<dyn ContainerWriter>>,
    output_path: PathBuf,
    silence: Vec<u8>,
    counters: Counters,
}

impl EncodeWorker {
    pub fn new(
        queue: Arc<FrameQueue>,
        cancel: CancellationToken,
        parts: SessionParts,
        output_path: PathBuf,
    ) -> Self {
        Self {
            queue,
            cancel,
            video: parts.video,
            audio: parts.audio,
            mux: MuxSynchronizer::new(parts.container),
            output_path,
            silence: vec![0u8; SILENCE_CHUNK_LEN],
            counters: Counters::default(),
        }
    }

    /// Run the session to completion.
    pub fn run(mut self) -> EncodeOutcome {
        tracing::info!("Encode worker started for {}", self.output_path.display());
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.queue.pop_timeout(QUEUE_WAIT) {
                Pop::Frame(frame) => self.encode_frame(frame),
                Pop::Timeout => continue,
                Pop::Drained => break,
            }
        }
        let interrupted = self.cancel.is_cancelled();
        let outcome = self.teardown(interrupted);
        self.queue.end_session();
        outcome
    }

    fn encode_frame(&mut self, frame: Frame) {
        let index = self.counters.frames_added;
        let yuv = match frame.to_yuv420sp() {
            Ok(yuv) => yuv,
            Err(e) => {
                self.counters.frames_skipped += 1;
                tracing::warn!("Skipping frame {}: conversion failed: {}", index, e);
                return;
            }
        };

        let pts_us = presentation_time_us(index);
        match self.video.submit(&yuv, pts_us) {
            Ok(SubmitStatus::Accepted(_)) => self.counters.video_submitted += 1,
            Ok(SubmitStatus::Busy) => {
                self.counters.frames_busy += 1;
                tracing::debug!("Video codec busy, frame {} not submitted", index);
            }
            Err(e) => {
                self.counters.frames_skipped += 1;
                tracing::warn!("Skipping frame {}: video submit failed: {}", index, e);
                return;
            }
        }

        match self.audio.submit(&self.silence, pts_us) {
            Ok(SubmitStatus::Accepted(_)) => {}
            Ok(SubmitStatus::Busy) => {
                tracing::debug!("Audio codec busy at {} us", pts_us);
            }
            Err(e) => tracing::warn!("Audio submit failed at {} us: {}", pts_us, e),
        }

        self.counters.frames_added += 1;
        self.drain_pending();
    }

    /// Poll both codecs until every submitted video frame has come out, or the
    /// codecs stop producing output.
    fn drain_pending(&mut self) {
        let mut empty_polls = 0;
        while self.counters.video_submitted > self.counters.video_encoded {
            if self.cancel.is_cancelled() {
                return;
            }
            let video = route_output(&mut *self.video, &mut self.mux, &mut self.counters);
            let audio = route_output(&mut *self.audio, &mut self.mux, &mut self.counters);
            if video == Drained::Progress || audio == Drained::Progress {
                empty_polls = 0;
                continue;
            }
            if matches!(video, Drained::EndOfStream | Drained::Failed) {
                return;
            }
            empty_polls += 1;
            if empty_polls >= MAX_EMPTY_POLLS {
                tracing::debug!(
                    "Video codec produced no output after {} polls ({} of {} frames out)",
                    empty_polls,
                    self.counters.video_encoded,
                    self.counters.video_submitted
                );
                return;
            }
        }
    }

    /// Signal end of input and poll until both codecs report end of stream.
    fn drain_to_end(&mut self) {
        let mut video_done = signal_end(&mut *self.video);
        let mut audio_done = signal_end(&mut *self.audio);
        let mut empty_polls = 0;

        while !(video_done && audio_done) {
            if self.cancel.is_cancelled() {
                tracing::debug!("Cancelled while draining codecs");
                return;
            }
            let mut progressed = false;
            for (codec, done) in [
                (&mut self.video, &mut video_done),
                (&mut self.audio, &mut audio_done),
            ] {
                if *done {
                    continue;
                }
                match route_output(&mut **codec, &mut self.mux, &mut self.counters) {
                    Drained::Progress => progressed = true,
                    Drained::Empty => {}
                    Drained::EndOfStream | Drained::Failed => *done = true,
                }
            }
            if progressed {
                empty_polls = 0;
                continue;
            }
            empty_polls += 1;
            if empty_polls >= MAX_EMPTY_POLLS {
                tracing::warn!(
                    "Codecs did not reach end of stream (video: {}, audio: {})",
                    video_done,
                    audio_done
                );
                return;
            }
        }
    }

    fn drain_once(&mut self) {
        route_output(&mut *self.video, &mut self.mux, &mut self.counters);
        route_output(&mut *self.audio, &mut self.mux, &mut self.counters);
    }

    fn close_codecs(&mut self) {
        if let Err(e) = self.video.close() {
            tracing::error!("Failed to close video codec: {}", e);
        }
        if let Err(e) = self.audio.close() {
            tracing::error!("Failed to close audio codec: {}", e);
        }
        tracing::info!("Codecs released");
    }

    fn teardown(&mut self, interrupted: bool) -> EncodeOutcome {
        if self.counters.frames_added == 0 {
            // Nothing to flush: the container never started, so finish only
            // releases it
            self.close_codecs();
            if let Err(e) = self.mux.finish() {
                tracing::error!("Failed to release {}: {:#}", self.output_path.display(), e);
            }
            tracing::info!("Session ended without any frame, nothing written");
            return EncodeOutcome::NoFrames;
        }

        if interrupted {
            self.drain_once();
        } else {
            self.drain_to_end();
        }

        self.close_codecs();
        if let Err(e) = self.mux.finish() {
            self.counters.container_failed(format!(
                "Failed to finalize {}: {:#}",
                self.output_path.display(),
                e
            ));
        }

        let stats = self.mux.stats();
        tracing::info!(
            "Encoding {} ({} frames, {} video / {} audio samples)",
            if interrupted { "stopped" } else { "finished" },
            self.counters.frames_added,
            stats.video_written,
            stats.audio_written
        );
        let summary = EncodeSummary {
            output_path: self.output_path.clone(),
            frames_added: self.counters.frames_added,
            frames_skipped: self.counters.frames_skipped,
            frames_busy: self.counters.frames_busy,
            video_samples: stats.video_written,
            audio_samples: stats.audio_written,
            dropped_before_start: stats.dropped_before_start,
            interrupted,
        };
        match self.counters.container_error.take() {
            Some(error) => EncodeOutcome::Failed { summary, error },
            None => EncodeOutcome::Completed(summary),
        }
    }
}

fn signal_end(codec: &mut dyn CodecAdapter) -> bool {
    match codec.signal_end_of_input() {
        Ok(()) => false,
        Err(e) => {
            tracing::warn!("Failed to signal end of {} input: {}", codec.track_kind(), e);
            true
        }
    }
}

/// Poll `codec` once and hand whatever it produced to the muxer.
fn route_output(
    codec: &mut dyn CodecAdapter,
    mux: &mut MuxSynchronizer<Box<dyn ContainerWriter>>,
    counters: &mut Counters,
) -> Drained {
    match codec.poll_output(POLL_TIMEOUT) {
        Ok(CodecOutput::FormatReady(format)) => {
            if let Err(e) = mux.on_format_ready(&format) {
                counters.container_failed(format!("{:#}", e));
            }
            Drained::Progress
        }
        Ok(CodecOutput::Data(unit)) => {
            if unit.track == TrackKind::Video {
                counters.video_encoded += 1;
            }
            mux.on_access_unit(&unit);
            Drained::Progress
        }
        Ok(CodecOutput::Empty) => Drained::Empty,
        Ok(CodecOutput::EndOfStream) | Err(CodecError::EndOfStream) => Drained::EndOfStream,
        Err(e) => {
            tracing::warn!("Failed to poll {} codec: {}", codec.track_kind(), e);
            Drained::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::RecordingBackend;
    use crate::backend::MediaBackend;
    use crate::mux::tests::{RecordingWriter, WriterCall};
    use bitmp4_codec::{AudioEncoderConfig, VideoEncoderConfig};

    fn worker(backend: &RecordingBackend, queue: Arc<FrameQueue>, cancel: CancellationToken) -> EncodeWorker {
        let parts = SessionParts {
            video: backend
                .create_video_codec(&VideoEncoderConfig::new(4, 4))
                .unwrap(),
            audio: backend
                .create_audio_codec(&AudioEncoderConfig::default())
                .unwrap(),
            container: backend.create_container(std::path::Path::new("out.mp4")).unwrap(),
        };
        EncodeWorker::new(queue, cancel, parts, PathBuf::from("out.mp4"))
    }

    #[test]
    fn test_presentation_time() {
        assert_eq!(presentation_time_us(0), 0);
        assert_eq!(presentation_time_us(1), 50_000);
        assert_eq!(presentation_time_us(20), 1_000_000);
    }

    #[test]
    fn test_finish_writes_every_frame() {
        let backend = RecordingBackend::default();
        let queue = Arc::new(FrameQueue::new());
        queue.begin_session();
        for i in 0..5 {
            assert!(queue.enqueue(Frame::solid(4, 4, 0xFF000000 | i)));
        }
        queue.request_finish();

        let outcome = worker(&backend, queue.clone(), CancellationToken::new()).run();
        let summary = outcome.summary().unwrap().clone();
        assert_eq!(summary.frames_added, 5);
        assert_eq!(summary.video_samples, 5);
        assert_eq!(summary.audio_samples, 5);
        assert_eq!(summary.dropped_before_start, 0);
        assert!(!summary.interrupted);
        assert_eq!(queue.state(), crate::SessionState::Idle);

        let expected: Vec<u64> = (0..5).map(presentation_time_us).collect();
        assert_eq!(backend.video_pts(), expected);
        assert_eq!(backend.audio_pts(), expected);

        let calls = backend.writer.calls();
        assert_eq!(calls[2], WriterCall::Start);
        assert_eq!(calls[calls.len() - 2], WriterCall::Stop);
        assert_eq!(calls.last(), Some(&WriterCall::Release));
    }

    #[test]
    fn test_bad_frame_does_not_advance_timestamps() {
        let backend = RecordingBackend::default();
        let queue = Arc::new(FrameQueue::new());
        queue.begin_session();
        queue.enqueue(Frame::solid(4, 4, 0xFFFFFFFF));
        // Odd height cannot be converted
        queue.enqueue(Frame::solid(4, 3, 0xFFFFFFFF));
        queue.enqueue(Frame::solid(4, 4, 0xFFFFFFFF));
        queue.request_finish();

        let outcome = worker(&backend, queue, CancellationToken::new()).run();
        let summary = outcome.summary().unwrap();
        assert_eq!(summary.frames_added, 2);
        assert_eq!(summary.frames_skipped, 1);
        assert_eq!(backend.video_pts(), vec![0, 50_000]);
    }

    #[test]
    fn test_no_frames_releases_without_writing() {
        let backend = RecordingBackend::default();
        let queue = Arc::new(FrameQueue::new());
        queue.begin_session();
        queue.request_finish();

        let outcome = worker(&backend, queue, CancellationToken::new()).run();
        assert_eq!(outcome, EncodeOutcome::NoFrames);
        assert_eq!(backend.writer.calls(), vec![WriterCall::Release]);
        assert_eq!(backend.codec_closes(), 2);
    }

    #[test]
    fn test_finished_session_closes_codecs() {
        let backend = RecordingBackend::default();
        let queue = Arc::new(FrameQueue::new());
        queue.begin_session();
        queue.enqueue(Frame::solid(4, 4, 0));
        queue.request_finish();

        let outcome = worker(&backend, queue, CancellationToken::new()).run();
        assert!(outcome.is_completed());
        assert_eq!(backend.codec_closes(), 2);
    }

    #[test]
    fn test_container_start_failure_fails_session() {
        let backend = RecordingBackend {
            writer: RecordingWriter {
                fail_start: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let queue = Arc::new(FrameQueue::new());
        queue.begin_session();
        for _ in 0..5 {
            queue.enqueue(Frame::solid(4, 4, 0));
        }
        queue.request_finish();

        let outcome = worker(&backend, queue, CancellationToken::new()).run();
        match outcome {
            EncodeOutcome::Failed { summary, error } => {
                assert!(error.contains("failed to start container"), "{}", error);
                assert_eq!(summary.frames_added, 5);
                assert_eq!(summary.video_samples, 0);
                assert_eq!(summary.dropped_before_start, 10);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(backend.writer.calls().last(), Some(&WriterCall::Release));
        assert_eq!(backend.codec_closes(), 2);
    }

    #[test]
    fn test_drain_waits_for_late_output() {
        // One input slot per codec: if a frame's output were not drained
        // before the next frame, the next submit would be rejected as busy
        let backend = RecordingBackend {
            output_delay_polls: 3,
            input_capacity: Some(1),
            ..Default::default()
        };
        let queue = Arc::new(FrameQueue::new());
        queue.begin_session();
        for i in 0..6 {
            queue.enqueue(Frame::solid(4, 4, 0xFF000000 | i));
        }
        queue.request_finish();

        let outcome = worker(&backend, queue, CancellationToken::new()).run();
        let summary = outcome.summary().unwrap();
        assert!(outcome.is_completed());
        assert_eq!(summary.frames_added, 6);
        assert_eq!(summary.frames_busy, 0);
        assert_eq!(summary.video_samples, 6);
        assert_eq!(summary.audio_samples, 6);
        assert_eq!(summary.dropped_before_start, 0);

        let expected: Vec<u64> = (0..6).map(presentation_time_us).collect();
        let video_written: Vec<u64> = backend
            .writer
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                WriterCall::Sample { track: 0, pts_us } => Some(pts_us),
                _ => None,
            })
            .collect();
        assert_eq!(video_written, expected);
        assert_eq!(expected[1], 50_000);
    }

    #[test]
    fn test_stalled_codec_does_not_hang() {
        let backend = RecordingBackend {
            stall_video: true,
            ..Default::default()
        };
        let queue = Arc::new(FrameQueue::new());
        queue.begin_session();
        for _ in 0..3 {
            queue.enqueue(Frame::solid(4, 4, 0));
        }
        queue.request_finish();

        let outcome = worker(&backend, queue, CancellationToken::new()).run();
        let summary = outcome.summary().unwrap();
        assert_eq!(summary.frames_added, 3);
        // Audio alone never starts the container
        assert_eq!(summary.video_samples, 0);
        assert_eq!(summary.audio_samples, 0);
        assert_eq!(summary.dropped_before_start, 3);
    }

    #[test]
    fn test_cancelled_session_is_interrupted() {
        let backend = RecordingBackend::default();
        let queue = Arc::new(FrameQueue::new());
        let cancel = CancellationToken::new();
        queue.begin_session();
        queue.enqueue(Frame::solid(4, 4, 0));

        let handle = {
            let w = worker(&backend, queue.clone(), cancel.clone());
            std::thread::spawn(move || w.run())
        };
        std::thread::sleep(Duration::from_millis(100));
        cancel.cancel();
        queue.request_stop();

        let outcome = handle.join().unwrap();
        let summary = outcome.summary().unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.frames_added, 1);
        assert_eq!(backend.writer.calls().last(), Some(&WriterCall::Release));
    }
}
