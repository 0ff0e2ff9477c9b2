//! Factories for the per-session codecs and container.

use std::path::Path;

use anyhow::{Context, Result};
use bitmp4_codec::{
    AudioEncoderConfig, CodecAdapter, PcmAudioEncoder, RawVideoEncoder, VideoEncoderConfig,
};

use crate::mp4::{Mp4Writer, DEFAULT_FRAGMENT_DURATION_MS};
use crate::mux::ContainerWriter;

/// Creates the video codec, audio codec and container writer for a session.
///
/// The encoder calls each method once when a session starts. Any error aborts
/// the start.
pub trait MediaBackend: Send + Sync {
    fn create_video_codec(&self, config: &VideoEncoderConfig) -> Result<Box<dyn CodecAdapter>>;

    fn create_audio_codec(&self, config: &AudioEncoderConfig) -> Result<Box<dyn CodecAdapter>>;

    fn create_container(&self, path: &Path) -> Result<Box<dyn ContainerWriter>>;
}

/// Backend built from the software pass-through codecs and the fragmented MP4
/// writer.
#[derive(Debug, Clone)]
pub struct SoftwareBackend {
    fragment_duration_ms: u32,
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self {
            fragment_duration_ms: DEFAULT_FRAGMENT_DURATION_MS,
        }
    }
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target fragment duration of the MP4 writer.
    #[must_use]
    pub fn fragment_duration_ms(mut self, ms: u32) -> Self {
        self.fragment_duration_ms = ms;
        self
    }
}

impl MediaBackend for SoftwareBackend {
    fn create_video_codec(&self, config: &VideoEncoderConfig) -> Result<Box<dyn CodecAdapter>> {
        let codec = RawVideoEncoder::new(config.clone()).context("failed to create video codec")?;
        Ok(Box::new(codec))
    }

    fn create_audio_codec(&self, config: &AudioEncoderConfig) -> Result<Box<dyn CodecAdapter>> {
        let codec = PcmAudioEncoder::new(config.clone()).context("failed to create audio codec")?;
        Ok(Box::new(codec))
    }

    fn create_container(&self, path: &Path) -> Result<Box<dyn ContainerWriter>> {
        let writer = Mp4Writer::create(path)?.fragment_duration_ms(self.fragment_duration_ms);
        Ok(Box::new(writer))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Backends that record what the worker does.

    use super::*;
    use crate::mux::tests::RecordingWriter;
    use bitmp4_codec::{CodecError, CodecOutput, SubmitStatus, TrackKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Wraps a codec, logs the timestamp of every accepted submission and counts
    /// `close` calls. With `delay_polls > 0` every output event is preceded by
    /// that many `Empty` polls.
    pub(crate) struct RecordingCodec<C> {
        inner: C,
        log: Arc<Mutex<Vec<u64>>>,
        closes: Arc<AtomicUsize>,
        delay_polls: u32,
        waited: u32,
    }

    impl<C: CodecAdapter> CodecAdapter for RecordingCodec<C> {
        fn track_kind(&self) -> TrackKind {
            self.inner.track_kind()
        }

        fn submit(&mut self, input: &[u8], pts_us: u64) -> Result<SubmitStatus, CodecError> {
            let status = self.inner.submit(input, pts_us)?;
            if let SubmitStatus::Accepted(_) = status {
                self.log.lock().unwrap().push(pts_us);
            }
            Ok(status)
        }

        fn poll_output(&mut self, timeout: Duration) -> Result<CodecOutput, CodecError> {
            if self.waited < self.delay_polls {
                self.waited += 1;
                return Ok(CodecOutput::Empty);
            }
            self.waited = 0;
            self.inner.poll_output(timeout)
        }

        fn signal_end_of_input(&mut self) -> Result<(), CodecError> {
            self.inner.signal_end_of_input()
        }

        fn close(&mut self) -> Result<(), CodecError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.inner.close()
        }
    }

    /// A video codec that accepts input but never produces output.
    pub(crate) struct StallingCodec;

    impl CodecAdapter for StallingCodec {
        fn track_kind(&self) -> TrackKind {
            TrackKind::Video
        }

        fn submit(&mut self, _input: &[u8], _pts_us: u64) -> Result<SubmitStatus, CodecError> {
            Ok(SubmitStatus::Accepted(0))
        }

        fn poll_output(&mut self, _timeout: Duration) -> Result<CodecOutput, CodecError> {
            Ok(CodecOutput::Empty)
        }

        fn signal_end_of_input(&mut self) -> Result<(), CodecError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), CodecError> {
            Ok(())
        }
    }

    /// Software codecs with submission logs, writing to a [`RecordingWriter`].
    #[derive(Clone, Default)]
    pub(crate) struct RecordingBackend {
        pub video_pts: Arc<Mutex<Vec<u64>>>,
        pub audio_pts: Arc<Mutex<Vec<u64>>>,
        pub writer: RecordingWriter,
        pub codec_closes: Arc<AtomicUsize>,
        pub stall_video: bool,
        pub fail_container: bool,
        /// Empty polls before every output event of both codecs.
        pub output_delay_polls: u32,
        /// Input capacity of both codecs (64 when unset).
        pub input_capacity: Option<usize>,
    }

    impl RecordingBackend {
        pub fn codec_closes(&self) -> usize {
            self.codec_closes.load(Ordering::SeqCst)
        }

        fn wrap<C>(&self, inner: C, log: &Arc<Mutex<Vec<u64>>>) -> RecordingCodec<C> {
            RecordingCodec {
                inner,
                log: log.clone(),
                closes: self.codec_closes.clone(),
                delay_polls: self.output_delay_polls,
                waited: 0,
            }
        }

        pub fn video_pts(&self) -> Vec<u64> {
            self.video_pts.lock().unwrap().clone()
        }

        pub fn audio_pts(&self) -> Vec<u64> {
            self.audio_pts.lock().unwrap().clone()
        }
    }

    impl MediaBackend for RecordingBackend {
        fn create_video_codec(
            &self,
            config: &VideoEncoderConfig,
        ) -> Result<Box<dyn CodecAdapter>> {
            if self.stall_video {
                return Ok(Box::new(StallingCodec));
            }
            let capacity = self.input_capacity.unwrap_or(64);
            let codec = RawVideoEncoder::with_capacity(config.clone(), capacity)?;
            Ok(Box::new(self.wrap(codec, &self.video_pts)))
        }

        fn create_audio_codec(
            &self,
            config: &AudioEncoderConfig,
        ) -> Result<Box<dyn CodecAdapter>> {
            let capacity = self.input_capacity.unwrap_or(64);
            let codec = PcmAudioEncoder::with_capacity(config.clone(), capacity)?;
            Ok(Box::new(self.wrap(codec, &self.audio_pts)))
        }

        fn create_container(&self, _path: &Path) -> Result<Box<dyn ContainerWriter>> {
            anyhow::ensure!(!self.fail_container, "container unavailable");
            Ok(Box::new(self.writer.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_backend_creates_session_parts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SoftwareBackend::new();

        let video = backend
            .create_video_codec(&VideoEncoderConfig::new(16, 16))
            .unwrap();
        assert_eq!(video.track_kind(), bitmp4_codec::TrackKind::Video);

        let audio = backend
            .create_audio_codec(&AudioEncoderConfig::default())
            .unwrap();
        assert_eq!(audio.track_kind(), bitmp4_codec::TrackKind::Audio);

        let path = dir.path().join("out.mp4");
        let mut container = backend.create_container(&path).unwrap();
        assert!(path.exists());
        // Released without starting, so the reserved file goes away
        container.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_software_backend_rejects_bad_config() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SoftwareBackend::new();
        assert!(backend
            .create_video_codec(&VideoEncoderConfig::new(0, 0))
            .is_err());
        assert!(backend
            .create_container(&dir.path().join("missing").join("out.mp4"))
            .is_err());
        // A directory cannot be opened as the output file
        assert!(backend.create_container(dir.path()).is_err());
    }
}
