//! Software codec adapters.
//!
//! These adapters do no compression: they validate raw input and hand it back
//! as access units, following the same submit/poll protocol as a hardware
//! codec. The video adapter emits YUV 4:2:0 semi-planar frames, the audio
//! adapter emits 16-bit little-endian PCM.

use std::collections::VecDeque;
use std::time::Duration;

use crate::{
    AccessUnit, AudioCodec, AudioEncoderConfig, AudioFormat, CodecAdapter, CodecError,
    CodecOutput, FormatDescriptor, SubmitStatus, TrackKind, VideoCodec, VideoEncoderConfig,
    VideoFormat,
};

/// Default number of inputs a software adapter holds before reporting `Busy`.
pub const DEFAULT_INPUT_CAPACITY: usize = 8;

/// Output side shared by the software adapters.
#[derive(Debug)]
struct OutputQueue {
    format: FormatDescriptor,
    format_announced: bool,
    pending: VecDeque<AccessUnit>,
    capacity: usize,
    next_token: u64,
    end_of_input: bool,
    end_of_stream_sent: bool,
    closed: bool,
}

impl OutputQueue {
    fn new(format: FormatDescriptor, capacity: usize) -> Self {
        Self {
            format,
            format_announced: false,
            pending: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            next_token: 0,
            end_of_input: false,
            end_of_stream_sent: false,
            closed: false,
        }
    }

    fn check_open(&self) -> Result<(), CodecError> {
        if self.closed {
            return Err(CodecError::invalid_state("codec is closed"));
        }
        Ok(())
    }

    fn check_accepting(&self) -> Result<(), CodecError> {
        self.check_open()?;
        if self.end_of_input {
            return Err(CodecError::invalid_state("input submitted after end of input"));
        }
        Ok(())
    }

    fn push(&mut self, unit: AccessUnit) -> SubmitStatus {
        if self.pending.len() >= self.capacity {
            return SubmitStatus::Busy;
        }
        self.pending.push_back(unit);
        let token = self.next_token;
        self.next_token += 1;
        SubmitStatus::Accepted(token)
    }

    fn poll(&mut self) -> Result<CodecOutput, CodecError> {
        self.check_open()?;
        if !self.pending.is_empty() && !self.format_announced {
            self.format_announced = true;
            return Ok(CodecOutput::FormatReady(self.format.clone()));
        }
        if let Some(unit) = self.pending.pop_front() {
            return Ok(CodecOutput::Data(unit));
        }
        if self.end_of_input {
            if self.end_of_stream_sent {
                return Err(CodecError::EndOfStream);
            }
            self.end_of_stream_sent = true;
            return Ok(CodecOutput::EndOfStream);
        }
        Ok(CodecOutput::Empty)
    }

    fn signal_end_of_input(&mut self) -> Result<(), CodecError> {
        self.check_open()?;
        self.end_of_input = true;
        Ok(())
    }

    fn close(&mut self) -> usize {
        self.closed = true;
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

// ============================================================================
// Video
// ============================================================================

/// Pass-through video adapter for raw YUV 4:2:0 semi-planar frames.
///
/// Every frame is a sync sample when `frame_index % gop_length == 0`.
#[derive(Debug)]
pub struct RawVideoEncoder {
    config: VideoEncoderConfig,
    queue: OutputQueue,
    frame_index: u64,
}

impl RawVideoEncoder {
    /// Create a raw video adapter for the given configuration.
    pub fn new(config: VideoEncoderConfig) -> Result<Self, CodecError> {
        Self::with_capacity(config, DEFAULT_INPUT_CAPACITY)
    }

    /// Create a raw video adapter that reports `Busy` after `capacity`
    /// undelivered inputs.
    pub fn with_capacity(config: VideoEncoderConfig, capacity: usize) -> Result<Self, CodecError> {
        if config.width == 0 || config.height == 0 {
            return Err(CodecError::InvalidDimensions {
                width: config.width,
                height: config.height,
            });
        }
        if config.frame_rate == 0 {
            return Err(CodecError::ConfigurationFailed(
                "frame rate must be non-zero".to_string(),
            ));
        }

        let format = FormatDescriptor::Video(VideoFormat {
            codec: VideoCodec::Raw(config.color_format),
            width: config.width,
            height: config.height,
        });
        tracing::debug!(
            "Raw video encoder: {}x{} @ {} fps, GOP {}",
            config.width,
            config.height,
            config.frame_rate,
            config.gop_length()
        );

        Ok(Self {
            queue: OutputQueue::new(format, capacity),
            config,
            frame_index: 0,
        })
    }

    /// The configuration this adapter was created with.
    pub fn config(&self) -> &VideoEncoderConfig {
        &self.config
    }
}

impl CodecAdapter for RawVideoEncoder {
    fn track_kind(&self) -> TrackKind {
        TrackKind::Video
    }

    fn submit(&mut self, input: &[u8], pts_us: u64) -> Result<SubmitStatus, CodecError> {
        self.queue.check_accepting()?;
        let expected = self.config.input_frame_size();
        if input.len() != expected {
            return Err(CodecError::InputSizeMismatch {
                expected,
                actual: input.len(),
            });
        }

        let is_keyframe = self.frame_index % self.config.gop_length() == 0;
        let unit = AccessUnit::new(TrackKind::Video, input.to_vec(), pts_us, is_keyframe);
        let status = self.queue.push(unit);
        if let SubmitStatus::Accepted(_) = status {
            self.frame_index += 1;
        }
        Ok(status)
    }

    fn poll_output(&mut self, _timeout: Duration) -> Result<CodecOutput, CodecError> {
        self.queue.poll()
    }

    fn signal_end_of_input(&mut self) -> Result<(), CodecError> {
        self.queue.signal_end_of_input()
    }

    fn close(&mut self) -> Result<(), CodecError> {
        let dropped = self.queue.close();
        if dropped > 0 {
            tracing::debug!("Raw video encoder closed with {} undelivered frames", dropped);
        }
        Ok(())
    }
}

// ============================================================================
// Audio
// ============================================================================

/// Pass-through audio adapter for interleaved signed 16-bit little-endian PCM.
///
/// Buffers are stamped with the video frame times, so a 2048-frame buffer
/// still ends up with a 2205-tick (50 ms at 44.1 kHz) sample duration.
#[derive(Debug)]
pub struct PcmAudioEncoder {
    config: AudioEncoderConfig,
    queue: OutputQueue,
}

impl PcmAudioEncoder {
    /// Create a PCM audio adapter for the given configuration.
    pub fn new(config: AudioEncoderConfig) -> Result<Self, CodecError> {
        Self::with_capacity(config, DEFAULT_INPUT_CAPACITY)
    }

    /// Create a PCM audio adapter that reports `Busy` after `capacity`
    /// undelivered inputs.
    pub fn with_capacity(config: AudioEncoderConfig, capacity: usize) -> Result<Self, CodecError> {
        if config.sample_rate == 0 {
            return Err(CodecError::ConfigurationFailed(
                "sample rate must be non-zero".to_string(),
            ));
        }
        if config.channels == 0 {
            return Err(CodecError::ConfigurationFailed(
                "channel count must be non-zero".to_string(),
            ));
        }

        let format = FormatDescriptor::Audio(AudioFormat {
            codec: AudioCodec::PcmS16Le,
            sample_rate: config.sample_rate,
            channels: config.channels,
        });
        tracing::debug!(
            "PCM audio encoder: {} Hz, {} channel(s)",
            config.sample_rate,
            config.channels
        );

        Ok(Self {
            queue: OutputQueue::new(format, capacity),
            config,
        })
    }

    /// The configuration this adapter was created with.
    pub fn config(&self) -> &AudioEncoderConfig {
        &self.config
    }
}

impl CodecAdapter for PcmAudioEncoder {
    fn track_kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn submit(&mut self, input: &[u8], pts_us: u64) -> Result<SubmitStatus, CodecError> {
        self.queue.check_accepting()?;
        let frame_bytes = self.config.bytes_per_frame();
        if input.len() % frame_bytes != 0 {
            return Err(CodecError::invalid_param(format!(
                "PCM buffer of {} bytes is not a multiple of {} bytes per sample frame",
                input.len(),
                frame_bytes
            )));
        }

        let unit = AccessUnit::new(TrackKind::Audio, input.to_vec(), pts_us, true);
        Ok(self.queue.push(unit))
    }

    fn poll_output(&mut self, _timeout: Duration) -> Result<CodecOutput, CodecError> {
        self.queue.poll()
    }

    fn signal_end_of_input(&mut self) -> Result<(), CodecError> {
        self.queue.signal_end_of_input()
    }

    fn close(&mut self) -> Result<(), CodecError> {
        let dropped = self.queue.close();
        if dropped > 0 {
            tracing::debug!("PCM audio encoder closed with {} undelivered buffers", dropped);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: Duration = Duration::from_millis(10);

    fn video() -> RawVideoEncoder {
        RawVideoEncoder::new(VideoEncoderConfig::new(16, 16)).unwrap()
    }

    #[test]
    fn test_video_format_precedes_data() {
        let mut codec = video();
        assert!(matches!(codec.poll_output(POLL).unwrap(), CodecOutput::Empty));

        let frame = vec![0u8; 16 * 16 * 3 / 2];
        assert_eq!(codec.submit(&frame, 0).unwrap(), SubmitStatus::Accepted(0));

        match codec.poll_output(POLL).unwrap() {
            CodecOutput::FormatReady(FormatDescriptor::Video(format)) => {
                assert_eq!(format.width, 16);
                assert_eq!(format.height, 16);
                assert_eq!(
                    format.codec,
                    VideoCodec::Raw(crate::ColorFormat::Yuv420SemiPlanar)
                );
            }
            other => panic!("expected video format, got {:?}", other),
        }
        match codec.poll_output(POLL).unwrap() {
            CodecOutput::Data(unit) => {
                assert_eq!(unit.track, TrackKind::Video);
                assert_eq!(unit.pts_us, 0);
                assert!(unit.is_keyframe);
                assert_eq!(unit.data.len(), frame.len());
            }
            other => panic!("expected data, got {:?}", other),
        }
        assert!(matches!(codec.poll_output(POLL).unwrap(), CodecOutput::Empty));
    }

    #[test]
    fn test_video_keyframe_interval() {
        let config = VideoEncoderConfig::new(2, 2).frame_rate(2).i_frame_interval(1);
        let mut codec = RawVideoEncoder::with_capacity(config, 16).unwrap();
        let frame = vec![0u8; 6];
        for i in 0..5 {
            codec.submit(&frame, i * 50_000).unwrap();
        }

        let mut keys = Vec::new();
        loop {
            match codec.poll_output(POLL).unwrap() {
                CodecOutput::FormatReady(_) => {}
                CodecOutput::Data(unit) => keys.push(unit.is_keyframe),
                _ => break,
            }
        }
        assert_eq!(keys, vec![true, false, true, false, true]);
    }

    #[test]
    fn test_video_rejects_wrong_size() {
        let mut codec = video();
        let err = codec.submit(&[0u8; 10], 0).unwrap_err();
        assert!(matches!(
            err,
            CodecError::InputSizeMismatch {
                expected: 384,
                actual: 10
            }
        ));
    }

    #[test]
    fn test_busy_when_full() {
        let mut codec = RawVideoEncoder::with_capacity(VideoEncoderConfig::new(2, 2), 2).unwrap();
        let frame = vec![0u8; 6];
        assert!(matches!(codec.submit(&frame, 0).unwrap(), SubmitStatus::Accepted(_)));
        assert!(matches!(codec.submit(&frame, 1).unwrap(), SubmitStatus::Accepted(_)));
        assert_eq!(codec.submit(&frame, 2).unwrap(), SubmitStatus::Busy);

        // Draining frees a slot
        codec.poll_output(POLL).unwrap();
        codec.poll_output(POLL).unwrap();
        assert!(matches!(codec.submit(&frame, 2).unwrap(), SubmitStatus::Accepted(_)));
    }

    #[test]
    fn test_end_of_stream_after_pending_output() {
        let mut codec = video();
        codec.submit(&vec![0u8; 384], 0).unwrap();
        codec.signal_end_of_input().unwrap();
        assert!(codec.submit(&vec![0u8; 384], 1).is_err());

        assert!(matches!(codec.poll_output(POLL).unwrap(), CodecOutput::FormatReady(_)));
        assert!(matches!(codec.poll_output(POLL).unwrap(), CodecOutput::Data(_)));
        assert!(matches!(codec.poll_output(POLL).unwrap(), CodecOutput::EndOfStream));
        assert!(matches!(codec.poll_output(POLL), Err(CodecError::EndOfStream)));
    }

    #[test]
    fn test_closed_codec_rejects_calls() {
        let mut codec = video();
        codec.submit(&vec![0u8; 384], 0).unwrap();
        codec.close().unwrap();
        assert!(codec.submit(&vec![0u8; 384], 1).is_err());
        assert!(codec.poll_output(POLL).is_err());
    }

    #[test]
    fn test_video_rejects_zero_dimensions() {
        assert!(RawVideoEncoder::new(VideoEncoderConfig::new(0, 16)).is_err());
    }

    #[test]
    fn test_audio_passthrough() {
        let mut codec = PcmAudioEncoder::new(AudioEncoderConfig::default()).unwrap();
        assert_eq!(codec.track_kind(), TrackKind::Audio);
        codec.submit(&[0u8; 4096], 50_000).unwrap();

        match codec.poll_output(POLL).unwrap() {
            CodecOutput::FormatReady(FormatDescriptor::Audio(format)) => {
                assert_eq!(format.sample_rate, 44_100);
                assert_eq!(format.channels, 1);
                assert_eq!(format.codec, AudioCodec::PcmS16Le);
            }
            other => panic!("expected audio format, got {:?}", other),
        }
        match codec.poll_output(POLL).unwrap() {
            CodecOutput::Data(unit) => {
                assert_eq!(unit.pts_us, 50_000);
                assert_eq!(unit.data.len(), 4096);
                assert!(unit.is_keyframe);
            }
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[test]
    fn test_audio_rejects_partial_sample() {
        let config = AudioEncoderConfig::default().channels(2);
        let mut codec = PcmAudioEncoder::new(config).unwrap();
        assert!(codec.submit(&[0u8; 6], 0).is_err());
        assert!(codec.submit(&[0u8; 8], 0).is_ok());
    }
}
