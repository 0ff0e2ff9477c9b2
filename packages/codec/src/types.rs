//! Core types shared by codec adapters and the container writer.

/// Default video frame rate used for timestamps and encoder configuration.
pub const DEFAULT_FRAME_RATE: u32 = 20;

/// Default video bitrate in bits per second.
pub const DEFAULT_VIDEO_BITRATE: u32 = 2_000_000;

/// Default keyframe interval in seconds.
pub const DEFAULT_I_FRAME_INTERVAL_SECS: u32 = 5;

/// Default audio sample rate in Hz.
pub const DEFAULT_AUDIO_SAMPLE_RATE: u32 = 44_100;

/// Default audio bitrate in bits per second.
pub const DEFAULT_AUDIO_BITRATE: u32 = 65_536;

/// Which of the two container tracks a codec feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    /// Stable slot index (video = 0, audio = 1) for per-track tables.
    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            Self::Video => 0,
            Self::Audio => 1,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw pixel layout accepted by a video codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorFormat {
    /// Luma plane followed by interleaved V/U chroma at quarter resolution.
    Yuv420SemiPlanar,
}

impl ColorFormat {
    /// Bytes needed for one raw frame of the given size.
    #[must_use]
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        match self {
            Self::Yuv420SemiPlanar => (width as usize * height as usize * 3) / 2,
        }
    }
}

impl Default for ColorFormat {
    fn default() -> Self {
        Self::Yuv420SemiPlanar
    }
}

/// Compressed (or raw) video bitstream carried by a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoCodec {
    /// H.264/AVC. Access units are Annex B; SPS/PPS come without start codes.
    H264 { sps: Vec<u8>, pps: Vec<u8> },
    /// Uncompressed frames in the given raw layout.
    Raw(ColorFormat),
}

/// Audio bitstream carried by a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioCodec {
    /// AAC with its AudioSpecificConfig.
    Aac { audio_specific_config: Vec<u8> },
    /// Signed 16-bit little-endian PCM.
    PcmS16Le,
}

/// Output format of a video codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
}

/// Output format of an audio codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Format announced by a codec once its output is known.
///
/// Registering a descriptor with the container creates the matching track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatDescriptor {
    Video(VideoFormat),
    Audio(AudioFormat),
}

impl FormatDescriptor {
    /// The track this format describes.
    #[must_use]
    pub fn kind(&self) -> TrackKind {
        match self {
            Self::Video(_) => TrackKind::Video,
            Self::Audio(_) => TrackKind::Audio,
        }
    }
}

/// Configuration for creating a video codec adapter.
#[derive(Debug, Clone)]
pub struct VideoEncoderConfig {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Target bitrate in bits per second.
    pub bitrate: u32,
    /// Nominal frame rate.
    pub frame_rate: u32,
    /// Keyframe interval in seconds.
    pub i_frame_interval_secs: u32,
    /// Raw input layout.
    pub color_format: ColorFormat,
}

impl Default for VideoEncoderConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            bitrate: DEFAULT_VIDEO_BITRATE,
            frame_rate: DEFAULT_FRAME_RATE,
            i_frame_interval_secs: DEFAULT_I_FRAME_INTERVAL_SECS,
            color_format: ColorFormat::Yuv420SemiPlanar,
        }
    }
}

impl VideoEncoderConfig {
    /// Create a new video configuration with the given dimensions.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    /// Set the target bitrate in bits per second.
    #[must_use]
    pub fn bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Set the nominal frame rate.
    #[must_use]
    pub fn frame_rate(mut self, fps: u32) -> Self {
        self.frame_rate = fps;
        self
    }

    /// Set the keyframe interval in seconds.
    #[must_use]
    pub fn i_frame_interval(mut self, secs: u32) -> Self {
        self.i_frame_interval_secs = secs;
        self
    }

    /// Number of frames between keyframes (at least 1).
    #[must_use]
    pub fn gop_length(&self) -> u64 {
        (u64::from(self.frame_rate) * u64::from(self.i_frame_interval_secs)).max(1)
    }

    /// Bytes expected for one raw input frame.
    #[must_use]
    pub fn input_frame_size(&self) -> usize {
        self.color_format.frame_size(self.width, self.height)
    }
}

/// Configuration for creating an audio codec adapter.
#[derive(Debug, Clone)]
pub struct AudioEncoderConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u16,
    /// Target bitrate in bits per second.
    pub bitrate: u32,
}

impl Default for AudioEncoderConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_AUDIO_SAMPLE_RATE,
            channels: 1,
            bitrate: DEFAULT_AUDIO_BITRATE,
        }
    }
}

impl AudioEncoderConfig {
    /// Set the sample rate in Hz.
    #[must_use]
    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Set the channel count.
    #[must_use]
    pub fn channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    /// Bytes per interleaved 16-bit sample frame.
    #[must_use]
    pub fn bytes_per_frame(&self) -> usize {
        2 * usize::from(self.channels.max(1))
    }
}
