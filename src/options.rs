//! Session configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bitmp4_codec::{AudioEncoderConfig, VideoEncoderConfig};

/// Default delay between frames produced by the caller.
pub const DEFAULT_FRAME_DELAY: Duration = Duration::from_millis(50);

/// Compression tier. Higher compression means a lower video bitrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionLevel {
    #[default]
    Low = 0,
    Mid = 1,
    High = 2,
}

impl CompressionLevel {
    /// Target video bitrate in bits per second.
    #[must_use]
    pub fn video_bitrate(&self) -> u32 {
        match self {
            Self::Low => 4_000_000,
            Self::Mid => 2_000_000,
            Self::High => 1_000_000,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Mid => "mid",
            Self::High => "high",
        }
    }
}

impl TryFrom<u8> for CompressionLevel {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Low),
            1 => Ok(Self::Mid),
            2 => Ok(Self::High),
            other => anyhow::bail!("invalid compression level {} (expected 0, 1 or 2)", other),
        }
    }
}

impl std::str::FromStr for CompressionLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" | "0" => Ok(Self::Low),
            "mid" | "1" => Ok(Self::Mid),
            "high" | "2" => Ok(Self::High),
            other => anyhow::bail!("invalid compression level '{}' (expected low, mid or high)", other),
        }
    }
}

impl std::fmt::Display for CompressionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for one encoding session.
///
/// The encoder snapshots these when a session starts; later changes apply to
/// the next session.
///
/// # Example
///
/// ```ignore
/// use bitmp4::{CompressionLevel, EncodingOptions};
///
/// let options = EncodingOptions::new("export.mp4")
///     .output_size(480, 480)
///     .frame_delay(std::time::Duration::from_millis(30))
///     .compression(CompressionLevel::Mid);
/// ```
#[derive(Debug, Clone)]
pub struct EncodingOptions {
    /// Destination file.
    pub output_path: PathBuf,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Expected delay between frames. Informational only: timestamps come from
    /// the frame index at a fixed 20 fps.
    pub frame_delay: Duration,
    /// Compression tier.
    pub compression: CompressionLevel,
}

impl EncodingOptions {
    pub fn new(output_path: impl AsRef<Path>) -> Self {
        Self {
            output_path: output_path.as_ref().to_path_buf(),
            width: 640,
            height: 480,
            frame_delay: DEFAULT_FRAME_DELAY,
            compression: CompressionLevel::default(),
        }
    }

    #[must_use]
    pub fn output_path(mut self, path: impl AsRef<Path>) -> Self {
        self.output_path = path.as_ref().to_path_buf();
        self
    }

    /// Set the frame size. Frames of any other size are skipped.
    #[must_use]
    pub fn output_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    #[must_use]
    pub fn frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    #[must_use]
    pub fn compression(mut self, level: CompressionLevel) -> Self {
        self.compression = level;
        self
    }

    /// Check the options before a session starts.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.output_path.as_os_str().is_empty(),
            "output path is not set"
        );
        anyhow::ensure!(
            self.width > 0 && self.height > 0,
            "output size must be non-zero, got {}x{}",
            self.width,
            self.height
        );
        Ok(())
    }

    /// Video codec configuration derived from these options.
    pub fn video_config(&self) -> VideoEncoderConfig {
        VideoEncoderConfig::new(self.width, self.height).bitrate(self.compression.video_bitrate())
    }

    /// Audio codec configuration (44.1 kHz mono).
    pub fn audio_config(&self) -> AudioEncoderConfig {
        AudioEncoderConfig::default()
    }
}
