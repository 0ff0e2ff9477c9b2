//! Frame conversion and codec adapters for bitmp4.
//!
//! This crate holds everything that sits between a raw input image and a
//! compressed access unit:
//!
//! - [`Frame`] and the RGB to YUV 4:2:0 semi-planar converter
//!   ([`argb_to_yuv420sp`])
//! - the [`CodecAdapter`] trait that video and audio compressors implement
//! - software pass-through adapters ([`RawVideoEncoder`], [`PcmAudioEncoder`])
//!   that run without platform codecs
//!
//! # Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use bitmp4_codec::{CodecAdapter, CodecOutput, Frame, RawVideoEncoder, VideoEncoderConfig};
//!
//! let frame = Frame::solid(16, 16, 0xFFFF_0000);
//! let yuv = frame.to_yuv420sp()?;
//!
//! let mut codec = RawVideoEncoder::new(VideoEncoderConfig::new(16, 16))?;
//! codec.submit(&yuv, 0)?;
//! while let CodecOutput::FormatReady(_) | CodecOutput::Data(_) =
//!     codec.poll_output(Duration::from_millis(10))?
//! {}
//! ```
//!
//! # Feature Flags
//!
//! - `image` - Enable conversion from `image::RgbaImage` into [`Frame`]

mod error;
mod frame;
mod software;
mod traits;
mod types;

pub use error::CodecError;
pub use frame::{argb_to_yuv420sp, expected_yuv420sp_size, pack_argb, Frame};
pub use software::{PcmAudioEncoder, RawVideoEncoder, DEFAULT_INPUT_CAPACITY};
pub use traits::{AccessUnit, CodecAdapter, CodecOutput, SubmitStatus};
pub use types::{
    AudioCodec, AudioEncoderConfig, AudioFormat, ColorFormat, FormatDescriptor, TrackKind,
    VideoCodec, VideoEncoderConfig, VideoFormat, DEFAULT_AUDIO_BITRATE,
    DEFAULT_AUDIO_SAMPLE_RATE, DEFAULT_FRAME_RATE, DEFAULT_I_FRAME_INTERVAL_SECS,
    DEFAULT_VIDEO_BITRATE,
};
