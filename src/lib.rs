//! bitmp4 - record bitmap frames into an MP4 file on a background thread.
//!
//! Frames are queued from any thread, converted to YUV 4:2:0 semi-planar,
//! stamped at a fixed 20 fps, paired with a silent audio track and written to
//! a fragmented MP4 file.
//!
//! # Modules
//!
//! - [`encoder`]: session controller ([`Encoder`])
//! - [`queue`]: pending-frame queue and session state
//! - [`worker`]: per-session encode loop
//! - [`mux`]: track registration and sample routing
//! - [`mp4`]: fragmented MP4 writer and reader
//! - [`backend`]: codec and container factories
//! - [`options`]: session configuration
//!
//! # Example
//!
//! ```ignore
//! use bitmp4::{Encoder, EncodingOptions, Frame};
//!
//! let mut encoder = Encoder::new(EncodingOptions::new("out.mp4").output_size(64, 64));
//! let completion = encoder.start()?;
//! encoder.add_frame(Frame::solid(64, 64, 0xFFFF0000));
//! encoder.finish();
//! let outcome = completion.blocking_wait()?;
//! ```

pub mod backend;
pub mod encoder;
pub mod mp4;
pub mod mux;
pub mod options;
pub mod queue;
pub mod worker;

pub use backend::{MediaBackend, SoftwareBackend};
pub use encoder::{Completion, Encoder, FinishListener};
pub use mp4::Mp4Writer;
pub use mux::{ContainerWriter, MuxStats, MuxSynchronizer};
pub use options::{CompressionLevel, EncodingOptions, DEFAULT_FRAME_DELAY};
pub use queue::{FrameQueue, SessionState};
pub use worker::{presentation_time_us, EncodeOutcome, EncodeSummary};

// Re-export codec types
pub use bitmp4_codec::{
    argb_to_yuv420sp, pack_argb, AccessUnit, AudioEncoderConfig, CodecAdapter, CodecError,
    CodecOutput, FormatDescriptor, Frame, SubmitStatus, TrackKind, VideoEncoderConfig,
};
