//! Codec adapter interface.

use std::time::Duration;

use bytes::Bytes;

use crate::{CodecError, FormatDescriptor, TrackKind};

/// One compressed output chunk from a codec.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    /// Encoded bitstream data. May be empty when the codec had no buffer ready.
    pub data: Bytes,
    /// Presentation timestamp in microseconds.
    pub pts_us: u64,
    /// Whether this unit can be decoded on its own.
    pub is_keyframe: bool,
    /// Track this unit belongs to.
    pub track: TrackKind,
}

impl AccessUnit {
    /// Create a new access unit.
    #[must_use]
    pub fn new(track: TrackKind, data: impl Into<Bytes>, pts_us: u64, is_keyframe: bool) -> Self {
        Self {
            data: data.into(),
            pts_us,
            is_keyframe,
            track,
        }
    }
}

/// Result of offering raw input to a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    /// Input was queued; the token identifies the input slot.
    Accepted(u64),
    /// No input capacity right now. The input was not consumed.
    Busy,
}

/// Result of polling a codec for output.
#[derive(Debug, Clone)]
pub enum CodecOutput {
    /// The output format is known. Emitted once, before the first access unit.
    FormatReady(FormatDescriptor),
    /// A compressed access unit is ready.
    Data(AccessUnit),
    /// Nothing available within the poll timeout.
    Empty,
    /// All output has been delivered after end of input.
    EndOfStream,
}

/// A stateful compressor fed with raw samples and polled for output.
///
/// Input and output are decoupled: a submission may produce output on a later
/// poll, and the first output is always [`CodecOutput::FormatReady`].
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use bitmp4_codec::{CodecAdapter, CodecOutput, RawVideoEncoder, VideoEncoderConfig};
///
/// let mut codec = RawVideoEncoder::new(VideoEncoderConfig::new(16, 16))?;
/// codec.submit(&nv21, 0)?;
/// loop {
///     match codec.poll_output(Duration::from_millis(10))? {
///         CodecOutput::FormatReady(format) => { /* register track */ }
///         CodecOutput::Data(unit) => { /* write sample */ }
///         CodecOutput::Empty | CodecOutput::EndOfStream => break,
///     }
/// }
/// ```
pub trait CodecAdapter: Send {
    /// The track this codec produces.
    fn track_kind(&self) -> TrackKind;

    /// Offer one raw input buffer stamped with `pts_us`.
    fn submit(&mut self, input: &[u8], pts_us: u64) -> Result<SubmitStatus, CodecError>;

    /// Wait at most `timeout` for the next output event.
    fn poll_output(&mut self, timeout: Duration) -> Result<CodecOutput, CodecError>;

    /// Mark the end of input. Remaining output is still delivered, followed by
    /// [`CodecOutput::EndOfStream`].
    fn signal_end_of_input(&mut self) -> Result<(), CodecError>;

    /// Stop the codec and release its resources.
    fn close(&mut self) -> Result<(), CodecError>;
}
