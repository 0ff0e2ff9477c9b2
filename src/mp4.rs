//! Fragmented MP4 writer and reader.
//!
//! The writer produces a single file with one video and one audio track:
//!
//! ```text
//! ftyp
//! moov (mvhd, one trak per track, mvex with one trex per track)
//! moof + mdat (repeated; one traf per track with pending samples)
//! ```
//!
//! Samples are buffered per track and flushed as a fragment when a video
//! keyframe arrives after the target fragment duration, and once more on
//! [`ContainerWriter::stop`]. Sample durations are derived from the distance
//! between consecutive timestamps, so each track's decode times reproduce the
//! presentation timestamps the codecs reported.
//!
//! The reader half ([`read_track_table`], [`read_samples`]) walks a finished
//! file and is used by the demo binary and the tests.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bitmp4_codec::{
    AccessUnit, AudioCodec, FormatDescriptor, TrackKind, VideoCodec, DEFAULT_AUDIO_BITRATE,
    DEFAULT_FRAME_RATE,
};

use crate::mux::ContainerWriter;

/// Timescale of the video track (ticks per second).
pub const VIDEO_TIMESCALE: u32 = 90_000;

/// Default target fragment duration in milliseconds.
pub const DEFAULT_FRAGMENT_DURATION_MS: u32 = 1000;

/// Samples per AAC frame, used for the last AAC sample's duration.
const AAC_FRAME_DURATION: u32 = 1024;

/// depends_on = 2 (does not depend on others)
const SYNC_SAMPLE_FLAGS: u32 = 0x0200_0000;
/// depends_on = 1, is_non_sync_sample
const NON_SYNC_SAMPLE_FLAGS: u32 = 0x0101_0000;

/// tfhd: default-base-is-moof
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x02_0000;
/// trun: data-offset, sample-duration, sample-size, sample-flags
const TRUN_FLAGS: u32 = 0x00_0701;

const MFHD_SIZE: usize = 16;

const IDENTITY_MATRIX: [u32; 9] = [0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000];

// ============================================================================
// H.264 Annex B parsing
// ============================================================================

/// H.264 NAL unit type constants.
pub mod nal_unit_type {
    /// Non-IDR slice (P/B frame)
    pub const NON_IDR_SLICE: u8 = 1;
    /// IDR slice (keyframe)
    pub const IDR_SLICE: u8 = 5;
    /// Supplemental enhancement information
    pub const SEI: u8 = 6;
    /// Sequence parameter set
    pub const SPS: u8 = 7;
    /// Picture parameter set
    pub const PPS: u8 = 8;
}

/// A single H.264 NAL unit, without start code.
#[derive(Debug, Clone)]
pub struct NalUnit {
    pub data: Vec<u8>,
    pub nal_type: u8,
}

impl NalUnit {
    pub fn is_idr(&self) -> bool {
        self.nal_type == nal_unit_type::IDR_SLICE
    }

    /// Returns true for IDR and non-IDR slices.
    pub fn is_slice(&self) -> bool {
        self.nal_type == nal_unit_type::IDR_SLICE || self.nal_type == nal_unit_type::NON_IDR_SLICE
    }
}

/// An Annex B access unit split into NAL units.
#[derive(Debug, Default)]
pub struct ParsedFrame {
    /// Every NAL unit except SPS and PPS, in stream order.
    pub nals: Vec<NalUnit>,
    pub sps: Option<Vec<u8>>,
    pub pps: Option<Vec<u8>>,
    /// Whether an IDR slice is present.
    pub is_keyframe: bool,
}

/// Split Annex B H.264 data on 3-byte and 4-byte start codes.
pub fn parse_annex_b(data: &[u8]) -> ParsedFrame {
    // (start code position, payload position)
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                starts.push((i, i + 3));
                i += 3;
                continue;
            }
            if i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                starts.push((i, i + 4));
                i += 4;
                continue;
            }
        }
        i += 1;
    }

    let mut frame = ParsedFrame::default();
    for (idx, &(_, payload)) in starts.iter().enumerate() {
        let end = starts.get(idx + 1).map_or(data.len(), |&(next, _)| next);
        if payload >= end {
            continue;
        }

        let nal = &data[payload..end];
        let nal_type = nal[0] & 0x1F;
        match nal_type {
            nal_unit_type::SPS => frame.sps = Some(nal.to_vec()),
            nal_unit_type::PPS => frame.pps = Some(nal.to_vec()),
            _ => {
                if nal_type == nal_unit_type::IDR_SLICE {
                    frame.is_keyframe = true;
                }
                frame.nals.push(NalUnit {
                    data: nal.to_vec(),
                    nal_type,
                });
            }
        }
    }
    frame
}

/// Convert an Annex B access unit to 4-byte length-prefixed slices.
///
/// Returns the AVCC payload and whether it holds an IDR slice.
pub fn annex_b_to_avcc(data: &[u8]) -> (Vec<u8>, bool) {
    let parsed = parse_annex_b(data);
    let mut buf = Vec::with_capacity(data.len());
    for nal in parsed.nals.iter().filter(|n| n.is_slice()) {
        buf.extend_from_slice(&(nal.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&nal.data);
    }
    (buf, parsed.is_keyframe)
}

// ============================================================================
// Box writing helpers
// ============================================================================

fn write_box(buf: &mut Vec<u8>, box_type: &[u8; 4], content: &[u8]) {
    buf.extend_from_slice(&((8 + content.len()) as u32).to_be_bytes());
    buf.extend_from_slice(box_type);
    buf.extend_from_slice(content);
}

/// Start the content of a full box (version + 24-bit flags).
fn full_box(version: u8, flags: u32) -> Vec<u8> {
    let mut c = Vec::new();
    c.push(version);
    c.extend_from_slice(&flags.to_be_bytes()[1..]);
    c
}

fn timescale_for(format: &FormatDescriptor) -> u32 {
    match format {
        FormatDescriptor::Video(_) => VIDEO_TIMESCALE,
        FormatDescriptor::Audio(audio) => audio.sample_rate,
    }
}

/// Convert microseconds to track ticks.
fn to_ticks(pts_us: u64, timescale: u32) -> u64 {
    (u128::from(pts_us) * u128::from(timescale) / 1_000_000) as u64
}

// ============================================================================
// Writer
// ============================================================================

/// A sample whose duration is not known until the next one arrives.
#[derive(Debug)]
struct HeldSample {
    data: Vec<u8>,
    decode_time: u64,
    is_sync: bool,
}

#[derive(Debug)]
struct PendingSample {
    data: Vec<u8>,
    duration: u32,
    is_sync: bool,
}

#[derive(Debug)]
struct Track {
    id: u32,
    format: FormatDescriptor,
    timescale: u32,
    held: Option<HeldSample>,
    pending: Vec<PendingSample>,
    /// Decode time of the first pending sample.
    fragment_base: u64,
    last_duration: u32,
    samples: u64,
}

impl Track {
    fn kind(&self) -> TrackKind {
        self.format.kind()
    }

    /// Move the held sample into the pending list with a known duration.
    fn settle_held(&mut self, duration: u32) {
        if let Some(held) = self.held.take() {
            if self.pending.is_empty() {
                self.fragment_base = held.decode_time;
            }
            self.last_duration = duration;
            self.pending.push(PendingSample {
                data: held.data,
                duration,
                is_sync: held.is_sync,
            });
        }
    }

    /// Duration for the final sample, which has no successor.
    fn closing_duration(&self, held: &HeldSample) -> u32 {
        match &self.format {
            FormatDescriptor::Audio(audio) if audio.codec == AudioCodec::PcmS16Le => {
                let frame_bytes = 2 * u32::from(audio.channels.max(1));
                (held.data.len() as u32 / frame_bytes).max(1)
            }
            _ if self.last_duration > 0 => self.last_duration,
            FormatDescriptor::Audio(_) => AAC_FRAME_DURATION,
            FormatDescriptor::Video(_) => self.timescale / DEFAULT_FRAME_RATE,
        }
    }

    /// Time span of the pending samples in milliseconds, measured up to `now`.
    fn pending_ms(&self, now: u64) -> u64 {
        if self.pending.is_empty() {
            return 0;
        }
        now.saturating_sub(self.fragment_base) * 1000 / u64::from(self.timescale)
    }
}

/// One traf worth of samples.
struct TrackFragment<'a> {
    track_id: u32,
    base_decode_time: u64,
    samples: &'a [PendingSample],
}

/// Fragmented MP4 file writer.
///
/// [`Mp4Writer::create`] opens the output file up front so an unwritable path
/// fails early. Nothing is written until [`ContainerWriter::start`], and a file
/// created for a writer that never starts is removed again on release.
pub struct Mp4Writer {
    path: PathBuf,
    fragment_duration_ms: u32,
    /// Handle opened by `create`, held until `start`.
    reserved: Option<File>,
    remove_if_unstarted: bool,
    file: Option<BufWriter<File>>,
    tracks: Vec<Track>,
    sequence_number: u32,
    started: bool,
    stopped: bool,
    bytes_written: u64,
}

impl Mp4Writer {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            fragment_duration_ms: DEFAULT_FRAGMENT_DURATION_MS,
            reserved: None,
            remove_if_unstarted: false,
            file: None,
            tracks: Vec::new(),
            sequence_number: 1,
            started: false,
            stopped: false,
            bytes_written: 0,
        }
    }

    /// Open `path` for writing without truncating it.
    ///
    /// An existing file is only truncated once the writer starts.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let existed = path.exists();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open {} for writing", path.display()))?;

        let mut writer = Self::new(path);
        writer.reserved = Some(file);
        writer.remove_if_unstarted = !existed;
        Ok(writer)
    }

    /// Set the target fragment duration. Fragments still only split on video
    /// keyframes.
    #[must_use]
    pub fn fragment_duration_ms(mut self, ms: u32) -> Self {
        self.fragment_duration_ms = ms;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of samples accepted for the given track kind.
    pub fn sample_count(&self, kind: TrackKind) -> u64 {
        self.tracks
            .iter()
            .filter(|t| t.kind() == kind)
            .map(|t| t.samples)
            .sum()
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("container file is not open"))?;
        file.write_all(data)
            .with_context(|| format!("failed to write to {}", self.path.display()))?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn flush_fragment(&mut self) -> Result<()> {
        let fragments: Vec<TrackFragment<'_>> = self
            .tracks
            .iter()
            .filter(|t| !t.pending.is_empty())
            .map(|t| TrackFragment {
                track_id: t.id,
                base_decode_time: t.fragment_base,
                samples: &t.pending,
            })
            .collect();
        if fragments.is_empty() {
            return Ok(());
        }

        let segment = write_moof_mdat(self.sequence_number, &fragments);
        let sample_count: usize = fragments.iter().map(|f| f.samples.len()).sum();
        tracing::debug!(
            "Writing fragment {} ({} samples, {} bytes)",
            self.sequence_number,
            sample_count,
            segment.len()
        );

        self.write_bytes(&segment)?;
        self.sequence_number += 1;
        for track in &mut self.tracks {
            track.pending.clear();
        }
        Ok(())
    }

    // ========================================
    // Init segment
    // ========================================

    fn init_segment(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_ftyp(&mut buf);
        self.write_moov(&mut buf);
        buf
    }

    fn write_ftyp(&self, buf: &mut Vec<u8>) {
        let mut c = Vec::new();
        c.extend_from_slice(b"isom"); // major brand
        c.extend_from_slice(&0u32.to_be_bytes()); // minor version
        for brand in [b"isom", b"iso6", b"mp41"] {
            c.extend_from_slice(brand);
        }
        let has_avc = self.tracks.iter().any(|t| {
            matches!(
                &t.format,
                FormatDescriptor::Video(v) if matches!(v.codec, VideoCodec::H264 { .. })
            )
        });
        if has_avc {
            c.extend_from_slice(b"avc1");
        }
        write_box(buf, b"ftyp", &c);
    }

    fn write_moov(&self, buf: &mut Vec<u8>) {
        let mut moov = Vec::new();
        self.write_mvhd(&mut moov);
        for track in &self.tracks {
            write_trak(&mut moov, track);
        }

        let mut mvex = Vec::new();
        for track in &self.tracks {
            let mut c = full_box(0, 0);
            c.extend_from_slice(&track.id.to_be_bytes());
            c.extend_from_slice(&1u32.to_be_bytes()); // default_sample_description_index
            c.extend_from_slice(&0u32.to_be_bytes()); // default_sample_duration
            c.extend_from_slice(&0u32.to_be_bytes()); // default_sample_size
            c.extend_from_slice(&0u32.to_be_bytes()); // default_sample_flags
            write_box(&mut mvex, b"trex", &c);
        }
        write_box(&mut moov, b"mvex", &mvex);

        write_box(buf, b"moov", &moov);
    }

    fn write_mvhd(&self, buf: &mut Vec<u8>) {
        let mut c = full_box(0, 0);
        c.extend_from_slice(&0u32.to_be_bytes()); // creation_time
        c.extend_from_slice(&0u32.to_be_bytes()); // modification_time
        let timescale = self.tracks.first().map_or(VIDEO_TIMESCALE, |t| t.timescale);
        c.extend_from_slice(&timescale.to_be_bytes());
        c.extend_from_slice(&0u32.to_be_bytes()); // duration (fragmented)
        c.extend_from_slice(&0x00010000u32.to_be_bytes()); // rate 1.0
        c.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
        c.extend_from_slice(&[0; 10]); // reserved
        for m in IDENTITY_MATRIX {
            c.extend_from_slice(&m.to_be_bytes());
        }
        c.extend_from_slice(&[0; 24]); // pre_defined
        let next_track_id = self.tracks.len() as u32 + 1;
        c.extend_from_slice(&next_track_id.to_be_bytes());
        write_box(buf, b"mvhd", &c);
    }
}

fn write_trak(buf: &mut Vec<u8>, track: &Track) {
    let mut trak = Vec::new();

    // tkhd
    {
        let (width, height, volume) = match &track.format {
            FormatDescriptor::Video(v) => (v.width, v.height, 0u16),
            FormatDescriptor::Audio(_) => (0, 0, 0x0100),
        };
        let mut c = full_box(0, 3); // enabled, in movie
        c.extend_from_slice(&0u32.to_be_bytes()); // creation_time
        c.extend_from_slice(&0u32.to_be_bytes()); // modification_time
        c.extend_from_slice(&track.id.to_be_bytes());
        c.extend_from_slice(&0u32.to_be_bytes()); // reserved
        c.extend_from_slice(&0u32.to_be_bytes()); // duration
        c.extend_from_slice(&[0; 8]); // reserved
        c.extend_from_slice(&0i16.to_be_bytes()); // layer
        c.extend_from_slice(&0i16.to_be_bytes()); // alternate_group
        c.extend_from_slice(&volume.to_be_bytes());
        c.extend_from_slice(&0u16.to_be_bytes()); // reserved
        for m in IDENTITY_MATRIX {
            c.extend_from_slice(&m.to_be_bytes());
        }
        c.extend_from_slice(&(width << 16).to_be_bytes());
        c.extend_from_slice(&(height << 16).to_be_bytes());
        write_box(&mut trak, b"tkhd", &c);
    }

    let mut mdia = Vec::new();

    // mdhd
    {
        let mut c = full_box(0, 0);
        c.extend_from_slice(&0u32.to_be_bytes());
        c.extend_from_slice(&0u32.to_be_bytes());
        c.extend_from_slice(&track.timescale.to_be_bytes());
        c.extend_from_slice(&0u32.to_be_bytes());
        c.extend_from_slice(&0x55c4u16.to_be_bytes()); // language: und
        c.extend_from_slice(&0u16.to_be_bytes());
        write_box(&mut mdia, b"mdhd", &c);
    }

    // hdlr
    {
        let (handler, name): (&[u8; 4], &[u8]) = match track.kind() {
            TrackKind::Video => (b"vide", &b"VideoHandler\0"[..]),
            TrackKind::Audio => (b"soun", &b"SoundHandler\0"[..]),
        };
        let mut c = full_box(0, 0);
        c.extend_from_slice(&0u32.to_be_bytes()); // pre_defined
        c.extend_from_slice(handler);
        c.extend_from_slice(&[0; 12]); // reserved
        c.extend_from_slice(name);
        write_box(&mut mdia, b"hdlr", &c);
    }

    let mut minf = Vec::new();
    match track.kind() {
        TrackKind::Video => {
            let mut c = full_box(0, 1);
            c.extend_from_slice(&0u16.to_be_bytes()); // graphics_mode
            c.extend_from_slice(&[0; 6]); // opcolor
            write_box(&mut minf, b"vmhd", &c);
        }
        TrackKind::Audio => {
            let mut c = full_box(0, 0);
            c.extend_from_slice(&0u16.to_be_bytes()); // balance
            c.extend_from_slice(&0u16.to_be_bytes()); // reserved
            write_box(&mut minf, b"smhd", &c);
        }
    }

    // dinf -> dref -> url (self-contained)
    {
        let mut dref = full_box(0, 0);
        dref.extend_from_slice(&1u32.to_be_bytes());
        write_box(&mut dref, b"url ", &full_box(0, 1));
        let mut dinf = Vec::new();
        write_box(&mut dinf, b"dref", &dref);
        write_box(&mut minf, b"dinf", &dinf);
    }

    // stbl: sample description plus the empty tables fragmented files carry
    {
        let mut stbl = Vec::new();
        let mut stsd = full_box(0, 0);
        stsd.extend_from_slice(&1u32.to_be_bytes()); // entry_count
        write_sample_entry(&mut stsd, &track.format);
        write_box(&mut stbl, b"stsd", &stsd);

        for box_type in [b"stts", b"stsc", b"stsz", b"stco"] {
            let mut c = full_box(0, 0);
            c.extend_from_slice(&0u32.to_be_bytes());
            if box_type == b"stsz" {
                c.extend_from_slice(&0u32.to_be_bytes());
            }
            write_box(&mut stbl, box_type, &c);
        }
        write_box(&mut minf, b"stbl", &stbl);
    }

    write_box(&mut mdia, b"minf", &minf);
    write_box(&mut trak, b"mdia", &mdia);
    write_box(buf, b"trak", &trak);
}

fn write_sample_entry(buf: &mut Vec<u8>, format: &FormatDescriptor) {
    match format {
        FormatDescriptor::Video(video) => match &video.codec {
            VideoCodec::H264 { sps, pps } => {
                let mut avcc = Vec::new();
                write_avcc(&mut avcc, sps, pps);
                write_visual_entry(buf, b"avc1", video.width, video.height, &avcc);
            }
            VideoCodec::Raw(_) => write_visual_entry(buf, b"nv21", video.width, video.height, &[]),
        },
        FormatDescriptor::Audio(audio) => match &audio.codec {
            AudioCodec::Aac {
                audio_specific_config,
            } => {
                let mut esds = full_box(0, 0);
                esds.extend_from_slice(&build_esds_contents(audio_specific_config));
                let mut child = Vec::new();
                write_box(&mut child, b"esds", &esds);
                write_audio_entry(buf, b"mp4a", audio.sample_rate, audio.channels, &child);
            }
            AudioCodec::PcmS16Le => {
                write_audio_entry(buf, b"sowt", audio.sample_rate, audio.channels, &[])
            }
        },
    }
}

fn write_visual_entry(
    buf: &mut Vec<u8>,
    entry_type: &[u8; 4],
    width: u32,
    height: u32,
    children: &[u8],
) {
    let mut c = Vec::new();
    c.extend_from_slice(&[0; 6]); // reserved
    c.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
    c.extend_from_slice(&0u16.to_be_bytes()); // pre_defined
    c.extend_from_slice(&0u16.to_be_bytes()); // reserved
    c.extend_from_slice(&[0; 12]); // pre_defined
    c.extend_from_slice(&(width as u16).to_be_bytes());
    c.extend_from_slice(&(height as u16).to_be_bytes());
    c.extend_from_slice(&0x00480000u32.to_be_bytes()); // horiz resolution 72 dpi
    c.extend_from_slice(&0x00480000u32.to_be_bytes()); // vert resolution 72 dpi
    c.extend_from_slice(&0u32.to_be_bytes()); // reserved
    c.extend_from_slice(&1u16.to_be_bytes()); // frame_count

    let mut compressor = [0u8; 32];
    let name = b"bitmp4";
    compressor[0] = name.len() as u8;
    compressor[1..1 + name.len()].copy_from_slice(name);
    c.extend_from_slice(&compressor);

    c.extend_from_slice(&0x0018u16.to_be_bytes()); // depth
    c.extend_from_slice(&(-1i16).to_be_bytes()); // pre_defined
    c.extend_from_slice(children);
    write_box(buf, entry_type, &c);
}

fn write_audio_entry(
    buf: &mut Vec<u8>,
    entry_type: &[u8; 4],
    sample_rate: u32,
    channels: u16,
    children: &[u8],
) {
    let mut c = Vec::new();
    c.extend_from_slice(&[0; 6]); // reserved
    c.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
    c.extend_from_slice(&[0; 8]); // reserved
    c.extend_from_slice(&channels.to_be_bytes());
    c.extend_from_slice(&16u16.to_be_bytes()); // sample_size (bits)
    c.extend_from_slice(&0u32.to_be_bytes()); // pre_defined + reserved
    // 16.16 fixed point; rates above 65535 do not fit the integer part
    c.extend_from_slice(&(sample_rate.min(0xFFFF) as u16).to_be_bytes());
    c.extend_from_slice(&0u16.to_be_bytes());
    c.extend_from_slice(children);
    write_box(buf, entry_type, &c);
}

fn write_avcc(buf: &mut Vec<u8>, sps: &[u8], pps: &[u8]) {
    let mut c = Vec::new();
    c.push(1); // configuration_version
    if sps.len() >= 4 {
        c.extend_from_slice(&sps[1..4]); // profile, compatibility, level
    } else {
        c.extend_from_slice(&[0x42, 0x00, 0x1f]); // Baseline, level 3.1
    }
    c.push(0xFF); // 4-byte NAL lengths
    c.push(0xE1); // one SPS
    c.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    c.extend_from_slice(sps);
    c.push(1); // one PPS
    c.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    c.extend_from_slice(pps);
    write_box(buf, b"avcC", &c);
}

fn build_esds_contents(asc: &[u8]) -> Vec<u8> {
    let dec_config_len = 13 + 2 + asc.len();
    let sl_config_len = 1;
    let es_desc_len = 3 + (2 + dec_config_len) + (2 + sl_config_len);

    let mut buf = Vec::new();
    // ES_Descriptor
    buf.push(0x03);
    buf.push(es_desc_len as u8);
    buf.extend_from_slice(&[0x00, 0x01]); // ES_ID
    buf.push(0x00); // stream priority

    // DecoderConfigDescriptor
    buf.push(0x04);
    buf.push(dec_config_len as u8);
    buf.push(0x40); // Audio ISO/IEC 14496-3
    buf.push(0x15); // audio stream
    buf.extend_from_slice(&[0x00, 0x00, 0x00]); // bufferSizeDB
    buf.extend_from_slice(&DEFAULT_AUDIO_BITRATE.to_be_bytes()); // maxBitrate
    buf.extend_from_slice(&DEFAULT_AUDIO_BITRATE.to_be_bytes()); // avgBitrate

    // DecoderSpecificInfo
    buf.push(0x05);
    buf.push(asc.len() as u8);
    buf.extend_from_slice(asc);

    // SLConfigDescriptor
    buf.push(0x06);
    buf.push(sl_config_len as u8);
    buf.push(0x02);

    buf
}

fn traf_size(sample_count: usize) -> usize {
    // traf header + tfhd + tfdt (v1) + trun header/flags/count/offset + 3 fields per sample
    8 + 16 + 20 + 20 + 12 * sample_count
}

/// Build one moof + mdat pair covering every given track fragment.
fn write_moof_mdat(sequence_number: u32, fragments: &[TrackFragment<'_>]) -> Vec<u8> {
    let moof_size = 8
        + MFHD_SIZE
        + fragments
            .iter()
            .map(|f| traf_size(f.samples.len()))
            .sum::<usize>();
    let mdat_payload: usize = fragments
        .iter()
        .flat_map(|f| f.samples.iter())
        .map(|s| s.data.len())
        .sum();

    let mut buf = Vec::with_capacity(moof_size + 8 + mdat_payload);
    buf.extend_from_slice(&(moof_size as u32).to_be_bytes());
    buf.extend_from_slice(b"moof");

    let mut mfhd = full_box(0, 0);
    mfhd.extend_from_slice(&sequence_number.to_be_bytes());
    write_box(&mut buf, b"mfhd", &mfhd);

    // data_offset is relative to the start of moof
    let mut data_offset = moof_size + 8;
    for frag in fragments {
        let mut traf = Vec::with_capacity(traf_size(frag.samples.len()));

        let mut tfhd = full_box(0, TFHD_DEFAULT_BASE_IS_MOOF);
        tfhd.extend_from_slice(&frag.track_id.to_be_bytes());
        write_box(&mut traf, b"tfhd", &tfhd);

        let mut tfdt = full_box(1, 0);
        tfdt.extend_from_slice(&frag.base_decode_time.to_be_bytes());
        write_box(&mut traf, b"tfdt", &tfdt);

        let mut trun = full_box(0, TRUN_FLAGS);
        trun.extend_from_slice(&(frag.samples.len() as u32).to_be_bytes());
        trun.extend_from_slice(&(data_offset as u32).to_be_bytes());
        for sample in frag.samples {
            let flags = if sample.is_sync {
                SYNC_SAMPLE_FLAGS
            } else {
                NON_SYNC_SAMPLE_FLAGS
            };
            trun.extend_from_slice(&sample.duration.to_be_bytes());
            trun.extend_from_slice(&(sample.data.len() as u32).to_be_bytes());
            trun.extend_from_slice(&flags.to_be_bytes());
        }
        write_box(&mut traf, b"trun", &trun);

        write_box(&mut buf, b"traf", &traf);
        data_offset += frag.samples.iter().map(|s| s.data.len()).sum::<usize>();
    }
    debug_assert_eq!(buf.len(), moof_size);

    buf.extend_from_slice(&((8 + mdat_payload) as u32).to_be_bytes());
    buf.extend_from_slice(b"mdat");
    for sample in fragments.iter().flat_map(|f| f.samples.iter()) {
        buf.extend_from_slice(&sample.data);
    }
    buf
}

impl ContainerWriter for Mp4Writer {
    fn add_track(&mut self, format: &FormatDescriptor) -> Result<usize> {
        anyhow::ensure!(!self.started, "cannot add a track after the container started");
        let kind = format.kind();
        anyhow::ensure!(
            !self.tracks.iter().any(|t| t.kind() == kind),
            "{} track already registered",
            kind
        );
        match format {
            FormatDescriptor::Video(v) => {
                anyhow::ensure!(
                    v.width > 0 && v.height > 0 && v.width <= 0xFFFF && v.height <= 0xFFFF,
                    "unsupported video dimensions {}x{}",
                    v.width,
                    v.height
                );
            }
            FormatDescriptor::Audio(a) => {
                anyhow::ensure!(a.sample_rate > 0, "audio sample rate must be non-zero");
                anyhow::ensure!(a.channels > 0, "audio channel count must be non-zero");
            }
        }

        let index = self.tracks.len();
        self.tracks.push(Track {
            id: index as u32 + 1,
            timescale: timescale_for(format),
            format: format.clone(),
            held: None,
            pending: Vec::new(),
            fragment_base: 0,
            last_duration: 0,
            samples: 0,
        });
        Ok(index)
    }

    fn start(&mut self) -> Result<()> {
        anyhow::ensure!(!self.started, "container already started");
        anyhow::ensure!(!self.tracks.is_empty(), "no tracks registered");

        let file = match self.reserved.take() {
            Some(file) => {
                file.set_len(0)
                    .with_context(|| format!("failed to truncate {}", self.path.display()))?;
                file
            }
            None => File::create(&self.path)
                .with_context(|| format!("failed to create {}", self.path.display()))?,
        };
        self.file = Some(BufWriter::new(file));

        let init = self.init_segment();
        self.write_bytes(&init)?;
        self.started = true;
        tracing::info!(
            "Writing {} ({} tracks)",
            self.path.display(),
            self.tracks.len()
        );
        Ok(())
    }

    fn write_sample(&mut self, track: usize, unit: &AccessUnit) -> Result<()> {
        anyhow::ensure!(self.started, "container not started");
        anyhow::ensure!(!self.stopped, "container already stopped");
        let threshold_ms = u64::from(self.fragment_duration_ms);

        let t = self
            .tracks
            .get_mut(track)
            .ok_or_else(|| anyhow::anyhow!("unknown track index {}", track))?;

        let (data, is_sync) = match &t.format {
            FormatDescriptor::Video(v) if matches!(v.codec, VideoCodec::H264 { .. }) => {
                let (avcc, idr) = annex_b_to_avcc(&unit.data);
                anyhow::ensure!(!avcc.is_empty(), "H.264 access unit has no slice NAL units");
                (avcc, unit.is_keyframe || idr)
            }
            _ => (unit.data.to_vec(), unit.is_keyframe),
        };

        let decode_time = to_ticks(unit.pts_us, t.timescale);
        if let Some(prev) = &t.held {
            anyhow::ensure!(
                decode_time > prev.decode_time,
                "non-increasing {} timestamp: {} after {} ticks",
                t.kind(),
                decode_time,
                prev.decode_time
            );
            let duration = u32::try_from(decode_time - prev.decode_time)
                .context("sample duration overflows 32 bits")?;
            t.settle_held(duration);
        }

        let split = t.kind() == TrackKind::Video
            && is_sync
            && t.pending_ms(decode_time) >= threshold_ms;

        t.held = Some(HeldSample {
            data,
            decode_time,
            is_sync,
        });
        t.samples += 1;

        if split {
            self.flush_fragment()?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.started || self.stopped {
            return Ok(());
        }
        for track in &mut self.tracks {
            if let Some(held) = &track.held {
                let duration = track.closing_duration(held);
                track.settle_held(duration);
            }
        }
        self.flush_fragment()?;
        if let Some(file) = self.file.as_mut() {
            file.flush()
                .with_context(|| format!("failed to flush {}", self.path.display()))?;
        }
        self.stopped = true;
        tracing::info!(
            "Finalized {} ({} bytes, {} video / {} audio samples)",
            self.path.display(),
            self.bytes_written,
            self.sample_count(TrackKind::Video),
            self.sample_count(TrackKind::Audio)
        );
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .with_context(|| format!("failed to flush {}", self.path.display()))?;
        }
        if self.reserved.take().is_some() && !self.started && self.remove_if_unstarted {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove {}", self.path.display()))?;
            tracing::debug!("Removed unused {}", self.path.display());
        }
        Ok(())
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Parsed box header from an MP4 byte stream.
#[derive(Debug, Clone)]
pub struct BoxHeader {
    pub box_type: [u8; 4],
    pub offset: usize,
    pub size: usize,
    pub header_size: usize,
}

impl BoxHeader {
    /// Returns the content bytes (after the header) within the given data slice.
    pub fn content<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.offset + self.header_size;
        let end = (self.offset + self.size).min(data.len());
        if start >= end {
            &[]
        } else {
            &data[start..end]
        }
    }
}

fn be_u16(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

fn be_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn be_u64(data: &[u8], offset: usize) -> Option<u64> {
    let hi = be_u32(data, offset)?;
    let lo = be_u32(data, offset + 4)?;
    Some((u64::from(hi) << 32) | u64::from(lo))
}

/// Iterate over the boxes at one nesting level.
pub fn iter_boxes(data: &[u8]) -> Vec<BoxHeader> {
    let mut boxes = Vec::new();
    let mut offset = 0;
    while let Some(size) = be_u32(data, offset) {
        let size = size as usize;
        if size < 8 || offset + 8 > data.len() {
            break;
        }
        let box_type = [
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ];
        boxes.push(BoxHeader {
            box_type,
            offset,
            size: size.min(data.len() - offset),
            header_size: 8,
        });
        offset += size;
    }
    boxes
}

/// Find a box by type at one nesting level.
pub fn find_box(data: &[u8], box_type: &[u8; 4]) -> Option<BoxHeader> {
    iter_boxes(data)
        .into_iter()
        .find(|b| &b.box_type == box_type)
}

/// Follow a path of nested boxes and return the content of the last one.
pub fn find_box_path<'a>(data: &'a [u8], path: &[&[u8; 4]]) -> Option<&'a [u8]> {
    let Some((first, rest)) = path.split_first() else {
        return Some(data);
    };
    let header = find_box(data, first)?;
    find_box_path(header.content(data), rest)
}

/// One entry of a file's track table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub track_id: u32,
    /// `vide` or `soun`.
    pub handler: [u8; 4],
    pub timescale: u32,
    /// Sample entry type, e.g. `avc1`, `nv21`, `mp4a`, `sowt`.
    pub sample_entry: [u8; 4],
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
}

impl TrackInfo {
    pub fn is_video(&self) -> bool {
        &self.handler == b"vide"
    }

    pub fn is_audio(&self) -> bool {
        &self.handler == b"soun"
    }
}

/// Read the track table from the `moov` box.
pub fn read_track_table(data: &[u8]) -> Result<Vec<TrackInfo>> {
    let moov = find_box_path(data, &[b"moov"])
        .ok_or_else(|| anyhow::anyhow!("Could not find moov box"))?;

    let mut tracks = Vec::new();
    for trak_header in iter_boxes(moov).iter().filter(|b| &b.box_type == b"trak") {
        let trak = trak_header.content(moov);

        let tkhd = find_box_path(trak, &[b"tkhd"])
            .ok_or_else(|| anyhow::anyhow!("Could not find tkhd box"))?;
        let track_id = be_u32(tkhd, 12).ok_or_else(|| anyhow::anyhow!("tkhd too short"))?;

        let mdhd = find_box_path(trak, &[b"mdia", b"mdhd"])
            .ok_or_else(|| anyhow::anyhow!("Could not find mdhd box"))?;
        let timescale = be_u32(mdhd, 12).ok_or_else(|| anyhow::anyhow!("mdhd too short"))?;

        let hdlr = find_box_path(trak, &[b"mdia", b"hdlr"])
            .ok_or_else(|| anyhow::anyhow!("Could not find hdlr box"))?;
        let handler: [u8; 4] = hdlr
            .get(8..12)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| anyhow::anyhow!("hdlr too short"))?;

        let stsd = find_box_path(trak, &[b"mdia", b"minf", b"stbl", b"stsd"])
            .ok_or_else(|| anyhow::anyhow!("Could not find stsd box"))?;
        // version/flags + entry_count precede the first sample entry
        let entries = stsd.get(8..).unwrap_or(&[]);
        let entry = iter_boxes(entries)
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("stsd has no sample entry"))?;
        let entry_content = entry.content(entries);

        let mut info = TrackInfo {
            track_id,
            handler,
            timescale,
            sample_entry: entry.box_type,
            width: 0,
            height: 0,
            sample_rate: 0,
            channels: 0,
        };
        if info.is_video() {
            info.width = u32::from(be_u16(entry_content, 24).unwrap_or(0));
            info.height = u32::from(be_u16(entry_content, 26).unwrap_or(0));
        } else if info.is_audio() {
            info.channels = be_u16(entry_content, 16).unwrap_or(0);
            info.sample_rate = u32::from(be_u16(entry_content, 24).unwrap_or(0));
        }
        tracks.push(info);
    }
    Ok(tracks)
}

/// One sample located by [`read_samples`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleInfo {
    /// Decode time in track ticks.
    pub decode_time: u64,
    pub duration: u32,
    pub size: u32,
    pub is_sync: bool,
    /// Absolute byte offset of the sample data in the file.
    pub file_offset: usize,
}

/// Collect every sample of every fragment, keyed by track ID.
pub fn read_samples(data: &[u8]) -> Result<BTreeMap<u32, Vec<SampleInfo>>> {
    let mut tracks: BTreeMap<u32, Vec<SampleInfo>> = BTreeMap::new();

    for moof_header in iter_boxes(data).iter().filter(|b| &b.box_type == b"moof") {
        let moof = moof_header.content(data);
        for traf_header in iter_boxes(moof).iter().filter(|b| &b.box_type == b"traf") {
            let traf = traf_header.content(moof);

            let tfhd = find_box_path(traf, &[b"tfhd"])
                .ok_or_else(|| anyhow::anyhow!("Could not find tfhd box"))?;
            let track_id = be_u32(tfhd, 4).ok_or_else(|| anyhow::anyhow!("tfhd too short"))?;

            let tfdt = find_box_path(traf, &[b"tfdt"])
                .ok_or_else(|| anyhow::anyhow!("Could not find tfdt box"))?;
            let base = if tfdt.first() == Some(&1) {
                be_u64(tfdt, 4)
            } else {
                be_u32(tfdt, 4).map(u64::from)
            }
            .ok_or_else(|| anyhow::anyhow!("tfdt too short"))?;

            let trun = find_box_path(traf, &[b"trun"])
                .ok_or_else(|| anyhow::anyhow!("Could not find trun box"))?;
            let flags = be_u32(trun, 0).ok_or_else(|| anyhow::anyhow!("trun too short"))?
                & 0x00FF_FFFF;
            let count = be_u32(trun, 4).ok_or_else(|| anyhow::anyhow!("trun too short"))?;

            let mut pos = 8;
            let mut data_offset = 0usize;
            if flags & 0x01 != 0 {
                data_offset = be_u32(trun, pos)
                    .ok_or_else(|| anyhow::anyhow!("trun too short"))?
                    as usize;
                pos += 4;
            }
            if flags & 0x04 != 0 {
                pos += 4; // first_sample_flags
            }

            let mut file_offset = moof_header.offset + data_offset;
            let mut decode_time = base;
            let samples = tracks.entry(track_id).or_default();
            for _ in 0..count {
                let mut field = |present: bool| -> Result<u32> {
                    if !present {
                        return Ok(0);
                    }
                    let v = be_u32(trun, pos).ok_or_else(|| anyhow::anyhow!("trun truncated"))?;
                    pos += 4;
                    Ok(v)
                };
                let duration = field(flags & 0x100 != 0)?;
                let size = field(flags & 0x200 != 0)?;
                let sample_flags = field(flags & 0x400 != 0)?;
                field(flags & 0x800 != 0)?;

                samples.push(SampleInfo {
                    decode_time,
                    duration,
                    size,
                    is_sync: sample_flags & 0x0001_0000 == 0,
                    file_offset,
                });
                decode_time += u64::from(duration);
                file_offset += size as usize;
            }
        }
    }
    Ok(tracks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitmp4_codec::{AudioFormat, ColorFormat, VideoFormat};

    fn raw_video() -> FormatDescriptor {
        FormatDescriptor::Video(VideoFormat {
            codec: VideoCodec::Raw(ColorFormat::Yuv420SemiPlanar),
            width: 16,
            height: 16,
        })
    }

    fn pcm_audio() -> FormatDescriptor {
        FormatDescriptor::Audio(AudioFormat {
            codec: AudioCodec::PcmS16Le,
            sample_rate: 44_100,
            channels: 1,
        })
    }

    fn started_writer(path: &Path) -> Mp4Writer {
        let mut writer = Mp4Writer::new(path);
        writer.add_track(&raw_video()).unwrap();
        writer.add_track(&pcm_audio()).unwrap();
        writer.start().unwrap();
        writer
    }

    #[test]
    fn test_parse_annex_b_keyframe() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1f]);
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x3C, 0x80]);
        data.extend_from_slice(&[0x00, 0x00, 0x01, 0x65, 0x88, 0x80, 0x40]);

        let parsed = parse_annex_b(&data);
        assert!(parsed.is_keyframe);
        assert_eq!(parsed.sps.unwrap(), vec![0x67, 0x42, 0x00, 0x1f]);
        assert_eq!(parsed.pps.unwrap(), vec![0x68, 0xCE, 0x3C, 0x80]);
        assert_eq!(parsed.nals.len(), 1);
        assert!(parsed.nals[0].is_idr());
        assert_eq!(parsed.nals[0].data, vec![0x65, 0x88, 0x80, 0x40]);
    }

    #[test]
    fn test_parse_annex_b_empty() {
        let parsed = parse_annex_b(&[]);
        assert!(!parsed.is_keyframe);
        assert!(parsed.nals.is_empty());
    }

    #[test]
    fn test_annex_b_to_avcc_keeps_slices_only() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x06, 0x05, 0x01]); // SEI
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x00]); // non-IDR

        let (avcc, idr) = annex_b_to_avcc(&data);
        assert!(!idr);
        assert_eq!(avcc, vec![0, 0, 0, 3, 0x41, 0x9A, 0x00]);
    }

    #[test]
    fn test_no_file_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let mut writer = Mp4Writer::new(&path);
        writer.add_track(&raw_video()).unwrap();

        let unit = AccessUnit::new(TrackKind::Video, vec![0u8; 384], 0, true);
        assert!(writer.write_sample(0, &unit).is_err());
        writer.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_create_reserves_and_removes_unused_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let mut writer = Mp4Writer::create(&path).unwrap();
        assert!(path.exists());
        writer.add_track(&raw_video()).unwrap();
        writer.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_create_keeps_existing_file_when_unused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        std::fs::write(&path, b"previous").unwrap();

        let mut writer = Mp4Writer::create(&path).unwrap();
        writer.release().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"previous");
    }

    #[test]
    fn test_create_truncates_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        std::fs::write(&path, vec![0xAB; 4096]).unwrap();

        let mut writer = Mp4Writer::create(&path).unwrap();
        writer.add_track(&raw_video()).unwrap();
        writer.add_track(&pcm_audio()).unwrap();
        writer.start().unwrap();
        writer.stop().unwrap();
        writer.release().unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[4..8], b"ftyp");
        assert_eq!(read_track_table(&data).unwrap().len(), 2);
    }

    #[test]
    fn test_create_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Mp4Writer::create(dir.path()).is_err());
    }

    #[test]
    fn test_track_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = Mp4Writer::new(dir.path().join("out.mp4"));
        assert!(writer.start().is_err());

        writer.add_track(&raw_video()).unwrap();
        assert!(writer.add_track(&raw_video()).is_err());
        writer.add_track(&pcm_audio()).unwrap();
        writer.start().unwrap();
        assert!(writer.add_track(&pcm_audio()).is_err());
        assert!(writer.start().is_err());
    }

    #[test]
    fn test_track_table_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let mut writer = started_writer(&path);
        writer.stop().unwrap();
        writer.release().unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[4..8], b"ftyp");

        let tracks = read_track_table(&data).unwrap();
        assert_eq!(tracks.len(), 2);

        assert!(tracks[0].is_video());
        assert_eq!(tracks[0].track_id, 1);
        assert_eq!(tracks[0].timescale, VIDEO_TIMESCALE);
        assert_eq!(&tracks[0].sample_entry, b"nv21");
        assert_eq!((tracks[0].width, tracks[0].height), (16, 16));

        assert!(tracks[1].is_audio());
        assert_eq!(tracks[1].track_id, 2);
        assert_eq!(tracks[1].timescale, 44_100);
        assert_eq!(&tracks[1].sample_entry, b"sowt");
        assert_eq!(tracks[1].sample_rate, 44_100);
        assert_eq!(tracks[1].channels, 1);

        // No samples were written, so no fragments either
        assert!(read_samples(&data).unwrap().is_empty());
    }

    #[test]
    fn test_timestamps_and_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let mut writer = started_writer(&path);

        for i in 0..30u64 {
            let pts = i * 1_000_000 / 20;
            let video = AccessUnit::new(TrackKind::Video, vec![i as u8; 384], pts, i == 0);
            let audio = AccessUnit::new(TrackKind::Audio, vec![0u8; 4096], pts, true);
            writer.write_sample(0, &video).unwrap();
            writer.write_sample(1, &audio).unwrap();
        }
        writer.stop().unwrap();
        writer.release().unwrap();
        assert_eq!(writer.sample_count(TrackKind::Video), 30);

        let data = std::fs::read(&path).unwrap();
        let samples = read_samples(&data).unwrap();

        let video = &samples[&1];
        assert_eq!(video.len(), 30);
        for (i, s) in video.iter().enumerate() {
            assert_eq!(s.decode_time, i as u64 * 4500);
            assert_eq!(s.size, 384);
            assert_eq!(s.is_sync, i == 0);
            assert!(data[s.file_offset..s.file_offset + 384]
                .iter()
                .all(|&b| b == i as u8));
        }
        // Last sample reuses the previous duration
        assert_eq!(video[29].duration, 4500);

        let audio = &samples[&2];
        assert_eq!(audio.len(), 30);
        for (i, s) in audio.iter().enumerate() {
            assert_eq!(s.decode_time, i as u64 * 2205);
        }
        // 4096 bytes of mono 16-bit PCM
        assert_eq!(audio[29].duration, 2048);
    }

    #[test]
    fn test_fragments_split_on_keyframes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let mut writer = started_writer(&path).fragment_duration_ms(100);

        for i in 0..20u64 {
            let unit = AccessUnit::new(TrackKind::Video, vec![0u8; 384], i * 50_000, i % 5 == 0);
            writer.write_sample(0, &unit).unwrap();
        }
        writer.stop().unwrap();
        writer.release().unwrap();

        let data = std::fs::read(&path).unwrap();
        let moofs = iter_boxes(&data)
            .iter()
            .filter(|b| &b.box_type == b"moof")
            .count();
        assert_eq!(moofs, 4);

        let samples = read_samples(&data).unwrap();
        let video = &samples[&1];
        assert_eq!(video.len(), 20);
        assert!(video.windows(2).all(|w| w[1].decode_time > w[0].decode_time));
    }

    #[test]
    fn test_non_increasing_timestamp_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = started_writer(&dir.path().join("out.mp4"));

        let first = AccessUnit::new(TrackKind::Video, vec![0u8; 384], 50_000, true);
        let same = AccessUnit::new(TrackKind::Video, vec![0u8; 384], 50_000, false);
        writer.write_sample(0, &first).unwrap();
        assert!(writer.write_sample(0, &same).is_err());
    }

    #[test]
    fn test_h264_track() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let sps = vec![0x67, 0x42, 0x00, 0x1f, 0xAC];
        let pps = vec![0x68, 0xCE, 0x3C, 0x80];

        let mut writer = Mp4Writer::new(&path);
        writer
            .add_track(&FormatDescriptor::Video(VideoFormat {
                codec: VideoCodec::H264 {
                    sps: sps.clone(),
                    pps: pps.clone(),
                },
                width: 640,
                height: 480,
            }))
            .unwrap();
        writer
            .add_track(&FormatDescriptor::Audio(AudioFormat {
                codec: AudioCodec::Aac {
                    audio_specific_config: vec![0x12, 0x08],
                },
                sample_rate: 44_100,
                channels: 1,
            }))
            .unwrap();
        writer.start().unwrap();

        let idr = [0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84];
        writer
            .write_sample(0, &AccessUnit::new(TrackKind::Video, idr.to_vec(), 0, false))
            .unwrap();
        let no_slices = [0x00, 0x00, 0x00, 0x01, 0x06, 0x05];
        assert!(writer
            .write_sample(0, &AccessUnit::new(TrackKind::Video, no_slices.to_vec(), 1, false))
            .is_err());
        writer.stop().unwrap();
        writer.release().unwrap();

        let data = std::fs::read(&path).unwrap();
        let tracks = read_track_table(&data).unwrap();
        assert_eq!(&tracks[0].sample_entry, b"avc1");
        assert_eq!((tracks[0].width, tracks[0].height), (640, 480));
        assert_eq!(&tracks[1].sample_entry, b"mp4a");

        let stsd = find_box_path(
            &data,
            &[b"moov", b"trak", b"mdia", b"minf", b"stbl", b"stsd"],
        )
        .unwrap();
        // avc1 fixed fields are 78 bytes; avcC follows
        let avc1 = find_box(&stsd[8..], b"avc1").unwrap();
        let avc1_content = avc1.content(&stsd[8..]);
        let avcc = find_box(&avc1_content[78..], b"avcC").unwrap();
        let avcc = avcc.content(&avc1_content[78..]);
        assert_eq!(&avcc[..5], &[1, 0x42, 0x00, 0x1f, 0xFF]);
        assert_eq!(&avcc[8..13], &sps[..]);

        let samples = read_samples(&data).unwrap();
        let sample = &samples[&1][0];
        // IDR detected from the bitstream even though the unit was not flagged
        assert!(sample.is_sync);
        assert_eq!(
            &data[sample.file_offset..sample.file_offset + sample.size as usize],
            &[0, 0, 0, 3, 0x65, 0x88, 0x84]
        );
    }
}
