//! SCTE-35 binary layer: splice information sections per SCTE 35 2023.
//!
//! Sections arrive base64-encoded inside DATERANGE attributes or `0x…` hex
//! from legacy CUE tags. Decoding is lenient where the wire is messy (some
//! encoders prefix the section with framing bytes; the table id is scanned
//! within the first 16 bytes) and strict where it matters: the trailing
//! MPEG-2 CRC-32 is always recomputed, and a mismatch is surfaced on the
//! decoded structure rather than swallowing the section entirely.

pub mod bits;
pub mod upid;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use bits::BitReader;
use crc::{CRC_32_MPEG_2, Crc};
use thiserror::Error;
use tracing::debug;

use upid::Upid;

/// 33-bit PTS modulus
pub const PTS_MODULUS: u64 = 1 << 33;

const TABLE_ID: u8 = 0xFC;
const CRC_MPEG2: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

#[derive(Error, Debug, PartialEq)]
pub enum Scte35Error {
    #[error("invalid base64: {0}")]
    Base64(String),
    #[error("invalid hex: {0}")]
    Hex(String),
    #[error("table_id 0xFC not found in leading bytes")]
    TableIdNotFound,
    #[error("section truncated: {0}")]
    Truncated(String),
    #[error("malformed section: {0}")]
    Malformed(String),
}

/// A decoded splice information section.
#[derive(Debug, Clone, PartialEq)]
pub struct SpliceInfoSection {
    pub table_id: u8,
    pub section_length: u16,
    pub protocol_version: u8,
    pub encrypted_packet: bool,
    pub encryption_algorithm: u8,
    /// 33-bit offset already applied to every splice_time in `command`
    pub pts_adjustment: u64,
    pub cw_index: u8,
    pub tier: u16,
    pub splice_command_type: u8,
    pub command: SpliceCommand,
    pub descriptors: Vec<SpliceDescriptor>,
    pub crc_32: u32,
    pub crc_valid: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpliceCommand {
    Null,
    SpliceInsert(SpliceInsert),
    TimeSignal(SpliceTime),
    /// Body withheld: the section is encrypted and only the header is usable
    Encrypted,
    /// Retained opaque (schedule, bandwidth reservation, private, …)
    Other { data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpliceInsert {
    pub splice_event_id: u32,
    pub cancel: bool,
    pub out_of_network: bool,
    pub program_splice: bool,
    pub splice_immediate: bool,
    pub splice_time: Option<SpliceTime>,
    pub break_duration: Option<BreakDuration>,
    pub unique_program_id: u16,
    pub avail_num: u8,
    pub avails_expected: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpliceTime {
    pub time_specified: bool,
    /// 90 kHz ticks, 33-bit, post-`pts_adjustment`
    pub pts_time: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakDuration {
    pub auto_return: bool,
    /// 90 kHz ticks
    pub duration: u64,
}

impl BreakDuration {
    pub fn seconds(&self) -> f64 {
        self.duration as f64 / 90_000.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpliceDescriptor {
    Segmentation(SegmentationDescriptor),
    /// Non-CUEI or non-segmentation descriptors, kept losslessly
    Other {
        tag: u8,
        identifier: [u8; 4],
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationDescriptor {
    pub event_id: u32,
    pub cancel: bool,
    pub program_segmentation: bool,
    /// Present when delivery is restricted
    pub delivery_restrictions: Option<DeliveryRestrictions>,
    /// 90 kHz ticks, 40-bit
    pub duration: Option<u64>,
    pub upid: Upid,
    pub type_id: u8,
    pub segment_num: u8,
    pub segments_expected: u8,
    pub sub_segment_num: Option<u8>,
    pub sub_segments_expected: Option<u8>,
}

impl SegmentationDescriptor {
    pub fn duration_seconds(&self) -> Option<f64> {
        self.duration.map(|d| d as f64 / 90_000.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRestrictions {
    pub web_delivery_allowed: bool,
    pub no_regional_blackout: bool,
    pub archive_allowed: bool,
    pub device_restrictions: u8,
}

impl SpliceInfoSection {
    /// The splice point PTS, post-adjustment, for commands that carry one.
    pub fn primary_pts(&self) -> Option<u64> {
        match &self.command {
            SpliceCommand::SpliceInsert(si) => si.splice_time.as_ref().and_then(|t| t.pts_time),
            SpliceCommand::TimeSignal(t) => t.pts_time,
            _ => None,
        }
    }

    /// Break duration in seconds: splice_insert break_duration first, then
    /// the first segmentation descriptor's duration.
    pub fn break_duration_secs(&self) -> Option<f64> {
        if let SpliceCommand::SpliceInsert(si) = &self.command
            && let Some(bd) = &si.break_duration
        {
            return Some(bd.seconds());
        }
        self.segmentation_descriptors()
            .next()
            .and_then(|d| d.duration_seconds())
    }

    pub fn segmentation_descriptors(&self) -> impl Iterator<Item = &SegmentationDescriptor> {
        self.descriptors.iter().filter_map(|d| match d {
            SpliceDescriptor::Segmentation(s) => Some(s),
            _ => None,
        })
    }
}

/// Decode a base64-encoded splice section.
pub fn decode_base64(b64: &str) -> Result<SpliceInfoSection, Scte35Error> {
    let bytes = B64
        .decode(b64.trim())
        .map_err(|e| Scte35Error::Base64(e.to_string()))?;
    decode_bytes(&bytes)
}

/// Decode a `0x…` (or bare) hex-encoded splice section.
pub fn decode_hex(s: &str) -> Result<SpliceInfoSection, Scte35Error> {
    let stripped = s.trim().trim_start_matches("0x").trim_start_matches("0X");
    let bytes = hex::decode(stripped).map_err(|e| Scte35Error::Hex(e.to_string()))?;
    decode_bytes(&bytes)
}

/// Render section bytes the way this proxy emits SCTE-35 payloads:
/// lowercase hex with a `0x` prefix.
pub fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Decode raw section bytes.
///
/// If the first byte is not the 0xFC table id, the first 16 bytes are
/// scanned for it — some encoders wrap the section in framing bytes.
pub fn decode_bytes(bytes: &[u8]) -> Result<SpliceInfoSection, Scte35Error> {
    let start = if bytes.first() == Some(&TABLE_ID) {
        0
    } else {
        bytes
            .iter()
            .take(16)
            .position(|&b| b == TABLE_ID)
            .ok_or(Scte35Error::TableIdNotFound)?
    };
    if start > 0 {
        debug!("SCTE-35 table_id found at offset {start}, skipping framing");
    }
    let framed = &bytes[start..];

    if framed.len() < 3 {
        return Err(Scte35Error::Truncated("no section header".into()));
    }
    let section_length = (((framed[1] & 0x0F) as u16) << 8) | framed[2] as u16;
    let total = 3 + section_length as usize;
    if framed.len() < total {
        return Err(Scte35Error::Truncated(format!(
            "section_length wants {total} bytes, have {}",
            framed.len()
        )));
    }
    let section = &framed[..total];

    if total < 4 + 11 + 3 {
        return Err(Scte35Error::Truncated("section shorter than fixed header".into()));
    }

    // Trailing CRC-32, MPEG-2 polynomial, over all preceding bytes
    let stored_crc = u32::from_be_bytes(
        section[total - 4..]
            .try_into()
            .expect("slice is exactly 4 bytes"),
    );
    let crc_valid = CRC_MPEG2.checksum(&section[..total - 4]) == stored_crc;

    let mut r = BitReader::new(section);
    let malformed = |e: bits::BitError| Scte35Error::Malformed(e.to_string());

    let table_id = r.read(8).map_err(malformed)? as u8;
    r.skip(1).map_err(malformed)?; // section_syntax_indicator
    r.skip(1).map_err(malformed)?; // private_indicator
    r.skip(2).map_err(malformed)?; // sap_type
    r.skip(12).map_err(malformed)?; // section_length, already read

    let protocol_version = r.read(8).map_err(malformed)? as u8;
    let encrypted_packet = r.flag().map_err(malformed)?;
    let encryption_algorithm = r.read(6).map_err(malformed)? as u8;
    let pts_adjustment = r.read(33).map_err(malformed)?;
    let cw_index = r.read(8).map_err(malformed)? as u8;
    let tier = r.read(12).map_err(malformed)? as u16;
    let splice_command_length = r.read(12).map_err(malformed)? as usize;
    let splice_command_type = r.read(8).map_err(malformed)? as u8;

    if encrypted_packet {
        // Everything from here to the CRC is ciphertext
        return Ok(SpliceInfoSection {
            table_id,
            section_length,
            protocol_version,
            encrypted_packet,
            encryption_algorithm,
            pts_adjustment,
            cw_index,
            tier,
            splice_command_type,
            command: SpliceCommand::Encrypted,
            descriptors: Vec::new(),
            crc_32: stored_crc,
            crc_valid,
        });
    }

    // 0xFFF means "length unspecified" — parse inline off the main reader
    let command = if splice_command_length != 0xFFF {
        let cmd_bytes = r.read_bytes(splice_command_length).map_err(malformed)?;
        let mut cr = BitReader::new(cmd_bytes);
        parse_command(splice_command_type, &mut cr, cmd_bytes)?
    } else {
        parse_command_inline(splice_command_type, &mut r)?
    };

    let descriptor_loop_length = r.read(16).map_err(malformed)? as usize;
    let loop_bytes = r.read_bytes(descriptor_loop_length).map_err(malformed)?;
    let descriptors = parse_descriptor_loop(loop_bytes);

    let mut section = SpliceInfoSection {
        table_id,
        section_length,
        protocol_version,
        encrypted_packet,
        encryption_algorithm,
        pts_adjustment,
        cw_index,
        tier,
        splice_command_type,
        command,
        descriptors,
        crc_32: stored_crc,
        crc_valid,
    };
    apply_pts_adjustment(&mut section);
    Ok(section)
}

fn parse_command(
    command_type: u8,
    r: &mut BitReader,
    raw: &[u8],
) -> Result<SpliceCommand, Scte35Error> {
    match command_type {
        0x00 => Ok(SpliceCommand::Null),
        0x05 => parse_splice_insert(r).map(SpliceCommand::SpliceInsert),
        0x06 => parse_splice_time(r).map(SpliceCommand::TimeSignal),
        _ => Ok(SpliceCommand::Other { data: raw.to_vec() }),
    }
}

fn parse_command_inline(
    command_type: u8,
    r: &mut BitReader,
) -> Result<SpliceCommand, Scte35Error> {
    match command_type {
        0x00 => Ok(SpliceCommand::Null),
        0x05 => parse_splice_insert(r).map(SpliceCommand::SpliceInsert),
        0x06 => parse_splice_time(r).map(SpliceCommand::TimeSignal),
        other => Err(Scte35Error::Malformed(format!(
            "command type {other:#x} with unspecified length"
        ))),
    }
}

fn parse_splice_insert(r: &mut BitReader) -> Result<SpliceInsert, Scte35Error> {
    let malformed = |e: bits::BitError| Scte35Error::Malformed(format!("splice_insert: {e}"));

    let splice_event_id = r.read(32).map_err(malformed)? as u32;
    let cancel = r.flag().map_err(malformed)?;
    r.skip(7).map_err(malformed)?;

    if cancel {
        return Ok(SpliceInsert {
            splice_event_id,
            cancel,
            out_of_network: false,
            program_splice: false,
            splice_immediate: false,
            splice_time: None,
            break_duration: None,
            unique_program_id: 0,
            avail_num: 0,
            avails_expected: 0,
        });
    }

    let out_of_network = r.flag().map_err(malformed)?;
    let program_splice = r.flag().map_err(malformed)?;
    let duration_flag = r.flag().map_err(malformed)?;
    let splice_immediate = r.flag().map_err(malformed)?;
    r.skip(4).map_err(malformed)?; // event_id_compliance + reserved

    let splice_time = if program_splice && !splice_immediate {
        Some(parse_splice_time(r)?)
    } else {
        None
    };

    // Component-level splices (program_splice_flag = 0) carry a component
    // loop; live-linear origins emit program-level splices only, so the loop
    // is consumed without interpretation.
    if !program_splice {
        let component_count = r.read(8).map_err(malformed)? as u32;
        for _ in 0..component_count {
            r.skip(8).map_err(malformed)?;
            if !splice_immediate {
                parse_splice_time(r)?;
            }
        }
    }

    let break_duration = if duration_flag {
        let auto_return = r.flag().map_err(malformed)?;
        r.skip(6).map_err(malformed)?;
        let duration = r.read(33).map_err(malformed)?;
        Some(BreakDuration {
            auto_return,
            duration,
        })
    } else {
        None
    };

    let unique_program_id = r.read(16).map_err(malformed)? as u16;
    let avail_num = r.read(8).map_err(malformed)? as u8;
    let avails_expected = r.read(8).map_err(malformed)? as u8;

    Ok(SpliceInsert {
        splice_event_id,
        cancel,
        out_of_network,
        program_splice,
        splice_immediate,
        splice_time,
        break_duration,
        unique_program_id,
        avail_num,
        avails_expected,
    })
}

fn parse_splice_time(r: &mut BitReader) -> Result<SpliceTime, Scte35Error> {
    let malformed = |e: bits::BitError| Scte35Error::Malformed(format!("splice_time: {e}"));

    let time_specified = r.flag().map_err(malformed)?;
    let pts_time = if time_specified {
        r.skip(6).map_err(malformed)?;
        Some(r.read(33).map_err(malformed)?)
    } else {
        r.skip(7).map_err(malformed)?;
        None
    };
    Ok(SpliceTime {
        time_specified,
        pts_time,
    })
}

fn parse_descriptor_loop(bytes: &[u8]) -> Vec<SpliceDescriptor> {
    let mut descriptors = Vec::new();
    let mut pos = 0;

    while pos + 2 <= bytes.len() {
        let tag = bytes[pos];
        let length = bytes[pos + 1] as usize;
        let body_start = pos + 2;
        let body_end = body_start + length;
        if body_end > bytes.len() {
            debug!("Descriptor tag {tag:#x} overruns loop, dropping remainder");
            break;
        }
        let body = &bytes[body_start..body_end];
        pos = body_end;

        if length < 4 {
            descriptors.push(SpliceDescriptor::Other {
                tag,
                identifier: [0; 4],
                data: body.to_vec(),
            });
            continue;
        }

        let identifier: [u8; 4] = body[..4].try_into().expect("length checked");
        if tag == 0x02 && &identifier == b"CUEI" {
            match parse_segmentation_descriptor(&body[4..]) {
                Ok(seg) => {
                    descriptors.push(SpliceDescriptor::Segmentation(seg));
                    continue;
                }
                Err(e) => {
                    debug!("segmentation_descriptor parse failed ({e}), keeping opaque");
                }
            }
        }
        descriptors.push(SpliceDescriptor::Other {
            tag,
            identifier,
            data: body[4..].to_vec(),
        });
    }

    descriptors
}

fn parse_segmentation_descriptor(bytes: &[u8]) -> Result<SegmentationDescriptor, Scte35Error> {
    let malformed =
        |e: bits::BitError| Scte35Error::Malformed(format!("segmentation_descriptor: {e}"));
    let mut r = BitReader::new(bytes);

    let event_id = r.read(32).map_err(malformed)? as u32;
    let cancel = r.flag().map_err(malformed)?;
    r.skip(7).map_err(malformed)?; // event_id_compliance + reserved

    if cancel {
        return Ok(SegmentationDescriptor {
            event_id,
            cancel,
            program_segmentation: true,
            delivery_restrictions: None,
            duration: None,
            upid: upid::decode(0x00, &[]),
            type_id: 0,
            segment_num: 0,
            segments_expected: 0,
            sub_segment_num: None,
            sub_segments_expected: None,
        });
    }

    let program_segmentation = r.flag().map_err(malformed)?;
    let duration_flag = r.flag().map_err(malformed)?;
    let delivery_not_restricted = r.flag().map_err(malformed)?;

    let delivery_restrictions = if !delivery_not_restricted {
        let web_delivery_allowed = r.flag().map_err(malformed)?;
        let no_regional_blackout = r.flag().map_err(malformed)?;
        let archive_allowed = r.flag().map_err(malformed)?;
        let device_restrictions = r.read(2).map_err(malformed)? as u8;
        Some(DeliveryRestrictions {
            web_delivery_allowed,
            no_regional_blackout,
            archive_allowed,
            device_restrictions,
        })
    } else {
        r.skip(5).map_err(malformed)?;
        None
    };

    if !program_segmentation {
        let component_count = r.read(8).map_err(malformed)? as u32;
        for _ in 0..component_count {
            r.skip(8).map_err(malformed)?; // component_tag
            r.skip(7).map_err(malformed)?;
            r.skip(33).map_err(malformed)?; // pts_offset
        }
    }

    let duration = if duration_flag {
        Some(r.read(40).map_err(malformed)?)
    } else {
        None
    };

    let upid_type = r.read(8).map_err(malformed)? as u8;
    let upid_length = r.read(8).map_err(malformed)? as usize;
    let upid_bytes = r.read_bytes(upid_length).map_err(malformed)?;
    let upid = upid::decode(upid_type, upid_bytes);

    let type_id = r.read(8).map_err(malformed)? as u8;
    let segment_num = r.read(8).map_err(malformed)? as u8;
    let segments_expected = r.read(8).map_err(malformed)? as u8;

    // Placement-opportunity types carry sub-segment counts when present
    let has_sub_segments =
        matches!(type_id, 0x34 | 0x36 | 0x38 | 0x3A) && r.remaining_bits() >= 16;
    let (sub_segment_num, sub_segments_expected) = if has_sub_segments {
        (
            Some(r.read(8).map_err(malformed)? as u8),
            Some(r.read(8).map_err(malformed)? as u8),
        )
    } else {
        (None, None)
    };

    Ok(SegmentationDescriptor {
        event_id,
        cancel,
        program_segmentation,
        delivery_restrictions,
        duration,
        upid,
        type_id,
        segment_num,
        segments_expected,
        sub_segment_num,
        sub_segments_expected,
    })
}

/// Fold `pts_adjustment` into every splice_time, modulo 2³³.
fn apply_pts_adjustment(section: &mut SpliceInfoSection) {
    let adj = section.pts_adjustment;
    if adj == 0 {
        return;
    }
    let adjust = |t: &mut SpliceTime| {
        if let Some(pts) = t.pts_time {
            t.pts_time = Some((pts + adj) % PTS_MODULUS);
        }
    };
    match &mut section.command {
        SpliceCommand::SpliceInsert(si) => {
            if let Some(t) = si.splice_time.as_mut() {
                adjust(t);
            }
        }
        SpliceCommand::TimeSignal(t) => adjust(t),
        _ => {}
    }
}
