//! Segmentation UPID decoding.
//!
//! UPIDs identify the content around a segmentation point. Types with a
//! defined textual encoding are rendered as text; everything else is kept as
//! lossless hex so no byte is dropped on the floor.

/// A decoded UPID: the raw bytes always survive, `text` is the best
/// human-readable rendering the type allows.
#[derive(Debug, Clone, PartialEq)]
pub struct Upid {
    pub upid_type: u8,
    pub raw: Vec<u8>,
    pub text: String,
}

/// Standard UPID type names, SCTE 35 2023 Table 10.3.3.2.
pub fn upid_type_name(upid_type: u8) -> &'static str {
    match upid_type {
        0x00 => "Not Used",
        0x01 => "User Defined",
        0x02 => "ISCI",
        0x03 => "Ad-ID",
        0x04 => "UMID",
        0x05 => "ISAN",
        0x06 => "V-ISAN",
        0x07 => "TI",
        0x08 => "ADI",
        0x09 => "EIDR",
        0x0A => "ATSC Content Identifier",
        0x0B => "MPU",
        0x0C => "MID",
        0x0D => "ADS Information",
        0x0E => "URI",
        0x0F => "UUID",
        0x10 => "SCR",
        _ => "Reserved",
    }
}

/// Decode UPID bytes according to their declared type.
pub fn decode(upid_type: u8, data: &[u8]) -> Upid {
    let text = match upid_type {
        0x00 => String::new(),
        // Fixed-width ASCII identifiers
        0x02 | 0x03 => ascii_or_hex(data),
        // TI: 8-byte big-endian turner identifier, decimal rendering
        0x07 if data.len() == 8 => {
            u64::from_be_bytes(data.try_into().expect("length checked")).to_string()
        }
        // Free-text types
        0x01 | 0x08 | 0x0D | 0x0E => ascii_or_hex(data),
        // UUID: canonical 8-4-4-4-12 hex when the length is right
        0x0F if data.len() == 16 => format!(
            "{}-{}-{}-{}-{}",
            hex::encode(&data[0..4]),
            hex::encode(&data[4..6]),
            hex::encode(&data[6..8]),
            hex::encode(&data[8..10]),
            hex::encode(&data[10..16]),
        ),
        // UMID, ISAN, V-ISAN, ATSC, MPU, MID, SCR and anything unknown:
        // no defined textual form, keep hex
        _ => hex::encode(data),
    };

    Upid {
        upid_type,
        raw: data.to_vec(),
        text,
    }
}

fn ascii_or_hex(data: &[u8]) -> String {
    if !data.is_empty() && data.iter().all(|b| (0x20..0x7F).contains(b)) {
        String::from_utf8_lossy(data).to_string()
    } else {
        hex::encode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ad_id_renders_ascii() {
        let upid = decode(0x03, b"ABCD0001000H");
        assert_eq!(upid.text, "ABCD0001000H");
        assert_eq!(upid.raw, b"ABCD0001000H");
    }

    #[test]
    fn ti_renders_decimal() {
        let upid = decode(0x07, &0x0000_0001_0000_0000u64.to_be_bytes());
        assert_eq!(upid.text, "4294967296");
    }

    #[test]
    fn uri_renders_text() {
        let upid = decode(0x0E, b"urn:example:break:42");
        assert_eq!(upid.text, "urn:example:break:42");
    }

    #[test]
    fn uuid_renders_canonical() {
        let bytes: Vec<u8> = (0u8..16).collect();
        let upid = decode(0x0F, &bytes);
        assert_eq!(upid.text, "00010203-0405-0607-0809-0a0b0c0d0e0f");
    }

    #[test]
    fn binary_types_keep_lossless_hex() {
        let bytes = [0xDE, 0xAD, 0xBE, 0xEF];
        let upid = decode(0x04, &bytes); // UMID
        assert_eq!(upid.text, "deadbeef");
        assert_eq!(upid.raw, bytes);
    }

    #[test]
    fn non_printable_ascii_falls_back_to_hex() {
        let upid = decode(0x03, &[0x00, 0x01]);
        assert_eq!(upid.text, "0001");
    }

    #[test]
    fn type_names() {
        assert_eq!(upid_type_name(0x03), "Ad-ID");
        assert_eq!(upid_type_name(0x0E), "URI");
        assert_eq!(upid_type_name(0x42), "Reserved");
    }
}
