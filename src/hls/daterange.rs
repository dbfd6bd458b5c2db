//! SCTE-35 text layer: `EXT-X-DATERANGE` attribute parsing and ad-break
//! classification.
//!
//! Origin packagers differ widely in how they express splice signalling in
//! DATERANGE attributes, so the scanner is tolerant: a pair it cannot parse
//! is skipped, never fatal. Classification follows the attribute names the
//! ecosystem converged on (`SCTE35-OUT`, `SCTE35-IN`, `SCTE35-CMD`,
//! `X-SEGMENTATION-TYPE`, `X-BREAK-DURATION`) plus a `CLASS` containing
//! `scte35`.

use tracing::debug;

/// A DATERANGE attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// Double-quoted string, unescaped
    Quoted(String),
    /// `0x…` hex byte string, kept verbatim (lowercased)
    Hex(String),
    /// Bare number
    Number(f64),
    /// Bare enum token (`YES`, `NO`, anything unquoted and non-numeric)
    Token(String),
}

impl AttrValue {
    pub fn as_str(&self) -> &str {
        match self {
            AttrValue::Quoted(s) | AttrValue::Hex(s) | AttrValue::Token(s) => s,
            AttrValue::Number(_) => "",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Number(n) => Some(*n),
            AttrValue::Quoted(s) | AttrValue::Token(s) => s.parse().ok(),
            AttrValue::Hex(_) => None,
        }
    }
}

/// How a splice signal entered the playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    SpliceInsert,
    TimeSignal,
    ReturnSignal,
}

/// A splice signal extracted from one DATERANGE line.
///
/// Text-derived fields survive even when the binary payload is corrupt; the
/// binary layer only ever adds information.
#[derive(Debug, Clone, PartialEq)]
pub struct Scte35Signal {
    pub id: String,
    pub kind: SignalKind,
    pub start_date: Option<String>,
    pub pts: Option<u64>,
    pub duration_sec: Option<f64>,
    /// SCTE-35 segmentation_type_id when the origin names one
    pub segmentation_type_id: Option<u8>,
    pub upid: Option<String>,
    pub auto_return: Option<bool>,
    pub segment_num: Option<u8>,
    pub segments_expected: Option<u8>,
    /// Raw `SCTE35-OUT`/`SCTE35-CMD` payload (`0x…` hex, or `YES`)
    pub out_payload: Option<String>,
    /// Raw `SCTE35-IN` payload
    pub in_payload: Option<String>,
}

impl Scte35Signal {
    /// True when this signal opens an ad break.
    pub fn is_ad_break_start(&self) -> bool {
        if self.kind == SignalKind::SpliceInsert {
            return true;
        }
        if let Some(id) = self.segmentation_type_id
            && matches!(id, 0x30 | 0x32 | 0x22 | 0x34 | 0x36)
        {
            return true;
        }
        self.kind == SignalKind::TimeSignal && self.duration_sec.unwrap_or(0.0) > 0.0
    }

    /// True when this signal closes an ad break.
    pub fn is_ad_break_end(&self) -> bool {
        if self.kind == SignalKind::ReturnSignal {
            return true;
        }
        matches!(self.segmentation_type_id, Some(0x23) | Some(0x10))
    }
}

/// Tolerant `KEY=VALUE[,KEY=VALUE…]` scanner.
///
/// Values are double-quoted strings (embedded `\"` allowed), `0x…` hex
/// literals, bare numbers, or bare tokens. Pairs that do not scan are
/// dropped.
pub fn parse_attribute_list(input: &str) -> Vec<(String, AttrValue)> {
    let mut attrs = Vec::new();
    let bytes = input.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        // Key runs to '='
        let key_start = pos;
        while pos < bytes.len() && bytes[pos] != b'=' && bytes[pos] != b',' {
            pos += 1;
        }
        if pos >= bytes.len() || bytes[pos] == b',' {
            // No '=': malformed pair, skip past the comma
            pos += 1;
            continue;
        }
        let key = input[key_start..pos].trim().to_string();
        pos += 1; // consume '='

        if pos < bytes.len() && bytes[pos] == b'"' {
            // Quoted value with escape support
            pos += 1;
            let mut value = String::new();
            let mut closed = false;
            while pos < bytes.len() {
                match bytes[pos] {
                    b'\\' if pos + 1 < bytes.len() && bytes[pos + 1] == b'"' => {
                        value.push('"');
                        pos += 2;
                    }
                    b'"' => {
                        pos += 1;
                        closed = true;
                        break;
                    }
                    _ => match input[pos..].chars().next() {
                        Some(ch) => {
                            value.push(ch);
                            pos += ch.len_utf8();
                        }
                        None => break,
                    },
                }
            }
            if closed && !key.is_empty() {
                attrs.push((key, AttrValue::Quoted(value)));
            } else {
                debug!("Dropping unterminated quoted attribute '{}'", key);
            }
            // Skip to next comma
            while pos < bytes.len() && bytes[pos] != b',' {
                pos += 1;
            }
            pos += 1;
        } else {
            // Bare value runs to the next comma
            let value_start = pos;
            while pos < bytes.len() && bytes[pos] != b',' {
                pos += 1;
            }
            let raw = input[value_start..pos].trim();
            pos += 1;

            if key.is_empty() || raw.is_empty() {
                continue;
            }
            let value = if raw.starts_with("0x") || raw.starts_with("0X") {
                AttrValue::Hex(raw.to_lowercase())
            } else if let Ok(n) = raw.parse::<f64>() {
                AttrValue::Number(n)
            } else {
                AttrValue::Token(raw.to_string())
            };
            attrs.push((key, value));
        }
    }

    attrs
}

fn get<'a>(attrs: &'a [(String, AttrValue)], key: &str) -> Option<&'a AttrValue> {
    attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

/// Whether a DATERANGE attribute list carries SCTE-35 signalling.
pub fn is_scte35_daterange(attrs: &[(String, AttrValue)]) -> bool {
    const MARKERS: [&str; 5] = [
        "SCTE35-CMD",
        "SCTE35-OUT",
        "SCTE35-IN",
        "X-SEGMENTATION-TYPE",
        "X-BREAK-DURATION",
    ];
    if MARKERS.iter().any(|m| get(attrs, m).is_some()) {
        return true;
    }
    get(attrs, "CLASS")
        .map(|c| c.as_str().to_lowercase().contains("scte35"))
        .unwrap_or(false)
}

/// Extract a splice signal from a DATERANGE attribute list.
///
/// Returns `None` when the attributes carry no SCTE-35 signalling or lack
/// an ID.
pub fn signal_from_daterange(attrs: &[(String, AttrValue)]) -> Option<Scte35Signal> {
    if !is_scte35_daterange(attrs) {
        return None;
    }

    let id = get(attrs, "ID")?.as_str().to_string();
    if id.is_empty() {
        return None;
    }

    let in_payload = get(attrs, "SCTE35-IN").map(|v| v.as_str().to_string());
    let out_payload = get(attrs, "SCTE35-OUT")
        .or_else(|| get(attrs, "SCTE35-CMD"))
        .map(|v| v.as_str().to_string());

    let kind = if in_payload.is_some() {
        SignalKind::ReturnSignal
    } else if get(attrs, "SCTE35-OUT").is_some() {
        SignalKind::SpliceInsert
    } else {
        SignalKind::TimeSignal
    };

    let duration_sec = get(attrs, "X-BREAK-DURATION")
        .or_else(|| get(attrs, "DURATION"))
        .or_else(|| get(attrs, "PLANNED-DURATION"))
        .and_then(|v| v.as_f64());

    let segmentation_type_id =
        get(attrs, "X-SEGMENTATION-TYPE").and_then(segmentation_type_from_attr);

    Some(Scte35Signal {
        id,
        kind,
        start_date: get(attrs, "START-DATE").map(|v| v.as_str().to_string()),
        pts: None,
        duration_sec,
        segmentation_type_id,
        upid: get(attrs, "X-UPID").map(|v| v.as_str().to_string()),
        auto_return: get(attrs, "X-AUTO-RETURN").map(|v| v.as_str() == "YES"),
        segment_num: get(attrs, "X-SEGMENT-NUM")
            .and_then(|v| v.as_f64())
            .map(|n| n as u8),
        segments_expected: get(attrs, "X-SEGMENTS-EXPECTED")
            .and_then(|v| v.as_f64())
            .map(|n| n as u8),
        out_payload,
        in_payload,
    })
}

fn segmentation_type_from_attr(value: &AttrValue) -> Option<u8> {
    match value {
        AttrValue::Number(n) => Some(*n as u8),
        AttrValue::Hex(h) => u8::from_str_radix(h.trim_start_matches("0x"), 16).ok(),
        AttrValue::Quoted(s) | AttrValue::Token(s) => {
            if let Ok(n) = s.parse::<u8>() {
                Some(n)
            } else if let Some(hex) = s.strip_prefix("0x") {
                u8::from_str_radix(hex, 16).ok()
            } else {
                segmentation_type_from_name(s)
            }
        }
    }
}

/// Standard segmentation type names, SCTE 35 2023 Table 10.3.3.1.
pub fn segmentation_type_name(id: u8) -> &'static str {
    match id {
        0x00 => "Not Indicated",
        0x01 => "Content Identification",
        0x10 => "Program Start",
        0x11 => "Program End",
        0x12 => "Program Early Termination",
        0x13 => "Program Breakaway",
        0x14 => "Program Resumption",
        0x15 => "Program Runover Planned",
        0x16 => "Program Runover Unplanned",
        0x17 => "Program Overlap Start",
        0x18 => "Program Blackout Override",
        0x19 => "Program Start - In Progress",
        0x20 => "Chapter Start",
        0x21 => "Chapter End",
        0x22 => "Break Start",
        0x23 => "Break End",
        0x24 => "Opening Credit Start",
        0x25 => "Opening Credit End",
        0x26 => "Closing Credit Start",
        0x27 => "Closing Credit End",
        0x30 => "Provider Advertisement Start",
        0x31 => "Provider Advertisement End",
        0x32 => "Distributor Advertisement Start",
        0x33 => "Distributor Advertisement End",
        0x34 => "Provider Placement Opportunity Start",
        0x35 => "Provider Placement Opportunity End",
        0x36 => "Distributor Placement Opportunity Start",
        0x37 => "Distributor Placement Opportunity End",
        0x38 => "Provider Overlay Placement Opportunity Start",
        0x39 => "Provider Overlay Placement Opportunity End",
        0x3A => "Distributor Overlay Placement Opportunity Start",
        0x3B => "Distributor Overlay Placement Opportunity End",
        0x40 => "Unscheduled Event Start",
        0x41 => "Unscheduled Event End",
        0x50 => "Network Start",
        0x51 => "Network End",
        _ => "Reserved",
    }
}

/// Reverse mapping from a standard name (or common short form) to the type id.
pub fn segmentation_type_from_name(name: &str) -> Option<u8> {
    let normalised = name.trim().to_lowercase();
    let id = match normalised.as_str() {
        "program start" => 0x10,
        "program end" => 0x11,
        "break start" => 0x22,
        "break end" => 0x23,
        "provider advertisement start" | "provider ad" | "provider ad start" => 0x30,
        "provider advertisement end" | "provider ad end" => 0x31,
        "distributor advertisement start" | "distributor ad" | "distributor ad start" => 0x32,
        "distributor advertisement end" | "distributor ad end" => 0x33,
        "provider placement opportunity start" | "placement opportunity start" => 0x34,
        "provider placement opportunity end" | "placement opportunity end" => 0x35,
        "distributor placement opportunity start" => 0x36,
        "distributor placement opportunity end" => 0x37,
        "unscheduled event start" => 0x40,
        "unscheduled event end" => 0x41,
        "network start" => 0x50,
        "network end" => 0x51,
        _ => return None,
    };
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_mixed_attribute_forms() {
        let attrs = parse_attribute_list(
            r#"ID="break-1",CLASS="com.example.scte35",DURATION=30.5,SCTE35-OUT=0xFC302000,X-FLAG=YES"#,
        );

        assert_eq!(
            get(&attrs, "ID"),
            Some(&AttrValue::Quoted("break-1".to_string()))
        );
        assert_eq!(get(&attrs, "DURATION"), Some(&AttrValue::Number(30.5)));
        assert_eq!(
            get(&attrs, "SCTE35-OUT"),
            Some(&AttrValue::Hex("0xfc302000".to_string()))
        );
        assert_eq!(
            get(&attrs, "X-FLAG"),
            Some(&AttrValue::Token("YES".to_string()))
        );
    }

    #[test]
    fn quoted_value_with_escaped_quote() {
        let attrs = parse_attribute_list(r#"ID="say \"hi\"",DURATION=1"#);
        assert_eq!(
            get(&attrs, "ID"),
            Some(&AttrValue::Quoted(r#"say "hi""#.to_string()))
        );
        assert_eq!(get(&attrs, "DURATION"), Some(&AttrValue::Number(1.0)));
    }

    #[test]
    fn malformed_pairs_are_skipped() {
        let attrs = parse_attribute_list(r#"GOOD=1,brokentoken,ALSO="fine""#);
        assert_eq!(attrs.len(), 2);
        assert!(get(&attrs, "GOOD").is_some());
        assert!(get(&attrs, "ALSO").is_some());
    }

    #[test]
    fn classification_by_marker_attributes() {
        for marker in [
            "SCTE35-CMD=0xfc00",
            "SCTE35-OUT=0xfc00",
            "SCTE35-IN=0xfc00",
            "X-SEGMENTATION-TYPE=0x30",
            "X-BREAK-DURATION=30",
        ] {
            let attrs = parse_attribute_list(&format!(r#"ID="x",{marker}"#));
            assert!(is_scte35_daterange(&attrs), "marker {marker} not detected");
        }

        let by_class = parse_attribute_list(r#"ID="x",CLASS="urn:scte:scte35:2013""#);
        assert!(is_scte35_daterange(&by_class));

        let interstitial =
            parse_attribute_list(r#"ID="x",CLASS="com.apple.hls.interstitial""#);
        assert!(!is_scte35_daterange(&interstitial));
    }

    #[test]
    fn cue_out_signal_extraction() {
        let attrs = parse_attribute_list(
            r#"ID="evt-7",START-DATE="2025-10-31T12:00:08.000Z",DURATION=8.0,SCTE35-OUT=0xfc302000"#,
        );
        let signal = signal_from_daterange(&attrs).unwrap();

        assert_eq!(signal.id, "evt-7");
        assert_eq!(signal.kind, SignalKind::SpliceInsert);
        assert_eq!(signal.duration_sec, Some(8.0));
        assert_eq!(signal.out_payload.as_deref(), Some("0xfc302000"));
        assert!(signal.is_ad_break_start());
        assert!(!signal.is_ad_break_end());
    }

    #[test]
    fn cue_in_signal_extraction() {
        let attrs = parse_attribute_list(r#"ID="evt-7:done",SCTE35-IN=YES"#);
        let signal = signal_from_daterange(&attrs).unwrap();

        assert_eq!(signal.kind, SignalKind::ReturnSignal);
        assert!(signal.is_ad_break_end());
        assert!(!signal.is_ad_break_start());
    }

    #[test]
    fn time_signal_with_duration_starts_break() {
        let attrs = parse_attribute_list(r#"ID="ts-1",SCTE35-CMD=0xfc00,X-BREAK-DURATION=15"#);
        let signal = signal_from_daterange(&attrs).unwrap();

        assert_eq!(signal.kind, SignalKind::TimeSignal);
        assert!(signal.is_ad_break_start());
    }

    #[test]
    fn segmentation_type_by_name_and_id() {
        let by_name =
            parse_attribute_list(r#"ID="x",X-SEGMENTATION-TYPE="Provider Advertisement Start""#);
        let signal = signal_from_daterange(&by_name).unwrap();
        assert_eq!(signal.segmentation_type_id, Some(0x30));
        assert!(signal.is_ad_break_start());

        let by_id = parse_attribute_list(r#"ID="x",X-SEGMENTATION-TYPE=0x23"#);
        let signal = signal_from_daterange(&by_id).unwrap();
        assert_eq!(signal.segmentation_type_id, Some(0x23));
        assert!(signal.is_ad_break_end());
    }

    #[test]
    fn non_scte35_daterange_yields_no_signal() {
        let attrs = parse_attribute_list(
            r#"ID="chapter-3",CLASS="com.example.chapter",START-DATE="2025-01-01T00:00:00Z""#,
        );
        assert!(signal_from_daterange(&attrs).is_none());
    }

    #[test]
    fn type_names_round_trip() {
        for id in [0x10u8, 0x22, 0x23, 0x30, 0x32, 0x34, 0x36, 0x50] {
            let name = segmentation_type_name(id);
            assert_eq!(segmentation_type_from_name(name), Some(id), "id {id:#x}");
        }
        assert_eq!(segmentation_type_name(0x7F), "Reserved");
    }
}
