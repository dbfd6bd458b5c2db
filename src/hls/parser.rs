//! Line-oriented HLS playlist model.
//!
//! The rewriter mutates live variant playlists while preserving every byte it
//! does not own: origin tags, attribute ordering, and PDT strings must survive
//! a rewrite untouched. A normalising parse/serialize cycle cannot guarantee
//! that, so media playlists are modelled as an ordered sequence of tagged
//! lines. Master playlists are read through `m3u8-rs` (they are consumed, not
//! re-emitted).

use crate::error::{MidrollError, Result};
use chrono::{DateTime, FixedOffset};

/// One line of a media playlist, tagged by role.
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    /// `#EXTM3U`, `#EXT-X-VERSION`, `#EXT-X-TARGETDURATION`, and any other
    /// tag the rewriter passes through untouched
    Header(String),
    /// `#EXT-X-PROGRAM-DATE-TIME:<iso>` — the ISO text is kept verbatim
    ProgramDateTime(String),
    /// `#EXTINF:<duration>,[title]`
    Extinf { duration: f64, raw: String },
    /// `#EXT-X-DATERANGE:<attribute-list>` — attributes kept raw; the
    /// SCTE-35 text layer parses them on demand
    DateRange(String),
    /// `#EXT-X-DISCONTINUITY`
    Discontinuity,
    /// A media segment URI
    Uri(String),
    /// Comment or blank line
    Other(String),
}

impl Line {
    /// Render the line exactly as it should appear in the playlist.
    pub fn render(&self) -> &str {
        match self {
            Line::Header(raw) | Line::DateRange(raw) | Line::Other(raw) => raw,
            Line::ProgramDateTime(iso) => iso, // rendered with prefix below
            Line::Extinf { raw, .. } => raw,
            Line::Discontinuity => "#EXT-X-DISCONTINUITY",
            Line::Uri(uri) => uri,
        }
    }
}

/// A parsed media playlist: ordered lines plus enough shape information to
/// reproduce the input byte-for-byte when nothing is rewritten.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub lines: Vec<Line>,
    /// Input ended with a newline; output restores it
    trailing_newline: bool,
}

/// One variant of a master playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub bandwidth_bps: Option<u64>,
    pub resolution: Option<String>,
    pub codecs: Option<String>,
    pub uri: String,
    pub is_video: bool,
}

/// Parse a media playlist into the tagged-line model.
///
/// `\r\n` line endings are normalised to `\n`; everything else is preserved.
pub fn parse_media(text: &str) -> MediaPlaylist {
    let trailing_newline = text.ends_with('\n');
    let mut lines = text
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .map(classify_line)
        .collect::<Vec<_>>();

    // split() yields a final empty element when input ends with '\n'
    if trailing_newline {
        lines.pop();
    }

    MediaPlaylist {
        lines,
        trailing_newline,
    }
}

fn classify_line(line: &str) -> Line {
    if let Some(rest) = line.strip_prefix("#EXT-X-PROGRAM-DATE-TIME:") {
        return Line::ProgramDateTime(rest.trim().to_string());
    }
    if let Some(rest) = line.strip_prefix("#EXTINF:") {
        let duration = rest
            .split(',')
            .next()
            .and_then(|d| d.trim().parse::<f64>().ok())
            .unwrap_or(0.0);
        return Line::Extinf {
            duration,
            raw: line.to_string(),
        };
    }
    if let Some(rest) = line.strip_prefix("#EXT-X-DATERANGE:") {
        return Line::DateRange(rest.to_string());
    }
    if line == "#EXT-X-DISCONTINUITY" {
        return Line::Discontinuity;
    }
    if line.starts_with("#EXT") {
        return Line::Header(line.to_string());
    }
    if line.starts_with('#') || line.trim().is_empty() {
        return Line::Other(line.to_string());
    }
    Line::Uri(line.to_string())
}

impl MediaPlaylist {
    /// Serialize back to playlist text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            match line {
                Line::ProgramDateTime(iso) => {
                    out.push_str("#EXT-X-PROGRAM-DATE-TIME:");
                    out.push_str(iso);
                }
                Line::DateRange(attrs) => {
                    out.push_str("#EXT-X-DATERANGE:");
                    out.push_str(attrs);
                }
                other => out.push_str(other.render()),
            }
        }
        if self.trailing_newline {
            out.push('\n');
        }
        out
    }

    /// Average of the first `sample_cap` EXTINF durations; 2.0 s when the
    /// playlist carries none.
    pub fn average_segment_duration(&self, sample_cap: usize) -> f64 {
        let samples: Vec<f64> = self
            .lines
            .iter()
            .filter_map(|l| match l {
                Line::Extinf { duration, .. } => Some(*duration),
                _ => None,
            })
            .take(sample_cap)
            .collect();

        if samples.is_empty() {
            2.0
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        }
    }

    /// All PDT strings in playlist order.
    pub fn extract_pdts(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                Line::ProgramDateTime(iso) => Some(iso.clone()),
                _ => None,
            })
            .collect()
    }

    /// Sum of all EXTINF durations in seconds.
    pub fn total_duration(&self) -> f64 {
        self.lines
            .iter()
            .filter_map(|l| match l {
                Line::Extinf { duration, .. } => Some(*duration),
                _ => None,
            })
            .sum()
    }

    /// Number of segment URI lines.
    pub fn segment_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| matches!(l, Line::Uri(_)))
            .count()
    }

    /// Legacy ad-break marker: insert a single `EXT-X-DISCONTINUITY` before
    /// the tail segment. Used as the last-resort fallback when a proper
    /// rewrite is infeasible.
    pub fn insert_discontinuity(&mut self) {
        // Find the EXTINF introducing the final segment
        let last_uri = self.lines.iter().rposition(|l| matches!(l, Line::Uri(_)));
        let insert_at = match last_uri {
            Some(uri_idx) => self.lines[..uri_idx]
                .iter()
                .rposition(|l| matches!(l, Line::Extinf { .. }))
                .unwrap_or(uri_idx),
            None => self.lines.len(),
        };
        self.lines.insert(insert_at, Line::Discontinuity);
    }

    /// Check the segment invariant: every URI line is preceded by an EXTINF
    /// with no other URI in between.
    pub fn well_formed(&self) -> bool {
        let mut extinf_pending = false;
        for line in &self.lines {
            match line {
                Line::Extinf { .. } => extinf_pending = true,
                Line::Uri(_) => {
                    if !extinf_pending {
                        return false;
                    }
                    extinf_pending = false;
                }
                _ => {}
            }
        }
        true
    }
}

/// Parse an ISO-8601 PDT string as carried by `EXT-X-PROGRAM-DATE-TIME`.
pub fn parse_pdt(iso: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(iso.trim())
        .map_err(|e| MidrollError::InvalidInput(format!("bad PDT '{iso}': {e}")))
}

/// Format a PDT the way this proxy emits them: UTC, millisecond precision,
/// `Z` suffix.
pub fn format_pdt(dt: DateTime<FixedOffset>) -> String {
    dt.to_utc().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parse a master playlist into its variant list.
///
/// A playlist that parses as a media playlist (or has no variants) yields an
/// empty list. A variant is *video* when it declares a RESOLUTION or its
/// CODECS name a video codec family.
pub fn parse_master(text: &str) -> Result<Vec<Variant>> {
    let playlist = m3u8_rs::parse_playlist_res(text.as_bytes())
        .map_err(|e| MidrollError::InvalidInput(format!("unparseable master playlist: {e:?}")))?;

    let master = match playlist {
        m3u8_rs::Playlist::MasterPlaylist(m) => m,
        m3u8_rs::Playlist::MediaPlaylist(_) => return Ok(Vec::new()),
    };

    Ok(master
        .variants
        .into_iter()
        .map(|v| {
            let resolution = v.resolution.map(|r| format!("{}x{}", r.width, r.height));
            let is_video = resolution.is_some()
                || v.codecs.as_deref().map(codecs_name_video).unwrap_or(false);
            Variant {
                bandwidth_bps: Some(v.bandwidth),
                resolution,
                codecs: v.codecs,
                uri: v.uri,
                is_video,
            }
        })
        .collect())
}

fn codecs_name_video(codecs: &str) -> bool {
    let lower = codecs.to_lowercase();
    lower.contains("avc") || lower.contains("hvc") || lower.contains("vp")
}

/// Rewrite every variant URI of a master playlist through `map`.
///
/// Master playlists are consumed and re-emitted through `m3u8-rs`; unlike
/// media playlists they carry no rewrite-sensitive state, so a normalising
/// round trip is fine here.
pub fn rewrite_master_uris<F>(text: &str, map: F) -> Result<String>
where
    F: Fn(&str) -> String,
{
    let playlist = m3u8_rs::parse_playlist_res(text.as_bytes())
        .map_err(|e| MidrollError::InvalidInput(format!("unparseable master playlist: {e:?}")))?;

    let mut master = match playlist {
        m3u8_rs::Playlist::MasterPlaylist(m) => m,
        m3u8_rs::Playlist::MediaPlaylist(_) => {
            return Err(MidrollError::InvalidInput(
                "expected a master playlist".to_string(),
            ));
        }
    };

    for variant in master.variants.iter_mut() {
        variant.uri = map(&variant.uri);
    }
    for alternative in master.alternatives.iter_mut() {
        if let Some(uri) = alternative.uri.as_mut() {
            *uri = map(uri);
        }
    }

    let mut out = Vec::new();
    master
        .write_to(&mut out)
        .map_err(|e| MidrollError::InternalInvariantViolation(format!("master write: {e}")))?;
    String::from_utf8(out)
        .map_err(|e| MidrollError::InternalInvariantViolation(format!("master utf8: {e}")))
}

/// Distinct video bitrates of a master playlist in kbps, ascending.
/// Variants below 200 kbps and audio-only variants are dropped.
pub fn extract_bitrates(master_text: &str) -> Result<Vec<u64>> {
    let variants = parse_master(master_text)?;
    let mut kbps: Vec<u64> = variants
        .into_iter()
        .filter(|v| v.is_video)
        .filter_map(|v| v.bandwidth_bps)
        .map(|bps| bps / 1000)
        .filter(|&k| k >= 200)
        .collect();
    kbps.sort_unstable();
    kbps.dedup();
    Ok(kbps)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEDIA: &str = "#EXTM3U\n\
#EXT-X-VERSION:6\n\
#EXT-X-TARGETDURATION:4\n\
#EXT-X-MEDIA-SEQUENCE:100\n\
#EXT-X-PROGRAM-DATE-TIME:2025-10-31T12:00:00.000Z\n\
#EXTINF:4.000,\n\
seg100.ts\n\
#EXTINF:4.000,\n\
seg101.ts\n\
#EXT-X-DISCONTINUITY\n\
#EXT-X-PROGRAM-DATE-TIME:2025-10-31T12:00:08.000Z\n\
#EXTINF:3.500,\n\
seg102.ts\n";

    const MASTER: &str = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360,CODECS=\"avc1.4d401e,mp4a.40.2\"\n\
v_800k.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720,CODECS=\"avc1.4d401f,mp4a.40.2\"\n\
v_2500k.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=96000,CODECS=\"mp4a.40.2\"\n\
audio.m3u8\n";

    #[test]
    fn media_roundtrip_preserves_bytes() {
        let playlist = parse_media(MEDIA);
        assert_eq!(playlist.render(), MEDIA);
    }

    #[test]
    fn media_roundtrip_without_trailing_newline() {
        let input = MEDIA.trim_end();
        let playlist = parse_media(input);
        assert_eq!(playlist.render(), input);
    }

    #[test]
    fn crlf_normalised() {
        let crlf = MEDIA.replace('\n', "\r\n");
        let playlist = parse_media(&crlf);
        assert_eq!(playlist.render(), MEDIA);
    }

    #[test]
    fn line_classification() {
        let playlist = parse_media(MEDIA);
        assert!(matches!(playlist.lines[0], Line::Header(_)));
        assert!(matches!(playlist.lines[4], Line::ProgramDateTime(_)));
        assert!(matches!(
            playlist.lines[5],
            Line::Extinf { duration, .. } if duration == 4.0
        ));
        assert!(matches!(playlist.lines[6], Line::Uri(_)));
        assert!(matches!(playlist.lines[9], Line::Discontinuity));
    }

    #[test]
    fn extract_pdts_in_order() {
        let playlist = parse_media(MEDIA);
        assert_eq!(
            playlist.extract_pdts(),
            vec![
                "2025-10-31T12:00:00.000Z".to_string(),
                "2025-10-31T12:00:08.000Z".to_string()
            ]
        );
    }

    #[test]
    fn total_duration_sums_extinf() {
        let playlist = parse_media(MEDIA);
        assert!((playlist.total_duration() - 11.5).abs() < 1e-9);
    }

    #[test]
    fn average_duration_caps_samples() {
        let playlist = parse_media(MEDIA);
        assert!((playlist.average_segment_duration(2) - 4.0).abs() < 1e-9);
        // No EXTINF at all → fallback
        let empty = parse_media("#EXTM3U\n");
        assert!((empty.average_segment_duration(10) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn well_formed_detects_orphan_uri() {
        let playlist = parse_media(MEDIA);
        assert!(playlist.well_formed());

        let broken = parse_media("#EXTM3U\nseg0.ts\n");
        assert!(!broken.well_formed());

        // Two URIs under one EXTINF is also malformed
        let doubled = parse_media("#EXTM3U\n#EXTINF:4.0,\nseg0.ts\nseg1.ts\n");
        assert!(!doubled.well_formed());
    }

    #[test]
    fn insert_discontinuity_before_tail_segment() {
        let mut playlist = parse_media(MEDIA);
        let segments_before = playlist.segment_count();
        playlist.insert_discontinuity();

        assert_eq!(playlist.segment_count(), segments_before);
        assert!(playlist.well_formed());

        let rendered = playlist.render();
        let disc_pos = rendered.rfind("#EXT-X-DISCONTINUITY").unwrap();
        let tail_pos = rendered.rfind("seg102.ts").unwrap();
        assert!(disc_pos < tail_pos);
    }

    #[test]
    fn master_variants_and_video_flag() {
        let variants = parse_master(MASTER).unwrap();
        assert_eq!(variants.len(), 3);
        assert!(variants[0].is_video);
        assert_eq!(variants[0].resolution.as_deref(), Some("640x360"));
        assert!(variants[1].is_video);
        assert!(!variants[2].is_video, "audio-only variant must not be video");
    }

    #[test]
    fn bitrates_sorted_filtered() {
        let kbps = extract_bitrates(MASTER).unwrap();
        // audio (96 kbps, not video) excluded; rest ascending
        assert_eq!(kbps, vec![800, 2500]);
    }

    #[test]
    fn bitrates_dedup() {
        let master = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\nv1.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\nv1b.m3u8\n";
        assert_eq!(extract_bitrates(master).unwrap(), vec![800]);
    }

    #[test]
    fn parse_stability_blank_lines() {
        let master_with_blanks = MASTER.replace(
            "#EXT-X-STREAM-INF:BANDWIDTH=2500000",
            "\n#EXT-X-STREAM-INF:BANDWIDTH=2500000",
        );
        assert_eq!(
            parse_master(MASTER).unwrap().len(),
            parse_master(&master_with_blanks).unwrap().len()
        );
    }

    #[test]
    fn master_uri_rewrite() {
        let out = rewrite_master_uris(MASTER, |uri| format!("/acme/sports/{uri}")).unwrap();
        assert!(out.contains("/acme/sports/v_800k.m3u8"));
        assert!(out.contains("/acme/sports/v_2500k.m3u8"));
        assert!(out.contains("BANDWIDTH=800000"));
    }

    #[test]
    fn pdt_parse_and_format() {
        let dt = parse_pdt("2025-10-31T12:00:08.000Z").unwrap();
        assert_eq!(format_pdt(dt), "2025-10-31T12:00:08.000Z");

        let offset = parse_pdt("2025-10-31T14:00:08.000+02:00").unwrap();
        assert_eq!(format_pdt(offset), "2025-10-31T12:00:08.000Z");

        assert!(parse_pdt("not-a-date").is_err());
    }
}
