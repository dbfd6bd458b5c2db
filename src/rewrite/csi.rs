//! Client-side interstitial injection.
//!
//! CSI leaves the origin's segments untouched and annotates the playlist
//! with `EXT-X-DATERANGE` interstitial cues (`CLASS="com.apple.hls.
//! interstitial"`); a capable player fetches the ad asset itself and returns
//! to content on its own. Legacy `EXT-X-CUE-OUT`/`EXT-X-CUE-IN` tags ride
//! along for players that predate DATERANGE interstitials.

use crate::hls::parser::{Line, MediaPlaylist, format_pdt, parse_pdt};
use chrono::Duration;
use tracing::debug;

/// Default playout restriction handed to interstitial players
pub const DEFAULT_PLAYOUT_CONTROLS: &str = "skip-restrictions=6";

/// Everything needed to write one interstitial cue pair.
#[derive(Debug, Clone)]
pub struct CsiCue<'a> {
    pub id: &'a str,
    /// ISO-8601 UTC break start
    pub start_date: &'a str,
    pub duration_sec: f64,
    /// Signed master playlist of the pod
    pub asset_uri: &'a str,
    /// Caller override for X-PLAYOUT-CONTROLS
    pub playout_controls: Option<&'a str>,
    /// Normalised `0x…` payloads (see [`normalise_scte35_payload`])
    pub scte35_out: Option<String>,
    pub scte35_in: Option<String>,
}

/// Normalise a textual SCTE-35 payload for emission: hex is lowercased,
/// the `YES`/`NO` enum form expands to `0x0`.
pub fn normalise_scte35_payload(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("YES") || trimmed.eq_ignore_ascii_case("NO") {
        return "0x0".to_string();
    }
    if trimmed.starts_with("0x") || trimmed.starts_with("0X") {
        return trimmed.to_lowercase();
    }
    // Bare hex bytes
    format!("0x{}", trimmed.to_lowercase())
}

/// Inject the interstitial cue pair plus legacy CUE tags.
///
/// The cue lands immediately after the marker PDT when one is known,
/// otherwise near the tail (six lines back, nudged so an EXTINF/URI pair is
/// never split).
pub fn inject_interstitial(
    playlist: &mut MediaPlaylist,
    marker_line_index: Option<usize>,
    cue: &CsiCue,
) {
    let at = insertion_point(playlist, marker_line_index);
    debug!(
        "CSI: injecting interstitial '{}' at line {} (duration {:.3}s)",
        cue.id, at, cue.duration_sec
    );

    let cue_in_start = parse_pdt(cue.start_date)
        .map(|start| {
            format_pdt(start + Duration::milliseconds((cue.duration_sec * 1000.0).round() as i64))
        })
        .unwrap_or_else(|_| cue.start_date.to_string());

    let mut cue_out = format!(
        "ID=\"{}\",CLASS=\"com.apple.hls.interstitial\",START-DATE=\"{}\",DURATION={:.3},X-ASSET-URI=\"{}\",X-PLAYOUT-CONTROLS=\"{}\"",
        cue.id,
        cue.start_date,
        cue.duration_sec,
        cue.asset_uri,
        cue.playout_controls.unwrap_or(DEFAULT_PLAYOUT_CONTROLS),
    );
    if let Some(out_hex) = &cue.scte35_out {
        cue_out.push_str(&format!(",SCTE35-OUT={out_hex}"));
    }

    let cue_in = format!(
        "ID=\"{}:complete\",CLASS=\"com.apple.hls.interstitial\",START-DATE=\"{}\",DURATION=0.000,SCTE35-IN={},END-ON-NEXT=YES",
        cue.id,
        cue_in_start,
        cue.scte35_in.as_deref().unwrap_or("0x0"),
    );

    let mut legacy_cue_out = format!("#EXT-X-CUE-OUT:DURATION={:.3}", cue.duration_sec);
    if let Some(out_hex) = &cue.scte35_out {
        legacy_cue_out.push_str(&format!(",SCTE35={out_hex}"));
    }

    let inserted = [
        Line::DateRange(cue_out),
        Line::Header(legacy_cue_out),
        Line::DateRange(cue_in),
        Line::Header("#EXT-X-CUE-IN".to_string()),
    ];
    for (offset, line) in inserted.into_iter().enumerate() {
        playlist.lines.insert(at + offset, line);
    }
}

/// Resolve where the cue lines go: after the marker PDT, or near the tail.
fn insertion_point(playlist: &MediaPlaylist, marker_line_index: Option<usize>) -> usize {
    if let Some(marker) = marker_line_index
        && marker < playlist.lines.len()
    {
        return marker + 1;
    }

    let mut at = playlist.lines.len().saturating_sub(6);
    // Never split an EXTINF from its URI
    while at > 0 && matches!(playlist.lines.get(at - 1), Some(Line::Extinf { .. })) {
        at -= 1;
    }
    at
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::parser::parse_media;

    const ORIGIN: &str = "#EXTM3U\n\
#EXT-X-VERSION:6\n\
#EXT-X-TARGETDURATION:4\n\
#EXT-X-PROGRAM-DATE-TIME:2025-10-31T12:00:08.000Z\n\
#EXTINF:4.000,\n\
seg100.ts\n\
#EXTINF:4.000,\n\
seg101.ts\n";

    fn cue<'a>(asset_uri: &'a str) -> CsiCue<'a> {
        CsiCue {
            id: "evt-7",
            start_date: "2025-10-31T12:00:08.000Z",
            duration_sec: 8.0,
            asset_uri,
            playout_controls: None,
            scte35_out: Some("0xfc302000".to_string()),
            scte35_in: None,
        }
    }

    #[test]
    fn injects_cue_pair_after_marker() {
        let mut playlist = parse_media(ORIGIN);
        inject_interstitial(
            &mut playlist,
            Some(3),
            &cue("https://ads.example.com/pod.m3u8?token=t&exp=1"),
        );

        let text = playlist.render();
        assert!(text.contains(
            "#EXT-X-DATERANGE:ID=\"evt-7\",CLASS=\"com.apple.hls.interstitial\",\
START-DATE=\"2025-10-31T12:00:08.000Z\",DURATION=8.000,\
X-ASSET-URI=\"https://ads.example.com/pod.m3u8?token=t&exp=1\",\
X-PLAYOUT-CONTROLS=\"skip-restrictions=6\",SCTE35-OUT=0xfc302000"
        ));
        assert!(text.contains(
            "#EXT-X-DATERANGE:ID=\"evt-7:complete\",CLASS=\"com.apple.hls.interstitial\",\
START-DATE=\"2025-10-31T12:00:16.000Z\",DURATION=0.000,SCTE35-IN=0x0,END-ON-NEXT=YES"
        ));
        assert!(text.contains("#EXT-X-CUE-OUT:DURATION=8.000,SCTE35=0xfc302000"));
        assert!(text.contains("#EXT-X-CUE-IN"));

        // Cues land right after the marker PDT
        let marker_pos = text.find("PROGRAM-DATE-TIME").unwrap();
        let cue_pos = text.find("interstitial").unwrap();
        assert!(cue_pos > marker_pos);

        // Content untouched
        assert!(text.contains("seg100.ts"));
        assert!(text.contains("seg101.ts"));
        assert!(playlist.well_formed());
    }

    #[test]
    fn tail_insertion_without_marker() {
        let mut playlist = parse_media(ORIGIN);
        inject_interstitial(&mut playlist, None, &cue("https://a/p.m3u8"));

        assert!(playlist.well_formed());
        let text = playlist.render();
        assert!(text.contains("com.apple.hls.interstitial"));
    }

    #[test]
    fn playout_controls_override() {
        let mut playlist = parse_media(ORIGIN);
        let mut c = cue("https://a/p.m3u8");
        c.playout_controls = Some("skip-restrictions=0");
        inject_interstitial(&mut playlist, Some(3), &c);

        assert!(
            playlist
                .render()
                .contains("X-PLAYOUT-CONTROLS=\"skip-restrictions=0\"")
        );
    }

    #[test]
    fn omits_scte35_out_when_absent() {
        let mut playlist = parse_media(ORIGIN);
        let mut c = cue("https://a/p.m3u8");
        c.scte35_out = None;
        inject_interstitial(&mut playlist, Some(3), &c);

        let text = playlist.render();
        assert!(!text.contains("SCTE35-OUT"));
        assert!(text.contains("#EXT-X-CUE-OUT:DURATION=8.000\n"));
    }

    #[test]
    fn payload_normalisation() {
        assert_eq!(normalise_scte35_payload("YES"), "0x0");
        assert_eq!(normalise_scte35_payload("no"), "0x0");
        assert_eq!(normalise_scte35_payload("0XFC302F00"), "0xfc302f00");
        assert_eq!(normalise_scte35_payload("fc30"), "0xfc30");
    }
}
