//! Server-side splice: replace skipped origin segments with pod items.
//!
//! The splice keeps the origin's bytes on both sides of the break. Ad
//! segments carry no PDT of their own — a synthetic wall-clock stamp on ad
//! media would lie to the player; the bracketing discontinuities reset its
//! timeline instead. Discontinuities are omitted entirely when content and
//! ads share a container (fMP4 both sides with matching codecs), because a
//! needless discontinuity forces a decoder flush on every break.

use crate::adbreak::skip::SkipPlan;
use crate::hls::parser::{Line, MediaPlaylist};
use tracing::debug;

/// One ad entry as it will appear in the spliced playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct AdEntry {
    /// Fully signed URI
    pub uri: String,
    pub duration_sec: f64,
}

/// Telemetry attributes for the closing return DATERANGE.
#[derive(Debug, Clone, Default)]
pub struct ReturnTelemetry {
    /// Planned (signalled) break duration
    pub planned_duration_sec: f64,
    /// e.g. `"future:+0.111s"` from the IDR snapper
    pub boundary_snap: Option<String>,
    /// e.g. `"ok"`, `"crc-invalid"`
    pub cue_status: Option<String>,
    pub pid_continuity: Option<bool>,
}

/// Container classes that matter for discontinuity decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    MpegTs,
    Fmp4,
    Unknown,
}

fn container_of(uri: &str) -> Container {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    match path.rsplit('.').next().map(|e| e.to_ascii_lowercase()) {
        Some(ext) if ext == "ts" => Container::MpegTs,
        Some(ext) if matches!(ext.as_str(), "m4s" | "mp4" | "cmfv" | "cmfa") => Container::Fmp4,
        _ => Container::Unknown,
    }
}

/// Whether content and ad segments share a container class.
///
/// Only a confirmed fMP4-to-fMP4 match suppresses the discontinuities; an
/// unknown extension keeps them.
pub fn containers_match(content_uri: &str, ad_uri: &str) -> bool {
    container_of(content_uri) == Container::Fmp4 && container_of(ad_uri) == Container::Fmp4
}

/// Splice `ads` into the playlist per `plan`.
///
/// Layout, in order: origin lines through the marker PDT, opening
/// discontinuity (conditional), ad entries, closing discontinuity
/// (conditional), the resume PDT from the plan, the return DATERANGE, then
/// the origin lines from `plan.resume_content_index`.
pub fn splice_pod(
    playlist: &MediaPlaylist,
    plan: &SkipPlan,
    ads: &[AdEntry],
    break_id: &str,
    telemetry: &ReturnTelemetry,
) -> MediaPlaylist {
    let emit_discontinuity = !ads_match_content(playlist, plan, ads);
    let mut out = playlist.clone();
    let mut lines = Vec::with_capacity(playlist.lines.len() + ads.len() * 2 + 4);

    // Origin head, marker PDT included
    lines.extend_from_slice(&playlist.lines[..=plan.marker_line_index]);

    if emit_discontinuity {
        lines.push(Line::Discontinuity);
    }

    let mut ad_total = 0.0;
    for ad in ads {
        ad_total += ad.duration_sec;
        lines.push(Line::Extinf {
            duration: ad.duration_sec,
            raw: format!("#EXTINF:{:.3},", ad.duration_sec),
        });
        lines.push(Line::Uri(ad.uri.clone()));
    }

    if emit_discontinuity {
        lines.push(Line::Discontinuity);
    }

    lines.push(Line::ProgramDateTime(plan.resume_pdt.clone()));
    lines.push(Line::DateRange(return_daterange(
        break_id, plan, ad_total, telemetry,
    )));

    lines.extend_from_slice(&playlist.lines[plan.resume_content_index..]);

    debug!(
        "SSAI: spliced {} ad(s) over {} segment(s), discontinuities {}",
        ads.len(),
        plan.segments_skipped,
        if emit_discontinuity { "emitted" } else { "omitted" }
    );

    out.lines = lines;
    out
}

fn ads_match_content(playlist: &MediaPlaylist, plan: &SkipPlan, ads: &[AdEntry]) -> bool {
    let first_skipped_uri = playlist.lines[plan.skip_start_index..]
        .iter()
        .find_map(|l| match l {
            Line::Uri(uri) => Some(uri.as_str()),
            _ => None,
        });
    match (first_skipped_uri, ads.first()) {
        (Some(content), Some(ad)) => containers_match(content, &ad.uri),
        _ => false,
    }
}

fn return_daterange(
    break_id: &str,
    plan: &SkipPlan,
    ad_total: f64,
    telemetry: &ReturnTelemetry,
) -> String {
    let duration_error = ad_total - plan.duration_skipped;
    let mut attrs = format!(
        "ID=\"{}-return\",CLASS=\"com.apple.hls.scte35.in\",SCTE35-IN=YES,DURATION=0.000,\
X-PLANNED-DURATION={:.3},X-ACTUAL-AD-DURATION={:.3},X-ACTUAL-CONTENT-DURATION={:.3},\
X-DURATION-ERROR={:.3}",
        break_id, telemetry.planned_duration_sec, ad_total, plan.duration_skipped, duration_error,
    );
    if let Some(snap) = &telemetry.boundary_snap {
        attrs.push_str(&format!(",X-BOUNDARY-SNAP=\"{snap}\""));
    }
    if let Some(status) = &telemetry.cue_status {
        attrs.push_str(&format!(",X-CUE-STATUS=\"{status}\""));
    }
    if let Some(pid) = telemetry.pid_continuity {
        attrs.push_str(&format!(
            ",X-PID-CONTINUITY={}",
            if pid { "YES" } else { "NO" }
        ));
    }
    attrs
}
