//! Skip-plan calculation: how many origin segments an ad break replaces and
//! where content resumes.
//!
//! Skipping is PDT-driven. The marker PDT anchors the break start; segments
//! are consumed until the break duration is covered (ceil semantics — the
//! segment that crosses the boundary is taken) or a pinned skip count is
//! reached. The resume PDT is the origin's own tag whenever one survives in
//! the window; a computed timestamp is strictly a fallback, because an
//! invented PDT that disagrees with the origin's clock desyncs every player
//! that keys subtitles or seeking off wall time.

use crate::hls::parser::{Line, MediaPlaylist, format_pdt, parse_pdt};
use chrono::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SkipPlanError {
    #[error("marker line carries no program date time")]
    MarkerNotFound,
    #[error("nothing to skip for this break")]
    NoSegmentsToSkip,
    #[error("live window rolled out past the break")]
    WindowRolledOut,
}

impl SkipPlanError {
    /// Stable reason code for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            SkipPlanError::MarkerNotFound => "marker_not_found",
            SkipPlanError::NoSegmentsToSkip => "no_segments_to_skip",
            SkipPlanError::WindowRolledOut => "window_rolled_out",
        }
    }
}

/// What bounds the skip walk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipTarget {
    /// SCTE-35 break duration in seconds; first request computes this
    Duration(f64),
    /// Pinned count from the break state store; all later requests use this
    StableCount(usize),
}

/// The rewrite recipe produced for one break on one playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct SkipPlan {
    pub marker_line_index: usize,
    /// First line index considered for skipping
    pub skip_start_index: usize,
    /// First line index of resumed content
    pub resume_content_index: usize,
    pub segments_skipped: usize,
    pub duration_skipped: f64,
    /// Resume wall-clock position: origin tag text (trimmed) or computed
    pub resume_pdt: String,
    pub resume_pdt_synthesised: bool,
    pub remaining_segments: usize,
    pub stable_skip_count_used: bool,
    /// URI lines passed over while searching for the origin resume PDT
    pub segments_searched_for_pdt: usize,
}

/// Compute the skip plan for a break anchored at `marker_line_index`.
///
/// `pdt_search_cap` optionally bounds the number of lines scanned for the
/// origin resume PDT; the default scans the whole remainder.
pub fn compute_skip_plan(
    playlist: &MediaPlaylist,
    marker_line_index: usize,
    target: SkipTarget,
    pdt_search_cap: Option<usize>,
) -> Result<SkipPlan, SkipPlanError> {
    let marker_pdt_text = match playlist.lines.get(marker_line_index) {
        Some(Line::ProgramDateTime(iso)) => iso.trim(),
        _ => return Err(SkipPlanError::MarkerNotFound),
    };
    let marker_pdt = parse_pdt(marker_pdt_text).map_err(|_| SkipPlanError::MarkerNotFound)?;

    match target {
        SkipTarget::Duration(d) if d <= 0.0 => return Err(SkipPlanError::NoSegmentsToSkip),
        SkipTarget::StableCount(0) => return Err(SkipPlanError::NoSegmentsToSkip),
        _ => {}
    }

    let skip_start_index = marker_line_index + 1;
    let mut segments_skipped = 0usize;
    let mut duration_skipped = 0.0f64;
    let mut pending_extinf = 0.0f64;
    let mut resume_content_index = playlist.lines.len();

    let mut idx = skip_start_index;
    while idx < playlist.lines.len() {
        match &playlist.lines[idx] {
            Line::Extinf { duration, .. } => pending_extinf = *duration,
            Line::Uri(_) => {
                segments_skipped += 1;
                duration_skipped += pending_extinf;
                pending_extinf = 0.0;

                let satisfied = match target {
                    SkipTarget::Duration(d) => duration_skipped >= d,
                    SkipTarget::StableCount(n) => segments_skipped >= n,
                };
                if satisfied {
                    resume_content_index = idx + 1;
                    break;
                }
            }
            _ => {}
        }
        idx += 1;
    }

    if segments_skipped == 0 {
        // The live window has already rolled past the break
        return Err(SkipPlanError::WindowRolledOut);
    }

    // Prefer the origin's own PDT for the resume point
    let mut resume_pdt = None;
    let mut segments_searched_for_pdt = 0usize;
    let search_end = pdt_search_cap
        .map(|cap| (resume_content_index + cap).min(playlist.lines.len()))
        .unwrap_or(playlist.lines.len());

    for (j, line) in playlist
        .lines
        .iter()
        .enumerate()
        .take(search_end)
        .skip(resume_content_index)
    {
        match line {
            Line::ProgramDateTime(iso) => {
                resume_pdt = Some((j, iso.trim().to_string()));
                break;
            }
            Line::Uri(_) => segments_searched_for_pdt += 1,
            _ => {}
        }
    }

    let (resume_content_index, resume_pdt, resume_pdt_synthesised) = match resume_pdt {
        Some((pdt_index, iso)) => (pdt_index + 1, iso, false),
        None => {
            let computed =
                marker_pdt + Duration::milliseconds((duration_skipped * 1000.0).round() as i64);
            (resume_content_index, format_pdt(computed), true)
        }
    };

    let remaining_segments = playlist.lines[resume_content_index..]
        .iter()
        .filter(|l| matches!(l, Line::Uri(_)))
        .count();

    if remaining_segments == 0 {
        return Err(SkipPlanError::WindowRolledOut);
    }

    Ok(SkipPlan {
        marker_line_index,
        skip_start_index,
        resume_content_index,
        segments_skipped,
        duration_skipped,
        resume_pdt,
        resume_pdt_synthesised,
        remaining_segments,
        stable_skip_count_used: matches!(target, SkipTarget::StableCount(_)),
        segments_searched_for_pdt,
    })
}
