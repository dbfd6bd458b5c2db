//! IDR timeline and cue snapping.
//!
//! Splice points must land on encoder I-frames or the player shows a broken
//! GOP at the cut. The timeline records IDR PTS values reported by the
//! encoder and segmenter feeds; `snap` moves a cue PTS to the nearest IDR
//! within a look-ahead budget, optionally falling back to the previous IDR.

use std::collections::{BTreeMap, VecDeque};

/// Bounded capacity; oldest-ingested entries are evicted first
const MAX_ENTRIES: usize = 512;
/// Default look-ahead budget: 2 s of 90 kHz ticks
pub const DEFAULT_LOOK_AHEAD_PTS: u64 = 2 * 90_000;
/// Default snap validation tolerance: 0.5 s
pub const DEFAULT_TOLERANCE_PTS: u64 = 45_000;

/// Where an IDR observation came from. Encoder timestamps win on collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdrSource {
    Encoder,
    Segmenter,
}

/// One observed I-frame.
#[derive(Debug, Clone, PartialEq)]
pub struct IdrFrame {
    pub pts: u64,
    pub time_seconds: f64,
    pub source: IdrSource,
    pub sequence: Option<u64>,
}

/// Why the snapper chose its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapReason {
    /// An IDR sits exactly on the cue
    Exact,
    /// Snapped forward to the next IDR within the look-ahead budget
    Future,
    /// Snapped back to the preceding IDR
    Previous,
    /// No usable IDR; cue passes through unchanged
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapDecision {
    pub cue_pts: u64,
    pub snapped_pts: u64,
    pub reason: SnapReason,
}

/// Validation verdict for a snap decision.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapValidation {
    pub within_tolerance: bool,
    pub error_pts: i64,
    pub error_seconds: f64,
    pub snapped_ahead: bool,
}

/// Ordered IDR record with FIFO eviction.
#[derive(Debug, Default)]
pub struct IdrTimeline {
    by_pts: BTreeMap<u64, IdrFrame>,
    insertion_order: VecDeque<u64>,
}

impl IdrTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge observed frames into the timeline.
    ///
    /// Entries are deduplicated by PTS; an encoder-sourced entry is never
    /// displaced by a segmenter-sourced one.
    pub fn ingest(&mut self, frames: impl IntoIterator<Item = IdrFrame>) {
        for frame in frames {
            match self.by_pts.get(&frame.pts) {
                Some(existing)
                    if existing.source == IdrSource::Encoder
                        && frame.source == IdrSource::Segmenter => {}
                Some(_) => {
                    self.by_pts.insert(frame.pts, frame);
                }
                None => {
                    self.insertion_order.push_back(frame.pts);
                    self.by_pts.insert(frame.pts, frame);
                    while self.by_pts.len() > MAX_ENTRIES {
                        if let Some(oldest) = self.insertion_order.pop_front() {
                            self.by_pts.remove(&oldest);
                        }
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_pts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pts.is_empty()
    }

    /// Snap a cue PTS to the timeline.
    pub fn snap(
        &self,
        cue_pts: u64,
        look_ahead_pts: u64,
        fallback_to_previous: bool,
    ) -> SnapDecision {
        if self.by_pts.is_empty() {
            return SnapDecision {
                cue_pts,
                snapped_pts: cue_pts,
                reason: SnapReason::None,
            };
        }

        // First IDR at or after the cue
        if let Some((&pts, _)) = self.by_pts.range(cue_pts..).next()
            && pts - cue_pts <= look_ahead_pts
        {
            return SnapDecision {
                cue_pts,
                snapped_pts: pts,
                reason: if pts == cue_pts {
                    SnapReason::Exact
                } else {
                    SnapReason::Future
                },
            };
        }

        if fallback_to_previous
            && let Some((&pts, _)) = self.by_pts.range(..cue_pts).next_back()
        {
            return SnapDecision {
                cue_pts,
                snapped_pts: pts,
                reason: SnapReason::Previous,
            };
        }

        SnapDecision {
            cue_pts,
            snapped_pts: cue_pts,
            reason: SnapReason::None,
        }
    }

    /// Judge a snap decision against a tolerance budget.
    pub fn validate(decision: &SnapDecision, tolerance_pts: u64) -> SnapValidation {
        let error_pts = decision.snapped_pts as i64 - decision.cue_pts as i64;
        SnapValidation {
            within_tolerance: error_pts.unsigned_abs() <= tolerance_pts,
            error_pts,
            error_seconds: error_pts as f64 / 90_000.0,
            snapped_ahead: error_pts > 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pts: u64, source: IdrSource) -> IdrFrame {
        IdrFrame {
            pts,
            time_seconds: pts as f64 / 90_000.0,
            source,
            sequence: None,
        }
    }

    fn timeline(ptss: &[u64]) -> IdrTimeline {
        let mut t = IdrTimeline::new();
        t.ingest(ptss.iter().map(|&p| frame(p, IdrSource::Encoder)));
        t
    }

    #[test]
    fn snaps_forward_within_look_ahead() {
        let t = timeline(&[90_000, 180_000, 270_000]);
        let d = t.snap(95_000, 120_000, false);
        assert_eq!(d.snapped_pts, 180_000);
        assert_eq!(d.reason, SnapReason::Future);
    }

    #[test]
    fn exact_hit() {
        let t = timeline(&[90_000, 180_000]);
        let d = t.snap(180_000, 90_000, false);
        assert_eq!(d.snapped_pts, 180_000);
        assert_eq!(d.reason, SnapReason::Exact);
    }

    #[test]
    fn look_ahead_exceeded_without_fallback() {
        let t = timeline(&[90_000, 180_000, 270_000]);
        let d = t.snap(50_000, 30_000, false);
        assert_eq!(d.snapped_pts, 50_000);
        assert_eq!(d.reason, SnapReason::None);
    }

    #[test]
    fn fallback_to_previous() {
        let t = timeline(&[90_000, 180_000, 270_000]);
        let d = t.snap(95_000, 0, true);
        assert_eq!(d.snapped_pts, 90_000);
        assert_eq!(d.reason, SnapReason::Previous);
    }

    #[test]
    fn empty_timeline_passes_cue_through() {
        let t = IdrTimeline::new();
        let d = t.snap(95_000, DEFAULT_LOOK_AHEAD_PTS, true);
        assert_eq!(d.snapped_pts, 95_000);
        assert_eq!(d.reason, SnapReason::None);
    }

    #[test]
    fn encoder_wins_collision() {
        let mut t = IdrTimeline::new();
        t.ingest([frame(90_000, IdrSource::Encoder)]);
        let mut seg = frame(90_000, IdrSource::Segmenter);
        seg.time_seconds = 99.0;
        t.ingest([seg]);

        assert_eq!(t.len(), 1);
        assert_eq!(t.by_pts[&90_000].source, IdrSource::Encoder);

        // Encoder replaces segmenter
        let mut t = IdrTimeline::new();
        t.ingest([frame(90_000, IdrSource::Segmenter)]);
        t.ingest([frame(90_000, IdrSource::Encoder)]);
        assert_eq!(t.by_pts[&90_000].source, IdrSource::Encoder);
    }

    #[test]
    fn capacity_evicts_oldest_ingested() {
        let mut t = IdrTimeline::new();
        t.ingest((0..(MAX_ENTRIES as u64 + 8)).map(|i| frame(i * 3_000, IdrSource::Encoder)));

        assert_eq!(t.len(), MAX_ENTRIES);
        // The first eight entries are gone
        assert!(!t.by_pts.contains_key(&0));
        assert!(!t.by_pts.contains_key(&(7 * 3_000)));
        assert!(t.by_pts.contains_key(&(8 * 3_000)));
    }

    #[test]
    fn validation_tolerance() {
        let t = timeline(&[90_000, 180_000]);

        let d = t.snap(170_000, DEFAULT_LOOK_AHEAD_PTS, false);
        let v = IdrTimeline::validate(&d, DEFAULT_TOLERANCE_PTS);
        assert!(v.within_tolerance);
        assert_eq!(v.error_pts, 10_000);
        assert!(v.snapped_ahead);
        assert!((v.error_seconds - 0.111).abs() < 1e-3);

        let d = t.snap(95_000, 0, true);
        let v = IdrTimeline::validate(&d, DEFAULT_TOLERANCE_PTS);
        assert!(v.within_tolerance);
        assert_eq!(v.error_pts, -5_000);
        assert!(!v.snapped_ahead);
    }

    #[test]
    fn validation_flags_excessive_error() {
        let t = timeline(&[0, 900_000]);
        // Cue at 100_000 snaps forward 800_000 ticks (~8.9 s)
        let d = t.snap(100_000, 1_000_000, false);
        let v = IdrTimeline::validate(&d, DEFAULT_TOLERANCE_PTS);
        assert!(!v.within_tolerance);
        assert!(v.snapped_ahead);
    }
}
