//! PTS↔PDT calibration.
//!
//! Live encoders stamp segments with 90 kHz PTS that wraps every ~26.5 h,
//! while the playlist carries wall-clock PDT. The mapper unwraps PTS
//! monotonically and fits an affine `pdt_ms = slope · pts + intercept` over a
//! bounded sample window, so any cue PTS can be placed on the wall clock.
//! A discontinuity invalidates the whole calibration — callers reset on
//! every `EXT-X-DISCONTINUITY`.

use crate::error::Result;
use crate::hls::parser::{format_pdt, parse_pdt};
use crate::metrics;
use chrono::DateTime;
use std::collections::VecDeque;
use tracing::warn;

/// 33-bit PTS modulus
const PTS_MODULUS: i64 = 1 << 33;
/// Half the modulus: threshold for wrap detection
const HALF_MODULUS: i64 = 1 << 32;
/// Bounded calibration window
const MAX_SAMPLES: usize = 32;
/// Nominal 90 kHz slope in ms per tick
const NOMINAL_SLOPE: f64 = 1000.0 / 90_000.0;
/// Drift beyond this is logged
const DRIFT_LOG_THRESHOLD_MS: f64 = 250.0;

#[derive(Debug, Clone, Copy)]
struct Sample {
    unwrapped_pts: i64,
    pdt_ms: i64,
}

/// A predicted wall-clock position for a PTS.
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    pub ms: i64,
    pub iso: String,
}

/// Affine PTS↔PDT calibration model with 33-bit unwrap.
#[derive(Debug, Default)]
pub struct PtsPdtMapper {
    samples: VecDeque<Sample>,
    /// Accumulated unwrap offset in ticks
    offset: i64,
    last_raw: Option<u64>,
    last_drift_ms: Option<f64>,
}

impl PtsPdtMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one observed (PTS, PDT) pair.
    ///
    /// If the model could already predict this PTS, the difference between
    /// prediction and observation is recorded as drift.
    pub fn ingest(&mut self, raw_pts: u64, pdt_iso: &str) -> Result<()> {
        let pdt_ms = parse_pdt(pdt_iso)?.timestamp_millis();

        // Drift against the pre-ingest model
        if let Some(predicted) = self.estimate(raw_pts) {
            let drift = (pdt_ms - predicted.ms) as f64;
            self.last_drift_ms = Some(drift);
            metrics::set_pdt_drift_ms(drift);
            if drift.abs() > DRIFT_LOG_THRESHOLD_MS {
                warn!(
                    "PTS↔PDT drift {:.1} ms at pts {} (predicted {}, observed {})",
                    drift, raw_pts, predicted.iso, pdt_iso
                );
            }
        }

        let unwrapped = self.unwrap(raw_pts);
        self.samples.push_back(Sample {
            unwrapped_pts: unwrapped,
            pdt_ms,
        });
        if self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
        Ok(())
    }

    /// Predict the PDT for a raw PTS. Undefined (None) until a sample exists.
    pub fn estimate(&self, raw_pts: u64) -> Option<Estimate> {
        let last = self.samples.back()?;

        // Align the raw value with the most recent continuity window
        let mut candidate = raw_pts as i64 + self.offset;
        while candidate - last.unwrapped_pts > HALF_MODULUS {
            candidate -= PTS_MODULUS;
        }
        while last.unwrapped_pts - candidate > HALF_MODULUS {
            candidate += PTS_MODULUS;
        }

        let (slope, intercept) = self.fit();
        let ms = (slope * candidate as f64 + intercept).round() as i64;
        let iso = DateTime::from_timestamp_millis(ms).map(|dt| format_pdt(dt.fixed_offset()))?;
        Some(Estimate { ms, iso })
    }

    /// Clear all calibration state. Called on every discontinuity.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.offset = 0;
        self.last_raw = None;
        self.last_drift_ms = None;
    }

    /// Signed drift of the latest ingested sample against its prediction.
    pub fn last_drift_ms(&self) -> Option<f64> {
        self.last_drift_ms
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Monotonic unwrap: a raw value far below the previous one is a forward
    /// wrap, far above it a backward correction.
    fn unwrap(&mut self, raw: u64) -> i64 {
        if let Some(last_raw) = self.last_raw {
            let raw_i = raw as i64;
            let last_i = last_raw as i64;
            if raw_i < last_i - HALF_MODULUS {
                self.offset += PTS_MODULUS;
            } else if raw_i > last_i + HALF_MODULUS {
                self.offset -= PTS_MODULUS;
            }
        }
        self.last_raw = Some(raw);
        raw as i64 + self.offset
    }

    /// Least-squares affine fit; nominal slope with a single sample.
    fn fit(&self) -> (f64, f64) {
        match self.samples.len() {
            0 => (NOMINAL_SLOPE, 0.0),
            1 => {
                let s = self.samples[0];
                (
                    NOMINAL_SLOPE,
                    s.pdt_ms as f64 - NOMINAL_SLOPE * s.unwrapped_pts as f64,
                )
            }
            n => {
                let n_f = n as f64;
                let mean_x = self
                    .samples
                    .iter()
                    .map(|s| s.unwrapped_pts as f64)
                    .sum::<f64>()
                    / n_f;
                let mean_y = self.samples.iter().map(|s| s.pdt_ms as f64).sum::<f64>() / n_f;

                let mut sxx = 0.0;
                let mut sxy = 0.0;
                for s in &self.samples {
                    let dx = s.unwrapped_pts as f64 - mean_x;
                    let dy = s.pdt_ms as f64 - mean_y;
                    sxx += dx * dx;
                    sxy += dx * dy;
                }

                if sxx == 0.0 {
                    // Degenerate: identical PTS values
                    (NOMINAL_SLOPE, mean_y - NOMINAL_SLOPE * mean_x)
                } else {
                    let slope = sxy / sxx;
                    (slope, mean_y - slope * mean_x)
                }
            }
        }
    }
}
