//! Segmenter/transcoder timing feed.
//!
//! The packager-side segmenter POSTs observed IDR frames and PTS↔PDT pairs
//! here; the rewrite pipeline reads them when snapping cues and predicting
//! wall-clock positions. A `reset` flag accompanies encoder discontinuities
//! and clears the channel's calibration.

use crate::server::state::AppState;
use crate::timing::idr::{IdrFrame, IdrSource};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
pub struct TimelineFeed {
    #[serde(default)]
    pub idr_frames: Vec<IdrFrameWire>,
    #[serde(default)]
    pub pts_samples: Vec<PtsSampleWire>,
    /// Encoder discontinuity: drop the channel's PTS↔PDT calibration
    #[serde(default)]
    pub reset: bool,
}

#[derive(Debug, Deserialize)]
pub struct IdrFrameWire {
    pub pts: u64,
    pub time_seconds: f64,
    /// `encoder` or `segmenter`
    pub source: String,
    #[serde(default)]
    pub sequence: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PtsSampleWire {
    pub pts: u64,
    /// ISO-8601 UTC
    pub pdt: String,
}

#[derive(Debug, Serialize)]
pub struct TimelineAck {
    pub accepted_frames: usize,
    pub accepted_samples: usize,
    pub reset: bool,
}

/// Ingest one timing batch for a channel.
pub async fn ingest_timeline(
    Path(channel_id): Path<String>,
    State(state): State<AppState>,
    Json(feed): Json<TimelineFeed>,
) -> Json<TimelineAck> {
    let timing = state.rewriter.timing.channel(&channel_id);
    let mut guard = timing.lock().await;

    if feed.reset {
        debug!("Timeline reset for channel {channel_id}");
        guard.mapper.reset();
    }

    let frames: Vec<IdrFrame> = feed
        .idr_frames
        .iter()
        .filter_map(|f| {
            let source = match f.source.as_str() {
                "encoder" => IdrSource::Encoder,
                "segmenter" => IdrSource::Segmenter,
                other => {
                    warn!("Dropping IDR frame with unknown source '{other}'");
                    return None;
                }
            };
            Some(IdrFrame {
                pts: f.pts,
                time_seconds: f.time_seconds,
                source,
                sequence: f.sequence,
            })
        })
        .collect();
    let accepted_frames = frames.len();
    guard.idr.ingest(frames);

    let mut accepted_samples = 0;
    for sample in &feed.pts_samples {
        match guard.mapper.ingest(sample.pts, &sample.pdt) {
            Ok(()) => accepted_samples += 1,
            Err(e) => warn!("Dropping PTS sample for channel {channel_id}: {e}"),
        }
    }

    debug!(
        "Timeline for {channel_id}: +{accepted_frames} IDR(s), +{accepted_samples} sample(s)"
    );
    Json(TimelineAck {
        accepted_frames,
        accepted_samples,
        reset: feed.reset,
    })
}
