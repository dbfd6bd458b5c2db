//! Tracking beacons.
//!
//! The rewriter reports ad delivery as structured beacon messages; delivery
//! itself is fire-and-forget HTTP with a short timeout, best effort, no
//! retries. Consumers are expected to deduplicate on `event|ad_id|ts_ms`,
//! so the proxy is free to emit at-least-once.
//!
//! Quartile progress is derived from wall-clock progress through the break:
//! each playlist poll advances a per-break progress cursor and fires the
//! thresholds crossed since the previous poll.

use crate::decision::{Pod, PodTracking};
use crate::metrics;
use dashmap::DashMap;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BeaconEvent {
    Imp,
    Q1,
    Mid,
    Q3,
    Complete,
    Click,
    Error,
}

impl BeaconEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeaconEvent::Imp => "imp",
            BeaconEvent::Q1 => "q1",
            BeaconEvent::Mid => "mid",
            BeaconEvent::Q3 => "q3",
            BeaconEvent::Complete => "complete",
            BeaconEvent::Click => "click",
            BeaconEvent::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BeaconMetadata {
    pub variant: String,
    pub bitrate_bps: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vast_ad_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vast_creative_id: Option<String>,
}

/// The beacon message contract.
#[derive(Debug, Clone, Serialize)]
pub struct BeaconMessage {
    pub event: BeaconEvent,
    pub ad_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_id: Option<String>,
    pub channel: String,
    pub ts_ms: i64,
    pub tracker_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BeaconMetadata>,
}

impl BeaconMessage {
    /// At-least-once dedup key for the consumer.
    pub fn dedup_key(&self) -> String {
        format!("{}|{}|{}", self.event.as_str(), self.ad_id, self.ts_ms)
    }
}

/// Tracker URLs for an event, out of a pod's tracking block.
pub fn tracker_urls(tracking: Option<&PodTracking>, event: BeaconEvent) -> Vec<String> {
    let Some(t) = tracking else {
        return Vec::new();
    };
    match event {
        BeaconEvent::Imp => {
            let mut urls = t.impressions.clone();
            urls.extend(t.quartiles.start.iter().cloned());
            urls
        }
        BeaconEvent::Q1 => t.quartiles.first_quartile.clone(),
        BeaconEvent::Mid => t.quartiles.midpoint.clone(),
        BeaconEvent::Q3 => t.quartiles.third_quartile.clone(),
        BeaconEvent::Complete => t.quartiles.complete.clone(),
        BeaconEvent::Click => t.clicks.clone(),
        BeaconEvent::Error => t.errors.clone(),
    }
}

/// Quartile events whose thresholds fall in `(prev, now]`.
///
/// Threshold-crossing semantics: an event fires on the first poll whose
/// progress crosses its boundary, so every quartile fires exactly once per
/// break no matter how often the playlist is polled.
pub fn events_crossed(prev: f64, now: f64) -> Vec<BeaconEvent> {
    const THRESHOLDS: [(f64, BeaconEvent); 4] = [
        (0.25, BeaconEvent::Q1),
        (0.50, BeaconEvent::Mid),
        (0.75, BeaconEvent::Q3),
        (1.0, BeaconEvent::Complete),
    ];
    THRESHOLDS
        .iter()
        .filter(|(threshold, _)| prev < *threshold && now >= *threshold)
        .map(|(_, event)| *event)
        .collect()
}

/// Per-break progress cursor driving quartile emission.
#[derive(Clone, Default)]
pub struct QuartileTracker {
    progress: Arc<DashMap<String, (std::time::Instant, f64)>>,
}

impl QuartileTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a break the first time it is observed locally. Returns true
    /// exactly once per break key; the caller fires impressions on it.
    pub fn begin(&self, break_key: &str) -> bool {
        let mut first = false;
        self.progress
            .entry(break_key.to_string())
            .or_insert_with(|| {
                first = true;
                (std::time::Instant::now(), 0.0)
            });
        first
    }

    /// Advance a break's cursor to `progress` (0..=1) and return the events
    /// crossed since the previous poll.
    ///
    /// The cursor is retained at completion so a late poll neither re-fires
    /// quartiles nor re-triggers the impression; `purge_stale` reclaims it.
    pub fn advance(&self, break_key: &str, progress: f64) -> Vec<BeaconEvent> {
        let progress = progress.clamp(0.0, 1.0);
        let prev = self
            .progress
            .get(break_key)
            .map(|p| p.1)
            .unwrap_or(0.0);

        if progress <= prev {
            return Vec::new();
        }

        let events = events_crossed(prev, progress);
        self.progress
            .insert(break_key.to_string(), (std::time::Instant::now(), progress));
        events
    }

    /// Drop cursors untouched for longer than `max_age`. Driven by the
    /// server's periodic cleanup task.
    pub fn purge_stale(&self, max_age: Duration) -> usize {
        let before = self.progress.len();
        self.progress
            .retain(|_, (touched, _)| touched.elapsed() < max_age);
        before - self.progress.len()
    }
}

/// Fire-and-forget HTTP beacon transport.
#[derive(Clone)]
pub struct HttpBeaconSink {
    client: Client,
}

impl HttpBeaconSink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Deliver one beacon: a GET per tracker URL, spawned, never awaited by
    /// the request path. No retries — best effort.
    pub fn deliver(&self, message: &BeaconMessage) {
        debug!(
            "Beacon {} for ad {} ({} tracker(s))",
            message.event.as_str(),
            message.ad_id,
            message.tracker_urls.len()
        );
        for url in &message.tracker_urls {
            let client = self.client.clone();
            let url = url.clone();
            let event = message.event.as_str();
            tokio::spawn(async move {
                match client
                    .get(&url)
                    .timeout(Duration::from_secs(2))
                    .send()
                    .await
                {
                    Ok(resp) => {
                        debug!("Beacon {} -> {} ({})", event, url, resp.status());
                        metrics::record_beacon(event, "success");
                    }
                    Err(e) => {
                        warn!("Beacon {} failed: {}", event, e);
                        metrics::record_beacon(event, "error");
                    }
                }
            });
        }
    }
}

/// Build the impression message for one pod item.
pub fn impression_for(
    pod: &Pod,
    ad_id: &str,
    channel: &str,
    variant: &str,
    bitrate_bps: u64,
    ts_ms: i64,
) -> BeaconMessage {
    BeaconMessage {
        event: BeaconEvent::Imp,
        ad_id: ad_id.to_string(),
        pod_id: Some(pod.pod_id.clone()),
        channel: channel.to_string(),
        ts_ms,
        tracker_urls: tracker_urls(pod.tracking.as_ref(), BeaconEvent::Imp),
        metadata: Some(BeaconMetadata {
            variant: variant.to_string(),
            bitrate_bps,
            vast_ad_id: None,
            vast_creative_id: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Quartiles;

    fn tracking() -> PodTracking {
        PodTracking {
            impressions: vec!["http://t/imp".to_string()],
            quartiles: Quartiles {
                start: vec!["http://t/start".to_string()],
                first_quartile: vec!["http://t/q1".to_string()],
                midpoint: vec!["http://t/mid".to_string()],
                third_quartile: vec!["http://t/q3".to_string()],
                complete: vec!["http://t/complete".to_string()],
            },
            clicks: vec![],
            errors: vec!["http://t/error".to_string()],
        }
    }

    #[test]
    fn dedup_key_format() {
        let msg = BeaconMessage {
            event: BeaconEvent::Q1,
            ad_id: "ad-1".to_string(),
            pod_id: None,
            channel: "sports".to_string(),
            ts_ms: 1_700_000_000_123,
            tracker_urls: vec![],
            metadata: None,
        };
        assert_eq!(msg.dedup_key(), "q1|ad-1|1700000000123");
    }

    #[test]
    fn impression_includes_start_trackers() {
        let t = tracking();
        let urls = tracker_urls(Some(&t), BeaconEvent::Imp);
        assert_eq!(urls, vec!["http://t/imp", "http://t/start"]);
    }

    #[test]
    fn event_urls_map_to_quartiles() {
        let t = tracking();
        assert_eq!(tracker_urls(Some(&t), BeaconEvent::Q1), vec!["http://t/q1"]);
        assert_eq!(
            tracker_urls(Some(&t), BeaconEvent::Complete),
            vec!["http://t/complete"]
        );
        assert_eq!(
            tracker_urls(Some(&t), BeaconEvent::Error),
            vec!["http://t/error"]
        );
        assert!(tracker_urls(None, BeaconEvent::Q1).is_empty());
    }

    #[test]
    fn crossing_fires_each_threshold_once() {
        assert_eq!(events_crossed(0.0, 0.2), vec![]);
        assert_eq!(events_crossed(0.2, 0.3), vec![BeaconEvent::Q1]);
        assert_eq!(
            events_crossed(0.3, 0.8),
            vec![BeaconEvent::Mid, BeaconEvent::Q3]
        );
        assert_eq!(events_crossed(0.8, 1.0), vec![BeaconEvent::Complete]);
        // A single jump to completion fires everything
        assert_eq!(
            events_crossed(0.0, 1.0),
            vec![
                BeaconEvent::Q1,
                BeaconEvent::Mid,
                BeaconEvent::Q3,
                BeaconEvent::Complete
            ]
        );
    }

    #[test]
    fn tracker_advances_monotonically() {
        let tracker = QuartileTracker::new();

        assert_eq!(tracker.advance("b1", 0.3), vec![BeaconEvent::Q1]);
        // Re-polling the same progress fires nothing
        assert_eq!(tracker.advance("b1", 0.3), vec![]);
        // Regression (late request) fires nothing
        assert_eq!(tracker.advance("b1", 0.1), vec![]);
        assert_eq!(
            tracker.advance("b1", 1.0),
            vec![BeaconEvent::Mid, BeaconEvent::Q3, BeaconEvent::Complete]
        );
        // A late poll after completion fires nothing again
        assert_eq!(tracker.advance("b1", 1.0), vec![]);
        assert_eq!(tracker.purge_stale(Duration::from_secs(0)), 1);
        assert!(tracker.progress.is_empty());
    }

    #[test]
    fn begin_fires_once_per_break() {
        let tracker = QuartileTracker::new();
        assert!(tracker.begin("b1"));
        assert!(!tracker.begin("b1"));
        // Progress does not reset an already-begun break
        tracker.advance("b1", 0.5);
        assert!(!tracker.begin("b1"));
    }

    #[test]
    fn tracker_isolates_breaks() {
        let tracker = QuartileTracker::new();
        tracker.advance("b1", 0.6);
        assert_eq!(tracker.advance("b2", 0.3), vec![BeaconEvent::Q1]);
    }
}
