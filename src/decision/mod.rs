//! Ad decision client.
//!
//! One JSON POST per ad break asks the external decision service for a pod.
//! The client never propagates failure: timeout, error, or an empty reply
//! all degrade to the slate pod, and the rewrite carries on. Concurrent
//! requests for the same `(channel, duration, geo, bucket)` fingerprint are
//! collapsed to a single upstream call through a short-lived single-flight
//! cache.

use crate::channel::ChannelConfig;
use crate::metrics;
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Concurrent-request coalescing window
const COALESCE_WINDOW: Duration = Duration::from_secs(2);
/// Resolved pods are kept this long for pinned-fingerprint lookups
const RESOLVED_RETENTION: Duration = Duration::from_secs(600);
/// Slate sources expose a small looping set of items
const SLATE_CYCLE: usize = 10;

/// Viewer attributes forwarded to the decision service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Viewer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionRequest {
    pub channel_id: String,
    pub duration_sec: f64,
    pub viewer: Viewer,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

/// One ad rendition inside a pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodItem {
    pub ad_id: String,
    pub bitrate_bps: u64,
    pub playlist_url: String,
    pub duration_sec: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quartiles {
    #[serde(default)]
    pub start: Vec<String>,
    #[serde(default)]
    pub first_quartile: Vec<String>,
    #[serde(default)]
    pub midpoint: Vec<String>,
    #[serde(default)]
    pub third_quartile: Vec<String>,
    #[serde(default)]
    pub complete: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodTracking {
    #[serde(default)]
    pub impressions: Vec<String>,
    #[serde(default)]
    pub quartiles: Quartiles,
    #[serde(default)]
    pub clicks: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// A resolved ad pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub pod_id: String,
    pub duration_sec: f64,
    pub items: Vec<PodItem>,
    #[serde(default)]
    pub tracking: Option<PodTracking>,
    /// Distinguished slate pod (decision fallback)
    #[serde(default)]
    pub is_slate: bool,
}

impl Pod {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Select the rendition of each ad closest to the requested bandwidth.
    ///
    /// Items are grouped by `ad_id` in pod order; within each group the
    /// bitrate nearest `bandwidth_bps` wins.
    pub fn items_for_bitrate(&self, bandwidth_bps: u64) -> Vec<&PodItem> {
        let mut order: Vec<&str> = Vec::new();
        for item in &self.items {
            if !order.contains(&item.ad_id.as_str()) {
                order.push(&item.ad_id);
            }
        }

        order
            .into_iter()
            .filter_map(|ad_id| {
                self.items
                    .iter()
                    .filter(|i| i.ad_id == ad_id)
                    .min_by_key(|i| i.bitrate_bps.abs_diff(bandwidth_bps))
            })
            .collect()
    }
}

/// Decision-service client with slate fallback and single-flight coalescing.
#[derive(Clone)]
pub struct DecisionClient {
    decision_url: String,
    client: Client,
    timeout: Duration,
    slate_url: Option<String>,
    slate_item_duration: f64,
    inflight: Arc<DashMap<String, (Instant, Arc<OnceCell<Pod>>)>>,
    resolved: Arc<DashMap<String, (Instant, Pod)>>,
}

impl DecisionClient {
    pub fn new(
        decision_url: String,
        client: Client,
        timeout: Duration,
        slate_url: Option<String>,
        slate_item_duration: f64,
    ) -> Self {
        Self {
            decision_url,
            client,
            timeout,
            slate_url,
            slate_item_duration,
            inflight: Arc::new(DashMap::new()),
            resolved: Arc::new(DashMap::new()),
        }
    }

    /// Fingerprint of a decision: same fingerprint ⇒ same pod within the
    /// coalescing window.
    pub fn fingerprint(channel_id: &str, duration_sec: f64, viewer: &Viewer) -> String {
        format!(
            "{}|{:.3}|{}|{}",
            channel_id,
            duration_sec,
            viewer.geo.as_deref().unwrap_or(""),
            viewer.bucket.as_deref().unwrap_or("")
        )
    }

    /// Resolve a pod for a break. Never fails: degraded paths return slate.
    ///
    /// `session` rides along as request context; it does not join the
    /// fingerprint, so concurrent sessions still coalesce.
    pub async fn decide(
        &self,
        channel: &ChannelConfig,
        duration_sec: f64,
        viewer: &Viewer,
        session: Option<&str>,
    ) -> (String, Pod) {
        let fingerprint = Self::fingerprint(&channel.id, duration_sec, viewer);

        let cell = {
            use dashmap::mapref::entry::Entry;
            match self.inflight.entry(fingerprint.clone()) {
                Entry::Occupied(mut e) if e.get().0.elapsed() >= COALESCE_WINDOW => {
                    let cell = Arc::new(OnceCell::new());
                    e.insert((Instant::now(), cell.clone()));
                    cell
                }
                Entry::Occupied(e) => {
                    metrics::record_decision("coalesced");
                    e.get().1.clone()
                }
                Entry::Vacant(v) => {
                    let cell = Arc::new(OnceCell::new());
                    v.insert((Instant::now(), cell.clone()));
                    cell
                }
            }
        };

        let pod = cell
            .get_or_init(|| self.fetch_pod(channel, duration_sec, viewer, session))
            .await
            .clone();

        self.resolved
            .insert(fingerprint.clone(), (Instant::now(), pod.clone()));
        self.gc();
        (fingerprint, pod)
    }

    /// Look up the pod previously resolved under a pinned fingerprint.
    pub fn resolved_pod(&self, fingerprint: &str) -> Option<Pod> {
        self.resolved
            .get(fingerprint)
            .filter(|e| e.0.elapsed() < RESOLVED_RETENTION)
            .map(|e| e.1.clone())
    }

    async fn fetch_pod(
        &self,
        channel: &ChannelConfig,
        duration_sec: f64,
        viewer: &Viewer,
        session: Option<&str>,
    ) -> Pod {
        let request = DecisionRequest {
            channel_id: channel.id.clone(),
            duration_sec,
            viewer: viewer.clone(),
            context: session.map(|s| serde_json::json!({ "session": s })),
        };

        let response = self
            .client
            .post(&self.decision_url)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await;

        let pod = match response {
            Ok(resp) if resp.status().is_success() => match resp.json::<Pod>().await {
                Ok(pod) if !pod.is_empty() => {
                    metrics::record_decision("success");
                    info!(
                        "Decision: pod {} with {} item(s) for channel {}",
                        pod.pod_id,
                        pod.items.len(),
                        channel.id
                    );
                    return pod;
                }
                Ok(_) => {
                    metrics::record_decision("empty");
                    warn!("Decision returned an empty pod for channel {}", channel.id);
                    None
                }
                Err(e) => {
                    metrics::record_decision("error");
                    warn!("Decision payload unparseable: {e}");
                    None
                }
            },
            Ok(resp) => {
                metrics::record_decision("error");
                warn!("Decision service returned {}", resp.status());
                None
            }
            Err(e) if e.is_timeout() => {
                metrics::record_decision("timeout");
                warn!("Decision service timed out after {:?}", self.timeout);
                None
            }
            Err(e) => {
                metrics::record_decision("error");
                warn!("Decision request failed: {e}");
                None
            }
        };

        pod.unwrap_or_else(|| {
            metrics::record_slate_fallback();
            self.slate_pod(duration_sec)
        })
    }

    /// The distinguished slate pod: cycling filler items covering the break.
    pub fn slate_pod(&self, duration_sec: f64) -> Pod {
        let Some(slate_url) = &self.slate_url else {
            warn!("No slate configured; returning empty slate pod");
            return Pod {
                pod_id: "slate".to_string(),
                duration_sec,
                items: Vec::new(),
                tracking: None,
                is_slate: true,
            };
        };

        let count = ((duration_sec / self.slate_item_duration).ceil() as usize).max(1);
        // Distinct ad ids keep every filler item after bitrate grouping
        let items = (0..count)
            .map(|i| PodItem {
                ad_id: format!("slate-{i}"),
                bitrate_bps: 0,
                playlist_url: format!("{}/out_{:03}.ts", slate_url, i % SLATE_CYCLE),
                duration_sec: self.slate_item_duration,
            })
            .collect();

        Pod {
            pod_id: "slate".to_string(),
            duration_sec,
            items,
            tracking: None,
            is_slate: true,
        }
    }

    /// Drop expired coalescing cells and stale resolved pods.
    fn gc(&self) {
        self.inflight
            .retain(|_, (created, _)| created.elapsed() < COALESCE_WINDOW);
        self.resolved
            .retain(|_, (created, _)| created.elapsed() < RESOLVED_RETENTION);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testutil::test_config;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pod_json() -> serde_json::Value {
        serde_json::json!({
            "pod_id": "pod-1",
            "duration_sec": 8.0,
            "items": [
                {"ad_id": "ad-1", "bitrate_bps": 800_000, "playlist_url": "/ads/ad1_800k.m3u8", "duration_sec": 4.0},
                {"ad_id": "ad-1", "bitrate_bps": 2_500_000, "playlist_url": "/ads/ad1_2500k.m3u8", "duration_sec": 4.0},
                {"ad_id": "ad-2", "bitrate_bps": 800_000, "playlist_url": "/ads/ad2_800k.m3u8", "duration_sec": 4.0},
                {"ad_id": "ad-2", "bitrate_bps": 2_500_000, "playlist_url": "/ads/ad2_2500k.m3u8", "duration_sec": 4.0}
            ]
        })
    }

    fn client_for(url: &str) -> DecisionClient {
        DecisionClient::new(
            format!("{url}/decide"),
            Client::new(),
            Duration::from_millis(500),
            Some("https://slate.example.com/loop".to_string()),
            2.0,
        )
    }

    #[tokio::test]
    async fn successful_decision_returns_pod() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/decide"))
            .respond_with(ResponseTemplate::new(200).set_body_json(pod_json()))
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        let channel = test_config("ch-1", "acme", "sports");
        let (fingerprint, pod) = client.decide(&channel, 8.0, &Viewer::default(), None).await;

        assert_eq!(pod.pod_id, "pod-1");
        assert!(!pod.is_slate);
        assert_eq!(pod.items.len(), 4);
        assert_eq!(client.resolved_pod(&fingerprint), Some(pod));
    }

    #[tokio::test]
    async fn upstream_error_falls_back_to_slate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/decide"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        let channel = test_config("ch-1", "acme", "sports");
        let (_, pod) = client.decide(&channel, 8.0, &Viewer::default(), None).await;

        assert!(pod.is_slate);
        assert_eq!(pod.items.len(), 4); // 8 s / 2 s slate items
        assert!(pod.items[0].playlist_url.ends_with("out_000.ts"));
    }

    #[tokio::test]
    async fn timeout_falls_back_to_slate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/decide"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(pod_json())
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        let channel = test_config("ch-1", "acme", "sports");
        let (_, pod) = client.decide(&channel, 8.0, &Viewer::default(), None).await;
        assert!(pod.is_slate);
    }

    #[tokio::test]
    async fn empty_pod_falls_back_to_slate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/decide"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "pod_id": "pod-1", "duration_sec": 8.0, "items": []
            })))
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        let channel = test_config("ch-1", "acme", "sports");
        let (_, pod) = client.decide(&channel, 8.0, &Viewer::default(), None).await;
        assert!(pod.is_slate);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_single_flight() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/decide"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(pod_json())
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1) // exactly one upstream call
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        let channel = test_config("ch-1", "acme", "sports");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let client = client.clone();
            let channel = channel.clone();
            tasks.push(tokio::spawn(async move {
                client.decide(&channel, 8.0, &Viewer::default(), None).await.1
            }));
        }

        let mut pods = Vec::new();
        for t in tasks {
            pods.push(t.await.unwrap());
        }
        assert!(pods.windows(2).all(|w| w[0] == w[1]), "pods must be identical");
        server.verify().await;
    }

    #[tokio::test]
    async fn different_viewers_do_not_coalesce() {
        let geo_a = Viewer {
            geo: Some("us".to_string()),
            ..Default::default()
        };
        let geo_b = Viewer {
            geo: Some("de".to_string()),
            ..Default::default()
        };
        assert_ne!(
            DecisionClient::fingerprint("ch-1", 8.0, &geo_a),
            DecisionClient::fingerprint("ch-1", 8.0, &geo_b)
        );
    }

    #[test]
    fn bitrate_selection_groups_by_ad() {
        let pod: Pod = serde_json::from_value(pod_json()).unwrap();

        let items = pod.items_for_bitrate(900_000);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].playlist_url, "/ads/ad1_800k.m3u8");
        assert_eq!(items[1].playlist_url, "/ads/ad2_800k.m3u8");

        let items = pod.items_for_bitrate(3_000_000);
        assert_eq!(items[0].playlist_url, "/ads/ad1_2500k.m3u8");
        assert_eq!(items[1].playlist_url, "/ads/ad2_2500k.m3u8");
    }

    #[test]
    fn slate_without_url_is_empty() {
        let client = DecisionClient::new(
            "http://127.0.0.1:1/decide".to_string(),
            Client::new(),
            Duration::from_millis(100),
            None,
            2.0,
        );
        let pod = client.slate_pod(8.0);
        assert!(pod.is_slate);
        assert!(pod.is_empty());
    }
}
