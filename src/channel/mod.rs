//! Channel configuration: model, HTTP source, and read-through cache.
//!
//! Channel records live in the admin service; this proxy only reads them.
//! Lookups are keyed both ways — `(org_slug, channel_slug)` on the request
//! path and `channel_id` for state-store keys — and cached for 60 seconds.
//! Not-found is never cached, so a freshly created channel goes live on the
//! next request.

use crate::error::{MidrollError, Result};
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Cache entry lifetime
pub const CONFIG_TTL: Duration = Duration::from_secs(60);

/// How ads are inserted on this channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertionMode {
    /// Pick CSI or SSAI per client capability
    Auto,
    Csi,
    Ssai,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Active,
    Paused,
    Archived,
}

/// Scheduled fallback insertion when the origin stops sending SCTE-35.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackSchedule {
    pub interval_min: u64,
    pub duration_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scte35Settings {
    pub enabled: bool,
    #[serde(default)]
    pub auto_insert: bool,
    #[serde(default)]
    pub fallback_schedule: Option<FallbackSchedule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VastSettings {
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_vast_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_vast_timeout_ms() -> u64 {
    2000
}

/// One channel's configuration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    pub org_id: String,
    pub slug: String,
    pub origin_url: String,
    pub ad_pod_base_url: String,
    pub sign_host: String,
    pub scte35: Scte35Settings,
    pub vast: VastSettings,
    #[serde(default = "default_ad_duration")]
    pub default_ad_duration: f64,
    #[serde(default)]
    pub slate_id: Option<String>,
    pub mode: InsertionMode,
    pub status: ChannelStatus,
    #[serde(default)]
    pub bitrate_ladder: Vec<u64>,
    #[serde(default = "default_segment_ttl")]
    pub segment_cache_ttl: u64,
    #[serde(default = "default_manifest_ttl")]
    pub manifest_cache_ttl: u64,
    /// Legacy wire form: some admin rows carry the fallback schedule as an
    /// embedded JSON string rather than a nested object
    #[serde(default, skip_serializing)]
    scte35_fallback_schedule: Option<String>,
}

fn default_ad_duration() -> f64 {
    30.0
}
fn default_segment_ttl() -> u64 {
    10
}
fn default_manifest_ttl() -> u64 {
    2
}

impl ChannelConfig {
    /// Fold legacy flat fields into their nested homes.
    fn normalise(mut self) -> Self {
        if self.scte35.fallback_schedule.is_none()
            && let Some(raw) = self.scte35_fallback_schedule.take()
        {
            match serde_json::from_str::<FallbackSchedule>(&raw) {
                Ok(schedule) => self.scte35.fallback_schedule = Some(schedule),
                Err(e) => warn!("Unparseable scte35_fallback_schedule ignored: {e}"),
            }
        }
        self
    }
}

/// HTTP reader against the admin config service.
#[derive(Clone)]
pub struct HttpConfigSource {
    base_url: String,
    client: Client,
    timeout: Duration,
}

impl HttpConfigSource {
    pub fn new(base_url: String, client: Client, timeout: Duration) -> Self {
        Self {
            base_url,
            client,
            timeout,
        }
    }

    async fn fetch(&self, path: &str) -> Result<Option<ChannelConfig>> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| MidrollError::ConfigError(format!("config fetch failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(MidrollError::ConfigError(format!(
                "config service returned {}",
                response.status()
            )));
        }

        let config: ChannelConfig = response
            .json()
            .await
            .map_err(|e| MidrollError::ConfigError(format!("bad config payload: {e}")))?;
        Ok(Some(config.normalise()))
    }

    pub async fn fetch_by_slugs(&self, org: &str, channel: &str) -> Result<Option<ChannelConfig>> {
        self.fetch(&format!("/channels/{org}/{channel}")).await
    }

    pub async fn fetch_by_id(&self, id: &str) -> Result<Option<ChannelConfig>> {
        self.fetch(&format!("/channels/by-id/{id}")).await
    }
}

struct CachedEntry {
    config: Arc<ChannelConfig>,
    fetched_at: Instant,
}

impl CachedEntry {
    fn fresh(&self) -> bool {
        self.fetched_at.elapsed() < CONFIG_TTL
    }
}

/// Read-through cache over the config source.
#[derive(Clone)]
pub struct ChannelConfigCache {
    source: HttpConfigSource,
    by_slugs: Arc<DashMap<(String, String), CachedEntry>>,
    by_id: Arc<DashMap<String, CachedEntry>>,
}

impl ChannelConfigCache {
    pub fn new(source: HttpConfigSource) -> Self {
        Self {
            source,
            by_slugs: Arc::new(DashMap::new()),
            by_id: Arc::new(DashMap::new()),
        }
    }

    /// Look a channel up by its request-path slugs.
    pub async fn get_by_slugs(&self, org: &str, channel: &str) -> Result<Option<Arc<ChannelConfig>>> {
        let key = (org.to_string(), channel.to_string());
        if let Some(entry) = self.by_slugs.get(&key)
            && entry.fresh()
        {
            return Ok(Some(entry.config.clone()));
        }

        debug!("Config cache miss for {org}/{channel}");
        match self.source.fetch_by_slugs(org, channel).await? {
            Some(config) => Ok(Some(self.store(config))),
            // Not-found is not cached
            None => Ok(None),
        }
    }

    /// Look a channel up by id.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Arc<ChannelConfig>>> {
        if let Some(entry) = self.by_id.get(id)
            && entry.fresh()
        {
            return Ok(Some(entry.config.clone()));
        }

        debug!("Config cache miss for channel id {id}");
        match self.source.fetch_by_id(id).await? {
            Some(config) => Ok(Some(self.store(config))),
            None => Ok(None),
        }
    }

    /// Drop a channel from both indexes. Called on admin-side mutations.
    pub fn invalidate(&self, id: &str) {
        self.by_id.remove(id);
        self.by_slugs
            .retain(|_, entry| entry.config.id != id);
    }

    pub fn cached_count(&self) -> usize {
        self.by_id.len()
    }

    fn store(&self, config: ChannelConfig) -> Arc<ChannelConfig> {
        let config = Arc::new(config);
        self.by_slugs.insert(
            (config.org_id.clone(), config.slug.clone()),
            CachedEntry {
                config: config.clone(),
                fetched_at: Instant::now(),
            },
        );
        self.by_id.insert(
            config.id.clone(),
            CachedEntry {
                config: config.clone(),
                fetched_at: Instant::now(),
            },
        );
        config
    }
}

/// Test fixture shared across module tests.
#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub(crate) fn test_config(id: &str, org: &str, slug: &str) -> ChannelConfig {
        ChannelConfig {
            id: id.to_string(),
            org_id: org.to_string(),
            slug: slug.to_string(),
            origin_url: "https://origin.example.com/live".to_string(),
            ad_pod_base_url: "https://ads.example.com/pods".to_string(),
            sign_host: "ads.example.com".to_string(),
            scte35: Scte35Settings {
                enabled: true,
                auto_insert: false,
                fallback_schedule: None,
            },
            vast: VastSettings {
                enabled: false,
                url: None,
                timeout_ms: 2000,
            },
            default_ad_duration: 30.0,
            slate_id: Some("slate-1".to_string()),
            mode: InsertionMode::Auto,
            status: ChannelStatus::Active,
            bitrate_ladder: vec![800, 1600, 2500],
            segment_cache_ttl: 10,
            manifest_cache_ttl: 2,
            scte35_fallback_schedule: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::test_config;
    use super::*;

    #[test]
    fn config_json_roundtrip() {
        let config = test_config("ch-1", "acme", "sports");
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ChannelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn mode_and_status_wire_form() {
        let json = r#"{
            "id": "ch-1", "org_id": "acme", "slug": "sports",
            "origin_url": "https://o", "ad_pod_base_url": "https://a",
            "sign_host": "cdn",
            "scte35": {"enabled": true},
            "vast": {"enabled": false},
            "mode": "ssai", "status": "paused"
        }"#;
        let config: ChannelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.mode, InsertionMode::Ssai);
        assert_eq!(config.status, ChannelStatus::Paused);
        assert_eq!(config.default_ad_duration, 30.0);
        assert_eq!(config.manifest_cache_ttl, 2);
    }

    #[test]
    fn legacy_fallback_schedule_string_is_parsed() {
        let json = r#"{
            "id": "ch-1", "org_id": "acme", "slug": "sports",
            "origin_url": "https://o", "ad_pod_base_url": "https://a",
            "sign_host": "cdn",
            "scte35": {"enabled": true},
            "vast": {"enabled": false},
            "mode": "auto", "status": "active",
            "scte35_fallback_schedule": "{\"interval_min\": 15, \"duration_sec\": 60.0}"
        }"#;
        let config: ChannelConfig = serde_json::from_str::<ChannelConfig>(json).unwrap().normalise();
        let schedule = config.scte35.fallback_schedule.unwrap();
        assert_eq!(schedule.interval_min, 15);
        assert_eq!(schedule.duration_sec, 60.0);
    }

    #[tokio::test]
    async fn cache_serves_fresh_entry_without_refetch() {
        // Point the source at a dead address: a cache hit must not touch it
        let source = HttpConfigSource::new(
            "http://127.0.0.1:1".to_string(),
            Client::new(),
            Duration::from_millis(200),
        );
        let cache = ChannelConfigCache::new(source);

        let config = Arc::new(test_config("ch-1", "acme", "sports"));
        cache.by_slugs.insert(
            ("acme".to_string(), "sports".to_string()),
            CachedEntry {
                config: config.clone(),
                fetched_at: Instant::now(),
            },
        );

        let hit = cache.get_by_slugs("acme", "sports").await.unwrap().unwrap();
        assert_eq!(hit.id, "ch-1");
    }

    #[tokio::test]
    async fn stale_entry_falls_through_to_source() {
        let source = HttpConfigSource::new(
            "http://127.0.0.1:1".to_string(),
            Client::new(),
            Duration::from_millis(100),
        );
        let cache = ChannelConfigCache::new(source);

        cache.by_slugs.insert(
            ("acme".to_string(), "sports".to_string()),
            CachedEntry {
                config: Arc::new(test_config("ch-1", "acme", "sports")),
                fetched_at: Instant::now() - CONFIG_TTL - Duration::from_secs(1),
            },
        );

        // The dead source makes the read-through fail loudly, proving the
        // stale entry was not served
        assert!(cache.get_by_slugs("acme", "sports").await.is_err());
    }

    #[tokio::test]
    async fn invalidate_clears_both_indexes() {
        let source = HttpConfigSource::new(
            "http://127.0.0.1:1".to_string(),
            Client::new(),
            Duration::from_millis(100),
        );
        let cache = ChannelConfigCache::new(source);
        let config = test_config("ch-1", "acme", "sports");
        cache.store(config);

        assert_eq!(cache.cached_count(), 1);
        cache.invalidate("ch-1");
        assert_eq!(cache.cached_count(), 0);
        assert!(cache.by_slugs.is_empty());
    }
}
