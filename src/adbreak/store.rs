//! Per-channel ad-break state with pinned decisions.
//!
//! Every variant request that observes the same break must rewrite
//! identically, so the first observer pins `{skip_count, pod fingerprint,
//! resume PDT}` under `channel:<id>:<event>` and everyone else reads the
//! pinned record. Writes are idempotent per key; reads may be eventually
//! consistent.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[cfg(feature = "valkey")]
use tracing::{error, info};

#[cfg(feature = "valkey")]
use redis::aio::ConnectionManager;

/// Breaks linger this long past their end before eviction
pub const GRACE_SECS: i64 = 30;

/// Pinned state for one ad break on one channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdBreakState {
    pub event_id: String,
    /// ISO-8601 UTC
    pub start_pdt: String,
    /// ISO-8601 UTC
    pub end_pdt: String,
    pub duration_sec: f64,
    pub pinned_skip_count: usize,
    pub pinned_pod_fingerprint: String,
    pub pinned_resume_pdt: Option<String>,
}

impl AdBreakState {
    /// Whether `now` falls inside `[start_pdt, end_pdt]`.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        match (parse_iso(&self.start_pdt), parse_iso(&self.end_pdt)) {
            (Some(start), Some(end)) => start <= now && now <= end,
            _ => false,
        }
    }

    /// Whether the break is past its end plus grace and can be evicted.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        parse_iso(&self.end_pdt)
            .map(|end| now > end + chrono::Duration::seconds(GRACE_SECS))
            .unwrap_or(true)
    }
}

fn parse_iso(iso: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(iso).ok().map(|dt| dt.to_utc())
}

fn state_key(channel_id: &str, event_id: &str) -> String {
    format!("channel:{channel_id}:{event_id}")
}

fn channel_prefix(channel_id: &str) -> String {
    format!("channel:{channel_id}:")
}

/// Internal storage backend
#[derive(Clone)]
enum Backend {
    Memory {
        breaks: Arc<DashMap<String, AdBreakState>>,
    },
    #[cfg(feature = "valkey")]
    Valkey {
        conn: ConnectionManager,
        key_prefix: String,
    },
}

/// Break-state store — same public API regardless of backend.
#[derive(Clone)]
pub struct BreakStateStore {
    backend: Backend,
}

impl BreakStateStore {
    /// Create an in-memory store (default)
    pub fn new_memory() -> Self {
        Self {
            backend: Backend::Memory {
                breaks: Arc::new(DashMap::new()),
            },
        }
    }

    /// Create a Valkey-backed store
    #[cfg(feature = "valkey")]
    pub async fn new_valkey(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Valkey at {}", url);
        Ok(Self {
            backend: Backend::Valkey {
                conn,
                key_prefix: "midroll:break".to_string(),
            },
        })
    }

    /// Find a break on this channel whose window contains `now`.
    ///
    /// Expired entries encountered along the way are evicted.
    pub async fn find_active(&self, channel_id: &str, now: DateTime<Utc>) -> Option<AdBreakState> {
        match &self.backend {
            Backend::Memory { breaks } => {
                let prefix = channel_prefix(channel_id);
                breaks.retain(|key, state| !key.starts_with(&prefix) || !state.expired(now));
                breaks
                    .iter()
                    .filter(|e| e.key().starts_with(&prefix))
                    .find(|e| e.value().contains(now))
                    .map(|e| e.value().clone())
            }
            #[cfg(feature = "valkey")]
            Backend::Valkey { conn, key_prefix } => {
                let pattern = format!("{}:{}*", key_prefix, channel_prefix(channel_id));
                let mut conn = conn.clone();
                // NOTE: KEYS is O(N) — acceptable at the active-break scale
                // (a handful per channel). Replace with SCAN if it grows.
                let keys: Vec<String> = match redis::cmd("KEYS")
                    .arg(&pattern)
                    .query_async(&mut conn)
                    .await
                {
                    Ok(keys) => keys,
                    Err(e) => {
                        error!("Valkey KEYS failed in find_active: {}", e);
                        return None;
                    }
                };
                for key in keys {
                    let json: Option<String> =
                        redis::cmd("GET").arg(&key).query_async(&mut conn).await.ok()?;
                    if let Some(json) = json
                        && let Ok(state) = serde_json::from_str::<AdBreakState>(&json)
                        && state.contains(now)
                    {
                        return Some(state);
                    }
                }
                None
            }
        }
    }

    /// Pin break state at most once per `(channel, event)`.
    ///
    /// Concurrent callers race; exactly one `init` runs, losers read the
    /// winner's record.
    pub async fn pin<F>(&self, channel_id: &str, event_id: &str, init: F) -> AdBreakState
    where
        F: FnOnce() -> AdBreakState,
    {
        let key = state_key(channel_id, event_id);
        match &self.backend {
            Backend::Memory { breaks } => breaks.entry(key).or_insert_with(init).clone(),
            #[cfg(feature = "valkey")]
            Backend::Valkey { conn, key_prefix } => {
                let full_key = format!("{}:{}", key_prefix, key);
                let mut conn = conn.clone();
                let candidate = init();
                let ttl_secs = (candidate.duration_sec as i64 + GRACE_SECS + 300).max(60);

                if let Ok(json) = serde_json::to_string(&candidate) {
                    // SET NX: only the first writer lands
                    if let Err(e) = redis::cmd("SET")
                        .arg(&full_key)
                        .arg(&json)
                        .arg("NX")
                        .arg("EX")
                        .arg(ttl_secs)
                        .query_async::<Option<String>>(&mut conn)
                        .await
                    {
                        error!("Valkey SET NX failed in pin: {}", e);
                        return candidate;
                    }
                }

                // Read back whichever record won the race
                match redis::cmd("GET")
                    .arg(&full_key)
                    .query_async::<Option<String>>(&mut conn)
                    .await
                {
                    Ok(Some(json)) => serde_json::from_str(&json).unwrap_or(candidate),
                    _ => candidate,
                }
            }
        }
    }

    /// Drop the pinned state for one break.
    pub async fn invalidate(&self, channel_id: &str, event_id: &str) {
        let key = state_key(channel_id, event_id);
        match &self.backend {
            Backend::Memory { breaks } => {
                breaks.remove(&key);
            }
            #[cfg(feature = "valkey")]
            Backend::Valkey { conn, key_prefix } => {
                let full_key = format!("{}:{}", key_prefix, key);
                let mut conn = conn.clone();
                if let Err(e) = redis::cmd("DEL")
                    .arg(&full_key)
                    .query_async::<()>(&mut conn)
                    .await
                {
                    error!("Valkey DEL failed in invalidate: {}", e);
                }
            }
        }
    }

    /// Number of tracked breaks (health endpoint).
    pub async fn active_count(&self) -> usize {
        match &self.backend {
            Backend::Memory { breaks } => breaks.len(),
            #[cfg(feature = "valkey")]
            Backend::Valkey { conn, key_prefix } => {
                let pattern = format!("{}:*", key_prefix);
                let mut conn = conn.clone();
                match redis::cmd("KEYS")
                    .arg(&pattern)
                    .query_async::<Vec<String>>(&mut conn)
                    .await
                {
                    Ok(keys) => keys.len(),
                    Err(e) => {
                        error!("Valkey KEYS failed in active_count: {}", e);
                        0
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(event_id: &str, start: &str, end: &str) -> AdBreakState {
        AdBreakState {
            event_id: event_id.to_string(),
            start_pdt: start.to_string(),
            end_pdt: end.to_string(),
            duration_sec: 8.0,
            pinned_skip_count: 2,
            pinned_pod_fingerprint: "pod-abc".to_string(),
            pinned_resume_pdt: Some("2025-10-31T12:00:16.000Z".to_string()),
        }
    }

    fn at(iso: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(iso).unwrap().to_utc()
    }

    #[tokio::test]
    async fn pin_is_at_most_once() {
        let store = BreakStateStore::new_memory();

        let first = store
            .pin("ch1", "evt1", || {
                state("evt1", "2025-10-31T12:00:08Z", "2025-10-31T12:00:16Z")
            })
            .await;

        // A second pin with different content must read the first record
        let second = store
            .pin("ch1", "evt1", || {
                let mut s = state("evt1", "2025-10-31T12:00:08Z", "2025-10-31T12:00:16Z");
                s.pinned_skip_count = 99;
                s.pinned_pod_fingerprint = "pod-other".to_string();
                s
            })
            .await;

        assert_eq!(first, second);
        assert_eq!(second.pinned_skip_count, 2);
        assert_eq!(store.active_count().await, 1);
    }

    #[tokio::test]
    async fn concurrent_pins_agree() {
        let store = BreakStateStore::new_memory();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .pin("ch1", "evt1", move || {
                        let mut s =
                            state("evt1", "2025-10-31T12:00:08Z", "2025-10-31T12:00:16Z");
                        s.pinned_pod_fingerprint = format!("pod-{i}");
                        s
                    })
                    .await
            }));
        }

        let mut fingerprints = std::collections::HashSet::new();
        for t in tasks {
            fingerprints.insert(t.await.unwrap().pinned_pod_fingerprint);
        }
        assert_eq!(fingerprints.len(), 1, "all callers must see one winner");
    }

    #[tokio::test]
    async fn find_active_matches_window() {
        let store = BreakStateStore::new_memory();
        store
            .pin("ch1", "evt1", || {
                state("evt1", "2025-10-31T12:00:08Z", "2025-10-31T12:00:16Z")
            })
            .await;

        assert!(
            store
                .find_active("ch1", at("2025-10-31T12:00:10Z"))
                .await
                .is_some()
        );
        assert!(
            store
                .find_active("ch1", at("2025-10-31T12:00:20Z"))
                .await
                .is_none()
        );
        assert!(
            store
                .find_active("ch2", at("2025-10-31T12:00:10Z"))
                .await
                .is_none(),
            "other channels must not see the break"
        );
    }

    #[tokio::test]
    async fn expired_breaks_are_evicted() {
        let store = BreakStateStore::new_memory();
        store
            .pin("ch1", "evt1", || {
                state("evt1", "2025-10-31T12:00:08Z", "2025-10-31T12:00:16Z")
            })
            .await;

        // Within grace: kept but not active
        store
            .find_active("ch1", at("2025-10-31T12:00:30Z"))
            .await;
        assert_eq!(store.active_count().await, 1);

        // Past end + grace: evicted
        store
            .find_active("ch1", at("2025-10-31T12:01:00Z"))
            .await;
        assert_eq!(store.active_count().await, 0);
    }

    #[tokio::test]
    async fn invalidate_removes_state() {
        let store = BreakStateStore::new_memory();
        store
            .pin("ch1", "evt1", || {
                state("evt1", "2025-10-31T12:00:08Z", "2025-10-31T12:00:16Z")
            })
            .await;
        store.invalidate("ch1", "evt1").await;
        assert_eq!(store.active_count().await, 0);

        // Re-pin after invalidation runs init again
        let fresh = store
            .pin("ch1", "evt1", || {
                let mut s = state("evt1", "2025-10-31T12:00:08Z", "2025-10-31T12:00:16Z");
                s.pinned_skip_count = 5;
                s
            })
            .await;
        assert_eq!(fresh.pinned_skip_count, 5);
    }
}
