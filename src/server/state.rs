use crate::{
    adbreak::store::BreakStateStore,
    auth::JwtValidator,
    beacon::{HttpBeaconSink, QuartileTracker},
    channel::{ChannelConfigCache, HttpConfigSource},
    config::{BreakStoreType, Config},
    decision::DecisionClient,
    rewrite::Rewriter,
    signing::UrlSigner,
    timing::TimingRegistry,
};
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Shared HTTP client for connection pooling
    pub http_client: Client,
    /// Channel configuration read-through cache
    pub channels: ChannelConfigCache,
    /// The manifest rewrite pipeline and its stores
    pub rewriter: Rewriter,
    /// JWT verifier; `None` disables ingress auth
    pub jwt: Option<Arc<JwtValidator>>,
    /// Server start time for uptime tracking
    pub started_at: Instant,
}

impl AppState {
    /// Create a new AppState with the given configuration
    pub async fn new(config: Config) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to create HTTP client");

        let store = match config.break_store {
            BreakStoreType::Memory => BreakStateStore::new_memory(),
            #[cfg(feature = "valkey")]
            BreakStoreType::Valkey => {
                let url = config
                    .valkey_url
                    .as_deref()
                    .expect("VALKEY_URL is required when BREAK_STORE=valkey");
                BreakStateStore::new_valkey(url)
                    .await
                    .expect("Failed to connect to Valkey")
            }
            #[cfg(not(feature = "valkey"))]
            BreakStoreType::Valkey => {
                panic!("BREAK_STORE=valkey requires the 'valkey' feature flag");
            }
        };

        let channels = ChannelConfigCache::new(HttpConfigSource::new(
            config.config_service_url.clone(),
            http_client.clone(),
            config.config_timeout,
        ));

        let decisions = DecisionClient::new(
            config.decision_url.clone(),
            http_client.clone(),
            config.decision_timeout,
            config.slate_url.clone(),
            config.slate_item_duration,
        );
        info!(
            "Decision service: {} (slate {})",
            config.decision_url,
            if config.slate_url.is_some() {
                "configured"
            } else {
                "disabled"
            }
        );

        let jwt = config.jwt.as_ref().map(|jwt_config| {
            Arc::new(
                JwtValidator::from_config(jwt_config).expect("Invalid JWT configuration"),
            )
        });
        info!(
            "Ingress auth: {}",
            if jwt.is_some() { "JWT" } else { "disabled" }
        );

        let rewriter = Rewriter {
            store,
            decisions,
            signer: UrlSigner::new(config.signing_secret.clone()),
            beacons: HttpBeaconSink::new(http_client.clone()),
            quartiles: QuartileTracker::new(),
            timing: TimingRegistry::new(),
            sign_ttl_secs: config.sign_ttl_secs,
            default_sign_host: config.sign_host.clone(),
            is_dev: config.is_dev,
        };

        Self {
            config: Arc::new(config),
            http_client,
            channels,
            rewriter,
            jwt,
            started_at: Instant::now(),
        }
    }
}
