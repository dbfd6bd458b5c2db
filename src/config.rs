use std::env;
use std::time::Duration;

/// JWT validation algorithm selection for the playlist ingress
#[derive(Clone, Debug, PartialEq)]
pub enum JwtAlgorithm {
    /// HMAC with a shared symmetric secret
    Hs256,
    /// RSA with a PEM-encoded public key
    Rs256,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub base_url: String,
    pub is_dev: bool,
    /// Base URL of the channel configuration service (admin side)
    pub config_service_url: String,
    /// Base URL of the ad decision service
    pub decision_url: String,
    /// Secret used for HMAC URL signing (opaque bytes, never logged)
    pub signing_secret: Vec<u8>,
    /// Default host embedded in signed URLs when the channel has none
    pub sign_host: String,
    /// Default signed-URL lifetime in seconds
    pub sign_ttl_secs: u64,
    /// JWT algorithm, secret / public key. `None` disables auth entirely.
    pub jwt: Option<JwtConfig>,
    /// Slate pod base URL for decision fallback
    pub slate_url: Option<String>,
    /// Duration of each slate item in seconds
    pub slate_item_duration: f64,
    /// Per-call deadline for origin playlist fetches
    pub origin_timeout: Duration,
    /// Per-call deadline for decision requests
    pub decision_timeout: Duration,
    /// Per-call deadline for channel config fetches
    pub config_timeout: Duration,
    /// Overall rewrite deadline; exceeding it falls back to the legacy
    /// discontinuity insert
    pub rewrite_deadline: Duration,
    /// Break-state backend selection
    pub break_store: BreakStoreType,
    /// Valkey connection URL (required when break_store = Valkey)
    pub valkey_url: Option<String>,
}

/// Break-state storage backend selection
#[derive(Clone, Debug, PartialEq)]
pub enum BreakStoreType {
    /// In-memory store (default; single-instance deployments)
    Memory,
    /// Valkey/Redis-backed store (multi-instance deployments)
    Valkey,
}

/// JWT ingress validation settings
#[derive(Clone, Debug)]
pub struct JwtConfig {
    pub algorithm: JwtAlgorithm,
    /// HS256 shared secret
    pub secret: Option<Vec<u8>>,
    /// RS256 public key, PEM text
    pub public_key_pem: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    /// In DEV mode, provides sensible defaults. In PROD mode, all vars are required.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let is_dev = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        // Port: required in prod, defaults to 3000 in dev
        let port = if is_dev {
            env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        let base_url = if is_dev {
            env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
        } else {
            env::var("BASE_URL").map_err(|_| "BASE_URL is required in production")?
        };

        let config_service_url = if is_dev {
            env::var("CONFIG_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:3000/demo/config".to_string())
        } else {
            env::var("CONFIG_SERVICE_URL")
                .map_err(|_| "CONFIG_SERVICE_URL is required in production")?
        };

        let decision_url = if is_dev {
            env::var("DECISION_URL")
                .unwrap_or_else(|_| "http://localhost:3000/demo/decision".to_string())
        } else {
            env::var("DECISION_URL").map_err(|_| "DECISION_URL is required in production")?
        };

        // Signing secret: required in prod. The dev default is deliberately
        // weak and only suitable for local loops.
        let signing_secret = if is_dev {
            env::var("SIGNING_SECRET").unwrap_or_else(|_| "dev-signing-secret".to_string())
        } else {
            env::var("SIGNING_SECRET").map_err(|_| "SIGNING_SECRET is required in production")?
        }
        .into_bytes();

        let sign_host = env::var("SIGN_HOST").unwrap_or_else(|_| "cdn.localhost".to_string());

        let sign_ttl_secs = env::var("SIGN_TTL_SECS")
            .unwrap_or_else(|_| "900".to_string())
            .parse()
            .unwrap_or(900);

        let jwt = Self::jwt_from_env()?;

        let slate_url = env::var("SLATE_URL").ok();
        let slate_item_duration = env::var("SLATE_ITEM_DURATION")
            .unwrap_or_else(|_| "2.0".to_string())
            .parse()
            .unwrap_or(2.0);

        let origin_timeout = duration_var("ORIGIN_TIMEOUT_MS", 5_000);
        let decision_timeout = duration_var("DECISION_TIMEOUT_MS", 2_000);
        let config_timeout = duration_var("CONFIG_TIMEOUT_MS", 1_000);
        let rewrite_deadline = duration_var("REWRITE_DEADLINE_MS", 3_000);

        let break_store = match env::var("BREAK_STORE")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "valkey" => BreakStoreType::Valkey,
            _ => BreakStoreType::Memory,
        };
        let valkey_url = env::var("VALKEY_URL").ok();

        Ok(Config {
            port,
            base_url,
            is_dev,
            config_service_url,
            decision_url,
            signing_secret,
            sign_host,
            sign_ttl_secs,
            jwt,
            slate_url,
            slate_item_duration,
            origin_timeout,
            decision_timeout,
            config_timeout,
            rewrite_deadline,
            break_store,
            valkey_url,
        })
    }

    /// Parse JWT settings. JWT_ALG unset → auth disabled.
    fn jwt_from_env() -> Result<Option<JwtConfig>, Box<dyn std::error::Error>> {
        let alg = match env::var("JWT_ALG") {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };

        match alg.to_uppercase().as_str() {
            "HS256" => {
                let secret = env::var("JWT_SECRET")
                    .map_err(|_| "JWT_SECRET is required when JWT_ALG=HS256")?;
                Ok(Some(JwtConfig {
                    algorithm: JwtAlgorithm::Hs256,
                    secret: Some(secret.into_bytes()),
                    public_key_pem: None,
                }))
            }
            "RS256" => {
                let pem = env::var("JWT_PUBLIC_KEY_PEM")
                    .map_err(|_| "JWT_PUBLIC_KEY_PEM is required when JWT_ALG=RS256")?;
                Ok(Some(JwtConfig {
                    algorithm: JwtAlgorithm::Rs256,
                    secret: None,
                    public_key_pem: Some(pem),
                }))
            }
            other => Err(format!("Unsupported JWT_ALG '{other}' (use HS256 or RS256)").into()),
        }
    }
}

fn duration_var(name: &str, default_ms: u64) -> Duration {
    let ms = env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}
