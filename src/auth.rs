//! JWT validation for the playlist ingress.
//!
//! Tokens are issued elsewhere; this module only verifies them. The
//! algorithm is pinned at startup — a token whose header names any other
//! algorithm (including `none`) is rejected before signature checking.

use crate::config::{JwtAlgorithm, JwtConfig};
use crate::error::{MidrollError, Result};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;

/// Claims carried by viewer tokens. Only `exp` is required; the rest is
/// forwarded into decision viewer context when present.
#[derive(Debug, Deserialize)]
pub struct Claims {
    pub exp: u64,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub geo: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
}

/// Startup-configured token verifier.
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Build a validator from startup config.
    ///
    /// RS256 keys are accepted as PEM text or as a JSON Web Key object.
    pub fn from_config(cfg: &JwtConfig) -> Result<Self> {
        let (key, alg) = match cfg.algorithm {
            JwtAlgorithm::Hs256 => {
                let secret = cfg
                    .secret
                    .as_deref()
                    .ok_or_else(|| MidrollError::ConfigError("HS256 requires a secret".into()))?;
                (DecodingKey::from_secret(secret), Algorithm::HS256)
            }
            JwtAlgorithm::Rs256 => {
                let text = cfg.public_key_pem.as_deref().ok_or_else(|| {
                    MidrollError::ConfigError("RS256 requires a public key".into())
                })?;
                let key = if text.trim_start().starts_with("-----BEGIN") {
                    DecodingKey::from_rsa_pem(text.as_bytes()).map_err(|e| {
                        MidrollError::ConfigError(format!("bad RS256 PEM key: {e}"))
                    })?
                } else {
                    let jwk: jsonwebtoken::jwk::Jwk = serde_json::from_str(text).map_err(|e| {
                        MidrollError::ConfigError(format!("bad RS256 JWK key: {e}"))
                    })?;
                    DecodingKey::from_jwk(&jwk).map_err(|e| {
                        MidrollError::ConfigError(format!("bad RS256 JWK key: {e}"))
                    })?
                };
                (key, Algorithm::RS256)
            }
        };

        // Validation::new pins the algorithm: a token header naming any other
        // algorithm (or "none", which fails header parsing) is rejected.
        let mut validation = Validation::new(alg);
        validation.validate_exp = true;
        validation.required_spec_claims.insert("exp".to_string());

        Ok(Self { key, validation })
    }

    /// Verify a bearer token and return its claims.
    ///
    /// Failure reasons are coded strings (`expired`, `bad_alg`, `bad_token`)
    /// suitable for logging; the token itself is never included.
    pub fn validate(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                use jsonwebtoken::errors::ErrorKind;
                let reason = match e.kind() {
                    ErrorKind::ExpiredSignature => "expired",
                    ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => "bad_alg",
                    ErrorKind::InvalidSignature => "bad_signature",
                    _ => "bad_token",
                };
                MidrollError::AuthFailure(reason.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        exp: u64,
        sub: String,
    }

    fn hs256_validator(secret: &[u8]) -> JwtValidator {
        JwtValidator::from_config(&JwtConfig {
            algorithm: JwtAlgorithm::Hs256,
            secret: Some(secret.to_vec()),
            public_key_pem: None,
        })
        .unwrap()
    }

    fn future_exp() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 3600
    }

    #[test]
    fn valid_hs256_token_accepted() {
        let secret = b"shared-secret";
        let token = encode(
            &Header::new(Algorithm::HS256),
            &TestClaims {
                exp: future_exp(),
                sub: "viewer-1".to_string(),
            },
            &EncodingKey::from_secret(secret),
        )
        .unwrap();

        let claims = hs256_validator(secret).validate(&token).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("viewer-1"));
    }

    #[test]
    fn expired_token_rejected() {
        let secret = b"shared-secret";
        let token = encode(
            &Header::new(Algorithm::HS256),
            &TestClaims {
                exp: 1_000, // long past
                sub: "viewer-1".to_string(),
            },
            &EncodingKey::from_secret(secret),
        )
        .unwrap();

        let err = hs256_validator(secret).validate(&token).unwrap_err();
        assert!(matches!(err, MidrollError::AuthFailure(ref r) if r == "expired"));
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = encode(
            &Header::new(Algorithm::HS256),
            &TestClaims {
                exp: future_exp(),
                sub: "viewer-1".to_string(),
            },
            &EncodingKey::from_secret(b"secret-a"),
        )
        .unwrap();

        let err = hs256_validator(b"secret-b").validate(&token).unwrap_err();
        assert!(matches!(err, MidrollError::AuthFailure(_)));
    }

    #[test]
    fn algorithm_mismatch_rejected() {
        // HS384-signed token presented to an HS256-pinned validator
        let token = encode(
            &Header::new(Algorithm::HS384),
            &TestClaims {
                exp: future_exp(),
                sub: "viewer-1".to_string(),
            },
            &EncodingKey::from_secret(b"shared-secret"),
        )
        .unwrap();

        let err = hs256_validator(b"shared-secret").validate(&token).unwrap_err();
        assert!(matches!(err, MidrollError::AuthFailure(_)));
    }

    #[test]
    fn alg_none_rejected() {
        // Hand-built unsigned token with alg=none
        use base64::Engine;
        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = b64.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let payload = b64.encode(format!(r#"{{"exp":{}}}"#, future_exp()).as_bytes());
        let token = format!("{header}.{payload}.");

        let err = hs256_validator(b"shared-secret").validate(&token).unwrap_err();
        assert!(matches!(err, MidrollError::AuthFailure(_)));
    }

    #[test]
    fn garbage_token_rejected() {
        let err = hs256_validator(b"s").validate("not-a-jwt").unwrap_err();
        assert!(matches!(err, MidrollError::AuthFailure(ref r) if r == "bad_token"));
    }
}
