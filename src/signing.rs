//! Short-lived URL signing for ad and segment delivery.
//!
//! Signs absolute paths with HMAC-SHA256 over `path || exp || ip` and appends
//! `token`/`exp`/`ip` query parameters. The CDN edge (or this proxy) verifies
//! with the same shared secret. Tokens expire after the configured TTL and
//! can optionally be bound to the requesting client IP.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

/// Default token lifetime in seconds
pub const DEFAULT_TTL_SECS: u64 = 900;

#[derive(Error, Debug, PartialEq)]
pub enum SignError {
    /// Signed paths must be absolute
    #[error("path must begin with '/': {0}")]
    InvalidPath(String),
}

/// Why a signed URL failed verification. Reasons are safe to log; they
/// never carry the token or secret.
#[derive(Error, Debug, PartialEq)]
pub enum VerifyError {
    #[error("URL is not parseable")]
    Malformed,
    #[error("token or exp parameter missing")]
    MissingParams,
    #[error("token expired")]
    Expired,
    #[error("token mismatch")]
    TokenMismatch,
    #[error("client IP does not match signed IP")]
    IpMismatch,
}

/// Path signer bound to one opaque secret.
///
/// The secret is injected at startup and never logged; `Debug` is
/// intentionally not derived.
#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
}

impl UrlSigner {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Sign `path` for delivery from `host`.
    ///
    /// Produces `https://{host}{path}?token=<hex64>&exp=<unix>[&ip=<addr>]`
    /// where the token is `hex(HMAC_SHA256(secret, path || exp || ip))`.
    /// `path` must begin with `/`.
    pub fn sign(
        &self,
        host: &str,
        path: &str,
        ttl_secs: u64,
        ip: Option<&str>,
    ) -> Result<String, SignError> {
        let now = unix_now();
        self.sign_at(host, path, ttl_secs, ip, now)
    }

    /// Like [`sign`](Self::sign) with an explicit clock, for deterministic tests.
    pub fn sign_at(
        &self,
        host: &str,
        path: &str,
        ttl_secs: u64,
        ip: Option<&str>,
        now_unix: u64,
    ) -> Result<String, SignError> {
        if !path.starts_with('/') {
            return Err(SignError::InvalidPath(path.to_string()));
        }

        let exp = now_unix + ttl_secs;
        let token = self.token_for(path, exp, ip);

        let mut url = format!("https://{host}{path}?token={token}&exp={exp}");
        if let Some(ip) = ip {
            url.push_str("&ip=");
            url.push_str(ip);
        }
        Ok(url)
    }

    /// Verify a signed URL at time `now_unix`.
    ///
    /// Recomputes the token from the URL's path and parameters and compares
    /// in constant time. Rejects expired tokens (`now >= exp`) and, when the
    /// URL carries a signed `ip`, a disagreeing `client_ip`.
    pub fn verify(
        &self,
        url: &str,
        now_unix: u64,
        client_ip: Option<&str>,
    ) -> Result<(), VerifyError> {
        let parsed = Url::parse(url).map_err(|_| VerifyError::Malformed)?;
        let path = parsed.path().to_string();

        let mut token = None;
        let mut exp = None;
        let mut signed_ip = None;
        for (k, v) in parsed.query_pairs() {
            match k.as_ref() {
                "token" => token = Some(v.to_string()),
                "exp" => exp = v.parse::<u64>().ok(),
                "ip" => signed_ip = Some(v.to_string()),
                _ => {}
            }
        }

        let token = token.ok_or(VerifyError::MissingParams)?;
        let exp = exp.ok_or(VerifyError::MissingParams)?;

        if now_unix >= exp {
            return Err(VerifyError::Expired);
        }

        if let Some(ref signed) = signed_ip {
            match client_ip {
                Some(client) if client == signed => {}
                _ => return Err(VerifyError::IpMismatch),
            }
        }

        let expected = self.token_for(&path, exp, signed_ip.as_deref());
        if expected.as_bytes().ct_eq(token.as_bytes()).into() {
            Ok(())
        } else {
            Err(VerifyError::TokenMismatch)
        }
    }

    fn token_for(&self, path: &str, exp: u64, ip: Option<&str>) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(path.as_bytes());
        mac.update(exp.to_string().as_bytes());
        if let Some(ip) = ip {
            mac.update(ip.as_bytes());
        }
        hex::encode(mac.finalize().into_bytes())
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> UrlSigner {
        UrlSigner::new(b"test-secret".to_vec())
    }

    #[test]
    fn sign_verify_roundtrip() {
        let s = signer();
        let url = s
            .sign_at("cdn.example.com", "/ads/pod-1/master.m3u8", 900, None, 1_700_000_000)
            .unwrap();

        assert!(url.starts_with("https://cdn.example.com/ads/pod-1/master.m3u8?token="));
        assert!(url.contains("&exp=1700000900"));
        assert_eq!(s.verify(&url, 1_700_000_100, None), Ok(()));
    }

    #[test]
    fn sign_verify_roundtrip_with_ip() {
        let s = signer();
        let url = s
            .sign_at("cdn.example.com", "/a.ts", 60, Some("203.0.113.9"), 1_000)
            .unwrap();

        assert!(url.ends_with("&ip=203.0.113.9"));
        assert_eq!(s.verify(&url, 1_030, Some("203.0.113.9")), Ok(()));
        assert_eq!(
            s.verify(&url, 1_030, Some("203.0.113.10")),
            Err(VerifyError::IpMismatch)
        );
        assert_eq!(s.verify(&url, 1_030, None), Err(VerifyError::IpMismatch));
    }

    #[test]
    fn relative_path_rejected() {
        let s = signer();
        assert_eq!(
            s.sign_at("cdn.example.com", "no-slash.ts", 60, None, 0),
            Err(SignError::InvalidPath("no-slash.ts".to_string()))
        );
    }

    #[test]
    fn expired_token_rejected() {
        let s = signer();
        let url = s.sign_at("cdn.example.com", "/a.ts", 60, None, 1_000).unwrap();

        // now == exp is already expired
        assert_eq!(s.verify(&url, 1_060, None), Err(VerifyError::Expired));
        assert_eq!(s.verify(&url, 2_000, None), Err(VerifyError::Expired));
    }

    #[test]
    fn tampered_path_rejected() {
        let s = signer();
        let url = s.sign_at("cdn.example.com", "/a.ts", 60, None, 1_000).unwrap();
        let tampered = url.replace("/a.ts", "/b.ts");
        assert_eq!(s.verify(&tampered, 1_030, None), Err(VerifyError::TokenMismatch));
    }

    #[test]
    fn tampered_exp_rejected() {
        let s = signer();
        let url = s.sign_at("cdn.example.com", "/a.ts", 60, None, 1_000).unwrap();
        let tampered = url.replace("exp=1060", "exp=9999");
        assert_eq!(s.verify(&tampered, 1_030, None), Err(VerifyError::TokenMismatch));
    }

    #[test]
    fn tampered_token_rejected() {
        let s = signer();
        let url = s.sign_at("cdn.example.com", "/a.ts", 60, None, 1_000).unwrap();

        // Flip one hex digit of the token
        let token_start = url.find("token=").unwrap() + 6;
        let mut bytes = url.into_bytes();
        bytes[token_start] = if bytes[token_start] == b'0' { b'1' } else { b'0' };
        let tampered = String::from_utf8(bytes).unwrap();

        assert_eq!(s.verify(&tampered, 1_030, None), Err(VerifyError::TokenMismatch));
    }

    #[test]
    fn missing_params_rejected() {
        let s = signer();
        assert_eq!(
            s.verify("https://cdn.example.com/a.ts", 0, None),
            Err(VerifyError::MissingParams)
        );
        assert_eq!(
            s.verify("https://cdn.example.com/a.ts?token=deadbeef", 0, None),
            Err(VerifyError::MissingParams)
        );
    }

    #[test]
    fn different_secret_rejected() {
        let url = signer().sign_at("cdn.example.com", "/a.ts", 60, None, 1_000).unwrap();
        let other = UrlSigner::new(b"other-secret".to_vec());
        assert_eq!(other.verify(&url, 1_030, None), Err(VerifyError::TokenMismatch));
    }
}
