//! Fetching and validating remote entity configurations.
//!
//! Every outbound call goes through one `reqwest` client with a bounded
//! timeout; failures surface as `FetchError` and are never retried here.

use std::time::Duration;

use fedanchor_jose::{JwkSet, JwsHeader, jws};
use serde_json::Value;

use crate::error::{FederationError, Result};

pub const WELL_KNOWN_PATH: &str = "/.well-known/openid-federation";

/// A fetched and signature-verified entity configuration.
#[derive(Debug, Clone)]
pub struct FetchedEntity {
    pub header: JwsHeader,
    pub claims: Value,
    /// The serialized JWS exactly as the entity published it.
    pub raw: String,
}

#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Fetcher { client }
    }

    /// GET a URL and return its body, mapping transport errors, timeouts,
    /// and non-2xx statuses to `FetchError`.
    pub async fn get_text(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_error(url, &e))?;
        if !resp.status().is_success() {
            return Err(FederationError::FetchError {
                url: url.to_string(),
                reason: format!("status {}", resp.status().as_u16()),
            });
        }
        resp.text().await.map_err(|e| fetch_error(url, &e))
    }

    pub async fn get_json(&self, url: &str) -> Result<Value> {
        let body = self.get_text(url).await?;
        serde_json::from_str(&body).map_err(|e| FederationError::FetchError {
            url: url.to_string(),
            reason: format!("invalid JSON body: {e}"),
        })
    }

    /// Fetch the entity's well-known configuration without verifying it.
    pub async fn fetch_raw_configuration(&self, entityid: &str) -> Result<String> {
        self.get_text(&format!("{entityid}{WELL_KNOWN_PATH}")).await
    }

    /// Fetch an entity configuration and verify it against keys the caller
    /// supplies (the admission path: the administrator vouches for the keys).
    pub async fn fetch_with_keys(&self, entityid: &str, keys: &JwkSet) -> Result<FetchedEntity> {
        let raw = self.fetch_raw_configuration(entityid).await?;
        let (header, claims) = jws::verify(&raw, keys)?;
        Ok(FetchedEntity { header, claims, raw })
    }

    /// Fetch an entity configuration and self-verify it with the `jwks`
    /// embedded in its own payload (the discovery path).
    pub async fn fetch_self_verified(&self, entityid: &str) -> Result<FetchedEntity> {
        let raw = self.fetch_raw_configuration(entityid).await?;
        self_verify(&raw)
    }
}

/// Verify a serialized entity configuration against its embedded `jwks`.
pub fn self_verify(raw: &str) -> Result<FetchedEntity> {
    let (_, claims) = jws::decode_insecure(raw)?;
    let jwks = claims
        .get("jwks")
        .ok_or_else(|| FederationError::MalformedJws("entity configuration has no jwks".into()))?;
    let keys = JwkSet::from_value(jwks)
        .map_err(|e| FederationError::MalformedJws(format!("bad embedded jwks: {e}")))?;
    let (header, claims) = jws::verify(raw, &keys)?;
    Ok(FetchedEntity {
        header,
        claims,
        raw: raw.to_string(),
    })
}

fn fetch_error(url: &str, e: &reqwest::Error) -> FederationError {
    let reason = if e.is_timeout() {
        "timeout".to_string()
    } else {
        e.to_string()
    };
    FederationError::FetchError {
        url: url.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_key;
    use fedanchor_jose::jws::sign;
    use serde_json::json;

    #[test]
    fn self_verify_accepts_own_keys() {
        let key = test_key();
        let jwks = serde_json::to_value(fedanchor_jose::JwkSet {
            keys: vec![key.public()],
        })
        .unwrap();
        let claims = json!({
            "iss": "https://rp.example.org",
            "sub": "https://rp.example.org",
            "jwks": jwks,
            "metadata": {"openid_relying_party": {}}
        });
        let raw = sign(&claims, &key, Some("entity-statement+jwt")).unwrap();
        let fetched = self_verify(&raw).unwrap();
        assert_eq!(fetched.claims["iss"], "https://rp.example.org");
        assert_eq!(fetched.raw, raw);
    }

    #[test]
    fn self_verify_rejects_foreign_keys() {
        let signer = test_key();
        let other = test_key();
        // Claims advertise a key that did not produce the signature
        let jwks = serde_json::to_value(fedanchor_jose::JwkSet {
            keys: vec![other.public()],
        })
        .unwrap();
        let claims = json!({"iss": "https://rp.example.org", "jwks": jwks});
        let raw = sign(&claims, &signer, None).unwrap();
        assert!(matches!(
            self_verify(&raw),
            Err(FederationError::InvalidSignature)
        ));
    }

    #[test]
    fn self_verify_requires_embedded_jwks() {
        let key = test_key();
        let raw = sign(&json!({"iss": "x"}), &key, None).unwrap();
        assert!(matches!(
            self_verify(&raw),
            Err(FederationError::MalformedJws(_))
        ));
    }
}
