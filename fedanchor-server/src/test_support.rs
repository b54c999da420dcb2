//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use fedanchor_jose::{HistoricalKey, Jwk, KeyStore};
use serde_json::json;

use crate::config::{TrustAnchorConfig, TrustMarkTypeDefaults};

pub fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

/// A fresh Ed25519 signing JWK.
pub fn test_key() -> Jwk {
    let sk = ed25519_dalek::SigningKey::generate(&mut rand::thread_rng());
    let mut key = Jwk {
        kty: "OKP".into(),
        kid: None,
        use_: Some("sig".into()),
        alg: Some("Ed25519".into()),
        n: None,
        e: None,
        crv: Some("Ed25519".into()),
        x: Some(b64(sk.verifying_key().as_bytes())),
        y: None,
        d: Some(b64(&sk.to_bytes())),
        p: None,
        q: None,
        dp: None,
        dq: None,
        qi: None,
    };
    key.kid = Some(key.thumbprint().unwrap());
    key
}

pub fn test_keystore(historical: Vec<HistoricalKey>) -> KeyStore {
    KeyStore::from_keys(test_key(), historical).unwrap()
}

pub fn test_config() -> TrustAnchorConfig {
    TrustAnchorConfig {
        ta_domain: "https://ta.example.org".into(),
        trustmark_provider: "https://ta.example.org".into(),
        federation_entity: json!({
            "federation_fetch_endpoint": "https://ta.example.org/fetch",
            "federation_list_endpoint": "https://ta.example.org/list",
            "federation_resolve_endpoint": "https://ta.example.org/resolve",
        }),
        authority_hints: Vec::new(),
        ta_trustmarks: Vec::new(),
        ta_trusted_trustmark_issuers: HashMap::new(),
        policy_document: json!({"metadata_policy": {}}),
        server_expiry: 8760,
        subordinate_default_valid_for: 8760,
        fetch_timeout: Duration::from_secs(10),
        tmtype_defaults: TrustMarkTypeDefaults::default(),
        signing_private_key: PathBuf::from("private.json"),
        signing_public_keys: Vec::new(),
        historical_keys_dir: None,
    }
}
