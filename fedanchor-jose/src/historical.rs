//! Retired signing keys.
//!
//! A historical key is a public JWK plus `exp` (the retirement timestamp)
//! and optional revocation metadata. Keys are read from a directory of JSON
//! files; anything without `exp` is not a historical key and is skipped.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::JoseError;
use crate::jwk::Jwk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevocationReason {
    Unspecified,
    Compromised,
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revocation {
    pub revoked_at: i64,
    pub reason: RevocationReason,
}

/// A retired key as published by the historical-keys endpoint. The embedded
/// JWK members and the `revoked` object are carried verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalKey {
    #[serde(flatten)]
    pub key: Jwk,
    /// Unix timestamp at which the key was retired.
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked: Option<Revocation>,
}

/// Load every historical key from a directory of `*.json` files.
///
/// Files that fail to parse or lack `exp` are skipped with a warning; a
/// missing directory is an error so misconfiguration is visible at startup.
pub fn load_dir(dir: &Path) -> Result<Vec<HistoricalKey>, JoseError> {
    let mut keys = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = std::fs::read_to_string(&path)?;
        match serde_json::from_str::<HistoricalKey>(&raw) {
            Ok(key) => keys.push(key),
            Err(e) => {
                tracing::warn!(file = %path.display(), "skipping historical key: {e}");
            }
        }
    }
    Ok(keys)
}
