//! The trust anchor's live key material.
//!
//! Loaded once at startup from configuration: one private signing JWK, any
//! number of additional public JWKs, and the historical-keys directory.
//! Everything here is read-only after construction.

use std::path::{Path, PathBuf};

use crate::error::JoseError;
use crate::historical::{self, HistoricalKey};
use crate::jwk::{Jwk, JwkSet};

pub struct KeyStore {
    signing_key: Jwk,
    public_keys: JwkSet,
    historical: Vec<HistoricalKey>,
}

impl KeyStore {
    /// Load the key store from disk.
    ///
    /// `private_key_path` must hold a private JWK; `public_key_paths` may add
    /// further active public keys (e.g. a successor key published ahead of a
    /// rollover); `historical_dir`, when set, is scanned for retired keys.
    pub fn load(
        private_key_path: &Path,
        public_key_paths: &[PathBuf],
        historical_dir: Option<&Path>,
    ) -> Result<Self, JoseError> {
        let raw = std::fs::read_to_string(private_key_path)?;
        let signing_key: Jwk = serde_json::from_str(&raw)?;
        if !signing_key.is_private() {
            return Err(JoseError::InvalidKey(format!(
                "{} does not contain a private key",
                private_key_path.display()
            )));
        }
        // Fail early if the algorithm is not one we can sign with.
        let alg = signing_key.algorithm()?;

        let mut public_keys = JwkSet::new();
        public_keys.add(signing_key.public());
        for path in public_key_paths {
            let raw = std::fs::read_to_string(path)?;
            let key: Jwk = serde_json::from_str(&raw)?;
            public_keys.add(key.public());
        }

        let historical = match historical_dir {
            Some(dir) if dir.is_dir() => historical::load_dir(dir)?,
            Some(dir) => {
                tracing::warn!(dir = %dir.display(), "historical keys directory not found");
                Vec::new()
            }
            None => Vec::new(),
        };

        tracing::info!(
            kid = %signing_key.key_id()?,
            alg = alg.jwk_name(),
            active_keys = public_keys.keys.len(),
            historical_keys = historical.len(),
            "key store loaded"
        );
        Ok(KeyStore {
            signing_key,
            public_keys,
            historical,
        })
    }

    /// Build a key store from already-parsed keys (tests, embedded setups).
    pub fn from_keys(signing_key: Jwk, historical: Vec<HistoricalKey>) -> Result<Self, JoseError> {
        if !signing_key.is_private() {
            return Err(JoseError::InvalidKey("not a private key".into()));
        }
        let mut public_keys = JwkSet::new();
        public_keys.add(signing_key.public());
        Ok(KeyStore {
            signing_key,
            public_keys,
            historical,
        })
    }

    pub fn active_private_signing_key(&self) -> &Jwk {
        &self.signing_key
    }

    /// The active public keyset: never contains private members, `exp`, or
    /// revocation metadata.
    pub fn active_public_keyset(&self) -> &JwkSet {
        &self.public_keys
    }

    pub fn historical_keys(&self) -> &[HistoricalKey] {
        &self.historical
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwk::b64url_encode;

    fn test_key() -> Jwk {
        let sk = ed25519_dalek::SigningKey::generate(&mut rand::thread_rng());
        let mut key = Jwk {
            kty: "OKP".into(),
            kid: None,
            use_: Some("sig".into()),
            alg: Some("Ed25519".into()),
            n: None,
            e: None,
            crv: Some("Ed25519".into()),
            x: Some(b64url_encode(sk.verifying_key().as_bytes())),
            y: None,
            d: Some(b64url_encode(&sk.to_bytes())),
            p: None,
            q: None,
            dp: None,
            dq: None,
            qi: None,
        };
        key.kid = Some(key.thumbprint().unwrap());
        key
    }

    #[test]
    fn load_from_disk_and_derive_public_set() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key();
        let key_path = dir.path().join("private.json");
        std::fs::write(&key_path, serde_json::to_string(&key).unwrap()).unwrap();

        let hist_dir = dir.path().join("historical");
        std::fs::create_dir(&hist_dir).unwrap();
        std::fs::write(
            hist_dir.join("old.json"),
            r#"{"kty":"OKP","crv":"Ed25519","kid":"old","x":"AA","exp":1700000000}"#,
        )
        .unwrap();

        let store = KeyStore::load(&key_path, &[], Some(&hist_dir)).unwrap();
        assert!(store.active_private_signing_key().is_private());
        assert_eq!(store.active_public_keyset().keys.len(), 1);
        assert!(!store.active_public_keyset().keys[0].is_private());
        assert_eq!(store.historical_keys().len(), 1);
    }

    #[test]
    fn public_key_file_is_rejected_as_signing_key() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key().public();
        let key_path = dir.path().join("public.json");
        std::fs::write(&key_path, serde_json::to_string(&key).unwrap()).unwrap();
        assert!(matches!(
            KeyStore::load(&key_path, &[], None),
            Err(JoseError::InvalidKey(_))
        ));
    }
}
