//! Server configuration.
//!
//! Process-level flags (addresses, file locations) come from clap/env; the
//! federation profile — domains, endpoints, policy, key locations, limits —
//! lives in a TOML file so the same binary can serve as TA or IA. Everything
//! is read once at startup and passed around explicitly; nothing here
//! mutates after boot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

/// Command-line / environment configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "fedanchor-server")]
pub struct ServerConfig {
    /// HTTP listen address.
    #[arg(long, env = "FEDANCHOR_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// Redis connection URL for the cache store.
    #[arg(long, env = "FEDANCHOR_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// SQLite database path for durable records.
    #[arg(long, env = "FEDANCHOR_DB", default_value = "fedanchor.db")]
    pub db_path: String,

    /// Federation profile (TOML).
    #[arg(long, env = "FEDANCHOR_PROFILE", default_value = "fedanchor.toml")]
    pub profile: String,
}

/// Per-type defaults applied when an administrator omits a field.
#[derive(Debug, Clone, Deserialize)]
pub struct TrustMarkTypeDefaults {
    #[serde(default = "default_valid_for")]
    pub valid_for: i64,
    #[serde(default = "default_renewal_time")]
    pub renewal_time: i64,
    #[serde(default)]
    pub autorenew: bool,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Default for TrustMarkTypeDefaults {
    fn default() -> Self {
        TrustMarkTypeDefaults {
            valid_for: default_valid_for(),
            renewal_time: default_renewal_time(),
            autorenew: false,
            active: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub trustmarktype: TrustMarkTypeDefaults,
}

fn default_valid_for() -> i64 {
    8760 // one year, in hours
}

fn default_renewal_time() -> i64 {
    48
}

fn default_true() -> bool {
    true
}

fn default_server_expiry() -> i64 {
    8760
}

fn default_fetch_timeout() -> u64 {
    10
}

/// The federation profile as stored on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    /// This trust anchor's entity identifier (`iss`/`sub` of its statements).
    pub ta_domain: String,

    /// Issuer written into trust marks. Usually equal to `ta_domain`.
    #[serde(default)]
    pub trustmark_provider: Option<String>,

    /// `metadata.federation_entity` of the TA's entity configuration
    /// (fetch/list/resolve endpoint URLs).
    pub federation_entity: serde_json::Value,

    /// Superior entities; non-empty makes this an intermediate authority.
    #[serde(default)]
    pub authority_hints: Vec<String>,

    /// Trust marks issued to the TA itself, published in its configuration.
    #[serde(default)]
    pub ta_trustmarks: Vec<serde_json::Value>,

    /// trust_mark_type → entity ids allowed to issue it.
    #[serde(default)]
    pub ta_trusted_trustmark_issuers: HashMap<String, Vec<String>>,

    /// Path to the private signing JWK.
    pub signing_private_key: PathBuf,

    /// Additional active public JWK files (e.g. pre-published rollover key).
    #[serde(default)]
    pub signing_public_keys: Vec<PathBuf>,

    /// Path to the metadata policy document (JSON).
    pub policy_document: PathBuf,

    /// Directory of retired keys for the historical-keys endpoint.
    #[serde(default)]
    pub historical_keys_dir: Option<PathBuf>,

    /// Lifetime of the TA's own entity configuration, in hours.
    #[serde(default = "default_server_expiry")]
    pub server_expiry: i64,

    /// Upper bound for a subordinate's `valid_for`, in hours.
    #[serde(default = "default_valid_for")]
    pub subordinate_default_valid_for: i64,

    /// Timeout for outbound federation fetches, in seconds.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    #[serde(default)]
    pub ta_defaults: Defaults,
}

/// The profile after resolution: policy document loaded, defaults filled.
#[derive(Debug, Clone)]
pub struct TrustAnchorConfig {
    pub ta_domain: String,
    pub trustmark_provider: String,
    pub federation_entity: serde_json::Value,
    pub authority_hints: Vec<String>,
    pub ta_trustmarks: Vec<serde_json::Value>,
    pub ta_trusted_trustmark_issuers: HashMap<String, Vec<String>>,
    pub policy_document: serde_json::Value,
    pub server_expiry: i64,
    pub subordinate_default_valid_for: i64,
    pub fetch_timeout: Duration,
    pub tmtype_defaults: TrustMarkTypeDefaults,
    pub signing_private_key: PathBuf,
    pub signing_public_keys: Vec<PathBuf>,
    pub historical_keys_dir: Option<PathBuf>,
}

impl TrustAnchorConfig {
    /// Read the TOML profile and the policy document it points to.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read profile {}: {e}", path.display()))?;
        let profile: Profile = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("cannot parse profile {}: {e}", path.display()))?;
        // Paths in the profile are relative to the profile file itself.
        let base = path.parent().unwrap_or(Path::new("."));
        Self::from_profile(profile, base)
    }

    pub fn from_profile(profile: Profile, base: &Path) -> anyhow::Result<Self> {
        let resolve = |p: &Path| -> PathBuf {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base.join(p)
            }
        };
        let policy_path = resolve(&profile.policy_document);
        let policy_document: serde_json::Value = if policy_path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&policy_path)?)
                .map_err(|e| anyhow::anyhow!("bad policy document {}: {e}", policy_path.display()))?
        } else {
            anyhow::bail!("policy document {} not found", policy_path.display());
        };

        Ok(TrustAnchorConfig {
            trustmark_provider: profile
                .trustmark_provider
                .unwrap_or_else(|| profile.ta_domain.clone()),
            ta_domain: profile.ta_domain,
            federation_entity: profile.federation_entity,
            authority_hints: profile.authority_hints,
            ta_trustmarks: profile.ta_trustmarks,
            ta_trusted_trustmark_issuers: profile.ta_trusted_trustmark_issuers,
            policy_document,
            server_expiry: profile.server_expiry,
            subordinate_default_valid_for: profile.subordinate_default_valid_for,
            fetch_timeout: Duration::from_secs(profile.fetch_timeout_secs),
            tmtype_defaults: profile.ta_defaults.trustmarktype,
            signing_private_key: resolve(&profile.signing_private_key),
            signing_public_keys: profile
                .signing_public_keys
                .iter()
                .map(|p| resolve(p))
                .collect(),
            historical_keys_dir: profile.historical_keys_dir.as_deref().map(resolve),
        })
    }

    /// The TA policy's `metadata_policy` member, if one is configured.
    pub fn metadata_policy(&self) -> Option<&serde_json::Value> {
        self.policy_document
            .get("metadata_policy")
            .filter(|v| v.as_object().is_some_and(|m| !m.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"
        ta_domain = "https://ta.example.org"
        signing_private_key = "private.json"
        policy_document = "policy.json"

        [federation_entity]
        federation_fetch_endpoint = "https://ta.example.org/fetch"
        federation_list_endpoint = "https://ta.example.org/list"
        federation_resolve_endpoint = "https://ta.example.org/resolve"
    "#;

    #[test]
    fn profile_defaults() {
        let profile: Profile = toml::from_str(PROFILE).unwrap();
        assert_eq!(profile.ta_domain, "https://ta.example.org");
        assert!(profile.trustmark_provider.is_none());
        assert!(profile.authority_hints.is_empty());
        assert_eq!(profile.server_expiry, 8760);
        assert_eq!(profile.subordinate_default_valid_for, 8760);
        assert_eq!(profile.ta_defaults.trustmarktype.valid_for, 8760);
        assert_eq!(profile.ta_defaults.trustmarktype.renewal_time, 48);
        assert!(profile.ta_defaults.trustmarktype.active);
        assert!(!profile.ta_defaults.trustmarktype.autorenew);
        assert_eq!(
            profile.federation_entity["federation_fetch_endpoint"],
            "https://ta.example.org/fetch"
        );
    }

    #[test]
    fn trustmark_provider_falls_back_to_ta_domain() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("policy.json"), r#"{"metadata_policy": {}}"#).unwrap();
        let profile: Profile = toml::from_str(PROFILE).unwrap();
        let config = TrustAnchorConfig::from_profile(profile, dir.path()).unwrap();
        assert_eq!(config.trustmark_provider, "https://ta.example.org");
        assert!(config.metadata_policy().is_none()); // empty map counts as no policy
    }

    #[test]
    fn metadata_policy_present_when_nonempty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("policy.json"),
            r#"{"metadata_policy": {"openid_relying_party": {"grant_types": {"subset_of": ["authorization_code"]}}}}"#,
        )
        .unwrap();
        let profile: Profile = toml::from_str(PROFILE).unwrap();
        let config = TrustAnchorConfig::from_profile(profile, dir.path()).unwrap();
        assert!(config.metadata_policy().is_some());
    }
}
