//! Trust-chain resolver.
//!
//! Assembles the chain subject → subordinate statement → trust anchor,
//! computes the effective metadata (declared metadata overlaid with the
//! statement's forced metadata, then run through the TA policy), and signs
//! a resolve response whose `exp` is the minimum along the chain.

use fedanchor_jose::jws;
use serde_json::{Value, json};

use crate::config::TrustAnchorConfig;
use crate::error::{FederationError, Result};
use crate::policy::apply_policy;
use crate::server::AppState;
use crate::util::unix_now;

/// Resolve a subject against this trust anchor.
pub async fn resolve(
    state: &AppState,
    sub: &str,
    trust_anchor: &str,
    entity_types: &[String],
) -> Result<String> {
    if trust_anchor != state.config.ta_domain {
        return Err(FederationError::ChainIncomplete(format!(
            "{trust_anchor} is not this trust anchor"
        )));
    }

    // The subject's self-signed configuration, fetched live.
    let entity = state
        .fetcher
        .fetch_self_verified(sub)
        .await
        .map_err(|e| FederationError::ChainIncomplete(e.to_string()))?;

    // Our signed statement about the subject.
    let statement = state
        .cache
        .subordinate_statement(sub)
        .await?
        .ok_or_else(|| {
            FederationError::ChainIncomplete(format!("no subordinate statement for {sub}"))
        })?;

    // Our own entity configuration closes the chain.
    let ta_config = state
        .cache
        .entity_configuration()
        .await?
        .ok_or_else(|| FederationError::ChainIncomplete("trust anchor configuration missing".into()))?;

    // Effective metadata.
    let (_, statement_claims) = jws::decode_insecure(&statement)?;
    let mut metadata = entity.claims.get("metadata").cloned().unwrap_or_else(|| json!({}));
    if let Some(forced) = statement_claims.get("metadata") {
        deep_merge(&mut metadata, forced);
    }
    if let Some(policy) = state.config.metadata_policy() {
        metadata = apply_policy(policy, &metadata)?;
    }

    // Entity-type filtering, only when a requested type is present.
    filter_entity_types(&mut metadata, entity_types);

    // The response can never outlive any link of the chain.
    let chain = [entity.raw.as_str(), statement.as_str(), ta_config.as_str()];
    let exp = min_chain_exp(&chain).ok_or_else(|| {
        FederationError::ChainIncomplete("chain entry without an exp claim".into())
    })?;

    // Sign the resolution.
    let mut claims = json!({
        "iss": state.config.ta_domain,
        "sub": sub,
        "iat": unix_now(),
        "exp": exp,
        "metadata": metadata,
        "trust_chain": [entity.raw, statement, ta_config],
    });
    let marks = trusted_marks(&state.config, entity.claims.get("trust_marks"));
    if !marks.is_empty() {
        claims["trust_marks"] = Value::Array(marks);
    }
    Ok(jws::sign(
        &claims,
        state.keys.active_private_signing_key(),
        Some("resolve-response+jwt"),
    )?)
}

/// Recursive JSON merge: objects merge member-wise, everything else —
/// including arrays — is replaced by the overlay.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Retain only the requested entity types — but only if at least one of
/// them is actually present. Requesting a type the subject does not have
/// is not an error and leaves the metadata untouched.
pub fn filter_entity_types(metadata: &mut Value, requested: &[String]) {
    if requested.is_empty() {
        return;
    }
    let Some(map) = metadata.as_object_mut() else {
        return;
    };
    if !requested.iter().any(|t| map.contains_key(t)) {
        return;
    }
    map.retain(|key, _| requested.iter().any(|t| t == key));
}

/// The minimum `exp` across the chain's entries; `None` if any entry lacks
/// one or fails to decode.
pub fn min_chain_exp(chain: &[&str]) -> Option<i64> {
    chain
        .iter()
        .map(|token| {
            let (_, claims) = jws::decode_insecure(token).ok()?;
            claims.get("exp").and_then(Value::as_i64)
        })
        .collect::<Option<Vec<i64>>>()?
        .into_iter()
        .min()
}

/// Trust marks from the subject's configuration, filtered to trusted
/// issuers when the profile pins any. Each entry must parse and its
/// payload's issuer must be allowed for the mark's type.
fn trusted_marks(config: &TrustAnchorConfig, marks: Option<&Value>) -> Vec<Value> {
    let Some(entries) = marks.and_then(Value::as_array) else {
        return Vec::new();
    };
    if config.ta_trusted_trustmark_issuers.is_empty() {
        return entries.clone();
    }
    entries
        .iter()
        .filter(|entry| {
            let Some(token) = entry.get("trust_mark").and_then(Value::as_str) else {
                return false;
            };
            let Ok((_, claims)) = jws::decode_insecure(token) else {
                return false;
            };
            let tmtype = claims.get("trust_mark_type").and_then(Value::as_str);
            let iss = claims.get("iss").and_then(Value::as_str);
            match (tmtype, iss) {
                (Some(tmtype), Some(iss)) => config
                    .ta_trusted_trustmark_issuers
                    .get(tmtype)
                    .is_some_and(|issuers| issuers.iter().any(|i| i == iss)),
                _ => false,
            }
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_config, test_key};
    use crate::trustmarks::sign_mark;

    #[test]
    fn deep_merge_overlays_objects_and_replaces_arrays() {
        let mut base = json!({
            "openid_provider": {
                "application_type": "web",
                "subject_types_supported": ["public"],
                "nested": {"keep": 1, "swap": 1}
            },
            "federation_entity": {"organization_name": "Example"}
        });
        let overlay = json!({
            "openid_provider": {
                "application_type": "mutant",
                "subject_types_supported": ["pairwise", "public", "e2e"],
                "nested": {"swap": 2}
            },
            "extra_field": "extra_value"
        });
        deep_merge(&mut base, &overlay);
        assert_eq!(base["openid_provider"]["application_type"], "mutant");
        // Arrays replace wholesale
        assert_eq!(
            base["openid_provider"]["subject_types_supported"],
            json!(["pairwise", "public", "e2e"])
        );
        assert_eq!(base["openid_provider"]["nested"], json!({"keep": 1, "swap": 2}));
        assert_eq!(base["federation_entity"]["organization_name"], "Example");
        assert_eq!(base["extra_field"], "extra_value");
    }

    #[test]
    fn entity_type_filter_keeps_requested_present_types() {
        let mut metadata = json!({
            "openid_provider": {"issuer": "https://op"},
            "federation_entity": {"organization_name": "Example"}
        });
        filter_entity_types(&mut metadata, &["openid_provider".to_string()]);
        let map = metadata.as_object().unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("openid_provider"));
    }

    #[test]
    fn entity_type_filter_ignores_absent_types() {
        let mut metadata = json!({
            "openid_provider": {"issuer": "https://op"},
            "federation_entity": {"organization_name": "Example"}
        });
        filter_entity_types(&mut metadata, &["a_wrong_type".to_string()]);
        assert_eq!(metadata.as_object().unwrap().len(), 2);
    }

    #[test]
    fn min_exp_over_synthetic_chain() {
        let key = test_key();
        let mk = |exp: i64| {
            jws::sign(&json!({"iss": "x", "exp": exp}), &key, None).unwrap()
        };
        let chain = [mk(300), mk(100), mk(200)];
        let refs: Vec<&str> = chain.iter().map(String::as_str).collect();
        assert_eq!(min_chain_exp(&refs), Some(100));

        let missing = jws::sign(&json!({"iss": "x"}), &key, None).unwrap();
        let refs = [chain[0].as_str(), missing.as_str()];
        assert_eq!(min_chain_exp(&refs), None);
    }

    #[test]
    fn trusted_issuer_filtering() {
        let mut config = test_config();
        let key = test_key();
        let (mark, _) = sign_mark(
            &config,
            &key,
            "https://rp.example.org",
            "https://t.example/tm",
            1,
            None,
        )
        .unwrap();
        let marks = json!([{"trust_mark_type": "https://t.example/tm", "trust_mark": mark}]);

        // No pinned issuers: everything passes through
        assert_eq!(trusted_marks(&config, Some(&marks)).len(), 1);

        // Pinned to the issuing provider: passes
        config.ta_trusted_trustmark_issuers.insert(
            "https://t.example/tm".into(),
            vec!["https://ta.example.org".into()],
        );
        assert_eq!(trusted_marks(&config, Some(&marks)).len(), 1);

        // Pinned to someone else: filtered out
        config.ta_trusted_trustmark_issuers.insert(
            "https://t.example/tm".into(),
            vec!["https://other.example.org".into()],
        );
        assert!(trusted_marks(&config, Some(&marks)).is_empty());

        // Garbage entries never pass a pinned filter
        let junk = json!([{"trust_mark": "!!not-a-jws!!"}]);
        assert!(trusted_marks(&config, Some(&junk)).is_empty());
    }
}
