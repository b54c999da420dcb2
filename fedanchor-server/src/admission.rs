//! Subordinate admission pipeline.
//!
//! One strict sequence for add, update, and renew:
//! fetch → verify → authority-hints check → policy merge → policy apply →
//! valid_for bound → sign statement → persist → publish to cache.
//! Any failure aborts the whole operation and leaves no durable state.

use fedanchor_jose::{JwkSet, jws};
use serde_json::{Value, json};

use crate::cache::EntityKind;
use crate::config::TrustAnchorConfig;
use crate::db::{self, NewSubordinate, SubordinateRow};
use crate::error::{FederationError, Result};
use crate::fetch::FetchedEntity;
use crate::policy::{apply_policy, merge_policies};
use crate::server::AppState;
use crate::util::{hours, unix_now};

/// Administrative input for adding or updating a subordinate.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub entityid: String,
    /// Metadata the entity advertised, as supplied by the administrator.
    pub metadata: Value,
    /// Metadata the TA forces into the signed statement.
    pub forced_metadata: Value,
    /// Keys the TA uses to verify this entity's configuration.
    pub jwks: Value,
    pub required_trustmarks: Option<String>,
    pub valid_for: Option<i64>,
    pub autorenew: bool,
    pub active: bool,
    pub additional_claims: Option<Value>,
}

/// Distinguishes a fresh admission from an idempotent read-back.
#[derive(Debug)]
pub enum AdmissionOutcome {
    Created(SubordinateRow),
    Exists(SubordinateRow),
}

/// Admit a new subordinate: run the pipeline, persist, publish.
pub async fn add_subordinate(state: &AppState, req: AdmissionRequest) -> Result<AdmissionOutcome> {
    let (fetched, statement, valid_for) = run_pipeline(state, &req.entityid, &req).await?;

    let new = NewSubordinate {
        entityid: req.entityid.clone(),
        valid_for,
        autorenew: req.autorenew,
        metadata: req.metadata.clone(),
        forced_metadata: req.forced_metadata.clone(),
        jwks: Some(req.jwks.clone()),
        required_trustmarks: req.required_trustmarks.clone(),
        active: req.active,
        statement: statement.clone(),
        additional_claims: req.additional_claims.clone(),
    };
    let row = match state.db.insert_subordinate(&new) {
        Ok(row) => row,
        Err(e) if db::is_unique_violation(&e) => {
            // Concurrent or repeated admission: the unique constraint
            // linearizes; hand back the existing row.
            let existing = state
                .db
                .get_subordinate_by_entityid(&req.entityid)?
                .ok_or_else(|| FederationError::NotFound(req.entityid.clone()))?;
            return Ok(AdmissionOutcome::Exists(existing));
        }
        Err(e) => return Err(e.into()),
    };

    publish(state, &row.entityid, &fetched.raw, &req.metadata, &statement).await?;
    tracing::info!(entity = %row.entityid, "subordinate admitted");
    Ok(AdmissionOutcome::Created(row))
}

/// Update a subordinate: re-run the pipeline with the new fields and
/// replace the persisted row.
pub async fn update_subordinate(
    state: &AppState,
    id: i64,
    req: AdmissionRequest,
) -> Result<SubordinateRow> {
    let row = state
        .db
        .get_subordinate(id)?
        .ok_or_else(|| FederationError::NotFound(format!("subordinate {id}")))?;

    let (fetched, statement, valid_for) = run_pipeline(state, &row.entityid, &req).await?;

    let updated = SubordinateRow {
        valid_for,
        autorenew: req.autorenew,
        metadata: req.metadata.clone(),
        forced_metadata: req.forced_metadata.clone(),
        jwks: Some(req.jwks.clone()),
        required_trustmarks: req.required_trustmarks.clone(),
        active: req.active,
        statement: Some(statement.clone()),
        additional_claims: req.additional_claims.clone(),
        ..row
    };
    state.db.update_subordinate(&updated)?;

    publish(state, &updated.entityid, &fetched.raw, &req.metadata, &statement).await?;
    tracing::info!(entity = %updated.entityid, "subordinate updated");
    Ok(updated)
}

/// Renew a subordinate: re-fetch, re-verify, and emit a fresh
/// statement from the stored fields. Refused for inactive subordinates.
pub async fn renew_subordinate(state: &AppState, id: i64) -> Result<SubordinateRow> {
    let row = state
        .db
        .get_subordinate(id)?
        .ok_or_else(|| FederationError::NotFound(format!("subordinate {id}")))?;
    if !row.active {
        return Err(FederationError::InactiveSubordinate(row.entityid));
    }

    let req = AdmissionRequest {
        entityid: row.entityid.clone(),
        metadata: row.metadata.clone(),
        forced_metadata: row.forced_metadata.clone(),
        jwks: row.jwks.clone().unwrap_or_else(|| json!({"keys": []})),
        required_trustmarks: row.required_trustmarks.clone(),
        valid_for: Some(row.valid_for),
        autorenew: row.autorenew,
        active: row.active,
        additional_claims: row.additional_claims.clone(),
    };
    let (fetched, statement, _) = run_pipeline(state, &row.entityid, &req).await?;

    let renewed = SubordinateRow {
        statement: Some(statement.clone()),
        ..row
    };
    state.db.update_subordinate(&renewed)?;

    publish(state, &renewed.entityid, &fetched.raw, &renewed.metadata, &statement).await?;
    tracing::info!(entity = %renewed.entityid, "subordinate statement renewed");
    Ok(renewed)
}

/// Republish every active subordinate's signed statement into the cache.
/// Run at startup so a cache that lagged a crashed admission catches up.
pub async fn republish_subordinates(state: &AppState) -> Result<usize> {
    let rows = state.db.list_active_subordinates()?;
    let mut published = 0;
    for row in &rows {
        let Some(statement) = row.statement.as_deref() else {
            continue;
        };
        state
            .cache
            .put_subordinate_statement(&row.entityid, statement)
            .await?;
        if let Some(obj) = row.metadata.as_object() {
            if !obj.is_empty() {
                state
                    .cache
                    .add_entity_kind(EntityKind::classify(&row.metadata), &row.entityid)
                    .await?;
            }
        }
        published += 1;
    }
    Ok(published)
}

/// Everything up to (and including) signing the statement.
async fn run_pipeline(
    state: &AppState,
    entityid: &str,
    req: &AdmissionRequest,
) -> Result<(FetchedEntity, String, i64)> {
    // Fetch the well-known configuration, verify with supplied keys.
    let keyset = JwkSet::from_value(&req.jwks)
        .map_err(|e| FederationError::MalformedJws(format!("supplied jwks: {e}")))?;
    let fetched = state.fetcher.fetch_with_keys(entityid, &keyset).await?;

    // Pure checks on the verified claims.
    vet_entity_claims(&state.config, &fetched.claims)?;
    let valid_for = bound_valid_for(&state.config, req.valid_for)?;

    // Sign the subordinate statement over the entity's public keys.
    let statement = build_subordinate_statement(
        &state.config,
        state.keys.active_private_signing_key(),
        entityid,
        &keyset.public(),
        valid_for,
        &req.forced_metadata,
        req.additional_claims.as_ref(),
    )?;
    Ok((fetched, statement, valid_for))
}

/// The pure checks: authority hints, policy merge, policy apply.
pub fn vet_entity_claims(config: &TrustAnchorConfig, claims: &Value) -> Result<()> {
    let hints = claims
        .get("authority_hints")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if !hints.iter().any(|h| h.as_str() == Some(&config.ta_domain)) {
        return Err(FederationError::AuthorityHintMissing(
            config.ta_domain.clone(),
        ));
    }

    if let Some(ta_policy) = config.metadata_policy() {
        if let Some(sub_policy) = claims.get("metadata_policy") {
            merge_policies(ta_policy, sub_policy)?;
        }
        let metadata = claims.get("metadata").cloned().unwrap_or_else(|| json!({}));
        apply_policy(ta_policy, &metadata)?;
    }
    Ok(())
}

/// The requested lifetime may not exceed the server bound.
pub fn bound_valid_for(config: &TrustAnchorConfig, requested: Option<i64>) -> Result<i64> {
    match requested {
        Some(hours) if hours > config.subordinate_default_valid_for => {
            Err(FederationError::ValidForExceedsLimit {
                requested: hours,
                limit: config.subordinate_default_valid_for,
            })
        }
        Some(hours) => Ok(hours),
        None => Ok(config.subordinate_default_valid_for),
    }
}

/// Compose and sign the subordinate statement.
pub fn build_subordinate_statement(
    config: &TrustAnchorConfig,
    signing_key: &fedanchor_jose::Jwk,
    entityid: &str,
    subordinate_keys: &JwkSet,
    valid_for: i64,
    forced_metadata: &Value,
    additional_claims: Option<&Value>,
) -> Result<String> {
    let now = unix_now();
    let mut claims = json!({
        "iss": config.ta_domain,
        "sub": entityid,
        "iat": now,
        "exp": now + hours(valid_for),
        "jwks": serde_json::to_value(subordinate_keys)?,
    });
    if let Some(policy) = config.metadata_policy() {
        claims["metadata_policy"] = policy.clone();
    }
    if forced_metadata.as_object().is_some_and(|m| !m.is_empty()) {
        claims["metadata"] = forced_metadata.clone();
    }
    if let (Some(Value::Object(extra)), Some(obj)) = (additional_claims, claims.as_object_mut()) {
        for (k, v) in extra {
            obj.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    Ok(jws::sign(&claims, signing_key, Some("entity-statement+jwt"))?)
}

/// Write the signed artifacts and indices into the cache and queue
/// the entity for tree-walking.
async fn publish(
    state: &AppState,
    entityid: &str,
    entity_jws: &str,
    declared_metadata: &Value,
    statement: &str,
) -> Result<()> {
    state
        .cache
        .put_subordinate_statement(entityid, statement)
        .await?;
    state
        .cache
        .put_subordinate_entity_jws(entityid, entity_jws)
        .await?;
    if declared_metadata.as_object().is_some_and(|m| !m.is_empty()) {
        let kind = EntityKind::classify(declared_metadata);
        state.cache.add_entity_kind(kind, entityid).await?;
    }
    state.cache.enqueue_walk(entityid).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_config, test_key};

    #[test]
    fn authority_hint_must_name_the_anchor() {
        let config = test_config();
        let ok = json!({"authority_hints": ["https://ta.example.org"], "metadata": {}});
        assert!(vet_entity_claims(&config, &ok).is_ok());

        let missing = json!({"metadata": {}});
        assert!(matches!(
            vet_entity_claims(&config, &missing),
            Err(FederationError::AuthorityHintMissing(_))
        ));

        let wrong = json!({"authority_hints": ["https://other.example.org"]});
        assert!(matches!(
            vet_entity_claims(&config, &wrong),
            Err(FederationError::AuthorityHintMissing(_))
        ));
    }

    #[test]
    fn policy_merge_conflict_aborts_admission() {
        let mut config = test_config();
        config.policy_document = json!({"metadata_policy": {
            "openid_provider": {"issuer": {"value": "https://a"}}
        }});
        let claims = json!({
            "authority_hints": ["https://ta.example.org"],
            "metadata_policy": {"openid_provider": {"issuer": {"value": "https://b"}}},
            "metadata": {}
        });
        assert!(matches!(
            vet_entity_claims(&config, &claims),
            Err(FederationError::PolicyMergeConflict(_))
        ));
    }

    #[test]
    fn policy_violation_aborts_admission() {
        let mut config = test_config();
        config.policy_document = json!({"metadata_policy": {
            "openid_relying_party": {"redirect_uris": {"essential": true}}
        }});
        let claims = json!({
            "authority_hints": ["https://ta.example.org"],
            "metadata": {"openid_relying_party": {}}
        });
        assert!(matches!(
            vet_entity_claims(&config, &claims),
            Err(FederationError::PolicyViolation(_))
        ));
    }

    #[test]
    fn valid_for_is_bounded() {
        let config = test_config();
        assert_eq!(bound_valid_for(&config, None).unwrap(), 8760);
        assert_eq!(bound_valid_for(&config, Some(24)).unwrap(), 24);
        assert!(matches!(
            bound_valid_for(&config, Some(9000)),
            Err(FederationError::ValidForExceedsLimit { requested: 9000, limit: 8760 })
        ));
    }

    #[test]
    fn subordinate_statement_claims() {
        let mut config = test_config();
        config.policy_document = json!({"metadata_policy": {
            "openid_provider": {"application_type": {"value": "web"}}
        }});
        let key = test_key();
        let mut sub_keys = JwkSet::new();
        sub_keys.add(test_key().public());

        let forced = json!({"openid_provider": {"application_type": "mutant"}});
        let extra = json!({"crit": ["jti"]});
        let token = build_subordinate_statement(
            &config,
            &key,
            "https://op.example.org",
            &sub_keys,
            24,
            &forced,
            Some(&extra),
        )
        .unwrap();

        let mut ta_keys = JwkSet::new();
        ta_keys.add(key.public());
        let (header, claims) = jws::verify(&token, &ta_keys).unwrap();
        assert_eq!(header.typ.as_deref(), Some("entity-statement+jwt"));
        assert_eq!(claims["iss"], "https://ta.example.org");
        assert_eq!(claims["sub"], "https://op.example.org");
        assert_eq!(
            claims["exp"].as_i64().unwrap() - claims["iat"].as_i64().unwrap(),
            24 * 3600
        );
        assert_eq!(claims["metadata"], forced);
        assert_eq!(
            claims["metadata_policy"]["openid_provider"]["application_type"]["value"],
            "web"
        );
        assert_eq!(claims["crit"], json!(["jti"]));
        assert_eq!(claims["jwks"]["keys"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn additional_claims_cannot_override_core_claims() {
        let config = test_config();
        let key = test_key();
        let token = build_subordinate_statement(
            &config,
            &key,
            "https://op.example.org",
            &JwkSet::new(),
            24,
            &json!({}),
            Some(&json!({"iss": "https://evil.example.org"})),
        )
        .unwrap();
        let (_, claims) = jws::decode_insecure(&token).unwrap();
        assert_eq!(claims["iss"], "https://ta.example.org");
        assert!(claims.get("metadata").is_none());
    }
}
