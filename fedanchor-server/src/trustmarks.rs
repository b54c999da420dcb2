//! Trust-mark lifecycle engine.
//!
//! Issues, renews, revokes, and looks up trust marks, and answers the
//! status endpoint. The database row is authoritative; the cache carries
//! the live mark per `(domain, tmtype)`, the per-type subject set, and the
//! all-time issued digest set that lets the status endpoint tell a revoked
//! mark apart from one that never existed.

use fedanchor_jose::{Jwk, jws};
use serde_json::{Value, json};

use crate::cache::REVOKED_MARKER;
use crate::config::TrustAnchorConfig;
use crate::db::{self, TrustMarkRow, TrustMarkTypeRow};
use crate::error::{FederationError, Result};
use crate::server::AppState;
use crate::util::{hours, unix_now};

/// Administrative input for issuing a trust mark. Omitted fields fall back
/// to the type's values.
#[derive(Debug, Clone, Default)]
pub struct IssueRequest {
    pub tmt: i64,
    pub domain: String,
    pub autorenew: Option<bool>,
    pub active: Option<bool>,
    pub valid_for: Option<i64>,
    pub renewal_time: Option<i64>,
    pub additional_claims: Option<Value>,
}

/// Mutable fields of an existing trust mark.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub autorenew: Option<bool>,
    pub active: Option<bool>,
    pub additional_claims: Option<Value>,
}

#[derive(Debug)]
pub enum IssueOutcome {
    Created(TrustMarkRow),
    Exists(TrustMarkRow),
}

/// Issue a mark: insert the row, sign the mark, publish it.
pub async fn create_trust_mark(state: &AppState, req: IssueRequest) -> Result<IssueOutcome> {
    let tmt = state
        .db
        .get_trust_mark_type(req.tmt)?
        .ok_or(FederationError::TypeNotFound(req.tmt))?;

    let autorenew = req.autorenew.unwrap_or(tmt.autorenew);
    let active = req.active.unwrap_or(tmt.active);
    let valid_for = bounded(req.valid_for, tmt.valid_for, "valid_for")?;
    let renewal_time = bounded(req.renewal_time, tmt.renewal_time, "renewal_time")?;

    if let Some(existing) = state.db.get_trust_mark_by_subject(tmt.id, &req.domain)? {
        return Ok(IssueOutcome::Exists(existing));
    }

    let mut row = match state.db.insert_trust_mark(
        tmt.id,
        &req.domain,
        active,
        autorenew,
        valid_for,
        renewal_time,
        req.additional_claims.as_ref(),
    ) {
        Ok(row) => row,
        Err(e) if db::is_unique_violation(&e) => {
            // Lost a race to a concurrent issue; the constraint linearizes.
            let existing = state
                .db
                .get_trust_mark_by_subject(tmt.id, &req.domain)?
                .ok_or_else(|| FederationError::NotFound(req.domain.clone()))?;
            return Ok(IssueOutcome::Exists(existing));
        }
        Err(e) => return Err(e.into()),
    };

    let (mark, expire_at) = sign_mark(
        &state.config,
        state.keys.active_private_signing_key(),
        &req.domain,
        &tmt.tmtype,
        valid_for,
        row.additional_claims.as_ref(),
    )?;
    row.mark = Some(mark.clone());
    row.expire_at = Some(expire_at);
    state.db.update_trust_mark(&row)?;

    state.cache.put_trust_mark(&req.domain, &tmt.tmtype, &mark).await?;
    state.cache.record_issued(&mark).await?;
    tracing::info!(domain = %req.domain, tmtype = %tmt.tmtype, "trust mark issued");
    Ok(IssueOutcome::Created(row))
}

/// Renew: a fresh signature with new `iat`/`exp`; everything else of
/// the row is unchanged.
pub async fn renew_trust_mark(state: &AppState, id: i64) -> Result<TrustMarkRow> {
    let mut row = state
        .db
        .get_trust_mark(id)?
        .ok_or_else(|| FederationError::NotFound(format!("trust mark {id}")))?;
    let tmt = require_type(state, row.tmt_id)?;

    let (mark, expire_at) = sign_mark(
        &state.config,
        state.keys.active_private_signing_key(),
        &row.domain,
        &tmt.tmtype,
        row.valid_for,
        row.additional_claims.as_ref(),
    )?;
    row.mark = Some(mark.clone());
    row.expire_at = Some(expire_at);
    state.db.update_trust_mark(&row)?;

    state.cache.put_trust_mark(&row.domain, &tmt.tmtype, &mark).await?;
    state.cache.record_issued(&mark).await?;
    tracing::info!(domain = %row.domain, tmtype = %tmt.tmtype, "trust mark renewed");
    Ok(row)
}

/// Update: only `autorenew`, `active`, and `additional_claims` are
/// mutable. Deactivation tombstones the cache slot; changed claims re-sign.
pub async fn update_trust_mark(
    state: &AppState,
    id: i64,
    update: UpdateRequest,
) -> Result<TrustMarkRow> {
    let mut row = state
        .db
        .get_trust_mark(id)?
        .ok_or_else(|| FederationError::NotFound(format!("trust mark {id}")))?;
    let tmt = require_type(state, row.tmt_id)?;

    if let Some(autorenew) = update.autorenew {
        row.autorenew = autorenew;
    }
    let mut revoke = false;
    if let Some(active) = update.active {
        row.active = active;
        if !active {
            row.mark = None;
            revoke = true;
        }
    }
    if !revoke
        && update.additional_claims.is_some()
        && update.additional_claims != row.additional_claims
    {
        row.additional_claims = update.additional_claims.clone();
        let (mark, expire_at) = sign_mark(
            &state.config,
            state.keys.active_private_signing_key(),
            &row.domain,
            &tmt.tmtype,
            row.valid_for,
            row.additional_claims.as_ref(),
        )?;
        row.mark = Some(mark.clone());
        row.expire_at = Some(expire_at);
        state.cache.put_trust_mark(&row.domain, &tmt.tmtype, &mark).await?;
        state.cache.record_issued(&mark).await?;
    }
    state.db.update_trust_mark(&row)?;

    if revoke {
        state.cache.revoke_trust_mark(&row.domain, &tmt.tmtype).await?;
        tracing::info!(domain = %row.domain, tmtype = %tmt.tmtype, "trust mark revoked");
    }
    Ok(row)
}

/// Status check: always a signed assertion, never an error. `active` only
/// when the submitted JWS is byte-equal to the live cache slot.
pub async fn trust_mark_status(state: &AppState, token: &str) -> Result<String> {
    let active = match mark_coordinates(token) {
        Some((sub, tmtype)) => {
            let cached = state.cache.trust_mark(&sub, &tmtype).await?;
            cached.as_deref() == Some(token)
        }
        // Malformed, or missing the claims that locate the mark
        None => false,
    };
    if !active && state.cache.was_ever_issued(token).await? {
        // Issued by us at some point but revoked, superseded, or expired
        tracing::info!("status check on a previously issued trust mark");
    }
    let claims = json!({
        "iss": state.config.ta_domain,
        "iat": unix_now(),
        "status": if active { "active" } else { "invalid" },
        "trust_mark": token,
    });
    Ok(jws::sign(
        &claims,
        state.keys.active_private_signing_key(),
        Some("trust-mark-status+jwt"),
    )?)
}

/// Rebuild the cache's trust-mark state from the database: live marks,
/// per-type subject sets, and the all-time issued set.
pub async fn reload_issued_marks(state: &AppState) -> Result<usize> {
    let rows = state.db.list_active_trust_marks()?;
    let mut reloaded = 0;
    for row in &rows {
        let Some(mark) = row.mark.as_deref() else {
            continue;
        };
        let tmt = require_type(state, row.tmt_id)?;
        state.cache.put_trust_mark(&row.domain, &tmt.tmtype, mark).await?;
        state.cache.record_issued(mark).await?;
        reloaded += 1;
    }
    Ok(reloaded)
}

/// The `(sub, trust_mark_type)` pair that addresses a mark in the cache.
fn mark_coordinates(token: &str) -> Option<(String, String)> {
    let (_, claims) = jws::decode_insecure(token).ok()?;
    let sub = claims.get("sub")?.as_str()?.to_string();
    let tmtype = claims.get("trust_mark_type")?.as_str()?.to_string();
    Some((sub, tmtype))
}

/// Whether a raw cache slot value represents a live mark.
pub fn is_live_mark(slot: Option<&str>) -> bool {
    matches!(slot, Some(v) if v != REVOKED_MARKER)
}

fn bounded(requested: Option<i64>, limit: i64, field: &'static str) -> Result<i64> {
    match requested {
        Some(v) if v > limit => Err(FederationError::LimitExceeded { field }),
        Some(v) => Ok(v),
        None => Ok(limit),
    }
}

fn require_type(state: &AppState, tmt_id: i64) -> Result<TrustMarkTypeRow> {
    state
        .db
        .get_trust_mark_type(tmt_id)?
        .ok_or(FederationError::TypeNotFound(tmt_id))
}

/// Sign a trust mark. Additional claims merge under the core claims and
/// can never override `iss`, `sub`, timestamps, or the mark type.
pub fn sign_mark(
    config: &TrustAnchorConfig,
    signing_key: &Jwk,
    domain: &str,
    tmtype: &str,
    valid_for: i64,
    additional_claims: Option<&Value>,
) -> Result<(String, i64)> {
    let now = unix_now();
    let exp = now + hours(valid_for);
    let mut claims = json!({
        "iss": config.trustmark_provider,
        "sub": domain,
        "iat": now,
        "exp": exp,
        "trust_mark_type": tmtype,
    });
    if let (Some(Value::Object(extra)), Some(obj)) = (additional_claims, claims.as_object_mut()) {
        for (k, v) in extra {
            obj.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    let token = jws::sign(&claims, signing_key, Some("trust-mark+jwt"))?;
    Ok((token, exp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_config, test_key};
    use fedanchor_jose::JwkSet;

    #[test]
    fn mark_claims_and_expiry() {
        let config = test_config();
        let key = test_key();
        let (token, exp) = sign_mark(
            &config,
            &key,
            "https://rp.example.org",
            "https://example.com/trust_mark_type",
            24,
            Some(&json!({"tier": "gold"})),
        )
        .unwrap();

        let mut keys = JwkSet::new();
        keys.add(key.public());
        let (header, claims) = jws::verify(&token, &keys).unwrap();
        assert_eq!(header.typ.as_deref(), Some("trust-mark+jwt"));
        assert_eq!(claims["iss"], "https://ta.example.org");
        assert_eq!(claims["sub"], "https://rp.example.org");
        assert_eq!(claims["trust_mark_type"], "https://example.com/trust_mark_type");
        assert_eq!(claims["tier"], "gold");
        let iat = claims["iat"].as_i64().unwrap();
        assert_eq!(claims["exp"].as_i64().unwrap(), exp);
        assert_eq!(exp - iat, 86400);
    }

    #[test]
    fn additional_claims_cannot_shadow_subject() {
        let config = test_config();
        let key = test_key();
        let (token, _) = sign_mark(
            &config,
            &key,
            "https://rp.example.org",
            "https://example.com/tm",
            1,
            Some(&json!({"sub": "https://evil.example.org", "trust_mark_type": "spoof"})),
        )
        .unwrap();
        let (_, claims) = jws::decode_insecure(&token).unwrap();
        assert_eq!(claims["sub"], "https://rp.example.org");
        assert_eq!(claims["trust_mark_type"], "https://example.com/tm");
    }

    #[test]
    fn mark_coordinates_from_claims() {
        let config = test_config();
        let key = test_key();
        let (token, _) = sign_mark(&config, &key, "https://rp.example.org", "https://t/x", 1, None)
            .unwrap();
        let (sub, tmtype) = mark_coordinates(&token).unwrap();
        assert_eq!(sub, "https://rp.example.org");
        assert_eq!(tmtype, "https://t/x");

        assert!(mark_coordinates("garbage").is_none());
    }

    #[test]
    fn live_mark_slot_semantics() {
        assert!(is_live_mark(Some("a.b.c")));
        assert!(!is_live_mark(Some(REVOKED_MARKER)));
        assert!(!is_live_mark(None));
    }
}
