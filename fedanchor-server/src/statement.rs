//! The trust anchor's own signed artifacts.
//!
//! Builders for the entity configuration published at the well-known
//! endpoint and the historical-keys JWS. Both are regenerated at startup
//! and on demand from the admin API; the cache holds the current copy.

use fedanchor_jose::{KeyStore, jws};
use serde_json::json;

use crate::config::TrustAnchorConfig;
use crate::error::{FederationError, Result};
use crate::util::{hours, unix_now};

/// Build and sign the TA's entity configuration.
///
/// `authority_hints` only appears when configured (intermediate authority
/// mode); trust marks held by the TA itself are embedded verbatim.
pub fn create_entity_configuration(
    config: &TrustAnchorConfig,
    keys: &KeyStore,
) -> Result<String> {
    let now = unix_now();
    let mut claims = json!({
        "iss": config.ta_domain,
        "sub": config.ta_domain,
        "iat": now,
        "exp": now + hours(config.server_expiry),
        "metadata": {"federation_entity": config.federation_entity},
        "jwks": serde_json::to_value(keys.active_public_keyset())?,
    });
    if !config.authority_hints.is_empty() {
        claims["authority_hints"] = json!(config.authority_hints);
    }
    if !config.ta_trustmarks.is_empty() {
        claims["trust_marks"] = json!(config.ta_trustmarks);
    }
    let token = jws::sign(
        &claims,
        keys.active_private_signing_key(),
        Some("entity-statement+jwt"),
    )?;
    Ok(token)
}

/// Build and sign the historical-keys statement. Each key keeps its `exp`
/// and any `revoked` object verbatim. Fails with `NotFound` when no
/// historical keys are loaded, which the admin surface maps to 404.
pub fn create_historical_keys_jws(config: &TrustAnchorConfig, keys: &KeyStore) -> Result<String> {
    let historical = keys.historical_keys();
    if historical.is_empty() {
        return Err(FederationError::NotFound("historical keys".into()));
    }
    let claims = json!({
        "iss": config.ta_domain,
        "iat": unix_now(),
        "keys": serde_json::to_value(historical)?,
    });
    let token = jws::sign(
        &claims,
        keys.active_private_signing_key(),
        Some("jwk-set+jwt"),
    )?;
    Ok(token)
}
