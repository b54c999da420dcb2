//! End-to-end checks over the signed-statement pipeline: build a chain of
//! real JWS artifacts (entity configuration, subordinate statement, TA
//! configuration) and verify the resolver math and policy projection that
//! the HTTP surface exposes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use fedanchor_jose::{Jwk, JwkSet, jws};
use fedanchor_server::admission;
use fedanchor_server::config::{TrustAnchorConfig, TrustMarkTypeDefaults};
use fedanchor_server::policy::apply_policy;
use fedanchor_server::resolver::{deep_merge, filter_entity_types, min_chain_exp};
use serde_json::{Value, json};

fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

fn ed25519_key() -> Jwk {
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

fn ta_config() -> TrustAnchorConfig {
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
        policy_document: json!({"metadata_policy": {
            "openid_provider": {"application_type": {"value": "web"}}
        }}),
        server_expiry: 8760,
        subordinate_default_valid_for: 8760,
        fetch_timeout: Duration::from_secs(10),
        tmtype_defaults: TrustMarkTypeDefaults::default(),
        signing_private_key: PathBuf::from("private.json"),
        signing_public_keys: Vec::new(),
        historical_keys_dir: None,
    }
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// Sign a subject's self-issued entity configuration.
fn entity_configuration(key: &Jwk, entityid: &str, metadata: Value, exp: i64) -> String {
    let jwks = serde_json::to_value(JwkSet {
        keys: vec![key.public()],
    })
    .unwrap();
    let claims = json!({
        "iss": entityid,
        "sub": entityid,
        "iat": now(),
        "exp": exp,
        "jwks": jwks,
        "metadata": metadata,
        "authority_hints": ["https://ta.example.org"],
    });
    jws::sign(&claims, key, Some("entity-statement+jwt")).unwrap()
}

#[test]
fn resolver_math_over_a_real_chain() {
    let config = ta_config();
    let ta_key = ed25519_key();
    let op_key = ed25519_key();
    let op_id = "https://fakeop0.labb.sunet.se";

    let declared = json!({
        "openid_provider": {
            "application_type": "native",
            "subject_types_supported": ["public"]
        },
        "federation_entity": {"organization_name": "Fake OP"}
    });

    // Chain bottom-up: entity config, subordinate statement, TA config.
    let entity_jws = entity_configuration(&op_key, op_id, declared.clone(), now() + 7200);

    let mut op_keys = JwkSet::new();
    op_keys.add(op_key.public());
    let forced = json!({
        "openid_provider": {"subject_types_supported": ["pairwise", "public", "e2e"]},
        "extra_field": "extra_value"
    });
    let statement = admission::build_subordinate_statement(
        &config, &ta_key, op_id, &op_keys, 1, &forced, None,
    )
    .unwrap();

    let ta_claims = json!({
        "iss": config.ta_domain,
        "sub": config.ta_domain,
        "iat": now(),
        "exp": now() + 3600 * 24,
        "jwks": serde_json::to_value(JwkSet { keys: vec![ta_key.public()] }).unwrap(),
        "metadata": {"federation_entity": config.federation_entity},
    });
    let ta_jws = jws::sign(&ta_claims, &ta_key, Some("entity-statement+jwt")).unwrap();

    // The statement is the shortest-lived link (1 hour), so it bounds exp.
    let chain = [entity_jws.as_str(), statement.as_str(), ta_jws.as_str()];
    let exp = min_chain_exp(&chain).unwrap();
    let (_, statement_claims) = jws::decode_insecure(&statement).unwrap();
    assert_eq!(exp, statement_claims["exp"].as_i64().unwrap());

    // Effective metadata: declared ⊕ forced, then the TA policy.
    let mut metadata = declared;
    deep_merge(&mut metadata, &statement_claims["metadata"]);
    assert_eq!(
        metadata["openid_provider"]["subject_types_supported"],
        json!(["pairwise", "public", "e2e"])
    );
    assert_eq!(metadata["extra_field"], "extra_value");

    let metadata = apply_policy(
        config.policy_document.get("metadata_policy").unwrap(),
        &metadata,
    )
    .unwrap();
    assert_eq!(metadata["openid_provider"]["application_type"], "web");

    // Requested type present: keep only it.
    let mut filtered = metadata.clone();
    filter_entity_types(&mut filtered, &["openid_provider".to_string()]);
    let map = filtered.as_object().unwrap();
    assert!(map.contains_key("openid_provider"));
    assert!(!map.contains_key("federation_entity"));

    // Requested type absent: untouched.
    let mut unfiltered = metadata.clone();
    filter_entity_types(&mut unfiltered, &["a_wrong_type".to_string()]);
    assert_eq!(unfiltered, metadata);
}

#[test]
fn admission_checks_on_a_signed_configuration() {
    let config = ta_config();
    let rp_key = ed25519_key();
    let rp_id = "https://fakerp0.labb.sunet.se";
    let metadata = json!({"openid_relying_party": {"redirect_uris": ["https://rp/cb"]}});
    let entity_jws = entity_configuration(&rp_key, rp_id, metadata, now() + 7200);

    // Verifies against the keys the administrator supplied.
    let mut supplied = JwkSet::new();
    supplied.add(rp_key.public());
    let (header, claims) = jws::verify(&entity_jws, &supplied).unwrap();
    assert_eq!(header.typ.as_deref(), Some("entity-statement+jwt"));

    // The vetting steps accept the claims as published.
    admission::vet_entity_claims(&config, &claims).unwrap();

    // Statement signed by the TA for the verified subject round-trips.
    let ta_key = ed25519_key();
    let statement =
        admission::build_subordinate_statement(&config, &ta_key, rp_id, &supplied, 24, &json!({}), None)
            .unwrap();
    let mut ta_keys = JwkSet::new();
    ta_keys.add(ta_key.public());
    let (_, statement_claims) = jws::verify(&statement, &ta_keys).unwrap();
    assert_eq!(statement_claims["iss"], "https://ta.example.org");
    assert_eq!(statement_claims["sub"], rp_id);
    assert!(statement_claims["exp"].as_i64().unwrap() > statement_claims["iat"].as_i64().unwrap());
    assert_eq!(statement_claims["jwks"]["keys"][0]["kid"], rp_key.kid.clone().unwrap());
}
