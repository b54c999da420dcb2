//! Compact JWS signing and verification.
//!
//! The wire form is `base64url(header).base64url(claims).base64url(sig)`.
//! Signing dispatches on the key's declared algorithm; Ed25519 and Ed448 go
//! into the header as `EdDSA` while the JWK keeps the fully-specified name.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use signature::{RandomizedSigner, SignatureEncoding, Signer, Verifier};

use crate::error::JoseError;
use crate::jwk::{Jwk, JwkSet, JwsAlg, b64url_decode, b64url_encode};

/// Protected header of a signed statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwsHeader {
    pub alg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
}

/// Sign a claims object with the given private key, producing a compact JWS.
///
/// `typ` becomes the header `typ` (e.g. `entity-statement+jwt`); `kid` is the
/// key's declared `kid` or its RFC 7638 thumbprint.
pub fn sign(claims: &Value, key: &Jwk, typ: Option<&str>) -> Result<String, JoseError> {
    if !claims.is_object() {
        return Err(JoseError::MalformedJws("claims must be a JSON object".into()));
    }
    if !key.is_private() {
        return Err(JoseError::InvalidKey("signing requires a private key".into()));
    }
    let alg = key.algorithm()?;
    let header = JwsHeader {
        alg: alg.header_name().to_string(),
        kid: Some(key.key_id()?),
        typ: typ.map(str::to_string),
    };
    let header_b64 = b64url_encode(&serde_json::to_vec(&header)?);
    let claims_b64 = b64url_encode(&serde_json::to_vec(claims)?);
    let signing_input = format!("{header_b64}.{claims_b64}");
    let signature = sign_bytes(alg, key, signing_input.as_bytes())?;
    Ok(format!("{signing_input}.{}", b64url_encode(&signature)))
}

/// Verify a compact JWS against a keyset and return `(header, claims)`.
///
/// A header `kid` selects its key; without one every key whose algorithm
/// matches the header is tried.
pub fn verify(token: &str, keys: &JwkSet) -> Result<(JwsHeader, Value), JoseError> {
    let (header, claims, signing_input, signature) = split(token)?;

    let candidates: Vec<&Jwk> = match header.kid.as_deref() {
        Some(kid) => match keys.find(kid) {
            Some(key) => vec![key],
            None => return Err(JoseError::UnknownKey),
        },
        None => keys.keys.iter().collect(),
    };
    if candidates.is_empty() {
        return Err(JoseError::UnknownKey);
    }

    for key in candidates {
        let alg = match key.algorithm() {
            Ok(alg) => alg,
            Err(_) => continue,
        };
        if alg.header_name() != header.alg {
            continue;
        }
        if verify_bytes(alg, key, signing_input.as_bytes(), &signature).is_ok() {
            return Ok((header, claims));
        }
    }
    Err(JoseError::InvalidSignature)
}

/// Decode a compact JWS without checking the signature. Used where the
/// claims are needed to locate the authoritative copy (e.g. trust-mark
/// status) before any trust decision is made.
pub fn decode_insecure(token: &str) -> Result<(JwsHeader, Value), JoseError> {
    let (header, claims, _, _) = split(token)?;
    Ok((header, claims))
}

fn split(token: &str) -> Result<(JwsHeader, Value, String, Vec<u8>), JoseError> {
    let mut parts = token.split('.');
    let (header_b64, claims_b64, sig_b64) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(c), Some(s), None) => (h, c, s),
        _ => return Err(JoseError::MalformedJws("expected three dot-separated parts".into())),
    };
    let header: JwsHeader = serde_json::from_slice(&b64url_decode(header_b64)?)
        .map_err(|e| JoseError::MalformedJws(format!("header: {e}")))?;
    let claims: Value = serde_json::from_slice(&b64url_decode(claims_b64)?)
        .map_err(|e| JoseError::MalformedJws(format!("claims: {e}")))?;
    let signature = b64url_decode(sig_b64)?;
    Ok((header, claims, format!("{header_b64}.{claims_b64}"), signature))
}

// ── Algorithm dispatch ─────────────────────────────────────────────────

fn sign_bytes(alg: JwsAlg, key: &Jwk, msg: &[u8]) -> Result<Vec<u8>, JoseError> {
    match alg {
        JwsAlg::Rs256 => {
            let sk = rsa::pkcs1v15::SigningKey::<sha2::Sha256>::new(rsa_private(key)?);
            Ok(sk.sign(msg).to_vec())
        }
        JwsAlg::Ps256 => {
            let sk = rsa::pss::BlindedSigningKey::<sha2::Sha256>::new(rsa_private(key)?);
            Ok(sk.sign_with_rng(&mut rand::thread_rng(), msg).to_vec())
        }
        JwsAlg::Es256 => {
            let sk = p256::ecdsa::SigningKey::from_slice(&key.member_bytes("d")?)
                .map_err(|e| JoseError::InvalidKey(e.to_string()))?;
            let sig: p256::ecdsa::Signature = sk.sign(msg);
            Ok(sig.to_vec())
        }
        JwsAlg::Es384 => {
            let sk = p384::ecdsa::SigningKey::from_slice(&key.member_bytes("d")?)
                .map_err(|e| JoseError::InvalidKey(e.to_string()))?;
            let sig: p384::ecdsa::Signature = sk.sign(msg);
            Ok(sig.to_vec())
        }
        JwsAlg::Es512 => {
            let sk = p521::ecdsa::SigningKey::from_slice(&key.member_bytes("d")?)
                .map_err(|e| JoseError::InvalidKey(e.to_string()))?;
            let sig: p521::ecdsa::Signature = sk.sign(msg);
            Ok(sig.to_vec())
        }
        JwsAlg::Ed25519 => {
            let d: [u8; 32] = key
                .member_bytes("d")?
                .try_into()
                .map_err(|_| JoseError::InvalidKey("Ed25519 d must be 32 bytes".into()))?;
            let sk = ed25519_dalek::SigningKey::from_bytes(&d);
            Ok(sk.sign(msg).to_vec())
        }
        JwsAlg::Ed448 => {
            let d: [u8; 57] = key
                .member_bytes("d")?
                .try_into()
                .map_err(|_| JoseError::InvalidKey("Ed448 d must be 57 bytes".into()))?;
            let sk = ed448_goldilocks::SigningKey::try_from(&d[..])
                .map_err(|e| JoseError::InvalidKey(e.to_string()))?;
            let sig: ed448_goldilocks::Signature = sk.sign_raw(msg);
            Ok(sig.to_bytes().to_vec())
        }
    }
}

fn verify_bytes(alg: JwsAlg, key: &Jwk, msg: &[u8], sig: &[u8]) -> Result<(), JoseError> {
    match alg {
        JwsAlg::Rs256 => {
            let vk = rsa::pkcs1v15::VerifyingKey::<sha2::Sha256>::new(rsa_public(key)?);
            let sig = rsa::pkcs1v15::Signature::try_from(sig)
                .map_err(|_| JoseError::InvalidSignature)?;
            vk.verify(msg, &sig).map_err(|_| JoseError::InvalidSignature)
        }
        JwsAlg::Ps256 => {
            let vk = rsa::pss::VerifyingKey::<sha2::Sha256>::new(rsa_public(key)?);
            let sig = rsa::pss::Signature::try_from(sig).map_err(|_| JoseError::InvalidSignature)?;
            vk.verify(msg, &sig).map_err(|_| JoseError::InvalidSignature)
        }
        JwsAlg::Es256 => {
            let (x, y) = ec_coords(key, 32)?;
            let point = p256::EncodedPoint::from_affine_coordinates(
                p256::FieldBytes::from_slice(&x),
                p256::FieldBytes::from_slice(&y),
                false,
            );
            let vk = p256::ecdsa::VerifyingKey::from_encoded_point(&point)
                .map_err(|e| JoseError::InvalidKey(e.to_string()))?;
            let sig = p256::ecdsa::Signature::from_slice(sig)
                .map_err(|_| JoseError::InvalidSignature)?;
            vk.verify(msg, &sig).map_err(|_| JoseError::InvalidSignature)
        }
        JwsAlg::Es384 => {
            let (x, y) = ec_coords(key, 48)?;
            let point = p384::EncodedPoint::from_affine_coordinates(
                p384::FieldBytes::from_slice(&x),
                p384::FieldBytes::from_slice(&y),
                false,
            );
            let vk = p384::ecdsa::VerifyingKey::from_encoded_point(&point)
                .map_err(|e| JoseError::InvalidKey(e.to_string()))?;
            let sig = p384::ecdsa::Signature::from_slice(sig)
                .map_err(|_| JoseError::InvalidSignature)?;
            vk.verify(msg, &sig).map_err(|_| JoseError::InvalidSignature)
        }
        JwsAlg::Es512 => {
            let (x, y) = ec_coords(key, 66)?;
            let point = p521::EncodedPoint::from_affine_coordinates(
                p521::FieldBytes::from_slice(&x),
                p521::FieldBytes::from_slice(&y),
                false,
            );
            let vk = p521::ecdsa::VerifyingKey::from_encoded_point(&point)
                .map_err(|e| JoseError::InvalidKey(e.to_string()))?;
            let sig = p521::ecdsa::Signature::from_slice(sig)
                .map_err(|_| JoseError::InvalidSignature)?;
            vk.verify(msg, &sig).map_err(|_| JoseError::InvalidSignature)
        }
        JwsAlg::Ed25519 => {
            let x: [u8; 32] = key
                .member_bytes("x")?
                .try_into()
                .map_err(|_| JoseError::InvalidKey("Ed25519 x must be 32 bytes".into()))?;
            let vk = ed25519_dalek::VerifyingKey::from_bytes(&x)
                .map_err(|e| JoseError::InvalidKey(e.to_string()))?;
            let sig = ed25519_dalek::Signature::try_from(sig)
                .map_err(|_| JoseError::InvalidSignature)?;
            vk.verify(msg, &sig).map_err(|_| JoseError::InvalidSignature)
        }
        JwsAlg::Ed448 => {
            let x: [u8; 57] = key
                .member_bytes("x")?
                .try_into()
                .map_err(|_| JoseError::InvalidKey("Ed448 x must be 57 bytes".into()))?;
            let vk = ed448_goldilocks::VerifyingKey::from_bytes(&x.into())
                .map_err(|e| JoseError::InvalidKey(e.to_string()))?;
            let sig = ed448_goldilocks::Signature::try_from(sig)
                .map_err(|_| JoseError::InvalidSignature)?;
            vk.verify_raw(&sig, msg).map_err(|_| JoseError::InvalidSignature)
        }
    }
}

fn rsa_private(key: &Jwk) -> Result<rsa::RsaPrivateKey, JoseError> {
    let n = rsa::BigUint::from_bytes_be(&key.member_bytes("n")?);
    let e = rsa::BigUint::from_bytes_be(&key.member_bytes("e")?);
    let d = rsa::BigUint::from_bytes_be(&key.member_bytes("d")?);
    // p/q speed things up when exported; from_components recovers them
    // from (n, e, d) otherwise.
    let primes = match (key.member_bytes("p"), key.member_bytes("q")) {
        (Ok(p), Ok(q)) => vec![
            rsa::BigUint::from_bytes_be(&p),
            rsa::BigUint::from_bytes_be(&q),
        ],
        _ => Vec::new(),
    };
    rsa::RsaPrivateKey::from_components(n, e, d, primes)
        .map_err(|e| JoseError::InvalidKey(e.to_string()))
}

fn rsa_public(key: &Jwk) -> Result<rsa::RsaPublicKey, JoseError> {
    let n = rsa::BigUint::from_bytes_be(&key.member_bytes("n")?);
    let e = rsa::BigUint::from_bytes_be(&key.member_bytes("e")?);
    rsa::RsaPublicKey::new(n, e).map_err(|e| JoseError::InvalidKey(e.to_string()))
}

fn ec_coords(key: &Jwk, field_len: usize) -> Result<(Vec<u8>, Vec<u8>), JoseError> {
    let x = key.member_bytes("x")?;
    let y = key.member_bytes("y")?;
    if x.len() != field_len || y.len() != field_len {
        return Err(JoseError::InvalidKey(format!(
            "EC coordinates must be {field_len} bytes"
        )));
    }
    Ok((x, y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwk::b64url_encode;
    use serde_json::json;

    fn es256_keypair() -> Jwk {
        let sk = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let point = sk.verifying_key().to_encoded_point(false);
        let mut key = Jwk {
            kty: "EC".into(),
            kid: None,
            use_: Some("sig".into()),
            alg: Some("ES256".into()),
            n: None,
            e: None,
            crv: Some("P-256".into()),
            x: Some(b64url_encode(point.x().unwrap())),
            y: Some(b64url_encode(point.y().unwrap())),
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

    fn ed25519_keypair() -> Jwk {
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

    fn keyset(key: &Jwk) -> JwkSet {
        let mut set = JwkSet::new();
        set.add(key.public());
        set
    }

    #[test]
    fn es256_roundtrip() {
        let key = es256_keypair();
        let claims = json!({"iss": "https://ta.example.org", "sub": "https://rp.example.org"});
        let token = sign(&claims, &key, Some("entity-statement+jwt")).unwrap();

        let (header, verified) = verify(&token, &keyset(&key)).unwrap();
        assert_eq!(header.alg, "ES256");
        assert_eq!(header.typ.as_deref(), Some("entity-statement+jwt"));
        assert_eq!(header.kid, key.kid);
        assert_eq!(verified, claims);
    }

    #[test]
    fn ed25519_header_alg_is_eddsa() {
        let key = ed25519_keypair();
        let token = sign(&json!({"iss": "x"}), &key, Some("trust-mark+jwt")).unwrap();
        let (header, _) = verify(&token, &keyset(&key)).unwrap();
        assert_eq!(header.alg, "EdDSA");
        // The JWK keeps the fully-specified name
        assert_eq!(key.alg.as_deref(), Some("Ed25519"));
    }

    #[test]
    fn tampered_payload_fails() {
        let key = es256_keypair();
        let token = sign(&json!({"iss": "x", "n": 1}), &key, None).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = b64url_encode(br#"{"iss":"x","n":2}"#);
        parts[1] = &forged;
        let forged_token = parts.join(".");
        assert!(matches!(
            verify(&forged_token, &keyset(&key)),
            Err(JoseError::InvalidSignature)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let key = es256_keypair();
        let other = es256_keypair();
        let token = sign(&json!({"iss": "x"}), &key, None).unwrap();
        // Unknown kid: the keyset has no entry for the signer
        assert!(matches!(
            verify(&token, &keyset(&other)),
            Err(JoseError::UnknownKey) | Err(JoseError::InvalidSignature)
        ));
    }

    #[test]
    fn malformed_tokens_rejected() {
        let set = JwkSet::new();
        assert!(matches!(
            verify("not-a-jws", &set),
            Err(JoseError::MalformedJws(_))
        ));
        assert!(matches!(
            verify("a.b", &set),
            Err(JoseError::MalformedJws(_))
        ));
        assert!(matches!(
            decode_insecure("!!.!!.!!"),
            Err(JoseError::MalformedJws(_))
        ));
    }

    #[test]
    fn decode_insecure_reads_claims_without_keys() {
        let key = ed25519_keypair();
        let claims = json!({"sub": "https://rp.example.org", "exp": 1800000000});
        let token = sign(&claims, &key, Some("trust-mark+jwt")).unwrap();
        let (header, decoded) = decode_insecure(&token).unwrap();
        assert_eq!(header.typ.as_deref(), Some("trust-mark+jwt"));
        assert_eq!(decoded["exp"], 1800000000);
    }

    #[test]
    fn signing_with_public_key_refused() {
        let key = es256_keypair();
        assert!(matches!(
            sign(&json!({}), &key.public(), None),
            Err(JoseError::InvalidKey(_))
        ));
    }
}
