//! JWK and JWKS model (RFC 7517) with RFC 7638 thumbprints.
//!
//! Keys carry the fully-specified algorithm name (`Ed25519`, `Ed448`) in
//! `alg`; the JWS header maps both to `EdDSA`.

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::JoseError;

pub(crate) fn b64url_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

pub(crate) fn b64url_decode(data: &str) -> Result<Vec<u8>, JoseError> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(data)
        .map_err(|e| JoseError::MalformedJws(format!("base64url: {e}")))
}

/// Signing algorithms supported by the trust anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwsAlg {
    Rs256,
    Ps256,
    Es256,
    Es384,
    Es512,
    Ed25519,
    Ed448,
}

impl JwsAlg {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "RS256" => Some(JwsAlg::Rs256),
            "PS256" => Some(JwsAlg::Ps256),
            "ES256" => Some(JwsAlg::Es256),
            "ES384" => Some(JwsAlg::Es384),
            "ES512" => Some(JwsAlg::Es512),
            "Ed25519" => Some(JwsAlg::Ed25519),
            "Ed448" => Some(JwsAlg::Ed448),
            _ => None,
        }
    }

    /// The fully-specified name stored in the JWK `alg` member.
    pub fn jwk_name(&self) -> &'static str {
        match self {
            JwsAlg::Rs256 => "RS256",
            JwsAlg::Ps256 => "PS256",
            JwsAlg::Es256 => "ES256",
            JwsAlg::Es384 => "ES384",
            JwsAlg::Es512 => "ES512",
            JwsAlg::Ed25519 => "Ed25519",
            JwsAlg::Ed448 => "Ed448",
        }
    }

    /// The name written into the JWS header. Both Edwards curves serialize
    /// as `EdDSA`; every other algorithm keeps its declared name.
    pub fn header_name(&self) -> &'static str {
        match self {
            JwsAlg::Ed25519 | JwsAlg::Ed448 => "EdDSA",
            other => other.jwk_name(),
        }
    }
}

/// A single JSON Web Key. Unused members stay `None` and are omitted from
/// serialization, so public keys round-trip byte-comparably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,

    // RSA public material
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,

    // EC / OKP public material
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,

    // Private material
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dq: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qi: Option<String>,
}

impl Jwk {
    /// Resolve the key's signing algorithm. Prefers the declared `alg`;
    /// falls back to inference from `kty`/`crv` for keys that omit it.
    pub fn algorithm(&self) -> Result<JwsAlg, JoseError> {
        if let Some(alg) = &self.alg {
            return JwsAlg::from_name(alg)
                .ok_or_else(|| JoseError::UnsupportedAlgorithm(alg.clone()));
        }
        match (self.kty.as_str(), self.crv.as_deref()) {
            ("RSA", _) => Ok(JwsAlg::Rs256),
            ("EC", Some("P-256")) => Ok(JwsAlg::Es256),
            ("EC", Some("P-384")) => Ok(JwsAlg::Es384),
            ("EC", Some("P-521")) => Ok(JwsAlg::Es512),
            ("OKP", Some("Ed25519")) => Ok(JwsAlg::Ed25519),
            ("OKP", Some("Ed448")) => Ok(JwsAlg::Ed448),
            (kty, crv) => Err(JoseError::UnsupportedAlgorithm(format!(
                "kty={kty} crv={}",
                crv.unwrap_or("-")
            ))),
        }
    }

    /// RFC 7638 thumbprint: SHA-256 over the canonical JSON of the required
    /// members in lexicographic order, base64url encoded.
    pub fn thumbprint(&self) -> Result<String, JoseError> {
        let canonical = match self.kty.as_str() {
            "RSA" => {
                let e = self.member("e")?;
                let n = self.member("n")?;
                format!(r#"{{"e":"{e}","kty":"RSA","n":"{n}"}}"#)
            }
            "EC" => {
                let crv = self.member("crv")?;
                let x = self.member("x")?;
                let y = self.member("y")?;
                format!(r#"{{"crv":"{crv}","kty":"EC","x":"{x}","y":"{y}"}}"#)
            }
            "OKP" => {
                let crv = self.member("crv")?;
                let x = self.member("x")?;
                format!(r#"{{"crv":"{crv}","kty":"OKP","x":"{x}"}}"#)
            }
            other => return Err(JoseError::UnsupportedAlgorithm(format!("kty={other}"))),
        };
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(b64url_encode(&digest))
    }

    /// The `kid` to place in a JWS header: the declared one, or the
    /// thumbprint when the key does not carry a `kid`.
    pub fn key_id(&self) -> Result<String, JoseError> {
        match &self.kid {
            Some(kid) => Ok(kid.clone()),
            None => self.thumbprint(),
        }
    }

    pub fn is_private(&self) -> bool {
        self.d.is_some()
    }

    /// A copy with all private members stripped.
    pub fn public(&self) -> Jwk {
        Jwk {
            d: None,
            p: None,
            q: None,
            dp: None,
            dq: None,
            qi: None,
            ..self.clone()
        }
    }

    fn member(&self, name: &str) -> Result<&str, JoseError> {
        let value = match name {
            "n" => &self.n,
            "e" => &self.e,
            "crv" => &self.crv,
            "x" => &self.x,
            "y" => &self.y,
            _ => &None,
        };
        value
            .as_deref()
            .ok_or_else(|| JoseError::InvalidKey(format!("missing JWK member {name}")))
    }

    /// Decode a base64url member into raw bytes, checking it exists.
    pub(crate) fn member_bytes(&self, name: &str) -> Result<Vec<u8>, JoseError> {
        let value = match name {
            "n" => &self.n,
            "e" => &self.e,
            "x" => &self.x,
            "y" => &self.y,
            "d" => &self.d,
            "p" => &self.p,
            "q" => &self.q,
            _ => &None,
        };
        let value = value
            .as_deref()
            .ok_or_else(|| JoseError::InvalidKey(format!("missing JWK member {name}")))?;
        b64url_decode(value).map_err(|_| JoseError::InvalidKey(format!("bad base64url in {name}")))
    }
}

/// An ordered key set, unique on `kid`. Adding a key whose `kid` is already
/// present replaces the earlier entry in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    pub fn new() -> Self {
        JwkSet { keys: Vec::new() }
    }

    pub fn add(&mut self, key: Jwk) {
        let kid = key.kid.clone().or_else(|| key.thumbprint().ok());
        if let Some(kid) = &kid {
            if let Some(existing) = self
                .keys
                .iter_mut()
                .find(|k| k.kid.as_deref() == Some(kid.as_str()))
            {
                *existing = key;
                return;
            }
        }
        self.keys.push(key);
    }

    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys
            .iter()
            .find(|k| k.kid.as_deref() == Some(kid) || k.thumbprint().ok().as_deref() == Some(kid))
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Parse a `{"keys": [...]}` JSON value, e.g. the `jwks` claim of an
    /// entity configuration.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, JoseError> {
        serde_json::from_value(value.clone()).map_err(JoseError::from)
    }

    /// The set with every key reduced to its public members.
    pub fn public(&self) -> JwkSet {
        JwkSet {
            keys: self.keys.iter().map(Jwk::public).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7638 §3.1 example key and thumbprint.
    const RFC7638_N: &str = "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw";

    fn rsa_pub() -> Jwk {
        Jwk {
            kty: "RSA".into(),
            kid: None,
            use_: Some("sig".into()),
            alg: Some("RS256".into()),
            n: Some(RFC7638_N.into()),
            e: Some("AQAB".into()),
            crv: None,
            x: None,
            y: None,
            d: None,
            p: None,
            q: None,
            dp: None,
            dq: None,
            qi: None,
        }
    }

    #[test]
    fn rfc7638_thumbprint() {
        let key = rsa_pub();
        assert_eq!(
            key.thumbprint().unwrap(),
            "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs"
        );
        // No declared kid, so the header kid falls back to the thumbprint
        assert_eq!(key.key_id().unwrap(), key.thumbprint().unwrap());
    }

    #[test]
    fn eddsa_header_mapping() {
        assert_eq!(JwsAlg::Ed25519.header_name(), "EdDSA");
        assert_eq!(JwsAlg::Ed448.header_name(), "EdDSA");
        assert_eq!(JwsAlg::Ed25519.jwk_name(), "Ed25519");
        assert_eq!(JwsAlg::Es512.header_name(), "ES512");
        assert_eq!(JwsAlg::Ps256.header_name(), "PS256");
    }

    #[test]
    fn public_strips_private_members() {
        let mut key = rsa_pub();
        key.d = Some("cHJpdmF0ZQ".into());
        key.p = Some("cA".into());
        key.q = Some("cQ".into());
        assert!(key.is_private());
        let public = key.public();
        assert!(!public.is_private());
        assert!(public.p.is_none());
        assert_eq!(public.n, key.n);
    }

    #[test]
    fn jwkset_unique_on_kid() {
        let mut set = JwkSet::new();
        let mut a = rsa_pub();
        a.kid = Some("k1".into());
        let mut b = rsa_pub();
        b.kid = Some("k1".into());
        b.alg = Some("PS256".into());
        set.add(a);
        set.add(b);
        assert_eq!(set.keys.len(), 1);
        assert_eq!(set.keys[0].alg.as_deref(), Some("PS256"));
        assert!(set.find("k1").is_some());
        assert!(set.find("nope").is_none());
    }

    #[test]
    fn algorithm_inference_without_alg() {
        let mut key = rsa_pub();
        key.alg = None;
        assert_eq!(key.algorithm().unwrap(), JwsAlg::Rs256);

        let okp = Jwk {
            kty: "OKP".into(),
            crv: Some("Ed448".into()),
            x: Some("AA".into()),
            alg: None,
            kid: None,
            use_: None,
            n: None,
            e: None,
            y: None,
            d: None,
            p: None,
            q: None,
            dp: None,
            dq: None,
            qi: None,
        };
        assert_eq!(okp.algorithm().unwrap(), JwsAlg::Ed448);
    }
}
