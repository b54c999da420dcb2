//! JWK/JWS primitives for the fedanchor trust anchor.
//!
//! - `jwk` — JWK / JWKS model, algorithm names, RFC 7638 thumbprints
//! - `jws` — compact JWS signing and verification over a keyset
//! - `historical` — retired keys with expiry and revocation metadata
//! - `keystore` — the trust anchor's live signing key and keysets

pub mod error;
pub mod historical;
pub mod jwk;
pub mod jws;
pub mod keystore;

pub use error::JoseError;
pub use historical::{HistoricalKey, Revocation, RevocationReason};
pub use jwk::{Jwk, JwkSet, JwsAlg};
pub use jws::{JwsHeader, decode_insecure, sign, verify};
pub use keystore::KeyStore;
