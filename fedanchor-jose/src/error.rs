//! Error type shared by the jose modules.

#[derive(Debug, thiserror::Error)]
pub enum JoseError {
    /// The token is not a three-part compact JWS or a part fails to decode.
    #[error("malformed JWS: {0}")]
    MalformedJws(String),

    /// The signature does not verify against any candidate key.
    #[error("signature verification failed")]
    InvalidSignature,

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Key material is missing fields or has the wrong length for its algorithm.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// No key in the keyset matches the token's `kid`.
    #[error("no usable key in keyset")]
    UnknownKey,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
