//! Error types for relay wire types.

use thiserror::Error;

/// Errors raised while parsing or building relay wire types.
#[derive(Debug, Error)]
pub enum TypesError {
    /// The `x-mte-relay` header could not be parsed
    #[error("invalid relay header: {0}")]
    InvalidHeader(String),

    /// Host URL could not be canonicalized
    #[error("invalid host url '{url}': {reason}")]
    InvalidHost {
        /// The rejected input
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// A numeric nonce in a pairing answer did not parse
    #[error("invalid nonce for pair {pair_id}: {value}")]
    InvalidNonce {
        /// Pair carrying the nonce
        pair_id: String,
        /// Raw nonce text
        value: String,
    },

    /// JSON encoding or decoding failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 decoding failed
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}
