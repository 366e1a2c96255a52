//! Error types for the relay client.

use mte_relay_types::{PairId, TypesError};

use crate::config::ConfigError;
use crate::kem::KemError;
use crate::pair::PairError;
use crate::storage::StorageError;
use crate::transport::TransportError;

/// Errors returned by [`crate::RelayClient`] and [`crate::PairingCoordinator`].
///
/// Primitive error codes never leak through: crypto failures surface as
/// [`RelayError::CryptoOperationFailed`] naming the pair and operation.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The probe or pairing exchange failed; every waiter sees the same reason.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// An encode or decode failed; the pair has been burned.
    #[error("{operation} failed on pair {pair_id}")]
    CryptoOperationFailed {
        /// Pair the operation ran on.
        pair_id: PairId,
        /// Operation that failed.
        operation: String,
    },

    /// The server's response does not follow the relay protocol.
    #[error("relay protocol violation: {0}")]
    RelayProtocolViolation(String),

    /// The host kept reporting the pairing invalid.
    #[error("re-pair budget exhausted after {attempts} attempts (last status {status})")]
    RepairExhausted {
        /// Counter value when the budget ran out.
        attempts: u32,
        /// Reserved status that was refused.
        status: u16,
    },

    /// Every pair in the pool is burned.
    #[error("no usable session pair")]
    PoolExhausted,

    /// Persistence failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The request did not complete within the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// Reading an upload source or writing a download sink failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The host URL is not an http(s) origin.
    #[error("invalid host: {0}")]
    InvalidHost(String),

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An operation was asked for without a pair id.
    #[error("pair id missing")]
    MissingPairId,
}

impl From<PairError> for RelayError {
    fn from(e: PairError) -> Self {
        match e {
            PairError::CryptoOperationFailed {
                pair_id, operation, ..
            } => RelayError::CryptoOperationFailed {
                pair_id,
                operation: operation.to_string(),
            },
            PairError::InstantiateFailed { .. } => RelayError::HandshakeFailed(e.to_string()),
            PairError::MissingPairId => RelayError::MissingPairId,
            PairError::PoolExhausted => RelayError::PoolExhausted,
        }
    }
}

impl From<KemError> for RelayError {
    fn from(e: KemError) -> Self {
        RelayError::HandshakeFailed(e.to_string())
    }
}

impl From<TypesError> for RelayError {
    fn from(e: TypesError) -> Self {
        match e {
            TypesError::InvalidHost { .. } => RelayError::InvalidHost(e.to_string()),
            other => RelayError::RelayProtocolViolation(other.to_string()),
        }
    }
}

impl RelayError {
    /// Pair burned by this error, if any.
    pub fn burned_pair(&self) -> Option<&PairId> {
        match self {
            RelayError::CryptoOperationFailed { pair_id, .. } => Some(pair_id),
            _ => None,
        }
    }
}
