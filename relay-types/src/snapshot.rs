//! Persisted per-host pairing state.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::{ClientId, PairId, TypesError};

/// Serialized ratchet states of one pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairSnapshot {
    /// Pair id.
    pub pair_id: PairId,
    /// Base64 encoder ratchet state.
    pub encoder_state_b64: String,
    /// Base64 decoder ratchet state.
    pub decoder_state_b64: String,
}

impl PairSnapshot {
    /// Capture both raw ratchet states.
    pub fn new(pair_id: PairId, encoder_state: &[u8], decoder_state: &[u8]) -> Self {
        Self {
            pair_id,
            encoder_state_b64: STANDARD.encode(encoder_state),
            decoder_state_b64: STANDARD.encode(decoder_state),
        }
    }

    /// Raw encoder state.
    pub fn encoder_state(&self) -> Result<Vec<u8>, TypesError> {
        Ok(STANDARD.decode(&self.encoder_state_b64)?)
    }

    /// Raw decoder state.
    pub fn decoder_state(&self) -> Result<Vec<u8>, TypesError> {
        Ok(STANDARD.decode(&self.decoder_state_b64)?)
    }
}

impl std::fmt::Debug for PairSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairSnapshot")
            .field("pair_id", &self.pair_id)
            .field("encoder_state_b64", &"[REDACTED]")
            .field("decoder_state_b64", &"[REDACTED]")
            .finish()
    }
}

/// Everything persisted for one host: the client id and every pair's state.
///
/// Saved as a whole value; a snapshot on disk is either absent or complete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSnapshot {
    /// Server-assigned client id.
    pub client_id: ClientId,
    /// Pair states in pool order.
    #[serde(default)]
    pub pairs: Vec<PairSnapshot>,
}

impl HostSnapshot {
    /// A snapshot that only remembers the client id.
    pub fn client_only(client_id: ClientId) -> Self {
        Self {
            client_id,
            pairs: Vec::new(),
        }
    }

    /// True if the snapshot carries a pool that can be reloaded.
    pub fn has_pairs(&self) -> bool {
        !self.pairs.is_empty()
    }

    /// Every pair has a unique, non-empty id and two decodable, non-empty states.
    pub fn is_consistent(&self) -> bool {
        let mut seen = HashSet::new();
        self.pairs.iter().all(|pair| {
            !pair.pair_id.is_empty()
                && seen.insert(pair.pair_id.clone())
                && matches!(pair.encoder_state(), Ok(state) if !state.is_empty())
                && matches!(pair.decoder_state(), Ok(state) if !state.is_empty())
        })
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, TypesError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, TypesError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
