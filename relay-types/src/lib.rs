//! # relay-types
//!
//! Wire format types for the MTE relay client protocol.
//!
//! This crate provides the foundational types used across all relay crates:
//! - [`PairId`], [`ClientId`], [`HostIdentity`] - Identity types
//! - [`RelayHeader`] - The `x-mte-relay` protocol header
//! - [`PairOffer`], [`PairAnswer`] - Pairing handshake payloads
//! - [`HostSnapshot`] - Persisted per-host pairing state
//! - [`TypesError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod header;
mod ids;
mod pairing;
mod snapshot;

pub use error::TypesError;
pub use header::{EncodeType, RelayHeader, ENCRYPTED_HEADERS_HEADER, RELAY_HEADER};
pub use ids::{random_token, ClientId, HostIdentity, PairId, TOKEN_LEN};
pub use pairing::{PairAnswer, PairOffer};
pub use snapshot::{HostSnapshot, PairSnapshot};
