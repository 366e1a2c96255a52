//! # relay-core
//!
//! Pure pairing logic for the MTE relay client (no I/O, instant tests).
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. The actual I/O (handshakes, storage, transport) is
//! performed by `relay-client`, which interprets the actions produced here.
//!
//! - [`state`] - per-host pairing lifecycle
//! - [`rotation`] - round-robin pair selection
//! - [`repair`] - reserved status range and the re-pair budget
//! - [`headers`] - protected header selection and response header cleanup

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod headers;
pub mod repair;
pub mod rotation;
pub mod state;

pub use headers::{merge_headers, split_protected, strip_relay_headers, Headers};
pub use repair::{RepairCounter, RepairDecision, RepairPolicy, StatusRange, StatusRangeError};
pub use rotation::RoundRobin;
pub use state::{PairingAction, PairingEvent, PairingState};
