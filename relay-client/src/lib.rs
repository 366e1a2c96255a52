//! # relay-client
//!
//! Client library for the MTE secure relay protocol.
//!
//! Applications hand ordinary requests to a [`RelayClient`]; every byte that
//! reaches the wire has passed through a stateful, sequence-sensitive
//! session pair agreed with the relay host.
//!
//! ## Features
//!
//! - **Post-Quantum Pairing**: ML-KEM-512 key encapsulation per pair direction
//! - **Ratcheted Sessions**: one encoder and one decoder per pair, state saved after every call
//! - **Self-Healing**: reserved statuses re-pair within a bounded budget
//! - **Streaming**: chunked encrypt-while-reading uploads and decrypt-while-writing downloads
//! - **Encrypted State at Rest**: per-host XChaCha20-Poly1305 state files
//! - **Transport Abstraction**: pluggable HTTP layer (reqwest, in-process mock)
//! - **Pure State Machine**: uses relay-core for side-effect-free pairing logic
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mte_relay_client::{
//!     DerivedKeyProvider, FileStateStore, HttpTransport, RelayBackends, RelayClient,
//!     RelayConfig, RelayRequest,
//! };
//!
//! let keys = Arc::new(DerivedKeyProvider::from_passphrase("app secret", b"app-salt")?);
//! let backends = RelayBackends::new(Arc::new(HttpTransport::new()))
//!     .with_store(Arc::new(FileStateStore::new("/var/lib/app/relay", keys)));
//! let client = RelayClient::new(RelayConfig::default(), backends)?;
//!
//! let response = client
//!     .send("https://api.example.com", RelayRequest::post("api/login", body))
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cipher;
pub mod codec;
pub mod config;
pub mod error;
pub mod host;
pub mod kem;
pub mod pair;
pub mod pool;
pub mod relay;
pub mod storage;
pub mod stream;
pub mod transport;

pub use cipher::{ChaChaRatchetProvider, CipherError, RatchetCipher, RatchetProvider, KEY_SIZE};
pub use codec::{RelayRequest, RelayResponse};
pub use config::{ConfigError, RelayConfig};
pub use error::RelayError;
pub use host::{DownloadResponse, PairingCoordinator, PairingStatus, RelayBackends};
pub use kem::{KemError, KeyExchange, MlKemAgent};
pub use pair::{PairError, SessionPair};
pub use pool::PairPool;
pub use relay::RelayClient;
pub use storage::{
    Argon2Params, DerivedKeyProvider, FileStateStore, HostKeyProvider, MemoryStateStore,
    NullStateStore, StateStore, StorageError,
};
pub use stream::{BytesSource, FileSource, UploadSource};
pub use transport::{HttpTransport, Method, MockRelayServer, Transport, TransportError};
