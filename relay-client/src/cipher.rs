//! Stateful encode/decode ratchet.
//!
//! [`RatchetCipher`] is the capability interface the pairing engine drives:
//! instantiate once per direction, then restore, operate and save around
//! every call. The engine never looks inside the saved state.
//!
//! [`ChaChaRatchet`] is the bundled backend:
//! - HKDF-SHA256 chain key seeded from (entropy, nonce, personalization)
//! - one ratchet step per whole message or per stream
//! - whole messages sealed with XChaCha20-Poly1305
//! - streams encrypted with an XChaCha20 keystream and closed by a 32-byte
//!   keyed BLAKE3 trailer over the ciphertext
//!
//! A client encoder and the server decoder seeded with the same material
//! step through the same chain, so direction never enters the derivation.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::XChaCha20;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Key size for XChaCha20 and XChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Nonce size for XChaCha20 (192 bits = 24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Bytes appended by `finish_encrypt` and absorbed by `finish_decrypt`.
pub const TRAILER_SIZE: usize = 32;

/// Smallest entropy accepted by `instantiate`.
pub const MIN_ENTROPY: usize = 16;

/// Ratchet errors.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The entropy or personalization was rejected.
    #[error("instantiate failed: {0}")]
    InstantiateFailed(String),

    /// An operation ran before `instantiate` or `restore_state`.
    #[error("ratchet not instantiated")]
    NotInstantiated,

    /// The operation does not belong to this direction.
    #[error("{operation} not allowed on the {direction:?} side")]
    WrongDirection {
        /// Side the ratchet was created for.
        direction: Direction,
        /// Rejected operation.
        operation: &'static str,
    },

    /// Saved state could not be encoded or decoded.
    #[error("invalid ratchet state: {0}")]
    InvalidState(String),

    /// Authentication tag or trailer did not verify.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Sealing a message failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// A stream call came without a matching `start_*`.
    #[error("no stream in progress")]
    StreamNotStarted,

    /// `start_*` was called while a stream was open.
    #[error("stream already in progress")]
    StreamInProgress,

    /// The stream ended before a full trailer arrived.
    #[error("stream truncated: {0} trailer bytes")]
    TruncatedStream(usize),
}

/// Which side of a pair a ratchet serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Produces ciphertext.
    Encoder,
    /// Consumes ciphertext.
    Decoder,
}

/// Capability interface over one direction of a session pair.
pub trait RatchetCipher: Send {
    /// Seed the ratchet. Fails if the primitive rejects the inputs.
    fn instantiate(&mut self, entropy: &[u8], nonce: u64, personalization: &str)
        -> Result<(), CipherError>;

    /// Serialize the current ratchet state.
    fn save_state(&self) -> Result<Vec<u8>, CipherError>;

    /// Replace the current state with a saved one.
    fn restore_state(&mut self, state: &[u8]) -> Result<(), CipherError>;

    /// Whole-message encode.
    fn encode(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Whole-message decode.
    fn decode(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Open a chunked encryption stream.
    fn start_encrypt(&mut self) -> Result<(), CipherError>;

    /// Encrypt one chunk in place.
    fn encrypt_chunk(&mut self, chunk: &mut [u8]) -> Result<(), CipherError>;

    /// Close the stream and return the trailer.
    fn finish_encrypt(&mut self) -> Result<Vec<u8>, CipherError>;

    /// Open a chunked decryption stream.
    fn start_decrypt(&mut self) -> Result<(), CipherError>;

    /// Decrypt one chunk; may hold back bytes that could be trailer.
    fn decrypt_chunk(&mut self, chunk: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Close the stream, verify the trailer and return any remaining plaintext.
    fn finish_decrypt(&mut self) -> Result<Vec<u8>, CipherError>;

    /// Trailer length written by `finish_encrypt`.
    fn finish_encrypt_bytes(&self) -> usize;
}

/// Creates fresh ratchets for session pairs.
pub trait RatchetProvider: Send + Sync {
    /// A ratchet for one direction, not yet instantiated.
    fn create(&self, direction: Direction) -> Box<dyn RatchetCipher>;

    /// Trailer length of the ratchets this provider creates.
    fn finish_encrypt_bytes(&self) -> usize;
}

/// Provider for [`ChaChaRatchet`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ChaChaRatchetProvider;

impl RatchetProvider for ChaChaRatchetProvider {
    fn create(&self, direction: Direction) -> Box<dyn RatchetCipher> {
        Box::new(ChaChaRatchet::new(direction))
    }

    fn finish_encrypt_bytes(&self) -> usize {
        TRAILER_SIZE
    }
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct ChainState {
    chain_key: [u8; KEY_SIZE],
    counter: u64,
}

struct StepKeys {
    cipher_key: Zeroizing<[u8; KEY_SIZE]>,
    mac_key: Zeroizing<[u8; KEY_SIZE]>,
    nonce: [u8; NONCE_SIZE],
}

enum StreamState {
    Encrypt {
        keystream: XChaCha20,
        mac: blake3::Hasher,
    },
    Decrypt {
        keystream: XChaCha20,
        mac: blake3::Hasher,
        held: Vec<u8>,
    },
}

/// HKDF chain ratchet with XChaCha20 message and stream encryption.
pub struct ChaChaRatchet {
    direction: Direction,
    chain: Option<ChainState>,
    stream: Option<StreamState>,
}

impl ChaChaRatchet {
    /// A ratchet for `direction`, not yet instantiated.
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            chain: None,
            stream: None,
        }
    }

    fn require(&self, direction: Direction, operation: &'static str) -> Result<(), CipherError> {
        if self.direction != direction {
            return Err(CipherError::WrongDirection {
                direction: self.direction,
                operation,
            });
        }
        Ok(())
    }

    /// Advance the chain one step and derive the keys for that step.
    fn step(&mut self) -> Result<StepKeys, CipherError> {
        let chain = self.chain.as_mut().ok_or(CipherError::NotInstantiated)?;
        let hkdf = Hkdf::<Sha256>::from_prk(&chain.chain_key)
            .map_err(|e| CipherError::InvalidState(e.to_string()))?;

        let counter = chain.counter.to_be_bytes();
        let mut keys = StepKeys {
            cipher_key: Zeroizing::new([0u8; KEY_SIZE]),
            mac_key: Zeroizing::new([0u8; KEY_SIZE]),
            nonce: [0u8; NONCE_SIZE],
        };
        let mut next_chain = Zeroizing::new([0u8; KEY_SIZE]);

        let expand = |label: &[u8], out: &mut [u8]| {
            hkdf.expand(&[label, &counter[..]].concat(), out)
                .map_err(|e| CipherError::InvalidState(e.to_string()))
        };
        expand(b"mte-relay cipher", &mut keys.cipher_key[..])?;
        expand(b"mte-relay mac", &mut keys.mac_key[..])?;
        expand(b"mte-relay nonce", &mut keys.nonce)?;
        expand(b"mte-relay chain", &mut next_chain[..])?;

        chain.chain_key.copy_from_slice(&next_chain[..]);
        chain.counter = chain.counter.wrapping_add(1);
        Ok(keys)
    }

    fn keystream(keys: &StepKeys) -> XChaCha20 {
        XChaCha20::new(
            chacha20::Key::from_slice(&keys.cipher_key[..]),
            chacha20::XNonce::from_slice(&keys.nonce),
        )
    }
}

impl RatchetCipher for ChaChaRatchet {
    fn instantiate(
        &mut self,
        entropy: &[u8],
        nonce: u64,
        personalization: &str,
    ) -> Result<(), CipherError> {
        if entropy.len() < MIN_ENTROPY {
            return Err(CipherError::InstantiateFailed(format!(
                "entropy too short: {} bytes",
                entropy.len()
            )));
        }
        if personalization.is_empty() {
            return Err(CipherError::InstantiateFailed(
                "empty personalization".into(),
            ));
        }

        let hkdf = Hkdf::<Sha256>::new(Some(&nonce.to_be_bytes()), entropy);
        let info = [b"mte-relay ratchet v1|".as_slice(), personalization.as_bytes()].concat();
        let mut chain_key = [0u8; KEY_SIZE];
        hkdf.expand(&info, &mut chain_key)
            .map_err(|e| CipherError::InstantiateFailed(e.to_string()))?;

        self.chain = Some(ChainState {
            chain_key,
            counter: 0,
        });
        chain_key.zeroize();
        self.stream = None;
        Ok(())
    }

    fn save_state(&self) -> Result<Vec<u8>, CipherError> {
        let chain = self.chain.as_ref().ok_or(CipherError::NotInstantiated)?;
        rmp_serde::to_vec(chain).map_err(|e| CipherError::InvalidState(e.to_string()))
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<(), CipherError> {
        let chain: ChainState =
            rmp_serde::from_slice(state).map_err(|e| CipherError::InvalidState(e.to_string()))?;
        self.chain = Some(chain);
        self.stream = None;
        Ok(())
    }

    fn encode(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.require(Direction::Encoder, "encode")?;
        let keys = self.step()?;
        let cipher = XChaCha20Poly1305::new_from_slice(&keys.cipher_key[..])
            .map_err(|_| CipherError::EncryptionFailed)?;
        cipher
            .encrypt(XNonce::from_slice(&keys.nonce), plaintext)
            .map_err(|_| CipherError::EncryptionFailed)
    }

    fn decode(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.require(Direction::Decoder, "decode")?;
        let keys = self.step()?;
        let cipher = XChaCha20Poly1305::new_from_slice(&keys.cipher_key[..])
            .map_err(|_| CipherError::AuthenticationFailed)?;
        cipher
            .decrypt(XNonce::from_slice(&keys.nonce), ciphertext)
            .map_err(|_| CipherError::AuthenticationFailed)
    }

    fn start_encrypt(&mut self) -> Result<(), CipherError> {
        self.require(Direction::Encoder, "start_encrypt")?;
        if self.stream.is_some() {
            return Err(CipherError::StreamInProgress);
        }
        let keys = self.step()?;
        self.stream = Some(StreamState::Encrypt {
            keystream: Self::keystream(&keys),
            mac: blake3::Hasher::new_keyed(&keys.mac_key),
        });
        Ok(())
    }

    fn encrypt_chunk(&mut self, chunk: &mut [u8]) -> Result<(), CipherError> {
        match self.stream.as_mut() {
            Some(StreamState::Encrypt { keystream, mac }) => {
                keystream.apply_keystream(chunk);
                mac.update(chunk);
                Ok(())
            }
            _ => Err(CipherError::StreamNotStarted),
        }
    }

    fn finish_encrypt(&mut self) -> Result<Vec<u8>, CipherError> {
        match self.stream.take() {
            Some(StreamState::Encrypt { mac, .. }) => Ok(mac.finalize().as_bytes().to_vec()),
            other => {
                self.stream = other;
                Err(CipherError::StreamNotStarted)
            }
        }
    }

    fn start_decrypt(&mut self) -> Result<(), CipherError> {
        self.require(Direction::Decoder, "start_decrypt")?;
        if self.stream.is_some() {
            return Err(CipherError::StreamInProgress);
        }
        let keys = self.step()?;
        self.stream = Some(StreamState::Decrypt {
            keystream: Self::keystream(&keys),
            mac: blake3::Hasher::new_keyed(&keys.mac_key),
            held: Vec::with_capacity(TRAILER_SIZE),
        });
        Ok(())
    }

    fn decrypt_chunk(&mut self, chunk: &[u8]) -> Result<Vec<u8>, CipherError> {
        match self.stream.as_mut() {
            Some(StreamState::Decrypt {
                keystream,
                mac,
                held,
            }) => {
                held.extend_from_slice(chunk);
                if held.len() <= TRAILER_SIZE {
                    return Ok(Vec::new());
                }
                let release = held.len() - TRAILER_SIZE;
                let mut plaintext: Vec<u8> = held.drain(..release).collect();
                mac.update(&plaintext);
                keystream.apply_keystream(&mut plaintext);
                Ok(plaintext)
            }
            _ => Err(CipherError::StreamNotStarted),
        }
    }

    fn finish_decrypt(&mut self) -> Result<Vec<u8>, CipherError> {
        match self.stream.take() {
            Some(StreamState::Decrypt { mac, held, .. }) => {
                let trailer: [u8; TRAILER_SIZE] = held
                    .as_slice()
                    .try_into()
                    .map_err(|_| CipherError::TruncatedStream(held.len()))?;
                // blake3::Hash equality is constant-time
                if mac.finalize() == blake3::Hash::from(trailer) {
                    Ok(Vec::new())
                } else {
                    Err(CipherError::AuthenticationFailed)
                }
            }
            other => {
                self.stream = other;
                Err(CipherError::StreamNotStarted)
            }
        }
    }

    fn finish_encrypt_bytes(&self) -> usize {
        TRAILER_SIZE
    }
}

// Don't leak chain keys in debug output
impl std::fmt::Debug for ChaChaRatchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaChaRatchet")
            .field("direction", &self.direction)
            .field("instantiated", &self.chain.is_some())
            .field("streaming", &self.stream.is_some())
            .finish()
    }
}
