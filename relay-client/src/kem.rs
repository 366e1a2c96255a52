//! Key encapsulation for pairing.
//!
//! Each pair direction gets an ephemeral keypair; the server encapsulates a
//! secret to the public key and the client recovers it with the private key.
//! Private keys and recovered secrets are zeroized on drop.

use fips203::ml_kem_512;
use fips203::traits::{Decaps, Encaps, KeyGen, SerDes};
use thiserror::Error;
use zeroize::Zeroizing;

/// KEM errors, as surfaced by the primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KemError {
    /// The encapsulated secret is malformed or does not decapsulate.
    #[error("invalid KEM ciphertext")]
    InvalidCiphertext,

    /// A public or private key is malformed.
    #[error("invalid KEM key")]
    InvalidKey,

    /// The random source failed.
    #[error("KEM entropy failure")]
    EntropyFailure,

    /// Key material could not be allocated.
    #[error("KEM memory failure")]
    MemoryFailure,
}

/// Secret recovered from (or produced by) encapsulation.
pub struct SharedSecret(Zeroizing<Vec<u8>>);

impl SharedSecret {
    /// Wrap raw secret bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// Don't leak secret in debug output
impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

/// Ephemeral keypair for one pair direction.
pub struct KemKeyPair {
    /// Serialized public key, sent to the server.
    pub public_key: Vec<u8>,
    /// Serialized private key, kept until the secret is recovered.
    pub private_key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for KemKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KemKeyPair")
            .field("public_key_len", &self.public_key.len())
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Capability interface over the KEM primitive.
pub trait KeyExchange: Send + Sync {
    /// Generate a fresh keypair.
    fn generate_keypair(&self) -> Result<KemKeyPair, KemError>;

    /// Recover the secret the server encapsulated to our public key.
    fn recover_secret(
        &self,
        private_key: &[u8],
        encrypted_secret: &[u8],
    ) -> Result<SharedSecret, KemError>;

    /// Responder side: encapsulate a fresh secret to `public_key`.
    ///
    /// Returns the ciphertext to send and the secret it carries.
    fn encapsulate(&self, public_key: &[u8]) -> Result<(Vec<u8>, SharedSecret), KemError>;
}

/// ML-KEM-512 (FIPS 203).
#[derive(Debug, Clone, Copy, Default)]
pub struct MlKemAgent;

impl KeyExchange for MlKemAgent {
    fn generate_keypair(&self) -> Result<KemKeyPair, KemError> {
        let (ek, dk) = ml_kem_512::KG::try_keygen().map_err(|_| KemError::EntropyFailure)?;
        Ok(KemKeyPair {
            public_key: ek.into_bytes().to_vec(),
            private_key: Zeroizing::new(dk.into_bytes().to_vec()),
        })
    }

    fn recover_secret(
        &self,
        private_key: &[u8],
        encrypted_secret: &[u8],
    ) -> Result<SharedSecret, KemError> {
        let dk_bytes: [u8; ml_kem_512::DK_LEN] =
            private_key.try_into().map_err(|_| KemError::InvalidKey)?;
        let dk_bytes = Zeroizing::new(dk_bytes);
        let dk = ml_kem_512::DecapsKey::try_from_bytes(*dk_bytes).map_err(|_| KemError::InvalidKey)?;

        let ct_bytes: [u8; ml_kem_512::CT_LEN] = encrypted_secret
            .try_into()
            .map_err(|_| KemError::InvalidCiphertext)?;
        let ct = ml_kem_512::CipherText::try_from_bytes(ct_bytes)
            .map_err(|_| KemError::InvalidCiphertext)?;

        dk.try_decaps(&ct)
            .map(|ssk| SharedSecret::new(ssk.into_bytes().to_vec()))
            .map_err(|_| KemError::InvalidCiphertext)
    }

    fn encapsulate(&self, public_key: &[u8]) -> Result<(Vec<u8>, SharedSecret), KemError> {
        let ek_bytes: [u8; ml_kem_512::EK_LEN] =
            public_key.try_into().map_err(|_| KemError::InvalidKey)?;
        let ek = ml_kem_512::EncapsKey::try_from_bytes(ek_bytes).map_err(|_| KemError::InvalidKey)?;
        ek.try_encaps()
            .map(|(ssk, ct)| {
                (
                    ct.into_bytes().to_vec(),
                    SharedSecret::new(ssk.into_bytes().to_vec()),
                )
            })
            .map_err(|_| KemError::EntropyFailure)
    }
}
