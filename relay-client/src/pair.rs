//! Session pairs: one encoder and one decoder ratchet behind a pair id.
//!
//! Every operation restores the saved state into a fresh ratchet, runs the
//! primitive, then saves the new state, all under the pair's exclusive
//! async lock. A failed call never replaces the saved state. Streams hold
//! the lock from `start_*` to `finish_*`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use mte_relay_types::{random_token, PairAnswer, PairId, PairOffer, PairSnapshot};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cipher::{CipherError, Direction, RatchetCipher, RatchetProvider};
use crate::kem::{KemError, KemKeyPair, KeyExchange};

/// Session pair errors.
#[derive(Debug, Error)]
pub enum PairError {
    /// A codec call failed; the pair should be treated as burned.
    #[error("{operation} failed on pair {pair_id}: {source}")]
    CryptoOperationFailed {
        /// Pair the call ran on.
        pair_id: PairId,
        /// Operation that failed.
        operation: &'static str,
        /// Primitive error.
        #[source]
        source: CipherError,
    },

    /// A ratchet could not be seeded during the handshake.
    #[error("instantiate failed for pair {pair_id}: {reason}")]
    InstantiateFailed {
        /// Pair being instantiated.
        pair_id: PairId,
        /// Why it failed.
        reason: String,
    },

    /// An operation was asked for without a pair id.
    #[error("pair id missing")]
    MissingPairId,

    /// Every pair in the pool is burned.
    #[error("no usable pair in pool")]
    PoolExhausted,
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct RatchetStates {
    encoder: Vec<u8>,
    decoder: Vec<u8>,
}

impl RatchetStates {
    fn get(&self, direction: Direction) -> &[u8] {
        match direction {
            Direction::Encoder => &self.encoder,
            Direction::Decoder => &self.decoder,
        }
    }

    fn slot(&mut self, direction: Direction) -> &mut Vec<u8> {
        match direction {
            Direction::Encoder => &mut self.encoder,
            Direction::Decoder => &mut self.decoder,
        }
    }

    fn replace(&mut self, direction: Direction, state: Vec<u8>) {
        let mut old = std::mem::replace(self.slot(direction), state);
        old.zeroize();
    }
}

/// Derive and save the initial ratchet state for one direction.
pub fn instantiate_ratchet(
    ratchets: &dyn RatchetProvider,
    direction: Direction,
    shared_secret: &[u8],
    nonce: u64,
    personalization: &str,
) -> Result<Vec<u8>, CipherError> {
    let mut cipher = ratchets.create(direction);
    cipher.instantiate(shared_secret, nonce, personalization)?;
    cipher.save_state()
}

/// One established session with a relay host.
pub struct SessionPair {
    id: PairId,
    ratchets: Arc<dyn RatchetProvider>,
    live: Arc<AsyncMutex<RatchetStates>>,
    committed: Mutex<RatchetStates>,
    burned: AtomicBool,
}

impl SessionPair {
    /// Build a pair from saved encoder and decoder states.
    pub fn from_states(
        id: PairId,
        encoder_state: Vec<u8>,
        decoder_state: Vec<u8>,
        ratchets: Arc<dyn RatchetProvider>,
    ) -> Self {
        let states = RatchetStates {
            encoder: encoder_state,
            decoder: decoder_state,
        };
        Self {
            id,
            ratchets,
            live: Arc::new(AsyncMutex::new(states.clone())),
            committed: Mutex::new(states),
            burned: AtomicBool::new(false),
        }
    }

    /// Rebuild a pair from a persisted snapshot; no key generation.
    pub fn from_snapshot(
        snapshot: &PairSnapshot,
        ratchets: Arc<dyn RatchetProvider>,
    ) -> Result<Self, PairError> {
        if snapshot.pair_id.is_empty() {
            return Err(PairError::MissingPairId);
        }
        let invalid = |e: mte_relay_types::TypesError| PairError::CryptoOperationFailed {
            pair_id: snapshot.pair_id.clone(),
            operation: "reload",
            source: CipherError::InvalidState(e.to_string()),
        };
        let encoder = snapshot.encoder_state().map_err(invalid)?;
        let decoder = snapshot.decoder_state().map_err(invalid)?;
        Ok(Self::from_states(
            snapshot.pair_id.clone(),
            encoder,
            decoder,
            ratchets,
        ))
    }

    /// The pair id sent on the wire.
    pub fn id(&self) -> &PairId {
        &self.id
    }

    /// Last committed states, for persistence.
    pub fn snapshot(&self) -> PairSnapshot {
        let committed = self.committed.lock().unwrap_or_else(|e| e.into_inner());
        PairSnapshot::new(self.id.clone(), &committed.encoder, &committed.decoder)
    }

    /// Mark the pair as unusable.
    pub fn burn(&self) {
        self.burned.store(true, Ordering::SeqCst);
    }

    /// True once a codec failure or abandoned stream burned the pair.
    pub fn is_burned(&self) -> bool {
        self.burned.load(Ordering::SeqCst)
    }

    /// Trailer length added by `finish_encrypt`.
    pub fn finish_encrypt_bytes(&self) -> usize {
        self.ratchets.finish_encrypt_bytes()
    }

    /// Whole-message encode.
    pub async fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>, PairError> {
        self.with_ratchet(Direction::Encoder, "encode", |cipher| cipher.encode(plaintext))
            .await
    }

    /// Whole-message decode.
    pub async fn decode(&self, ciphertext: &[u8]) -> Result<Vec<u8>, PairError> {
        self.with_ratchet(Direction::Decoder, "decode", |cipher| {
            cipher.decode(ciphertext)
        })
        .await
    }

    /// Encode several messages back to back under one lock hold.
    ///
    /// Either every message is encoded and the state committed, or nothing is.
    pub async fn encode_all(&self, messages: &[&[u8]]) -> Result<Vec<Vec<u8>>, PairError> {
        self.with_ratchet(Direction::Encoder, "encode", |cipher| {
            messages.iter().map(|m| cipher.encode(m)).collect()
        })
        .await
    }

    /// Decode several messages back to back under one lock hold.
    pub async fn decode_all(&self, messages: &[&[u8]]) -> Result<Vec<Vec<u8>>, PairError> {
        self.with_ratchet(Direction::Decoder, "decode", |cipher| {
            messages.iter().map(|m| cipher.decode(m)).collect()
        })
        .await
    }

    /// Open an encryption stream. The pair stays locked until it finishes.
    pub async fn start_encrypt(self: &Arc<Self>) -> Result<EncryptStream, PairError> {
        self.start_encrypt_after(&[]).await.map(|(_, stream)| stream)
    }

    /// Encode `prefix` messages, then open an encryption stream, without
    /// releasing the lock in between. The prefix commits with the stream.
    pub async fn start_encrypt_after(
        self: &Arc<Self>,
        prefix: &[&[u8]],
    ) -> Result<(Vec<Vec<u8>>, EncryptStream), PairError> {
        let live = Arc::clone(&self.live).lock_owned().await;
        let mut cipher = self.ratchets.create(Direction::Encoder);
        cipher
            .restore_state(&live.encoder)
            .map_err(|e| self.failed("start_encrypt", e))?;
        let encoded = prefix
            .iter()
            .map(|m| cipher.encode(m))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| self.failed("encode", e))?;
        cipher
            .start_encrypt()
            .map_err(|e| self.failed("start_encrypt", e))?;
        let stream = EncryptStream {
            pair: Arc::clone(self),
            live,
            cipher,
            finished: false,
        };
        Ok((encoded, stream))
    }

    /// Open a decryption stream. The pair stays locked until it finishes.
    pub async fn start_decrypt(self: &Arc<Self>) -> Result<DecryptStream, PairError> {
        self.start_decrypt_after(&[]).await.map(|(_, stream)| stream)
    }

    /// Decode `prefix` messages, then open a decryption stream, without
    /// releasing the lock in between. The prefix commits with the stream.
    pub async fn start_decrypt_after(
        self: &Arc<Self>,
        prefix: &[&[u8]],
    ) -> Result<(Vec<Vec<u8>>, DecryptStream), PairError> {
        let live = Arc::clone(&self.live).lock_owned().await;
        let mut cipher = self.ratchets.create(Direction::Decoder);
        cipher
            .restore_state(&live.decoder)
            .map_err(|e| self.failed("start_decrypt", e))?;
        let decoded = prefix
            .iter()
            .map(|m| cipher.decode(m))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| self.failed("decode", e))?;
        cipher
            .start_decrypt()
            .map_err(|e| self.failed("start_decrypt", e))?;
        let stream = DecryptStream {
            pair: Arc::clone(self),
            live,
            cipher,
            finished: false,
        };
        Ok((decoded, stream))
    }

    async fn with_ratchet<T>(
        &self,
        direction: Direction,
        operation: &'static str,
        op: impl FnOnce(&mut dyn RatchetCipher) -> Result<T, CipherError>,
    ) -> Result<T, PairError> {
        let mut live = self.live.lock().await;
        let mut cipher = self.ratchets.create(direction);
        cipher
            .restore_state(live.get(direction))
            .map_err(|e| self.failed(operation, e))?;
        let output = op(cipher.as_mut()).map_err(|e| self.failed(operation, e))?;
        let saved = cipher
            .save_state()
            .map_err(|e| self.failed(operation, e))?;
        live.replace(direction, saved);
        self.commit(&live);
        Ok(output)
    }

    fn commit(&self, live: &RatchetStates) {
        let mut committed = self.committed.lock().unwrap_or_else(|e| e.into_inner());
        *committed = live.clone();
    }

    fn failed(&self, operation: &'static str, source: CipherError) -> PairError {
        PairError::CryptoOperationFailed {
            pair_id: self.id.clone(),
            operation,
            source,
        }
    }
}

impl std::fmt::Debug for SessionPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPair")
            .field("id", &self.id)
            .field("burned", &self.is_burned())
            .finish()
    }
}

/// An open encryption stream on one pair.
///
/// Dropping it without [`EncryptStream::finish_encrypt`] burns the pair: the
/// peer has seen a partial stream and the ratchets no longer agree.
pub struct EncryptStream {
    pair: Arc<SessionPair>,
    live: OwnedMutexGuard<RatchetStates>,
    cipher: Box<dyn RatchetCipher>,
    finished: bool,
}

impl EncryptStream {
    /// Pair the stream runs on.
    pub fn pair_id(&self) -> &PairId {
        self.pair.id()
    }

    /// Encrypt one chunk in place.
    pub fn encrypt_chunk(&mut self, chunk: &mut [u8]) -> Result<(), PairError> {
        self.cipher
            .encrypt_chunk(chunk)
            .map_err(|e| self.pair.failed("encrypt_chunk", e))
    }

    /// Close the stream, commit the ratchet and return the trailer.
    pub fn finish_encrypt(mut self) -> Result<Vec<u8>, PairError> {
        let trailer = self
            .cipher
            .finish_encrypt()
            .map_err(|e| self.pair.failed("finish_encrypt", e))?;
        let saved = self
            .cipher
            .save_state()
            .map_err(|e| self.pair.failed("finish_encrypt", e))?;
        self.live.replace(Direction::Encoder, saved);
        self.pair.commit(&self.live);
        self.finished = true;
        Ok(trailer)
    }
}

impl Drop for EncryptStream {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("Encrypt stream on pair {} abandoned, burning pair", self.pair.id());
            self.pair.burn();
        }
    }
}

/// An open decryption stream on one pair.
///
/// Dropping it without [`DecryptStream::finish_decrypt`] burns the pair.
pub struct DecryptStream {
    pair: Arc<SessionPair>,
    live: OwnedMutexGuard<RatchetStates>,
    cipher: Box<dyn RatchetCipher>,
    finished: bool,
}

impl DecryptStream {
    /// Pair the stream runs on.
    pub fn pair_id(&self) -> &PairId {
        self.pair.id()
    }

    /// Decrypt one chunk; output may lag input by the trailer length.
    pub fn decrypt_chunk(&mut self, chunk: &[u8]) -> Result<Vec<u8>, PairError> {
        self.cipher
            .decrypt_chunk(chunk)
            .map_err(|e| self.pair.failed("decrypt_chunk", e))
    }

    /// Verify the trailer, commit the ratchet and return trailing plaintext.
    pub fn finish_decrypt(mut self) -> Result<Vec<u8>, PairError> {
        let tail = self
            .cipher
            .finish_decrypt()
            .map_err(|e| self.pair.failed("finish_decrypt", e))?;
        let saved = self
            .cipher
            .save_state()
            .map_err(|e| self.pair.failed("finish_decrypt", e))?;
        self.live.replace(Direction::Decoder, saved);
        self.pair.commit(&self.live);
        self.finished = true;
        Ok(tail)
    }
}

impl Drop for DecryptStream {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("Decrypt stream on pair {} abandoned, burning pair", self.pair.id());
            self.pair.burn();
        }
    }
}

/// A candidate pair while the handshake is in flight.
///
/// Holds the ephemeral KEM keypairs; they are zeroized when this value is
/// consumed by [`PendingPair::complete`] or dropped.
pub struct PendingPair {
    pair_id: PairId,
    encoder_personalization: String,
    decoder_personalization: String,
    encoder_keys: KemKeyPair,
    decoder_keys: KemKeyPair,
}

impl PendingPair {
    /// Fresh id, personalization strings and one keypair per direction.
    pub fn generate(kem: &dyn KeyExchange) -> Result<Self, KemError> {
        Ok(Self {
            pair_id: PairId::random(),
            encoder_personalization: random_token(),
            decoder_personalization: random_token(),
            encoder_keys: kem.generate_keypair()?,
            decoder_keys: kem.generate_keypair()?,
        })
    }

    /// Pair id offered to the server.
    pub fn pair_id(&self) -> &PairId {
        &self.pair_id
    }

    /// Pairing request entry for this candidate.
    pub fn offer(&self) -> PairOffer {
        PairOffer::new(
            self.pair_id.clone(),
            &self.encoder_keys.public_key,
            self.encoder_personalization.clone(),
            &self.decoder_keys.public_key,
            self.decoder_personalization.clone(),
        )
    }

    /// Recover both secrets from the server's answer and seed the ratchets.
    pub fn complete(
        self,
        answer: &PairAnswer,
        kem: &dyn KeyExchange,
        ratchets: Arc<dyn RatchetProvider>,
    ) -> Result<SessionPair, PairError> {
        let fail = |reason: String| PairError::InstantiateFailed {
            pair_id: self.pair_id.clone(),
            reason,
        };
        if answer.pair_id != self.pair_id {
            return Err(fail(format!("answer is for pair {}", answer.pair_id)));
        }

        let encoder_secret = answer
            .decoder_secret_bytes()
            .map_err(|e| fail(e.to_string()))
            .and_then(|ct| {
                kem.recover_secret(&self.encoder_keys.private_key, &ct)
                    .map_err(|e| fail(e.to_string()))
            })?;
        let decoder_secret = answer
            .encoder_secret_bytes()
            .map_err(|e| fail(e.to_string()))
            .and_then(|ct| {
                kem.recover_secret(&self.decoder_keys.private_key, &ct)
                    .map_err(|e| fail(e.to_string()))
            })?;
        let encoder_nonce = answer
            .decoder_nonce_value()
            .map_err(|e| fail(e.to_string()))?;
        let decoder_nonce = answer
            .encoder_nonce_value()
            .map_err(|e| fail(e.to_string()))?;

        let encoder_state = instantiate_ratchet(
            ratchets.as_ref(),
            Direction::Encoder,
            encoder_secret.as_bytes(),
            encoder_nonce,
            &self.encoder_personalization,
        )
        .map_err(|e| fail(e.to_string()))?;
        let decoder_state = instantiate_ratchet(
            ratchets.as_ref(),
            Direction::Decoder,
            decoder_secret.as_bytes(),
            decoder_nonce,
            &self.decoder_personalization,
        )
        .map_err(|e| fail(e.to_string()))?;

        Ok(SessionPair::from_states(
            self.pair_id.clone(),
            encoder_state,
            decoder_state,
            ratchets,
        ))
    }
}

impl std::fmt::Debug for PendingPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingPair")
            .field("pair_id", &self.pair_id)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::linked_pairs;
    use super::*;
    use crate::cipher::ChaChaRatchetProvider;
    use crate::kem::MlKemAgent;

    // ===========================================
    // Whole-Message Tests
    // ===========================================

    #[tokio::test]
    async fn encode_decode_across_the_link() {
        let (client, server) = linked_pairs();
        for message in [&b"route"[..], &b"{\"content-type\":\"a\"}"[..], &b""[..], &b"body"[..]] {
            let ct = client.encode(message).await.unwrap();
            assert_eq!(server.decode(&ct).await.unwrap(), message);
        }
        let reply = server.encode(b"reply").await.unwrap();
        assert_eq!(client.decode(&reply).await.unwrap(), b"reply");
    }

    #[tokio::test]
    async fn snapshot_replay_is_idempotent() {
        let (client, server) = linked_pairs();
        for i in 0..5u8 {
            let ct = client.encode(&[i; 10]).await.unwrap();
            server.decode(&ct).await.unwrap();
        }

        let saved = client.snapshot();
        let next = client.encode(b"sixth").await.unwrap();

        let ratchets: Arc<dyn RatchetProvider> = Arc::new(ChaChaRatchetProvider);
        let replayed = SessionPair::from_snapshot(&saved, ratchets).unwrap();
        assert_eq!(replayed.encode(b"sixth").await.unwrap(), next);
        assert_eq!(server.decode(&next).await.unwrap(), b"sixth");
    }

    #[tokio::test]
    async fn failed_decode_keeps_previous_state() {
        let (client, server) = linked_pairs();
        let before = server.snapshot();

        let err = server.decode(b"garbage ciphertext").await.unwrap_err();
        assert!(matches!(
            err,
            PairError::CryptoOperationFailed {
                operation: "decode",
                ..
            }
        ));
        assert!(server.snapshot() == before);

        let ct = client.encode(b"still in step").await.unwrap();
        assert_eq!(server.decode(&ct).await.unwrap(), b"still in step");
    }

    #[tokio::test]
    async fn concurrent_encodes_are_serialized() {
        let (client, _) = linked_pairs();
        let initial = client.snapshot();

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move { client.encode(&[i]).await.unwrap() }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // The chain advances once per call regardless of content, so a lost
        // update would leave the committed state behind eight sequential steps.
        let replica = SessionPair::from_snapshot(&initial, Arc::new(ChaChaRatchetProvider)).unwrap();
        for _ in 0..8 {
            replica.encode(b"x").await.unwrap();
        }
        assert!(client.snapshot() == replica.snapshot());
    }

    #[tokio::test]
    async fn encode_all_matches_sequential_encodes() {
        let (client, server) = linked_pairs();
        let replica = SessionPair::from_snapshot(&client.snapshot(), Arc::new(ChaChaRatchetProvider))
            .unwrap();

        let batch = client
            .encode_all(&[&b"route"[..], &b"{}"[..], &b"body"[..]])
            .await
            .unwrap();
        for (i, message) in [&b"route"[..], &b"{}"[..], &b"body"[..]].iter().enumerate() {
            assert_eq!(replica.encode(message).await.unwrap(), batch[i]);
        }

        let refs: Vec<&[u8]> = batch.iter().map(Vec::as_slice).collect();
        let plain = server.decode_all(&refs).await.unwrap();
        assert_eq!(plain, vec![b"route".to_vec(), b"{}".to_vec(), b"body".to_vec()]);
    }

    #[tokio::test]
    async fn failed_batch_commits_nothing() {
        let (client, server) = linked_pairs();
        let good = client.encode(b"good").await.unwrap();
        let before = server.snapshot();

        assert!(server.decode_all(&[&good[..], &b"garbage"[..]]).await.is_err());
        assert!(server.snapshot() == before);
        assert_eq!(server.decode(&good).await.unwrap(), b"good");
    }

    // ===========================================
    // Stream Tests
    // ===========================================

    #[tokio::test]
    async fn stream_prefix_shares_the_lock_hold() {
        let (client, server) = linked_pairs();
        let (head, mut stream) = client.start_encrypt_after(&[&b"route"[..]]).await.unwrap();
        let mut chunk = b"payload".to_vec();
        stream.encrypt_chunk(&mut chunk).unwrap();
        let trailer = stream.finish_encrypt().unwrap();

        let (plain_head, mut rx) = server.start_decrypt_after(&[&head[0][..]]).await.unwrap();
        assert_eq!(plain_head[0], b"route");
        let mut plain = rx.decrypt_chunk(&chunk).unwrap();
        plain.extend(rx.decrypt_chunk(&trailer).unwrap());
        plain.extend(rx.finish_decrypt().unwrap());
        assert_eq!(plain, b"payload");
    }

    #[tokio::test]
    async fn stream_commits_only_at_finish() {
        let (client, server) = linked_pairs();
        let before = client.snapshot();

        let mut stream = client.start_encrypt().await.unwrap();
        let mut chunk = b"streamed".to_vec();
        stream.encrypt_chunk(&mut chunk).unwrap();
        assert!(client.snapshot() == before);

        let trailer = stream.finish_encrypt().unwrap();
        assert_eq!(trailer.len(), client.finish_encrypt_bytes());
        assert!(client.snapshot() != before);

        let mut rx = server.start_decrypt().await.unwrap();
        let mut plain = rx.decrypt_chunk(&chunk).unwrap();
        plain.extend(rx.decrypt_chunk(&trailer).unwrap());
        plain.extend(rx.finish_decrypt().unwrap());
        assert_eq!(plain, b"streamed");
    }

    #[tokio::test]
    async fn abandoned_stream_burns_pair() {
        let (client, _) = linked_pairs();
        let before = client.snapshot();
        {
            let mut stream = client.start_encrypt().await.unwrap();
            let mut chunk = vec![0u8; 4];
            stream.encrypt_chunk(&mut chunk).unwrap();
        }
        assert!(client.is_burned());
        assert!(client.snapshot() == before);
    }

    #[tokio::test]
    async fn stream_holds_pair_lock() {
        let (client, _) = linked_pairs();
        let stream = client.start_encrypt().await.unwrap();

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            client.encode(b"waits"),
        )
        .await;
        assert!(blocked.is_err());

        stream.finish_encrypt().unwrap();
        assert!(client.encode(b"now runs").await.is_ok());
    }

    // ===========================================
    // Handshake Tests
    // ===========================================

    #[tokio::test]
    async fn pending_pair_completes_against_server_answer() {
        let kem = MlKemAgent;
        let ratchets: Arc<dyn RatchetProvider> = Arc::new(ChaChaRatchetProvider);
        let pending = PendingPair::generate(&kem).unwrap();
        let offer = pending.offer();
        assert_eq!(offer.encoder_personalization.len(), 32);

        // Server side: its decoder mirrors our encoder and vice versa.
        let (up_ct, up_secret) = kem
            .encapsulate(&offer.encoder_public_key_bytes().unwrap())
            .unwrap();
        let (down_ct, down_secret) = kem
            .encapsulate(&offer.decoder_public_key_bytes().unwrap())
            .unwrap();
        let answer = PairAnswer {
            pair_id: offer.pair_id.clone(),
            decoder_secret: base64_std(&up_ct),
            decoder_nonce: "17".into(),
            encoder_secret: base64_std(&down_ct),
            encoder_nonce: "99".into(),
        };
        let server = SessionPair::from_states(
            offer.pair_id.clone(),
            instantiate_ratchet(
                ratchets.as_ref(),
                Direction::Encoder,
                down_secret.as_bytes(),
                99,
                &offer.decoder_personalization,
            )
            .unwrap(),
            instantiate_ratchet(
                ratchets.as_ref(),
                Direction::Decoder,
                up_secret.as_bytes(),
                17,
                &offer.encoder_personalization,
            )
            .unwrap(),
            ratchets.clone(),
        );

        let client = pending.complete(&answer, &kem, ratchets).unwrap();
        assert_eq!(client.id(), &offer.pair_id);

        let ct = client.encode(b"hello relay").await.unwrap();
        assert_eq!(server.decode(&ct).await.unwrap(), b"hello relay");
        let reply = server.encode(b"hello client").await.unwrap();
        assert_eq!(client.decode(&reply).await.unwrap(), b"hello client");
    }

    #[test]
    fn complete_rejects_foreign_answer() {
        let kem = MlKemAgent;
        let pending = PendingPair::generate(&kem).unwrap();
        let answer = PairAnswer {
            pair_id: PairId::new("someone-else"),
            decoder_secret: String::new(),
            decoder_nonce: "1".into(),
            encoder_secret: String::new(),
            encoder_nonce: "1".into(),
        };
        let err = pending
            .complete(&answer, &kem, Arc::new(ChaChaRatchetProvider))
            .unwrap_err();
        assert!(matches!(err, PairError::InstantiateFailed { .. }));
    }

    #[test]
    fn complete_rejects_bad_ciphertext() {
        let kem = MlKemAgent;
        let pending = PendingPair::generate(&kem).unwrap();
        let answer = PairAnswer {
            pair_id: pending.pair_id().clone(),
            decoder_secret: base64_std(&[0u8; 12]),
            decoder_nonce: "1".into(),
            encoder_secret: base64_std(&[0u8; 12]),
            encoder_nonce: "1".into(),
        };
        assert!(pending
            .complete(&answer, &kem, Arc::new(ChaChaRatchetProvider))
            .is_err());
    }

    #[test]
    fn reload_rejects_empty_pair_id() {
        let snapshot = PairSnapshot::new(PairId::new(""), b"e", b"d");
        assert!(matches!(
            SessionPair::from_snapshot(&snapshot, Arc::new(ChaChaRatchetProvider)),
            Err(PairError::MissingPairId)
        ));
    }

    fn base64_std(bytes: &[u8]) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine};
        STANDARD.encode(bytes)
    }
}
