//! Encrypted per-host pairing state.
//!
//! This module provides:
//! - [`StateStore`], the save/load/clear contract the coordinator persists through
//! - [`FileStateStore`], one XChaCha20-Poly1305 sealed file per host
//! - [`DerivedKeyProvider`], per-host keys from a root key or passphrase
//! - [`MemoryStateStore`] and [`NullStateStore`] for tests and disabled persistence
//!
//! # Security Notes
//!
//! - Each host is sealed under its own HKDF-derived key, with the host
//!   identity as associated data, so a file copied to another host's name
//!   does not open
//! - Saves write a temp file and rename it over the old one; a crash leaves
//!   either the old snapshot or the new one

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use mte_relay_types::{random_token, HostIdentity, HostSnapshot, TypesError};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::cipher::{KEY_SIZE, NONCE_SIZE};

/// Format version byte at the start of every state file.
const FILE_VERSION: u8 = 1;

/// Storage errors. Never fatal to dispatch: the coordinator logs them and
/// falls back to a fresh handshake.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Reading or writing the backing file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored bytes do not decrypt or parse.
    #[error("corrupt state: {0}")]
    Corrupt(String),

    /// Sealing or key derivation failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The snapshot could not be serialized.
    #[error("encoding error: {0}")]
    Encoding(#[from] TypesError),

    /// The store was told to fail (tests).
    #[error("storage unavailable")]
    Unavailable,
}

/// Persists one snapshot per host.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Replace the host's snapshot with `snapshot`.
    async fn save(&self, host: &HostIdentity, snapshot: &HostSnapshot) -> Result<(), StorageError>;

    /// The host's snapshot, or `None` if nothing is stored.
    async fn load(&self, host: &HostIdentity) -> Result<Option<HostSnapshot>, StorageError>;

    /// Remove the host's snapshot. Removing nothing is not an error.
    async fn clear(&self, host: &HostIdentity) -> Result<(), StorageError>;
}

/// Supplies the at-rest key for one host.
pub trait HostKeyProvider: Send + Sync {
    /// Key sealing `host`'s state file.
    fn key_for(&self, host: &HostIdentity) -> Result<Zeroizing<[u8; KEY_SIZE]>, StorageError>;
}

/// Argon2id cost of turning an application passphrase into the root key
/// that seals every host's state file.
///
/// The state is unsealed on the first request to each host, so the cost is
/// picked from installed memory rather than fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Params {
    memory_mib: u32,
    iterations: u32,
    parallelism: u32,
}

/// `(installed RAM below this many MB, memory MiB, passes, lanes)`.
const COST_TIERS: [(u64, u32, u32, u32); 4] = [
    (2_000, 12, 3, 1),
    (4_000, 19, 2, 1),
    (8_000, 46, 1, 1),
    (u64::MAX, 64, 3, 4),
];

impl Argon2Params {
    /// Cost tier for a device with `ram_mb` of installed memory.
    pub fn for_ram_mb(ram_mb: u64) -> Self {
        let (_, memory_mib, iterations, parallelism) = COST_TIERS
            .iter()
            .copied()
            .find(|&(below, ..)| ram_mb < below)
            .unwrap_or(COST_TIERS[COST_TIERS.len() - 1]);
        Self {
            memory_mib,
            iterations,
            parallelism,
        }
    }

    /// Memory cost in MiB.
    pub fn memory_mib(&self) -> u32 {
        self.memory_mib
    }

    /// Number of passes.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    fn kdf_params(self) -> Result<Params, StorageError> {
        Params::new(
            self.memory_mib.saturating_mul(1024),
            self.iterations,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| StorageError::Crypto(e.to_string()))
    }
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self::for_ram_mb(detect_available_ram_mb())
    }
}

/// Installed memory in MB, as reported by the OS.
pub fn detect_available_ram_mb() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.total_memory() >> 20
}

/// Per-host keys derived from one root key via HKDF-SHA256.
pub struct DerivedKeyProvider {
    root: Zeroizing<[u8; KEY_SIZE]>,
}

impl DerivedKeyProvider {
    /// Use an application-held root key.
    pub fn new(root: [u8; KEY_SIZE]) -> Self {
        Self {
            root: Zeroizing::new(root),
        }
    }

    /// A random root key; state sealed with it lives only as long as the key.
    pub fn random() -> Result<Self, StorageError> {
        let mut root = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut root).map_err(|e| StorageError::Crypto(e.to_string()))?;
        Ok(Self::new(root))
    }

    /// Derive the root key from a passphrase with device-adaptive Argon2id.
    pub fn from_passphrase(passphrase: &str, salt: &[u8]) -> Result<Self, StorageError> {
        Self::from_passphrase_with_params(passphrase, salt, Argon2Params::default())
    }

    /// Derive the root key with explicit Argon2 parameters.
    pub fn from_passphrase_with_params(
        passphrase: &str,
        salt: &[u8],
        params: Argon2Params,
    ) -> Result<Self, StorageError> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.kdf_params()?);
        let mut root = Zeroizing::new([0u8; KEY_SIZE]);
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, &mut root[..])
            .map_err(|e| StorageError::Crypto(e.to_string()))?;
        Ok(Self { root })
    }
}

impl HostKeyProvider for DerivedKeyProvider {
    fn key_for(&self, host: &HostIdentity) -> Result<Zeroizing<[u8; KEY_SIZE]>, StorageError> {
        let hkdf = Hkdf::<Sha256>::new(Some(b"mte-relay-state-v1"), &self.root[..]);
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        hkdf.expand(host.as_str().as_bytes(), &mut key[..])
            .map_err(|e| StorageError::Crypto(e.to_string()))?;
        Ok(key)
    }
}

// Don't leak the root key in debug output
impl std::fmt::Debug for DerivedKeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DerivedKeyProvider([REDACTED])")
    }
}

/// One sealed file per host under a directory.
pub struct FileStateStore {
    dir: PathBuf,
    keys: Arc<dyn HostKeyProvider>,
}

impl FileStateStore {
    /// Store files under `dir`, sealed with keys from `keys`.
    pub fn new(dir: impl Into<PathBuf>, keys: Arc<dyn HostKeyProvider>) -> Self {
        Self {
            dir: dir.into(),
            keys,
        }
    }

    /// Path of the file holding `host`'s snapshot.
    pub fn path_for(&self, host: &HostIdentity) -> PathBuf {
        let name = URL_SAFE_NO_PAD.encode(host.as_str());
        self.dir.join(format!("{}.state", name))
    }

    fn seal(&self, host: &HostIdentity, plaintext: &[u8]) -> Result<Vec<u8>, StorageError> {
        let key = self.keys.key_for(host)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|e| StorageError::Crypto(e.to_string()))?;

        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce).map_err(|e| StorageError::Crypto(e.to_string()))?;
        let sealed = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: host.as_str().as_bytes(),
                },
            )
            .map_err(|_| StorageError::Crypto("aead encrypt failed".into()))?;

        let mut out = Vec::with_capacity(1 + NONCE_SIZE + sealed.len());
        out.push(FILE_VERSION);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn open(&self, host: &HostIdentity, bytes: &[u8]) -> Result<Zeroizing<Vec<u8>>, StorageError> {
        if bytes.len() < 1 + NONCE_SIZE || bytes[0] != FILE_VERSION {
            return Err(StorageError::Corrupt("bad header".into()));
        }
        let (nonce, sealed) = bytes[1..].split_at(NONCE_SIZE);
        let key = self.keys.key_for(host)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key[..])
            .map_err(|e| StorageError::Crypto(e.to_string()))?;
        cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: host.as_str().as_bytes(),
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| StorageError::Corrupt("authentication failed".into()))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, host: &HostIdentity, snapshot: &HostSnapshot) -> Result<(), StorageError> {
        let json = Zeroizing::new(snapshot.to_json()?);
        let sealed = self.seal(host, &json)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(host);
        let tmp = path.with_extension(format!("tmp-{}", &random_token()[..8]));
        tokio::fs::write(&tmp, &sealed).await?;
        set_file_permissions_0600(&tmp).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tracing::debug!("Saved {} pairs for {}", snapshot.pairs.len(), host);
        Ok(())
    }

    async fn load(&self, host: &HostIdentity) -> Result<Option<HostSnapshot>, StorageError> {
        let bytes = match tokio::fs::read(self.path_for(host)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let json = self.open(host, &bytes)?;
        let snapshot =
            HostSnapshot::from_json(&json).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        Ok(Some(snapshot))
    }

    async fn clear(&self, host: &HostIdentity) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(host)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Set file permissions to 0600 (owner read/write only) on Unix.
/// No-op on non-Unix platforms.
async fn set_file_permissions_0600(path: &Path) -> Result<(), StorageError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// In-memory state store for testing.
///
/// Keeps serialized snapshots so every load returns an independent copy.
/// Clones share the same entries.
#[derive(Default, Clone)]
pub struct MemoryStateStore {
    entries: Arc<Mutex<HashMap<HostIdentity, Vec<u8>>>>,
    failing: Arc<AtomicBool>,
    saves: Arc<AtomicUsize>,
}

impl MemoryStateStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StorageError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// True if a snapshot is stored for `host`.
    pub fn contains(&self, host: &HostIdentity) -> bool {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).contains_key(host)
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, host: &HostIdentity, snapshot: &HostSnapshot) -> Result<(), StorageError> {
        self.check()?;
        let json = snapshot.to_json()?;
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).insert(host.clone(), json);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self, host: &HostIdentity) -> Result<Option<HostSnapshot>, StorageError> {
        self.check()?;
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(host)
            .map(|json| HostSnapshot::from_json(json).map_err(|e| StorageError::Corrupt(e.to_string())))
            .transpose()
    }

    async fn clear(&self, host: &HostIdentity) -> Result<(), StorageError> {
        self.check()?;
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).remove(host);
        Ok(())
    }
}

/// Store used when persistence is disabled: saves nothing, loads nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStateStore;

#[async_trait]
impl StateStore for NullStateStore {
    async fn save(&self, _host: &HostIdentity, _snapshot: &HostSnapshot) -> Result<(), StorageError> {
        Ok(())
    }

    async fn load(&self, _host: &HostIdentity) -> Result<Option<HostSnapshot>, StorageError> {
        Ok(None)
    }

    async fn clear(&self, _host: &HostIdentity) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mte_relay_types::{ClientId, PairId, PairSnapshot};

    fn host(url: &str) -> HostIdentity {
        HostIdentity::parse(url).unwrap()
    }

    fn snapshot() -> HostSnapshot {
        HostSnapshot {
            client_id: ClientId::new("client-7"),
            pairs: vec![
                PairSnapshot::new(PairId::new("p1"), b"enc-1", b"dec-1"),
                PairSnapshot::new(PairId::new("p2"), b"enc-2", b"dec-2"),
            ],
        }
    }

    fn file_store(dir: &Path) -> FileStateStore {
        FileStateStore::new(dir, Arc::new(DerivedKeyProvider::new([9u8; KEY_SIZE])))
    }

    // ===========================================
    // File Store Tests
    // ===========================================

    #[tokio::test]
    async fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(dir.path());
        let h = host("https://relay.example.com");

        assert!(store.load(&h).await.unwrap().is_none());
        store.save(&h, &snapshot()).await.unwrap();
        assert_eq!(store.load(&h).await.unwrap(), Some(snapshot()));
    }

    #[tokio::test]
    async fn file_is_not_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(dir.path());
        let h = host("https://relay.example.com");
        store.save(&h, &snapshot()).await.unwrap();

        let raw = std::fs::read(store.path_for(&h)).unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(!text.contains("client-7"));
        assert!(!text.contains("p1"));
    }

    #[tokio::test]
    async fn save_overwrites_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(dir.path());
        let h = host("https://relay.example.com");

        store.save(&h, &snapshot()).await.unwrap();
        let smaller = HostSnapshot::client_only(ClientId::new("client-8"));
        store.save(&h, &smaller).await.unwrap();

        assert_eq!(store.load(&h).await.unwrap(), Some(smaller));
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn hosts_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(dir.path());
        let a = host("https://a.example.com");
        let b = host("https://b.example.com");

        store.save(&a, &snapshot()).await.unwrap();
        assert!(store.load(&b).await.unwrap().is_none());

        // A's file under B's name fails to open: key and associated data differ.
        std::fs::copy(store.path_for(&a), store.path_for(&b)).unwrap();
        assert!(matches!(store.load(&b).await, Err(StorageError::Corrupt(_))));
    }

    #[tokio::test]
    async fn wrong_root_key_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let h = host("https://relay.example.com");
        file_store(dir.path()).save(&h, &snapshot()).await.unwrap();

        let other = FileStateStore::new(dir.path(), Arc::new(DerivedKeyProvider::new([1u8; KEY_SIZE])));
        assert!(matches!(other.load(&h).await, Err(StorageError::Corrupt(_))));
    }

    #[tokio::test]
    async fn truncated_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(dir.path());
        let h = host("https://relay.example.com");
        std::fs::write(store.path_for(&h), [FILE_VERSION, 1, 2]).unwrap();
        assert!(matches!(store.load(&h).await, Err(StorageError::Corrupt(_))));
    }

    #[tokio::test]
    async fn clear_removes_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(dir.path());
        let h = host("https://relay.example.com");

        store.clear(&h).await.unwrap();
        store.save(&h, &snapshot()).await.unwrap();
        store.clear(&h).await.unwrap();
        assert!(store.load(&h).await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn state_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(dir.path());
        let h = host("https://relay.example.com");
        store.save(&h, &snapshot()).await.unwrap();

        let perms = std::fs::metadata(store.path_for(&h)).unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o600, "file should be 0600");
    }

    // ===========================================
    // Key Provider Tests
    // ===========================================

    #[test]
    fn derived_keys_differ_per_host() {
        let keys = DerivedKeyProvider::new([3u8; KEY_SIZE]);
        let a = keys.key_for(&host("https://a.example.com")).unwrap();
        let b = keys.key_for(&host("https://b.example.com")).unwrap();
        assert_ne!(*a, *b);
    }

    #[test]
    fn passphrase_derivation_is_deterministic() {
        let params = Argon2Params::for_ram_mb(1500);
        let h = host("https://relay.example.com");
        let a = DerivedKeyProvider::from_passphrase_with_params("hunter2", b"app-salt-0001", params)
            .unwrap();
        let b = DerivedKeyProvider::from_passphrase_with_params("hunter2", b"app-salt-0001", params)
            .unwrap();
        let c = DerivedKeyProvider::from_passphrase_with_params("hunter3", b"app-salt-0001", params)
            .unwrap();
        assert_eq!(*a.key_for(&h).unwrap(), *b.key_for(&h).unwrap());
        assert_ne!(*a.key_for(&h).unwrap(), *c.key_for(&h).unwrap());
    }

    #[test]
    fn argon2_parameters_scale_with_ram() {
        assert_eq!(Argon2Params::for_ram_mb(1500).memory_mib(), 12);
        assert_eq!(Argon2Params::for_ram_mb(3000).memory_mib(), 19);
        assert_eq!(Argon2Params::for_ram_mb(6000).iterations(), 1);
        assert_eq!(Argon2Params::for_ram_mb(16000).memory_mib(), 64);
    }

    #[test]
    fn argon2_tier_boundaries_are_exclusive() {
        assert_eq!(Argon2Params::for_ram_mb(1999).memory_mib(), 12);
        assert_eq!(Argon2Params::for_ram_mb(2000).memory_mib(), 19);
        assert_eq!(Argon2Params::for_ram_mb(7999).memory_mib(), 46);
        assert_eq!(Argon2Params::for_ram_mb(8000).memory_mib(), 64);
        assert_eq!(Argon2Params::for_ram_mb(u64::MAX).iterations(), 3);
    }

    #[test]
    fn key_provider_debug_is_redacted() {
        let keys = DerivedKeyProvider::new([3u8; KEY_SIZE]);
        assert_eq!(format!("{:?}", keys), "DerivedKeyProvider([REDACTED])");
    }

    // ===========================================
    // Memory / Null Store Tests
    // ===========================================

    #[tokio::test]
    async fn memory_store_roundtrip_and_failure_injection() {
        let store = MemoryStateStore::new();
        let h = host("https://relay.example.com");

        store.save(&h, &snapshot()).await.unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load(&h).await.unwrap(), Some(snapshot()));

        store.set_failing(true);
        assert!(matches!(store.load(&h).await, Err(StorageError::Unavailable)));
        assert!(store.save(&h, &snapshot()).await.is_err());
        assert_eq!(store.save_count(), 1);

        store.set_failing(false);
        store.clear(&h).await.unwrap();
        assert!(!store.contains(&h));
    }

    #[tokio::test]
    async fn null_store_forgets_everything() {
        let store = NullStateStore;
        let h = host("https://relay.example.com");
        store.save(&h, &snapshot()).await.unwrap();
        assert!(store.load(&h).await.unwrap().is_none());
    }
}
