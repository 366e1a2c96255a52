//! Pairing coordinator for one relay host.
//!
//! The coordinator drives the pure [`PairingState`] machine from
//! relay-core. Events go in under a short mutex; the actions that come out
//! are either applied on the spot (pool install and discard) or run by a
//! background task (storage and handshake). Callers wait on a
//! `tokio::sync::watch` channel of [`PairingStatus`], so a finished
//! handshake, successful or not, reaches every waiter.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use mte_relay_core::{
    Headers, PairingAction, PairingEvent, PairingState, RepairCounter, RepairDecision,
    RepairPolicy,
};
use mte_relay_types::{
    ClientId, EncodeType, HostIdentity, PairAnswer, PairId, PairOffer, RelayHeader, RELAY_HEADER,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use crate::cipher::{ChaChaRatchetProvider, RatchetProvider};
use crate::codec::{
    decrypt_response, encrypt_request, encrypt_streaming_request, open_buffered, open_stream,
    parse_head, RelayRequest, RelayResponse,
};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::kem::{KeyExchange, MlKemAgent};
use crate::pair::{PairError, PendingPair, SessionPair};
use crate::pool::PairPool;
use crate::storage::{NullStateStore, StateStore};
use crate::stream::{
    decrypt_download, encrypt_upload, upload_content_length, BytesSource, DownloadSummary,
    StreamSettings, UploadSource,
};
use crate::transport::{Method, Transport, WireRequest, WireResponse};

/// What callers waiting for a pool see.
#[derive(Debug, Clone)]
pub enum PairingStatus {
    /// No pool yet; a load or handshake is running.
    Pending,
    /// A pool is installed.
    Paired(Arc<PairPool>),
    /// The last handshake failed.
    Failed(String),
}

/// Pluggable collaborators shared by every coordinator of a client.
#[derive(Clone)]
pub struct RelayBackends {
    /// HTTP layer.
    pub transport: Arc<dyn Transport>,
    /// Pairing state persistence.
    pub store: Arc<dyn StateStore>,
    /// KEM used during pairing.
    pub kem: Arc<dyn KeyExchange>,
    /// Ratchet implementation behind every session pair.
    pub ratchets: Arc<dyn RatchetProvider>,
}

impl RelayBackends {
    /// Backends over `transport` with ML-KEM, the ChaCha ratchet and no
    /// persistence.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            store: Arc::new(NullStateStore),
            kem: Arc::new(MlKemAgent),
            ratchets: Arc::new(ChaChaRatchetProvider),
        }
    }

    /// Persist pairing state in `store`.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    /// Use `kem` for pairing.
    pub fn with_kem(mut self, kem: Arc<dyn KeyExchange>) -> Self {
        self.kem = kem;
        self
    }

    /// Use `ratchets` for session pairs.
    pub fn with_ratchets(mut self, ratchets: Arc<dyn RatchetProvider>) -> Self {
        self.ratchets = ratchets;
        self
    }
}

impl std::fmt::Debug for RelayBackends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBackends").finish_non_exhaustive()
    }
}

/// Result of a streamed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResponse {
    /// HTTP status.
    pub status: u16,
    /// Plain headers merged with the decrypted ones.
    pub headers: Headers,
    /// Pair that decrypted the response; `None` for plaintext passthrough.
    pub pair_id: Option<PairId>,
    /// Plaintext bytes written to the sink.
    pub bytes_written: u64,
}

/// Burns its pair if dropped before the response was handled.
///
/// Once a request's encode has committed, the server may have advanced the
/// pair's other direction too. A request abandoned at that point (timeout,
/// transport error, cancelled caller) leaves the pair out of step.
struct InFlight {
    pair: Option<Arc<SessionPair>>,
}

impl InFlight {
    fn new(pair: &Arc<SessionPair>) -> Self {
        Self {
            pair: Some(Arc::clone(pair)),
        }
    }

    fn complete(mut self) {
        self.pair = None;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(pair) = self.pair.take() {
            pair.burn();
            tracing::warn!("Pair {} abandoned mid-request, burned", pair.id());
        }
    }
}

struct HostInner {
    state: PairingState,
    pool: Option<Arc<PairPool>>,
    prepared: Option<Arc<PairPool>>,
    client_id: ClientId,
    repair: RepairCounter,
}

/// Owns the pairing lifecycle and the pair pool of one host.
pub struct PairingCoordinator {
    host: HostIdentity,
    config: Arc<RelayConfig>,
    policy: RepairPolicy,
    backends: RelayBackends,
    inner: Mutex<HostInner>,
    status: watch::Sender<PairingStatus>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl PairingCoordinator {
    /// Create the coordinator and start loading persisted state.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn spawn(
        host: HostIdentity,
        config: Arc<RelayConfig>,
        backends: RelayBackends,
    ) -> Arc<Self> {
        let policy = config.repair_policy();
        let (status, _) = watch::channel(PairingStatus::Pending);
        let coordinator = Arc::new(Self {
            host,
            config,
            policy,
            backends,
            inner: Mutex::new(HostInner {
                state: PairingState::new(),
                pool: None,
                prepared: None,
                client_id: ClientId::default(),
                repair: policy.counter(),
            }),
            status,
            persist_lock: tokio::sync::Mutex::new(()),
        });
        let actions = coordinator.apply(PairingEvent::Started);
        coordinator.launch(actions);
        coordinator
    }

    /// Canonical host this coordinator serves.
    pub fn host(&self) -> &HostIdentity {
        &self.host
    }

    /// Configuration in effect for this host.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Current pairing status.
    pub fn status(&self) -> PairingStatus {
        self.status.borrow().clone()
    }

    /// True once a pool is installed and published.
    pub fn is_paired(&self) -> bool {
        matches!(*self.status.borrow(), PairingStatus::Paired(_))
    }

    /// Generation of the installed pool.
    pub fn generation(&self) -> Option<u64> {
        self.lock().state.generation()
    }

    /// Server-assigned client id; empty before the first probe.
    pub fn client_id(&self) -> ClientId {
        self.lock().client_id.clone()
    }

    /// Ids of the installed pool, in rotation order.
    pub fn pair_ids(&self) -> Vec<PairId> {
        self.current_pool()
            .map(|pool| pool.ids())
            .unwrap_or_default()
    }

    /// Consecutive re-pair counter.
    pub fn repair_attempts(&self) -> u32 {
        self.lock().repair.attempts()
    }

    // =========================================================================
    // State machine
    // =========================================================================

    fn lock(&self) -> MutexGuard<'_, HostInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_pool(&self) -> Option<Arc<PairPool>> {
        self.lock().pool.clone()
    }

    fn apply(&self, event: PairingEvent) -> Vec<PairingAction> {
        let mut inner = self.lock();
        self.apply_locked(&mut inner, event)
    }

    /// Feed one event to the machine. Pool install and discard happen here,
    /// under the lock; everything else is returned for the background task.
    fn apply_locked(&self, inner: &mut HostInner, event: PairingEvent) -> Vec<PairingAction> {
        let state = std::mem::take(&mut inner.state);
        let (next, actions) = state.on_event(event);
        inner.state = next;

        let mut deferred = Vec::new();
        for action in actions {
            match action {
                PairingAction::DiscardPool => {
                    inner.pool = None;
                    inner.prepared = None;
                    inner.client_id = ClientId::default();
                    self.status.send_replace(PairingStatus::Pending);
                }
                PairingAction::InstallPool { generation } => {
                    match inner.prepared.take() {
                        Some(pool) if pool.generation() == generation => inner.pool = Some(pool),
                        _ => tracing::warn!(
                            "No prepared pool for {} generation {}",
                            self.host,
                            generation
                        ),
                    }
                }
                PairingAction::StartHandshake { .. } => {
                    self.status.send_replace(PairingStatus::Pending);
                    deferred.push(action);
                }
                other => deferred.push(other),
            }
        }
        deferred
    }

    fn launch(self: &Arc<Self>, actions: Vec<PairingAction>) {
        if actions.is_empty() {
            return;
        }
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.run(actions).await });
    }

    async fn run(&self, actions: Vec<PairingAction>) {
        let mut queue: VecDeque<PairingAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            if let Some(event) = self.perform(action).await {
                queue.extend(self.apply(event));
            }
        }
    }

    async fn perform(&self, action: PairingAction) -> Option<PairingEvent> {
        match action {
            PairingAction::LoadSnapshot => Some(self.load().await),
            PairingAction::StartHandshake { generation } => {
                match self.handshake(generation).await {
                    Ok(pool) => {
                        tracing::info!(
                            "Paired with {}: {} pairs, generation {}",
                            self.host,
                            pool.len(),
                            generation
                        );
                        self.lock().prepared = Some(pool);
                        Some(PairingEvent::HandshakeSucceeded)
                    }
                    Err(e) => {
                        tracing::warn!("Pairing with {} failed: {}", self.host, e);
                        Some(PairingEvent::HandshakeFailed {
                            reason: e.to_string(),
                        })
                    }
                }
            }
            PairingAction::PersistSnapshot => {
                self.persist().await;
                None
            }
            PairingAction::ClearSnapshot => {
                self.clear().await;
                None
            }
            PairingAction::ReleaseWaiters => {
                let inner = self.lock();
                if let (PairingState::Paired { generation }, Some(pool)) = (&inner.state, &inner.pool) {
                    if pool.generation() == *generation {
                        self.status
                            .send_replace(PairingStatus::Paired(Arc::clone(pool)));
                    }
                }
                None
            }
            PairingAction::FailWaiters { reason } => {
                let inner = self.lock();
                if matches!(inner.state, PairingState::Failed { .. }) {
                    self.status.send_replace(PairingStatus::Failed(reason));
                }
                None
            }
            PairingAction::InstallPool { .. } | PairingAction::DiscardPool => None,
        }
    }

    // =========================================================================
    // Storage
    // =========================================================================

    async fn load(&self) -> PairingEvent {
        if !self.config.persist_state {
            return PairingEvent::SnapshotMissing;
        }
        let snapshot = match self.backends.store.load(&self.host).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return PairingEvent::SnapshotMissing,
            Err(e) => {
                tracing::warn!("Could not load pairing state for {}: {}", self.host, e);
                return PairingEvent::SnapshotMissing;
            }
        };

        if !snapshot.has_pairs() || !snapshot.is_consistent() {
            self.lock().client_id = snapshot.client_id;
            return PairingEvent::SnapshotLoaded { pair_count: 0 };
        }

        match PairPool::reload(1, &snapshot, Arc::clone(&self.backends.ratchets)) {
            Ok(pool) => {
                let pair_count = pool.len();
                tracing::info!("Reloaded {} pairs for {}", pair_count, self.host);
                let mut inner = self.lock();
                inner.client_id = snapshot.client_id;
                inner.prepared = Some(Arc::new(pool));
                PairingEvent::SnapshotLoaded { pair_count }
            }
            Err(e) => {
                tracing::warn!("Discarding unreadable pairing state for {}: {}", self.host, e);
                PairingEvent::SnapshotMissing
            }
        }
    }

    /// Save the installed pool. Failures are logged and never block dispatch.
    async fn persist(&self) {
        if !self.config.persist_state {
            return;
        }
        let _guard = self.persist_lock.lock().await;
        let snapshot = {
            let inner = self.lock();
            match &inner.pool {
                Some(pool) => pool.snapshot(&inner.client_id),
                None => return,
            }
        };
        if let Err(e) = self.backends.store.save(&self.host, &snapshot).await {
            tracing::warn!("Could not persist pairing state for {}: {}", self.host, e);
        }
    }

    async fn clear(&self) {
        if !self.config.persist_state {
            return;
        }
        let _guard = self.persist_lock.lock().await;
        if let Err(e) = self.backends.store.clear(&self.host).await {
            tracing::warn!("Could not clear pairing state for {}: {}", self.host, e);
        }
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    async fn handshake(&self, generation: u64) -> Result<Arc<PairPool>, RelayError> {
        tracing::info!("Pairing with {} (generation {})", self.host, generation);
        let client_id = self.probe().await?;
        self.lock().client_id = client_id.clone();

        let kem = self.backends.kem.as_ref();
        let pending = PairPool::create(self.config.pool_size, kem)?;
        let offers: Vec<PairOffer> = pending.iter().map(PendingPair::offer).collect();
        let body = serde_json::to_vec(&offers)
            .map_err(|e| RelayError::HandshakeFailed(e.to_string()))?;

        let request = WireRequest::new(Method::Post, self.host.join(&self.config.pair_route))
            .header(RELAY_HEADER, client_id.as_str())
            .header("content-type", "application/json")
            .body(body);
        let response = self.backends.transport.send(request).await?;
        if !(200..300).contains(&response.status) {
            return Err(RelayError::HandshakeFailed(format!(
                "pairing returned status {}",
                response.status
            )));
        }

        let answers: Vec<PairAnswer> = serde_json::from_slice(&response.body)
            .map_err(|e| RelayError::HandshakeFailed(format!("pairing response: {}", e)))?;
        let mut answers: HashMap<PairId, PairAnswer> = answers
            .into_iter()
            .map(|answer| (answer.pair_id.clone(), answer))
            .collect();

        let mut pairs: Vec<SessionPair> = Vec::with_capacity(pending.len());
        for candidate in pending {
            let answer = answers.remove(candidate.pair_id()).ok_or_else(|| {
                RelayError::HandshakeFailed(format!("no answer for pair {}", candidate.pair_id()))
            })?;
            pairs.push(candidate.complete(&answer, kem, Arc::clone(&self.backends.ratchets))?);
        }
        Ok(Arc::new(PairPool::from_pairs(generation, pairs)))
    }

    async fn probe(&self) -> Result<ClientId, RelayError> {
        let known = self.client_id();
        let mut request = WireRequest::new(Method::Head, self.host.join(&self.config.probe_route));
        if !known.is_empty() {
            request = request.header(RELAY_HEADER, known.as_str());
        }

        let response = self.backends.transport.send(request).await?;
        if !(200..300).contains(&response.status) {
            return Err(RelayError::HandshakeFailed(format!(
                "probe returned status {}",
                response.status
            )));
        }
        let header = response.header(RELAY_HEADER).ok_or_else(|| {
            RelayError::HandshakeFailed("host does not speak the relay protocol".into())
        })?;
        let client_id = RelayHeader::parse(header)
            .map_err(|e| RelayError::HandshakeFailed(e.to_string()))?
            .client_id;
        if client_id.is_empty() {
            return Err(RelayError::HandshakeFailed("probe returned an empty client id".into()));
        }
        Ok(client_id)
    }

    // =========================================================================
    // Waiting and re-pairing
    // =========================================================================

    /// Wait until a pool is installed.
    ///
    /// If the last handshake failed, this call starts a new one. Callers
    /// already waiting when a handshake fails get its error.
    pub async fn wait_paired(self: &Arc<Self>) -> Result<Arc<PairPool>, RelayError> {
        let mut rx = self.status.subscribe();
        let initial = rx.borrow_and_update().clone();
        match initial {
            PairingStatus::Paired(pool) => return Ok(pool),
            PairingStatus::Failed(_) => {
                let actions = self.apply(PairingEvent::RetryRequested);
                self.launch(actions);
            }
            PairingStatus::Pending => {}
        }

        loop {
            let status = rx.borrow_and_update().clone();
            match status {
                PairingStatus::Paired(pool) => return Ok(pool),
                PairingStatus::Failed(reason) => return Err(RelayError::HandshakeFailed(reason)),
                PairingStatus::Pending => {}
            }
            rx.changed()
                .await
                .map_err(|_| RelayError::HandshakeFailed("coordinator stopped".into()))?;
        }
    }

    /// Force a re-pair and wait for the new pool.
    ///
    /// Does not count against the re-pair budget.
    pub async fn repair(self: &Arc<Self>) -> Result<(), RelayError> {
        let pool = self.wait_paired().await?;
        tracing::info!("Re-pair of {} requested", self.host);
        self.request_repair(pool.generation());
        self.wait_paired().await.map(|_| ())
    }

    /// Re-pair if `generation` is still the installed one.
    fn request_repair(self: &Arc<Self>, generation: u64) {
        let actions = {
            let mut inner = self.lock();
            if inner.state.generation() != Some(generation) {
                return;
            }
            self.apply_locked(&mut inner, PairingEvent::RepairRequested)
        };
        self.launch(actions);
    }

    /// React to a reserved status on a request sent with a pool of
    /// `generation`.
    ///
    /// Only the first report for the installed generation re-pairs and
    /// consumes budget; reports against an older generation just retry.
    fn handle_invalid_pairing(
        self: &Arc<Self>,
        generation: u64,
        status: u16,
    ) -> Result<(), RelayError> {
        let actions = {
            let mut inner = self.lock();
            if inner.state.generation() != Some(generation) {
                tracing::debug!(
                    "Status {} from {} for replaced generation {}",
                    status,
                    self.host,
                    generation
                );
                return Ok(());
            }
            match inner.repair.on_reserved() {
                RepairDecision::Repair { attempt } => {
                    tracing::warn!(
                        "{} reported pairing invalid (status {}), re-pair attempt {}",
                        self.host,
                        status,
                        attempt
                    );
                    self.apply_locked(&mut inner, PairingEvent::RepairRequested)
                }
                RepairDecision::Exhausted { attempts } => {
                    tracing::warn!(
                        "{} reported pairing invalid (status {}), re-pair budget exhausted",
                        self.host,
                        status
                    );
                    return Err(RelayError::RepairExhausted { attempts, status });
                }
            }
        };
        self.launch(actions);
        Ok(())
    }

    /// Burn the pair behind a crypto failure and re-pair once burned pairs
    /// recur across the pool.
    fn note_failure(self: &Arc<Self>, pool: &PairPool, error: RelayError) -> RelayError {
        if let Some(pair_id) = error.burned_pair() {
            pool.burn(pair_id);
            tracing::warn!("Pair {} of {} burned: {}", pair_id, self.host, error);
        }
        self.repair_if_burned(pool);
        error
    }

    /// Re-pair once burned pairs recur; returns true if a re-pair was asked for.
    fn repair_if_burned(self: &Arc<Self>, pool: &PairPool) -> bool {
        let burned = pool.burned();
        if burned > 0 && burned >= pool.len().min(2) {
            tracing::warn!("{} pairs of {} burned, re-pairing", burned, self.host);
            self.request_repair(pool.generation());
            return true;
        }
        false
    }

    /// True if a failed response should be retried on another pair.
    fn should_retry(&self, error: &RelayError, retried: &mut bool) -> bool {
        if *retried || error.burned_pair().is_none() {
            return false;
        }
        *retried = true;
        tracing::warn!("Retrying request to {} on another pair: {}", self.host, error);
        true
    }

    async fn next_pair(self: &Arc<Self>) -> Result<(Arc<PairPool>, Arc<SessionPair>), RelayError> {
        loop {
            let pool = self.wait_paired().await?;
            if self.repair_if_burned(&pool) {
                continue;
            }
            match pool.next() {
                Ok(pair) => return Ok((pool, pair)),
                Err(PairError::PoolExhausted) => {
                    tracing::warn!("Every pair of {} is burned, re-pairing", self.host);
                    self.request_repair(pool.generation());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn on_success(&self) {
        self.lock().repair.reset();
        self.persist().await;
    }

    async fn finish(self: &Arc<Self>, response: WireResponse) -> Result<RelayResponse, RelayError> {
        let pool = self
            .current_pool()
            .unwrap_or_else(|| Arc::new(PairPool::from_pairs(0, Vec::new())));
        match decrypt_response(&pool, response).await {
            Ok(opened) => {
                if opened.pair_id.is_some() {
                    self.on_success().await;
                }
                Ok(opened)
            }
            Err(e) => Err(self.note_failure(&pool, e)),
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Encrypt `request`, send it, and decrypt the response.
    ///
    /// Bodies above `stream_threshold` go through [`upload`](Self::upload).
    /// The whole call is bounded by `request_timeout_secs`. A request that
    /// times out after its encode committed burns its pair: the server may
    /// already have answered on it, so its ratchets can no longer be trusted.
    /// A response that fails to decrypt burns its pair and the request is
    /// sent once more on the next pair.
    pub async fn send(self: &Arc<Self>, request: RelayRequest) -> Result<RelayResponse, RelayError> {
        if request.body.len() > self.config.stream_threshold {
            let mut request = request;
            let source = BytesSource::new(std::mem::take(&mut request.body));
            return self.upload(request, &source).await;
        }

        match tokio::time::timeout(self.config.request_timeout(), self.dispatch(&request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("{} {} on {} timed out", request.method, request.route, self.host);
                Err(RelayError::Timeout)
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, request: &RelayRequest) -> Result<RelayResponse, RelayError> {
        let mut retried = false;
        loop {
            let (pool, pair) = self.next_pair().await?;
            let client_id = self.client_id();
            let encrypted = match encrypt_request(
                &pair,
                &request.route,
                &request.headers,
                &self.config.headers_to_encrypt,
                &request.body,
            )
            .await
            {
                Ok(encrypted) => encrypted,
                Err(e) => return Err(self.note_failure(&pool, e.into())),
            };
            let in_flight = InFlight::new(&pair);
            self.persist().await;

            tracing::debug!("{} via pair {} to {}", request.method, pair.id(), self.host);
            let wire = encrypted.into_wire(&self.host, &client_id, request.method, EncodeType::Mte);
            let response = self.backends.transport.send(wire).await?;

            if self.policy.is_reserved(response.status) {
                in_flight.complete();
                self.handle_invalid_pairing(pool.generation(), response.status)?;
                continue;
            }
            let result = self.finish(response).await;
            in_flight.complete();
            match result {
                Err(e) if self.should_retry(&e, &mut retried) => continue,
                other => return other,
            }
        }
    }

    /// Stream `source` as the request body, encrypted chunk by chunk.
    ///
    /// The source is opened again for every attempt. Bounded by the
    /// transport's own timeouts, not `request_timeout_secs`.
    pub async fn upload(
        self: &Arc<Self>,
        request: RelayRequest,
        source: &dyn UploadSource,
    ) -> Result<RelayResponse, RelayError> {
        let settings = StreamSettings::upload(&self.config);
        let mut retried = false;
        loop {
            let (pool, pair) = self.next_pair().await?;
            let opened = source.open().await?;
            let client_id = self.client_id();

            let (encrypted, stream) = match encrypt_streaming_request(
                &pair,
                &request.route,
                &request.headers,
                &self.config.headers_to_encrypt,
            )
            .await
            {
                Ok(started) => started,
                Err(e) => return Err(self.note_failure(&pool, e.into())),
            };
            let in_flight = InFlight::new(&pair);

            let content_length = upload_content_length(opened.len, pair.finish_encrypt_bytes());
            let mut wire =
                encrypted.into_wire(&self.host, &client_id, request.method, EncodeType::Mke);
            wire.headers
                .insert("content-length".into(), content_length.to_string());

            let (tx, rx) = mpsc::channel(settings.channel_depth);
            let (sent, uploaded) = tokio::join!(
                self.backends.transport.send_stream(wire, rx),
                encrypt_upload(stream, opened.reader, tx, settings)
            );
            self.persist().await;

            if let Err(e) = uploaded {
                let e = self.note_failure(&pool, e);
                return Err(match sent {
                    Err(transport) => transport.into(),
                    Ok(_) => e,
                });
            }
            let response = sent?;

            if self.policy.is_reserved(response.status) {
                in_flight.complete();
                self.handle_invalid_pairing(pool.generation(), response.status)?;
                continue;
            }
            let result = self.finish(response).await;
            in_flight.complete();
            match result {
                Err(e) if self.should_retry(&e, &mut retried) => continue,
                other => return other,
            }
        }
    }

    /// Send `request` and stream the decrypted response body into `sink`.
    ///
    /// The sink is flushed and shut down when the body ends. Stream-mode
    /// bodies are written as they decrypt and authenticated only at the end,
    /// so on `Err` the sink may hold unverified plaintext and must be
    /// discarded. A failure before anything was written is retried once on
    /// the next pair.
    pub async fn download<W>(
        self: &Arc<Self>,
        request: RelayRequest,
        sink: &mut W,
    ) -> Result<DownloadResponse, RelayError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let settings = StreamSettings::download(&self.config);
        let mut retried = false;
        loop {
            let (pool, pair) = self.next_pair().await?;
            let client_id = self.client_id();
            let encrypted = match encrypt_request(
                &pair,
                &request.route,
                &request.headers,
                &self.config.headers_to_encrypt,
                &request.body,
            )
            .await
            {
                Ok(encrypted) => encrypted,
                Err(e) => return Err(self.note_failure(&pool, e.into())),
            };
            let in_flight = InFlight::new(&pair);
            self.persist().await;

            let wire = encrypted.into_wire(&self.host, &client_id, request.method, EncodeType::Mte);
            let response = self.backends.transport.fetch_stream(wire).await?;
            if self.policy.is_reserved(response.status) {
                in_flight.complete();
                self.handle_invalid_pairing(pool.generation(), response.status)?;
                continue;
            }

            let current = self
                .current_pool()
                .unwrap_or_else(|| Arc::new(PairPool::from_pairs(0, Vec::new())));
            let mut head = match parse_head(&current, response.status, response.headers) {
                Ok(head) => head,
                Err(e) => return Err(self.note_failure(&current, e)),
            };

            if head.is_stream() {
                let pair_id = head.pair.as_ref().map(|pair| pair.id().clone());
                let stream = match open_stream(&mut head).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        let e = self.note_failure(&current, e);
                        if self.should_retry(&e, &mut retried) {
                            continue;
                        }
                        return Err(e);
                    }
                };
                let summary: DownloadSummary =
                    match decrypt_download(stream, response.body, sink, settings).await {
                        Ok(summary) => summary,
                        Err(e) => return Err(self.note_failure(&current, e)),
                    };
                in_flight.complete();
                self.on_success().await;
                return Ok(DownloadResponse {
                    status: head.status,
                    headers: head.headers,
                    pair_id,
                    bytes_written: summary.plaintext_bytes,
                });
            }

            let mut body = Vec::new();
            let mut chunks = response.body;
            while let Some(chunk) = chunks.recv().await {
                body.extend_from_slice(&chunk?);
            }
            let opened = match open_buffered(head, body).await {
                Ok(opened) => opened,
                Err(e) => {
                    let e = self.note_failure(&current, e);
                    if self.should_retry(&e, &mut retried) {
                        continue;
                    }
                    return Err(e);
                }
            };
            in_flight.complete();
            if opened.pair_id.is_some() {
                self.on_success().await;
            }
            sink.write_all(&opened.body).await?;
            sink.flush().await?;
            sink.shutdown().await?;
            return Ok(DownloadResponse {
                status: opened.status,
                headers: opened.headers,
                pair_id: opened.pair_id,
                bytes_written: opened.body.len() as u64,
            });
        }
    }
}

impl std::fmt::Debug for PairingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingCoordinator")
            .field("host", &self.host)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}
