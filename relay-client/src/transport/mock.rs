//! In-process relay server for tests.
//!
//! Runs the server half of the relay protocol against real session pairs:
//! it answers the capability probe, encapsulates secrets for pairing
//! requests, decrypts relayed requests and encrypts its replies. Routes can
//! be scripted to reject, stall, or serve files.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use mte_relay_core::Headers;
use mte_relay_types::{
    random_token, ClientId, EncodeType, PairAnswer, PairId, PairOffer, RelayHeader,
    ENCRYPTED_HEADERS_HEADER, RELAY_HEADER,
};
use tokio::sync::{mpsc, Notify};

use super::{Method, StreamingResponse, Transport, TransportError, WireRequest, WireResponse};
use crate::cipher::{ChaChaRatchetProvider, Direction, RatchetProvider};
use crate::codec::decode_route;
use crate::kem::{KeyExchange, MlKemAgent};
use crate::pair::{instantiate_ratchet, SessionPair};

/// Route answering the capability probe.
const PROBE_ROUTE: &str = "api/mte-relay";
/// Route answering pairing requests.
const PAIR_ROUTE: &str = "api/mte-pair";
/// Status for a request the server could not decode.
const DECODE_FAILED: u16 = 560;
/// Status for a pair or client the server does not know.
const UNKNOWN_PAIRING: u16 = 561;
/// Size of the chunks `fetch_stream` hands back.
const RESPONSE_CHUNK: usize = 1000;

/// In-process relay server implementing [`Transport`].
///
/// Cloning shares the server, so a test can keep a handle while the
/// client owns another.
#[derive(Clone)]
pub struct MockRelayServer {
    inner: Arc<MockInner>,
}

struct MockInner {
    kem: MlKemAgent,
    ratchets: Arc<dyn RatchetProvider>,
    state: Mutex<MockState>,
    probes: AtomicUsize,
    pair_calls: AtomicUsize,
    requests: AtomicUsize,
}

#[derive(Default)]
struct MockState {
    clients: HashSet<ClientId>,
    pairs: HashMap<PairId, Arc<SessionPair>>,
    rejections: HashMap<String, (u16, usize)>,
    holds: HashMap<String, Arc<Notify>>,
    holding: HashMap<String, usize>,
    pairing_failure: Option<u16>,
    files: HashMap<String, Vec<u8>>,
    uploads: HashMap<String, Vec<u8>>,
    skips: HashMap<String, usize>,
}

/// A request the server decrypted.
struct Opened {
    pair: Arc<SessionPair>,
    client_id: ClientId,
    route: String,
    headers: Headers,
    body: Vec<u8>,
    encode_type: EncodeType,
}

impl Default for MockRelayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockRelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRelayServer")
            .field("probes", &self.probe_count())
            .field("pair_calls", &self.pair_call_count())
            .field("requests", &self.request_count())
            .finish_non_exhaustive()
    }
}

impl MockRelayServer {
    /// Create a server with no clients and no pairs.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                kem: MlKemAgent,
                ratchets: Arc::new(ChaChaRatchetProvider),
                state: Mutex::new(MockState::default()),
                probes: AtomicUsize::new(0),
                pair_calls: AtomicUsize::new(0),
                requests: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of capability probes answered.
    pub fn probe_count(&self) -> usize {
        self.inner.probes.load(Ordering::SeqCst)
    }

    /// Number of pairing requests received.
    pub fn pair_call_count(&self) -> usize {
        self.inner.pair_calls.load(Ordering::SeqCst)
    }

    /// Number of relayed requests received.
    pub fn request_count(&self) -> usize {
        self.inner.requests.load(Ordering::SeqCst)
    }

    /// Answer the next request to `route` with a plain `status`.
    pub fn reject(&self, route: &str, status: u16) {
        self.reject_times(route, status, 1);
    }

    /// Answer the next `times` requests to `route` with a plain `status`.
    pub fn reject_times(&self, route: &str, status: u16, times: usize) {
        let mut state = self.inner.state.lock().unwrap();
        state.rejections.insert(route.to_string(), (status, times));
    }

    /// Advance the pair's encoder once before each of the next `times`
    /// replies to `route`, so the client cannot decrypt them.
    pub fn skip_reply_encodes(&self, route: &str, times: usize) {
        let mut state = self.inner.state.lock().unwrap();
        state.skips.insert(route.to_string(), times);
    }

    /// Stall the next response to `route` until [`release`](Self::release).
    ///
    /// The response is encrypted before the stall, so it names the pair the
    /// request arrived on even if that pair is gone by the time it is sent.
    pub fn hold(&self, route: &str) {
        let mut state = self.inner.state.lock().unwrap();
        state
            .holds
            .insert(route.to_string(), Arc::new(Notify::new()));
    }

    /// Let the stalled response to `route` go.
    pub fn release(&self, route: &str) {
        let notify = self.inner.state.lock().unwrap().holds.remove(route);
        if let Some(notify) = notify {
            notify.notify_one();
        }
    }

    /// True while a response to `route` is stalled.
    pub fn is_holding(&self, route: &str) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.holding.get(route).copied().unwrap_or(0) > 0
    }

    /// Wait until a response to `route` is stalled.
    pub async fn wait_until_holding(&self, route: &str) {
        while !self.is_holding(route) {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    /// Fail the next pairing request with `status`.
    pub fn fail_next_pairing(&self, status: u16) {
        self.inner.state.lock().unwrap().pairing_failure = Some(status);
    }

    /// Drop every pair, as a server restart would.
    pub fn forget_pairings(&self) {
        self.inner.state.lock().unwrap().pairs.clear();
    }

    /// Ids of the pairs the server holds.
    pub fn pair_ids(&self) -> Vec<PairId> {
        let state = self.inner.state.lock().unwrap();
        let mut ids: Vec<PairId> = state.pairs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Serve `bytes` as a stream-mode response on `route`.
    pub fn serve_file(&self, route: &str, bytes: Vec<u8>) {
        let mut state = self.inner.state.lock().unwrap();
        state.files.insert(route.to_string(), bytes);
    }

    /// Plaintext of the last stream-mode upload to `route`.
    pub fn uploaded(&self, route: &str) -> Option<Vec<u8>> {
        self.inner.state.lock().unwrap().uploads.get(route).cloned()
    }

    async fn handle(&self, request: WireRequest) -> WireResponse {
        let path = url::Url::parse(&request.url)
            .map(|url| url.path().trim_start_matches('/').to_string())
            .unwrap_or_default();

        match (request.method, path.as_str()) {
            (Method::Head, PROBE_ROUTE) => self.probe(&request),
            (Method::Post, PAIR_ROUTE) => self.pair(&request),
            (_, PROBE_ROUTE) | (_, PAIR_ROUTE) => WireResponse::new(405),
            _ => self.relay(request, &path).await,
        }
    }

    fn probe(&self, request: &WireRequest) -> WireResponse {
        self.inner.probes.fetch_add(1, Ordering::SeqCst);
        let client_id = request
            .header_value(RELAY_HEADER)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(ClientId::new)
            .unwrap_or_else(|| ClientId::new(random_token()));

        self.inner
            .state
            .lock()
            .unwrap()
            .clients
            .insert(client_id.clone());

        let mut response = WireResponse::new(200);
        response
            .headers
            .insert(RELAY_HEADER.to_string(), client_id.to_string());
        response
    }

    fn pair(&self, request: &WireRequest) -> WireResponse {
        self.inner.pair_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(status) = state.pairing_failure.take() {
                return WireResponse::new(status);
            }
            let known = request
                .header_value(RELAY_HEADER)
                .map(|id| state.clients.contains(&ClientId::new(id.trim())))
                .unwrap_or(false);
            if !known {
                return WireResponse::new(UNKNOWN_PAIRING);
            }
        }

        let Ok(offers) = serde_json::from_slice::<Vec<PairOffer>>(&request.body) else {
            return WireResponse::new(400);
        };

        let mut answers = Vec::with_capacity(offers.len());
        let mut pairs = Vec::with_capacity(offers.len());
        for offer in &offers {
            match self.answer(offer) {
                Some((answer, pair)) => {
                    answers.push(answer);
                    pairs.push(pair);
                }
                None => return WireResponse::new(400),
            }
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            for pair in pairs {
                state.pairs.insert(pair.id().clone(), Arc::new(pair));
            }
        }

        let mut response = WireResponse::new(200);
        response
            .headers
            .insert("content-type".into(), "application/json".into());
        response.body = serde_json::to_vec(&answers).unwrap_or_default();
        response
    }

    /// Responder side of pairing for one offer.
    fn answer(&self, offer: &PairOffer) -> Option<(PairAnswer, SessionPair)> {
        let kem = &self.inner.kem;
        let ratchets = self.inner.ratchets.as_ref();

        // Client encoder talks to our decoder.
        let (up_ct, up_secret) = kem
            .encapsulate(&offer.encoder_public_key_bytes().ok()?)
            .ok()?;
        let (down_ct, down_secret) = kem
            .encapsulate(&offer.decoder_public_key_bytes().ok()?)
            .ok()?;
        let up_nonce: u64 = rand::random();
        let down_nonce: u64 = rand::random();

        let decoder_state = instantiate_ratchet(
            ratchets,
            Direction::Decoder,
            up_secret.as_bytes(),
            up_nonce,
            &offer.encoder_personalization,
        )
        .ok()?;
        let encoder_state = instantiate_ratchet(
            ratchets,
            Direction::Encoder,
            down_secret.as_bytes(),
            down_nonce,
            &offer.decoder_personalization,
        )
        .ok()?;

        let answer = PairAnswer {
            pair_id: offer.pair_id.clone(),
            decoder_secret: STANDARD.encode(up_ct),
            decoder_nonce: up_nonce.to_string(),
            encoder_secret: STANDARD.encode(down_ct),
            encoder_nonce: down_nonce.to_string(),
        };
        let pair = SessionPair::from_states(
            offer.pair_id.clone(),
            encoder_state,
            decoder_state,
            self.inner.ratchets.clone(),
        );
        Some((answer, pair))
    }

    async fn relay(&self, request: WireRequest, segment: &str) -> WireResponse {
        self.inner.requests.fetch_add(1, Ordering::SeqCst);

        let opened = match self.open(&request, segment).await {
            Ok(opened) => opened,
            Err(status) => return WireResponse::new(status),
        };

        let rejected = {
            let mut state = self.inner.state.lock().unwrap();
            if opened.encode_type == EncodeType::Mke {
                state
                    .uploads
                    .insert(opened.route.clone(), opened.body.clone());
            }
            match state.rejections.get_mut(&opened.route) {
                Some((status, remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*status)
                }
                _ => None,
            }
        };
        if let Some(status) = rejected {
            return WireResponse::new(status);
        }

        let response = match self.reply(&request, &opened).await {
            Ok(response) => response,
            Err(status) => return WireResponse::new(status),
        };

        self.stall(&opened.route).await;
        response
    }

    async fn open(&self, request: &WireRequest, segment: &str) -> Result<Opened, u16> {
        let relay = request
            .header_value(RELAY_HEADER)
            .and_then(|value| RelayHeader::parse(value).ok())
            .ok_or(400u16)?;
        let pair_id = relay.pair_id.ok_or(400u16)?;
        let pair = {
            let state = self.inner.state.lock().unwrap();
            if !state.clients.contains(&relay.client_id) {
                return Err(UNKNOWN_PAIRING);
            }
            state.pairs.get(&pair_id).cloned().ok_or(UNKNOWN_PAIRING)?
        };

        let route_ct = decode_route(segment).map_err(|_| DECODE_FAILED)?;
        let header_ct = request
            .header_value(ENCRYPTED_HEADERS_HEADER)
            .and_then(|blob| STANDARD.decode(blob).ok())
            .ok_or(DECODE_FAILED)?;

        let (route, header_json, body) = match relay.encode_type {
            EncodeType::Mte => {
                let mut plain = pair
                    .decode_all(&[route_ct.as_slice(), header_ct.as_slice(), request.body.as_slice()])
                    .await
                    .map_err(|_| DECODE_FAILED)?
                    .into_iter();
                let route = plain.next().unwrap_or_default();
                let headers = plain.next().unwrap_or_default();
                (route, headers, plain.next().unwrap_or_default())
            }
            EncodeType::Mke => {
                let (prefix, mut stream) = pair
                    .start_decrypt_after(&[route_ct.as_slice(), header_ct.as_slice()])
                    .await
                    .map_err(|_| DECODE_FAILED)?;
                let mut body = stream
                    .decrypt_chunk(&request.body)
                    .map_err(|_| DECODE_FAILED)?;
                body.extend(stream.finish_decrypt().map_err(|_| DECODE_FAILED)?);
                let mut prefix = prefix.into_iter();
                let route = prefix.next().unwrap_or_default();
                (route, prefix.next().unwrap_or_default(), body)
            }
        };

        let headers: Headers = serde_json::from_slice(&header_json).map_err(|_| DECODE_FAILED)?;
        Ok(Opened {
            pair,
            client_id: relay.client_id,
            route: String::from_utf8_lossy(&route).into_owned(),
            headers,
            body,
            encode_type: relay.encode_type,
        })
    }

    async fn reply(&self, request: &WireRequest, opened: &Opened) -> Result<WireResponse, u16> {
        let (file, skip) = {
            let mut state = self.inner.state.lock().unwrap();
            let skip = match state.skips.get_mut(&opened.route) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };
            (state.files.get(&opened.route).cloned(), skip)
        };
        if skip {
            opened
                .pair
                .encode(b"skipped")
                .await
                .map_err(|_| DECODE_FAILED)?;
        }

        let (content_type, body) = match &file {
            Some(bytes) => ("application/octet-stream", bytes.clone()),
            None => {
                let echo = serde_json::json!({
                    "method": request.method.as_str(),
                    "route": opened.route,
                    "headers": opened.headers,
                    "body": STANDARD.encode(&opened.body),
                    "body_len": opened.body.len(),
                });
                ("application/json", serde_json::to_vec(&echo).unwrap_or_default())
            }
        };
        let mut protected = Headers::new();
        protected.insert("content-type".into(), content_type.into());
        let header_json = serde_json::to_vec(&protected).unwrap_or_default();

        let (encode_type, header_ct, body_ct) = if file.is_some() {
            let (prefix, mut stream) = opened
                .pair
                .start_encrypt_after(&[header_json.as_slice()])
                .await
                .map_err(|_| DECODE_FAILED)?;
            let mut body = body;
            stream.encrypt_chunk(&mut body).map_err(|_| DECODE_FAILED)?;
            body.extend(stream.finish_encrypt().map_err(|_| DECODE_FAILED)?);
            let header_ct = prefix.into_iter().next().unwrap_or_default();
            (EncodeType::Mke, header_ct, body)
        } else {
            let mut encoded = opened
                .pair
                .encode_all(&[header_json.as_slice(), body.as_slice()])
                .await
                .map_err(|_| DECODE_FAILED)?
                .into_iter();
            let header_ct = encoded.next().unwrap_or_default();
            (EncodeType::Mte, header_ct, encoded.next().unwrap_or_default())
        };

        let mut relay =
            RelayHeader::relayed(opened.client_id.clone(), opened.pair.id().clone(), encode_type);
        relay.url_encoded = false;

        let mut response = WireResponse::new(200);
        response
            .headers
            .insert(RELAY_HEADER.to_string(), relay.to_string());
        response
            .headers
            .insert(ENCRYPTED_HEADERS_HEADER.to_string(), STANDARD.encode(header_ct));
        response
            .headers
            .insert("x-mock-server".into(), "1".into());
        response.headers.insert(
            "access-control-expose-headers".into(),
            format!("{}, {}, x-mock-server", RELAY_HEADER, ENCRYPTED_HEADERS_HEADER),
        );
        response.body = body_ct;
        Ok(response)
    }

    async fn stall(&self, route: &str) {
        let notify = {
            let mut state = self.inner.state.lock().unwrap();
            let notify = state.holds.get(route).cloned();
            if notify.is_some() {
                *state.holding.entry(route.to_string()).or_default() += 1;
            }
            notify
        };
        if let Some(notify) = notify {
            notify.notified().await;
            let mut state = self.inner.state.lock().unwrap();
            if let Some(count) = state.holding.get_mut(route) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

#[async_trait]
impl Transport for MockRelayServer {
    async fn send(&self, request: WireRequest) -> Result<WireResponse, TransportError> {
        Ok(self.handle(request).await)
    }

    async fn send_stream(
        &self,
        mut request: WireRequest,
        mut body: mpsc::Receiver<Vec<u8>>,
    ) -> Result<WireResponse, TransportError> {
        let mut collected = Vec::new();
        while let Some(chunk) = body.recv().await {
            collected.extend_from_slice(&chunk);
        }
        request.body = collected;
        Ok(self.handle(request).await)
    }

    async fn fetch_stream(&self, request: WireRequest) -> Result<StreamingResponse, TransportError> {
        let response = self.handle(request).await;
        let (tx, rx) = mpsc::channel(4);
        let body = response.body;
        tokio::spawn(async move {
            for chunk in body.chunks(RESPONSE_CHUNK) {
                if tx.send(Ok(chunk.to_vec())).await.is_err() {
                    break;
                }
            }
        });
        Ok(StreamingResponse {
            status: response.status,
            headers: response.headers,
            body: rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decrypt_response, encrypt_request};
    use crate::pair::PendingPair;
    use crate::pool::PairPool;
    use mte_relay_types::HostIdentity;

    const HOST: &str = "https://relay.test";

    async fn probe(server: &MockRelayServer) -> ClientId {
        let response = server
            .send(WireRequest::new(Method::Head, format!("{}/{}", HOST, PROBE_ROUTE)))
            .await
            .unwrap();
        ClientId::new(response.header(RELAY_HEADER).unwrap())
    }

    async fn paired(server: &MockRelayServer) -> (ClientId, PairPool) {
        let client_id = probe(server).await;
        let pending = PairPool::create(2, &MlKemAgent).unwrap();
        let offers: Vec<PairOffer> = pending.iter().map(PendingPair::offer).collect();
        let response = server
            .send(
                WireRequest::new(Method::Post, format!("{}/{}", HOST, PAIR_ROUTE))
                    .header(RELAY_HEADER, client_id.as_str())
                    .body(serde_json::to_vec(&offers).unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        let answers: Vec<PairAnswer> = serde_json::from_slice(&response.body).unwrap();
        let ratchets: Arc<dyn RatchetProvider> = Arc::new(ChaChaRatchetProvider);
        let pairs = pending
            .into_iter()
            .zip(&answers)
            .map(|(p, a)| p.complete(a, &MlKemAgent, ratchets.clone()).unwrap())
            .collect();
        (client_id, PairPool::from_pairs(1, pairs))
    }

    // ===========================================
    // Handshake Tests
    // ===========================================

    #[tokio::test]
    async fn probe_assigns_and_keeps_client_ids() {
        let server = MockRelayServer::new();
        let first = probe(&server).await;
        assert!(!first.is_empty());

        let again = server
            .send(
                WireRequest::new(Method::Head, format!("{}/{}", HOST, PROBE_ROUTE))
                    .header(RELAY_HEADER, first.as_str()),
            )
            .await
            .unwrap();
        assert_eq!(again.header(RELAY_HEADER), Some(first.as_str()));
        assert_eq!(server.probe_count(), 2);
    }

    #[tokio::test]
    async fn pairing_registers_every_offer() {
        let server = MockRelayServer::new();
        let (_, pool) = paired(&server).await;
        let mut ids = pool.ids();
        ids.sort();
        assert_eq!(server.pair_ids(), ids);
        assert_eq!(server.pair_call_count(), 1);
    }

    #[tokio::test]
    async fn scripted_pairing_failure_fires_once() {
        let server = MockRelayServer::new();
        let client_id = probe(&server).await;
        server.fail_next_pairing(500);
        let request = WireRequest::new(Method::Post, format!("{}/{}", HOST, PAIR_ROUTE))
            .header(RELAY_HEADER, client_id.as_str())
            .body(b"[]".to_vec());
        assert_eq!(server.send(request.clone()).await.unwrap().status, 500);
        assert_eq!(server.send(request).await.unwrap().status, 200);
    }

    // ===========================================
    // Relay Tests
    // ===========================================

    #[tokio::test]
    async fn relayed_request_round_trip() {
        let server = MockRelayServer::new();
        let (client_id, pool) = paired(&server).await;
        let host = HostIdentity::parse(HOST).unwrap();

        let pair = pool.next().unwrap();
        let mut headers = Headers::new();
        headers.insert("authorization".into(), "Bearer t".into());
        let wire = encrypt_request(&pair, "api/echo", &headers, &["authorization".to_string()], b"ping")
            .await
            .unwrap()
            .into_wire(&host, &client_id, Method::Post, EncodeType::Mte);

        let response = server.send(wire).await.unwrap();
        let opened = decrypt_response(&pool, response).await.unwrap();
        let echo: serde_json::Value = opened.json().unwrap();
        assert_eq!(echo["route"], "api/echo");
        assert_eq!(echo["headers"]["authorization"], "Bearer t");
        assert_eq!(echo["body_len"], 4);
        assert_eq!(opened.header("content-type"), Some("application/json"));
        assert_eq!(opened.header("access-control-expose-headers"), Some("x-mock-server"));
    }

    #[tokio::test]
    async fn forgotten_pair_is_reported_with_reserved_status() {
        let server = MockRelayServer::new();
        let (client_id, pool) = paired(&server).await;
        server.forget_pairings();

        let host = HostIdentity::parse(HOST).unwrap();
        let pair = pool.next().unwrap();
        let wire = encrypt_request(&pair, "api/echo", &Headers::new(), &[], b"")
            .await
            .unwrap()
            .into_wire(&host, &client_id, Method::Get, EncodeType::Mte);

        let response = server.send(wire).await.unwrap();
        assert_eq!(response.status, UNKNOWN_PAIRING);
        assert!(response.header(RELAY_HEADER).is_none());
    }

    #[tokio::test]
    async fn undecodable_request_is_reported_with_decode_status() {
        let server = MockRelayServer::new();
        let (client_id, pool) = paired(&server).await;
        let host = HostIdentity::parse(HOST).unwrap();

        let pair = pool.next().unwrap();
        let mut wire = encrypt_request(&pair, "api/echo", &Headers::new(), &[], b"data")
            .await
            .unwrap()
            .into_wire(&host, &client_id, Method::Post, EncodeType::Mte);
        wire.body[0] ^= 0xff;

        assert_eq!(server.send(wire).await.unwrap().status, DECODE_FAILED);
    }

    #[tokio::test]
    async fn rejection_counts_down() {
        let server = MockRelayServer::new();
        let (client_id, pool) = paired(&server).await;
        let host = HostIdentity::parse(HOST).unwrap();
        server.reject_times("api/limited", 429, 1);

        let mut statuses = Vec::new();
        for _ in 0..2 {
            let pair = pool.next().unwrap();
            let wire = encrypt_request(&pair, "api/limited", &Headers::new(), &[], b"")
                .await
                .unwrap()
                .into_wire(&host, &client_id, Method::Get, EncodeType::Mte);
            statuses.push(server.send(wire).await.unwrap().status);
        }
        assert_eq!(statuses, vec![429, 200]);
    }
}
