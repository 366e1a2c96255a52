//! Request encryption and response decryption.
//!
//! A request consumes the pair's encoder in a fixed order: route, header
//! blob, body. A response is opened with the pair named in its own
//! `x-mte-relay` header, looked up in the pool current at the time the
//! response arrives, never with the pair the request went out on.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use mte_relay_core::{merge_headers, split_protected, strip_relay_headers, Headers};
use mte_relay_types::{
    ClientId, EncodeType, HostIdentity, PairId, RelayHeader, TypesError,
    ENCRYPTED_HEADERS_HEADER, RELAY_HEADER,
};
use serde::de::DeserializeOwned;

use crate::error::RelayError;
use crate::pair::{DecryptStream, EncryptStream, PairError, SessionPair};
use crate::pool::PairPool;
use crate::transport::{Method, WireRequest, WireResponse};

/// A plaintext request as the application sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    /// HTTP method.
    pub method: Method,
    /// Route relative to the host, e.g. `api/login`.
    pub route: String,
    /// Headers, lowercase names.
    pub headers: Headers,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl RelayRequest {
    /// A request with no headers and an empty body.
    pub fn new(method: Method, route: impl Into<String>) -> Self {
        Self {
            method,
            route: route.into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// GET `route`.
    pub fn get(route: impl Into<String>) -> Self {
        Self::new(Method::Get, route)
    }

    /// POST `body` to `route`.
    pub fn post(route: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new(Method::Post, route).body(body)
    }

    /// Add a header.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// A decrypted response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResponse {
    /// HTTP status.
    pub status: u16,
    /// Plain headers merged with the decrypted ones; relay headers removed.
    pub headers: Headers,
    /// Decrypted body.
    pub body: Vec<u8>,
    /// Pair that decrypted the response; `None` for plaintext passthrough.
    pub pair_id: Option<PairId>,
}

impl RelayResponse {
    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Header value by (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Parse the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Output of [`encrypt_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedRequest {
    /// Pair whose encoder produced every field.
    pub pair_id: PairId,
    /// Encoded route, base64 then form-url encoded; one path segment.
    pub route: String,
    /// Base64 of the encoded JSON object of protected headers.
    pub header_blob: String,
    /// Encoded body; empty when the body is streamed separately.
    pub body: Vec<u8>,
    /// Headers sent in the clear.
    pub plain_headers: Headers,
}

impl EncryptedRequest {
    /// Assemble the wire request for `host`.
    pub fn into_wire(
        self,
        host: &HostIdentity,
        client_id: &ClientId,
        method: Method,
        encode_type: EncodeType,
    ) -> WireRequest {
        let relay = RelayHeader::relayed(client_id.clone(), self.pair_id, encode_type);
        let mut headers = self.plain_headers;
        headers.insert(RELAY_HEADER.to_string(), relay.to_string());
        headers.insert(ENCRYPTED_HEADERS_HEADER.to_string(), self.header_blob);
        WireRequest {
            method,
            url: host.join(&self.route),
            headers,
            body: self.body,
        }
    }
}

/// Encode a route ciphertext as one URL path segment.
pub fn encode_route(ciphertext: &[u8]) -> String {
    let b64 = STANDARD.encode(ciphertext);
    url::form_urlencoded::byte_serialize(b64.as_bytes()).collect()
}

/// Inverse of [`encode_route`].
pub fn decode_route(segment: &str) -> Result<Vec<u8>, TypesError> {
    let b64: String = url::form_urlencoded::parse(segment.as_bytes())
        .next()
        .map(|(key, _)| key.into_owned())
        .unwrap_or_default();
    Ok(STANDARD.decode(b64)?)
}

fn prepare(route: &str, headers: &Headers, allow_list: &[String]) -> (String, Vec<u8>, Headers) {
    let route = route.trim_start_matches('/').to_string();
    let (protected, plain) = split_protected(headers, allow_list);
    let header_json = serde_json::to_vec(&protected).unwrap_or_else(|_| b"{}".to_vec());
    (route, header_json, plain)
}

/// Encrypt a whole request on `pair`: route, header blob, then body, in one
/// lock hold.
pub async fn encrypt_request(
    pair: &SessionPair,
    route: &str,
    headers: &Headers,
    allow_list: &[String],
    body: &[u8],
) -> Result<EncryptedRequest, PairError> {
    let (route, header_json, plain_headers) = prepare(route, headers, allow_list);
    let mut encoded = pair
        .encode_all(&[route.as_bytes(), header_json.as_slice(), body])
        .await?
        .into_iter();
    let route_ct = encoded.next().unwrap_or_default();
    let header_ct = encoded.next().unwrap_or_default();
    let body_ct = encoded.next().unwrap_or_default();

    Ok(EncryptedRequest {
        pair_id: pair.id().clone(),
        route: encode_route(&route_ct),
        header_blob: STANDARD.encode(header_ct),
        body: body_ct,
        plain_headers,
    })
}

/// Encrypt route and header blob, then open an encryption stream for the
/// body on the same lock hold.
pub async fn encrypt_streaming_request(
    pair: &Arc<SessionPair>,
    route: &str,
    headers: &Headers,
    allow_list: &[String],
) -> Result<(EncryptedRequest, EncryptStream), PairError> {
    let (route, header_json, plain_headers) = prepare(route, headers, allow_list);
    let (encoded, stream) = pair
        .start_encrypt_after(&[route.as_bytes(), header_json.as_slice()])
        .await?;
    let mut encoded = encoded.into_iter();
    let route_ct = encoded.next().unwrap_or_default();
    let header_ct = encoded.next().unwrap_or_default();

    let request = EncryptedRequest {
        pair_id: pair.id().clone(),
        route: encode_route(&route_ct),
        header_blob: STANDARD.encode(header_ct),
        body: Vec::new(),
        plain_headers,
    };
    Ok((request, stream))
}

/// Status and headers of a response, matched against the current pool.
#[derive(Debug)]
pub struct ResponseHead {
    /// HTTP status.
    pub status: u16,
    /// Plain headers with the relay headers removed.
    pub headers: Headers,
    /// Pair named by the response; `None` for plaintext passthrough.
    pub pair: Option<Arc<SessionPair>>,
    /// Codec mode of the body.
    pub encode_type: EncodeType,
    /// Encoded JSON object of protected headers, if sent.
    pub header_ciphertext: Option<Vec<u8>>,
    /// True if the body must be decrypted.
    pub body_encoded: bool,
}

impl ResponseHead {
    /// True if the body arrives as an encryption stream.
    pub fn is_stream(&self) -> bool {
        self.pair.is_some() && self.body_encoded && self.encode_type == EncodeType::Mke
    }
}

fn violation(reason: impl Into<String>) -> RelayError {
    RelayError::RelayProtocolViolation(reason.into())
}

/// Match a response to a pair in `pool` by its own `x-mte-relay` header.
///
/// A non-2xx status without a relay header is passed through in plaintext;
/// a 2xx status without one is a protocol violation.
pub fn parse_head(
    pool: &PairPool,
    status: u16,
    mut headers: Headers,
) -> Result<ResponseHead, RelayError> {
    let Some(raw) = headers.get(RELAY_HEADER).cloned() else {
        if (200..300).contains(&status) {
            return Err(violation("response carries no x-mte-relay header"));
        }
        strip_relay_headers(&mut headers);
        return Ok(ResponseHead {
            status,
            headers,
            pair: None,
            encode_type: EncodeType::Mte,
            header_ciphertext: None,
            body_encoded: false,
        });
    };

    let relay = RelayHeader::parse(&raw).map_err(|e| violation(e.to_string()))?;
    let pair_id = relay
        .pair_id
        .ok_or_else(|| violation("response header names no pair"))?;
    let pair = pool
        .get(&pair_id)
        .ok_or_else(|| violation(format!("pair {} is not in the current pool", pair_id)))?;

    let header_ciphertext = if relay.headers_encoded {
        let blob = headers
            .get(ENCRYPTED_HEADERS_HEADER)
            .ok_or_else(|| violation("x-mte-relay-eh missing"))?;
        let ciphertext = STANDARD
            .decode(blob)
            .map_err(|e| violation(format!("x-mte-relay-eh: {}", e)))?;
        Some(ciphertext)
    } else {
        None
    };
    strip_relay_headers(&mut headers);

    Ok(ResponseHead {
        status,
        headers,
        pair: Some(pair),
        encode_type: relay.encode_type,
        header_ciphertext,
        body_encoded: relay.body_encoded,
    })
}

fn merge_decrypted(headers: &mut Headers, json: &[u8]) -> Result<(), RelayError> {
    let decrypted: Headers = serde_json::from_slice(json)
        .map_err(|e| violation(format!("encrypted headers: {}", e)))?;
    merge_headers(headers, decrypted);
    Ok(())
}

/// Decrypt the protected headers and open a decryption stream for the body
/// on the same lock hold.
pub async fn open_stream(head: &mut ResponseHead) -> Result<DecryptStream, RelayError> {
    let pair = head
        .pair
        .clone()
        .ok_or_else(|| violation("plaintext response has no stream"))?;
    let prefix: Vec<&[u8]> = head.header_ciphertext.iter().map(Vec::as_slice).collect();
    let (decoded, stream) = pair.start_decrypt_after(&prefix).await?;
    if let Some(json) = decoded.first() {
        merge_decrypted(&mut head.headers, json)?;
    }
    Ok(stream)
}

/// Decrypt headers and a fully buffered body.
pub async fn open_buffered(
    mut head: ResponseHead,
    body: Vec<u8>,
) -> Result<RelayResponse, RelayError> {
    let Some(pair) = head.pair.clone() else {
        return Ok(RelayResponse {
            status: head.status,
            headers: head.headers,
            body,
            pair_id: None,
        });
    };

    let body = if head.is_stream() {
        let mut stream = open_stream(&mut head).await?;
        let mut plain = stream.decrypt_chunk(&body)?;
        plain.extend(stream.finish_decrypt()?);
        plain
    } else {
        let mut messages: Vec<&[u8]> = head.header_ciphertext.iter().map(Vec::as_slice).collect();
        if head.body_encoded {
            messages.push(body.as_slice());
        }
        let mut plain = pair.decode_all(&messages).await?.into_iter();
        if head.header_ciphertext.is_some() {
            merge_decrypted(&mut head.headers, &plain.next().unwrap_or_default())?;
        }
        if head.body_encoded {
            plain.next().unwrap_or_default()
        } else {
            body
        }
    };

    Ok(RelayResponse {
        status: head.status,
        headers: head.headers,
        body,
        pair_id: Some(pair.id().clone()),
    })
}

/// Decrypt a buffered response using the pool current at arrival.
pub async fn decrypt_response(
    pool: &PairPool,
    response: WireResponse,
) -> Result<RelayResponse, RelayError> {
    let head = parse_head(pool, response.status, response.headers)?;
    open_buffered(head, response.body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pair::test_support::linked_pairs;

    fn pool_with(client: Arc<SessionPair>) -> PairPool {
        let pair = Arc::try_unwrap(client).expect("sole owner");
        PairPool::from_pairs(1, vec![pair])
    }

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn server_response(
        server: &SessionPair,
        status: u16,
        protected: &Headers,
        body: &[u8],
    ) -> WireResponse {
        let header_ct = server
            .encode(&serde_json::to_vec(protected).unwrap())
            .await
            .unwrap();
        let body_ct = server.encode(body).await.unwrap();
        let mut relay = RelayHeader::relayed(ClientId::new("c1"), server.id().clone(), EncodeType::Mte);
        relay.url_encoded = false;

        let mut response = WireResponse::new(status);
        response.headers = headers(&[
            ("x-mock", "1"),
            (
                "access-control-expose-headers",
                "x-mte-relay, x-mte-relay-eh, x-mock",
            ),
        ]);
        response
            .headers
            .insert(RELAY_HEADER.into(), relay.to_string());
        response
            .headers
            .insert(ENCRYPTED_HEADERS_HEADER.into(), STANDARD.encode(header_ct));
        response.body = body_ct;
        response
    }

    // ===========================================
    // Request Tests
    // ===========================================

    #[tokio::test]
    async fn request_fields_decode_in_order_on_the_server() {
        let (client, server) = linked_pairs();
        let input = headers(&[
            ("content-type", "application/json"),
            ("authorization", "Bearer t"),
            ("accept", "*/*"),
        ]);
        let encrypted = encrypt_request(
            &client,
            "/api/login",
            &input,
            &["Authorization".to_string()],
            b"{\"user\":\"a\"}",
        )
        .await
        .unwrap();

        assert_eq!(encrypted.plain_headers, headers(&[("accept", "*/*")]));

        let route = server
            .decode(&decode_route(&encrypted.route).unwrap())
            .await
            .unwrap();
        assert_eq!(route, b"api/login");
        let blob = server
            .decode(&STANDARD.decode(&encrypted.header_blob).unwrap())
            .await
            .unwrap();
        let protected: Headers = serde_json::from_slice(&blob).unwrap();
        assert_eq!(
            protected,
            headers(&[
                ("authorization", "Bearer t"),
                ("content-type", "application/json")
            ])
        );
        assert_eq!(
            server.decode(&encrypted.body).await.unwrap(),
            b"{\"user\":\"a\"}"
        );
    }

    #[tokio::test]
    async fn wire_request_carries_relay_headers() {
        let (client, _) = linked_pairs();
        let host = HostIdentity::parse("https://relay.example.com").unwrap();
        let encrypted = encrypt_request(&client, "echo", &Headers::new(), &[], b"")
            .await
            .unwrap();
        let route = encrypted.route.clone();
        let wire = encrypted.into_wire(&host, &ClientId::new("c1"), Method::Post, EncodeType::Mte);

        assert_eq!(wire.url, format!("https://relay.example.com/{}", route));
        assert_eq!(
            wire.headers.get(RELAY_HEADER).unwrap(),
            &format!("c1,{},0,1,1,1", client.id())
        );
        assert!(wire.headers.contains_key(ENCRYPTED_HEADERS_HEADER));
    }

    #[tokio::test]
    async fn streaming_request_body_follows_route_and_headers() {
        let (client, server) = linked_pairs();
        let (encrypted, mut stream) =
            encrypt_streaming_request(&client, "upload", &Headers::new(), &[])
                .await
                .unwrap();
        assert!(encrypted.body.is_empty());
        let mut body = b"chunked".to_vec();
        stream.encrypt_chunk(&mut body).unwrap();
        body.extend(stream.finish_encrypt().unwrap());

        let route = server
            .decode(&decode_route(&encrypted.route).unwrap())
            .await
            .unwrap();
        assert_eq!(route, b"upload");
        let blob = server
            .decode(&STANDARD.decode(&encrypted.header_blob).unwrap())
            .await
            .unwrap();
        assert_eq!(blob, b"{}");

        let mut decrypt = server.start_decrypt().await.unwrap();
        let mut plain = decrypt.decrypt_chunk(&body).unwrap();
        plain.extend(decrypt.finish_decrypt().unwrap());
        assert_eq!(plain, b"chunked");
    }

    #[test]
    fn encoded_route_is_a_single_safe_segment() {
        // 0xfb 0xff produce '+' and '/' in standard base64.
        let ciphertext = [0xfbu8, 0xff, 0xfe, 0x3e, 0x3f];
        let segment = encode_route(&ciphertext);
        assert!(!segment.contains('/'));
        assert!(!segment.contains('+'));
        assert!(!segment.contains('='));
        assert_eq!(decode_route(&segment).unwrap(), ciphertext);
    }

    // ===========================================
    // Response Tests
    // ===========================================

    #[tokio::test]
    async fn response_is_decrypted_and_cleaned() {
        let (client, server) = linked_pairs();
        let pool = pool_with(client);
        let response = server_response(
            &server,
            200,
            &headers(&[("content-type", "text/plain")]),
            b"hello",
        )
        .await;

        let opened = decrypt_response(&pool, response).await.unwrap();
        assert_eq!(opened.body, b"hello");
        assert_eq!(opened.header("content-type"), Some("text/plain"));
        assert_eq!(opened.header("x-mock"), Some("1"));
        assert_eq!(opened.header("access-control-expose-headers"), Some("x-mock"));
        assert!(opened.header(RELAY_HEADER).is_none());
        assert!(opened.header(ENCRYPTED_HEADERS_HEADER).is_none());
        assert_eq!(opened.pair_id.as_ref(), Some(server.id()));
    }

    #[tokio::test]
    async fn unknown_pair_is_a_protocol_violation() {
        let (_, server) = linked_pairs();
        let (other_client, _) = linked_pairs();
        let pool = pool_with(other_client);
        let response = server_response(&server, 200, &Headers::new(), b"stale").await;

        let err = decrypt_response(&pool, response).await.unwrap_err();
        assert!(matches!(err, RelayError::RelayProtocolViolation(_)));
    }

    #[tokio::test]
    async fn success_without_relay_header_is_a_violation() {
        let (client, _) = linked_pairs();
        let pool = pool_with(client);
        let err = decrypt_response(&pool, WireResponse::new(200))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::RelayProtocolViolation(_)));
    }

    #[tokio::test]
    async fn error_without_relay_header_passes_through() {
        let (client, _) = linked_pairs();
        let pool = pool_with(client);
        let mut response = WireResponse::new(404);
        response.body = b"not found".to_vec();

        let opened = decrypt_response(&pool, response).await.unwrap();
        assert_eq!(opened.status, 404);
        assert_eq!(opened.body, b"not found");
        assert!(opened.pair_id.is_none());
    }

    #[tokio::test]
    async fn malformed_relay_header_is_a_violation() {
        let (client, _) = linked_pairs();
        let pool = pool_with(client);
        let mut response = WireResponse::new(200);
        response
            .headers
            .insert(RELAY_HEADER.into(), "a,b,c".into());
        assert!(matches!(
            decrypt_response(&pool, response).await,
            Err(RelayError::RelayProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn corrupt_body_is_a_crypto_failure() {
        let (client, server) = linked_pairs();
        let pool = pool_with(client);
        let mut response = server_response(&server, 200, &Headers::new(), b"hello").await;
        response.body[0] ^= 0xff;

        let err = decrypt_response(&pool, response).await.unwrap_err();
        assert_eq!(err.burned_pair(), Some(server.id()));
    }

    #[tokio::test]
    async fn stream_mode_response_is_decrypted() {
        let (client, server) = linked_pairs();
        let pool = pool_with(client);

        let header_ct = server.encode(b"{}").await.unwrap();
        let mut stream = server.start_encrypt().await.unwrap();
        let mut body = b"streamed reply".to_vec();
        stream.encrypt_chunk(&mut body).unwrap();
        body.extend(stream.finish_encrypt().unwrap());

        let relay = RelayHeader::relayed(ClientId::new("c1"), server.id().clone(), EncodeType::Mke);
        let mut response = WireResponse::new(200);
        response.headers.insert(RELAY_HEADER.into(), relay.to_string());
        response
            .headers
            .insert(ENCRYPTED_HEADERS_HEADER.into(), STANDARD.encode(header_ct));
        response.body = body;

        let opened = decrypt_response(&pool, response).await.unwrap();
        assert_eq!(opened.body, b"streamed reply");
    }
}
