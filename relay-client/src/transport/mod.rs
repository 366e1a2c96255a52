//! Transport abstraction for the relay client.
//!
//! This module provides a pluggable HTTP layer so the coordinator never
//! depends on a concrete client library.
//!
//! # Design
//!
//! The transport trait is request/response oriented:
//! - `send()` transmits a fully buffered request and buffers the response
//! - `send_stream()` takes the request body from a bounded channel
//! - `fetch_stream()` hands the response body back as a channel of chunks
//!
//! Implementations: [`HttpTransport`] (reqwest) and [`MockRelayServer`], an
//! in-process relay server for tests.

mod http;
mod mock;

pub use http::HttpTransport;
pub use mock::MockRelayServer;

use async_trait::async_trait;
use mte_relay_core::Headers;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,
}

/// HTTP method of a relayed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// HEAD
    Head,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
    /// OPTIONS
    Options,
}

impl Method {
    /// Upper-case method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request as it goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Headers, lowercase names.
    pub headers: Headers,
    /// Body bytes (ignored by `send_stream`).
    pub body: Vec<u8>,
}

impl WireRequest {
    /// A request with no headers and an empty body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Add a header.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Set the body.
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Header value by (case-insensitive) name.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// A fully buffered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    /// HTTP status.
    pub status: u16,
    /// Headers, lowercase names.
    pub headers: Headers,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl WireResponse {
    /// A response with no headers and an empty body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Header value by (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Response whose body arrives as a channel of chunks.
#[derive(Debug)]
pub struct StreamingResponse {
    /// HTTP status.
    pub status: u16,
    /// Headers, lowercase names.
    pub headers: Headers,
    /// Body chunks; closed at end of body.
    pub body: mpsc::Receiver<Result<Vec<u8>, TransportError>>,
}

impl StreamingResponse {
    /// Read the whole body into memory.
    pub async fn collect(mut self) -> Result<WireResponse, TransportError> {
        let mut body = Vec::new();
        while let Some(chunk) = self.body.recv().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(WireResponse {
            status: self.status,
            headers: self.headers,
            body,
        })
    }
}

/// Transport trait for relayed HTTP exchanges.
///
/// Implementations handle the underlying connection mechanism
/// (reqwest, in-process mock, etc).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a buffered request and buffer the response.
    async fn send(&self, request: WireRequest) -> Result<WireResponse, TransportError>;

    /// Send a request whose body is read from `body` until the channel closes.
    async fn send_stream(
        &self,
        request: WireRequest,
        body: mpsc::Receiver<Vec<u8>>,
    ) -> Result<WireResponse, TransportError>;

    /// Send a buffered request and stream the response body.
    async fn fetch_stream(&self, request: WireRequest) -> Result<StreamingResponse, TransportError>;
}
