//! reqwest-backed transport.

use super::{Method, StreamingResponse, Transport, TransportError, WireRequest, WireResponse};
use async_trait::async_trait;
use futures_util::StreamExt;
use mte_relay_core::Headers;
use tokio::sync::mpsc;

/// Chunks buffered between the response reader task and the consumer.
const RESPONSE_CHANNEL_DEPTH: usize = 4;

/// HTTP transport over a shared `reqwest::Client` (rustls).
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Transport with a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport over a caller-configured client (proxies, root certs, pools).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build(&self, request: &WireRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(to_reqwest(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }
}

fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Head => reqwest::Method::HEAD,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
        Method::Options => reqwest::Method::OPTIONS,
    }
}

fn map_send_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_builder() {
        TransportError::InvalidRequest(e.to_string())
    } else if e.is_connect() {
        TransportError::ConnectionFailed(e.to_string())
    } else {
        TransportError::SendFailed(e.to_string())
    }
}

fn collect_headers(response: &reqwest::Response) -> Headers {
    // Repeated headers are joined the way HTTP lists are.
    let mut headers = Headers::new();
    for (name, value) in response.headers() {
        let Ok(value) = value.to_str() else {
            continue;
        };
        headers
            .entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    headers
}

async fn buffer(response: reqwest::Response) -> Result<WireResponse, TransportError> {
    let status = response.status().as_u16();
    let headers = collect_headers(&response);
    let body = response
        .bytes()
        .await
        .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
    Ok(WireResponse {
        status,
        headers,
        body: body.to_vec(),
    })
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: WireRequest) -> Result<WireResponse, TransportError> {
        tracing::debug!("{} {}", request.method, request.url);
        let response = self
            .build(&request)
            .body(request.body)
            .send()
            .await
            .map_err(map_send_error)?;
        buffer(response).await
    }

    async fn send_stream(
        &self,
        request: WireRequest,
        body: mpsc::Receiver<Vec<u8>>,
    ) -> Result<WireResponse, TransportError> {
        tracing::debug!("{} {} (streamed body)", request.method, request.url);
        let stream = futures_util::stream::unfold(body, |mut rx| async move {
            rx.recv()
                .await
                .map(|chunk| (Ok::<_, std::io::Error>(chunk), rx))
        });
        let response = self
            .build(&request)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await
            .map_err(map_send_error)?;
        buffer(response).await
    }

    async fn fetch_stream(&self, request: WireRequest) -> Result<StreamingResponse, TransportError> {
        tracing::debug!("{} {} (streamed response)", request.method, request.url);
        let response = self
            .build(&request)
            .body(request.body)
            .send()
            .await
            .map_err(map_send_error)?;
        let status = response.status().as_u16();
        let headers = collect_headers(&response);

        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_DEPTH);
        tokio::spawn(async move {
            let mut chunks = response.bytes_stream();
            while let Some(chunk) = chunks.next().await {
                let item = chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| TransportError::ReceiveFailed(e.to_string()));
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(StreamingResponse {
            status,
            headers,
            body: rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_map_to_reqwest() {
        assert_eq!(to_reqwest(Method::Head), reqwest::Method::HEAD);
        assert_eq!(to_reqwest(Method::Patch), reqwest::Method::PATCH);
    }

    #[tokio::test]
    async fn unreachable_host_is_a_transport_error() {
        let transport = HttpTransport::new();
        // Port 9 on loopback (discard) is closed on test machines.
        let result = transport
            .send(WireRequest::new(Method::Get, "http://127.0.0.1:9/"))
            .await;
        assert!(result.is_err());
    }
}
