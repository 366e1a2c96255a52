//! Chunked streaming encrypt/decrypt pipeline.
//!
//! Upload: a producer task reads the source in `chunk_size` pieces into a
//! bounded channel; the consumer encrypts each piece and forwards it to the
//! transport's body channel, then appends the trailer. The final piece is
//! always sent, even when empty, so a payload of `K * chunk_size + r` makes
//! exactly `K + 1` chunk calls.
//!
//! Download: a task re-chunks the transport body to `chunk_size` into a
//! bounded channel; the consumer decrypts each chunk into the sink, appends
//! the output of `finish_decrypt`, then flushes and shuts the sink down.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::pair::{DecryptStream, EncryptStream};
use crate::transport::TransportError;

/// Chunk size and channel depth for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Bytes per chunk.
    pub chunk_size: usize,
    /// Bounded channel depth.
    pub channel_depth: usize,
}

impl StreamSettings {
    /// Upload settings from `config`.
    pub fn upload(config: &RelayConfig) -> Self {
        Self {
            chunk_size: config.upload_chunk_size.max(1),
            channel_depth: config.channel_depth(),
        }
    }

    /// Download settings from `config`.
    pub fn download(config: &RelayConfig) -> Self {
        Self {
            chunk_size: config.download_chunk_size.max(1),
            channel_depth: config.channel_depth(),
        }
    }
}

/// An opened upload source.
pub struct OpenedSource {
    /// Plaintext reader.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Plaintext length in bytes.
    pub len: u64,
}

impl std::fmt::Debug for OpenedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedSource")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// A body that can be read more than once.
///
/// A reserved status re-pairs and retries the upload, so the source is
/// opened again from the start for every attempt.
#[async_trait]
pub trait UploadSource: Send + Sync {
    /// Open a fresh reader positioned at the start.
    async fn open(&self) -> std::io::Result<OpenedSource>;
}

/// In-memory upload body.
#[derive(Debug, Clone)]
pub struct BytesSource {
    data: Arc<[u8]>,
}

impl BytesSource {
    /// Wrap `data`.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Arc::from(data.into()),
        }
    }
}

#[async_trait]
impl UploadSource for BytesSource {
    async fn open(&self) -> std::io::Result<OpenedSource> {
        Ok(OpenedSource {
            reader: Box::new(std::io::Cursor::new(Arc::clone(&self.data))),
            len: self.data.len() as u64,
        })
    }
}

/// Upload body read from a file.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// Read from `path` on every attempt.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl UploadSource for FileSource {
    async fn open(&self) -> std::io::Result<OpenedSource> {
        let file = tokio::fs::File::open(&self.path).await?;
        let len = file.metadata().await?.len();
        Ok(OpenedSource {
            reader: Box::new(file),
            len,
        })
    }
}

/// Counts from one upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    /// `encrypt_chunk` calls made.
    pub chunks: usize,
    /// Plaintext bytes read from the source.
    pub plaintext_bytes: u64,
    /// Trailer bytes appended after the last chunk.
    pub trailer_bytes: usize,
}

impl UploadSummary {
    /// Bytes put on the wire.
    pub fn content_length(&self) -> u64 {
        self.plaintext_bytes + self.trailer_bytes as u64
    }
}

/// Counts from one download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    /// `decrypt_chunk` calls made.
    pub chunks: usize,
    /// Ciphertext bytes received, trailer included.
    pub ciphertext_bytes: u64,
    /// Plaintext bytes written to the sink.
    pub plaintext_bytes: u64,
}

/// Wire length of an upload: plaintext plus trailer.
pub fn upload_content_length(plaintext_len: u64, trailer_bytes: usize) -> u64 {
    plaintext_len + trailer_bytes as u64
}

fn body_closed() -> RelayError {
    RelayError::Transport(TransportError::SendFailed("request body closed".into()))
}

/// Encrypt `source` into `sink`, then send the trailer.
///
/// On any error the stream is dropped unfinished, which burns the pair.
pub async fn encrypt_upload<R>(
    mut stream: EncryptStream,
    source: R,
    sink: mpsc::Sender<Vec<u8>>,
    settings: StreamSettings,
) -> Result<UploadSummary, RelayError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(settings.channel_depth.max(1));
    let producer = tokio::spawn(read_chunks(source, settings.chunk_size, tx));

    let mut summary = UploadSummary::default();
    while let Some(chunk) = rx.recv().await {
        let mut chunk = chunk?;
        summary.chunks += 1;
        summary.plaintext_bytes += chunk.len() as u64;
        stream.encrypt_chunk(&mut chunk)?;
        sink.send(chunk).await.map_err(|_| body_closed())?;
    }
    if let Err(e) = producer.await {
        return Err(RelayError::Io(std::io::Error::other(e.to_string())));
    }

    let pair_id = stream.pair_id().clone();
    let trailer = stream.finish_encrypt()?;
    summary.trailer_bytes = trailer.len();
    sink.send(trailer).await.map_err(|_| body_closed())?;

    tracing::debug!(
        "Encrypted upload on pair {}: {} chunks, {} bytes",
        pair_id,
        summary.chunks,
        summary.plaintext_bytes
    );
    Ok(summary)
}

async fn read_chunks<R>(
    mut source: R,
    chunk_size: usize,
    tx: mpsc::Sender<std::io::Result<Vec<u8>>>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let mut buf = vec![0u8; chunk_size];
        let mut filled = 0;
        while filled < chunk_size {
            match source.read(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
        buf.truncate(filled);
        let last = filled < chunk_size;
        if tx.send(Ok(buf)).await.is_err() || last {
            return;
        }
    }
}

/// Decrypt a streamed body into `sink`.
///
/// Chunks are written as they decrypt; the trailer is checked only by
/// `finish_decrypt`. On `Err` whatever reached the sink is unauthenticated.
/// On any error the stream is dropped unfinished, which burns the pair.
pub async fn decrypt_download<W>(
    mut stream: DecryptStream,
    body: mpsc::Receiver<Result<Vec<u8>, TransportError>>,
    sink: &mut W,
    settings: StreamSettings,
) -> Result<DownloadSummary, RelayError>
where
    W: AsyncWrite + Unpin + Send,
{
    let (tx, mut rx) = mpsc::channel(settings.channel_depth.max(1));
    let rechunker = tokio::spawn(rechunk(body, settings.chunk_size, tx));

    let mut summary = DownloadSummary::default();
    while let Some(chunk) = rx.recv().await {
        let chunk = chunk?;
        summary.chunks += 1;
        summary.ciphertext_bytes += chunk.len() as u64;
        let plain = stream.decrypt_chunk(&chunk)?;
        sink.write_all(&plain).await?;
        summary.plaintext_bytes += plain.len() as u64;
    }
    if let Err(e) = rechunker.await {
        return Err(RelayError::Io(std::io::Error::other(e.to_string())));
    }

    let pair_id = stream.pair_id().clone();
    let tail = stream.finish_decrypt()?;
    sink.write_all(&tail).await?;
    summary.plaintext_bytes += tail.len() as u64;
    sink.flush().await?;
    sink.shutdown().await?;

    tracing::debug!(
        "Decrypted download on pair {}: {} chunks, {} bytes",
        pair_id,
        summary.chunks,
        summary.plaintext_bytes
    );
    Ok(summary)
}

async fn rechunk(
    mut body: mpsc::Receiver<Result<Vec<u8>, TransportError>>,
    chunk_size: usize,
    tx: mpsc::Sender<Result<Vec<u8>, TransportError>>,
) {
    let mut pending = Vec::with_capacity(chunk_size);
    while let Some(piece) = body.recv().await {
        match piece {
            Ok(bytes) => {
                pending.extend_from_slice(&bytes);
                while pending.len() >= chunk_size {
                    let rest = pending.split_off(chunk_size);
                    let full = std::mem::replace(&mut pending, rest);
                    if tx.send(Ok(full)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(Ok(pending)).await;
    }
}
