//! Cancellable connections to event-stream endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::Client;
use secrecy::ExposeSecret;
use thiserror::Error;
use tokio::sync::Notify;

use super::credentials::Credentials;

/// Header carrying the tenant identifier.
pub const ORGANIZATION_HEADER: &str = "X-Organization-ID";

/// Raw byte chunks as they arrive from the network.
pub type ChunkStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// Errors raised while opening or reading a stream. All of them are fatal
/// for the subscription that hit them; nothing here is retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Authentication rejected by stream endpoint (status {status})")]
    Unauthorized { status: u16 },

    #[error("Stream resource no longer exists")]
    NotFound,

    #[error("Stream endpoint returned status {status}")]
    Status { status: u16 },

    #[error("Failed to connect to stream endpoint: {0}")]
    Connect(String),

    #[error("Stream read failed: {0}")]
    Read(String),

    #[error("No credentials available for stream connection")]
    MissingCredentials,

    #[error("Stream closed before the run finished")]
    ClosedEarly,
}

impl TransportError {
    /// Maps a non-success HTTP status to its error kind.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => TransportError::Unauthorized { status },
            404 => TransportError::NotFound,
            status => TransportError::Status { status },
        }
    }

    /// True when the credentials should be invalidated upstream.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Unauthorized { .. } | TransportError::MissingCredentials
        )
    }

    /// Message suitable for a failed snapshot shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            TransportError::Unauthorized { .. } | TransportError::MissingCredentials => {
                "Authentication failed. Please sign in again.".to_string()
            }
            TransportError::NotFound => "The sync job no longer exists.".to_string(),
            other => format!("Lost connection to progress stream: {}", other),
        }
    }
}

/// HTTP method used to open the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Where and how to open a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub url: String,
    pub method: Method,
    pub body: Option<serde_json::Value>,
}

impl Endpoint {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            url: url.into(),
            method: Method::Post,
            body: Some(body),
        }
    }
}

/// Opens framed event streams.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Opens a connection. A non-success status is returned as an error
    /// before any chunk is produced.
    async fn open(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<ChunkStream, TransportError>;
}

/// Idempotent cancellation signal shared between a subscription and its
/// read loop.
#[derive(Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelState>,
}

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation. Returns true only for the call that flipped it.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// An open stream paired with its cancellation handle.
///
/// Dropping the source drops the connection; cancelling makes the next
/// [`next_chunk`](Self::next_chunk) return `None` without waiting on the
/// network.
pub struct FrameSource {
    chunks: ChunkStream,
    cancel: CancelHandle,
}

impl FrameSource {
    pub fn new(chunks: ChunkStream, cancel: CancelHandle) -> Self {
        Self { chunks, cancel }
    }

    pub async fn next_chunk(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            chunk = self.chunks.next() => chunk,
        }
    }

    pub fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel
    }
}

/// reqwest-backed transport for `text/event-stream` endpoints.
#[derive(Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn open(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<ChunkStream, TransportError> {
        let mut request = match endpoint.method {
            Method::Get => self.client.get(&endpoint.url),
            Method::Post => self.client.post(&endpoint.url),
        }
        .header(ACCEPT, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .bearer_auth(credentials.token.expose_secret());

        if let Some(org) = &credentials.organization_id {
            request = request.header(ORGANIZATION_HEADER, org);
        }
        if let Some(body) = &endpoint.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::from_status(status.as_u16()));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| TransportError::Read(e.to_string()))
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::time::Duration;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            TransportError::from_status(401),
            TransportError::Unauthorized { status: 401 }
        );
        assert!(TransportError::from_status(403).is_auth_failure());
        assert_eq!(TransportError::from_status(404), TransportError::NotFound);
        assert_eq!(
            TransportError::from_status(502),
            TransportError::Status { status: 502 }
        );
        assert!(!TransportError::from_status(500).is_auth_failure());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let handle = CancelHandle::new();
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_wakes_pending_reader() {
        let cancel = CancelHandle::new();
        let mut source = FrameSource::new(stream::pending().boxed(), cancel.clone());

        let reader = tokio::spawn(async move { source.next_chunk().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader did not observe cancellation")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_source_yields_chunks_until_exhausted() {
        let chunks = stream::iter(vec![Ok(b"a".to_vec()), Ok(b"b".to_vec())]).boxed();
        let mut source = FrameSource::new(chunks, CancelHandle::new());

        assert_eq!(source.next_chunk().await, Some(Ok(b"a".to_vec())));
        assert_eq!(source.next_chunk().await, Some(Ok(b"b".to_vec())));
        assert_eq!(source.next_chunk().await, None);
    }
}
