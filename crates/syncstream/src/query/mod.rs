//! Streamed query answers.
//!
//! A [`QueryStreamer`] owns at most one in-flight request. Submitting a new
//! query cancels the previous one and bumps the sequence number; frames
//! tagged with an older sequence are dropped on arrival.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::broadcast::AnswerBroadcaster;
use crate::config::StreamConfig;
use crate::progress::AnswerSnapshot;
use crate::stream::{
    CancelHandle, CredentialProvider, Endpoint, FrameParser, FrameSource, QueryEvent,
    StreamTransport, TransportError,
};

/// One query against a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub collection: String,
    pub query: String,
    /// Extra request fields passed through verbatim, e.g. `limit`.
    pub options: Map<String, Value>,
}

impl QueryRequest {
    pub fn new(collection: &str, query: &str) -> Self {
        Self {
            collection: collection.to_string(),
            query: query.to_string(),
            options: Map::new(),
        }
    }

    pub fn with_option(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.options.insert(name.to_string(), value.into());
        self
    }

    /// JSON body sent to the stream endpoint.
    pub fn body(&self) -> Value {
        let mut body = self.options.clone();
        body.insert("query".to_string(), Value::String(self.query.clone()));
        Value::Object(body)
    }
}

/// Runs streamed queries for one caller.
#[derive(Clone)]
pub struct QueryStreamer {
    inner: Arc<QueryInner>,
}

struct QueryInner {
    config: StreamConfig,
    transport: Arc<dyn StreamTransport>,
    credentials: Arc<dyn CredentialProvider>,
    sequence: AtomicU64,
    /// Answer for the latest sequence. Writes happen under this lock so a
    /// sequence bump and its fresh snapshot are observed together.
    answer: RwLock<Option<AnswerSnapshot>>,
    in_flight: Mutex<Option<(u64, CancelHandle)>>,
    updates: AnswerBroadcaster,
}

impl QueryStreamer {
    pub fn new(
        config: StreamConfig,
        transport: Arc<dyn StreamTransport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let updates = AnswerBroadcaster::new(config.channel_capacity.max(1));
        Self {
            inner: Arc::new(QueryInner {
                config,
                transport,
                credentials,
                sequence: AtomicU64::new(0),
                answer: RwLock::new(None),
                in_flight: Mutex::new(None),
                updates,
            }),
        }
    }

    /// Starts `request`, cancelling whatever was in flight. Returns the
    /// sequence number its frames are tagged with. Must be called from
    /// within a tokio runtime.
    pub fn submit(&self, request: QueryRequest) -> u64 {
        let inner = &self.inner;
        let cancel = CancelHandle::new();

        let sequence = {
            let mut answer = write_answer(&inner.answer);
            let sequence = inner.sequence.fetch_add(1, Ordering::AcqRel) + 1;
            let fresh = AnswerSnapshot::new(sequence, Utc::now());
            *answer = Some(fresh.clone());
            inner.updates.send(fresh);

            // Swapped under the answer lock so the handle always matches the
            // latest sequence.
            let previous = lock_in_flight(&inner.in_flight).replace((sequence, cancel.clone()));
            if let Some((superseded, handle)) = previous {
                if handle.cancel() {
                    debug!(sequence, superseded, "superseded in-flight query");
                }
            }
            sequence
        };

        debug!(sequence, collection = %request.collection, "query submitted");
        let runner = Arc::clone(inner);
        tokio::spawn(async move { runner.run(sequence, request, cancel).await });
        sequence
    }

    /// Cancels the in-flight query, if any. The last snapshot stays readable.
    pub fn cancel(&self) -> bool {
        match lock_in_flight(&self.inner.in_flight).take() {
            Some((_, handle)) => handle.cancel(),
            None => false,
        }
    }

    /// Applies `event` if `sequence` is still the latest one.
    ///
    /// Returns false when the event was discarded as stale or arrived after
    /// the answer finished.
    pub fn ingest(&self, sequence: u64, event: &QueryEvent) -> bool {
        self.inner.ingest(sequence, event)
    }

    /// Answer for the latest submitted query.
    pub fn snapshot(&self) -> Option<AnswerSnapshot> {
        match self.inner.answer.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Sequence number of the latest submitted query, 0 before the first.
    pub fn current_sequence(&self) -> u64 {
        self.inner.sequence.load(Ordering::Acquire)
    }

    pub fn updates(&self) -> broadcast::Receiver<AnswerSnapshot> {
        self.inner.updates.subscribe()
    }
}

impl QueryInner {
    async fn run(self: Arc<Self>, sequence: u64, request: QueryRequest, cancel: CancelHandle) {
        let Some(credentials) = self.credentials.credentials() else {
            self.fail(sequence, &cancel, TransportError::MissingCredentials);
            return;
        };

        let endpoint = Endpoint::post_json(
            self.config.query_stream_url(&request.collection),
            request.body(),
        );
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            opened = self.transport.open(&endpoint, &credentials) => opened,
        };
        drop(credentials);

        let chunks = match opened {
            Ok(chunks) => chunks,
            Err(e) => {
                self.fail(sequence, &cancel, e);
                return;
            }
        };

        let mut source = FrameSource::new(chunks, cancel.clone());
        let mut parser = FrameParser::<QueryEvent>::new();

        while let Some(chunk) = source.next_chunk().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.fail(sequence, &cancel, e);
                    return;
                }
            };
            for event in parser.push(&bytes) {
                if cancel.is_cancelled() {
                    return;
                }
                self.ingest(sequence, &event);
                if self.is_finished(sequence) {
                    return;
                }
            }
        }

        if cancel.is_cancelled() {
            return;
        }
        if let Some(event) = parser.finish() {
            self.ingest(sequence, &event);
        }
        if !self.is_finished(sequence) {
            self.fail(sequence, &cancel, TransportError::ClosedEarly);
        }
    }

    fn ingest(&self, sequence: u64, event: &QueryEvent) -> bool {
        let mut answer = write_answer(&self.answer);
        let Some(current) = answer.as_ref() else {
            return false;
        };
        if current.sequence != sequence {
            debug!(sequence, current = current.sequence, "discarding stale query frame");
            return false;
        }
        if current.is_terminal() {
            return false;
        }

        let next = current.apply(event, Utc::now());
        *answer = Some(next.clone());
        self.updates.send(next);
        true
    }

    /// True when `sequence` is no longer current or its answer is terminal.
    fn is_finished(&self, sequence: u64) -> bool {
        match self.answer.read() {
            Ok(guard) => guard
                .as_ref()
                .map_or(true, |a| a.sequence != sequence || a.is_terminal()),
            Err(_) => true,
        }
    }

    fn fail(&self, sequence: u64, cancel: &CancelHandle, err: TransportError) {
        if cancel.is_cancelled() {
            return;
        }
        warn!(sequence, error = %err, "query stream failed");
        if err.is_auth_failure() {
            self.credentials.invalidate();
        }

        let message = if err.is_auth_failure() {
            err.user_message()
        } else {
            format!("Search failed: {}", err)
        };

        let mut answer = write_answer(&self.answer);
        if let Some(current) = answer.as_ref().filter(|a| a.sequence == sequence) {
            let next = current.failed(&message, Utc::now());
            *answer = Some(next.clone());
            self.updates.send(next);
        }
    }
}

fn write_answer(
    lock: &RwLock<Option<AnswerSnapshot>>,
) -> std::sync::RwLockWriteGuard<'_, Option<AnswerSnapshot>> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("answer lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn lock_in_flight(
    lock: &Mutex<Option<(u64, CancelHandle)>>,
) -> std::sync::MutexGuard<'_, Option<(u64, CancelHandle)>> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::AnswerStatus;
    use crate::stream::{ChunkStream, Credentials, StaticCredentials};
    use async_trait::async_trait;
    use futures_util::{stream, StreamExt};
    use serde_json::json;

    struct PendingTransport;

    #[async_trait]
    impl StreamTransport for PendingTransport {
        async fn open(
            &self,
            _endpoint: &Endpoint,
            _credentials: &Credentials,
        ) -> Result<ChunkStream, TransportError> {
            Ok(stream::pending().boxed())
        }
    }

    fn streamer() -> QueryStreamer {
        QueryStreamer::new(
            StreamConfig::new("http://localhost"),
            Arc::new(PendingTransport),
            Arc::new(StaticCredentials::new("token", None)),
        )
    }

    #[test]
    fn test_request_body_carries_options() {
        let request = QueryRequest::new("docs", "what changed?").with_option("limit", 5);
        assert_eq!(
            request.body(),
            json!({"query": "what changed?", "limit": 5})
        );
    }

    #[tokio::test]
    async fn test_stale_sequence_discarded() {
        let streamer = streamer();
        let first = streamer.submit(QueryRequest::new("docs", "one"));
        let second = streamer.submit(QueryRequest::new("docs", "two"));
        assert!(second > first);

        let delta = QueryEvent::CompletionDelta {
            text: "late".to_string(),
        };
        assert!(!streamer.ingest(first, &delta));
        assert!(streamer.ingest(
            second,
            &QueryEvent::CompletionDelta {
                text: "fresh".to_string()
            }
        ));

        let snapshot = streamer.snapshot().unwrap();
        assert_eq!(snapshot.sequence, second);
        assert_eq!(snapshot.answer, "fresh");
        streamer.cancel();
    }

    #[tokio::test]
    async fn test_nothing_applies_after_done() {
        let streamer = streamer();
        let seq = streamer.submit(QueryRequest::new("docs", "q"));

        assert!(streamer.ingest(seq, &QueryEvent::Done));
        assert!(!streamer.ingest(
            seq,
            &QueryEvent::Results {
                results: vec![json!({"id": 1})]
            }
        ));
        assert_eq!(streamer.snapshot().unwrap().status, AnswerStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_submits_keep_latest_in_flight() {
        let streamer = streamer();

        for _ in 0..200 {
            let barrier = Arc::new(tokio::sync::Barrier::new(2));
            let tasks: Vec<_> = (0..2)
                .map(|i| {
                    let streamer = streamer.clone();
                    let barrier = Arc::clone(&barrier);
                    tokio::spawn(async move {
                        barrier.wait().await;
                        streamer.submit(QueryRequest::new("docs", &format!("q{}", i)))
                    })
                })
                .collect();
            for task in tasks {
                task.await.unwrap();
            }

            let in_flight = lock_in_flight(&streamer.inner.in_flight)
                .as_ref()
                .map(|(sequence, handle)| (*sequence, handle.is_cancelled()));
            assert_eq!(in_flight, Some((streamer.current_sequence(), false)));
        }
        streamer.cancel();
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let streamer = streamer();
        assert!(!streamer.cancel());
        streamer.submit(QueryRequest::new("docs", "q"));
        assert!(streamer.cancel());
        assert!(!streamer.cancel());
    }
}
