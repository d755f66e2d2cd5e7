//! In-memory transport replaying scripted connections.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tokio::sync::mpsc;

use syncstream::stream::{ChunkStream, Credentials, Endpoint, StreamTransport, TransportError};

/// What one call to `open` produces.
pub enum Script {
    /// Yields the chunks, then ends the stream.
    Chunks(Vec<Result<Vec<u8>, TransportError>>),
    /// Yields the chunks, then stays open without producing anything.
    ChunksThenPending(Vec<Vec<u8>>),
    /// Fails to open.
    Fail(TransportError),
    /// Yields whatever the test sends; ends when the sender is dropped.
    Live(mpsc::UnboundedReceiver<Vec<u8>>),
    /// Opens and never produces anything.
    Pending,
}

/// Serves one script per `open`, in order. Once the scripts run out every
/// connection stays pending.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    opens: AtomicUsize,
    endpoints: Mutex<Vec<Endpoint>>,
    organizations: Mutex<Vec<Option<String>>>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        }
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// Number of connections opened so far, failed ones included.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.lock().unwrap().clone()
    }

    pub fn organizations(&self) -> Vec<Option<String>> {
        self.organizations.lock().unwrap().clone()
    }
}

/// A live script and the sender feeding it.
pub fn live() -> (Script, mpsc::UnboundedSender<Vec<u8>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Script::Live(rx), tx)
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn open(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<ChunkStream, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.endpoints.lock().unwrap().push(endpoint.clone());
        self.organizations
            .lock()
            .unwrap()
            .push(credentials.organization_id.clone());

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Pending);

        match script {
            Script::Chunks(chunks) => Ok(stream::iter(chunks).boxed()),
            Script::ChunksThenPending(chunks) => Ok(stream::iter(chunks.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed()),
            Script::Live(rx) => Ok(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (Ok(chunk), rx))
            })
            .boxed()),
            Script::Fail(err) => Err(err),
            Script::Pending => Ok(stream::pending().boxed()),
        }
    }
}
