//! Stream plumbing: connections, credentials, framing and typed events.

pub mod credentials;
pub mod event;
pub mod frame;
pub mod transport;

pub use credentials::{CredentialProvider, Credentials, StaticCredentials};
pub use event::{ProgressPayload, QueryEvent, StreamEvent, SyncEvent};
pub use frame::FrameParser;
pub use transport::{
    CancelHandle, ChunkStream, Endpoint, FrameSource, HttpTransport, Method, StreamTransport,
    TransportError, ORGANIZATION_HEADER,
};
