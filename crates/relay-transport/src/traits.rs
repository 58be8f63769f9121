//! Transport abstraction traits for the relay.
//!
//! A connection is split into an inbound [`MessageStream`], owned by the task
//! that handles the connection, and an outbound [`MessageSink`], shared with
//! whoever needs to deliver messages to it. Sends and receives on the same
//! connection may run concurrently.

use async_trait::async_trait;
use relay_protocol::ChatMessage;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Counter backing [`ConnectionId::generate`].
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let n = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn-{n}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] relay_protocol::ProtocolError),
}

/// The outbound half of a connection.
///
/// Implementations must tolerate concurrent calls to [`send`](Self::send)
/// from several tasks.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Send a message to the remote client.
    async fn send(&self, message: &ChatMessage) -> Result<(), TransportError>;

    /// Close the outbound half gracefully.
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// The inbound half of a connection.
#[async_trait]
pub trait MessageStream: Send {
    /// Receive the next message from the connection.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<ChatMessage>, TransportError>;
}

/// An accepted connection, ready to be handed to a session handler.
pub struct Connection {
    id: ConnectionId,
    remote_addr: Option<String>,
    sink: Arc<dyn MessageSink>,
    stream: Box<dyn MessageStream>,
}

impl Connection {
    /// Assemble a connection from its two halves.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        sink: Arc<dyn MessageSink>,
        stream: Box<dyn MessageStream>,
    ) -> Self {
        Self {
            id,
            remote_addr: None,
            sink,
            stream,
        }
    }

    /// Attach the remote address of the peer.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Get the connection's unique identifier.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Get the remote address of the connection, if known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    /// The outbound half of the connection.
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn MessageSink> {
        &self.sink
    }

    /// Wrap the outbound half, e.g. to add instrumentation.
    #[must_use]
    pub fn map_sink<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Arc<dyn MessageSink>) -> Arc<dyn MessageSink>,
    {
        self.sink = f(self.sink);
        self
    }

    /// Wrap the inbound half, e.g. to add instrumentation.
    #[must_use]
    pub fn map_stream<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Box<dyn MessageStream>) -> Box<dyn MessageStream>,
    {
        self.stream = f(self.stream);
        self
    }

    /// Split the connection into its identifier, sink and stream.
    #[must_use]
    pub fn into_parts(self) -> (ConnectionId, Arc<dyn MessageSink>, Box<dyn MessageStream>) {
        (self.id, self.sink, self.stream)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}
