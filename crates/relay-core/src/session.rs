//! Per-connection session handling.
//!
//! A [`SessionHandler`] owns one connection for its whole life. It is
//! `Active` from the moment it runs until the inbound stream ends, fails, or
//! the connection's cancellation token fires; it is then `Closed`. The
//! session is registered on entry and deregistered exactly once on exit by a
//! drop guard, whichever way the loop ended.

use crate::broadcast::BroadcastEngine;
use crate::registry::ClientRegistry;
use relay_protocol::ChatMessage;
use relay_transport::{Connection, ConnectionId, MessageSink, MessageStream, TransportError};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a session closed abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The inbound stream failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The connection's cancellation token fired.
    #[error("Session cancelled")]
    Cancelled,
}

/// Shared handle used to deliver messages to one session.
///
/// Handles compare equal when they refer to the same connection.
#[derive(Clone)]
pub struct SessionHandle {
    id: ConnectionId,
    sink: Arc<dyn MessageSink>,
}

impl SessionHandle {
    /// Create a handle from a connection's identifier and outbound half.
    #[must_use]
    pub fn new(id: ConnectionId, sink: Arc<dyn MessageSink>) -> Self {
        Self { id, sink }
    }

    /// Identifier of the connection.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Send a message to the client behind this handle.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if delivery failed.
    pub async fn send(&self, message: &ChatMessage) -> Result<(), TransportError> {
        self.sink.send(message).await
    }
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SessionHandle {}

impl Hash for SessionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Keeps a session registered for as long as it is alive.
struct Registration {
    registry: Arc<ClientRegistry>,
    id: ConnectionId,
}

impl Registration {
    fn new(registry: &Arc<ClientRegistry>, handle: SessionHandle) -> Self {
        let id = handle.id().clone();
        registry.add(handle);
        info!(connection = %id, total = registry.count(), "Client connected");
        Self {
            registry: Arc::clone(registry),
            id,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        // The session may already be gone after a failed send.
        self.registry.remove(&self.id);
        info!(connection = %self.id, total = self.registry.count(), "Client disconnected");
    }
}

/// Drives a single client connection.
pub struct SessionHandler {
    handle: SessionHandle,
    stream: Box<dyn MessageStream>,
    engine: BroadcastEngine,
    cancel: CancellationToken,
}

impl SessionHandler {
    /// Create a handler for an accepted connection.
    ///
    /// `cancel` is the connection's cancellation signal; firing it closes the
    /// session even while it is waiting for the next message.
    #[must_use]
    pub fn new(connection: Connection, engine: BroadcastEngine, cancel: CancellationToken) -> Self {
        let (id, sink, stream) = connection.into_parts();
        Self {
            handle: SessionHandle::new(id, sink),
            stream,
            engine,
            cancel,
        }
    }

    /// Identifier of the connection being handled.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        self.handle.id()
    }

    /// Run the session until the connection closes.
    ///
    /// Each inbound message is fully fanned out before the next one is read,
    /// so messages from one sender are delivered in order.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Transport`] if the inbound stream fails and
    /// [`SessionError::Cancelled`] if the cancellation token fired. A clean
    /// end of stream returns `Ok(())`.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let _registration = Registration::new(self.engine.registry(), self.handle.clone());

        let result = self.receive_loop().await;
        match &result {
            Ok(()) => debug!(connection = %self.id(), "Inbound stream ended"),
            Err(SessionError::Cancelled) => debug!(connection = %self.id(), "Session cancelled"),
            Err(e) => warn!(connection = %self.id(), error = %e, "Receive error"),
        }
        result
    }

    async fn receive_loop(&mut self) -> Result<(), SessionError> {
        loop {
            let next = tokio::select! {
                biased;

                () = self.cancel.cancelled() => return Err(SessionError::Cancelled),
                next = self.stream.recv() => next?,
            };

            let Some(message) = next else {
                return Ok(());
            };

            debug!(
                connection = %self.handle.id(),
                sender = %message.sender,
                "Broadcasting message"
            );
            self.engine.broadcast(message).await;
        }
    }
}

impl fmt::Debug for SessionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandler")
            .field("id", self.handle.id())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
