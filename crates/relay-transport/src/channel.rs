//! In-memory transport backed by tokio channels.
//!
//! [`pair`] returns the server side of a connection together with a
//! [`ChannelClient`] that plays the remote peer. Dropping the client ends the
//! inbound stream cleanly and makes further sends fail, the same way a peer
//! hanging up would.

use async_trait::async_trait;
use relay_protocol::ChatMessage;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::traits::{Connection, ConnectionId, MessageSink, MessageStream, TransportError};

/// Outbound half of an in-memory connection.
#[derive(Debug)]
pub struct ChannelSink {
    id: ConnectionId,
    outbound: mpsc::Sender<ChatMessage>,
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&self, message: &ChatMessage) -> Result<(), TransportError> {
        trace!(connection = %self.id, "Channel send");
        self.outbound
            .send(message.clone())
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

/// Inbound half of an in-memory connection.
#[derive(Debug)]
pub struct ChannelStream {
    inbound: mpsc::Receiver<Result<ChatMessage, TransportError>>,
}

#[async_trait]
impl MessageStream for ChannelStream {
    async fn recv(&mut self) -> Result<Option<ChatMessage>, TransportError> {
        match self.inbound.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// The remote end of an in-memory connection.
#[derive(Debug)]
pub struct ChannelClient {
    id: ConnectionId,
    inbound: mpsc::Sender<Result<ChatMessage, TransportError>>,
    outbound: mpsc::Receiver<ChatMessage>,
}

impl ChannelClient {
    /// Identifier of the connection this client is attached to.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Send a message to the server.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the server side has
    /// dropped its stream.
    pub async fn send(&self, message: ChatMessage) -> Result<(), TransportError> {
        self.inbound
            .send(Ok(message))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Make the server's next receive fail with `error`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the server side has
    /// dropped its stream.
    pub async fn inject_error(&self, error: TransportError) -> Result<(), TransportError> {
        self.inbound
            .send(Err(error))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Wait for the next message delivered by the server.
    pub async fn recv(&mut self) -> Option<ChatMessage> {
        self.outbound.recv().await
    }

    /// Take a delivered message without waiting.
    pub fn try_recv(&mut self) -> Option<ChatMessage> {
        self.outbound.try_recv().ok()
    }

    /// Stop accepting deliveries while keeping the inbound side open.
    ///
    /// Every later send on the server side fails with
    /// [`TransportError::ConnectionClosed`].
    pub fn close_outbound(&mut self) {
        self.outbound.close();
    }
}

/// Create an in-memory connection.
///
/// `capacity` bounds both directions; a full outbound buffer makes server
/// sends wait until the client reads.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn pair(capacity: usize) -> (Connection, ChannelClient) {
    let id = ConnectionId::generate();
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

    let sink = ChannelSink {
        id: id.clone(),
        outbound: outbound_tx,
    };
    let stream = ChannelStream {
        inbound: inbound_rx,
    };
    let connection = Connection::new(id.clone(), Arc::new(sink), Box::new(stream));

    let client = ChannelClient {
        id,
        inbound: inbound_tx,
        outbound: outbound_rx,
    };

    (connection, client)
}
