//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum [`WebSocket`] into a [`Connection`]. Binary frames
//! carry length-prefixed MessagePack, text frames carry JSON; both are
//! accepted inbound, and [`WireFormat`] picks the outbound encoding.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{codec, ChatMessage, ProtocolError, WireFormat};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::traits::{Connection, ConnectionId, MessageSink, MessageStream, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Encoding for outbound messages.
    pub wire_format: WireFormat,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024, // 64 KB
            wire_format: WireFormat::MsgPack,
        }
    }
}

/// Turn an upgraded socket into a relay connection.
#[must_use]
pub fn accept(socket: WebSocket, config: &WebSocketConfig) -> Connection {
    let id = ConnectionId::generate();
    let is_open = Arc::new(AtomicBool::new(true));
    let (sink, stream) = socket.split();

    let sink = WebSocketSink {
        id: id.clone(),
        sink: Mutex::new(sink),
        wire_format: config.wire_format,
        is_open: Arc::clone(&is_open),
    };
    let stream = WebSocketStream {
        id: id.clone(),
        stream,
        read_buffer: BytesMut::with_capacity(4096),
        max_message_size: config.max_message_size,
        is_open,
    };

    debug!(connection = %id, "WebSocket connection accepted");
    Connection::new(id, Arc::new(sink), Box::new(stream))
}

/// Outbound half of a WebSocket connection.
pub struct WebSocketSink {
    id: ConnectionId,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    wire_format: WireFormat,
    is_open: Arc<AtomicBool>,
}

impl WebSocketSink {
    fn to_frame(&self, message: &ChatMessage) -> Result<Message, ProtocolError> {
        match self.wire_format {
            WireFormat::MsgPack => Ok(Message::Binary(codec::encode(message)?.to_vec())),
            WireFormat::Json => Ok(Message::Text(codec::encode_json(message)?)),
        }
    }
}

#[async_trait]
impl MessageSink for WebSocketSink {
    async fn send(&self, message: &ChatMessage) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let frame = self.to_frame(message)?;
        let mut sink = self.sink.lock().await;
        sink.send(frame).await.map_err(|e| {
            self.is_open.store(false, Ordering::SeqCst);
            TransportError::SendFailed(e.to_string())
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(()); // Already closed
        }

        debug!(connection = %self.id, "Closing WebSocket");
        let mut sink = self.sink.lock().await;
        sink.close()
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }
}

/// Inbound half of a WebSocket connection.
pub struct WebSocketStream {
    id: ConnectionId,
    stream: SplitStream<WebSocket>,
    read_buffer: BytesMut,
    max_message_size: usize,
    is_open: Arc<AtomicBool>,
}

impl WebSocketStream {
    fn mark_closed(&self) {
        self.is_open.store(false, Ordering::SeqCst);
    }

    fn check_size(&self, size: usize) -> Result<(), TransportError> {
        if size <= self.max_message_size {
            return Ok(());
        }
        warn!(
            connection = %self.id,
            "Message too large: {} bytes (max: {})",
            size,
            self.max_message_size
        );
        Err(TransportError::Protocol(ProtocolError::FrameTooLarge(size)))
    }
}

#[async_trait]
impl MessageStream for WebSocketStream {
    async fn recv(&mut self) -> Result<Option<ChatMessage>, TransportError> {
        loop {
            // A message may span several binary frames; its length prefix
            // is checked as soon as it arrives.
            if let Some(len) = codec::frame_len(&self.read_buffer) {
                self.check_size(len)?;
            }

            // A binary frame may hold more than one message.
            if let Some(message) = codec::decode_from(&mut self.read_buffer)? {
                return Ok(Some(message));
            }

            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    self.check_size(data.len())?;
                    self.read_buffer.extend_from_slice(&data);
                }
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(codec::decode_json(&text)?));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // tungstenite answers pings on its own
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    self.mark_closed();
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.mark_closed();
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    self.mark_closed();
                    return Ok(None);
                }
            }
        }
    }
}
