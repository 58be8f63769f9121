//! # relay-transport
//!
//! Transport abstraction layer for the relay.
//!
//! The relay core only ever needs two primitives from a connection:
//! "receive the next message" and "send a message". This crate expresses
//! them as the [`MessageStream`] and [`MessageSink`] traits and provides:
//!
//! - **WebSocket** - an adapter over axum's upgraded socket
//! - **Channel** - an in-memory transport backed by tokio channels, used by
//!   tests and benchmarks
//!
//! ```rust,ignore
//! use relay_transport::Connection;
//!
//! async fn handle(connection: Connection) {
//!     let (id, sink, mut stream) = connection.into_parts();
//!     while let Ok(Some(message)) = stream.recv().await {
//!         let _ = sink.send(&message).await;
//!     }
//! }
//! ```

pub mod channel;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{Connection, ConnectionId, MessageSink, MessageStream, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConfig;
