//! # relay-protocol
//!
//! Wire format for the relay.
//!
//! The only unit exchanged between clients and the server is a
//! [`ChatMessage`]: a sender name and a text body. This crate defines that
//! type and the codecs used to put it on the wire:
//!
//! - **MessagePack** - length-prefixed binary frames (the default)
//! - **JSON** - plain text frames, handy for browsers and `wscat`
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, ChatMessage};
//!
//! let message = ChatMessage::new("alice", "hi");
//!
//! let encoded = codec::encode(&message).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(message, decoded);
//! ```

pub mod codec;
pub mod message;

pub use codec::{decode, encode, ProtocolError, WireFormat};
pub use message::ChatMessage;
