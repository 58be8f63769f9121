//! The chat message relayed between clients.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A message sent by one client and delivered to every connected client.
///
/// Carries no identifier, timestamp or delivery metadata. Once built it is
/// shared read-only between the broadcast engine and every recipient.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Display name of the sender, as supplied by the client.
    pub sender: String,
    /// Message body.
    pub message: String,
}

impl ChatMessage {
    /// Create a new chat message.
    #[must_use]
    pub fn new(sender: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            message: message.into(),
        }
    }

    /// Size of the text fields in bytes.
    #[must_use]
    pub fn text_len(&self) -> usize {
        self.sender.len() + self.message.len()
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.sender, self.message)
    }
}
