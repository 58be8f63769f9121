//! Broadcast fan-out.
//!
//! A broadcast takes a snapshot of the registry, spawns one send task per
//! recipient and returns once every one of them has resolved. The slowest
//! recipient therefore bounds the whole call, and with it the sender's
//! receive loop.
//!
//! A send that returns an error or panics evicts its recipient. Send tasks
//! are keyed by task id so a panicked task can still be traced back to its
//! session.

use crate::registry::ClientRegistry;
use crate::session::SessionHandle;
use relay_protocol::ChatMessage;
use relay_transport::{ConnectionId, TransportError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::{self, JoinSet};
use tracing::{trace, warn};

/// Outcome of a single broadcast call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions in the snapshot.
    pub recipients: usize,
    /// Sessions the message was delivered to.
    pub delivered: usize,
    /// Sessions removed from the registry because their send failed or
    /// panicked.
    pub evicted: usize,
}

/// Fans messages out to every registered session.
#[derive(Debug, Clone)]
pub struct BroadcastEngine {
    registry: Arc<ClientRegistry>,
}

impl BroadcastEngine {
    /// Create an engine over a shared registry.
    #[must_use]
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this engine delivers to.
    #[must_use]
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Deliver `message` to every session registered at call time.
    ///
    /// Sends run concurrently, one task per recipient. A failed send evicts
    /// that session and is not retried; it never aborts the other deliveries
    /// and is never reported to the caller as an error.
    pub async fn broadcast(&self, message: ChatMessage) -> BroadcastReport {
        let recipients = self.registry.snapshot();
        let mut report = BroadcastReport {
            recipients: recipients.len(),
            ..BroadcastReport::default()
        };

        if recipients.is_empty() {
            return report;
        }

        let message = Arc::new(message);
        let mut sends = JoinSet::new();
        let mut in_flight: HashMap<task::Id, ConnectionId> =
            HashMap::with_capacity(recipients.len());
        for session in recipients {
            let id = session.id().clone();
            let handle = sends.spawn(deliver(session, Arc::clone(&message)));
            in_flight.insert(handle.id(), id);
        }

        while let Some(outcome) = sends.join_next_with_id().await {
            let (task_id, failure) = match outcome {
                Ok((_, Ok(()))) => {
                    report.delivered += 1;
                    continue;
                }
                Ok((task_id, Err(e))) => (task_id, e.to_string()),
                Err(e) if e.is_panic() => (e.id(), "send panicked".to_string()),
                Err(e) => (e.id(), e.to_string()),
            };

            if let Some(id) = in_flight.remove(&task_id) {
                warn!(connection = %id, error = %failure, "Failed to send message");
                self.registry.remove(&id);
            }
            report.evicted += 1;
        }

        trace!(
            sender = %message.sender,
            recipients = report.recipients,
            delivered = report.delivered,
            evicted = report.evicted,
            "Broadcast complete"
        );

        report
    }
}

/// Send to one recipient.
async fn deliver(session: SessionHandle, message: Arc<ChatMessage>) -> Result<(), TransportError> {
    session.send(&message).await
}
