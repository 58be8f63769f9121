//! Metrics collection and export for the relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format. Per-message counters are recorded by wrapping each
//! connection's sink and stream, so the core stays free of instrumentation.

use async_trait::async_trait;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::SessionError;
use relay_protocol::ChatMessage;
use relay_transport::{MessageSink, MessageStream, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const MESSAGES_TOTAL: &str = "relay_messages_total";
    pub const MESSAGES_BYTES: &str = "relay_messages_bytes";
    pub const SEND_FAILURES_TOTAL: &str = "relay_send_failures_total";
    pub const SESSIONS_CLOSED_TOTAL: &str = "relay_sessions_closed_total";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Describe every relay metric to the installed recorder.
///
/// Descriptions sent before a recorder is installed are dropped.
pub fn describe_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages relayed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total text bytes of messages relayed");
    metrics::describe_counter!(
        names::SEND_FAILURES_TOTAL,
        "Deliveries that failed and evicted their recipient"
    );
    metrics::describe_counter!(
        names::SESSIONS_CLOSED_TOTAL,
        "Closed sessions by reason"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    debug!("Metrics described");
}

/// Install the Prometheus recorder, describe the relay metrics and start
/// the scrape listener.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_metrics();

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a failed delivery.
pub fn record_send_failure() {
    counter!(names::SEND_FAILURES_TOTAL).increment(1);
}

/// Record why a session ended.
pub fn record_session_closed(result: &Result<(), SessionError>) {
    counter!(names::SESSIONS_CLOSED_TOTAL, "reason" => close_reason(result)).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Label for the way a session ended.
#[must_use]
pub fn close_reason(result: &Result<(), SessionError>) -> &'static str {
    match result {
        Ok(()) => "closed",
        Err(SessionError::Cancelled) => "cancelled",
        Err(SessionError::Transport(_)) => "error",
    }
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

/// Sink wrapper counting outbound messages and failed deliveries.
pub struct MeteredSink {
    inner: Arc<dyn MessageSink>,
}

impl MeteredSink {
    #[must_use]
    pub fn wrap(inner: Arc<dyn MessageSink>) -> Arc<dyn MessageSink> {
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl MessageSink for MeteredSink {
    async fn send(&self, message: &ChatMessage) -> Result<(), TransportError> {
        let result = self.inner.send(message).await;
        match &result {
            Ok(()) => record_message(message.text_len(), "outbound"),
            Err(_) => record_send_failure(),
        }
        result
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}

/// Stream wrapper counting inbound messages and receive errors.
pub struct MeteredStream {
    inner: Box<dyn MessageStream>,
}

impl MeteredStream {
    #[must_use]
    pub fn wrap(inner: Box<dyn MessageStream>) -> Box<dyn MessageStream> {
        Box::new(Self { inner })
    }
}

#[async_trait]
impl MessageStream for MeteredStream {
    async fn recv(&mut self) -> Result<Option<ChatMessage>, TransportError> {
        let result = self.inner.recv().await;
        match &result {
            Ok(Some(message)) => record_message(message.text_len(), "inbound"),
            Ok(None) => {}
            Err(_) => record_error("receive"),
        }
        result
    }
}
