//! Graceful shutdown coordination via `CancellationToken`.
//!
//! The server owns one root token. Every session runs under a child of it,
//! so cancelling the root closes all sessions, each with
//! `SessionError::Cancelled`.

use relay_core::ClientRegistry;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Poll interval while waiting for sessions to deregister.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Cancel `token` on Ctrl-C or SIGTERM.
///
/// Returns early, without cancelling, if the token is cancelled elsewhere.
pub async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
        () = token.cancelled() => return,
    }

    info!("Shutdown signal received");
    token.cancel();
}

/// Wait for every session to leave the registry, up to `timeout`.
///
/// Returns `true` if the registry drained in time.
pub async fn drain(registry: &ClientRegistry, timeout: Duration) -> bool {
    let drained = tokio::time::timeout(timeout, async {
        while !registry.is_empty() {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    })
    .await
    .is_ok();

    if drained {
        info!("All sessions closed");
    } else {
        warn!(
            remaining = registry.count(),
            "Shutdown timed out after {timeout:?} with sessions still open"
        );
    }
    drained
}
