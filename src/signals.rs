//! Lifecycle & Signals (spec §4.9/C9, §5 "Cancellation"). On `interrupt`
//! or `terminate`, the worker logs accumulated counters and exits
//! immediately — in-flight operations are not rolled back; a
//! partially-claimed work item simply ages out of the stale-claim window.

use crate::identity::SessionCounters;
use tracing::info;

/// Resolves once either SIGINT or SIGTERM arrives.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

pub fn log_shutdown(worker_id: &str, counters: &SessionCounters) {
    info!(worker = worker_id, "shutting down: {}", counters.summary());
}
