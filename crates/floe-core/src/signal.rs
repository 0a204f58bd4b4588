//! Signal handling for graceful shutdown.
//!
//! Shutdown stops polling immediately; a publish already under way always
//! finishes first.

use tracing::{error, info};

/// Wait for SIGINT, SIGTERM or SIGQUIT.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let handlers = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    );

    let (mut sigint, mut sigterm, mut sigquit) = match handlers {
        (Ok(int), Ok(term), Ok(quit)) => (int, term, quit),
        (int, term, quit) => {
            let e = [int.err(), term.err(), quit.err()].into_iter().flatten().next();
            error!(error = ?e, "Failed to install unix signal handlers, falling back to ctrl-c");
            return ctrl_c().await;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!(signal = "SIGINT", "Signal received"),
        _ = sigterm.recv() => info!(signal = "SIGTERM", "Signal received"),
        _ = sigquit.recv() => info!(signal = "SIGQUIT", "Signal received"),
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    ctrl_c().await
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(signal = "ctrl-c", "Signal received"),
        // Without any handler the only way out is an external kill
        Err(e) => {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await
        }
    }
}
