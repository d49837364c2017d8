//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT)
//! - Translate the first signal into cancellation of a run token
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)

use std::io;

use tokio_util::sync::CancellationToken;

/// Resolve once SIGINT or SIGTERM arrives (Ctrl+C elsewhere).
pub async fn wait_for_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C");
        Ok(())
    }
}

/// A token cancelled by the first termination signal.
///
/// Pass it to [`Graceful::run`](crate::Graceful::run) to shut down on Ctrl+C.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => trigger.cancel(),
            Err(e) => tracing::error!(error = %e, "Failed to install signal handlers"),
        }
    });
    token
}
