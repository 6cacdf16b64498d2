//! Graceful shutdown coordinator.
//!
//! Listens for SIGINT (Ctrl+C) and SIGTERM, then cancels a
//! [`tokio_util::sync::CancellationToken`] so the sync engine can stop
//! at the next item boundary instead of mid-upload. A second signal
//! force-exits.

use tokio_util::sync::CancellationToken;

/// Install signal handlers and return a [`CancellationToken`] that is
/// cancelled on the first SIGINT / SIGTERM. A second signal force-exits
/// the process.
pub fn install() -> CancellationToken {
    let token = CancellationToken::new();

    let handler_token = token.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate()).expect("failed to register SIGTERM handler")
        };

        let mut force = false;
        loop {
            #[cfg(unix)]
            {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }

            #[cfg(not(unix))]
            {
                tokio::signal::ctrl_c()
                    .await
                    .expect("failed to listen for Ctrl+C");
            }

            if force {
                tracing::warn!("Force exit requested");
                std::process::exit(130);
            }
            force = true;
            tracing::info!("Received shutdown signal, stopping after the current image...");
            tracing::info!("Press Ctrl+C again to force exit");
            handler_token.cancel();
        }
    });

    token
}
