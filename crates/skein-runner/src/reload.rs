use tokio::sync::watch;
use tracing::info;

/// Reload signal type (empty - just signals that a reload is requested)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSignal;

/// Create a reload signal channel and spawn a SIGUSR2 handler
///
/// Returns a receiver that changes every time SIGUSR2 is received.
#[cfg(unix)]
pub fn setup_reload_signal() -> watch::Receiver<Option<ReloadSignal>> {
    let (reload_tx, reload_rx) = watch::channel(None);

    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigusr2 = match signal(SignalKind::user_defined2()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(target: "runner", "Failed to register SIGUSR2 handler: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = reload_tx.closed() => {
                    info!(target: "runner", "Reload signal receiver dropped, shutting down SIGUSR2 handler");
                    break;
                }
                received = sigusr2.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!(target: "runner", "Received SIGUSR2 - triggering script reload");
                    if reload_tx.send(Some(ReloadSignal)).is_err() {
                        break;
                    }
                }
            }
        }
    });

    reload_rx
}

/// Create a reload signal channel (non-Unix platforms don't support SIGUSR2)
#[cfg(not(unix))]
pub fn setup_reload_signal() -> watch::Receiver<Option<ReloadSignal>> {
    let (reload_tx, reload_rx) = watch::channel(None);
    tracing::warn!(target: "runner", "SIGUSR2 reload not supported on this platform");
    // Keep the sender alive but never send signals
    std::mem::forget(reload_tx);
    reload_rx
}
