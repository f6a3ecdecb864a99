use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM, SIGINT, and SIGQUIT.
///
/// The first signal received cancels the returned `CancellationToken`;
/// later signals are harmless no-ops against an already-cancelled token.
/// Every loop observes the token cooperatively; draining is the heartbeat
/// supervisor's responsibility, not this handler's.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Caught SIGTERM, scheduling shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Caught SIGINT, scheduling shutdown");
            }
            _ = sigquit.recv() => {
                tracing::info!("Caught SIGQUIT, scheduling shutdown");
            }
        }

        token_clone.cancel();
    });

    token
}
