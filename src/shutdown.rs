use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on SIGTERM or SIGINT.
///
/// Every role watches this token: the gRPC servers stop accepting, the
/// dispatcher requeues in-flight work and withdraws its job, and agents tell
/// their active dispatcher they are going away.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (term, int) => {
                    let error = term.err().or(int.err());
                    tracing::warn!(error = ?error, "Signal handlers unavailable, falling back to ctrl-c");
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("Received ctrl-c, shutting down");
                        trigger.cancel();
                    }
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
        }
        trigger.cancel();
    });

    token
}
