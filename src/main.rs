use segment_sync_lib::{cli::parse_args, commands::run_cli};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancels `token` on the first SIGTERM or SIGINT.
async fn handle_shutdown_signals(token: CancellationToken) {
    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(err), _) | (_, Err(err)) => {
                warn!(
                    event = "signal_handler_registration_failed",
                    error = %err,
                    "could not register shutdown signal handlers"
                );
                return;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => {
            info!(event = "shutdown_signal", signal = "SIGTERM", "SIGTERM received, shutting down");
        }
        _ = sigint.recv() => {
            info!(event = "shutdown_signal", signal = "SIGINT", "SIGINT received, shutting down");
        }
        _ = token.cancelled() => return,
    }

    token.cancel();
}

#[tokio::main]
async fn main() {
    let cli = parse_args();
    let shutdown_token = CancellationToken::new();
    let signal_handle = tokio::spawn(handle_shutdown_signals(shutdown_token.clone()));

    let exit_code = run_cli(cli, shutdown_token.clone()).await;

    shutdown_token.cancel();
    let _ = signal_handle.await;
    std::process::exit(exit_code);
}
