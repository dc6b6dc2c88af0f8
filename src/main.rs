use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use meshd::cli::Cli;
use meshd::registry::ConnectionRegistry;
use meshd::relay::RequestDispatcher;
use meshd::server::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize logging (--level sets the default, RUST_LOG overrides)
    env_logger::Builder::new()
        .filter_level(cli.level)
        .parse_default_env()
        .init();

    let settings = cli.settings()?;
    log::info!(
        "Starting mesh relay {} (forward timeout {:?}, max {:?}, outbound queue {}, max peers {})",
        env!("CARGO_PKG_VERSION"),
        settings.forward_timeout,
        settings.max_forward_timeout,
        settings.outbound_queue,
        settings.max_peers
    );

    let registry = ConnectionRegistry::new()
        .with_outbound_queue(settings.outbound_queue)
        .with_max_peers(settings.max_peers);
    tokio::spawn(log_tunnel_events(registry.clone()));

    let dispatcher = RequestDispatcher::new(
        registry,
        settings.forward_timeout,
        settings.max_forward_timeout,
    );

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        let signal = shutdown_signal().await;
        log::info!("{signal} received, draining tunnels");
        signal_token.cancel();
    });

    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("Failed to bind relay listener on {}", settings.listen))?;

    server::serve(listener, AppState::new(dispatcher, shutdown_token)).await
}

/// Record node connects and disconnects
async fn log_tunnel_events(registry: ConnectionRegistry) {
    let mut events = registry.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => log::info!(
                target: "meshd::events",
                "{:?} peer={}:{} token={} at={}",
                event.kind,
                event.ip,
                event.port,
                event.token,
                event.at.to_rfc3339()
            ),
            Err(RecvError::Lagged(missed)) => {
                log::warn!(target: "meshd::events", "Missed {missed} tunnel events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Resolves with the name of the first termination signal
async fn shutdown_signal() -> &'static str {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                log::warn!("Cannot listen for SIGINT: {e}");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                "SIGTERM"
            }
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {e}");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    }
}
