//! Dialogue Bridge
//!
//! Connects to a speech robot and runs either a text dialogue through a chat
//! backend or a realtime audio relay until Ctrl+C / SIGTERM.

use anyhow::Context;
use clap::Parser;
use dialogue_bridge::agent::FurhatClient;
use dialogue_bridge::cli::Cli;
use dialogue_bridge::config::{Config, RunMode};
use dialogue_bridge::dialogue::DialogueSession;
use dialogue_bridge::error::BridgeError;
use dialogue_bridge::llm::build_backend;
use dialogue_bridge::realtime::{VoiceSession, WebSocketTransport};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env().context("Failed to load configuration")?;
    cli.apply(&mut config);
    let mode = cli.mode();
    config
        .validate(mode)
        .context("Invalid configuration")?;

    info!(
        mode = ?mode,
        agent = %config.agent.events_url(),
        provider = %config.llm.provider,
        model = %config.llm.model,
        streaming = config.llm.streaming,
        "Configuration loaded"
    );
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let session_id = Uuid::new_v4().to_string();
    let span = info_span!("session", session_id = %session_id);
    let result = run(config, mode, shutdown).instrument(span).await;

    if let Err(e) = &result {
        error!(error = %e, "Session ended with an error");
    }
    info!("Shutdown complete");
    result
}

async fn run(config: Config, mode: RunMode, shutdown: CancellationToken) -> anyhow::Result<()> {
    let (client, events) = FurhatClient::connect(&config.agent)
        .await
        .with_context(|| format!("Failed to connect to the robot at {}", config.agent.host))?;
    let client = Arc::new(client);

    let result = match mode {
        RunMode::Chat => {
            let session = build_backend(&config.llm)
                .map_err(BridgeError::from)
                .and_then(|backend| {
                    DialogueSession::from_config(&config, client.clone(), events, backend, shutdown)
                });
            match session {
                Ok(session) => session.run().await.map(|history| {
                    info!(committed = history.len(), "Conversation finished");
                }),
                Err(e) => Err(e),
            }
        }
        RunMode::Realtime => {
            let api_key = config.llm.api_key.clone().unwrap_or_default();
            match WebSocketTransport::connect(&config.realtime.url, &api_key).await {
                Ok(transport) => {
                    VoiceSession::new(&config.realtime, client.clone(), events, transport, shutdown)
                        .run()
                        .await
                }
                Err(e) => Err(e),
            }
        }
    };

    client.disconnect().await;
    result.map_err(anyhow::Error::from)
}

/// Handle graceful shutdown signals (Ctrl+C, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}
