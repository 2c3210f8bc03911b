use std::process::ExitCode;

use clap::Parser as _;
use relay_connector::config::ConnectorConfig;
use relay_connector::{metrics, session};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    install_tracing();
    tracing::info!(
        "{} {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = ConnectorConfig::parse();
    tracing::info!("starting relay-connector with config: {config:#?}");
    metrics::describe_metrics();

    let cancellation_token = CancellationToken::new();
    tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            cancellation_token.cancel();
        }
    });

    match session::run(config, cancellation_token).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            // we don't want to double print the error therefore we just return FAILURE
            tracing::error!("{err:?}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn install_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relay_connector=debug".into()),
        )
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("can install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("can install SIGTERM handler")
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
