use std::process::ExitCode;

use clap::Parser as _;
use eyre::Context as _;
use relay_broker::config::BrokerConfig;
use relay_broker::{Broker, metrics};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    install_tracing();
    tracing::info!(
        "{} {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = BrokerConfig::parse();
    match start_broker(config, shutdown_signal()).await {
        Ok(()) => {
            tracing::info!("broker stopped");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            // we don't want to double print the error therefore we just return FAILURE
            tracing::error!("{err:?}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn start_broker(
    config: BrokerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> eyre::Result<()> {
    tracing::info!("starting relay-broker with config: {config:#?}");
    metrics::describe_metrics();

    let cancellation_token = CancellationToken::new();
    tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            shutdown.await;
            tracing::info!("shutdown signal received");
            cancellation_token.cancel();
        }
    });

    let api_bind_addr = config.api_bind_addr;
    let ws_bind_addr = config.ws_bind_addr;
    let health_bind_addr = config.health_bind_addr;
    let drain_timeout = config.drain_timeout;
    let broker = Broker::init(config);

    let api_listener = tokio::net::TcpListener::bind(api_bind_addr)
        .await
        .context("while binding the API listener")?;
    let ws_listener = tokio::net::TcpListener::bind(ws_bind_addr)
        .await
        .context("while binding the duplex listener")?;
    let health_listener = tokio::net::TcpListener::bind(health_bind_addr)
        .await
        .context("while binding the health listener")?;

    let api_server = serve(api_listener, broker.api_router(), &cancellation_token, "api");
    let ws_server = serve(
        ws_listener,
        broker.connector_router(),
        &cancellation_token,
        "duplex",
    );
    let health_server = serve(
        health_listener,
        broker.health_router(),
        &cancellation_token,
        "health",
    );

    tracing::info!("everything started successfully - now waiting for shutdown...");
    cancellation_token.cancelled().await;

    tracing::info!("draining in-flight requests (max wait time {drain_timeout:?})..");
    broker.drain().await;

    match tokio::time::timeout(drain_timeout, async move {
        tokio::join!(api_server, ws_server, health_server)
    })
    .await
    {
        Ok(_) => tracing::info!("successfully finished shutdown in time"),
        Err(_) => tracing::warn!("could not finish shutdown in time"),
    }
    Ok(())
}

fn serve(
    listener: tokio::net::TcpListener,
    router: axum::Router,
    cancellation_token: &CancellationToken,
    name: &'static str,
) -> tokio::task::JoinHandle<()> {
    let cancellation_token = cancellation_token.clone();
    tokio::spawn(async move {
        tracing::info!(
            "starting {name} server on {}",
            listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or(String::from("invalid addr"))
        );
        let shutdown = cancellation_token.clone();
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        tracing::info!("{name} server shutdown");
        if let Err(err) = result {
            tracing::error!("got error from {name} server: {err:?}");
        }
        // cancel in case the server errored so the rest of the broker stops
        cancellation_token.cancel();
    })
}

fn install_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relay_broker=debug".into()),
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
