mod dispatcher;
mod download_pool;
mod error_response;
mod pending;
mod recovery;
mod registry;
mod request_guard;
mod resolver;
mod state;
mod stream_processor;
mod sweeper;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use arena_bridge_common::config::AppConfig;

use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("BRIDGE_CONFIG").ok().map(std::path::PathBuf::from);
    let config = AppConfig::load(config_path.as_deref())?;

    let _log_guard = init_logging(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "starting arena-bridge");

    let state = Arc::new(AppState::new(config));

    tokio::spawn(pending::run_consumer(state.clone(), state.pending.take_receiver().await));
    tokio::spawn(sweeper::run_metadata_sweeper(state.clone()));

    let app = Router::new()
        .route("/health", get(dispatcher::health))
        .route("/v1/models", get(dispatcher::list_models))
        .route("/v1/chat/completions", post(dispatcher::chat_completions))
        .route("/v1/images/generations", post(dispatcher::images_generations))
        .route("/agent/ws", get(transport::ws_handler))
        .with_state(state.clone());

    let listen_addr: SocketAddr = std::env::var("BRIDGE_LISTEN_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8787".to_string())
        .parse()?;
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "arena-bridge listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state.clone()))
    .await?;

    info!("arena-bridge shut down");
    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining in-flight requests");

    // Same drain path the metadata sweeper uses (final error advisory + Done,
    // then close), just applied to every still-open Response Channel instead
    // of only the ones that outlived the metadata timeout.
    state.registry.sweep_expired(std::time::Duration::ZERO).await;
}

fn init_logging(config: &AppConfig) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "arena-bridge.log");
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("arena_bridge_server=info,tower_http=info"));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_ansi(true).with_target(false);
    let json_layer = tracing_bunyan_formatter::JsonStorageLayer;
    let bunyan_layer = tracing_bunyan_formatter::BunyanFormattingLayer::new("arena-bridge".into(), non_blocking_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(json_layer)
        .with(bunyan_layer)
        .init();

    guard
}
