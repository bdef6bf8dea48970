use std::io::Result;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, routing::get};

use crate::broker::Broker;
use crate::codes::CodeGenerator;
use crate::config::{self, Settings};
use crate::db;
use crate::net::ws_handler;
use crate::store::PgSessionStore;

fn init_runtime() {
    let _ = dotenvy::dotenv();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = matches!(std::env::var("LOG_FORMAT").as_deref(), Ok("json"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::capture();
        tracing::error!(%info, ?backtrace, "panic");
    }));
}

/// Serves the signaling endpoint on an already-bound listener. Integration
/// tests bind an ephemeral port themselves and call this directly.
pub async fn run(listener: tokio::net::TcpListener, broker: Arc<Broker>) -> Result<()> {
    let address = listener.local_addr()?;
    broker.spawn_background_tasks();

    let app = Router::new().route("/ws", get(ws_handler)).with_state(broker);

    tracing::info!(%address, "listening");

    // Serve the app and report errors rather than panicking.
    axum::serve(listener, app).await.inspect_err(|e| {
        tracing::error!(error = %e, "server error");
    })
}

pub async fn run_with_config() -> Result<()> {
    init_runtime();

    let settings = Settings::from_env();
    let broker = build_broker(settings).await?;

    let address = SocketAddr::from(([0, 0, 0, 0], config::http_port()));
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .inspect_err(|e| {
            tracing::error!(%address, error = %e, "failed to bind");
        })?;

    run(listener, broker).await
}

async fn build_broker(settings: Settings) -> Result<Arc<Broker>> {
    let database_url = config::database_url();

    let pool = db::connect_pool(&database_url).await.map_err(|e| {
        tracing::error!(error = %e, "failed to connect to the store");
        std::io::Error::other(e)
    })?;
    db::run_migrations(&pool).await.map_err(|e| {
        tracing::error!(error = %e, "failed to run migrations");
        std::io::Error::other(e)
    })?;
    tracing::info!("store ready");

    let store = Arc::new(PgSessionStore::new(database_url, pool));
    let generator = CodeGenerator::new(config::code_seed(), store.clone())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to load the lobby code counter");
            std::io::Error::other(e)
        })?;

    Ok(Arc::new(Broker::new(settings, store, generator)))
}
