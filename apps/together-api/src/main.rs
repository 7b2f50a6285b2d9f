use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use together_api::broadcast::{QueueBackend, QueueBuilder, SessionRegistry};
use together_api::config::{Backend, Config};
use together_api::db::backplane::{Backplane, MemoryBackplane};
use together_api::db::directory::BackplaneDirectory;
use together_api::db::redis::RedisBackplane;
use together_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    // The local backend keeps session records in process as well.
    let (backplane, backend): (Arc<dyn Backplane>, QueueBackend) = match config.backend {
        Backend::Local => (Arc::new(MemoryBackplane::new()), QueueBackend::Local),
        Backend::Redis => {
            let redis: Arc<dyn Backplane> = Arc::new(
                RedisBackplane::connect(&config.redis_url)
                    .await
                    .expect("failed to connect to Redis"),
            );
            (redis.clone(), QueueBackend::Distributed(redis))
        }
    };

    let directory = Arc::new(BackplaneDirectory::new(backplane));
    let queues = QueueBuilder::from_config(backend, &config.broadcast);
    let registry = Arc::new(SessionRegistry::new(queues, config.broadcast.clone()));

    tracing::info!(
        backend = config.backend.as_str(),
        tick_ms = config.broadcast.fanout_tick.as_millis() as u64,
        echo_self = config.broadcast.echo_self,
        "together-api configured"
    );

    let state = AppState {
        config: Arc::new(config),
        directory,
        registry,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(together_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "together-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
