// src/main.rs
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum_server::Handle;
use http::{HeaderValue, Method};
use poll_backend::{
    cache::RedisResultCache,
    config::Config,
    db::{self, PgLedger},
    rate_limit::RedisCounters,
    routes, AppState,
};
use tokio::{signal, sync::watch};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok(); // Load environment variables from .env file
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let pool = match db::create_pool(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to connect to the database: {e}");
            std::process::exit(1);
        }
    };

    let redis = match db::connect_redis(&config).await {
        Ok(connection) => connection,
        Err(e) => {
            error!("Failed to connect to redis: {e}");
            std::process::exit(1);
        }
    };

    let state = AppState::new(
        Arc::new(PgLedger::new(pool)),
        Arc::new(RedisCounters::new(redis.clone())),
        Arc::new(RedisResultCache::new(redis)),
        &config.engine,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(state.sweeper.clone().run(shutdown_rx));

    let app = routes::create_routes(state).layer(cors_layer(config.cors_origin.as_deref()));

    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone(), shutdown_tx));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Server running on {addr}");

    if let Err(e) = axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
    {
        error!("Server error: {e}");
        std::process::exit(1);
    }

    if let Err(e) = sweeper.await {
        error!("Expiry sweeper task failed: {e}");
    }
    info!("Server shut down");
}

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([http::header::CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    match origin.map(str::parse::<HeaderValue>) {
        Some(Ok(origin)) => cors.allow_origin(origin),
        Some(Err(e)) => {
            error!("Ignoring invalid CORS_ORIGIN: {e}");
            cors.allow_origin(Any)
        }
        None => cors.allow_origin(Any),
    }
}

async fn shutdown_signal(handle: Handle, sweeper: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let _ = sweeper.send(true);
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
