use anyhow::{Context, Result};
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::graphql::{self, TaildashSchema};
use crate::api::rest::{self, AppState};
use crate::config::DaemonConfig;
use crate::domain::service::StatusService;
use crate::refresher;

pub async fn run(config: DaemonConfig) -> Result<()> {
    // Init tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "taildash daemon starting");

    let service = StatusService::new(&config).context("initializing status service")?;

    // Seed the cache from the last persisted snapshot so restarts serve
    // stale data immediately instead of blocking on the first collection.
    service.restore_from_disk().await;

    let app_state = AppState {
        service: service.clone(),
    };

    // Build GraphQL schema
    let schema = graphql::build_schema(service.clone());

    // Build GraphQL sub-router with its own state
    let graphql_router = Router::new()
        .route("/graphql", get(graphql_playground).post(graphql_handler))
        .with_state(schema);

    // Build Axum router: REST (with AppState) + GraphQL (with schema state)
    let app = rest::router(app_state)
        .merge(graphql_router)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Bind HTTP listener
    let http_addr = &config.http_addr;
    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding to {}", http_addr))?;

    info!(addr = %http_addr, "HTTP server listening");

    // Warm the cache in the background so the daemon serves immediately
    {
        let warm = service.clone();
        tokio::spawn(async move {
            info!("running initial status collection");
            match warm.refresh().await {
                Ok(snapshot) => {
                    info!(
                        generation = snapshot.generation,
                        peers = snapshot.peers.len(),
                        "initial status collection completed"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "initial status collection failed");
                }
            }
        });
    }

    // Spawn the periodic refresher
    let shutdown = CancellationToken::new();
    if config.cache.refresh_interval_secs > 0 {
        let cache = service.cache().clone();
        let period = Duration::from_secs(config.cache.refresh_interval_secs);
        tokio::spawn(refresher::run_refresh_loop(cache, period, shutdown.clone()));
    }

    // Run HTTP server with graceful shutdown
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("HTTP server error")?;

    info!("taildash daemon stopped");
    Ok(())
}

async fn graphql_playground() -> Html<String> {
    Html(
        async_graphql::http::playground_source(
            async_graphql::http::GraphQLPlaygroundConfig::new("/graphql"),
        ),
    )
}

async fn graphql_handler(
    State(schema): State<TaildashSchema>,
    req: GraphQLRequest,
) -> GraphQLResponse {
    schema.execute(req.into_inner()).await.into()
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, shutting down"); },
        _ = terminate => { info!("Received SIGTERM, shutting down"); },
    }

    // A refresh already in flight finishes on its own task; the refresher
    // stops scheduling new ones.
    shutdown.cancel();
}
