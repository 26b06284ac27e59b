use std::sync::Arc;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sponsorgraph_common::Config;
use sponsorgraph_crawler::{JobQueue, QueuePolicy};
use sponsorgraph_graph::{migrate, PgStore};

mod rest;

pub struct AppState {
    pub queue: JobQueue,
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/", get(|| async { "ok" }))
        .route("/enqueue", post(rest::api_enqueue))
        .route("/jobs/{id}", get(rest::api_job_status))
        .route("/queue", get(rest::api_queue_overview))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        // Logging layer: method + path only (no query params)
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                },
            ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sponsorgraph=info".parse()?))
        .init();

    let config = Config::api_from_env();

    let store = Arc::new(PgStore::connect(&config.database_url).await?);
    migrate(store.pool()).await?;

    let queue = JobQueue::new(
        store,
        QueuePolicy {
            freshness: chrono::Duration::days(config.freshness_days),
            retry_ceiling: config.retry_ceiling,
            backoff_base: config.backoff_base,
            backoff_cap: config.backoff_cap,
            abandoned_timeout: chrono::Duration::from_std(config.abandoned_timeout)?,
        },
    );
    let state = Arc::new(AppState { queue });

    let addr = format!("{}:{}", config.api_host, config.api_port);
    info!("SponsorGraph API starting on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}
