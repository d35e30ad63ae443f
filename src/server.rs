use axum::{
    http::HeaderValue,
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use http::HeaderName;
use std::future::Future;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, set_header::SetResponseHeaderLayer, timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;

use crate::api::handler::{cancel_job, create_job, get_job, health_check, list_jobs, preview_job, AppState};
use crate::config::ServerSettings;
use crate::middleware::{create_cors_layer, rate_limit_middleware, RateLimitLayer};

pub fn create_app(state: AppState, settings: &ServerSettings) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let limiter = RateLimitLayer::new(settings.rate_limit_requests, settings.rate_limit_window_secs);

    // Job creation and preview touch the ledger RPC; they get the rate limit
    let rate_limited = Router::new()
        .route("/jobs", post(create_job))
        .route("/jobs/preview", post(preview_job))
        .route_layer(from_fn_with_state(limiter, rate_limit_middleware));

    let app = Router::new()
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                .merge(rate_limited)
                .route("/jobs", get(list_jobs))
                .route("/jobs/:schedule_id", get(get_job))
                .route("/jobs/:schedule_id/cancel", post(cancel_job)),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(30)))
                .layer(CompressionLayer::new())
                .layer(create_cors_layer(&settings.cors_origins))
                .layer(SetResponseHeaderLayer::if_not_present(
                    HeaderName::from_static("x-content-type-options"),
                    HeaderValue::from_static("nosniff"),
                ))
                .layer(SetResponseHeaderLayer::if_not_present(
                    HeaderName::from_static("x-frame-options"),
                    HeaderValue::from_static("DENY"),
                )),
        )
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server<F>(app: Router, bind_address: &str, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
