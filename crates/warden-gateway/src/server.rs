//! HTTP server implementation using Axum.

use axum::{
    Router,
    routing::{get, post, put},
};
use std::sync::Arc;
use tokio::sync::Notify;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use warden_core::GatewayConfig;
use warden_scheduler::SchedulerAdmin;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub admin: SchedulerAdmin,
    /// Expected `X-Admin-Token`. `None` leaves the API open.
    pub admin_token: Option<String>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(admin: SchedulerAdmin, config: &GatewayConfig) -> Self {
        let token = config.admin_token.trim();
        Self {
            admin,
            admin_token: (!token.is_empty()).then(|| token.to_string()),
            start_time: std::time::Instant::now(),
        }
    }
}

/// Reject requests without the configured admin token.
async fn require_token(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let Some(expected) = &state.admin_token else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get("X-Admin-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided == expected {
        return next.run(req).await;
    }

    tracing::warn!(path = %req.uri().path(), "rejected admin request: bad or missing token");
    super::routes::error_response(
        axum::http::StatusCode::UNAUTHORIZED,
        "unauthorized",
        "invalid or missing X-Admin-Token",
    )
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/v1/tasks", get(super::routes::list_tasks))
        .route("/api/v1/tasks/{name}", get(super::routes::get_task))
        .route("/api/v1/tasks/{name}/history", get(super::routes::task_history))
        .route("/api/v1/tasks/{name}/enable", post(super::routes::enable_task))
        .route("/api/v1/tasks/{name}/disable", post(super::routes::disable_task))
        .route("/api/v1/tasks/{name}/trigger", post(super::routes::trigger_task))
        .route("/api/v1/tasks/{name}/schedule", put(super::routes::set_schedule))
        .route("/api/v1/schedules/validate", post(super::routes::validate_schedule))
        .route_layer(axum::middleware::from_fn_with_state(shared.clone(), require_token));

    let public = Router::new().route("/health", get(super::routes::health_check));

    protected
        .merge(public)
        .layer(
            CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PUT,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .allow_origin(Any)
                .max_age(std::time::Duration::from_secs(3600)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Serve the admin API until `shutdown` is notified.
pub async fn start(config: &GatewayConfig, admin: SchedulerAdmin, shutdown: Arc<Notify>) -> anyhow::Result<()> {
    let state = AppState::new(admin, config);
    if state.admin_token.is_none() {
        tracing::warn!("admin_token is empty; the admin API accepts unauthenticated requests");
    }
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Admin API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await?;
    Ok(())
}
