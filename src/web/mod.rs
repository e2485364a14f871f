// Web server: Axum HTTP surface for push ingestion and liveness.
//
// Routes:
//   GET  /health           always, for container orchestration
//   POST /webhook/twitter  only when the ingest mode enables the webhook
//
// Nothing about pipeline internals is exposed here beyond up/down.

use anyhow::Result;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod auth;
pub mod webhook;

pub use webhook::WebhookState;

/// Path the upstream pushes to.
pub const WEBHOOK_PATH: &str = "/webhook/twitter";

/// Build the router. Passing `None` leaves the webhook route unregistered.
pub fn build_router(webhook: Option<WebhookState>) -> Router {
    let mut app = Router::new().route("/health", get(health));

    if let Some(state) = webhook {
        let hooks = Router::new()
            .route(WEBHOOK_PATH, post(webhook::receive))
            .with_state(state);
        app = app.merge(hooks);
    }

    app.layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` is cancelled. In-flight requests finish first.
pub async fn serve(app: Router, bind: &str, port: u16, shutdown: CancellationToken) -> Result<()> {
    let addr = format!("{bind}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("tweetwatch listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Liveness check. Always 200 OK.
async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({ "status": "ok" })),
    )
}

/// Typed JSON error response helper.
pub fn api_error(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(serde_json::json!({ "error": message }))).into_response()
}
