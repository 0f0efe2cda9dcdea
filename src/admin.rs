//! Introspection endpoints over HTTP.
//!
//! Requires the `http` feature.
//!
//! ## Routes
//!
//! - `GET /healthz` returns `{ "connected": bool, "state": {...} }`, with
//!   `503` while the broker connection is down.
//! - `GET /subscriptions` returns `{ "consumers": n }`.
//!
//! ```ignore
//! let reconciler = Arc::new(Reconciler::new(connection, cleaner, sink, defaults));
//! tokio::spawn(admin::serve(reconciler.clone(), "0.0.0.0:8080"));
//! ```

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::broker::Connector;
use crate::reconciler::Reconciler;

/// Build an axum `Router` exposing the engine's health and consumer count.
pub fn router<K: Connector + 'static>(reconciler: Arc<Reconciler<K>>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler::<K>))
        .route("/subscriptions", get(subscriptions_handler::<K>))
        .with_state(reconciler)
}

/// Serve the introspection router at `addr` (e.g. `"0.0.0.0:8080"`).
pub async fn serve<K: Connector + 'static>(
    reconciler: Arc<Reconciler<K>>,
    addr: &str,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "admin endpoint listening");
    axum::serve(listener, router(reconciler)).await
}

async fn health_handler<K: Connector + 'static>(
    State(reconciler): State<Arc<Reconciler<K>>>,
) -> impl IntoResponse {
    let connection = reconciler.connection();
    let connected = connection.is_connected();
    let status = if connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "connected": connected,
        "state": connection.state(),
        "epoch": connection.epoch(),
    });
    (status, Json(body))
}

async fn subscriptions_handler<K: Connector + 'static>(
    State(reconciler): State<Arc<Reconciler<K>>>,
) -> impl IntoResponse {
    Json(json!({ "consumers": reconciler.consumer_count().await }))
}
