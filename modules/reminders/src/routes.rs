//! Health and metrics endpoints

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use event_bus::AmqpBus;
use prometheus::Registry;
use serde_json::json;
use sqlx::PgPool;

use crate::config::SERVICE_NAME;

pub struct AppState {
    pub db: PgPool,
    /// `None` when running on the in-memory bus
    pub broker: Option<AmqpBus>,
    pub registry: Registry,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health_live() -> impl IntoResponse {
    Json(json!({ "status": "alive", "service": SERVICE_NAME }))
}

/// Ready once the database answers and the broker connection is up
async fn health_ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();
    let broker = state.broker.as_ref().map_or(true, AmqpBus::is_connected);

    let status = if database && broker {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "ready" } else { "unavailable" },
            "database": database,
            "broker": broker,
        })),
    )
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        event_consumer::metrics::render(&state.registry),
    )
}
