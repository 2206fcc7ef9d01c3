//! API routes for the CraftPay server.

pub mod payments;

use axum::http::Method;
use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Creates the main API router with all routes mounted.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_v1_routes(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Creates the v1 API routes.
fn api_v1_routes(state: AppState) -> Router {
    Router::new().nest("/payments", payments::router(state))
}

async fn health() -> &'static str {
    "ok"
}
