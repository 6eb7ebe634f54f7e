//! # sitelens-server
//!
//! HTTP and WebSocket surface over a running [`ScanRuntime`], plus the
//! `sitelens` binary (`serve` and `ci`).
//!
//! [`ScanRuntime`]: sitelens_core::orchestration::ScanRuntime

pub mod ci;
pub mod handlers;
pub mod infra;
pub mod routes;

use axum::Router;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use infra::app_state::AppState;

/// Full application router with tracing and CORS applied.
pub fn create_app(state: AppState) -> Router {
    routes::create_router()
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
