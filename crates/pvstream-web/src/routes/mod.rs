//! HTTP route handlers for the pvstream API.
//!
//! All routes live under `/api`.

pub mod history;
pub mod values;

use crate::{AppState, ServerStatistics};
use axum::{extract::State, response::Json, routing::get, Router};
use tower_http::cors::CorsLayer;

/// Create the main Axum router with all routes.
///
/// Routes are organized as:
/// - `/api/pv-history/*pv` - history queries
/// - `/api/pvs`, `/api/pv/*pv` - variable list, reads and writes
/// - `/api/stats` - server statistics
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api", api_routes())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(history::routes())
        .merge(values::routes())
        .route("/stats", get(stats_handler))
}

/// Handler for `/api/stats`.
async fn stats_handler(State(state): State<AppState>) -> Json<ServerStatistics> {
    Json(state.statistics())
}
