//! The HTTP + SSE server shell (spec §6.2): five routes over one
//! in-memory map of running environments, event log persistence on
//! teardown, and the background artifact refresher.

pub mod config;
pub mod handlers;
pub mod logwriter;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Builds the application router. Shared between `main` and integration
/// tests (the admin-api crate's `create_router`/`create_test_router`
/// split).
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/environments", post(handlers::environments::create_environment))
        .route(
            "/environments/{id}",
            get(handlers::environments::get_environment).delete(handlers::environments::delete_environment),
        )
        .route(
            "/environments/{id}/events",
            get(handlers::events::stream_events).post(handlers::events::inject_event),
        )
        .route("/environments/{id}/log", get(handlers::log::get_log))
        .with_state(state);

    Router::new()
        .route("/health", get(handlers::environments::health))
        .merge(api_routes)
        .layer(TraceLayer::new_for_http())
}
