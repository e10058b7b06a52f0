use axum::{
    middleware,
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::identity::identity_middleware;
use super::ws::ws_handler;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let gadget_routes = Router::new()
        .route("/gadget", get(handlers::gadget_status))
        .route("/gadget/activate", post(handlers::gadget_activate))
        .route("/gadget/deactivate", post(handlers::gadget_deactivate))
        .route(
            "/gadget/lock",
            post(handlers::gadget_lock).delete(handlers::gadget_unlock),
        )
        // WebSocket endpoint for real-time events
        .route("/ws", any(ws_handler))
        .layer(middleware::from_fn(identity_middleware));

    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .merge(gadget_routes);

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
