use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::middleware::api_key_middleware;
use crate::state::AppState;

/// Create the proxy router: task routes behind the API key, health in the open
pub fn create_router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(handlers::health_check));

    let task_routes = Router::new()
        .route("/exe", post(handlers::start_exe))
        .route("/exe/:id", get(handlers::get_exe))
        .route("/exe/:id/cancel", post(handlers::cancel_exe))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(task_routes)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
