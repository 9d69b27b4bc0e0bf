//! HTTP route handlers.

pub mod health;
pub mod image;
pub mod metrics;

use axum::Router;

use crate::state::AppState;

/// Build the full application router, without middleware layers.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(image::router())
        .merge(health::router())
        .merge(metrics::router())
        .with_state(state)
}
