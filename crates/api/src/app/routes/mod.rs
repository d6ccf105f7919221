use axum::{Router, routing::get};

pub mod batches;
pub mod reservations;
pub mod system;

/// Router for all service endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/system/sweeper", get(system::sweeper))
        .nest("/batch-reservations", reservations::router())
        .nest("/stock-batches", batches::router())
}
