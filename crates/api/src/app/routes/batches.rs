//! Stock ledger seeding and inspection (dev/test).

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;

use stockhold_core::BatchId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(receive_batch))
        .route("/:id", get(get_batch))
}

pub async fn receive_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::ReceiveBatchRequest>,
) -> axum::response::Response {
    let batch = match body.into_domain(Utc::now()) {
        Ok(b) => b,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.engine.receive_batch(batch).await {
        Ok(stored) => (StatusCode::CREATED, Json(dto::StockBatchView::from(&stored))).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn get_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<i64>,
) -> axum::response::Response {
    let id = match BatchId::new(id) {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.engine.batch_detail(id).await {
        Ok(detail) => Json(dto::BatchDetailResponse::from(detail)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}
