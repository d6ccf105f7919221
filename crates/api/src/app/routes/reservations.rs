use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use stockhold_core::{
    DraftInvoiceId, Event, LineItemTempId, ProductId, Quantity, ReservationId, WarehouseId,
};
use stockhold_infra::with_retry;
use stockhold_reservations::ReservationEvent;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

const DEFAULT_EXPIRING_WINDOW_MINUTES: i64 = 10;

pub fn router() -> Router {
    Router::new()
        .route("/fifo", post(allocate_fifo))
        .route("/manual", post(allocate_manual))
        .route("/available", get(available_batches))
        .route("/summary", get(summary))
        .route("/expiring", get(expiring))
        .route("/extend", post(extend))
        .route("/finalize", post(finalize))
        .route("/line-item", delete(cancel_by_line_item))
        .route("/draft/:draft_id", get(list_by_draft).delete(cancel_by_draft))
        .route("/:id", get(get_reservation).delete(cancel))
        .route("/:id/history", get(history))
}

fn parse_reservation_id(raw: &str) -> Result<ReservationId, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid reservation id"))
}

fn parse_draft_id(raw: i64) -> Result<DraftInvoiceId, axum::response::Response> {
    DraftInvoiceId::new(raw).map_err(errors::domain_error_to_response)
}

pub async fn allocate_fifo(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::FifoAllocateRequest>,
) -> axum::response::Response {
    let request = match body.into_domain() {
        Ok(r) => r,
        Err(e) => return errors::domain_error_to_response(e),
    };

    let receipt = match with_retry(&services.retry, "allocate_fifo", || {
        let engine = services.engine.clone();
        let request = request.clone();
        async move { engine.allocate_fifo(request).await }
    })
    .await
    {
        Ok(r) => r,
        Err(e) => return errors::engine_error_to_response(e),
    };

    (StatusCode::CREATED, Json(dto::AllocationResponse::from(receipt))).into_response()
}

pub async fn allocate_manual(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::ManualAllocateRequest>,
) -> axum::response::Response {
    let request = match body.into_domain() {
        Ok(r) => r,
        Err(e) => return errors::domain_error_to_response(e),
    };

    let receipt = match with_retry(&services.retry, "allocate_manual", || {
        let engine = services.engine.clone();
        let request = request.clone();
        async move { engine.allocate_manual(request).await }
    })
    .await
    {
        Ok(r) => r,
        Err(e) => return errors::engine_error_to_response(e),
    };

    (StatusCode::CREATED, Json(dto::AllocationResponse::from(receipt))).into_response()
}

pub async fn available_batches(
    Extension(services): Extension<Arc<AppServices>>,
    Query(q): Query<dto::AvailableQuery>,
) -> axum::response::Response {
    let (product_id, warehouse_id, draft) = match (
        ProductId::new(q.product_id),
        WarehouseId::new(q.warehouse_id),
        DraftInvoiceId::from_wire(q.draft_invoice_id),
    ) {
        (Ok(p), Ok(w), Ok(d)) => (p, w, d),
        (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => return errors::domain_error_to_response(e),
    };

    let rows = match services.engine.available_batches(product_id, warehouse_id, draft).await {
        Ok(rows) => rows,
        Err(e) => return errors::engine_error_to_response(e),
    };

    let total_allocatable: Quantity = rows.iter().map(|r| r.quantity_allocatable).sum();
    Json(dto::AvailableBatchesResponse {
        product_id,
        warehouse_id,
        batches: rows.into_iter().map(dto::AvailableBatchView::from).collect(),
        total_allocatable,
    })
    .into_response()
}

pub async fn summary(
    Extension(services): Extension<Arc<AppServices>>,
    Query(q): Query<dto::SummaryQuery>,
) -> axum::response::Response {
    let (product_id, warehouse_id) = match (ProductId::new(q.product_id), WarehouseId::new(q.warehouse_id)) {
        (Ok(p), Ok(w)) => (p, w),
        (Err(e), _) | (_, Err(e)) => return errors::domain_error_to_response(e),
    };

    match services.engine.summary(product_id, warehouse_id).await {
        Ok(s) => Json(dto::SummaryResponse::new(product_id, warehouse_id, s)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn expiring(
    Extension(services): Extension<Arc<AppServices>>,
    Query(q): Query<dto::ExpiringQuery>,
) -> axum::response::Response {
    let within = q.within_minutes.unwrap_or(DEFAULT_EXPIRING_WINDOW_MINUTES);

    match services.engine.expiring(within).await {
        Ok(rs) => Json(serde_json::json!({
            "withinMinutes": within,
            "reservations": rs.iter().map(dto::ReservationView::from).collect::<Vec<_>>(),
        }))
        .into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn extend(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::ExtendRequest>,
) -> axum::response::Response {
    let draft = match DraftInvoiceId::from_wire(body.draft_invoice_id) {
        Ok(d) => d,
        Err(e) => return errors::domain_error_to_response(e),
    };
    let line = match body.line_item_temp_id.map(LineItemTempId::new).transpose() {
        Ok(l) => l,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.engine.extend(draft, line, body.extend_minutes).await {
        Ok(extended) => Json(dto::ExtendResponse::from(extended)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn finalize(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::FinalizeRequestBody>,
) -> axum::response::Response {
    let request = match body.into_domain() {
        Ok(r) => r,
        Err(e) => return errors::domain_error_to_response(e),
    };

    let receipt = match with_retry(&services.retry, "finalize", || {
        let engine = services.engine.clone();
        let request = request.clone();
        async move { engine.finalize(request).await }
    })
    .await
    {
        Ok(r) => r,
        Err(e) => return errors::engine_error_to_response(e),
    };

    let status = if receipt.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    (status, Json(dto::FinalizeResponse::from(receipt))).into_response()
}

pub async fn cancel(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_reservation_id(&id) {
        Ok(id) => id,
        Err(res) => return res,
    };

    match services.engine.cancel(id).await {
        Ok(r) => Json(serde_json::json!({
            "success": true,
            "reservation": dto::ReservationView::from(&r),
        }))
        .into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn cancel_by_line_item(
    Extension(services): Extension<Arc<AppServices>>,
    Query(q): Query<dto::LineItemQuery>,
) -> axum::response::Response {
    let draft = match DraftInvoiceId::from_wire(q.draft_invoice_id) {
        Ok(d) => d,
        Err(e) => return errors::domain_error_to_response(e),
    };
    let line = match LineItemTempId::new(q.line_item_temp_id) {
        Ok(l) => l,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.engine.cancel_by_line_item(draft, &line).await {
        Ok(count) => Json(serde_json::json!({ "success": true, "count": count })).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn cancel_by_draft(
    Extension(services): Extension<Arc<AppServices>>,
    Path(draft_id): Path<i64>,
) -> axum::response::Response {
    let draft = match parse_draft_id(draft_id) {
        Ok(d) => d,
        Err(res) => return res,
    };

    match services.engine.cancel_by_draft(draft).await {
        Ok(count) => Json(serde_json::json!({ "success": true, "count": count })).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn list_by_draft(
    Extension(services): Extension<Arc<AppServices>>,
    Path(draft_id): Path<i64>,
    Query(q): Query<dto::DraftQuery>,
) -> axum::response::Response {
    let draft = match parse_draft_id(draft_id) {
        Ok(d) => d,
        Err(res) => return res,
    };
    let line = match q.line_item_temp_id.map(LineItemTempId::new).transpose() {
        Ok(l) => l,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.engine.list_by_draft(draft, line.as_ref()).await {
        Ok(d) => Json(dto::DraftReservationsResponse::from(d)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn get_reservation(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_reservation_id(&id) {
        Ok(id) => id,
        Err(res) => return res,
    };

    match services.engine.get(id).await {
        Ok(r) => Json(dto::ReservationView::from(&r)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn history(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_reservation_id(&id) {
        Ok(id) => id,
        Err(res) => return res,
    };

    let events = match services.engine.history(id).await {
        Ok(events) => events,
        Err(e) => return errors::engine_error_to_response(e),
    };

    Json(dto::HistoryResponse {
        reservation_id: id,
        events: events.into_iter().map(history_entry).collect(),
    })
    .into_response()
}

fn history_entry(event: ReservationEvent) -> dto::HistoryEntry {
    dto::HistoryEntry {
        event_type: event.event_type(),
        occurred_at: event.occurred_at(),
        payload: event,
    }
}
