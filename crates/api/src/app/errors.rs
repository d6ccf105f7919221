use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::{Value, json};

use stockhold_core::DomainError;
use stockhold_infra::{EngineError, StoreError};
use stockhold_reservations::ReservationError;

pub fn engine_error_to_response(err: EngineError) -> axum::response::Response {
    match err {
        EngineError::Reservation(e) => reservation_error_to_response(e),
        EngineError::Store(e) => store_error_to_response(e),
    }
}

pub fn reservation_error_to_response(err: ReservationError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        ReservationError::Validation(_) => json_error(StatusCode::BAD_REQUEST, "validation_error", message),
        ReservationError::InsufficientStock { requested } => json_error_with(
            StatusCode::CONFLICT,
            "insufficient_stock",
            message,
            json!({ "requested": requested }),
        ),
        ReservationError::ReservationConflict {
            batch_id,
            requested,
            allocatable,
        } => json_error_with(
            StatusCode::CONFLICT,
            "reservation_conflict",
            message,
            json!({ "batchId": batch_id, "requested": requested, "allocatable": allocatable }),
        ),
        ReservationError::UnknownBatch(batch_id) => json_error_with(
            StatusCode::UNPROCESSABLE_ENTITY,
            "unknown_batch",
            message,
            json!({ "batchId": batch_id }),
        ),
        ReservationError::ExpiredReservation { line_item_temp_id } => json_error_with(
            StatusCode::GONE,
            "expired_reservation",
            message,
            json!({ "lineItemTempId": line_item_temp_id }),
        ),
        ReservationError::ReservationNotActive {
            reservation_id,
            status,
        } => json_error_with(
            StatusCode::CONFLICT,
            "reservation_not_active",
            message,
            json!({ "reservationId": reservation_id, "status": status }),
        ),
        ReservationError::InsufficientStockAtFinalize {
            batch_id,
            required,
            remaining,
        } => json_error_with(
            StatusCode::CONFLICT,
            "insufficient_stock_at_finalize",
            message,
            json!({ "batchId": batch_id, "required": required, "remaining": remaining }),
        ),
        ReservationError::AlreadyConverted => json_error(StatusCode::CONFLICT, "already_converted", message),
        ReservationError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", message),
    }
}

fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::Concurrency(msg) => json_error(StatusCode::CONFLICT, "concurrency_conflict", msg),
        StoreError::Unavailable(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "transient_failure", msg),
        StoreError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        StoreError::Corrupt(msg) => {
            tracing::error!(error = %msg, "store returned corrupt data");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    reservation_error_to_response(err.into())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "success": false,
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Like [`json_error`], with structured detail (which batch, which line).
pub fn json_error_with(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
    details: Value,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "success": false,
            "error": code,
            "message": message.into(),
            "details": details,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use stockhold_core::{BatchId, Quantity};

    use super::*;

    #[test]
    fn maps_business_errors_to_status_codes() {
        let cases = [
            (ReservationError::validation("x"), StatusCode::BAD_REQUEST),
            (
                ReservationError::InsufficientStock {
                    requested: Quantity::from_int(1),
                },
                StatusCode::CONFLICT,
            ),
            (
                ReservationError::UnknownBatch(BatchId::new(1).unwrap()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (ReservationError::AlreadyConverted, StatusCode::CONFLICT),
            (ReservationError::not_found("x"), StatusCode::NOT_FOUND),
        ];
        for (err, status) in cases {
            assert_eq!(reservation_error_to_response(err).status(), status);
        }
    }

    #[test]
    fn transient_store_failures_are_503() {
        let res = engine_error_to_response(EngineError::Store(StoreError::Unavailable("down".into())));
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
