use thiserror::Error;

use stockhold_core::{BatchId, DomainError, LineItemTempId, Quantity, ReservationId};

use crate::reservation::ReservationStatus;

pub type ReservationResult<T> = Result<T, ReservationError>;

/// Business failures of the reservation engine.
///
/// Each variant carries enough detail for the caller to render a specific
/// message (which field, which batch, which line item).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReservationError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// Nothing is allocatable for the requested product/warehouse.
    #[error("insufficient stock: requested {requested}, nothing allocatable")]
    InsufficientStock { requested: Quantity },

    /// A manual line asks for more than the batch can currently give.
    #[error("batch {batch_id}: requested {requested} exceeds allocatable {allocatable}")]
    ReservationConflict {
        batch_id: BatchId,
        requested: Quantity,
        allocatable: Quantity,
    },

    /// The batch does not exist for the product/warehouse (or is exhausted).
    #[error("batch {0} is not available for this product and warehouse")]
    UnknownBatch(BatchId),

    #[error("reservation for line item {line_item_temp_id} has expired")]
    ExpiredReservation { line_item_temp_id: LineItemTempId },

    #[error("reservation {reservation_id} is {status} and can no longer change")]
    ReservationNotActive {
        reservation_id: ReservationId,
        status: ReservationStatus,
    },

    /// Ledger drifted between hold and finalize.
    #[error("batch {batch_id}: {required} required at finalize, only {remaining} left")]
    InsufficientStockAtFinalize {
        batch_id: BatchId,
        required: Quantity,
        remaining: Quantity,
    },

    #[error("draft already finalized with a different line item mapping")]
    AlreadyConverted,

    #[error("not found: {0}")]
    NotFound(String),
}

impl ReservationError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

impl From<DomainError> for ReservationError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg)
            | DomainError::InvalidId(msg)
            | DomainError::Invariant(msg) => Self::Validation(msg),
            conflict @ DomainError::VersionConflict { .. } => Self::Validation(conflict.to_string()),
        }
    }
}
