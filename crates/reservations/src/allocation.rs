//! FIFO and manual allocation over an availability view.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use stockhold_core::{
    BatchId, DraftInvoiceId, LineItemTempId, ProductId, Quantity, ReservationId, WarehouseId,
};

use crate::availability::BatchAvailability;
use crate::error::{ReservationError, ReservationResult};
use crate::event::ReservationEvent;
use crate::reservation::{AllocationLine, AllocationMethod, Reservation, ReservationStatus};

/// How much of the request an allocation covers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationOutcome {
    Full,
    Partial,
    None,
}

impl AllocationOutcome {
    pub fn classify(requested: Quantity, allocated: Quantity) -> Self {
        if allocated.is_zero() {
            AllocationOutcome::None
        } else if allocated < requested {
            AllocationOutcome::Partial
        } else {
            AllocationOutcome::Full
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationOutcome::Full => "FULL",
            AllocationOutcome::Partial => "PARTIAL",
            AllocationOutcome::None => "NONE",
        }
    }
}

/// Caller-declared manual line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualLine {
    pub batch_id: BatchId,
    pub quantity: Quantity,
}

/// Result of an allocation decision, before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPlan {
    pub method: AllocationMethod,
    pub requested: Quantity,
    pub lines: Vec<AllocationLine>,
    pub outcome: AllocationOutcome,
}

impl AllocationPlan {
    pub fn total(&self) -> Quantity {
        self.lines.iter().map(|l| l.quantity).sum()
    }

    /// Advisory message for the caller. Partial allocations always say "partial".
    pub fn message(&self) -> String {
        let total = self.total();
        match self.outcome {
            AllocationOutcome::Full => format!(
                "reserved {} from {} batch(es)",
                total,
                self.lines.len()
            ),
            AllocationOutcome::Partial => format!(
                "partial allocation: reserved {} of {} requested from {} batch(es)",
                total,
                self.requested,
                self.lines.len()
            ),
            AllocationOutcome::None => format!("no stock allocatable for {} requested", self.requested),
        }
    }

    /// Materialize the plan as a new `ACTIVE` reservation plus its audit event.
    #[allow(clippy::too_many_arguments)]
    pub fn into_reservation(
        self,
        draft_invoice_id: Option<DraftInvoiceId>,
        line_item_temp_id: LineItemTempId,
        product_id: ProductId,
        warehouse_id: WarehouseId,
        unit: String,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> ReservationResult<(Reservation, ReservationEvent)> {
        if self.outcome == AllocationOutcome::None || self.lines.is_empty() {
            return Err(ReservationError::InsufficientStock {
                requested: self.requested,
            });
        }

        let reservation = Reservation {
            id: ReservationId::new(),
            draft_invoice_id,
            line_item_temp_id,
            product_id,
            warehouse_id,
            unit,
            requested_quantity: self.requested,
            allocations: self.lines,
            method: self.method,
            outcome: self.outcome,
            status: ReservationStatus::Active,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            invoice_item_id: None,
        };
        let event = ReservationEvent::Created {
            reservation_id: reservation.id,
            draft_invoice_id,
            line_item_temp_id: reservation.line_item_temp_id.clone(),
            allocations: reservation.allocations.clone(),
            expires_at: reservation.expires_at,
            occurred_at: now,
        };
        Ok((reservation, event))
    }
}

/// Greedy oldest-first allocation.
///
/// `view` must already be in FIFO order (as returned by
/// [`compute_availability`](crate::availability::compute_availability)).
/// Takes `min(remaining, allocatable)` per batch until the request is covered
/// or batches run out. A shortfall is a `Partial` plan; nothing at all is an
/// `InsufficientStock` error.
pub fn fifo_select(view: &[BatchAvailability], required: Quantity) -> ReservationResult<AllocationPlan> {
    if required.is_zero() {
        return Err(ReservationError::validation("required_quantity must be greater than zero"));
    }

    let mut remaining = required;
    let mut lines = Vec::new();

    for batch in view {
        if remaining.is_zero() {
            break;
        }
        if batch.quantity_allocatable.is_zero() {
            continue;
        }
        let take = remaining.min(batch.quantity_allocatable);
        lines.push(AllocationLine {
            batch_id: batch.batch_id,
            quantity: take,
        });
        remaining = remaining.saturating_sub(take);
    }

    let allocated: Quantity = lines.iter().map(|l: &AllocationLine| l.quantity).sum();
    let outcome = AllocationOutcome::classify(required, allocated);
    if outcome == AllocationOutcome::None {
        return Err(ReservationError::InsufficientStock { requested: required });
    }

    Ok(AllocationPlan {
        method: AllocationMethod::Fifo,
        requested: required,
        lines,
        outcome,
    })
}

/// All-or-nothing validation of caller-chosen batch quantities.
///
/// Every batch must appear in `view` (same product and warehouse, not
/// exhausted) and every quantity must be positive and within that batch's
/// allocatable quantity. The first violation rejects the whole request.
pub fn validate_manual(view: &[BatchAvailability], lines: &[ManualLine]) -> ReservationResult<AllocationPlan> {
    if lines.is_empty() {
        return Err(ReservationError::validation("allocations cannot be empty"));
    }

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(lines.len());

    for line in lines {
        if !seen.insert(line.batch_id) {
            return Err(ReservationError::validation(format!(
                "batch {} appears more than once",
                line.batch_id
            )));
        }
        if line.quantity.is_zero() {
            return Err(ReservationError::validation(format!(
                "quantity for batch {} must be greater than zero",
                line.batch_id
            )));
        }

        let batch = view
            .iter()
            .find(|b| b.batch_id == line.batch_id)
            .ok_or(ReservationError::UnknownBatch(line.batch_id))?;

        if line.quantity > batch.quantity_allocatable {
            return Err(ReservationError::ReservationConflict {
                batch_id: line.batch_id,
                requested: line.quantity,
                allocatable: batch.quantity_allocatable,
            });
        }

        out.push(AllocationLine {
            batch_id: line.batch_id,
            quantity: line.quantity,
        });
    }

    let total: Quantity = out.iter().map(|l| l.quantity).sum();
    Ok(AllocationPlan {
        method: AllocationMethod::Manual,
        requested: total,
        lines: out,
        outcome: AllocationOutcome::Full,
    })
}
