use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use stockhold_core::{
    BatchId, DraftInvoiceId, InvoiceItemId, LineItemTempId, ProductId, Quantity, ReservationId,
    WarehouseId,
};

use crate::allocation::AllocationOutcome;
use crate::error::{ReservationError, ReservationResult};
use crate::event::ReservationEvent;

/// Reservation lifecycle.
///
/// `Active` and `Extended` hold stock; the other three are terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Active,
    Extended,
    Expired,
    Converted,
    Cancelled,
}

impl ReservationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Expired | ReservationStatus::Converted | ReservationStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "ACTIVE",
            ReservationStatus::Extended => "EXTENDED",
            ReservationStatus::Expired => "EXPIRED",
            ReservationStatus::Converted => "CONVERTED",
            ReservationStatus::Cancelled => "CANCELLED",
        }
    }
}

impl core::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ReservationStatus {
    type Err = ReservationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "EXTENDED" => Ok(Self::Extended),
            "EXPIRED" => Ok(Self::Expired),
            "CONVERTED" => Ok(Self::Converted),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(ReservationError::validation(format!(
                "unknown reservation status {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationMethod {
    Fifo,
    Manual,
}

impl AllocationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationMethod::Fifo => "FIFO",
            AllocationMethod::Manual => "MANUAL",
        }
    }
}

/// One `{batch, quantity}` line of a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationLine {
    pub batch_id: BatchId,
    pub quantity: Quantity,
}

/// A time-boxed hold on specific batch quantities for one draft line item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub draft_invoice_id: Option<DraftInvoiceId>,
    pub line_item_temp_id: LineItemTempId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub unit: String,
    pub requested_quantity: Quantity,
    pub allocations: Vec<AllocationLine>,
    pub method: AllocationMethod,
    pub outcome: AllocationOutcome,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub invoice_item_id: Option<InvoiceItemId>,
}

impl Reservation {
    pub fn total_reserved(&self) -> Quantity {
        self.allocations.iter().map(|a| a.quantity).sum()
    }

    pub fn quantity_for(&self, batch_id: BatchId) -> Quantity {
        self.allocations
            .iter()
            .filter(|a| a.batch_id == batch_id)
            .map(|a| a.quantity)
            .sum()
    }

    pub fn batch_ids(&self) -> Vec<BatchId> {
        let mut ids: Vec<BatchId> = self.allocations.iter().map(|a| a.batch_id).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn is_live_status(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether this reservation counts against batch availability at `now`.
    ///
    /// A live reservation past its expiry stops counting immediately, even if
    /// the sweeper has not flipped it to `EXPIRED` yet.
    pub fn is_holding(&self, now: DateTime<Utc>) -> bool {
        self.is_live_status() && !self.is_past_expiry(now)
    }

    pub fn belongs_to(&self, draft: DraftInvoiceId, line: Option<&LineItemTempId>) -> bool {
        self.draft_invoice_id == Some(draft) && line.is_none_or(|l| &self.line_item_temp_id == l)
    }

    /// Same `(draft, line)` key. Reservations made before the draft was
    /// saved only match other draftless ones.
    pub fn is_line(&self, draft: Option<DraftInvoiceId>, line: &LineItemTempId) -> bool {
        self.draft_invoice_id == draft && &self.line_item_temp_id == line
    }

    fn ensure_live(&self) -> ReservationResult<()> {
        if self.status.is_terminal() {
            return Err(ReservationError::ReservationNotActive {
                reservation_id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Push expiry out to `now + by`.
    pub fn extend(&mut self, now: DateTime<Utc>, by: Duration) -> ReservationResult<ReservationEvent> {
        self.ensure_live()?;
        if self.is_past_expiry(now) {
            return Err(ReservationError::ExpiredReservation {
                line_item_temp_id: self.line_item_temp_id.clone(),
            });
        }
        if by <= Duration::zero() {
            return Err(ReservationError::validation("extend_minutes must be greater than zero"));
        }

        self.status = ReservationStatus::Extended;
        self.expires_at = now + by;
        self.updated_at = now;
        Ok(ReservationEvent::Extended {
            reservation_id: self.id,
            expires_at: self.expires_at,
            occurred_at: now,
        })
    }

    /// Release the hold on caller request.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> ReservationResult<ReservationEvent> {
        self.ensure_live()?;
        self.status = ReservationStatus::Cancelled;
        self.updated_at = now;
        Ok(ReservationEvent::Cancelled {
            reservation_id: self.id,
            occurred_at: now,
        })
    }

    /// Release the hold because a newer allocation for the same line replaces it.
    pub fn supersede(
        &mut self,
        now: DateTime<Utc>,
        superseded_by: ReservationId,
    ) -> ReservationResult<ReservationEvent> {
        self.ensure_live()?;
        self.status = ReservationStatus::Cancelled;
        self.updated_at = now;
        Ok(ReservationEvent::Superseded {
            reservation_id: self.id,
            superseded_by,
            occurred_at: now,
        })
    }

    /// Sweep transition. Only valid once `expires_at` has passed.
    pub fn expire(&mut self, now: DateTime<Utc>) -> ReservationResult<ReservationEvent> {
        self.ensure_live()?;
        if !self.is_past_expiry(now) {
            return Err(ReservationError::validation(format!(
                "reservation {} does not expire until {}",
                self.id, self.expires_at
            )));
        }
        self.status = ReservationStatus::Expired;
        self.updated_at = now;
        Ok(ReservationEvent::Expired {
            reservation_id: self.id,
            occurred_at: now,
        })
    }

    /// Finalize transition (irreversible).
    pub fn convert(
        &mut self,
        now: DateTime<Utc>,
        invoice_item_id: InvoiceItemId,
    ) -> ReservationResult<ReservationEvent> {
        self.ensure_live()?;
        if self.is_past_expiry(now) {
            return Err(ReservationError::ExpiredReservation {
                line_item_temp_id: self.line_item_temp_id.clone(),
            });
        }
        self.status = ReservationStatus::Converted;
        self.invoice_item_id = Some(invoice_item_id);
        self.updated_at = now;
        Ok(ReservationEvent::Converted {
            reservation_id: self.id,
            invoice_item_id,
            occurred_at: now,
        })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn reservation(
        draft: Option<i64>,
        line: &str,
        lines: &[(i64, u32)],
        created_at: DateTime<Utc>,
        ttl_minutes: i64,
    ) -> Reservation {
        Reservation {
            id: ReservationId::new(),
            draft_invoice_id: draft.map(|d| DraftInvoiceId::new(d).unwrap()),
            line_item_temp_id: LineItemTempId::new(line).unwrap(),
            product_id: ProductId::new(1).unwrap(),
            warehouse_id: WarehouseId::new(1).unwrap(),
            unit: "pcs".to_string(),
            requested_quantity: lines.iter().map(|(_, q)| Quantity::from_int(*q)).sum(),
            allocations: lines
                .iter()
                .map(|(b, q)| AllocationLine {
                    batch_id: BatchId::new(*b).unwrap(),
                    quantity: Quantity::from_int(*q),
                })
                .collect(),
            method: AllocationMethod::Fifo,
            outcome: AllocationOutcome::Full,
            status: ReservationStatus::Active,
            created_at,
            updated_at: created_at,
            expires_at: created_at + Duration::minutes(ttl_minutes),
            invoice_item_id: None,
        }
    }
}
