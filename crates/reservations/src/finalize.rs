//! Finalize planning.
//!
//! Turns a draft's live reservations into consumption records, batch
//! deductions and status conversions. The plan is computed up front and
//! either applied as one atomic write or discarded, so a failure here leaves
//! every reservation and batch untouched.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockhold_core::{BatchId, DraftInvoiceId, ExpectedVersion, InvoiceItemId, LineItemTempId, Quantity};

use crate::batch::StockBatch;
use crate::consumption::ConsumptionRecord;
use crate::error::{ReservationError, ReservationResult};
use crate::event::ReservationEvent;
use crate::reservation::{Reservation, ReservationStatus};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineItemMapping {
    pub line_item_temp_id: LineItemTempId,
    pub invoice_item_id: InvoiceItemId,
}

/// Status the invoice moves to when its draft is finalized.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Proforma,
    Issued,
    Sent,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Proforma => "proforma",
            InvoiceStatus::Issued => "issued",
            InvoiceStatus::Sent => "sent",
        }
    }
}

impl core::str::FromStr for InvoiceStatus {
    type Err = ReservationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proforma" => Ok(Self::Proforma),
            "issued" => Ok(Self::Issued),
            "sent" => Ok(Self::Sent),
            other => Err(ReservationError::validation(format!(
                "target_status must be one of proforma, issued, sent (got {other:?})"
            ))),
        }
    }
}

/// Per-batch stock movement of one finalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDeduction {
    pub batch_id: BatchId,
    pub quantity: Quantity,
    pub consumed_before: Quantity,
    pub consumed_after: Quantity,
    #[serde(skip)]
    pub expected_version: Option<u64>,
}

impl BatchDeduction {
    pub fn expected(&self) -> ExpectedVersion {
        match self.expected_version {
            Some(v) => ExpectedVersion::Exact(v),
            None => ExpectedVersion::Any,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizePlan {
    pub converted: Vec<Reservation>,
    pub events: Vec<ReservationEvent>,
    pub consumptions: Vec<ConsumptionRecord>,
    pub deductions: Vec<BatchDeduction>,
    /// Mapped line items that carried no stock hold at all.
    pub unreserved_lines: Vec<LineItemTempId>,
}

fn validate_mappings(mappings: &[LineItemMapping]) -> ReservationResult<()> {
    if mappings.is_empty() {
        return Err(ReservationError::validation("line_item_mappings cannot be empty"));
    }
    let mut lines = HashSet::new();
    let mut items = HashSet::new();
    for m in mappings {
        if !lines.insert(&m.line_item_temp_id) {
            return Err(ReservationError::validation(format!(
                "line item {} is mapped more than once",
                m.line_item_temp_id
            )));
        }
        if !items.insert(m.invoice_item_id) {
            return Err(ReservationError::validation(format!(
                "invoice item {} is mapped more than once",
                m.invoice_item_id
            )));
        }
    }
    Ok(())
}

/// Pick the reservation that finalize should act on for one line item.
///
/// A live one wins; otherwise the most recently updated terminal one explains
/// why the line cannot be finalized.
fn current_for_line<'a>(draft_reservations: &'a [Reservation], line: &LineItemTempId) -> Option<&'a Reservation> {
    let mut candidates: Vec<&Reservation> = draft_reservations
        .iter()
        .filter(|r| &r.line_item_temp_id == line)
        .collect();
    if let Some(live) = candidates.iter().find(|r| r.is_live_status()) {
        return Some(live);
    }
    candidates.sort_by_key(|r| r.updated_at);
    candidates.last().copied()
}

/// Build the finalize plan for `draft`.
///
/// `draft_reservations` are all reservations of the draft; `batches` must
/// contain every batch those reservations reference, read fresh from the
/// ledger. Cost is taken from `batches`, i.e. at finalize time.
pub fn plan_finalize(
    draft: DraftInvoiceId,
    mappings: &[LineItemMapping],
    draft_reservations: &[Reservation],
    batches: &[StockBatch],
    skip_stock_deduction: bool,
    now: DateTime<Utc>,
) -> ReservationResult<FinalizePlan> {
    validate_mappings(mappings)?;

    let mut converted = Vec::new();
    let mut events = Vec::new();
    let mut unreserved_lines = Vec::new();

    for m in mappings {
        let Some(current) = current_for_line(draft_reservations, &m.line_item_temp_id) else {
            unreserved_lines.push(m.line_item_temp_id.clone());
            continue;
        };

        match current.status {
            ReservationStatus::Active | ReservationStatus::Extended => {}
            ReservationStatus::Expired => {
                return Err(ReservationError::ExpiredReservation {
                    line_item_temp_id: m.line_item_temp_id.clone(),
                });
            }
            ReservationStatus::Converted => return Err(ReservationError::AlreadyConverted),
            ReservationStatus::Cancelled => {
                return Err(ReservationError::ReservationNotActive {
                    reservation_id: current.id,
                    status: current.status,
                });
            }
        }

        let mut r = current.clone();
        events.push(r.convert(now, m.invoice_item_id)?);
        converted.push(r);
    }

    let by_id: HashMap<BatchId, &StockBatch> = batches.iter().map(|b| (b.id, b)).collect();

    // (invoice item, batch) -> record; one record per pair.
    let mut records: BTreeMap<(InvoiceItemId, BatchId), ConsumptionRecord> = BTreeMap::new();
    let mut per_batch: BTreeMap<BatchId, Quantity> = BTreeMap::new();

    for r in &converted {
        let invoice_item_id = r
            .invoice_item_id
            .ok_or_else(|| ReservationError::validation("converted reservation without invoice item"))?;
        for line in &r.allocations {
            let batch = by_id
                .get(&line.batch_id)
                .ok_or(ReservationError::UnknownBatch(line.batch_id))?;
            *per_batch.entry(line.batch_id).or_default() += line.quantity;
            records
                .entry((invoice_item_id, line.batch_id))
                .and_modify(|rec| rec.quantity += line.quantity)
                .or_insert_with(|| ConsumptionRecord {
                    invoice_item_id,
                    batch_id: line.batch_id,
                    quantity: line.quantity,
                    unit_cost_at_consumption: batch.unit_cost,
                    draft_invoice_id: draft,
                    reservation_id: r.id,
                    consumed_at: now,
                });
        }
    }

    // Records are kept either way; only the ledger increment is skipped.
    if skip_stock_deduction {
        per_batch.clear();
    }

    let mut deductions = Vec::with_capacity(per_batch.len());
    for (batch_id, required) in per_batch {
        let batch = by_id
            .get(&batch_id)
            .ok_or(ReservationError::UnknownBatch(batch_id))?;
        let remaining = batch.remaining();
        if required > remaining {
            return Err(ReservationError::InsufficientStockAtFinalize {
                batch_id,
                required,
                remaining,
            });
        }
        let consumed_after = batch.consumed_after(required)?;
        deductions.push(BatchDeduction {
            batch_id,
            quantity: required,
            consumed_before: batch.quantity_consumed,
            consumed_after,
            expected_version: Some(batch.version),
        });
    }

    Ok(FinalizePlan {
        converted,
        events,
        consumptions: records.into_values().collect(),
        deductions,
        unreserved_lines,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rust_decimal::Decimal;

    use super::*;
    use crate::batch::fixtures::batch;
    use crate::reservation::fixtures::reservation;

    fn mapping(line: &str, item: i64) -> LineItemMapping {
        LineItemMapping {
            line_item_temp_id: LineItemTempId::new(line).unwrap(),
            invoice_item_id: InvoiceItemId::new(item).unwrap(),
        }
    }

    fn draft() -> DraftInvoiceId {
        DraftInvoiceId::new(1).unwrap()
    }

    #[test]
    fn converts_and_deducts_with_cost_at_finalize() {
        let now = Utc::now();
        let mut a = batch(1, 500, (2024, 1, 1));
        a.unit_cost = Decimal::new(999, 2);
        a.version = 4;
        let r = reservation(Some(1), "l1", &[(1, 100)], now, 30);

        let plan = plan_finalize(draft(), &[mapping("l1", 10)], &[r.clone()], &[a], false, now).unwrap();

        assert_eq!(plan.converted.len(), 1);
        assert_eq!(plan.converted[0].status, ReservationStatus::Converted);
        assert_eq!(plan.consumptions.len(), 1);
        assert_eq!(plan.consumptions[0].quantity, Quantity::from_int(100));
        assert_eq!(plan.consumptions[0].unit_cost_at_consumption, Decimal::new(999, 2));
        assert_eq!(plan.deductions[0].consumed_after, Quantity::from_int(100));
        assert_eq!(plan.deductions[0].expected(), ExpectedVersion::Exact(4));
    }

    #[test]
    fn one_expired_line_aborts_everything() {
        let now = Utc::now();
        let a = batch(1, 500, (2024, 1, 1));
        let ok = reservation(Some(1), "l1", &[(1, 10)], now, 30);
        let mut stale = reservation(Some(1), "l2", &[(1, 10)], now - Duration::hours(2), 30);
        stale.status = ReservationStatus::Expired;

        let err = plan_finalize(
            draft(),
            &[mapping("l1", 10), mapping("l2", 11)],
            &[ok, stale],
            &[a],
            false,
            now,
        )
        .unwrap_err();
        assert!(matches!(err, ReservationError::ExpiredReservation { .. }));
    }

    #[test]
    fn unswept_but_past_expiry_counts_as_expired() {
        let now = Utc::now();
        let a = batch(1, 500, (2024, 1, 1));
        let stale = reservation(Some(1), "l1", &[(1, 10)], now - Duration::minutes(31), 30);
        let err = plan_finalize(draft(), &[mapping("l1", 10)], &[stale], &[a], false, now).unwrap_err();
        assert!(matches!(err, ReservationError::ExpiredReservation { .. }));
    }

    #[test]
    fn ledger_drift_is_detected() {
        let now = Utc::now();
        let mut a = batch(1, 100, (2024, 1, 1));
        a.quantity_consumed = Quantity::from_int(95);
        let r = reservation(Some(1), "l1", &[(1, 10)], now, 30);
        let err = plan_finalize(draft(), &[mapping("l1", 10)], &[r], &[a], false, now).unwrap_err();
        assert_eq!(
            err,
            ReservationError::InsufficientStockAtFinalize {
                batch_id: BatchId::new(1).unwrap(),
                required: Quantity::from_int(10),
                remaining: Quantity::from_int(5),
            }
        );
    }

    #[test]
    fn skip_stock_deduction_records_consumption_without_deducting() {
        let now = Utc::now();
        let mut a = batch(1, 100, (2024, 1, 1));
        a.quantity_consumed = Quantity::from_int(95);
        let r = reservation(Some(1), "l1", &[(1, 10)], now, 30);
        let plan = plan_finalize(draft(), &[mapping("l1", 10)], &[r], &[a], true, now).unwrap();
        assert_eq!(plan.converted.len(), 1);
        assert_eq!(plan.consumptions.len(), 1);
        assert_eq!(plan.consumptions[0].quantity, Quantity::from_int(10));
        assert!(plan.deductions.is_empty());
    }

    #[test]
    fn lines_without_holds_are_reported() {
        let now = Utc::now();
        let a = batch(1, 100, (2024, 1, 1));
        let r = reservation(Some(1), "l1", &[(1, 10)], now, 30);
        let plan = plan_finalize(
            draft(),
            &[mapping("l1", 10), mapping("service", 11)],
            &[r],
            &[a],
            false,
            now,
        )
        .unwrap();
        assert_eq!(plan.unreserved_lines, vec![LineItemTempId::new("service").unwrap()]);
    }

    #[test]
    fn duplicate_mappings_rejected() {
        let now = Utc::now();
        let err = plan_finalize(draft(), &[mapping("l1", 10), mapping("l1", 11)], &[], &[], false, now)
            .unwrap_err();
        assert!(matches!(err, ReservationError::Validation(_)));
        assert!(plan_finalize(draft(), &[], &[], &[], false, now).is_err());
    }

    #[test]
    fn superseded_history_does_not_block_live_reservation() {
        let now = Utc::now();
        let a = batch(1, 100, (2024, 1, 1));
        let mut old = reservation(Some(1), "l1", &[(1, 50)], now - Duration::minutes(5), 30);
        old.status = ReservationStatus::Cancelled;
        let live = reservation(Some(1), "l1", &[(1, 20)], now, 30);
        let plan = plan_finalize(draft(), &[mapping("l1", 10)], &[old, live], &[a], false, now).unwrap();
        assert_eq!(plan.deductions[0].quantity, Quantity::from_int(20));
    }
}
