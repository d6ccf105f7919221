//! Availability accounting.
//!
//! Availability is recomputed from the ledger and the live reservations on
//! every call; nothing here is cached.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use stockhold_core::{BatchId, DraftInvoiceId, ProductId, Quantity, ReservationId, WarehouseId};

use crate::batch::{ProcurementChannel, StockBatch};
use crate::reservation::Reservation;

/// Which holds are treated as the caller's own (and therefore not subtracted).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HoldExemption {
    /// Every live hold counts against availability.
    None,
    /// Holds of this draft are shown as still available to it.
    Draft(DraftInvoiceId),
    /// Only this reservation is exempt (the one being superseded).
    Reservation(ReservationId),
}

impl HoldExemption {
    pub fn for_draft(draft: Option<DraftInvoiceId>) -> Self {
        match draft {
            Some(d) => HoldExemption::Draft(d),
            None => HoldExemption::None,
        }
    }

    fn exempts(&self, reservation: &Reservation) -> bool {
        match self {
            HoldExemption::None => false,
            HoldExemption::Draft(d) => reservation.draft_invoice_id == Some(*d),
            HoldExemption::Reservation(id) => reservation.id == *id,
        }
    }
}

/// Per-batch availability projection (not persisted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchAvailability {
    pub batch_id: BatchId,
    pub batch_number: String,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub quantity_on_hand: Quantity,
    pub quantity_consumed: Quantity,
    pub quantity_reserved_others: Quantity,
    pub quantity_reserved_own: Quantity,
    pub quantity_allocatable: Quantity,
    pub unit_cost: Decimal,
    pub procurement_channel: ProcurementChannel,
    pub received_at: DateTime<Utc>,
    pub days_in_stock: i64,
    pub version: u64,
}

/// Compute what each batch can give right now.
///
/// Exhausted batches are skipped. The result is ordered oldest receipt first
/// (ties broken by batch id) so it doubles as the FIFO consumption order.
pub fn compute_availability(
    batches: &[StockBatch],
    reservations: &[Reservation],
    exemption: HoldExemption,
    now: DateTime<Utc>,
) -> Vec<BatchAvailability> {
    let mut others: HashMap<BatchId, Quantity> = HashMap::new();
    let mut own: HashMap<BatchId, Quantity> = HashMap::new();

    for r in reservations.iter().filter(|r| r.is_holding(now)) {
        let bucket = if exemption.exempts(r) { &mut own } else { &mut others };
        for line in &r.allocations {
            *bucket.entry(line.batch_id).or_default() += line.quantity;
        }
    }

    let mut out: Vec<BatchAvailability> = batches
        .iter()
        .filter(|b| !b.is_exhausted())
        .map(|b| {
            let reserved_others = others.get(&b.id).copied().unwrap_or_default();
            let reserved_own = own.get(&b.id).copied().unwrap_or_default();
            BatchAvailability {
                batch_id: b.id,
                batch_number: b.batch_number.clone(),
                product_id: b.product_id,
                warehouse_id: b.warehouse_id,
                quantity_on_hand: b.quantity_on_hand,
                quantity_consumed: b.quantity_consumed,
                quantity_reserved_others: reserved_others,
                quantity_reserved_own: reserved_own,
                quantity_allocatable: b.remaining().saturating_sub(reserved_others),
                unit_cost: b.unit_cost,
                procurement_channel: b.procurement_channel,
                received_at: b.received_at,
                days_in_stock: b.days_in_stock(now),
                version: b.version,
            }
        })
        .collect();

    out.sort_by(|a, b| {
        a.received_at
            .cmp(&b.received_at)
            .then_with(|| a.batch_id.cmp(&b.batch_id))
    });
    out
}

/// Stock utilization for one product in one warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UtilizationSummary {
    pub batch_count: usize,
    pub quantity_on_hand: Quantity,
    pub quantity_consumed: Quantity,
    pub quantity_reserved: Quantity,
    pub quantity_allocatable: Quantity,
    /// Reserved share of what is physically left, in percent (2 dp).
    pub utilization_percent: Decimal,
}

impl UtilizationSummary {
    pub fn from_availability(rows: &[BatchAvailability]) -> Self {
        let on_hand: Quantity = rows.iter().map(|r| r.quantity_on_hand).sum();
        let consumed: Quantity = rows.iter().map(|r| r.quantity_consumed).sum();
        let reserved: Quantity = rows
            .iter()
            .map(|r| r.quantity_reserved_others + r.quantity_reserved_own)
            .sum();
        let allocatable: Quantity = rows.iter().map(|r| r.quantity_allocatable).sum();
        let remaining = on_hand.saturating_sub(consumed);

        let utilization_percent = if remaining.is_zero() {
            Decimal::ZERO
        } else {
            (reserved.value() * Decimal::ONE_HUNDRED / remaining.value())
                .round_dp(2)
                .normalize()
        };

        Self {
            batch_count: rows.len(),
            quantity_on_hand: on_hand,
            quantity_consumed: consumed,
            quantity_reserved: reserved,
            quantity_allocatable: allocatable,
            utilization_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::batch::fixtures::batch;
    use crate::reservation::ReservationStatus;
    use crate::reservation::fixtures::reservation;

    #[test]
    fn subtracts_other_drafts_and_adds_back_own() {
        let now = Utc::now();
        let batches = vec![batch(1, 500, (2024, 1, 1))];
        let mine = reservation(Some(10), "a", &[(1, 100)], now, 30);
        let theirs = reservation(Some(20), "a", &[(1, 150)], now, 30);
        let rs = vec![mine, theirs];

        let view = compute_availability(&batches, &rs, HoldExemption::for_draft(DraftInvoiceId::new(10).ok()), now);
        assert_eq!(view[0].quantity_reserved_others, Quantity::from_int(150));
        assert_eq!(view[0].quantity_reserved_own, Quantity::from_int(100));
        assert_eq!(view[0].quantity_allocatable, Quantity::from_int(350));

        let anon = compute_availability(&batches, &rs, HoldExemption::None, now);
        assert_eq!(anon[0].quantity_allocatable, Quantity::from_int(250));
    }

    #[test]
    fn ordered_oldest_first_and_skips_exhausted() {
        let now = Utc::now();
        let mut empty = batch(9, 10, (2023, 6, 1));
        empty.quantity_consumed = Quantity::from_int(10);
        let batches = vec![batch(3, 10, (2024, 3, 1)), batch(2, 10, (2024, 1, 1)), empty];

        let view = compute_availability(&batches, &[], HoldExemption::None, now);
        let ids: Vec<i64> = view.iter().map(|v| v.batch_id.get()).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn expired_and_terminal_holds_do_not_count() {
        let now = Utc::now();
        let batches = vec![batch(1, 100, (2024, 1, 1))];
        let stale = reservation(Some(1), "a", &[(1, 40)], now - Duration::minutes(45), 30);
        let mut cancelled = reservation(Some(2), "a", &[(1, 30)], now, 30);
        cancelled.status = ReservationStatus::Cancelled;

        let view = compute_availability(&batches, &[stale, cancelled], HoldExemption::None, now);
        assert_eq!(view[0].quantity_allocatable, Quantity::from_int(100));
    }

    #[test]
    fn allocatable_never_negative_when_ledger_drifts() {
        let now = Utc::now();
        let mut b = batch(1, 100, (2024, 1, 1));
        b.quantity_consumed = Quantity::from_int(90);
        let r = reservation(Some(1), "a", &[(1, 50)], now, 30);
        let view = compute_availability(&[b], &[r], HoldExemption::None, now);
        assert_eq!(view[0].quantity_allocatable, Quantity::ZERO);
    }

    #[test]
    fn utilization_summary_percent() {
        let now = Utc::now();
        let batches = vec![batch(1, 300, (2024, 1, 1)), batch(2, 100, (2024, 2, 1))];
        let r = reservation(Some(1), "a", &[(1, 100)], now, 30);
        let view = compute_availability(&batches, &[r], HoldExemption::None, now);
        let summary = UtilizationSummary::from_availability(&view);
        assert_eq!(summary.batch_count, 2);
        assert_eq!(summary.quantity_reserved, Quantity::from_int(100));
        assert_eq!(summary.quantity_allocatable, Quantity::from_int(300));
        assert_eq!(summary.utilization_percent, Decimal::from(25));
    }
}
