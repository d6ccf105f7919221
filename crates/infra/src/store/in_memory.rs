use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use stockhold_core::{BatchId, DraftInvoiceId, LineItemTempId, ProductId, ReservationId, WarehouseId};
use stockhold_reservations::{ConsumptionRecord, Reservation, ReservationEvent, StockBatch};

use super::r#trait::{FinalizedInvoice, ReservationChangeset, ReservationRepository, StoreError};

#[derive(Debug, Default)]
struct Inner {
    batches: HashMap<BatchId, StockBatch>,
    reservations: HashMap<ReservationId, Reservation>,
    events: HashMap<ReservationId, Vec<ReservationEvent>>,
    consumptions: Vec<ConsumptionRecord>,
    invoices: HashMap<DraftInvoiceId, FinalizedInvoice>,
    invoice_sequence: u64,
}

/// In-memory reservation repository.
///
/// Intended for tests/dev. Every changeset is validated and committed under a
/// single write lock, which gives the same all-or-nothing behavior as the
/// Postgres transaction.
#[derive(Debug, Default)]
pub struct InMemoryReservationRepository {
    inner: RwLock<Inner>,
}

impl InMemoryReservationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }
}

fn sorted_by_creation(mut rs: Vec<Reservation>) -> Vec<Reservation> {
    rs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    rs
}

/// Check a changeset against the current state without mutating it.
fn validate(inner: &Inner, cs: &ReservationChangeset) -> Result<(), StoreError> {
    for (batch_id, expected) in &cs.batch_versions {
        let batch = inner
            .batches
            .get(batch_id)
            .ok_or_else(|| StoreError::NotFound(format!("batch {batch_id}")))?;
        expected
            .check(batch.version)
            .map_err(|e| StoreError::Concurrency(format!("batch {batch_id}: {e}")))?;
    }

    for (batch_id, consumed) in &cs.consumed {
        let batch = inner
            .batches
            .get(batch_id)
            .ok_or_else(|| StoreError::NotFound(format!("batch {batch_id}")))?;
        if *consumed > batch.quantity_on_hand {
            return Err(StoreError::Corrupt(format!(
                "batch {batch_id}: consumed {consumed} would exceed on hand {}",
                batch.quantity_on_hand
            )));
        }
    }

    // Terminal reservations are immutable.
    for r in &cs.reservations {
        if let Some(existing) = inner.reservations.get(&r.id) {
            if existing.status.is_terminal() {
                return Err(StoreError::Concurrency(format!(
                    "reservation {} is already {}",
                    r.id, existing.status
                )));
            }
        }
    }

    // At most one live reservation per (draft, line) once the changeset lands.
    let written: HashSet<ReservationId> = cs.reservations.iter().map(|r| r.id).collect();
    let mut live_keys: HashSet<(Option<DraftInvoiceId>, &LineItemTempId)> = HashSet::new();
    let staged = inner
        .reservations
        .values()
        .filter(|r| !written.contains(&r.id))
        .chain(cs.reservations.iter());
    for r in staged.filter(|r| r.is_live_status()) {
        if !live_keys.insert((r.draft_invoice_id, &r.line_item_temp_id)) {
            return Err(StoreError::Concurrency(format!(
                "line {} of draft {:?} already has a live reservation",
                r.line_item_temp_id, r.draft_invoice_id
            )));
        }
    }

    if let Some(invoice) = &cs.invoice {
        if inner.invoices.contains_key(&invoice.draft_invoice_id) {
            return Err(StoreError::Concurrency(format!(
                "draft {} is already finalized",
                invoice.draft_invoice_id
            )));
        }
    }

    Ok(())
}

#[async_trait]
impl ReservationRepository for InMemoryReservationRepository {
    async fn upsert_batch(&self, mut batch: StockBatch) -> Result<StockBatch, StoreError> {
        let mut inner = self.write()?;
        batch.version = inner
            .batches
            .get(&batch.id)
            .map(|existing| existing.version + 1)
            .unwrap_or(0);
        inner.batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn load_batch(&self, id: BatchId) -> Result<Option<StockBatch>, StoreError> {
        Ok(self.read()?.batches.get(&id).cloned())
    }

    async fn load_batches(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> Result<Vec<StockBatch>, StoreError> {
        let inner = self.read()?;
        let mut out: Vec<StockBatch> = inner
            .batches
            .values()
            .filter(|b| b.product_id == product_id && b.warehouse_id == warehouse_id)
            .cloned()
            .collect();
        out.sort_by_key(|b| b.id);
        Ok(out)
    }

    async fn load_batches_by_id(&self, ids: &[BatchId]) -> Result<Vec<StockBatch>, StoreError> {
        let inner = self.read()?;
        let mut out: Vec<StockBatch> = ids
            .iter()
            .filter_map(|id| inner.batches.get(id).cloned())
            .collect();
        out.sort_by_key(|b| b.id);
        out.dedup_by_key(|b| b.id);
        Ok(out)
    }

    async fn load_reservation(&self, id: ReservationId) -> Result<Option<Reservation>, StoreError> {
        Ok(self.read()?.reservations.get(&id).cloned())
    }

    async fn live_reservations_for_batches(
        &self,
        batch_ids: &[BatchId],
    ) -> Result<Vec<Reservation>, StoreError> {
        let wanted: HashSet<&BatchId> = batch_ids.iter().collect();
        let inner = self.read()?;
        let out = inner
            .reservations
            .values()
            .filter(|r| r.is_live_status())
            .filter(|r| r.allocations.iter().any(|a| wanted.contains(&a.batch_id)))
            .cloned()
            .collect();
        Ok(sorted_by_creation(out))
    }

    async fn reservations_for_draft(
        &self,
        draft_invoice_id: DraftInvoiceId,
    ) -> Result<Vec<Reservation>, StoreError> {
        let inner = self.read()?;
        let out = inner
            .reservations
            .values()
            .filter(|r| r.draft_invoice_id == Some(draft_invoice_id))
            .cloned()
            .collect();
        Ok(sorted_by_creation(out))
    }

    async fn live_reservations_for_line(
        &self,
        draft_invoice_id: Option<DraftInvoiceId>,
        line_item_temp_id: &LineItemTempId,
    ) -> Result<Vec<Reservation>, StoreError> {
        let inner = self.read()?;
        let out = inner
            .reservations
            .values()
            .filter(|r| r.is_live_status() && r.is_line(draft_invoice_id, line_item_temp_id))
            .cloned()
            .collect();
        Ok(sorted_by_creation(out))
    }

    async fn live_reservations_expiring_by(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, StoreError> {
        let inner = self.read()?;
        let mut out: Vec<Reservation> = inner
            .reservations
            .values()
            .filter(|r| r.is_live_status() && r.expires_at <= cutoff)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn events_for(&self, id: ReservationId) -> Result<Vec<ReservationEvent>, StoreError> {
        Ok(self.read()?.events.get(&id).cloned().unwrap_or_default())
    }

    async fn consumption_for_batch(&self, id: BatchId) -> Result<Vec<ConsumptionRecord>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .consumptions
            .iter()
            .filter(|c| c.batch_id == id)
            .cloned()
            .collect())
    }

    async fn consumption_for_draft(
        &self,
        draft_invoice_id: DraftInvoiceId,
    ) -> Result<Vec<ConsumptionRecord>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .consumptions
            .iter()
            .filter(|c| c.draft_invoice_id == draft_invoice_id)
            .cloned()
            .collect())
    }

    async fn finalized_invoice(
        &self,
        draft_invoice_id: DraftInvoiceId,
    ) -> Result<Option<FinalizedInvoice>, StoreError> {
        Ok(self.read()?.invoices.get(&draft_invoice_id).cloned())
    }

    async fn apply(
        &self,
        changeset: ReservationChangeset,
    ) -> Result<Option<FinalizedInvoice>, StoreError> {
        let mut inner = self.write()?;
        validate(&inner, &changeset)?;

        let ReservationChangeset {
            batch_versions,
            consumed,
            reservations,
            events,
            consumptions,
            invoice,
        } = changeset;

        for batch_id in batch_versions.keys() {
            if let Some(batch) = inner.batches.get_mut(batch_id) {
                batch.version += 1;
                if let Some(next) = consumed.get(batch_id) {
                    batch.quantity_consumed = *next;
                }
            }
        }
        for r in reservations {
            inner.reservations.insert(r.id, r);
        }
        for e in events {
            inner.events.entry(e.reservation_id()).or_default().push(e);
        }
        inner.consumptions.extend(consumptions);

        let finalized = invoice.map(|pending| {
            inner.invoice_sequence += 1;
            let record = FinalizedInvoice {
                draft_invoice_id: pending.draft_invoice_id,
                invoice_id: pending.draft_invoice_id.get(),
                invoice_number: FinalizedInvoice::format_number(inner.invoice_sequence),
                status: pending.status,
                line_item_mappings: pending.line_item_mappings,
                stock_deducted: pending.stock_deducted,
                deductions: pending.deductions,
                finalized_at: pending.finalized_at,
            };
            inner.invoices.insert(record.draft_invoice_id, record.clone());
            record
        });

        Ok(finalized)
    }
}
