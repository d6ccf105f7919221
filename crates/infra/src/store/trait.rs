use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockhold_core::{
    BatchId, DraftInvoiceId, ExpectedVersion, LineItemTempId, ProductId, Quantity, ReservationId,
    WarehouseId,
};
use stockhold_reservations::{
    BatchDeduction, ConsumptionRecord, InvoiceStatus, LineItemMapping, Reservation,
    ReservationEvent, StockBatch,
};

/// Storage operation error.
///
/// These are **infrastructure errors** as opposed to business rule failures
/// (`ReservationError`). `Concurrency` and `Unavailable` are transient: the
/// caller may retry the whole operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A compare-and-swap guard failed; somebody else committed first.
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Stored data cannot be decoded or violates a ledger invariant.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Concurrency(_) | StoreError::Unavailable(_))
    }
}

/// Invoice identity recorded when a draft is finalized.
///
/// Keyed by draft so a retried finalize returns the same number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedInvoice {
    pub draft_invoice_id: DraftInvoiceId,
    pub invoice_id: i64,
    pub invoice_number: String,
    pub status: InvoiceStatus,
    pub line_item_mappings: Vec<LineItemMapping>,
    pub stock_deducted: bool,
    pub deductions: Vec<BatchDeduction>,
    pub finalized_at: DateTime<Utc>,
}

impl FinalizedInvoice {
    pub fn format_number(sequence: u64) -> String {
        format!("INV-{sequence:06}")
    }

    /// Whether `mappings` describes the same line -> item assignment, in any order.
    pub fn same_mapping(&self, mappings: &[LineItemMapping]) -> bool {
        let mut stored: Vec<_> = self
            .line_item_mappings
            .iter()
            .map(|m| (m.line_item_temp_id.as_str(), m.invoice_item_id))
            .collect();
        let mut given: Vec<_> = mappings
            .iter()
            .map(|m| (m.line_item_temp_id.as_str(), m.invoice_item_id))
            .collect();
        stored.sort();
        given.sort();
        stored == given
    }
}

/// Finalized invoice awaiting its number (assigned by the store on commit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInvoice {
    pub draft_invoice_id: DraftInvoiceId,
    pub status: InvoiceStatus,
    pub line_item_mappings: Vec<LineItemMapping>,
    pub stock_deducted: bool,
    pub deductions: Vec<BatchDeduction>,
    pub finalized_at: DateTime<Utc>,
}

/// One atomic write against the repository.
///
/// Every batch whose holds or consumption change is listed in
/// `batch_versions` with the version the writer read; the store bumps each
/// of them on commit and rejects the whole changeset if any moved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationChangeset {
    pub batch_versions: BTreeMap<BatchId, ExpectedVersion>,
    pub consumed: BTreeMap<BatchId, Quantity>,
    pub reservations: Vec<Reservation>,
    pub events: Vec<ReservationEvent>,
    pub consumptions: Vec<ConsumptionRecord>,
    pub invoice: Option<PendingInvoice>,
}

impl ReservationChangeset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guard `batch` at the version it was read with.
    pub fn touch(&mut self, batch: &StockBatch) -> &mut Self {
        self.batch_versions
            .insert(batch.id, ExpectedVersion::Exact(batch.version));
        self
    }

    /// Record a reservation write together with the event describing it.
    pub fn put(&mut self, reservation: Reservation, event: ReservationEvent) -> &mut Self {
        self.reservations.push(reservation);
        self.events.push(event);
        self
    }

    pub fn deduct(&mut self, deduction: &BatchDeduction) -> &mut Self {
        self.batch_versions
            .insert(deduction.batch_id, deduction.expected());
        self.consumed
            .insert(deduction.batch_id, deduction.consumed_after);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
            && self.consumed.is_empty()
            && self.consumptions.is_empty()
            && self.invoice.is_none()
    }
}

/// Persistence boundary for batches, reservations and the consumption ledger.
///
/// ## Implementation requirements
///
/// - `apply` is all-or-nothing: either every part of the changeset is
///   visible afterwards or none of it is.
/// - `apply` checks each `batch_versions` entry and bumps the version of
///   every listed batch.
/// - At most one live (`ACTIVE`/`EXTENDED`) reservation may exist per
///   `(draft_invoice_id, line_item_temp_id)`, where reservations without a
///   draft share one key space; a write that would create a second one fails
///   with `StoreError::Concurrency`.
/// - `quantity_consumed` never exceeds `quantity_on_hand`.
#[async_trait]
pub trait ReservationRepository: Send + Sync {
    /// Register a batch or replace its ledger figures (seeding / receiving).
    async fn upsert_batch(&self, batch: StockBatch) -> Result<StockBatch, StoreError>;

    async fn load_batch(&self, id: BatchId) -> Result<Option<StockBatch>, StoreError>;

    /// All batches of a product in a warehouse, exhausted ones included.
    async fn load_batches(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> Result<Vec<StockBatch>, StoreError>;

    async fn load_batches_by_id(&self, ids: &[BatchId]) -> Result<Vec<StockBatch>, StoreError>;

    async fn load_reservation(&self, id: ReservationId) -> Result<Option<Reservation>, StoreError>;

    /// Live-status reservations holding any of `batch_ids` (expiry not applied).
    async fn live_reservations_for_batches(
        &self,
        batch_ids: &[BatchId],
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Every reservation of a draft, in creation order, terminal ones included.
    async fn reservations_for_draft(
        &self,
        draft_invoice_id: DraftInvoiceId,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Live-status reservations of one line. `None` selects reservations made
    /// before the draft was saved.
    async fn live_reservations_for_line(
        &self,
        draft_invoice_id: Option<DraftInvoiceId>,
        line_item_temp_id: &LineItemTempId,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Live-status reservations with `expires_at <= cutoff`, soonest first.
    async fn live_reservations_expiring_by(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, StoreError>;

    async fn events_for(&self, id: ReservationId) -> Result<Vec<ReservationEvent>, StoreError>;

    async fn consumption_for_batch(&self, id: BatchId) -> Result<Vec<ConsumptionRecord>, StoreError>;

    async fn consumption_for_draft(
        &self,
        draft_invoice_id: DraftInvoiceId,
    ) -> Result<Vec<ConsumptionRecord>, StoreError>;

    async fn finalized_invoice(
        &self,
        draft_invoice_id: DraftInvoiceId,
    ) -> Result<Option<FinalizedInvoice>, StoreError>;

    /// Commit a changeset atomically. Returns the finalized invoice when the
    /// changeset carried one.
    async fn apply(
        &self,
        changeset: ReservationChangeset,
    ) -> Result<Option<FinalizedInvoice>, StoreError>;
}

#[async_trait]
impl<S> ReservationRepository for Arc<S>
where
    S: ReservationRepository + ?Sized,
{
    async fn upsert_batch(&self, batch: StockBatch) -> Result<StockBatch, StoreError> {
        (**self).upsert_batch(batch).await
    }

    async fn load_batch(&self, id: BatchId) -> Result<Option<StockBatch>, StoreError> {
        (**self).load_batch(id).await
    }

    async fn load_batches(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> Result<Vec<StockBatch>, StoreError> {
        (**self).load_batches(product_id, warehouse_id).await
    }

    async fn load_batches_by_id(&self, ids: &[BatchId]) -> Result<Vec<StockBatch>, StoreError> {
        (**self).load_batches_by_id(ids).await
    }

    async fn load_reservation(&self, id: ReservationId) -> Result<Option<Reservation>, StoreError> {
        (**self).load_reservation(id).await
    }

    async fn live_reservations_for_batches(
        &self,
        batch_ids: &[BatchId],
    ) -> Result<Vec<Reservation>, StoreError> {
        (**self).live_reservations_for_batches(batch_ids).await
    }

    async fn reservations_for_draft(
        &self,
        draft_invoice_id: DraftInvoiceId,
    ) -> Result<Vec<Reservation>, StoreError> {
        (**self).reservations_for_draft(draft_invoice_id).await
    }

    async fn live_reservations_for_line(
        &self,
        draft_invoice_id: Option<DraftInvoiceId>,
        line_item_temp_id: &LineItemTempId,
    ) -> Result<Vec<Reservation>, StoreError> {
        (**self)
            .live_reservations_for_line(draft_invoice_id, line_item_temp_id)
            .await
    }

    async fn live_reservations_expiring_by(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, StoreError> {
        (**self).live_reservations_expiring_by(cutoff).await
    }

    async fn events_for(&self, id: ReservationId) -> Result<Vec<ReservationEvent>, StoreError> {
        (**self).events_for(id).await
    }

    async fn consumption_for_batch(&self, id: BatchId) -> Result<Vec<ConsumptionRecord>, StoreError> {
        (**self).consumption_for_batch(id).await
    }

    async fn consumption_for_draft(
        &self,
        draft_invoice_id: DraftInvoiceId,
    ) -> Result<Vec<ConsumptionRecord>, StoreError> {
        (**self).consumption_for_draft(draft_invoice_id).await
    }

    async fn finalized_invoice(
        &self,
        draft_invoice_id: DraftInvoiceId,
    ) -> Result<Option<FinalizedInvoice>, StoreError> {
        (**self).finalized_invoice(draft_invoice_id).await
    }

    async fn apply(
        &self,
        changeset: ReservationChangeset,
    ) -> Result<Option<FinalizedInvoice>, StoreError> {
        (**self).apply(changeset).await
    }
}
