//! Reservation engine.
//!
//! Orchestrates the pure domain rules against the repository:
//!
//! 1. lock the batches an operation may touch (ascending id order)
//! 2. re-read batches and holds under the lock
//! 3. decide with the domain functions (availability, FIFO/manual, finalize plan)
//! 4. commit one changeset guarded by the batch versions that were read
//!
//! Nothing is held across calls to external systems; a lock is only held for
//! the read-decide-write of a single operation.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use stockhold_core::{
    BatchId, Clock, DomainError, DraftInvoiceId, LineItemTempId, ProductId, Quantity,
    ReservationId, WarehouseId,
};
use stockhold_reservations::{
    AllocationOutcome, AllocationPlan, BatchAvailability, ConsumptionRecord, HoldExemption,
    InvoiceStatus, LineItemMapping, ManualLine, Reservation, ReservationError, ReservationEvent,
    ReservationResult, ReservationStatus, StockBatch, UtilizationSummary, compute_availability,
    fifo_select, plan_finalize, validate_manual,
};

use crate::config::EngineConfig;
use crate::locks::{BatchGuard, BatchLocks};
use crate::store::{
    FinalizedInvoice, PendingInvoice, ReservationChangeset, ReservationRepository, StoreError,
};

pub type EngineResult<T> = Result<T, EngineError>;

/// Widest look-ahead accepted by [`ReservationEngine::expiring`] (one week).
pub const MAX_EXPIRING_WINDOW_MINUTES: i64 = 7 * 24 * 60;

/// Engine failure: either a business rejection or a storage problem.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Reservation(#[from] ReservationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<DomainError> for EngineError {
    fn from(value: DomainError) -> Self {
        EngineError::Reservation(value.into())
    }
}

impl EngineError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_transient(),
            EngineError::Reservation(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FifoRequest {
    pub draft_invoice_id: Option<DraftInvoiceId>,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub required_quantity: Quantity,
    pub unit: String,
    pub line_item_temp_id: LineItemTempId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualRequest {
    pub draft_invoice_id: Option<DraftInvoiceId>,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub line_item_temp_id: LineItemTempId,
    pub unit: String,
    pub allocations: Vec<ManualLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeRequest {
    pub draft_invoice_id: DraftInvoiceId,
    pub line_item_mappings: Vec<LineItemMapping>,
    pub target_status: InvoiceStatus,
    pub skip_stock_deduction: bool,
}

/// Outcome of a FIFO or manual allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationReceipt {
    pub reservation: Reservation,
    /// Previous live reservation of the same line that this one replaced.
    pub superseded: Option<ReservationId>,
    pub outcome: AllocationOutcome,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftReservations {
    pub reservations: Vec<Reservation>,
    pub total_reserved: Quantity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeReceipt {
    pub invoice: FinalizedInvoice,
    pub consumptions: Vec<ConsumptionRecord>,
    pub converted: Vec<ReservationId>,
    pub unreserved_lines: Vec<LineItemTempId>,
    /// True when this call returned the result of an earlier identical finalize.
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDetail {
    pub batch: StockBatch,
    pub consumptions: Vec<ConsumptionRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub failed: usize,
}

/// Identity of the line an allocation is for.
struct AllocationTarget {
    draft_invoice_id: Option<DraftInvoiceId>,
    line_item_temp_id: LineItemTempId,
    product_id: ProductId,
    warehouse_id: WarehouseId,
    unit: String,
}

pub struct ReservationEngine<R> {
    repo: R,
    locks: BatchLocks,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl<R> std::fmt::Debug for ReservationEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Sorted, de-duplicated batches held by `reservations`.
fn held_batches<'a>(reservations: impl IntoIterator<Item = &'a Reservation>) -> Vec<BatchId> {
    reservations
        .into_iter()
        .flat_map(|r| r.allocations.iter().map(|a| a.batch_id))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn ensure_covered(guard: &BatchGuard, ids: &[BatchId]) -> Result<(), StoreError> {
    if guard.covers_all(ids.iter().copied()) {
        Ok(())
    } else {
        Err(StoreError::Concurrency(
            "batch set changed while acquiring locks".to_string(),
        ))
    }
}

/// Guard every batch a reservation holds, at the version it was read with.
fn touch_batches(
    cs: &mut ReservationChangeset,
    reservation: &Reservation,
    batches: &HashMap<BatchId, StockBatch>,
) -> Result<(), StoreError> {
    for id in reservation.batch_ids() {
        let batch = batches
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("batch {id}")))?;
        cs.touch(batch);
    }
    Ok(())
}

fn describe_target(draft: Option<DraftInvoiceId>, line: Option<&LineItemTempId>) -> String {
    match (draft, line) {
        (Some(draft), Some(line)) => format!("live reservation for draft {draft} line {line}"),
        (Some(draft), None) => format!("live reservation for draft {draft}"),
        (None, Some(line)) => format!("live reservation for unsaved line {line}"),
        (None, None) => "live reservation".to_string(),
    }
}

fn index(batches: Vec<StockBatch>) -> HashMap<BatchId, StockBatch> {
    batches.into_iter().map(|b| (b.id, b)).collect()
}

impl<R> ReservationEngine<R>
where
    R: ReservationRepository,
{
    pub fn new(repo: R, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            repo,
            locks: BatchLocks::new(),
            clock,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    async fn live_for_line(
        &self,
        draft: Option<DraftInvoiceId>,
        line: &LineItemTempId,
    ) -> EngineResult<Option<Reservation>> {
        let found = self.repo.live_reservations_for_line(draft, line).await?;
        Ok(found.into_iter().next())
    }

    /// Live reservations addressed by a draft (optionally one line), or by a
    /// line alone when the draft has not been saved yet.
    async fn live_targets(
        &self,
        draft: Option<DraftInvoiceId>,
        line: Option<&LineItemTempId>,
    ) -> EngineResult<Vec<Reservation>> {
        match (draft, line) {
            (Some(draft), line) => self.live_for_draft(draft, line).await,
            (None, Some(line)) => Ok(self.repo.live_reservations_for_line(None, line).await?),
            (None, None) => Err(ReservationError::validation(
                "line_item_temp_id is required when the draft is not saved",
            )
            .into()),
        }
    }

    async fn view(
        &self,
        batches: &[StockBatch],
        exemption: HoldExemption,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<BatchAvailability>> {
        let ids: Vec<BatchId> = batches.iter().map(|b| b.id).collect();
        let holds = self.repo.live_reservations_for_batches(&ids).await?;
        Ok(compute_availability(batches, &holds, exemption, now))
    }

    /// Per-batch availability for a product in a warehouse, FIFO ordered.
    ///
    /// When `draft` is given, that draft's own holds are added back so an
    /// edit screen shows what the draft could use.
    #[instrument(skip(self), err)]
    pub async fn available_batches(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
        draft: Option<DraftInvoiceId>,
    ) -> EngineResult<Vec<BatchAvailability>> {
        let batches = self.repo.load_batches(product_id, warehouse_id).await?;
        self.view(&batches, HoldExemption::for_draft(draft), self.clock.now())
            .await
    }

    pub async fn summary(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> EngineResult<UtilizationSummary> {
        let batches = self.repo.load_batches(product_id, warehouse_id).await?;
        let view = self
            .view(&batches, HoldExemption::None, self.clock.now())
            .await?;
        Ok(UtilizationSummary::from_availability(&view))
    }

    /// Reserve `required_quantity` oldest batch first, replacing any live
    /// reservation of the same draft line.
    #[instrument(
        skip(self, request),
        fields(
            draft_invoice_id = ?request.draft_invoice_id,
            line_item_temp_id = %request.line_item_temp_id,
            product_id = %request.product_id,
            required = %request.required_quantity
        ),
        err
    )]
    pub async fn allocate_fifo(&self, request: FifoRequest) -> EngineResult<AllocationReceipt> {
        let required = request.required_quantity;
        let target = AllocationTarget {
            draft_invoice_id: request.draft_invoice_id,
            line_item_temp_id: request.line_item_temp_id,
            product_id: request.product_id,
            warehouse_id: request.warehouse_id,
            unit: request.unit,
        };
        self.allocate(target, move |view| fifo_select(view, required))
            .await
    }

    /// Reserve exactly the caller-chosen batch quantities, or nothing.
    #[instrument(
        skip(self, request),
        fields(
            draft_invoice_id = ?request.draft_invoice_id,
            line_item_temp_id = %request.line_item_temp_id,
            product_id = %request.product_id,
            lines = request.allocations.len()
        ),
        err
    )]
    pub async fn allocate_manual(&self, request: ManualRequest) -> EngineResult<AllocationReceipt> {
        let lines = request.allocations;
        let target = AllocationTarget {
            draft_invoice_id: request.draft_invoice_id,
            line_item_temp_id: request.line_item_temp_id,
            product_id: request.product_id,
            warehouse_id: request.warehouse_id,
            unit: request.unit,
        };
        self.allocate(target, move |view| validate_manual(view, &lines))
            .await
    }

    async fn allocate<F>(&self, target: AllocationTarget, select: F) -> EngineResult<AllocationReceipt>
    where
        F: FnOnce(&[BatchAvailability]) -> ReservationResult<AllocationPlan> + Send,
    {
        if target.unit.trim().is_empty() {
            return Err(ReservationError::validation("unit cannot be empty").into());
        }

        // Lock everything the decision could read or release.
        let candidates = self
            .repo
            .load_batches(target.product_id, target.warehouse_id)
            .await?;
        let prior = self
            .live_for_line(target.draft_invoice_id, &target.line_item_temp_id)
            .await?;
        let guard = self
            .locks
            .acquire(
                candidates
                    .iter()
                    .map(|b| b.id)
                    .chain(held_batches(prior.as_ref())),
            )
            .await;

        // Re-read under the lock.
        let batches = self
            .repo
            .load_batches(target.product_id, target.warehouse_id)
            .await?;
        let prior = self
            .live_for_line(target.draft_invoice_id, &target.line_item_temp_id)
            .await?;
        let batch_ids: Vec<BatchId> = batches.iter().map(|b| b.id).collect();
        let prior_ids = prior.as_ref().map(|r| r.batch_ids()).unwrap_or_default();
        ensure_covered(&guard, &batch_ids)?;
        ensure_covered(&guard, &prior_ids)?;

        let exemption = match &prior {
            Some(p) => HoldExemption::Reservation(p.id),
            None => HoldExemption::None,
        };
        let now = self.clock.now();
        let view = self.view(&batches, exemption, now).await?;
        let plan = select(&view)?;
        let outcome = plan.outcome;
        let message = plan.message();

        let (reservation, created) = plan.into_reservation(
            target.draft_invoice_id,
            target.line_item_temp_id,
            target.product_id,
            target.warehouse_id,
            target.unit,
            now,
            self.config.reservation_ttl,
        )?;

        let mut by_id = index(batches);
        let foreign: Vec<BatchId> = prior_ids
            .iter()
            .copied()
            .filter(|id| !by_id.contains_key(id))
            .collect();
        if !foreign.is_empty() {
            by_id.extend(index(self.repo.load_batches_by_id(&foreign).await?));
        }

        let mut cs = ReservationChangeset::new();
        let superseded = match prior {
            Some(mut old) => {
                // Past-expiry holds are recorded as expired, not superseded.
                let event = if old.is_past_expiry(now) {
                    old.expire(now)?
                } else {
                    old.supersede(now, reservation.id)?
                };
                touch_batches(&mut cs, &old, &by_id)?;
                let id = old.id;
                cs.put(old, event);
                Some(id)
            }
            None => None,
        };
        touch_batches(&mut cs, &reservation, &by_id)?;
        cs.put(reservation.clone(), created);

        self.repo.apply(cs).await?;
        drop(guard);

        info!(
            reservation_id = %reservation.id,
            method = reservation.method.as_str(),
            outcome = outcome.as_str(),
            total_reserved = %reservation.total_reserved(),
            superseded = ?superseded,
            expires_at = %reservation.expires_at,
            "reservation created"
        );

        Ok(AllocationReceipt {
            reservation,
            superseded,
            outcome,
            message,
        })
    }

    /// Push out the expiry of a draft's live reservations (optionally one line).
    ///
    /// When the whole draft is targeted, lines that already lapsed are left
    /// for the sweeper and the rest are extended.
    #[instrument(skip(self), err)]
    pub async fn extend(
        &self,
        draft: Option<DraftInvoiceId>,
        line: Option<LineItemTempId>,
        extend_minutes: i64,
    ) -> EngineResult<Vec<Reservation>> {
        let max_minutes = self.config.max_extend.num_minutes();
        if extend_minutes <= 0 || extend_minutes > max_minutes {
            return Err(ReservationError::validation(format!(
                "extend_minutes must be between 1 and {max_minutes}"
            ))
            .into());
        }
        let by = Duration::minutes(extend_minutes);

        let targets = self.live_targets(draft, line.as_ref()).await?;
        if targets.is_empty() {
            return Err(ReservationError::not_found(describe_target(draft, line.as_ref())).into());
        }
        let ids = held_batches(&targets);
        let guard = self.locks.acquire(ids).await;

        let targets = self.live_targets(draft, line.as_ref()).await?;
        let ids = held_batches(&targets);
        ensure_covered(&guard, &ids)?;
        let batches = index(self.repo.load_batches_by_id(&ids).await?);

        let now = self.clock.now();
        let mut cs = ReservationChangeset::new();
        let mut extended = Vec::with_capacity(targets.len());
        let mut lapsed = None;
        for mut r in targets {
            if line.is_none() && r.is_past_expiry(now) {
                debug!(
                    reservation_id = %r.id,
                    line_item_temp_id = %r.line_item_temp_id,
                    "lapsed reservation left for the sweeper"
                );
                lapsed.get_or_insert(r.line_item_temp_id);
                continue;
            }
            let event = r.extend(now, by)?;
            touch_batches(&mut cs, &r, &batches)?;
            extended.push(r.clone());
            cs.put(r, event);
        }
        if extended.is_empty() {
            return Err(match lapsed {
                Some(line_item_temp_id) => ReservationError::ExpiredReservation { line_item_temp_id },
                None => ReservationError::not_found(describe_target(draft, line.as_ref())),
            }
            .into());
        }

        self.repo.apply(cs).await?;
        drop(guard);

        info!(
            draft_invoice_id = ?draft,
            count = extended.len(),
            extend_minutes,
            "reservations extended"
        );
        Ok(extended)
    }

    async fn live_for_draft(
        &self,
        draft: DraftInvoiceId,
        line: Option<&LineItemTempId>,
    ) -> EngineResult<Vec<Reservation>> {
        Ok(self
            .repo
            .reservations_for_draft(draft)
            .await?
            .into_iter()
            .filter(|r| r.is_live_status() && r.belongs_to(draft, line))
            .collect())
    }

    /// Move one reservation to a terminal state under its batch locks.
    ///
    /// Returns the reservation as stored afterwards and whether this call
    /// changed it (an already terminal reservation is left alone).
    async fn release(
        &self,
        id: ReservationId,
        transition: impl FnOnce(&mut Reservation) -> ReservationResult<ReservationEvent>,
    ) -> EngineResult<(Reservation, bool)> {
        let current = self
            .repo
            .load_reservation(id)
            .await?
            .ok_or_else(|| ReservationError::not_found(format!("reservation {id}")))?;
        let guard = self.locks.acquire(current.batch_ids()).await;

        let mut current = self
            .repo
            .load_reservation(id)
            .await?
            .ok_or_else(|| ReservationError::not_found(format!("reservation {id}")))?;
        if current.status.is_terminal() {
            return Ok((current, false));
        }
        ensure_covered(&guard, &current.batch_ids())?;

        let batches = index(self.repo.load_batches_by_id(&current.batch_ids()).await?);
        let event = transition(&mut current)?;
        let mut cs = ReservationChangeset::new();
        touch_batches(&mut cs, &current, &batches)?;
        cs.put(current.clone(), event);
        self.repo.apply(cs).await?;
        Ok((current, true))
    }

    /// Cancel one reservation. Cancelling a terminal reservation is a no-op.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, id: ReservationId) -> EngineResult<Reservation> {
        let now = self.clock.now();
        let (reservation, changed) = self.release(id, |r| r.cancel(now)).await?;
        if changed {
            info!(reservation_id = %id, "reservation cancelled");
        } else {
            debug!(reservation_id = %id, status = %reservation.status, "cancel on terminal reservation ignored");
        }
        Ok(reservation)
    }

    /// Cancel every live reservation of one draft line. Returns how many were
    /// released; individual failures are logged and skipped.
    pub async fn cancel_by_line_item(
        &self,
        draft: Option<DraftInvoiceId>,
        line: &LineItemTempId,
    ) -> EngineResult<usize> {
        let targets = self.live_targets(draft, Some(line)).await?;
        Ok(self.cancel_all(targets).await)
    }

    /// Cancel every live reservation of a draft (draft deleted or abandoned).
    pub async fn cancel_by_draft(&self, draft: DraftInvoiceId) -> EngineResult<usize> {
        let targets = self.live_for_draft(draft, None).await?;
        let count = self.cancel_all(targets).await;
        info!(draft_invoice_id = %draft, count, "draft reservations cancelled");
        Ok(count)
    }

    async fn cancel_all(&self, targets: Vec<Reservation>) -> usize {
        let mut released = 0;
        for r in targets {
            let now = self.clock.now();
            match self.release(r.id, |res| res.cancel(now)).await {
                Ok((_, true)) => released += 1,
                Ok((_, false)) => {}
                Err(err) => warn!(reservation_id = %r.id, error = %err, "failed to cancel reservation"),
            }
        }
        released
    }

    /// Reservations currently holding stock for a draft (optionally one line).
    pub async fn list_by_draft(
        &self,
        draft: DraftInvoiceId,
        line: Option<&LineItemTempId>,
    ) -> EngineResult<DraftReservations> {
        let now = self.clock.now();
        let reservations: Vec<Reservation> = self
            .live_for_draft(draft, line)
            .await?
            .into_iter()
            .filter(|r| r.is_holding(now))
            .collect();
        let total_reserved = reservations.iter().map(|r| r.total_reserved()).sum();
        Ok(DraftReservations {
            reservations,
            total_reserved,
        })
    }

    pub async fn get(&self, id: ReservationId) -> EngineResult<Reservation> {
        self.repo
            .load_reservation(id)
            .await?
            .ok_or_else(|| ReservationError::not_found(format!("reservation {id}")).into())
    }

    /// Audit trail of one reservation, oldest first.
    pub async fn history(&self, id: ReservationId) -> EngineResult<Vec<ReservationEvent>> {
        self.get(id).await?;
        Ok(self.repo.events_for(id).await?)
    }

    /// Reservations still holding stock that will lapse within `within_minutes`.
    pub async fn expiring(&self, within_minutes: i64) -> EngineResult<Vec<Reservation>> {
        if !(0..=MAX_EXPIRING_WINDOW_MINUTES).contains(&within_minutes) {
            return Err(ReservationError::validation(format!(
                "within_minutes must be between 0 and {MAX_EXPIRING_WINDOW_MINUTES}"
            ))
            .into());
        }
        let now = self.clock.now();
        Ok(self
            .repo
            .live_reservations_expiring_by(now + Duration::minutes(within_minutes))
            .await?
            .into_iter()
            .filter(|r| r.is_holding(now))
            .collect())
    }

    /// Flip every live reservation past its expiry to `EXPIRED`.
    ///
    /// Availability already ignores such holds; this makes the state durable.
    pub async fn sweep_expired(&self) -> EngineResult<SweepReport> {
        let now = self.clock.now();
        let due = self.repo.live_reservations_expiring_by(now).await?;
        let mut report = SweepReport::default();

        for r in due {
            match self.release(r.id, |res| res.expire(now)).await {
                Ok((_, true)) => report.expired += 1,
                Ok((_, false)) => {}
                Err(err) => {
                    report.failed += 1;
                    warn!(reservation_id = %r.id, error = %err, "failed to expire reservation");
                }
            }
        }

        if report.expired > 0 || report.failed > 0 {
            info!(expired = report.expired, failed = report.failed, "expiry sweep finished");
        }
        Ok(report)
    }

    /// Convert a draft's reservations into permanent consumption.
    ///
    /// All-or-nothing: any expired or inactive mapped reservation, or any
    /// batch that no longer has the stock, aborts without writing. Retrying
    /// with the same mapping returns the original result.
    #[instrument(
        skip(self, request),
        fields(
            draft_invoice_id = %request.draft_invoice_id,
            mappings = request.line_item_mappings.len(),
            skip_stock_deduction = request.skip_stock_deduction
        ),
        err
    )]
    pub async fn finalize(&self, request: FinalizeRequest) -> EngineResult<FinalizeReceipt> {
        let draft = request.draft_invoice_id;
        if let Some(existing) = self.repo.finalized_invoice(draft).await? {
            return self.replay(existing, &request).await;
        }

        let live = self.live_for_draft(draft, None).await?;
        let ids = held_batches(&live);
        let guard = self.locks.acquire(ids).await;

        if let Some(existing) = self.repo.finalized_invoice(draft).await? {
            return self.replay(existing, &request).await;
        }
        let reservations = self.repo.reservations_for_draft(draft).await?;
        let ids = held_batches(reservations.iter().filter(|r| r.is_live_status()));
        ensure_covered(&guard, &ids)?;
        let batches = self.repo.load_batches_by_id(&ids).await?;

        let now = self.clock.now();
        let plan = plan_finalize(
            draft,
            &request.line_item_mappings,
            &reservations,
            &batches,
            request.skip_stock_deduction,
            now,
        )?;

        let by_id = index(batches);
        let mut cs = ReservationChangeset::new();
        for r in &plan.converted {
            touch_batches(&mut cs, r, &by_id)?;
        }
        for d in &plan.deductions {
            cs.deduct(d);
        }
        let converted: Vec<ReservationId> = plan.converted.iter().map(|r| r.id).collect();
        for (r, e) in plan.converted.into_iter().zip(plan.events) {
            cs.put(r, e);
        }
        cs.consumptions = plan.consumptions.clone();
        cs.invoice = Some(PendingInvoice {
            draft_invoice_id: draft,
            status: request.target_status,
            line_item_mappings: request.line_item_mappings.clone(),
            stock_deducted: !request.skip_stock_deduction,
            deductions: plan.deductions,
            finalized_at: now,
        });

        let invoice = self
            .repo
            .apply(cs)
            .await?
            .ok_or_else(|| StoreError::Corrupt("finalized invoice not returned by store".to_string()))?;
        drop(guard);

        info!(
            draft_invoice_id = %draft,
            invoice_number = %invoice.invoice_number,
            status = invoice.status.as_str(),
            converted = converted.len(),
            consumption_records = plan.consumptions.len(),
            stock_deducted = invoice.stock_deducted,
            "draft finalized"
        );

        Ok(FinalizeReceipt {
            invoice,
            consumptions: plan.consumptions,
            converted,
            unreserved_lines: plan.unreserved_lines,
            replayed: false,
        })
    }

    async fn replay(
        &self,
        existing: FinalizedInvoice,
        request: &FinalizeRequest,
    ) -> EngineResult<FinalizeReceipt> {
        if !existing.same_mapping(&request.line_item_mappings) {
            warn!(
                draft_invoice_id = %existing.draft_invoice_id,
                invoice_number = %existing.invoice_number,
                "finalize retried with a different line item mapping"
            );
            return Err(ReservationError::AlreadyConverted.into());
        }

        let draft = existing.draft_invoice_id;
        let consumptions = self.repo.consumption_for_draft(draft).await?;
        let reservations = self.repo.reservations_for_draft(draft).await?;
        let converted = reservations
            .iter()
            .filter(|r| r.status == ReservationStatus::Converted)
            .map(|r| r.id)
            .collect();
        let unreserved_lines = request
            .line_item_mappings
            .iter()
            .filter(|m| {
                !reservations.iter().any(|r| {
                    r.status == ReservationStatus::Converted && r.line_item_temp_id == m.line_item_temp_id
                })
            })
            .map(|m| m.line_item_temp_id.clone())
            .collect();

        debug!(draft_invoice_id = %draft, invoice_number = %existing.invoice_number, "finalize replayed");
        Ok(FinalizeReceipt {
            invoice: existing,
            consumptions,
            converted,
            unreserved_lines,
            replayed: true,
        })
    }

    /// Register or update a batch in the stock ledger (dev seeding).
    ///
    /// An existing batch keeps its consumed quantity, and its on-hand figure
    /// cannot drop below what is consumed plus what live reservations hold.
    #[instrument(skip(self, batch), fields(batch_id = %batch.id), err)]
    pub async fn receive_batch(&self, mut batch: StockBatch) -> EngineResult<StockBatch> {
        let guard = self.locks.acquire([batch.id]).await;
        if let Some(existing) = self.repo.load_batch(batch.id).await? {
            batch.quantity_consumed = existing.quantity_consumed;

            let now = self.clock.now();
            let held: Quantity = self
                .repo
                .live_reservations_for_batches(&[batch.id])
                .await?
                .iter()
                .filter(|r| r.is_holding(now))
                .flat_map(|r| r.allocations.iter())
                .filter(|a| a.batch_id == batch.id)
                .map(|a| a.quantity)
                .sum();
            let floor = existing.quantity_consumed + held;
            if batch.quantity_on_hand < floor {
                return Err(ReservationError::validation(format!(
                    "batch {}: on hand {} is below consumed plus held {floor}",
                    batch.id, batch.quantity_on_hand
                ))
                .into());
            }
        }
        batch.validate()?;
        let stored = self.repo.upsert_batch(batch).await?;
        drop(guard);

        info!(
            batch_id = %stored.id,
            product_id = %stored.product_id,
            warehouse_id = %stored.warehouse_id,
            on_hand = %stored.quantity_on_hand,
            "batch received"
        );
        Ok(stored)
    }

    pub async fn batch_detail(&self, id: BatchId) -> EngineResult<BatchDetail> {
        let batch = self
            .repo
            .load_batch(id)
            .await?
            .ok_or_else(|| ReservationError::not_found(format!("batch {id}")))?;
        let consumptions = self.repo.consumption_for_batch(id).await?;
        Ok(BatchDetail {
            batch,
            consumptions,
        })
    }
}
