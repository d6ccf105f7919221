//! Postgres-backed reservation repository.
//!
//! Schema lives in `crates/infra/migrations` and is applied by
//! [`PostgresReservationRepository::migrate`].
//!
//! ## Error mapping
//!
//! | SQLx error | Postgres code | `StoreError` |
//! |---|---|---|
//! | unique violation | `23505` | `Concurrency` (second live reservation for a line, duplicate finalize) |
//! | check violation | `23514` | `Corrupt` (consumed above on hand, negative quantity) |
//! | foreign key violation | `23503` | `NotFound` |
//! | pool closed / IO / timeout | n/a | `Unavailable` |
//! | decode failures | n/a | `Corrupt` |
//!
//! Every `apply` runs in one transaction; batch version guards are
//! `UPDATE ... WHERE version = $expected` so a lost race rolls everything back.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::{Span, instrument, warn};
use uuid::Uuid;

use stockhold_core::{
    BatchId, DraftInvoiceId, Event, ExpectedVersion, InvoiceItemId, LineItemTempId, ProductId,
    Quantity, ReservationId, WarehouseId,
};
use stockhold_reservations::{
    ConsumptionRecord, ProcurementChannel, Reservation, ReservationEvent, StockBatch,
};

use super::r#trait::{FinalizedInvoice, ReservationChangeset, ReservationRepository, StoreError};

const RESERVATION_COLUMNS: &str = r#"
    id, draft_invoice_id, line_item_temp_id, product_id, warehouse_id, unit,
    requested_quantity, allocations, method, outcome, status,
    created_at, updated_at, expires_at, invoice_item_id
"#;

const BATCH_COLUMNS: &str = r#"
    id, batch_number, product_id, warehouse_id, quantity_on_hand, quantity_consumed,
    procurement_channel, unit_cost, received_at, version
"#;

const CONSUMPTION_COLUMNS: &str = r#"
    invoice_item_id, batch_id, quantity, unit_cost_at_consumption,
    draft_invoice_id, reservation_id, consumed_at
"#;

/// Postgres-backed reservation repository.
#[derive(Debug, Clone)]
pub struct PostgresReservationRepository {
    pool: Arc<PgPool>,
}

impl PostgresReservationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {e}")))
    }
}

#[derive(Debug, FromRow)]
struct BatchRow {
    id: i64,
    batch_number: String,
    product_id: i64,
    warehouse_id: i64,
    quantity_on_hand: Decimal,
    quantity_consumed: Decimal,
    procurement_channel: String,
    unit_cost: Decimal,
    received_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<BatchRow> for StockBatch {
    type Error = StoreError;

    fn try_from(row: BatchRow) -> Result<Self, Self::Error> {
        Ok(StockBatch {
            id: BatchId::new(row.id).map_err(corrupt)?,
            batch_number: row.batch_number,
            product_id: ProductId::new(row.product_id).map_err(corrupt)?,
            warehouse_id: WarehouseId::new(row.warehouse_id).map_err(corrupt)?,
            quantity_on_hand: Quantity::new(row.quantity_on_hand).map_err(corrupt)?,
            quantity_consumed: Quantity::new(row.quantity_consumed).map_err(corrupt)?,
            procurement_channel: row
                .procurement_channel
                .parse::<ProcurementChannel>()
                .map_err(corrupt)?,
            unit_cost: row.unit_cost,
            received_at: row.received_at,
            version: u64::try_from(row.version).map_err(corrupt)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct ReservationRow {
    id: Uuid,
    draft_invoice_id: Option<i64>,
    line_item_temp_id: String,
    product_id: i64,
    warehouse_id: i64,
    unit: String,
    requested_quantity: Decimal,
    allocations: serde_json::Value,
    method: String,
    outcome: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    invoice_item_id: Option<i64>,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = StoreError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        Ok(Reservation {
            id: ReservationId::from_uuid(row.id),
            draft_invoice_id: DraftInvoiceId::from_wire(row.draft_invoice_id).map_err(corrupt)?,
            line_item_temp_id: LineItemTempId::new(row.line_item_temp_id).map_err(corrupt)?,
            product_id: ProductId::new(row.product_id).map_err(corrupt)?,
            warehouse_id: WarehouseId::new(row.warehouse_id).map_err(corrupt)?,
            unit: row.unit,
            requested_quantity: Quantity::new(row.requested_quantity).map_err(corrupt)?,
            allocations: serde_json::from_value(row.allocations).map_err(corrupt)?,
            method: decode_label(row.method)?,
            outcome: decode_label(row.outcome)?,
            status: decode_label(row.status)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
            invoice_item_id: row
                .invoice_item_id
                .map(InvoiceItemId::new)
                .transpose()
                .map_err(corrupt)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct ConsumptionRow {
    invoice_item_id: i64,
    batch_id: i64,
    quantity: Decimal,
    unit_cost_at_consumption: Decimal,
    draft_invoice_id: i64,
    reservation_id: Uuid,
    consumed_at: DateTime<Utc>,
}

impl TryFrom<ConsumptionRow> for ConsumptionRecord {
    type Error = StoreError;

    fn try_from(row: ConsumptionRow) -> Result<Self, Self::Error> {
        Ok(ConsumptionRecord {
            invoice_item_id: InvoiceItemId::new(row.invoice_item_id).map_err(corrupt)?,
            batch_id: BatchId::new(row.batch_id).map_err(corrupt)?,
            quantity: Quantity::new(row.quantity).map_err(corrupt)?,
            unit_cost_at_consumption: row.unit_cost_at_consumption,
            draft_invoice_id: DraftInvoiceId::new(row.draft_invoice_id).map_err(corrupt)?,
            reservation_id: ReservationId::from_uuid(row.reservation_id),
            consumed_at: row.consumed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct InvoiceRow {
    draft_invoice_id: i64,
    invoice_id: i64,
    invoice_number: String,
    status: String,
    line_item_mappings: serde_json::Value,
    stock_deducted: bool,
    deductions: serde_json::Value,
    finalized_at: DateTime<Utc>,
}

impl TryFrom<InvoiceRow> for FinalizedInvoice {
    type Error = StoreError;

    fn try_from(row: InvoiceRow) -> Result<Self, Self::Error> {
        Ok(FinalizedInvoice {
            draft_invoice_id: DraftInvoiceId::new(row.draft_invoice_id).map_err(corrupt)?,
            invoice_id: row.invoice_id,
            invoice_number: row.invoice_number,
            status: decode_label(row.status)?,
            line_item_mappings: serde_json::from_value(row.line_item_mappings).map_err(corrupt)?,
            stock_deducted: row.stock_deducted,
            deductions: serde_json::from_value(row.deductions).map_err(corrupt)?,
            finalized_at: row.finalized_at,
        })
    }
}

fn corrupt(err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

/// Decode a serde unit-variant label stored as TEXT.
fn decode_label<T: DeserializeOwned>(label: String) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(label)).map_err(corrupt)
}

/// Encode a serde unit-variant as its TEXT label.
fn encode_label<T: Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value).map_err(corrupt)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(StoreError::Corrupt(format!("expected string label, got {other}"))),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(corrupt)
}

fn rows_into<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn batch_ids_param(ids: &[BatchId]) -> Vec<i64> {
    ids.iter().map(|id| id.get()).collect()
}

#[async_trait]
impl ReservationRepository for PostgresReservationRepository {
    #[instrument(skip(self, batch), fields(batch_id = %batch.id), err)]
    async fn upsert_batch(&self, batch: StockBatch) -> Result<StockBatch, StoreError> {
        let row: BatchRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO stock_batches (
                id, batch_number, product_id, warehouse_id, quantity_on_hand,
                quantity_consumed, procurement_channel, unit_cost, received_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0)
            ON CONFLICT (id) DO UPDATE SET
                batch_number = EXCLUDED.batch_number,
                product_id = EXCLUDED.product_id,
                warehouse_id = EXCLUDED.warehouse_id,
                quantity_on_hand = EXCLUDED.quantity_on_hand,
                quantity_consumed = EXCLUDED.quantity_consumed,
                procurement_channel = EXCLUDED.procurement_channel,
                unit_cost = EXCLUDED.unit_cost,
                received_at = EXCLUDED.received_at,
                version = stock_batches.version + 1
            RETURNING {BATCH_COLUMNS}
            "#
        ))
        .bind(batch.id.get())
        .bind(&batch.batch_number)
        .bind(batch.product_id.get())
        .bind(batch.warehouse_id.get())
        .bind(batch.quantity_on_hand.value())
        .bind(batch.quantity_consumed.value())
        .bind(batch.procurement_channel.as_str())
        .bind(batch.unit_cost)
        .bind(batch.received_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_batch", e))?;

        row.try_into()
    }

    #[instrument(skip(self), err)]
    async fn load_batch(&self, id: BatchId) -> Result<Option<StockBatch>, StoreError> {
        let row: Option<BatchRow> =
            sqlx::query_as(&format!("SELECT {BATCH_COLUMNS} FROM stock_batches WHERE id = $1"))
                .bind(id.get())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("load_batch", e))?;
        row.map(StockBatch::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn load_batches(
        &self,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> Result<Vec<StockBatch>, StoreError> {
        let rows: Vec<BatchRow> = sqlx::query_as(&format!(
            r#"
            SELECT {BATCH_COLUMNS}
            FROM stock_batches
            WHERE product_id = $1 AND warehouse_id = $2
            ORDER BY id ASC
            "#
        ))
        .bind(product_id.get())
        .bind(warehouse_id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_batches", e))?;

        Span::current().record("batch_count", rows.len());
        rows_into(rows)
    }

    #[instrument(skip(self), err)]
    async fn load_batches_by_id(&self, ids: &[BatchId]) -> Result<Vec<StockBatch>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<BatchRow> = sqlx::query_as(&format!(
            "SELECT {BATCH_COLUMNS} FROM stock_batches WHERE id = ANY($1) ORDER BY id ASC"
        ))
        .bind(batch_ids_param(ids))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_batches_by_id", e))?;
        rows_into(rows)
    }

    #[instrument(skip(self), fields(reservation_id = %id), err)]
    async fn load_reservation(&self, id: ReservationId) -> Result<Option<Reservation>, StoreError> {
        let row: Option<ReservationRow> = sqlx::query_as(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM batch_reservations WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_reservation", e))?;
        row.map(Reservation::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn live_reservations_for_batches(
        &self,
        batch_ids: &[BatchId],
    ) -> Result<Vec<Reservation>, StoreError> {
        if batch_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<ReservationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RESERVATION_COLUMNS}
            FROM batch_reservations r
            WHERE r.status IN ('ACTIVE', 'EXTENDED')
              AND EXISTS (
                  SELECT 1 FROM jsonb_array_elements(r.allocations) a
                  WHERE (a->>'batch_id')::BIGINT = ANY($1)
              )
            ORDER BY r.created_at ASC, r.id ASC
            "#
        ))
        .bind(batch_ids_param(batch_ids))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("live_reservations_for_batches", e))?;
        rows_into(rows)
    }

    #[instrument(skip(self), fields(draft_invoice_id = %draft_invoice_id), err)]
    async fn reservations_for_draft(
        &self,
        draft_invoice_id: DraftInvoiceId,
    ) -> Result<Vec<Reservation>, StoreError> {
        let rows: Vec<ReservationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RESERVATION_COLUMNS}
            FROM batch_reservations
            WHERE draft_invoice_id = $1
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(draft_invoice_id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reservations_for_draft", e))?;
        rows_into(rows)
    }

    #[instrument(skip(self), fields(line_item_temp_id = %line_item_temp_id), err)]
    async fn live_reservations_for_line(
        &self,
        draft_invoice_id: Option<DraftInvoiceId>,
        line_item_temp_id: &LineItemTempId,
    ) -> Result<Vec<Reservation>, StoreError> {
        let rows: Vec<ReservationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RESERVATION_COLUMNS}
            FROM batch_reservations
            WHERE draft_invoice_id IS NOT DISTINCT FROM $1
              AND line_item_temp_id = $2
              AND status IN ('ACTIVE', 'EXTENDED')
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(draft_invoice_id.map(|d| d.get()))
        .bind(line_item_temp_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("live_reservations_for_line", e))?;
        rows_into(rows)
    }

    #[instrument(skip(self), err)]
    async fn live_reservations_expiring_by(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, StoreError> {
        let rows: Vec<ReservationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RESERVATION_COLUMNS}
            FROM batch_reservations
            WHERE status IN ('ACTIVE', 'EXTENDED') AND expires_at <= $1
            ORDER BY expires_at ASC, id ASC
            "#
        ))
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("live_reservations_expiring_by", e))?;
        rows_into(rows)
    }

    #[instrument(skip(self), fields(reservation_id = %id), err)]
    async fn events_for(&self, id: ReservationId) -> Result<Vec<ReservationEvent>, StoreError> {
        let payloads: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT payload FROM reservation_events WHERE reservation_id = $1 ORDER BY seq ASC",
        )
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("events_for", e))?;

        payloads
            .into_iter()
            .map(|(p,)| serde_json::from_value(p).map_err(corrupt))
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn consumption_for_batch(&self, id: BatchId) -> Result<Vec<ConsumptionRecord>, StoreError> {
        let rows: Vec<ConsumptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {CONSUMPTION_COLUMNS}
            FROM consumption_records
            WHERE batch_id = $1
            ORDER BY consumed_at ASC, invoice_item_id ASC
            "#
        ))
        .bind(id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("consumption_for_batch", e))?;
        rows_into(rows)
    }

    #[instrument(skip(self), err)]
    async fn consumption_for_draft(
        &self,
        draft_invoice_id: DraftInvoiceId,
    ) -> Result<Vec<ConsumptionRecord>, StoreError> {
        let rows: Vec<ConsumptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {CONSUMPTION_COLUMNS}
            FROM consumption_records
            WHERE draft_invoice_id = $1
            ORDER BY invoice_item_id ASC, batch_id ASC
            "#
        ))
        .bind(draft_invoice_id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("consumption_for_draft", e))?;
        rows_into(rows)
    }

    #[instrument(skip(self), err)]
    async fn finalized_invoice(
        &self,
        draft_invoice_id: DraftInvoiceId,
    ) -> Result<Option<FinalizedInvoice>, StoreError> {
        let row: Option<InvoiceRow> = sqlx::query_as(
            r#"
            SELECT draft_invoice_id, invoice_id, invoice_number, status,
                   line_item_mappings, stock_deducted, deductions, finalized_at
            FROM finalized_invoices
            WHERE draft_invoice_id = $1
            "#,
        )
        .bind(draft_invoice_id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finalized_invoice", e))?;
        row.map(FinalizedInvoice::try_from).transpose()
    }

    #[instrument(
        skip(self, changeset),
        fields(
            batches = changeset.batch_versions.len(),
            reservations = changeset.reservations.len(),
            consumptions = changeset.consumptions.len()
        ),
        err
    )]
    async fn apply(
        &self,
        changeset: ReservationChangeset,
    ) -> Result<Option<FinalizedInvoice>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        match write_changeset(&mut tx, changeset).await {
            Ok(finalized) => {
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit_transaction", e))?;
                Ok(finalized)
            }
            Err(err) => Err(after_rollback(err, tx.rollback().await)),
        }
    }
}

async fn write_changeset(
    tx: &mut Transaction<'_, Postgres>,
    changeset: ReservationChangeset,
) -> Result<Option<FinalizedInvoice>, StoreError> {
    for (batch_id, expected) in &changeset.batch_versions {
        let expected = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(i64::try_from(*v).map_err(corrupt)?),
        };
        let consumed = changeset.consumed.get(batch_id).map(|q| q.value());

        let bumped: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE stock_batches
            SET version = version + 1,
                quantity_consumed = COALESCE($3, quantity_consumed)
            WHERE id = $1 AND ($2::BIGINT IS NULL OR version = $2)
            RETURNING version
            "#,
        )
        .bind(batch_id.get())
        .bind(expected)
        .bind(consumed)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("bump_batch_version", e))?;

        if bumped.is_none() {
            return Err(StoreError::Concurrency(format!(
                "batch {batch_id} changed since it was read (expected version {expected:?})"
            )));
        }
    }

    for r in &changeset.reservations {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO batch_reservations ({RESERVATION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at,
                expires_at = EXCLUDED.expires_at,
                invoice_item_id = EXCLUDED.invoice_item_id
            WHERE batch_reservations.status IN ('ACTIVE', 'EXTENDED')
            "#
        ))
        .bind(r.id.as_uuid())
        .bind(r.draft_invoice_id.map(|d| d.get()))
        .bind(r.line_item_temp_id.as_str())
        .bind(r.product_id.get())
        .bind(r.warehouse_id.get())
        .bind(&r.unit)
        .bind(r.requested_quantity.value())
        .bind(to_json(&r.allocations)?)
        .bind(r.method.as_str())
        .bind(r.outcome.as_str())
        .bind(r.status.as_str())
        .bind(r.created_at)
        .bind(r.updated_at)
        .bind(r.expires_at)
        .bind(r.invoice_item_id.map(|i| i.get()))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_reservation", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Concurrency(format!(
                "reservation {} is no longer live",
                r.id
            )));
        }
    }

    for e in &changeset.events {
        sqlx::query(
            r#"
            INSERT INTO reservation_events (reservation_id, event_type, event_version, occurred_at, payload)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(e.reservation_id().as_uuid())
        .bind(e.event_type())
        .bind(e.version() as i32)
        .bind(e.occurred_at())
        .bind(to_json(e)?)
        .execute(&mut **tx)
        .await
        .map_err(|err| map_sqlx_error("insert_event", err))?;
    }

    for c in &changeset.consumptions {
        sqlx::query(&format!(
            r#"
            INSERT INTO consumption_records ({CONSUMPTION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#
        ))
        .bind(c.invoice_item_id.get())
        .bind(c.batch_id.get())
        .bind(c.quantity.value())
        .bind(c.unit_cost_at_consumption)
        .bind(c.draft_invoice_id.get())
        .bind(c.reservation_id.as_uuid())
        .bind(c.consumed_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_consumption", e))?;
    }

    let Some(pending) = changeset.invoice else {
        return Ok(None);
    };

    let (sequence,): (i64,) = sqlx::query_as("SELECT nextval('invoice_number_seq')")
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("next_invoice_number", e))?;

    let record = FinalizedInvoice {
        draft_invoice_id: pending.draft_invoice_id,
        invoice_id: pending.draft_invoice_id.get(),
        invoice_number: FinalizedInvoice::format_number(u64::try_from(sequence).map_err(corrupt)?),
        status: pending.status,
        line_item_mappings: pending.line_item_mappings,
        stock_deducted: pending.stock_deducted,
        deductions: pending.deductions,
        finalized_at: pending.finalized_at,
    };

    sqlx::query(
        r#"
        INSERT INTO finalized_invoices (
            draft_invoice_id, invoice_id, invoice_number, status,
            line_item_mappings, stock_deducted, deductions, finalized_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(record.draft_invoice_id.get())
    .bind(record.invoice_id)
    .bind(&record.invoice_number)
    .bind(encode_label(&record.status)?)
    .bind(to_json(&record.line_item_mappings)?)
    .bind(record.stock_deducted)
    .bind(to_json(&record.deductions)?)
    .bind(record.finalized_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_finalized_invoice", e))?;

    Ok(Some(record))
}

/// The write failure decides the outcome; a failed rollback is only logged
/// (the connection drops the transaction anyway).
fn after_rollback(err: StoreError, rollback: Result<(), sqlx::Error>) -> StoreError {
    if let Err(rollback_err) = rollback {
        warn!(error = %rollback_err, original = %err, "rollback failed");
    }
    err
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Concurrency(msg),
                Some("23514") => StoreError::Corrupt(msg),
                Some("23503") => StoreError::NotFound(msg),
                // serialization_failure / deadlock_detected
                Some("40001") | Some("40P01") => StoreError::Concurrency(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Corrupt(format!("decode failure in {operation}: {err}"))
        }
        sqlx::Error::RowNotFound => {
            StoreError::NotFound(format!("unexpected row not found in {operation}"))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_rollback_keeps_the_write_error() {
        let lost_race = StoreError::Concurrency("batch 1 moved".to_string());
        let err = after_rollback(lost_race.clone(), Err(sqlx::Error::PoolClosed));
        assert_eq!(err, lost_race);
        assert!(!matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn non_database_errors_map_by_kind() {
        assert!(matches!(
            map_sqlx_error("load", sqlx::Error::PoolClosed),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error("load", sqlx::Error::RowNotFound),
            StoreError::NotFound(_)
        ));
    }
}
