use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockhold_core::{
    BatchId, DomainError, DraftInvoiceId, InvoiceItemId, LineItemTempId, ProductId, Quantity,
    ReservationId, WarehouseId,
};
use stockhold_infra::{
    AllocationReceipt, BatchDetail, DraftReservations, FinalizeReceipt, FifoRequest,
    FinalizeRequest, ManualRequest,
};
use stockhold_reservations::{
    AllocationLine, AllocationMethod, AllocationOutcome, BatchAvailability, BatchDeduction,
    ConsumptionRecord, InvoiceStatus, LineItemMapping, ManualLine, ProcurementChannel,
    Reservation, ReservationEvent, ReservationStatus, StockBatch, UtilizationSummary,
};

// Requests use snake_case field names; responses are camelCase.

fn default_unit() -> String {
    "pcs".to_string()
}

fn default_target_status() -> InvoiceStatus {
    InvoiceStatus::Issued
}

#[derive(Debug, Deserialize)]
pub struct FifoAllocateRequest {
    /// `0` or absent means the draft is not persisted yet.
    pub draft_invoice_id: Option<i64>,
    pub product_id: i64,
    pub warehouse_id: i64,
    pub required_quantity: Decimal,
    #[serde(default = "default_unit")]
    pub unit: String,
    pub line_item_temp_id: String,
}

impl FifoAllocateRequest {
    pub fn into_domain(self) -> Result<FifoRequest, DomainError> {
        Ok(FifoRequest {
            draft_invoice_id: DraftInvoiceId::from_wire(self.draft_invoice_id)?,
            product_id: ProductId::new(self.product_id)?,
            warehouse_id: WarehouseId::new(self.warehouse_id)?,
            required_quantity: Quantity::positive(self.required_quantity)?,
            unit: self.unit,
            line_item_temp_id: LineItemTempId::new(self.line_item_temp_id)?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ManualLineRequest {
    #[serde(alias = "batchId")]
    pub batch_id: i64,
    pub quantity: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct ManualAllocateRequest {
    pub draft_invoice_id: Option<i64>,
    pub product_id: i64,
    pub warehouse_id: i64,
    pub line_item_temp_id: String,
    #[serde(default = "default_unit")]
    pub unit: String,
    pub allocations: Vec<ManualLineRequest>,
}

impl ManualAllocateRequest {
    pub fn into_domain(self) -> Result<ManualRequest, DomainError> {
        let allocations = self
            .allocations
            .into_iter()
            .map(|l| {
                Ok(ManualLine {
                    batch_id: BatchId::new(l.batch_id)?,
                    quantity: Quantity::new(l.quantity)?,
                })
            })
            .collect::<Result<Vec<_>, DomainError>>()?;

        Ok(ManualRequest {
            draft_invoice_id: DraftInvoiceId::from_wire(self.draft_invoice_id)?,
            product_id: ProductId::new(self.product_id)?,
            warehouse_id: WarehouseId::new(self.warehouse_id)?,
            line_item_temp_id: LineItemTempId::new(self.line_item_temp_id)?,
            unit: self.unit,
            allocations,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct AvailableQuery {
    pub product_id: i64,
    pub warehouse_id: i64,
    pub draft_invoice_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub product_id: i64,
    pub warehouse_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct DraftQuery {
    pub line_item_temp_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LineItemQuery {
    pub draft_invoice_id: Option<i64>,
    pub line_item_temp_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ExpiringQuery {
    pub within_minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ExtendRequest {
    pub draft_invoice_id: Option<i64>,
    pub line_item_temp_id: Option<String>,
    pub extend_minutes: i64,
}

#[derive(Debug, Deserialize)]
pub struct LineItemMappingRequest {
    pub line_item_temp_id: String,
    pub invoice_item_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct FinalizeRequestBody {
    pub draft_invoice_id: i64,
    pub line_item_mappings: Vec<LineItemMappingRequest>,
    #[serde(default = "default_target_status")]
    pub target_status: InvoiceStatus,
    #[serde(default)]
    pub skip_stock_deduction: bool,
}

impl FinalizeRequestBody {
    pub fn into_domain(self) -> Result<FinalizeRequest, DomainError> {
        let line_item_mappings = self
            .line_item_mappings
            .into_iter()
            .map(|m| {
                Ok(LineItemMapping {
                    line_item_temp_id: LineItemTempId::new(m.line_item_temp_id)?,
                    invoice_item_id: InvoiceItemId::new(m.invoice_item_id)?,
                })
            })
            .collect::<Result<Vec<_>, DomainError>>()?;

        Ok(FinalizeRequest {
            draft_invoice_id: DraftInvoiceId::new(self.draft_invoice_id)?,
            line_item_mappings,
            target_status: self.target_status,
            skip_stock_deduction: self.skip_stock_deduction,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ReceiveBatchRequest {
    pub id: i64,
    pub batch_number: String,
    pub product_id: i64,
    pub warehouse_id: i64,
    pub quantity_on_hand: Decimal,
    #[serde(default)]
    pub quantity_consumed: Option<Decimal>,
    #[serde(default = "default_channel")]
    pub procurement_channel: ProcurementChannel,
    pub unit_cost: Decimal,
    pub received_at: Option<DateTime<Utc>>,
}

fn default_channel() -> ProcurementChannel {
    ProcurementChannel::Local
}

impl ReceiveBatchRequest {
    /// `quantity_consumed` only applies to a batch the ledger has not seen yet.
    pub fn into_domain(self, now: DateTime<Utc>) -> Result<StockBatch, DomainError> {
        Ok(StockBatch {
            id: BatchId::new(self.id)?,
            batch_number: self.batch_number,
            product_id: ProductId::new(self.product_id)?,
            warehouse_id: WarehouseId::new(self.warehouse_id)?,
            quantity_on_hand: Quantity::new(self.quantity_on_hand)?,
            quantity_consumed: Quantity::new(self.quantity_consumed.unwrap_or_default())?,
            procurement_channel: self.procurement_channel,
            unit_cost: self.unit_cost,
            received_at: self.received_at.unwrap_or(now),
            version: 0,
        })
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationLineView {
    pub batch_id: BatchId,
    pub quantity: Quantity,
}

impl From<&AllocationLine> for AllocationLineView {
    fn from(l: &AllocationLine) -> Self {
        Self {
            batch_id: l.batch_id,
            quantity: l.quantity,
        }
    }
}

fn lines(r: &Reservation) -> Vec<AllocationLineView> {
    r.allocations.iter().map(AllocationLineView::from).collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResponse {
    pub success: bool,
    pub reservation_id: ReservationId,
    pub allocations: Vec<AllocationLineView>,
    pub expires_at: DateTime<Utc>,
    pub requested_quantity: Quantity,
    pub total_reserved: Quantity,
    pub method: AllocationMethod,
    pub outcome: AllocationOutcome,
    pub message: String,
    pub superseded_reservation_id: Option<ReservationId>,
}

impl From<AllocationReceipt> for AllocationResponse {
    fn from(receipt: AllocationReceipt) -> Self {
        let r = &receipt.reservation;
        Self {
            success: true,
            reservation_id: r.id,
            allocations: lines(r),
            expires_at: r.expires_at,
            requested_quantity: r.requested_quantity,
            total_reserved: r.total_reserved(),
            method: r.method,
            outcome: receipt.outcome,
            message: receipt.message,
            superseded_reservation_id: receipt.superseded,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationView {
    pub id: ReservationId,
    pub draft_invoice_id: Option<DraftInvoiceId>,
    pub line_item_temp_id: LineItemTempId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub unit: String,
    pub requested_quantity: Quantity,
    pub total_reserved: Quantity,
    pub allocations: Vec<AllocationLineView>,
    pub method: AllocationMethod,
    pub outcome: AllocationOutcome,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub invoice_item_id: Option<InvoiceItemId>,
}

impl From<&Reservation> for ReservationView {
    fn from(r: &Reservation) -> Self {
        Self {
            id: r.id,
            draft_invoice_id: r.draft_invoice_id,
            line_item_temp_id: r.line_item_temp_id.clone(),
            product_id: r.product_id,
            warehouse_id: r.warehouse_id,
            unit: r.unit.clone(),
            requested_quantity: r.requested_quantity,
            total_reserved: r.total_reserved(),
            allocations: lines(r),
            method: r.method,
            outcome: r.outcome,
            status: r.status,
            created_at: r.created_at,
            updated_at: r.updated_at,
            expires_at: r.expires_at,
            invoice_item_id: r.invoice_item_id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftReservationsResponse {
    pub reservations: Vec<ReservationView>,
    pub total_reserved: Quantity,
}

impl From<DraftReservations> for DraftReservationsResponse {
    fn from(d: DraftReservations) -> Self {
        Self {
            reservations: d.reservations.iter().map(ReservationView::from).collect(),
            total_reserved: d.total_reserved,
        }
    }
}

/// One row of the availability view. `pcs*` names are kept for existing clients.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableBatchView {
    pub id: BatchId,
    pub batch_number: String,
    pub quantity_on_hand: Quantity,
    pub quantity_consumed: Quantity,
    pub pcs_reserved_others: Quantity,
    pub pcs_reserved_own: Quantity,
    pub pcs_available: Quantity,
    pub quantity_allocatable: Quantity,
    pub unit_cost: Decimal,
    pub procurement_channel: ProcurementChannel,
    pub received_at: DateTime<Utc>,
    pub days_in_stock: i64,
}

impl From<BatchAvailability> for AvailableBatchView {
    fn from(b: BatchAvailability) -> Self {
        Self {
            id: b.batch_id,
            batch_number: b.batch_number,
            quantity_on_hand: b.quantity_on_hand,
            quantity_consumed: b.quantity_consumed,
            pcs_reserved_others: b.quantity_reserved_others,
            pcs_reserved_own: b.quantity_reserved_own,
            pcs_available: b.quantity_allocatable,
            quantity_allocatable: b.quantity_allocatable,
            unit_cost: b.unit_cost,
            procurement_channel: b.procurement_channel,
            received_at: b.received_at,
            days_in_stock: b.days_in_stock,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableBatchesResponse {
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub batches: Vec<AvailableBatchView>,
    pub total_allocatable: Quantity,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryResponse {
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub batch_count: usize,
    pub quantity_on_hand: Quantity,
    pub quantity_consumed: Quantity,
    pub quantity_reserved: Quantity,
    pub quantity_allocatable: Quantity,
    pub utilization_percent: Decimal,
}

impl SummaryResponse {
    pub fn new(product_id: ProductId, warehouse_id: WarehouseId, s: UtilizationSummary) -> Self {
        Self {
            product_id,
            warehouse_id,
            batch_count: s.batch_count,
            quantity_on_hand: s.quantity_on_hand,
            quantity_consumed: s.quantity_consumed,
            quantity_reserved: s.quantity_reserved,
            quantity_allocatable: s.quantity_allocatable,
            utilization_percent: s.utilization_percent,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedReservationView {
    pub reservation_id: ReservationId,
    pub line_item_temp_id: LineItemTempId,
    pub expires_at: DateTime<Utc>,
    pub allocations: Vec<AllocationLineView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendResponse {
    pub success: bool,
    /// Latest new expiry across the extended reservations.
    pub expires_at: Option<DateTime<Utc>>,
    pub reservations: Vec<ExtendedReservationView>,
}

impl From<Vec<Reservation>> for ExtendResponse {
    fn from(extended: Vec<Reservation>) -> Self {
        Self {
            success: true,
            expires_at: extended.iter().map(|r| r.expires_at).max(),
            reservations: extended
                .iter()
                .map(|r| ExtendedReservationView {
                    reservation_id: r.id,
                    line_item_temp_id: r.line_item_temp_id.clone(),
                    expires_at: r.expires_at,
                    allocations: lines(r),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumptionView {
    pub invoice_item_id: InvoiceItemId,
    pub batch_id: BatchId,
    pub quantity: Quantity,
    pub unit_cost_at_consumption: Decimal,
    pub total_cost: Decimal,
    pub draft_invoice_id: DraftInvoiceId,
    pub reservation_id: ReservationId,
    pub consumed_at: DateTime<Utc>,
}

impl From<&ConsumptionRecord> for ConsumptionView {
    fn from(c: &ConsumptionRecord) -> Self {
        Self {
            invoice_item_id: c.invoice_item_id,
            batch_id: c.batch_id,
            quantity: c.quantity,
            unit_cost_at_consumption: c.unit_cost_at_consumption,
            total_cost: c.total_cost(),
            draft_invoice_id: c.draft_invoice_id,
            reservation_id: c.reservation_id,
            consumed_at: c.consumed_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeductionView {
    pub batch_id: BatchId,
    pub quantity: Quantity,
    pub consumed_before: Quantity,
    pub consumed_after: Quantity,
}

impl From<&BatchDeduction> for DeductionView {
    fn from(d: &BatchDeduction) -> Self {
        Self {
            batch_id: d.batch_id,
            quantity: d.quantity,
            consumed_before: d.consumed_before,
            consumed_after: d.consumed_after,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockDeductionSummary {
    pub stock_deducted: bool,
    pub total_quantity: Quantity,
    pub total_cost: Decimal,
    pub deductions: Vec<DeductionView>,
    pub consumption_records: Vec<ConsumptionView>,
    pub converted_reservations: Vec<ReservationId>,
    pub unreserved_line_items: Vec<LineItemTempId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub success: bool,
    pub invoice_id: i64,
    pub invoice_number: String,
    pub status: InvoiceStatus,
    pub finalized_at: DateTime<Utc>,
    /// True when this call returned the result of an earlier identical finalize.
    pub replayed: bool,
    pub stock_deduction_summary: StockDeductionSummary,
}

impl From<FinalizeReceipt> for FinalizeResponse {
    fn from(r: FinalizeReceipt) -> Self {
        let total_quantity = r.consumptions.iter().map(|c| c.quantity).sum();
        let total_cost = r.consumptions.iter().map(|c| c.total_cost()).sum::<Decimal>().normalize();
        Self {
            success: true,
            invoice_id: r.invoice.invoice_id,
            invoice_number: r.invoice.invoice_number.clone(),
            status: r.invoice.status,
            finalized_at: r.invoice.finalized_at,
            replayed: r.replayed,
            stock_deduction_summary: StockDeductionSummary {
                stock_deducted: r.invoice.stock_deducted,
                total_quantity,
                total_cost,
                deductions: r.invoice.deductions.iter().map(DeductionView::from).collect(),
                consumption_records: r.consumptions.iter().map(ConsumptionView::from).collect(),
                converted_reservations: r.converted,
                unreserved_line_items: r.unreserved_lines,
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub event_type: &'static str,
    pub occurred_at: DateTime<Utc>,
    pub payload: ReservationEvent,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub reservation_id: ReservationId,
    pub events: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockBatchView {
    pub id: BatchId,
    pub batch_number: String,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub quantity_on_hand: Quantity,
    pub quantity_consumed: Quantity,
    pub quantity_remaining: Quantity,
    pub procurement_channel: ProcurementChannel,
    pub unit_cost: Decimal,
    pub received_at: DateTime<Utc>,
    pub version: u64,
}

impl From<&StockBatch> for StockBatchView {
    fn from(b: &StockBatch) -> Self {
        Self {
            id: b.id,
            batch_number: b.batch_number.clone(),
            product_id: b.product_id,
            warehouse_id: b.warehouse_id,
            quantity_on_hand: b.quantity_on_hand,
            quantity_consumed: b.quantity_consumed,
            quantity_remaining: b.remaining(),
            procurement_channel: b.procurement_channel,
            unit_cost: b.unit_cost,
            received_at: b.received_at,
            version: b.version,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDetailResponse {
    pub batch: StockBatchView,
    pub consumptions: Vec<ConsumptionView>,
}

impl From<BatchDetail> for BatchDetailResponse {
    fn from(d: BatchDetail) -> Self {
        Self {
            batch: StockBatchView::from(&d.batch),
            consumptions: d.consumptions.iter().map(ConsumptionView::from).collect(),
        }
    }
}
