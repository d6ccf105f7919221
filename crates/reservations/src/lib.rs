//! Batch reservation domain (pure, deterministic).
//!
//! This crate contains the business rules for holding, allocating and
//! consuming stock batches: availability accounting, FIFO and manual
//! allocation, the reservation state machine, and finalize planning.
//! It performs no IO; storage, locking and scheduling live in
//! `stockhold-infra`.

pub mod allocation;
pub mod availability;
pub mod batch;
pub mod consumption;
pub mod error;
pub mod event;
pub mod finalize;
pub mod reservation;

pub use allocation::{AllocationOutcome, AllocationPlan, ManualLine, fifo_select, validate_manual};
pub use availability::{BatchAvailability, HoldExemption, UtilizationSummary, compute_availability};
pub use batch::{ProcurementChannel, StockBatch};
pub use consumption::ConsumptionRecord;
pub use error::{ReservationError, ReservationResult};
pub use event::ReservationEvent;
pub use finalize::{
    BatchDeduction, FinalizePlan, InvoiceStatus, LineItemMapping, plan_finalize,
};
pub use reservation::{AllocationLine, AllocationMethod, Reservation, ReservationStatus};
