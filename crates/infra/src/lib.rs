//! Infrastructure layer: storage, locking, scheduling and configuration
//! around the reservation domain.

pub mod config;
pub mod engine;
pub mod locks;
pub mod retry;
pub mod store;
pub mod sweeper;

#[cfg(test)]
mod integration_tests;

pub use config::{EngineConfig, ServiceConfig};
pub use engine::{
    AllocationReceipt, BatchDetail, DraftReservations, EngineError, EngineResult, FifoRequest,
    FinalizeReceipt, FinalizeRequest, ManualRequest, ReservationEngine, SweepReport,
};
pub use retry::{AllocationRetryGuard, BackoffStrategy, RetryDecision, RetryPolicy, with_retry};
pub use store::{
    FinalizedInvoice, InMemoryReservationRepository, PostgresReservationRepository,
    ReservationChangeset, ReservationRepository, StoreError,
};
pub use sweeper::{SweeperHandle, SweeperStats, spawn_sweeper};
