//! `stockhold-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, quantities, the domain error model, optimistic-concurrency
//! expectations and the clock abstraction used for expiry.

pub mod clock;
pub mod concurrency;
pub mod error;
pub mod event;
pub mod id;
pub mod quantity;

pub use clock::{Clock, ManualClock, SystemClock};
pub use concurrency::ExpectedVersion;
pub use error::{DomainError, DomainResult};
pub use event::Event;
pub use id::{
    BatchId, DraftInvoiceId, InvoiceItemId, LineItemTempId, ProductId, ReservationId, WarehouseId,
};
pub use quantity::Quantity;
