//! Reservation persistence boundary.
//!
//! Batches, reservations, their audit events, consumption records and
//! finalized invoices all live behind one repository so that a single
//! changeset can move them together.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryReservationRepository;
pub use postgres::PostgresReservationRepository;
pub use r#trait::{
    FinalizedInvoice, PendingInvoice, ReservationChangeset, ReservationRepository, StoreError,
};
