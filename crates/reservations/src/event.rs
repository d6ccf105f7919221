use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockhold_core::{DraftInvoiceId, Event, InvoiceItemId, LineItemTempId, ReservationId};

use crate::reservation::AllocationLine;

/// Audit trail of reservation transitions.
///
/// Appended in the same atomic write as the state change it describes, so the
/// history of a reservation (including supersession) can always be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReservationEvent {
    Created {
        reservation_id: ReservationId,
        draft_invoice_id: Option<DraftInvoiceId>,
        line_item_temp_id: LineItemTempId,
        allocations: Vec<AllocationLine>,
        expires_at: DateTime<Utc>,
        occurred_at: DateTime<Utc>,
    },
    Extended {
        reservation_id: ReservationId,
        expires_at: DateTime<Utc>,
        occurred_at: DateTime<Utc>,
    },
    Cancelled {
        reservation_id: ReservationId,
        occurred_at: DateTime<Utc>,
    },
    Superseded {
        reservation_id: ReservationId,
        superseded_by: ReservationId,
        occurred_at: DateTime<Utc>,
    },
    Expired {
        reservation_id: ReservationId,
        occurred_at: DateTime<Utc>,
    },
    Converted {
        reservation_id: ReservationId,
        invoice_item_id: InvoiceItemId,
        occurred_at: DateTime<Utc>,
    },
}

impl ReservationEvent {
    pub fn reservation_id(&self) -> ReservationId {
        match self {
            ReservationEvent::Created { reservation_id, .. }
            | ReservationEvent::Extended { reservation_id, .. }
            | ReservationEvent::Cancelled { reservation_id, .. }
            | ReservationEvent::Superseded { reservation_id, .. }
            | ReservationEvent::Expired { reservation_id, .. }
            | ReservationEvent::Converted { reservation_id, .. } => *reservation_id,
        }
    }
}

impl Event for ReservationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ReservationEvent::Created { .. } => "reservation.created",
            ReservationEvent::Extended { .. } => "reservation.extended",
            ReservationEvent::Cancelled { .. } => "reservation.cancelled",
            ReservationEvent::Superseded { .. } => "reservation.superseded",
            ReservationEvent::Expired { .. } => "reservation.expired",
            ReservationEvent::Converted { .. } => "reservation.converted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ReservationEvent::Created { occurred_at, .. }
            | ReservationEvent::Extended { occurred_at, .. }
            | ReservationEvent::Cancelled { occurred_at, .. }
            | ReservationEvent::Superseded { occurred_at, .. }
            | ReservationEvent::Expired { occurred_at, .. }
            | ReservationEvent::Converted { occurred_at, .. } => *occurred_at,
        }
    }
}
