use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockhold_core::{BatchId, DraftInvoiceId, InvoiceItemId, Quantity, ReservationId};

/// Durable record of which batch supplied how much to which invoice line.
///
/// One per `(invoice_item_id, batch_id)`. The unit cost is the batch cost at
/// the moment of finalize and is what margin reporting uses as COGS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    pub invoice_item_id: InvoiceItemId,
    pub batch_id: BatchId,
    pub quantity: Quantity,
    pub unit_cost_at_consumption: Decimal,
    pub draft_invoice_id: DraftInvoiceId,
    pub reservation_id: ReservationId,
    pub consumed_at: DateTime<Utc>,
}

impl ConsumptionRecord {
    pub fn total_cost(&self) -> Decimal {
        (self.quantity.value() * self.unit_cost_at_consumption).normalize()
    }
}
