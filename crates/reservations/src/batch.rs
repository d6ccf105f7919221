use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockhold_core::{BatchId, DomainError, ProductId, Quantity, WarehouseId};

/// How a batch entered the warehouse.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcurementChannel {
    Local,
    Imported,
}

impl ProcurementChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcurementChannel::Local => "LOCAL",
            ProcurementChannel::Imported => "IMPORTED",
        }
    }
}

impl core::str::FromStr for ProcurementChannel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOCAL" => Ok(Self::Local),
            "IMPORTED" => Ok(Self::Imported),
            other => Err(DomainError::validation(format!(
                "procurement_channel must be LOCAL or IMPORTED, got {other:?}"
            ))),
        }
    }
}

/// A stock batch as the ledger reports it.
///
/// `version` increments on every committed change to the batch's holds or
/// consumption and backs the compare-and-swap on writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockBatch {
    pub id: BatchId,
    pub batch_number: String,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub quantity_on_hand: Quantity,
    pub quantity_consumed: Quantity,
    pub procurement_channel: ProcurementChannel,
    pub unit_cost: Decimal,
    pub received_at: DateTime<Utc>,
    pub version: u64,
}

impl StockBatch {
    /// Quantity physically left: `on_hand - consumed`.
    pub fn remaining(&self) -> Quantity {
        self.quantity_on_hand.saturating_sub(self.quantity_consumed)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn days_in_stock(&self, now: DateTime<Utc>) -> i64 {
        (now - self.received_at).num_days().max(0)
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.batch_number.trim().is_empty() {
            return Err(DomainError::validation("batch_number cannot be empty"));
        }
        if self.unit_cost.is_sign_negative() && !self.unit_cost.is_zero() {
            return Err(DomainError::validation("unit_cost cannot be negative"));
        }
        if self.quantity_consumed > self.quantity_on_hand {
            return Err(DomainError::invariant(format!(
                "batch {}: consumed {} exceeds on hand {}",
                self.id, self.quantity_consumed, self.quantity_on_hand
            )));
        }
        Ok(())
    }

    /// Consumed quantity after taking `qty` more, or an invariant error if
    /// that would exceed what is on hand.
    pub fn consumed_after(&self, qty: Quantity) -> Result<Quantity, DomainError> {
        let next = self.quantity_consumed + qty;
        if next > self.quantity_on_hand {
            return Err(DomainError::invariant(format!(
                "batch {}: consuming {} would exceed on hand {}",
                self.id, qty, self.quantity_on_hand
            )));
        }
        Ok(next)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::batch;
    use super::*;

    #[test]
    fn remaining_subtracts_consumed() {
        let mut b = batch(1, 500, (2024, 1, 1));
        b.quantity_consumed = Quantity::from_int(120);
        assert_eq!(b.remaining(), Quantity::from_int(380));
        assert!(!b.is_exhausted());
    }

    #[test]
    fn consuming_past_on_hand_is_rejected() {
        let mut b = batch(1, 100, (2024, 1, 1));
        b.quantity_consumed = Quantity::from_int(90);
        assert!(b.consumed_after(Quantity::from_int(11)).is_err());
        assert_eq!(
            b.consumed_after(Quantity::from_int(10)).unwrap(),
            Quantity::from_int(100)
        );
    }

    #[test]
    fn channel_parses_case_insensitively() {
        assert_eq!("imported".parse::<ProcurementChannel>().unwrap(), ProcurementChannel::Imported);
        assert!("overseas".parse::<ProcurementChannel>().is_err());
    }
}
