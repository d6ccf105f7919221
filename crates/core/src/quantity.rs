//! Stock quantities.
//!
//! Quantities are decimal so the same engine serves piece-counted products and
//! weight-based units. A `Quantity` is never negative.

use core::iter::Sum;
use core::ops::{Add, AddAssign};

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::DomainError;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Quantity(Decimal);

impl Quantity {
    pub const ZERO: Quantity = Quantity(Decimal::ZERO);

    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(DomainError::validation(format!(
                "quantity cannot be negative (got {value})"
            )));
        }
        Ok(Self(value.normalize()))
    }

    /// A quantity that must be strictly positive (requests, allocation lines).
    pub fn positive(value: Decimal) -> Result<Self, DomainError> {
        let q = Self::new(value)?;
        if q.is_zero() {
            return Err(DomainError::validation("quantity must be greater than zero"));
        }
        Ok(q)
    }

    pub fn from_int(value: u32) -> Self {
        Self(Decimal::from(value))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// `self - other`, clamped at zero.
    pub fn saturating_sub(self, other: Quantity) -> Quantity {
        if other.0 >= self.0 {
            Quantity::ZERO
        } else {
            Quantity((self.0 - other.0).normalize())
        }
    }

    /// `self - other`, or `None` if that would go negative.
    pub fn checked_sub(self, other: Quantity) -> Option<Quantity> {
        if other.0 > self.0 {
            None
        } else {
            Some(Quantity((self.0 - other.0).normalize()))
        }
    }
}

impl Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Self) -> Self::Output {
        Quantity((self.0 + rhs.0).normalize())
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for Quantity {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Quantity::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Quantity> for Quantity {
    fn sum<I: Iterator<Item = &'a Quantity>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

impl core::fmt::Display for Quantity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl TryFrom<Decimal> for Quantity {
    type Error = DomainError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = <Decimal as Deserialize>::deserialize(deserializer)?;
        Quantity::new(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::str::FromStr;

    fn q(s: &str) -> Quantity {
        Quantity::new(Decimal::from_str(s).unwrap()).unwrap()
    }

    #[test]
    fn rejects_negative() {
        assert!(Quantity::new(Decimal::from(-1)).is_err());
        assert!(Quantity::positive(Decimal::ZERO).is_err());
    }

    #[test]
    fn arithmetic_normalizes_scale() {
        assert_eq!((q("100.50") + q("0.50")).to_string(), "101");
        assert_eq!(q("2.500").to_string(), "2.5");
    }

    #[test]
    fn saturating_and_checked_sub() {
        assert_eq!(q("5").saturating_sub(q("7")), Quantity::ZERO);
        assert_eq!(q("5").checked_sub(q("7")), None);
        assert_eq!(q("7").checked_sub(q("5")), Some(q("2")));
    }

    #[test]
    fn deserializes_numbers_and_strings() {
        let a: Quantity = serde_json::from_str("12.5").unwrap();
        let b: Quantity = serde_json::from_str("\"12.5\"").unwrap();
        assert_eq!(a, b);
        assert!(serde_json::from_str::<Quantity>("-3").is_err());
    }

    #[test]
    fn json_round_trip_keeps_string_form() {
        let original = q("250.75");
        let encoded = serde_json::to_string(&original).unwrap();
        assert_eq!(encoded, "\"250.75\"");
        let decoded: Quantity = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, original);

        let from_int: Quantity = serde_json::from_str("40").unwrap();
        assert_eq!(from_int, Quantity::from_int(40));
    }
}
