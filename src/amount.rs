//! Fixed-scale money type.
//!
//! Wraps `rust_decimal::Decimal` with an enforced scale of 2 and a currency
//! label. At rest amounts are integer minor units so SQL aggregation stays
//! exact; no floating point anywhere.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of decimal places carried by every [`Amount`].
pub const SCALE: u32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("invalid amount: {0}")]
    Invalid(String),

    #[error("amount {0} has more than {SCALE} decimal places")]
    TooPrecise(String),

    #[error("amount {0} does not fit in minor units")]
    OutOfRange(String),

    #[error("invalid currency code: {0}")]
    InvalidCurrency(String),

    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: String, right: String },
}

/// ISO 4217 currency label (three uppercase letters).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Result<Self, AmountError> {
        let code = code.trim().to_ascii_uppercase();
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(AmountError::InvalidCurrency(code));
        }
        Ok(Currency(code))
    }

    pub fn usd() -> Self {
        Currency("USD".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Currency {
    fn default() -> Self {
        Currency::usd()
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Currency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// A signed monetary amount with exactly two decimal places.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Amount {
    value: Decimal,
    currency: Currency,
}

impl Amount {
    /// Builds an amount from a decimal value, rejecting values that carry
    /// more than two decimal places or overflow i64 minor units.
    pub fn new(value: Decimal, currency: Currency) -> Result<Self, AmountError> {
        let normalized = value.normalize();
        if normalized.scale() > SCALE {
            return Err(AmountError::TooPrecise(value.to_string()));
        }
        let mut rescaled = normalized;
        rescaled.rescale(SCALE);
        // Round-trip through minor units up front so arithmetic never has to
        // worry about overflow at the storage boundary.
        let minor = rescaled * Decimal::from(100);
        if minor.to_i64().is_none() {
            return Err(AmountError::OutOfRange(value.to_string()));
        }
        Ok(Amount {
            value: rescaled,
            currency,
        })
    }

    /// Parses a decimal string like `"100.00"` or `"-3.5"`.
    pub fn parse(input: &str, currency: Currency) -> Result<Self, AmountError> {
        let decimal = Decimal::from_str(input.trim())
            .map_err(|_| AmountError::Invalid(input.to_string()))?;
        Amount::new(decimal, currency)
    }

    pub fn zero(currency: Currency) -> Self {
        Amount {
            value: Decimal::new(0, SCALE),
            currency,
        }
    }

    /// Reconstructs an amount from stored minor units (cents).
    pub fn from_minor_units(minor: i64, currency: Currency) -> Self {
        Amount {
            value: Decimal::new(minor, SCALE),
            currency,
        }
    }

    /// Minor-unit (cents) representation. Exact by construction.
    pub fn minor_units(&self) -> i64 {
        let mut scaled = self.value;
        scaled.rescale(SCALE);
        scaled.mantissa() as i64
    }

    pub fn value(&self) -> Decimal {
        self.value
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn is_positive(&self) -> bool {
        self.value > Decimal::ZERO
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    pub fn checked_add(&self, rhs: &Amount) -> Result<Amount, AmountError> {
        self.require_same_currency(rhs)?;
        let sum = self
            .value
            .checked_add(rhs.value)
            .ok_or_else(|| AmountError::OutOfRange(format!("{} + {}", self, rhs)))?;
        Amount::new(sum, self.currency.clone())
    }

    pub fn checked_sub(&self, rhs: &Amount) -> Result<Amount, AmountError> {
        self.require_same_currency(rhs)?;
        let diff = self
            .value
            .checked_sub(rhs.value)
            .ok_or_else(|| AmountError::OutOfRange(format!("{} - {}", self, rhs)))?;
        Amount::new(diff, self.currency.clone())
    }

    pub fn neg(&self) -> Amount {
        Amount {
            value: -self.value,
            currency: self.currency.clone(),
        }
    }

    fn require_same_currency(&self, other: &Amount) -> Result<(), AmountError> {
        if self.currency != other.currency {
            return Err(AmountError::CurrencyMismatch {
                left: self.currency.to_string(),
                right: other.currency.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.value)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:.2}", self.value))
    }
}
