//! # Money Types
//!
//! Currency codes and integer minor-unit amounts.
//! Amounts are never represented as floats anywhere in the core.

use crate::error::PaymentError;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported currencies (ISO 4217)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    #[default]
    INR,
    USD,
    EUR,
    GBP,
    SGD,
    AED,
    AUD,
    CAD,
    JPY,
}

impl Currency {
    /// Returns the ISO 4217 currency code
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::INR => "INR",
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
            Currency::SGD => "SGD",
            Currency::AED => "AED",
            Currency::AUD => "AUD",
            Currency::CAD => "CAD",
            Currency::JPY => "JPY",
        }
    }

    /// Number of decimal places of the minor unit (JPY has none)
    pub fn decimal_places(&self) -> u32 {
        match self {
            Currency::JPY => 0,
            _ => 2,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Currency::INR => "₹",
            Currency::USD => "$",
            Currency::EUR => "€",
            Currency::GBP => "£",
            Currency::SGD => "S$",
            Currency::AED => "AED ",
            Currency::AUD => "A$",
            Currency::CAD => "C$",
            Currency::JPY => "¥",
        }
    }
}

impl FromStr for Currency {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INR" => Ok(Currency::INR),
            "USD" => Ok(Currency::USD),
            "EUR" => Ok(Currency::EUR),
            "GBP" => Ok(Currency::GBP),
            "SGD" => Ok(Currency::SGD),
            "AED" => Ok(Currency::AED),
            "AUD" => Ok(Currency::AUD),
            "CAD" => Ok(Currency::CAD),
            "JPY" => Ok(Currency::JPY),
            other => Err(PaymentError::Validation(format!(
                "Unsupported currency: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A strictly positive amount in the smallest currency unit (paise, cents),
/// at most `i64::MAX` so it always fits a SQL `BIGINT`.
///
/// Deserialization only accepts JSON/TOML integers: `0`, negatives,
/// out-of-range and fractional values such as `1050.5` are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct MinorUnits(u64);

impl MinorUnits {
    pub const MAX: u64 = i64::MAX as u64;

    pub fn new(amount: u64) -> Result<Self, PaymentError> {
        if amount == 0 {
            return Err(PaymentError::Validation(
                "Amount must be greater than zero".to_string(),
            ));
        }
        if amount > Self::MAX {
            return Err(PaymentError::Validation(format!(
                "Amount must not exceed {}",
                Self::MAX
            )));
        }
        Ok(Self(amount))
    }

    /// Build from a signed value (as stored in SQL `BIGINT` columns)
    pub fn from_i64(amount: i64) -> Result<Self, PaymentError> {
        let amount = u64::try_from(amount).map_err(|_| {
            PaymentError::Validation("Amount must be greater than zero".to_string())
        })?;
        Self::new(amount)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    /// Value as `i64` for storage. Lossless, since `new` caps at `MAX`.
    pub fn as_i64(&self) -> i64 {
        self.0 as i64
    }
}

impl fmt::Display for MinorUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct MinorUnitsVisitor;

impl<'de> Visitor<'de> for MinorUnitsVisitor {
    type Value = MinorUnits;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a positive integer amount in minor currency units")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        MinorUnits::new(v).map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        MinorUnits::from_i64(v).map_err(E::custom)
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        Err(E::custom(format!(
            "amount must be an integer number of minor units, got {}",
            v
        )))
    }
}

impl<'de> Deserialize<'de> for MinorUnits {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(MinorUnitsVisitor)
    }
}

/// An amount together with its currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: MinorUnits,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: MinorUnits, currency: Currency) -> Self {
        Self { amount, currency }
    }

    /// Format for display (e.g., "₹250.00")
    pub fn display(&self) -> String {
        let places = self.currency.decimal_places();
        if places == 0 {
            return format!("{}{}", self.currency.symbol(), self.amount.get());
        }
        let divisor = 10_u64.pow(places);
        format!(
            "{}{}.{:0width$}",
            self.currency.symbol(),
            self.amount.get() / divisor,
            self.amount.get() % divisor,
            width = places as usize
        )
    }
}
