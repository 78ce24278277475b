//! # Order Types
//!
//! One-shot purchase records and their forward-only status machine.

use crate::error::PaymentError;
use crate::money::{Currency, MinorUnits, Money};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Payment status of an order
///
/// ```text
/// uninitiated ──► pending ──► paid
///      │             ├──────► failed
///      ├─────────────┴──────► cancelled
///      └───────── cash ─────► paid
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Known to the merchant, no gateway order yet
    #[default]
    Uninitiated,
    /// Gateway order minted, awaiting payment
    Pending,
    /// Payment captured and verified
    Paid,
    /// Payment failed
    Failed,
    /// Cancelled before payment
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Uninitiated => "uninitiated",
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Failed => "failed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Paid | OrderStatus::Failed | OrderStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal forward transition
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Uninitiated, Pending)
                | (Uninitiated, Paid)
                | (Uninitiated, Cancelled)
                | (Pending, Paid)
                | (Pending, Failed)
                | (Pending, Cancelled)
        )
    }
}

impl FromStr for OrderStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uninitiated" => Ok(OrderStatus::Uninitiated),
            "pending" => Ok(OrderStatus::Pending),
            "paid" => Ok(OrderStatus::Paid),
            "failed" => Ok(OrderStatus::Failed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(PaymentError::Validation(format!(
                "Unknown order status: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an order was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Captured through the payment gateway
    Gateway,
    /// Collected at the counter and recorded by staff
    Cash,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Gateway => "gateway",
            PaymentMethod::Cash => "cash",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gateway" => Ok(PaymentMethod::Gateway),
            "cash" => Ok(PaymentMethod::Cash),
            other => Err(PaymentError::Validation(format!(
                "Unknown payment method: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A merchant order as seen by the payment core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Merchant-owned identifier (primary key)
    pub internal_id: String,

    /// Provider order id, set once the order goes pending
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_order_id: Option<String>,

    /// Amount in minor units
    pub amount_minor_units: MinorUnits,

    pub currency: Currency,

    pub status: OrderStatus,

    /// Provider payment id, set on verified capture
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,

    /// Checkout callback signature; absent for webhook and cash settlement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    /// Set once the order is paid
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<PaymentMethod>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a fresh `uninitiated` order
    pub fn new(internal_id: impl Into<String>, amount: MinorUnits, currency: Currency) -> Self {
        let now = Utc::now();
        Self {
            internal_id: internal_id.into(),
            gateway_order_id: None,
            amount_minor_units: amount,
            currency,
            status: OrderStatus::Uninitiated,
            payment_id: None,
            signature: None,
            payment_method: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn total(&self) -> Money {
        Money::new(self.amount_minor_units, self.currency)
    }
}

/// Outcome of an idempotent settlement write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    /// State changed by this call
    Applied,
    /// Identical payload seen before; nothing changed
    Replayed,
}

/// Cash handed over at the counter, as recorded by a staff member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CashReceipt {
    pub staff_id: String,
    /// Must equal the order amount
    pub amount: MinorUnits,
    pub notes: Option<String>,
}

/// A settled payment row (one per paid order)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub id: Uuid,
    pub internal_order_id: String,
    pub method: PaymentMethod,
    /// Gateway ids are only present for gateway captures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_payment_id: Option<String>,
    pub amount_minor_units: MinorUnits,
    pub currency: Currency,
    pub status: String,
    /// Staff member who took a cash payment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn captured(order: &Order, gateway_order_id: &str, gateway_payment_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            internal_order_id: order.internal_id.clone(),
            method: PaymentMethod::Gateway,
            gateway_order_id: Some(gateway_order_id.to_string()),
            gateway_payment_id: Some(gateway_payment_id.to_string()),
            amount_minor_units: order.amount_minor_units,
            currency: order.currency,
            status: "captured".to_string(),
            recorded_by: None,
            notes: None,
            created_at: Utc::now(),
        }
    }

    pub fn cash(order: &Order, receipt: &CashReceipt) -> Self {
        Self {
            id: Uuid::new_v4(),
            internal_order_id: order.internal_id.clone(),
            method: PaymentMethod::Cash,
            gateway_order_id: None,
            gateway_payment_id: None,
            amount_minor_units: receipt.amount,
            currency: order.currency,
            status: "collected".to_string(),
            recorded_by: Some(receipt.staff_id.clone()),
            notes: receipt.notes.clone(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only_transitions() {
        use OrderStatus::*;
        assert!(Uninitiated.can_transition_to(Pending));
        assert!(Uninitiated.can_transition_to(Paid));
        assert!(Pending.can_transition_to(Paid));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Cancelled));

        for terminal in [Paid, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Uninitiated, Pending, Paid, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!Pending.can_transition_to(Uninitiated));
        assert!(!Uninitiated.can_transition_to(Failed));
    }

    #[test]
    fn test_status_round_trip_str() {
        for status in [
            OrderStatus::Uninitiated,
            OrderStatus::Pending,
            OrderStatus::Paid,
            OrderStatus::Failed,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert!("refunded".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_new_order_is_uninitiated() {
        let order = Order::new("ORD123", MinorUnits::new(25000).unwrap(), Currency::INR);
        assert_eq!(order.status, OrderStatus::Uninitiated);
        assert!(order.gateway_order_id.is_none());
        assert!(order.payment_method.is_none());
        assert_eq!(order.total().display(), "₹250.00");
    }

    #[test]
    fn test_cash_record_has_no_gateway_ids() {
        let order = Order::new("ORD123", MinorUnits::new(25000).unwrap(), Currency::INR);
        let receipt = CashReceipt {
            staff_id: "staff_7".to_string(),
            amount: MinorUnits::new(25000).unwrap(),
            notes: Some("table 4".to_string()),
        };
        let record = PaymentRecord::cash(&order, &receipt);
        assert_eq!(record.method, PaymentMethod::Cash);
        assert!(record.gateway_order_id.is_none());
        assert!(record.gateway_payment_id.is_none());
        assert_eq!(record.recorded_by.as_deref(), Some("staff_7"));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["method"], "cash");
        assert!(json.get("gatewayPaymentId").is_none());
        assert_eq!("cash".parse::<PaymentMethod>().unwrap(), PaymentMethod::Cash);
    }
}
