//! # Order Types
//!
//! Orders, their frozen line items, and the order status state machine.
//!
//! ```text
//!   in_progress ──► order_placed ──► confirmed
//!        │  └──────────────────────────▲  │
//!        │               │                │
//!        └───────────────┴──► cancelled ◄─┘
//! ```
//!
//! Every caller (checkout, webhook, staff) goes through the same table in
//! [`OrderStatus::transition`].

use crate::cart::{CartLine, CartToken};
use crate::error::{CheckoutError, CheckoutResult};
use crate::money::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transaction id placeholder while no payment has been recorded
pub const PENDING_TRANSACTION: &str = "PENDING";

/// Transaction id sentinel meaning "no electronic payment"
pub const PAY_ON_SPOT_TRANSACTION: &str = "PAY_ON_SPOT";

/// Lifecycle status of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created at checkout, awaiting payment or finalization
    InProgress,
    /// Customer side finished (cash order placed, or card paid)
    OrderPlaced,
    /// Confirmed by staff or by the gateway's payment-success event
    Confirmed,
    Cancelled,
}

/// Result of checking a requested status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Status changes to the requested one
    Move,
    /// Already there; nothing to write
    Stay,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::InProgress => "in_progress",
            OrderStatus::OrderPlaced => "order_placed",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses reachable in one step
    pub fn allowed_targets(&self) -> &'static [OrderStatus] {
        match self {
            OrderStatus::InProgress => &[
                OrderStatus::OrderPlaced,
                OrderStatus::Confirmed,
                OrderStatus::Cancelled,
            ],
            OrderStatus::OrderPlaced => &[OrderStatus::Confirmed, OrderStatus::Cancelled],
            OrderStatus::Confirmed => &[OrderStatus::Cancelled],
            OrderStatus::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        self.allowed_targets().contains(&next)
    }

    /// Check a requested change against the canonical table.
    ///
    /// `cancelled -> cancelled` is accepted as a no-op; every other change not
    /// in the table is an `InvalidTransition`.
    pub fn transition(self, next: OrderStatus) -> CheckoutResult<Transition> {
        if self == OrderStatus::Cancelled && next == OrderStatus::Cancelled {
            return Ok(Transition::Stay);
        }
        if self.can_transition_to(next) {
            Ok(Transition::Move)
        } else {
            Err(CheckoutError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Confirmed | OrderStatus::Cancelled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(OrderStatus::InProgress),
            "order_placed" => Ok(OrderStatus::OrderPlaced),
            "confirmed" => Ok(OrderStatus::Confirmed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// How the order is paid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Card payment through the payment gateway
    ExternalGateway,
    /// Paid in person, no electronic payment
    None,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::ExternalGateway => "external_gateway",
            PaymentMethod::None => "none",
        }
    }
}

impl std::str::FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "external_gateway" => Ok(PaymentMethod::ExternalGateway),
            "none" => Ok(PaymentMethod::None),
            other => Err(format!("unknown payment method: {other}")),
        }
    }
}

/// How the food reaches the customer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentType {
    Delivery,
    Takeaway,
    PayOnSpot,
}

impl FulfillmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FulfillmentType::Delivery => "delivery",
            FulfillmentType::Takeaway => "takeaway",
            FulfillmentType::PayOnSpot => "pay_on_spot",
        }
    }

    /// Delivery orders need an address and post code
    pub fn requires_address(&self) -> bool {
        matches!(self, FulfillmentType::Delivery)
    }
}

impl std::str::FromStr for FulfillmentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delivery" => Ok(FulfillmentType::Delivery),
            "takeaway" => Ok(FulfillmentType::Takeaway),
            "pay_on_spot" => Ok(FulfillmentType::PayOnSpot),
            other => Err(format!("unknown order type: {other}")),
        }
    }
}

/// Human-readable order number, e.g. `ORD20261018143000A1B2C3D4E5F6`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderNumber(String);

impl OrderNumber {
    /// `ORD` + UTC timestamp + 12 hex chars of a v4 UUID (48 random bits)
    pub fn generate() -> Self {
        let random = Uuid::new_v4().simple().to_string()[..12].to_uppercase();
        Self(format!("ORD{}{}", Utc::now().format("%Y%m%d%H%M%S"), random))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OrderNumber {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cart line frozen into an order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLineItem {
    pub food_item_id: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Money,
    pub unit_discount: Money,
}

impl OrderLineItem {
    pub fn from_cart_line(line: &CartLine) -> Self {
        Self {
            food_item_id: line.food_item_id.clone(),
            name: line.name.clone(),
            quantity: line.quantity,
            unit_price: line.unit_price,
            unit_discount: line.unit_discount,
        }
    }

    pub fn subtotal(&self) -> Money {
        (self.unit_price - self.unit_discount).times(self.quantity)
    }
}

/// A priced, customer-attributed purchase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,

    /// Public order number, unique and immutable
    pub purchase_order_id: OrderNumber,

    pub customer_id: Uuid,

    /// Cart the order was created from
    pub cart_token: CartToken,

    pub status: OrderStatus,

    pub payment_method: PaymentMethod,

    /// Cart total frozen at creation time
    pub price: Money,

    pub shipping_cost: Money,

    /// Gateway transaction id, or one of the placeholder sentinels
    pub transaction_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,

    pub fulfillment: FulfillmentType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_code: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// price + shipping cost
    pub fn total(&self) -> Money {
        self.price + self.shipping_cost
    }

    /// Whether money was actually taken through the gateway
    pub fn has_gateway_payment(&self) -> bool {
        self.payment_method == PaymentMethod::ExternalGateway
            && !self.transaction_id.is_empty()
            && self.transaction_id != PENDING_TRANSACTION
            && self.transaction_id != PAY_ON_SPOT_TRANSACTION
    }

    /// Already placed or confirmed by the given payment intent
    pub fn is_settled_by(&self, intent_id: &str) -> bool {
        matches!(self.status, OrderStatus::OrderPlaced | OrderStatus::Confirmed)
            && self.transaction_id == intent_id
    }
}

/// Sum of line item subtotals
pub fn line_items_total(items: &[OrderLineItem]) -> Money {
    items.iter().map(OrderLineItem::subtotal).sum()
}
