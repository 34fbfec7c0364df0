//! # Cart
//!
//! Cart lines are keyed by an explicit `CartToken` that the client carries on
//! every request. `PricingSnapshot` freezes a cart's totals at checkout time.

use crate::error::{CheckoutError, CheckoutResult, ValidationErrors};
use crate::menu::{FoodItem, Menu};
use crate::money::Money;
use crate::store::CheckoutStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

const MAX_TOKEN_LEN: usize = 64;

/// Most units of one dish a cart line may hold
pub const MAX_LINE_QUANTITY: u32 = 999;

/// Opaque identifier of one shopping session's cart
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CartToken(String);

impl CartToken {
    /// Issue a fresh token
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Accept a client-supplied token: 1..=64 chars of `[A-Za-z0-9_-]`
    pub fn parse(raw: &str) -> CheckoutResult<Self> {
        let raw = raw.trim();
        let well_formed = !raw.is_empty()
            && raw.len() <= MAX_TOKEN_LEN
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

        if !well_formed {
            return Err(CheckoutError::Validation(ValidationErrors::single(
                "cart_token",
                "The cart token is malformed.",
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CartToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One dish plus quantity in a cart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub food_item_id: String,

    /// Dish name (denormalized for display)
    pub name: String,

    pub quantity: u32,

    /// Unit price captured when the dish was added
    pub unit_price: Money,

    /// Unit discount captured when the dish was added
    pub unit_discount: Money,

    pub added_at: DateTime<Utc>,
}

impl CartLine {
    /// Create a cart line from a menu item
    pub fn from_food_item(item: &FoodItem, quantity: u32) -> Self {
        Self {
            food_item_id: item.id.clone(),
            name: item.name.clone(),
            quantity,
            unit_price: item.price,
            unit_discount: item.discount,
            added_at: Utc::now(),
        }
    }

    /// (price - discount) * quantity
    pub fn subtotal(&self) -> Money {
        (self.unit_price - self.unit_discount).times(self.quantity)
    }
}

/// Totals of a cart, frozen at the moment they were computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingSnapshot {
    pub total: Money,
    pub item_count: u32,
    pub line_count: usize,
}

impl PricingSnapshot {
    pub fn capture(lines: &[CartLine]) -> Self {
        Self {
            total: lines.iter().map(CartLine::subtotal).sum(),
            item_count: lines
                .iter()
                .fold(0u32, |count, line| count.saturating_add(line.quantity)),
            line_count: lines.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.item_count == 0
    }
}

/// Cart contents together with their current totals
#[derive(Debug, Clone, Serialize)]
pub struct CartContents {
    pub token: CartToken,
    pub lines: Vec<CartLine>,
    pub summary: PricingSnapshot,
}

/// Cart CRUD against the menu and the store
pub struct CartService {
    store: Arc<dyn CheckoutStore>,
    menu: Arc<Menu>,
}

impl CartService {
    pub fn new(store: Arc<dyn CheckoutStore>, menu: Arc<Menu>) -> Self {
        Self { store, menu }
    }

    pub async fn contents(&self, cart: &CartToken) -> CheckoutResult<CartContents> {
        let lines = self.store.cart_lines(cart).await?;
        Ok(CartContents {
            token: cart.clone(),
            summary: PricingSnapshot::capture(&lines),
            lines,
        })
    }

    /// Add a dish; an existing line for the same dish has its quantity
    /// increased, up to `MAX_LINE_QUANTITY`
    #[instrument(skip(self), fields(cart = %cart))]
    pub async fn add_item(
        &self,
        cart: &CartToken,
        food_item_id: &str,
        quantity: u32,
    ) -> CheckoutResult<CartLine> {
        check_quantity(quantity)?;

        let item = self
            .menu
            .get(food_item_id)
            .ok_or_else(|| CheckoutError::not_found("Food item", food_item_id))?;

        if !item.active {
            return Err(CheckoutError::Validation(ValidationErrors::single(
                "food_item_id",
                format!("{} is not available right now.", item.name),
            )));
        }

        let line = self
            .store
            .add_cart_line(cart, CartLine::from_food_item(item, quantity))
            .await?;

        debug!("Cart line {} now at quantity {}", line.food_item_id, line.quantity);
        Ok(line)
    }

    pub async fn set_quantity(
        &self,
        cart: &CartToken,
        food_item_id: &str,
        quantity: u32,
    ) -> CheckoutResult<CartLine> {
        check_quantity(quantity)?;

        self.store
            .set_cart_quantity(cart, food_item_id, quantity)
            .await?
            .ok_or_else(|| CheckoutError::not_found("Cart line", food_item_id))
    }

    pub async fn remove_item(&self, cart: &CartToken, food_item_id: &str) -> CheckoutResult<()> {
        if self.store.remove_cart_line(cart, food_item_id).await? {
            Ok(())
        } else {
            Err(CheckoutError::not_found("Cart line", food_item_id))
        }
    }

    pub async fn clear(&self, cart: &CartToken) -> CheckoutResult<u64> {
        Ok(self.store.clear_cart(cart).await?)
    }
}

fn check_quantity(quantity: u32) -> CheckoutResult<()> {
    if quantity == 0 {
        return Err(CheckoutError::Validation(ValidationErrors::single(
            "quantity",
            "The quantity must be at least 1.",
        )));
    }
    if quantity > MAX_LINE_QUANTITY {
        return Err(CheckoutError::Validation(ValidationErrors::single(
            "quantity",
            format!("The quantity must not be greater than {}.", MAX_LINE_QUANTITY),
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn line(price: i64, discount: i64, quantity: u32) -> CartLine {
        CartLine {
            food_item_id: format!("item-{price}"),
            name: "Dish".to_string(),
            quantity,
            unit_price: Money::from_cents(price),
            unit_discount: Money::from_cents(discount),
            added_at: Utc::now(),
        }
    }

    fn menu() -> Arc<Menu> {
        Arc::new(
            Menu::new()
                .with_item(FoodItem::new("pizza", "Margherita Pizza", Money::from_cents(1299)))
                .with_item(FoodItem {
                    active: false,
                    ..FoodItem::new("tacos", "Beef Tacos", Money::from_cents(1199))
                }),
        )
    }

    #[test]
    fn test_snapshot_totals() {
        let lines = vec![line(1000, 0, 2), line(500, 0, 1), line(800, 200, 3)];
        let snapshot = PricingSnapshot::capture(&lines);

        assert_eq!(snapshot.total, Money::from_cents(2000 + 500 + 1800));
        assert_eq!(snapshot.item_count, 6);
        assert_eq!(snapshot.line_count, 3);
    }

    #[test]
    fn test_snapshot_is_frozen() {
        let mut lines = vec![line(1000, 0, 2)];
        let snapshot = PricingSnapshot::capture(&lines);

        lines[0].quantity = 10;
        lines.push(line(500, 0, 1));

        assert_eq!(snapshot.total, Money::from_cents(2000));
        assert_eq!(snapshot.item_count, 2);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = PricingSnapshot::capture(&[]);
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.total, Money::ZERO);
        assert_eq!(snapshot.line_count, 0);
    }

    #[test]
    fn test_cart_token_parse() {
        assert!(CartToken::parse("abc-123_XYZ").is_ok());
        assert!(CartToken::parse("").is_err());
        assert!(CartToken::parse("has space").is_err());
        assert!(CartToken::parse(&"a".repeat(65)).is_err());
        assert_eq!(CartToken::generate().as_str().len(), 32);
    }

    #[tokio::test]
    async fn test_add_item_increments() {
        let service = CartService::new(Arc::new(MemoryStore::new()), menu());
        let cart = CartToken::generate();

        service.add_item(&cart, "pizza", 1).await.unwrap();
        let line = service.add_item(&cart, "pizza", 2).await.unwrap();
        assert_eq!(line.quantity, 3);

        let contents = service.contents(&cart).await.unwrap();
        assert_eq!(contents.lines.len(), 1);
        assert_eq!(contents.summary.total, Money::from_cents(3897));
    }

    #[tokio::test]
    async fn test_add_item_rejects_inactive_and_unknown() {
        let service = CartService::new(Arc::new(MemoryStore::new()), menu());
        let cart = CartToken::generate();

        let err = service.add_item(&cart, "tacos", 1).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Validation(_)));

        let err = service.add_item(&cart, "sushi", 1).await.unwrap_err();
        assert!(matches!(err, CheckoutError::NotFound { .. }));

        let err = service.add_item(&cart, "pizza", 0).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Validation(_)));
    }

    #[tokio::test]
    async fn test_quantity_is_capped_per_line() {
        let service = CartService::new(Arc::new(MemoryStore::new()), menu());
        let cart = CartToken::generate();

        let err = service.add_item(&cart, "pizza", u32::MAX).await.unwrap_err();
        assert!(err.validation_errors().unwrap().has_field("quantity"));
        let err = service.set_quantity(&cart, "pizza", MAX_LINE_QUANTITY + 1).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Validation(_)));

        service.add_item(&cart, "pizza", MAX_LINE_QUANTITY).await.unwrap();
        let line = service.add_item(&cart, "pizza", MAX_LINE_QUANTITY).await.unwrap();
        assert_eq!(line.quantity, MAX_LINE_QUANTITY);

        let contents = service.contents(&cart).await.unwrap();
        assert_eq!(contents.summary.item_count, MAX_LINE_QUANTITY);
        assert_eq!(contents.summary.total, Money::from_cents(1299 * 999));
    }

    #[test]
    fn test_snapshot_counts_saturate() {
        let lines = vec![line(100, 0, u32::MAX), line(100, 0, u32::MAX)];
        assert_eq!(PricingSnapshot::capture(&lines).item_count, u32::MAX);
    }

    #[tokio::test]
    async fn test_update_remove_clear() {
        let service = CartService::new(Arc::new(MemoryStore::new()), menu());
        let cart = CartToken::generate();

        service.add_item(&cart, "pizza", 1).await.unwrap();
        let line = service.set_quantity(&cart, "pizza", 4).await.unwrap();
        assert_eq!(line.quantity, 4);

        service.remove_item(&cart, "pizza").await.unwrap();
        assert!(service.remove_item(&cart, "pizza").await.is_err());

        service.add_item(&cart, "pizza", 1).await.unwrap();
        assert_eq!(service.clear(&cart).await.unwrap(), 1);
        assert!(service.contents(&cart).await.unwrap().lines.is_empty());
    }
}
