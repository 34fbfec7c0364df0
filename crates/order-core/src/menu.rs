//! # Menu
//!
//! Food catalog types. The menu is loaded from `config/menu.toml` and is
//! read-only at runtime; cart lines copy price and discount out of it at
//! add time.

use crate::money::Money;
use serde::{Deserialize, Serialize};

/// A dish on the menu
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoodItem {
    /// Unique identifier (e.g., "margherita-pizza")
    pub id: String,

    /// Display name
    pub name: String,

    /// Short description
    #[serde(default)]
    pub description: String,

    /// Unit price in cents
    pub price: Money,

    /// Unit discount in cents, applied per item
    #[serde(default)]
    pub discount: Money,

    /// Whether this dish can currently be ordered
    #[serde(default = "default_true")]
    pub active: bool,

    /// Optional image URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

fn default_true() -> bool {
    true
}

impl FoodItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>, price: Money) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            price,
            discount: Money::ZERO,
            active: true,
            image_url: None,
        }
    }

    /// Builder: set description
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Builder: set per-item discount
    pub fn with_discount(mut self, discount: Money) -> Self {
        self.discount = discount;
        self
    }

    /// Price actually charged per item
    pub fn net_price(&self) -> Money {
        self.price - self.discount
    }
}

/// Menu (loaded from config)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Menu {
    #[serde(default)]
    pub items: Vec<FoodItem>,
}

impl Menu {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn add(&mut self, item: FoodItem) {
        self.items.push(item);
    }

    /// Builder: add a dish
    pub fn with_item(mut self, item: FoodItem) -> Self {
        self.add(item);
        self
    }

    /// Find a dish by ID
    pub fn get(&self, id: &str) -> Option<&FoodItem> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Get all orderable dishes
    pub fn active_items(&self) -> impl Iterator<Item = &FoodItem> {
        self.items.iter().filter(|item| item.active)
    }

    /// Load menu from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }
}
