//! # order-store
//!
//! Durable `CheckoutStore` for food-order-rs on SQLite via sqlx.
//!
//! ```rust,ignore
//! use order_store::SqliteStore;
//!
//! let store = SqliteStore::connect("sqlite://data/orders.db").await?;
//! let orchestrator = CheckoutOrchestrator::new(gateway, Arc::new(store));
//! ```

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteStore;
