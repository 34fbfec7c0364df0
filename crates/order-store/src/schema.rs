//! Table definitions.
//!
//! Amounts are integer cents; timestamps are RFC 3339 text with fixed
//! nanosecond precision so they sort lexically.

pub const CREATE_CUSTOMERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS customers (
    id TEXT PRIMARY KEY,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    phone TEXT NOT NULL,
    address TEXT,
    post_code TEXT,
    created_at TEXT NOT NULL
)
"#;

pub const CREATE_ORDERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    id TEXT PRIMARY KEY,
    purchase_order_id TEXT NOT NULL UNIQUE,
    customer_id TEXT NOT NULL REFERENCES customers(id),
    cart_token TEXT NOT NULL,
    status TEXT NOT NULL,
    payment_method TEXT NOT NULL,
    price_cents INTEGER NOT NULL,
    shipping_cost_cents INTEGER NOT NULL,
    transaction_id TEXT NOT NULL,
    payment_intent_id TEXT UNIQUE,
    fulfillment TEXT NOT NULL,
    notes TEXT,
    address TEXT,
    post_code TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

pub const CREATE_ORDERS_CREATED_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at)";

pub const CREATE_ORDER_ITEMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS order_items (
    order_id TEXT NOT NULL REFERENCES orders(id),
    position INTEGER NOT NULL,
    food_item_id TEXT NOT NULL,
    name TEXT NOT NULL,
    quantity INTEGER NOT NULL CHECK (quantity > 0),
    unit_price_cents INTEGER NOT NULL,
    unit_discount_cents INTEGER NOT NULL,
    PRIMARY KEY (order_id, position)
)
"#;

pub const CREATE_CART_LINES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS cart_lines (
    cart_token TEXT NOT NULL,
    food_item_id TEXT NOT NULL,
    name TEXT NOT NULL,
    quantity INTEGER NOT NULL CHECK (quantity > 0),
    unit_price_cents INTEGER NOT NULL,
    unit_discount_cents INTEGER NOT NULL,
    added_at TEXT NOT NULL,
    PRIMARY KEY (cart_token, food_item_id)
)
"#;

pub const CREATE_REFUND_OBLIGATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS refund_obligations (
    id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL REFERENCES orders(id),
    purchase_order_id TEXT NOT NULL,
    transaction_id TEXT NOT NULL,
    amount_cents INTEGER NOT NULL,
    reason TEXT,
    status TEXT NOT NULL,
    gateway_refund_id TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

pub const CREATE_REFUND_OBLIGATIONS_TRANSACTION_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_refund_obligations_transaction
    ON refund_obligations (transaction_id)
"#;

/// Statements run by `SqliteStore::init`, in order
pub const SCHEMA: &[&str] = &[
    CREATE_CUSTOMERS_TABLE,
    CREATE_ORDERS_TABLE,
    CREATE_ORDERS_CREATED_INDEX,
    CREATE_ORDER_ITEMS_TABLE,
    CREATE_CART_LINES_TABLE,
    CREATE_REFUND_OBLIGATIONS_TABLE,
    CREATE_REFUND_OBLIGATIONS_TRANSACTION_INDEX,
];
