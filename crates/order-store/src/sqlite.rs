//! # SQLite Checkout Store
//!
//! `CheckoutStore` over a sqlx SQLite pool. The two units of work run inside
//! one transaction each; dropping the transaction on an early `?` rolls it
//! back. Status changes are guarded in SQL (`WHERE status = ?`), so two
//! writers racing on one order cannot both succeed.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use order_core::{
    CartLine, CartToken, CheckoutStore, Customer, DuplicateKey, FulfillmentType, Money, Order,
    OrderDraft, OrderLineItem, OrderNumber, OrderStatus, PaymentMethod, PlacedOrder,
    RefundObligation, RefundStatus, StatusChange, StoreError, StoreResult, MAX_LINE_QUANTITY,
};
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::schema::SCHEMA;

const CUSTOMER_COLUMNS: &str =
    "id, first_name, last_name, email, phone, address, post_code, created_at";

const ORDER_COLUMNS: &str = "id, purchase_order_id, customer_id, cart_token, status, \
     payment_method, price_cents, shipping_cost_cents, transaction_id, payment_intent_id, \
     fulfillment, notes, address, post_code, created_at, updated_at";

const CART_LINE_COLUMNS: &str =
    "food_item_id, name, quantity, unit_price_cents, unit_discount_cents, added_at";

const REFUND_COLUMNS: &str = "id, order_id, purchase_order_id, transaction_id, amount_cents, \
     reason, status, gateway_refund_id, last_error, created_at, updated_at";

/// SQLite-backed checkout store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool. Call [`SqliteStore::init`] before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url` and create the tables.
    ///
    /// `url` is a sqlx SQLite URL such as `sqlite://data/orders.db`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(db_error)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db_error)?;

        info!("Connected to SQLite order store at {}", url);

        let store = Self::new(pool);
        store.init().await?;
        Ok(store)
    }

    /// Fresh private in-memory database, already initialized.
    ///
    /// Limited to one connection that never expires; every connection to
    /// `:memory:` would otherwise see its own empty database.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(db_error)?;

        let store = Self::new(pool);
        store.init().await?;
        Ok(store)
    }

    /// Create tables and indexes if they do not exist.
    pub async fn init(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
        }
        debug!("Order store schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl CheckoutStore for SqliteStore {
    async fn cart_lines(&self, cart: &CartToken) -> StoreResult<Vec<CartLine>> {
        let sql = format!(
            "SELECT {CART_LINE_COLUMNS} FROM cart_lines WHERE cart_token = ? ORDER BY added_at, rowid"
        );
        let rows = sqlx::query(&sql)
            .bind(cart.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        rows.iter().map(cart_line_from_row).collect()
    }

    async fn add_cart_line(&self, cart: &CartToken, line: CartLine) -> StoreResult<CartLine> {
        let sql = format!(
            "INSERT INTO cart_lines (cart_token, {CART_LINE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(cart_token, food_item_id) \
             DO UPDATE SET quantity = MIN(quantity + excluded.quantity, ?) \
             RETURNING {CART_LINE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(cart.as_str())
            .bind(&line.food_item_id)
            .bind(&line.name)
            .bind(i64::from(line.quantity))
            .bind(line.unit_price.cents())
            .bind(line.unit_discount.cents())
            .bind(timestamp(&line.added_at))
            .bind(i64::from(MAX_LINE_QUANTITY))
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;

        cart_line_from_row(&row)
    }

    async fn set_cart_quantity(
        &self,
        cart: &CartToken,
        food_item_id: &str,
        quantity: u32,
    ) -> StoreResult<Option<CartLine>> {
        let sql = format!(
            "UPDATE cart_lines SET quantity = ? WHERE cart_token = ? AND food_item_id = ? \
             RETURNING {CART_LINE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(i64::from(quantity))
            .bind(cart.as_str())
            .bind(food_item_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.as_ref().map(cart_line_from_row).transpose()
    }

    async fn remove_cart_line(&self, cart: &CartToken, food_item_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM cart_lines WHERE cart_token = ? AND food_item_id = ?")
            .bind(cart.as_str())
            .bind(food_item_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn clear_cart(&self, cart: &CartToken) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM cart_lines WHERE cart_token = ?")
            .bind(cart.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, draft), fields(purchase_order_id = %draft.purchase_order_id))]
    async fn create_order(&self, draft: OrderDraft) -> StoreResult<PlacedOrder> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let candidate = Customer::from_contact(&draft.contact);
        sqlx::query(&format!(
            "INSERT INTO customers ({CUSTOMER_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(email) DO NOTHING"
        ))
        .bind(candidate.id.to_string())
        .bind(&candidate.first_name)
        .bind(&candidate.last_name)
        .bind(&candidate.email)
        .bind(&candidate.phone)
        .bind(&candidate.address)
        .bind(&candidate.post_code)
        .bind(timestamp(&candidate.created_at))
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        let row = sqlx::query(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers WHERE email = ?"
        ))
        .bind(&draft.contact.email)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;
        let customer = customer_from_row(&row)?;

        let order = draft.build(customer.id, Utc::now());
        insert_order(&mut tx, &order).await?;

        for (position, item) in draft.items.iter().enumerate() {
            sqlx::query(
                "INSERT INTO order_items (order_id, position, food_item_id, name, quantity, \
                 unit_price_cents, unit_discount_cents) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(order.id.to_string())
            .bind(position as i64)
            .bind(&item.food_item_id)
            .bind(&item.name)
            .bind(i64::from(item.quantity))
            .bind(item.unit_price.cents())
            .bind(item.unit_discount.cents())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        if draft.clears_cart() {
            sqlx::query("DELETE FROM cart_lines WHERE cart_token = ?")
                .bind(draft.cart_token.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)?;

        debug!(order_id = %order.id, status = %order.status, "Order persisted");

        Ok(PlacedOrder {
            order,
            customer,
            items: draft.items,
        })
    }

    #[instrument(skip(self, change), fields(order_id = %change.order_id, next = %change.next))]
    async fn transition(&self, change: StatusChange) -> StoreResult<Order> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let order_id = change.order_id.to_string();

        let result = sqlx::query(
            "UPDATE orders SET status = ?, transaction_id = COALESCE(?, transaction_id), \
             updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(change.next.as_str())
        .bind(&change.transaction_id)
        .bind(timestamp(&Utc::now()))
        .bind(&order_id)
        .bind(change.expected.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM orders WHERE id = ?")
                    .bind(&order_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_error)?;

            return match current {
                None => Err(StoreError::NotFound(format!("order {}", change.order_id))),
                Some(current) => Err(StoreError::StaleStatus {
                    order_id: change.order_id,
                    current: current.parse().map_err(StoreError::Database)?,
                }),
            };
        }

        if change.clear_cart {
            sqlx::query(
                "DELETE FROM cart_lines WHERE cart_token = \
                 (SELECT cart_token FROM orders WHERE id = ?)",
            )
            .bind(&order_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        if let Some(refund) = &change.refund {
            insert_refund(&mut tx, refund).await?;
        }

        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?"))
            .bind(&order_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error)?;
        let order = order_from_row(&row)?;

        tx.commit().await.map_err(db_error)?;
        Ok(order)
    }

    async fn order(&self, id: Uuid) -> StoreResult<Option<Order>> {
        self.fetch_order("id", &id.to_string()).await
    }

    async fn order_by_number(&self, purchase_order_id: &str) -> StoreResult<Option<Order>> {
        self.fetch_order("purchase_order_id", purchase_order_id).await
    }

    async fn order_by_intent(&self, payment_intent_id: &str) -> StoreResult<Option<Order>> {
        self.fetch_order("payment_intent_id", payment_intent_id).await
    }

    async fn order_items(&self, order_id: Uuid) -> StoreResult<Vec<OrderLineItem>> {
        let rows = sqlx::query(
            "SELECT food_item_id, name, quantity, unit_price_cents, unit_discount_cents \
             FROM order_items WHERE order_id = ? ORDER BY position",
        )
        .bind(order_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter()
            .map(|row| {
                Ok(OrderLineItem {
                    food_item_id: row.try_get("food_item_id").map_err(db_error)?,
                    name: row.try_get("name").map_err(db_error)?,
                    quantity: quantity(row)?,
                    unit_price: cents(row, "unit_price_cents")?,
                    unit_discount: cents(row, "unit_discount_cents")?,
                })
            })
            .collect()
    }

    async fn orders(&self) -> StoreResult<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders ORDER BY created_at DESC, rowid DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(order_from_row).collect()
    }

    async fn customer(&self, id: Uuid) -> StoreResult<Option<Customer>> {
        let row = sqlx::query(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(customer_from_row).transpose()
    }

    async fn refunds(&self) -> StoreResult<Vec<RefundObligation>> {
        let rows = sqlx::query(&format!(
            "SELECT {REFUND_COLUMNS} FROM refund_obligations ORDER BY created_at, rowid"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(refund_from_row).collect()
    }

    async fn record_refund(&self, refund: RefundObligation) -> StoreResult<bool> {
        let sql = format!(
            "INSERT INTO refund_obligations ({REFUND_COLUMNS}) \
             SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ? \
             WHERE NOT EXISTS (SELECT 1 FROM refund_obligations WHERE transaction_id = ?)"
        );
        let result = bind_refund(sqlx::query(&sql), &refund)
            .bind(&refund.transaction_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_refund(&self, refund: &RefundObligation) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE refund_obligations SET status = ?, gateway_refund_id = ?, last_error = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(refund.status.as_str())
        .bind(&refund.gateway_refund_id)
        .bind(&refund.last_error)
        .bind(timestamp(&refund.updated_at))
        .bind(refund.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("refund {}", refund.id)));
        }
        Ok(())
    }
}

impl SqliteStore {
    /// `column` is always one of our own unique columns, never user input.
    async fn fetch_order(&self, column: &str, value: &str) -> StoreResult<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE {column} = ?"
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(order_from_row).transpose()
    }
}

// =============================================================================
// Writes shared by the units of work
// =============================================================================

async fn insert_order(tx: &mut Transaction<'_, Sqlite>, order: &Order) -> StoreResult<()> {
    sqlx::query(&format!(
        "INSERT INTO orders ({ORDER_COLUMNS}) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(order.id.to_string())
    .bind(order.purchase_order_id.as_str())
    .bind(order.customer_id.to_string())
    .bind(order.cart_token.as_str())
    .bind(order.status.as_str())
    .bind(order.payment_method.as_str())
    .bind(order.price.cents())
    .bind(order.shipping_cost.cents())
    .bind(&order.transaction_id)
    .bind(&order.payment_intent_id)
    .bind(order.fulfillment.as_str())
    .bind(&order.notes)
    .bind(&order.address)
    .bind(&order.post_code)
    .bind(timestamp(&order.created_at))
    .bind(timestamp(&order.updated_at))
    .execute(&mut **tx)
    .await
    .map_err(|e| duplicate_or_db_error(e, order))?;

    Ok(())
}

async fn insert_refund(
    tx: &mut Transaction<'_, Sqlite>,
    refund: &RefundObligation,
) -> StoreResult<()> {
    let sql = format!(
        "INSERT INTO refund_obligations ({REFUND_COLUMNS}) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    bind_refund(sqlx::query(&sql), refund)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;

    Ok(())
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Binds every `REFUND_COLUMNS` value, in column order
fn bind_refund<'q>(query: SqliteQuery<'q>, refund: &'q RefundObligation) -> SqliteQuery<'q> {
    query
        .bind(refund.id.to_string())
        .bind(refund.order_id.to_string())
        .bind(refund.purchase_order_id.as_str())
        .bind(&refund.transaction_id)
        .bind(refund.amount.cents())
        .bind(&refund.reason)
        .bind(refund.status.as_str())
        .bind(&refund.gateway_refund_id)
        .bind(&refund.last_error)
        .bind(timestamp(&refund.created_at))
        .bind(timestamp(&refund.updated_at))
}

// =============================================================================
// Error mapping
// =============================================================================

fn db_error(err: sqlx::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

/// SQLite reports unique violations as `UNIQUE constraint failed: <table>.<column>`.
fn duplicate_or_db_error(err: sqlx::Error, order: &Order) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            let message = db.message();
            if message.contains("orders.purchase_order_id") {
                return StoreError::Duplicate {
                    key: DuplicateKey::OrderNumber,
                    value: order.purchase_order_id.to_string(),
                };
            }
            if message.contains("orders.payment_intent_id") {
                return StoreError::Duplicate {
                    key: DuplicateKey::PaymentIntent,
                    value: order.payment_intent_id.clone().unwrap_or_default(),
                };
            }
        }
    }
    db_error(err)
}

// =============================================================================
// Row decoding
// =============================================================================

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn column<T>(row: &SqliteRow, name: &str) -> StoreResult<T>
where
    T: for<'r> sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(db_error)
}

fn parsed<T>(row: &SqliteRow, name: &str) -> StoreResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = column(row, name)?;
    raw.parse()
        .map_err(|e: T::Err| StoreError::Database(format!("column {name}: {e}")))
}

fn uuid(row: &SqliteRow, name: &str) -> StoreResult<Uuid> {
    parsed(row, name)
}

fn time(row: &SqliteRow, name: &str) -> StoreResult<DateTime<Utc>> {
    let raw: String = column(row, name)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(format!("column {name}: {e}")))
}

fn cents(row: &SqliteRow, name: &str) -> StoreResult<Money> {
    column::<i64>(row, name).map(Money::from_cents)
}

fn quantity(row: &SqliteRow) -> StoreResult<u32> {
    let raw: i64 = column(row, "quantity")?;
    u32::try_from(raw).map_err(|e| StoreError::Database(format!("column quantity: {e}")))
}

fn customer_from_row(row: &SqliteRow) -> StoreResult<Customer> {
    Ok(Customer {
        id: uuid(row, "id")?,
        first_name: column(row, "first_name")?,
        last_name: column(row, "last_name")?,
        email: column(row, "email")?,
        phone: column(row, "phone")?,
        address: column(row, "address")?,
        post_code: column(row, "post_code")?,
        created_at: time(row, "created_at")?,
    })
}

fn order_from_row(row: &SqliteRow) -> StoreResult<Order> {
    let cart_token: String = column(row, "cart_token")?;
    let purchase_order_id: String = column(row, "purchase_order_id")?;

    Ok(Order {
        id: uuid(row, "id")?,
        purchase_order_id: OrderNumber::from(purchase_order_id),
        customer_id: uuid(row, "customer_id")?,
        cart_token: CartToken::parse(&cart_token)
            .map_err(|e| StoreError::Database(format!("column cart_token: {e}")))?,
        status: parsed::<OrderStatus>(row, "status")?,
        payment_method: parsed::<PaymentMethod>(row, "payment_method")?,
        price: cents(row, "price_cents")?,
        shipping_cost: cents(row, "shipping_cost_cents")?,
        transaction_id: column(row, "transaction_id")?,
        payment_intent_id: column(row, "payment_intent_id")?,
        fulfillment: parsed::<FulfillmentType>(row, "fulfillment")?,
        notes: column(row, "notes")?,
        address: column(row, "address")?,
        post_code: column(row, "post_code")?,
        created_at: time(row, "created_at")?,
        updated_at: time(row, "updated_at")?,
    })
}

fn cart_line_from_row(row: &SqliteRow) -> StoreResult<CartLine> {
    Ok(CartLine {
        food_item_id: column(row, "food_item_id")?,
        name: column(row, "name")?,
        quantity: quantity(row)?,
        unit_price: cents(row, "unit_price_cents")?,
        unit_discount: cents(row, "unit_discount_cents")?,
        added_at: time(row, "added_at")?,
    })
}

fn refund_from_row(row: &SqliteRow) -> StoreResult<RefundObligation> {
    let purchase_order_id: String = column(row, "purchase_order_id")?;

    Ok(RefundObligation {
        id: uuid(row, "id")?,
        order_id: uuid(row, "order_id")?,
        purchase_order_id: OrderNumber::from(purchase_order_id),
        transaction_id: column(row, "transaction_id")?,
        amount: cents(row, "amount_cents")?,
        reason: column(row, "reason")?,
        status: parsed::<RefundStatus>(row, "status")?,
        gateway_refund_id: column(row, "gateway_refund_id")?,
        last_error: column(row, "last_error")?,
        created_at: time(row, "created_at")?,
        updated_at: time(row, "updated_at")?,
    })
}
