//! # Checkout Error Types
//!
//! Typed error handling for the checkout and order lifecycle.
//! All checkout operations return `Result<T, CheckoutError>`; storage
//! backends report `StoreError`, which converts into `CheckoutError`.

use crate::order::OrderStatus;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// A single user-correctable problem with a submitted field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Field-level validation messages, collected rather than failing fast
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors {
    errors: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a single failing field
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.push(field, message);
        errors
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    /// Check whether a given field failed
    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }

    /// `Ok(())` when nothing was collected
    pub fn into_result(self) -> CheckoutResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CheckoutError::Validation(self))
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let messages: Vec<String> = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        f.write_str(&messages.join("; "))
    }
}

/// Which unique key a rejected insert collided on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKey {
    OrderNumber,
    PaymentIntent,
}

/// Errors reported by a `CheckoutStore` backend
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique constraint violated; nothing from the unit of work persisted
    #[error("Duplicate {key:?}: {value}")]
    Duplicate { key: DuplicateKey, value: String },

    /// Conditional status update lost a race
    #[error("Order {order_id} is now {current}")]
    StaleStatus { order_id: Uuid, current: OrderStatus },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend failure (connection, corrupt row, ...)
    #[error("Database error: {0}")]
    Database(String),
}

/// Core error type for all checkout operations
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// Missing or malformed input
    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    /// Checkout attempted with nothing in the cart
    #[error("Cart is empty")]
    EmptyCart,

    /// Payment gateway call failed; message is the provider's own
    #[error("{message}")]
    Gateway { provider: String, message: String },

    /// Order status change not permitted by the state machine
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Persisted state would be corrupted (e.g. order numbers exhausted)
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Retried request does not match what was stored the first time
    #[error("Idempotency conflict: {0}")]
    IdempotencyConflict(String),

    /// Gateway reports the intent has not succeeded
    #[error("Payment not completed: intent status is {status}")]
    PaymentNotSucceeded { status: String },

    /// Webhook signature verification failed
    #[error("Webhook verification failed: {0}")]
    WebhookVerification(String),

    /// Webhook payload could not be parsed
    #[error("Webhook parse error: {0}")]
    WebhookPayload(String),

    /// Configuration errors (missing keys, invalid config)
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CheckoutError {
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        CheckoutError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Returns the HTTP status code appropriate for this error
    pub fn status_code(&self) -> u16 {
        match self {
            CheckoutError::Validation(_) => 422,
            CheckoutError::EmptyCart => 422,
            CheckoutError::Gateway { .. } => 500,
            CheckoutError::InvalidTransition { .. } => 409,
            CheckoutError::NotFound { .. } => 404,
            CheckoutError::Integrity(_) => 500,
            CheckoutError::IdempotencyConflict(_) => 409,
            CheckoutError::PaymentNotSucceeded { .. } => 400,
            CheckoutError::WebhookVerification(_) => 400,
            CheckoutError::WebhookPayload(_) => 400,
            CheckoutError::Configuration(_) => 500,
            CheckoutError::Store(StoreError::NotFound(_)) => 404,
            CheckoutError::Store(_) => 500,
        }
    }

    /// Field-level messages, if this is a validation failure
    pub fn validation_errors(&self) -> Option<&ValidationErrors> {
        match self {
            CheckoutError::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}

/// Result type alias for checkout operations
pub type CheckoutResult<T> = Result<T, CheckoutError>;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
