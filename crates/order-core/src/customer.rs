//! # Customers and checkout forms
//!
//! Customers are deduplicated by normalized email. `CheckoutForm` is the raw
//! contact/fulfillment input shared by both checkout flows; validating it
//! yields a `ValidatedCheckout` or field-level errors.

use crate::error::{CheckoutResult, ValidationErrors};
use crate::money::Money;
use crate::order::FulfillmentType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const NAME_MAX: usize = 255;
const EMAIL_MAX: usize = 255;
const PHONE_MAX: usize = 20;
const NOTES_MAX: usize = 1000;
const ADDRESS_MAX: usize = 500;
const POST_CODE_MAX: usize = 20;
/// Largest shipping cost accepted, in currency units
pub const SHIPPING_COST_MAX: f64 = 1_000.0;

/// A person who has placed at least one order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    /// Normalized (trimmed, lowercase); the dedup key
    pub email: String,
    pub phone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Customer {
    /// New customer record from validated contact details
    pub fn from_contact(contact: &ContactDetails) -> Self {
        Self {
            id: Uuid::new_v4(),
            first_name: contact.first_name.clone(),
            last_name: contact.last_name.clone(),
            email: contact.email.clone(),
            phone: contact.phone.clone(),
            address: contact.address.clone(),
            post_code: contact.post_code.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Contact details that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactDetails {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub address: Option<String>,
    pub post_code: Option<String>,
}

impl ContactDetails {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Raw checkout input, as submitted by the client
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckoutForm {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub notes: Option<String>,
    /// Decimal amount, e.g. `3.00`
    #[serde(default)]
    pub shipping_cost: Option<f64>,
    /// `delivery`, `takeaway` or `pay_on_spot`
    #[serde(default)]
    pub order_type: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub post_code: Option<String>,
}

/// A checkout form that passed validation
#[derive(Debug, Clone)]
pub struct ValidatedCheckout {
    pub contact: ContactDetails,
    pub fulfillment: FulfillmentType,
    pub shipping_cost: Money,
    pub notes: Option<String>,
}

impl CheckoutForm {
    /// Validate every field, collecting all failures.
    ///
    /// Address and post code are required only for delivery orders.
    pub fn validate(&self) -> CheckoutResult<ValidatedCheckout> {
        let mut errors = ValidationErrors::new();

        let first_name = required(&mut errors, "first_name", &self.first_name, NAME_MAX);
        let last_name = required(&mut errors, "last_name", &self.last_name, NAME_MAX);
        let email = required(&mut errors, "email", &self.email, EMAIL_MAX).map(|e| e.to_lowercase());
        let phone = required(&mut errors, "phone", &self.phone, PHONE_MAX);
        let notes = optional(&mut errors, "notes", self.notes.as_deref(), NOTES_MAX);

        if let Some(email) = &email {
            if !looks_like_email(email) {
                errors.push("email", "The email field must be a valid email address.");
            }
        }

        let shipping_cost = match self.shipping_cost {
            None => {
                errors.push("shipping_cost", "The shipping cost field is required.");
                None
            }
            Some(cost) if !cost.is_finite() || cost < 0.0 => {
                errors.push("shipping_cost", "The shipping cost must be at least 0.");
                None
            }
            Some(cost) if cost > SHIPPING_COST_MAX => {
                errors.push(
                    "shipping_cost",
                    format!("The shipping cost must not be greater than {}.", SHIPPING_COST_MAX),
                );
                None
            }
            Some(cost) => Money::from_decimal(cost),
        };

        let fulfillment = if self.order_type.trim().is_empty() {
            errors.push("order_type", "The order type field is required.");
            None
        } else {
            match self.order_type.trim().parse::<FulfillmentType>() {
                Ok(kind) => Some(kind),
                Err(_) => {
                    errors.push("order_type", "The selected order type is invalid.");
                    None
                }
            }
        };

        let (address, post_code) = if fulfillment.map_or(false, |f| f.requires_address()) {
            (
                required(&mut errors, "address", self.address.as_deref().unwrap_or(""), ADDRESS_MAX),
                required(&mut errors, "post_code", self.post_code.as_deref().unwrap_or(""), POST_CODE_MAX),
            )
        } else {
            (
                optional(&mut errors, "address", self.address.as_deref(), ADDRESS_MAX),
                optional(&mut errors, "post_code", self.post_code.as_deref(), POST_CODE_MAX),
            )
        };

        errors.into_result()?;

        // Every Option below is Some once no errors were collected.
        match (first_name, last_name, email, phone, shipping_cost, fulfillment) {
            (Some(first_name), Some(last_name), Some(email), Some(phone), Some(shipping_cost), Some(fulfillment)) => {
                Ok(ValidatedCheckout {
                    contact: ContactDetails {
                        first_name,
                        last_name,
                        email,
                        phone,
                        address,
                        post_code,
                    },
                    fulfillment,
                    shipping_cost,
                    notes,
                })
            }
            _ => Err(crate::error::CheckoutError::Validation(ValidationErrors::single(
                "form",
                "The checkout form is incomplete.",
            ))),
        }
    }
}

fn required(errors: &mut ValidationErrors, field: &str, value: &str, max: usize) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        errors.push(field, format!("The {} field is required.", field.replace('_', " ")));
        return None;
    }
    if value.chars().count() > max {
        errors.push(
            field,
            format!("The {} field must not be greater than {} characters.", field.replace('_', " "), max),
        );
        return None;
    }
    Some(value.to_string())
}

fn optional(errors: &mut ValidationErrors, field: &str, value: Option<&str>, max: usize) -> Option<String> {
    match value.map(str::trim) {
        None | Some("") => None,
        Some(value) => required(errors, field, value, max),
    }
}

/// local@domain.tld, no whitespace, exactly one `@`
fn looks_like_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = email.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        _ => false,
    }
}
