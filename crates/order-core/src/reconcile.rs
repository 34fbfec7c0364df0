//! # Webhook Reconciler
//!
//! Applies gateway-pushed payment events to orders. Authentication is the
//! gateway signature over the raw body; once verified, every event is
//! acknowledged so the gateway does not redeliver it forever. Processing
//! problems are logged, never returned.

use crate::error::{CheckoutError, CheckoutResult};
use crate::gateway::{BoxedPaymentGateway, GatewayEvent, GatewayEventKind};
use crate::lifecycle::{Applied, OrderLifecycle, TransitionRequest};
use crate::order::{OrderNumber, OrderStatus};
use crate::store::CheckoutStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// What handling one verified event did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied {
        purchase_order_id: OrderNumber,
        from: OrderStatus,
        to: OrderStatus,
        refund_recorded: bool,
    },
    AlreadyApplied {
        purchase_order_id: OrderNumber,
        status: OrderStatus,
    },
    /// No order carries the intent (yet)
    OrderNotFound { payment_intent_id: String },
    /// Money was taken for an order that is already cancelled
    RefundOwed {
        purchase_order_id: OrderNumber,
        payment_intent_id: String,
        /// False when an earlier delivery or the client already recorded it
        recorded: bool,
    },
    /// The transition table forbids the change
    Rejected {
        purchase_order_id: OrderNumber,
        from: OrderStatus,
        to: OrderStatus,
    },
    Ignored { event_type: String },
    Failed { reason: String },
}

pub struct WebhookReconciler {
    gateway: BoxedPaymentGateway,
    store: Arc<dyn CheckoutStore>,
    lifecycle: OrderLifecycle,
}

impl WebhookReconciler {
    pub fn new(gateway: BoxedPaymentGateway, store: Arc<dyn CheckoutStore>) -> Self {
        let lifecycle = OrderLifecycle::new(store.clone());
        Self {
            gateway,
            store,
            lifecycle,
        }
    }

    /// Verify and apply one webhook delivery.
    ///
    /// Only verification and payload errors are returned; nothing is touched
    /// in that case.
    #[instrument(skip(self, payload, signature), fields(provider = self.gateway.provider_name()))]
    pub async fn handle(&self, payload: &[u8], signature: &str) -> CheckoutResult<WebhookOutcome> {
        let event = self
            .gateway
            .verify_webhook(payload, signature)
            .await
            .map_err(|e| {
                warn!("Rejected webhook delivery: {}", e);
                e
            })?;

        info!(
            "Received webhook event {} ({})",
            event.event_id,
            event.kind.label()
        );
        Ok(self.apply(&event).await)
    }

    /// Apply a verified event.
    pub async fn apply(&self, event: &GatewayEvent) -> WebhookOutcome {
        if let GatewayEventKind::Other(name) = &event.kind {
            debug!("Ignoring webhook event type {}", name);
            return WebhookOutcome::Ignored {
                event_type: name.clone(),
            };
        }

        let Some(intent_id) = event.payment_intent_id.as_deref() else {
            warn!("Webhook event {} carries no payment intent", event.event_id);
            return WebhookOutcome::Ignored {
                event_type: event.kind.label().to_string(),
            };
        };

        let request = match event.kind {
            GatewayEventKind::PaymentSucceeded => TransitionRequest::to(OrderStatus::Confirmed)
                .with_transaction(intent_id)
                .clearing_cart()
                .idempotent()
                .with_reason(event.kind.label()),
            _ => {
                let reason = match &event.failure_message {
                    Some(message) => format!("{}: {}", event.kind.label(), message),
                    None => event.kind.label().to_string(),
                };
                TransitionRequest::to(OrderStatus::Cancelled).with_reason(reason)
            }
        };

        let order = match self.store.order_by_intent(intent_id).await {
            Ok(Some(order)) => order,
            Ok(None) => {
                warn!(
                    "No order found for payment intent {} ({})",
                    intent_id,
                    event.kind.label()
                );
                return WebhookOutcome::OrderNotFound {
                    payment_intent_id: intent_id.to_string(),
                };
            }
            Err(e) => {
                error!("Order lookup for payment intent {} failed: {}", intent_id, e);
                return WebhookOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let purchase_order_id = order.purchase_order_id.clone();
        let snapshot = order.clone();
        match self.lifecycle.apply(order, &request).await {
            Ok(Applied::Moved {
                from,
                order,
                refund,
            }) => WebhookOutcome::Applied {
                purchase_order_id,
                from,
                to: order.status,
                refund_recorded: refund.is_some(),
            },
            Ok(Applied::Unchanged(order)) => {
                debug!(
                    "Order {} already {}, nothing to do",
                    purchase_order_id, order.status
                );
                WebhookOutcome::AlreadyApplied {
                    purchase_order_id,
                    status: order.status,
                }
            }
            Err(CheckoutError::InvalidTransition {
                from: OrderStatus::Cancelled,
                ..
            }) if event.kind == GatewayEventKind::PaymentSucceeded => {
                let amount = event.amount.unwrap_or_else(|| snapshot.total());
                match self
                    .lifecycle
                    .record_stranded_payment(&snapshot, intent_id, amount)
                    .await
                {
                    Ok(recorded) => WebhookOutcome::RefundOwed {
                        purchase_order_id,
                        payment_intent_id: intent_id.to_string(),
                        recorded,
                    },
                    Err(e) => {
                        error!(
                            "Failed to record refund for cancelled order {}: {}",
                            purchase_order_id, e
                        );
                        WebhookOutcome::Failed {
                            reason: e.to_string(),
                        }
                    }
                }
            }
            Err(CheckoutError::InvalidTransition { from, to }) => {
                warn!(
                    "Webhook {} cannot move order {} from {} to {}",
                    event.kind.label(),
                    purchase_order_id,
                    from,
                    to
                );
                WebhookOutcome::Rejected {
                    purchase_order_id,
                    from,
                    to,
                }
            }
            Err(e) => {
                error!(
                    "Failed to apply webhook {} to order {}: {}",
                    event.kind.label(),
                    purchase_order_id,
                    e
                );
                WebhookOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}
