//! # External Collaborators
//!
//! Traits for the services checkout talks to but does not own.
//!
//! ```text
//! ┌──────────────────┐   order_created()    ┌───────────────────────────┐
//! │   OrderService   │ ───────────────────► │  OrderNotifier            │
//! │                  │   (spawned task,     │  email, push, seller feed │
//! │                  │    failure logged)   └───────────────────────────┘
//! │                  │
//! │                  │   request_refund()   ┌───────────────────────────┐
//! │                  │ ───────────────────► │  PaymentGateway           │
//! └──────────────────┘   idempotency key    └───────────────────────────┘
//! ```

use async_trait::async_trait;
use bazaar_core::Money;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::CheckoutResult;

// =============================================================================
// Notifications
// =============================================================================

/// Summary of a freshly created order, handed to the notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedNotice {
    pub order_id: i64,
    pub order_number: String,
    pub buyer_id: Option<i64>,
    pub storefront_id: i64,
    pub total: Money,
    pub currency: String,
    pub item_count: usize,
}

/// Best-effort sink for order events.
///
/// Called from a spawned task after the checkout transaction committed; an
/// error is logged and never reaches the buyer.
#[async_trait]
pub trait OrderNotifier: Send + Sync {
    async fn order_created(&self, notice: OrderCreatedNotice) -> CheckoutResult<()>;
}

/// Notifier that only writes a log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl OrderNotifier for LogNotifier {
    async fn order_created(&self, notice: OrderCreatedNotice) -> CheckoutResult<()> {
        info!(
            order_id = notice.order_id,
            order_number = %notice.order_number,
            storefront_id = notice.storefront_id,
            total = %notice.total,
            items = notice.item_count,
            "Order created"
        );
        Ok(())
    }
}

// =============================================================================
// Payments
// =============================================================================

/// Refund instruction forwarded to the payment collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub order_id: i64,
    /// Gateway reference of the original charge.
    pub payment_reference: Option<String>,
    pub amount: Money,
    pub currency: String,
    /// Unique per refund attempt; the gateway deduplicates on it.
    pub idempotency_key: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub refund_reference: String,
    pub amount: Money,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn request_refund(&self, request: RefundRequest) -> CheckoutResult<RefundReceipt>;
}
