//! # Error Types
//!
//! Domain-specific error types for bazaar-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  bazaar-core errors (this file)                                        │
//! │  ├── CoreError        - Business rule violations                       │
//! │  ├── ValidationError  - Input validation failures                      │
//! │  └── ErrorKind        - Caller-facing classification                   │
//! │                                                                         │
//! │  bazaar-db errors                                                      │
//! │  └── DbError          - Database operation failures (wraps CoreError)  │
//! │                                                                         │
//! │  bazaar-checkout errors                                                │
//! │  └── CheckoutError    - Orchestrator failures (wraps DbError)          │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → DbError → CheckoutError           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Error Kinds
//! ```text
//! Validation  rejected before any mutation (empty cart, bad quantity)
//! NotFound    missing listing/order/reservation, no retry
//! Conflict    stock, price drift, ownership, state machine; retry with fresh data
//! Transient   lock/storage failure; the transaction rolled back, blind retry is safe
//! Expired     reservation or payment window elapsed; a new order is required
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{OrderStatus, PaymentStatus, PriceChange, ReservationStatus};

// =============================================================================
// Error Kind
// =============================================================================

/// Classification every error in the workspace maps onto.
///
/// The excluded HTTP boundary translates these into status codes; the core
/// only ever returns typed errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Transient,
    Expired,
}

impl ErrorKind {
    /// Whether retrying the whole operation unchanged can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

// =============================================================================
// Core Error
// =============================================================================

/// Business rule violations raised by the checkout core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Requested quantity exceeds what is available at checkout time.
    ///
    /// ## User Workflow
    /// ```text
    /// Checkout (qty: 5)
    ///      │
    ///      ▼
    /// Lock listing, check available = 3
    ///      │
    ///      ▼
    /// InsufficientStock { listing_id: 42, requested: 5, available: 3 }
    /// ```
    #[error("Insufficient stock for listing {listing_id}: available {available}, requested {requested}")]
    InsufficientStock {
        listing_id: i64,
        requested: i64,
        available: i64,
    },

    /// A reservation could not be placed because the hold would exceed stock.
    #[error(
        "Stock not available for listing {listing_id}: requested {requested}, available {available} of {total}"
    )]
    StockNotAvailable {
        listing_id: i64,
        requested: i64,
        available: i64,
        total: i64,
    },

    /// One or more listing prices moved since the cart snapshot was taken.
    #[error("Prices changed for {} item(s) since the cart was built", changes.len())]
    PriceChanged { changes: Vec<PriceChange> },

    /// Requested status change is not an edge of the order state machine.
    #[error("Order {order_id} cannot transition from {from} to {to}")]
    InvalidTransition {
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
    },

    /// Order is not in a cancellable status.
    #[error("Order {order_id} is {status} and cannot be cancelled")]
    OrderCannotCancel { order_id: i64, status: OrderStatus },

    /// Requester is not the buyer of the order.
    #[error("User {requester_id} is not allowed to modify order {order_id}")]
    NotOrderOwner { order_id: i64, requester_id: i64 },

    /// Reservation is already in a terminal status.
    #[error("Cannot {action} reservation {reservation_id}, current status={status}")]
    ReservationNotActive {
        reservation_id: i64,
        action: &'static str,
        status: ReservationStatus,
    },

    /// Reservation's hold window elapsed before it was committed.
    #[error("Reservation {reservation_id} expired at {expired_at}")]
    ReservationExpired {
        reservation_id: i64,
        expired_at: DateTime<Utc>,
    },

    /// Payment confirmation arrived after the order's holds lapsed.
    #[error("Payment window for order {order_id} has expired; a new order is required")]
    PaymentWindowExpired { order_id: i64 },

    /// Payment was already settled (or the order left `pending`).
    #[error("Order {order_id} is {status} with payment {payment_status}; payment cannot be confirmed")]
    PaymentNotPending {
        order_id: i64,
        status: OrderStatus,
        payment_status: PaymentStatus,
    },

    /// Refund requested for an order whose payment is not settled.
    #[error("Order {order_id} payment is {payment_status}; nothing to refund")]
    PaymentNotRefundable {
        order_id: i64,
        payment_status: PaymentStatus,
    },

    /// Items from more than one storefront in a single order.
    #[error("Order items span multiple storefronts: {storefronts:?}")]
    MixedStorefronts { storefronts: Vec<i64> },

    /// Derived monetary fields do not reconcile.
    #[error("Financial invariant violated: {0}")]
    FinancialInvariant(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Maps this error onto the caller-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_)
            | CoreError::MixedStorefronts { .. }
            | CoreError::FinancialInvariant(_) => ErrorKind::Validation,
            CoreError::ReservationExpired { .. } | CoreError::PaymentWindowExpired { .. } => {
                ErrorKind::Expired
            }
            CoreError::InsufficientStock { .. }
            | CoreError::StockNotAvailable { .. }
            | CoreError::PriceChanged { .. }
            | CoreError::InvalidTransition { .. }
            | CoreError::OrderCannotCancel { .. }
            | CoreError::NotOrderOwner { .. }
            | CoreError::ReservationNotActive { .. }
            | CoreError::PaymentNotPending { .. }
            | CoreError::PaymentNotRefundable { .. } => ErrorKind::Conflict,
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised before any mutation is attempted.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Value must not be negative.
    #[error("{field} must not be negative")]
    MustNotBeNegative { field: String },

    /// Invalid format.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Duplicate value in a collection that must be unique.
    #[error("{field} '{value}' appears more than once")]
    Duplicate { field: String, value: String },
}

impl ValidationError {
    pub fn required(field: impl Into<String>) -> Self {
        ValidationError::Required {
            field: field.into(),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Money;
    use crate::types::PriceDirection;

    #[test]
    fn test_insufficient_stock_message() {
        let err = CoreError::InsufficientStock {
            listing_id: 42,
            available: 3,
            requested: 5,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient stock for listing 42: available 3, requested 5"
        );
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_reservation_not_active_message() {
        let err = CoreError::ReservationNotActive {
            reservation_id: 7,
            action: "commit",
            status: ReservationStatus::Committed,
        };
        assert_eq!(
            err.to_string(),
            "Cannot commit reservation 7, current status=committed"
        );
    }

    #[test]
    fn test_price_changed_counts_items() {
        let err = CoreError::PriceChanged {
            changes: vec![PriceChange {
                listing_id: 1,
                variant_id: None,
                old_price: Money::from_cents(1000),
                new_price: Money::from_cents(1200),
                direction: PriceDirection::Increased,
            }],
        };
        assert_eq!(
            err.to_string(),
            "Prices changed for 1 item(s) since the cart was built"
        );
    }

    #[test]
    fn test_kinds() {
        let expired = CoreError::PaymentWindowExpired { order_id: 1 };
        assert_eq!(expired.kind(), ErrorKind::Expired);
        assert!(!expired.kind().is_retryable());

        let validation: CoreError = ValidationError::required("items").into();
        assert_eq!(validation.kind(), ErrorKind::Validation);
        assert!(matches!(validation, CoreError::Validation(_)));

        assert!(ErrorKind::Transient.is_retryable());
    }
}
