//! # Checkout Error Types
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Checkout Error Categories                           │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Business rules │  │    Storage      │  │  Collaborators          │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Core(..)       │  │  Db(..)         │  │  Gateway                │ │
//! │  │  OrderNotFound  │  │                 │  │  RefundInProgress       │ │
//! │  │  CartNotFound   │  │                 │  │  RefundConflict         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │  Configuration  │  │    Runtime      │                              │
//! │  │                 │  │                 │                              │
//! │  │  InvalidConfig  │  │  ChannelError   │                              │
//! │  │  ConfigLoad     │  │                 │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use bazaar_core::{CoreError, ErrorKind, PaymentStatus, ValidationError};
use bazaar_db::DbError;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for checkout operations.
pub type CheckoutResult<T> = Result<T, CheckoutError>;

#[derive(Debug, Error)]
pub enum CheckoutError {
    // =========================================================================
    // Business Rules
    // =========================================================================
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Order not found: {0}")]
    OrderNotFound(i64),

    #[error("Cart not found: {0}")]
    CartNotFound(i64),

    /// The order's status moved under us between the read and the write.
    #[error("Order {order_id} was modified concurrently; reload and retry")]
    ConcurrentModification { order_id: i64 },

    // =========================================================================
    // Storage
    // =========================================================================
    #[error(transparent)]
    Db(DbError),

    // =========================================================================
    // Collaborators
    // =========================================================================
    /// The payment collaborator refused or failed the request.
    #[error("Payment gateway error: {message}")]
    Gateway { message: String, retryable: bool },

    /// Another refund holds the order's claim and has not settled yet.
    #[error("Refund {idempotency_key} for order {order_id} is already in progress")]
    RefundInProgress {
        order_id: i64,
        idempotency_key: Uuid,
    },

    /// Gateway accepted a refund but the order had already moved on.
    #[error("Refund {idempotency_key} for order {order_id} was accepted by the gateway but payment is now {payment_status}")]
    RefundConflict {
        order_id: i64,
        idempotency_key: Uuid,
        payment_status: PaymentStatus,
    },

    // =========================================================================
    // Configuration
    // =========================================================================
    #[error("Invalid checkout configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // Runtime
    // =========================================================================
    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl CheckoutError {
    /// Maps this error onto the caller-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CheckoutError::Core(err) => err.kind(),
            CheckoutError::Db(err) => err.kind(),
            CheckoutError::OrderNotFound(_) | CheckoutError::CartNotFound(_) => ErrorKind::NotFound,
            CheckoutError::ConcurrentModification { .. }
            | CheckoutError::RefundInProgress { .. }
            | CheckoutError::RefundConflict { .. } => ErrorKind::Conflict,
            CheckoutError::Gateway { retryable: true, .. } | CheckoutError::ChannelError(_) => {
                ErrorKind::Transient
            }
            CheckoutError::Gateway { retryable: false, .. } => ErrorKind::Conflict,
            CheckoutError::InvalidConfig(_) | CheckoutError::ConfigLoadFailed(_) => {
                ErrorKind::Validation
            }
        }
    }

    /// Returns the business rule violation behind this error, wherever it
    /// was raised.
    pub fn as_core(&self) -> Option<&CoreError> {
        match self {
            CheckoutError::Core(err) => Some(err),
            CheckoutError::Db(err) => err.as_core(),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for CheckoutError {
    /// Business errors raised inside a transaction surface as `Core` so
    /// callers match one variant no matter which layer detected them.
    fn from(err: DbError) -> Self {
        match err {
            DbError::Core(core) => CheckoutError::Core(core),
            other => CheckoutError::Db(other),
        }
    }
}

impl From<ValidationError> for CheckoutError {
    fn from(err: ValidationError) -> Self {
        CheckoutError::Core(CoreError::Validation(err))
    }
}

impl From<sqlx::Error> for CheckoutError {
    fn from(err: sqlx::Error) -> Self {
        CheckoutError::from(DbError::from(err))
    }
}

impl From<std::io::Error> for CheckoutError {
    fn from(err: std::io::Error) -> Self {
        CheckoutError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for CheckoutError {
    fn from(err: toml::de::Error) -> Self {
        CheckoutError::ConfigLoadFailed(err.to_string())
    }
}
