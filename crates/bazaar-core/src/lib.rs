//! # bazaar-core: Pure Business Logic for the Checkout Core
//!
//! This crate holds every rule of checkout that can be expressed without I/O:
//! money arithmetic, order financials, status state machines and validation.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Checkout Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              bazaar-checkout (Order Orchestrator)               │   │
//! │  │    create_order, cancel_order, confirm_order_payment, ...      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ bazaar-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   money   │  │  finance  │  │ validation│  │   │
//! │  │   │   Order   │  │   Money   │  │  totals   │  │   rules   │  │   │
//! │  │   │ Reserv.   │  │   Rate    │  │  refunds  │  │  checks   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │        bazaar-db (Stock Ledger, Reservation Manager)            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Order, OrderItem, InventoryReservation, ...)
//! - [`money`] - Money and Rate types with integer arithmetic
//! - [`finance`] - Financial Calculator (subtotal, tax, commission, refunds)
//! - [`document`] - Structured key/value documents for gateway payloads
//! - [`error`] - Domain error types and error kinds
//! - [`validation`] - Input validation
//!
//! ## Example Usage
//!
//! ```rust
//! use bazaar_core::finance::{item_financials, order_financials, FinancialConfig};
//! use bazaar_core::money::{Money, Rate};
//!
//! let config = FinancialConfig::new(Rate::from_bps(2000), Rate::from_bps(1000), "USD");
//! let items = vec![
//!     item_financials(2, Money::from_cents(1000), Rate::zero()),
//!     item_financials(1, Money::from_cents(2000), Rate::zero()),
//! ];
//! let totals = order_financials(&items, Money::from_cents(500), Money::zero(), &config).unwrap();
//!
//! assert_eq!(totals.total.cents(), 5300);
//! assert_eq!(totals.seller_amount.cents(), 4900);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod document;
pub mod error;
pub mod finance;
pub mod money;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use document::{DocValue, Document};
pub use error::{CoreError, ErrorKind, ValidationError};
pub use money::{Money, Rate};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum distinct lines allowed in a single order.
pub const MAX_ORDER_ITEMS: usize = 100;

/// Maximum quantity of a single line.
///
/// ## Business Reason
/// Prevents accidental over-ordering (e.g., typing 1000 instead of 10).
pub const MAX_ITEM_QUANTITY: i64 = 999;

/// Hold applied when a reservation is created without an explicit TTL.
pub const DEFAULT_RESERVATION_TTL_SECS: i64 = 15 * 60;

/// Upper bound on any reservation hold.
pub const MAX_RESERVATION_TTL_SECS: i64 = 24 * 60 * 60;

/// Hold applied to reservations created by checkout.
pub const CHECKOUT_RESERVATION_TTL_SECS: i64 = 30 * 60;

/// Default escrow hold after payment confirmation.
pub const DEFAULT_ESCROW_DAYS: i64 = 7;

/// Longest escrow hold a storefront may configure (ten years).
pub const MAX_ESCROW_DAYS: i64 = 3650;
