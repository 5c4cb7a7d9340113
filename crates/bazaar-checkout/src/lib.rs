//! # bazaar-checkout: Checkout Orchestration for Bazaar
//!
//! Turns carts into orders, holds stock for them while payment is pending,
//! and reclaims holds the buyer never paid for.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Checkout Architecture                            │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                     OrderService (orchestrator)                  │  │
//! │  │                                                                  │  │
//! │  │  create_order · confirm_order_payment · cancel_order             │  │
//! │  │  update_order_status · process_refund · process_partial_refund   │  │
//! │  └───────────┬────────────────────┬─────────────────────┬───────────┘  │
//! │              ▼                    ▼                     ▼              │
//! │  ┌────────────────────┐  ┌────────────────────┐  ┌──────────────────┐  │
//! │  │ bazaar-core        │  │ bazaar-db          │  │ Collaborators    │  │
//! │  │                    │  │                    │  │                  │  │
//! │  │ finance (money)    │  │ StockLedger        │  │ OrderNotifier    │  │
//! │  │ validation         │  │ ReservationManager │  │ PaymentGateway   │  │
//! │  │ order state machine│  │ OrderRepository    │  │                  │  │
//! │  └────────────────────┘  └─────────▲──────────┘  └──────────────────┘  │
//! │                                    │                                    │
//! │  ┌─────────────────────────────────┴────────────────────────────────┐  │
//! │  │  ExpirySweeper: interval loop, expire_stale in batches           │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Stock Lifecycle
//! - `create_order` reserves: `available` drops, `on_hand` does not.
//! - `confirm_order_payment` commits: `on_hand` drops, `reserved` follows.
//! - cancel, release and expiry return holds to `available`.
//! - cancelling a confirmed order writes the committed stock back with an
//!   `in` movement.
//!
//! ## Module Organization
//! - [`orchestrator`] - `OrderService` and its request/response types
//! - [`sweeper`] - `ExpirySweeper` background task
//! - [`collaborators`] - notifier and payment gateway traits
//! - [`config`] - TOML configuration with `BAZAAR_*` overrides
//! - [`error`] - Checkout error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bazaar_checkout::{CheckoutConfig, ExpirySweeper, OrderService};
//!
//! let config = CheckoutConfig::load(None)?;
//! let db = Database::new(config.database.db_config()).await?;
//!
//! let (sweeper, sweeper_handle) = ExpirySweeper::from_config(db.clone(), &config);
//! tokio::spawn(sweeper.run());
//!
//! let service = OrderService::from_config(db, &config, gateway);
//! let placed = service.create_order(request).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod collaborators;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod sweeper;

// =============================================================================
// Re-exports
// =============================================================================

pub use collaborators::{
    LogNotifier, OrderCreatedNotice, OrderNotifier, PaymentGateway, RefundReceipt, RefundRequest,
};
pub use config::CheckoutConfig;
pub use error::{CheckoutError, CheckoutResult};
pub use orchestrator::{
    CreateOrderRequest, OrderLine, OrderService, OrderSource, PaymentConfirmation, PlacedOrder,
    RefundOutcome,
};
pub use sweeper::{ExpirySweeper, ExpirySweeperHandle};
