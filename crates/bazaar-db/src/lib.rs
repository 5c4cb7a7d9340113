//! # bazaar-db: Database Layer for the Checkout Core
//!
//! SQLite persistence for listings, carts, orders and inventory, plus the two
//! components that guard stock: the [`StockLedger`] and the
//! [`ReservationManager`].
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Checkout Data Flow                               │
//! │                                                                         │
//! │  OrderService::create_order / confirm_order_payment / cancel_order     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    bazaar-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌──────────────────┐   ┌─────────────┐  │   │
//! │  │   │   Database    │    │   Repositories   │   │ Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                  │   │ (embedded)  │  │   │
//! │  │   │               │    │ StockLedger      │   │             │  │   │
//! │  │   │ SqlitePool    │◄───│ ReservationMgr   │   │ 001_init    │  │   │
//! │  │   │ WAL + busy    │    │ Order / Cart     │   │             │  │   │
//! │  │   │ timeout       │    │ Movement         │   │             │  │   │
//! │  │   └───────────────┘    └──────────────────┘   └─────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Transactions
//!
//! Operations that must compose inside one transaction take a
//! `&mut SqliteConnection` (pass `&mut *tx`). Operations that stand alone take
//! `&self` and open their own transaction on the pool.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bazaar_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("bazaar.db")).await?;
//! let level = db.listings().stock_level(42).await?;
//! let swept = db.reservations().expire_stale(chrono::Utc::now(), 500).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use migrations::MigrationStatus;
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::cart::CartRepository;
pub use repository::listing::{ListingRepository, NewListing, NewVariant, StockLedger};
pub use repository::movement::MovementRepository;
pub use repository::order::{NewOrder, OrderRepository};
pub use repository::reservation::{NewReservation, ReservationManager};
