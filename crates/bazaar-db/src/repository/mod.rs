//! # Repository Module
//!
//! Database repository implementations for the checkout core.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repositories and Their Tables                        │
//! │                                                                         │
//! │  ListingRepository / StockLedger  ──►  listings, listing_variants      │
//! │  ReservationManager               ──►  inventory_reservations          │
//! │  OrderRepository                  ──►  orders, order_items,            │
//! │                                        order_sequences                  │
//! │  MovementRepository               ──►  inventory_movements (append)    │
//! │  CartRepository                   ──►  carts, cart_items               │
//! │                                                                         │
//! │  Pool-level methods open their own transaction.                        │
//! │  `*_in(conn, ..)` / ledger methods join the caller's transaction.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`listing::ListingRepository`] - Listing reads and catalog inserts
//! - [`listing::StockLedger`] - Listing locks and atomic stock mutation
//! - [`reservation::ReservationManager`] - Reservation state machine
//! - [`order::OrderRepository`] - Orders, items, order numbers
//! - [`movement::MovementRepository`] - Inventory audit trail
//! - [`cart::CartRepository`] - Cart snapshots

pub mod cart;
pub mod listing;
pub mod movement;
pub mod order;
pub mod reservation;

use chrono::{DateTime, SecondsFormat, Utc};

/// Formats a timestamp for binding.
///
/// Fixed microsecond width with a `Z` suffix, so text comparison in SQL
/// (`expires_at <= ?`) orders the same way as the instants do.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
