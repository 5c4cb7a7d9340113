//! # Domain Types
//!
//! Core domain types used throughout the checkout core.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌──────────────────────┐  │
//! │  │     Order       │   │   OrderItem     │   │ InventoryReservation │  │
//! │  │  ─────────────  │   │  ─────────────  │   │  ──────────────────  │  │
//! │  │  id (i64)       │◄──│  order_id (FK)  │   │  listing_id          │  │
//! │  │  order_number   │   │  *_snapshot     │   │  reference ──► Order │  │
//! │  │  status         │   │  unit_price     │   │  status, expires_at  │  │
//! │  │  money fields   │   │  total          │   │  quantity            │  │
//! │  └─────────────────┘   └─────────────────┘   └──────────────────────┘  │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌──────────────────────┐  │
//! │  │   OrderStatus   │   │ReservationStatus│   │  InventoryMovement   │  │
//! │  │  pending        │   │  active         │   │  direction in/out    │  │
//! │  │  confirmed      │   │  committed      │   │  reason, actor       │  │
//! │  │  shipped        │   │  released       │   │  (append-only)       │  │
//! │  │  delivered      │   │  expired        │   └──────────────────────┘  │
//! │  │  cancelled      │   └─────────────────┘                             │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dual-Key Identity Pattern
//! Orders carry:
//! - `id`: numeric, immutable, used for relations
//! - `order_number`: human-readable `ORD-<year>-<sequence>`

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::ValidationError;
use crate::money::Money;

// =============================================================================
// Order Status
// =============================================================================

/// The lifecycle status of an order.
///
/// ## State Machine
/// ```text
///   pending ──► confirmed ──► shipped ──► delivered
///      │            │
///      └────────────┴──► cancelled
/// ```
/// `delivered` and `cancelled` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created, awaiting payment. Stock is held by active reservations.
    #[default]
    Pending,
    /// Payment confirmed, reservations committed.
    Confirmed,
    /// Handed to the carrier.
    Shipped,
    /// Received by the buyer.
    Delivered,
    /// Withdrawn before shipping.
    Cancelled,
}

impl OrderStatus {
    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Confirmed, Shipped)
                | (Shipped, Delivered)
                | (Pending, Cancelled)
                | (Confirmed, Cancelled)
        )
    }

    /// Cancellation is allowed only before shipping.
    pub fn is_cancellable(&self) -> bool {
        self.can_transition_to(OrderStatus::Cancelled)
    }

    /// Absorbing states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Payment Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Completed,
    Refunded,
    PartiallyRefunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::PartiallyRefunded => "partially_refunded",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Reservation Status
// =============================================================================

/// Status of a stock hold.
///
/// ```text
///   active ──► committed   (stock deducted, permanent)
///     │
///     ├─────► released    (withdrawn, no stock impact)
///     │
///     └─────► expired     (TTL elapsed, reclaimed by the sweep)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    #[default]
    Active,
    Committed,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Committed => "committed",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Reservation Reference
// =============================================================================

/// The owner of a reservation.
///
/// Persisted as a `(reference_type, reference_id)` pair; in code it is always
/// this enum so an order id can never be confused with a cart id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ReservationReference {
    /// Hold placed by checkout for an order.
    Order(i64),
    /// Hold placed while a cart is open.
    Cart(i64),
}

impl ReservationReference {
    pub const ORDER: &'static str = "order";
    pub const CART: &'static str = "cart";

    pub fn reference_type(&self) -> &'static str {
        match self {
            ReservationReference::Order(_) => Self::ORDER,
            ReservationReference::Cart(_) => Self::CART,
        }
    }

    pub fn reference_id(&self) -> i64 {
        match self {
            ReservationReference::Order(id) | ReservationReference::Cart(id) => *id,
        }
    }

    /// Rebuilds the reference from its persisted columns.
    pub fn from_parts(reference_type: &str, reference_id: i64) -> Result<Self, ValidationError> {
        match reference_type {
            Self::ORDER => Ok(ReservationReference::Order(reference_id)),
            Self::CART => Ok(ReservationReference::Cart(reference_id)),
            other => Err(ValidationError::InvalidFormat {
                field: "reference_type".to_string(),
                reason: format!("unknown reference kind '{}'", other),
            }),
        }
    }
}

impl fmt::Display for ReservationReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.reference_type(), self.reference_id())
    }
}

// =============================================================================
// Inventory Movement
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum MovementDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum MovementReason {
    /// Reservation committed after payment.
    OrderCommitted,
    /// Confirmed order cancelled, stock returned.
    OrderCancelled,
    ManualAdjustment,
    Restock,
}

/// Append-only audit record of a physical stock change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryMovement {
    pub id: i64,
    pub listing_id: i64,
    pub variant_id: Option<i64>,
    pub direction: MovementDirection,
    pub quantity: i64,
    pub reason: MovementReason,
    pub reference: Option<ReservationReference>,
    pub notes: Option<String>,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

/// A movement about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMovement {
    pub listing_id: i64,
    pub variant_id: Option<i64>,
    pub direction: MovementDirection,
    pub quantity: i64,
    pub reason: MovementReason,
    pub reference: Option<ReservationReference>,
    pub notes: Option<String>,
    pub actor: String,
}

// =============================================================================
// Inventory Reservation
// =============================================================================

/// A time-bounded claim on a listing's stock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryReservation {
    pub id: i64,
    pub listing_id: i64,
    pub variant_id: Option<i64>,
    pub reference: ReservationReference,
    pub quantity: i64,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the reservation reached its terminal status.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl InventoryReservation {
    /// True for an active hold whose window has elapsed at `now`.
    ///
    /// Such a hold still counts against availability until the sweep runs,
    /// but it can no longer be committed.
    pub fn is_lapsed_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Active && self.expires_at <= now
    }
}

// =============================================================================
// Listing (catalog collaborator)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    pub storefront_id: i64,
    pub sku: String,
    pub name: String,
    pub image_url: Option<String>,
    pub price_cents: i64,
    /// Physical on-hand quantity; mutated only by the stock ledger.
    pub stock_quantity: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Listing {
    #[inline]
    pub fn price(&self) -> Money {
        Money::from_cents(self.price_cents)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingVariant {
    pub id: i64,
    pub listing_id: i64,
    pub sku: String,
    pub name: String,
    pub attributes: Document,
    /// Overrides the listing price when set.
    pub price_cents: Option<i64>,
}

impl ListingVariant {
    pub fn effective_price(&self, listing: &Listing) -> Money {
        self.price_cents
            .map(Money::from_cents)
            .unwrap_or_else(|| listing.price())
    }
}

/// Stock position of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub listing_id: i64,
    pub on_hand: i64,
    /// Σ quantity of active reservations.
    pub reserved: i64,
    pub available: i64,
}

/// Returns the distinct listing ids in the order their locks must be taken.
///
/// Every transaction that locks more than one listing acquires the locks in
/// ascending id order, so two checkouts sharing listings can never wait on
/// each other in a cycle.
pub fn lock_order<I>(listing_ids: I) -> Vec<i64>
where
    I: IntoIterator<Item = i64>,
{
    listing_ids
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

// =============================================================================
// Cart (external collaborator input)
// =============================================================================

/// A cart line as captured when the buyer added it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub cart_id: i64,
    pub listing_id: i64,
    pub variant_id: Option<i64>,
    pub quantity: i64,
    /// Price seen by the buyer when the item was added.
    pub price_snapshot_cents: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum CartStatus {
    Open,
    Converted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    pub id: i64,
    pub buyer_id: Option<i64>,
    pub status: CartStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Price Drift
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceDirection {
    Increased,
    Decreased,
}

/// A difference between a cart snapshot price and the current price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceChange {
    pub listing_id: i64,
    pub variant_id: Option<i64>,
    pub old_price: Money,
    pub new_price: Money,
    pub direction: PriceDirection,
}

impl PriceChange {
    /// Returns the drift between `old` and `new`, or `None` when equal.
    pub fn between(listing_id: i64, variant_id: Option<i64>, old: Money, new: Money) -> Option<Self> {
        let direction = match new.cmp(&old) {
            std::cmp::Ordering::Equal => return None,
            std::cmp::Ordering::Greater => PriceDirection::Increased,
            std::cmp::Ordering::Less => PriceDirection::Decreased,
        };
        Some(PriceChange {
            listing_id,
            variant_id,
            old_price: old,
            new_price: new,
            direction,
        })
    }
}

// =============================================================================
// Address
// =============================================================================

/// Structured postal address, stored as a JSON document column.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Address {
    pub recipient: String,
    pub line1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line2: Option<String>,
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub postal_code: String,
    /// ISO 3166-1 alpha-2.
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

// =============================================================================
// Order
// =============================================================================

/// A durable order produced by checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub order_number: String,
    /// `None` for guest checkout.
    pub buyer_id: Option<i64>,
    pub storefront_id: i64,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub shipping_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
    pub commission_cents: i64,
    pub seller_amount_cents: i64,
    pub currency: String,
    pub shipping_address: Address,
    pub billing_address: Address,
    pub escrow_days: i64,
    pub escrow_release_date: Option<DateTime<Utc>>,
    pub customer_notes: Option<String>,
    pub payment_reference: Option<String>,
    pub payment_details: Option<Document>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Order {
    #[inline]
    pub fn subtotal(&self) -> Money {
        Money::from_cents(self.subtotal_cents)
    }

    #[inline]
    pub fn total(&self) -> Money {
        Money::from_cents(self.total_cents)
    }

    #[inline]
    pub fn commission(&self) -> Money {
        Money::from_cents(self.commission_cents)
    }

    #[inline]
    pub fn seller_amount(&self) -> Money {
        Money::from_cents(self.seller_amount_cents)
    }

    /// The reference under which this order's reservations are filed.
    #[inline]
    pub fn reservation_reference(&self) -> ReservationReference {
        ReservationReference::Order(self.id)
    }

    pub fn is_owned_by(&self, user_id: i64) -> bool {
        self.buyer_id == Some(user_id)
    }
}

// =============================================================================
// Order Item
// =============================================================================

/// A line in an order.
/// Uses the snapshot pattern to freeze listing data at order time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub listing_id: i64,
    pub variant_id: Option<i64>,
    pub quantity: i64,
    /// Unit price at order time (frozen).
    pub unit_price_cents: i64,
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
    /// Listing/variant name at order time (frozen).
    pub name_snapshot: String,
    /// SKU at order time (frozen).
    pub sku_snapshot: String,
    /// Variant attributes at order time (frozen).
    pub attributes_snapshot: Document,
    pub image_snapshot: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OrderItem {
    #[inline]
    pub fn unit_price(&self) -> Money {
        Money::from_cents(self.unit_price_cents)
    }

    #[inline]
    pub fn total(&self) -> Money {
        Money::from_cents(self.total_cents)
    }
}

/// An order line ready to be persisted (no ids yet).
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrderItem {
    pub listing_id: i64,
    pub variant_id: Option<i64>,
    pub quantity: i64,
    pub unit_price: Money,
    pub subtotal: Money,
    pub discount: Money,
    pub total: Money,
    pub name_snapshot: String,
    pub sku_snapshot: String,
    pub attributes_snapshot: Document,
    pub image_snapshot: Option<String>,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_order_state_machine_edges() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Shipped));
        assert!(Shipped.can_transition_to(Delivered));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Shipped));
        assert!(!Shipped.can_transition_to(Cancelled));
        assert!(!Delivered.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Confirmed.can_transition_to(Confirmed));
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        use OrderStatus::*;
        for terminal in [Delivered, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Confirmed, Shipped, Delivered, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_cancellable() {
        assert!(OrderStatus::Pending.is_cancellable());
        assert!(OrderStatus::Confirmed.is_cancellable());
        assert!(!OrderStatus::Shipped.is_cancellable());
        assert!(!OrderStatus::Delivered.is_cancellable());
    }

    #[test]
    fn test_reservation_reference_parts() {
        let reference = ReservationReference::Order(12);
        assert_eq!(reference.reference_type(), "order");
        assert_eq!(reference.reference_id(), 12);
        assert_eq!(
            ReservationReference::from_parts("order", 12).unwrap(),
            reference
        );
        assert_eq!(
            ReservationReference::from_parts("cart", 3).unwrap(),
            ReservationReference::Cart(3)
        );
        assert!(ReservationReference::from_parts("invoice", 1).is_err());
        assert_eq!(reference.to_string(), "order:12");
    }

    #[test]
    fn test_lock_order_sorts_and_dedups() {
        assert_eq!(lock_order(vec![9, 3, 7, 3, 1, 9]), vec![1, 3, 7, 9]);
        assert!(lock_order(Vec::new()).is_empty());
    }

    #[test]
    fn test_price_change_direction() {
        let up = PriceChange::between(1, None, Money::from_cents(100), Money::from_cents(120)).unwrap();
        assert_eq!(up.direction, PriceDirection::Increased);

        let down = PriceChange::between(1, Some(2), Money::from_cents(100), Money::from_cents(80)).unwrap();
        assert_eq!(down.direction, PriceDirection::Decreased);
        assert_eq!(down.variant_id, Some(2));

        assert!(PriceChange::between(1, None, Money::from_cents(5), Money::from_cents(5)).is_none());
    }

    #[test]
    fn test_reservation_lapse() {
        let now = Utc::now();
        let mut reservation = InventoryReservation {
            id: 1,
            listing_id: 1,
            variant_id: None,
            reference: ReservationReference::Order(1),
            quantity: 2,
            status: ReservationStatus::Active,
            expires_at: now - Duration::seconds(1),
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };
        assert!(reservation.is_lapsed_at(now));

        reservation.status = ReservationStatus::Committed;
        assert!(!reservation.is_lapsed_at(now));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&PaymentStatus::PartiallyRefunded).unwrap(),
            "\"partially_refunded\""
        );
        assert_eq!(OrderStatus::default(), OrderStatus::Pending);
        assert!(ReservationStatus::Expired.is_terminal());
        assert!(!ReservationStatus::Active.is_terminal());
    }
}
