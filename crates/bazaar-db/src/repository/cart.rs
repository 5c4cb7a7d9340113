//! # Cart Repository
//!
//! Carts are owned by the storefront; checkout reads their items, claims
//! the cart inside its own transaction and empties it after commit.

use bazaar_core::{Cart, CartItem, CartStatus};
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::DbResult;
use crate::repository::timestamp;

#[derive(Debug, sqlx::FromRow)]
struct CartRecord {
    id: i64,
    buyer_id: Option<i64>,
    status: CartStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CartRecord> for Cart {
    fn from(r: CartRecord) -> Self {
        Cart {
            id: r.id,
            buyer_id: r.buyer_id,
            status: r.status,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CartItemRecord {
    cart_id: i64,
    listing_id: i64,
    variant_id: Option<i64>,
    quantity: i64,
    price_snapshot_cents: i64,
}

impl From<CartItemRecord> for CartItem {
    fn from(r: CartItemRecord) -> Self {
        CartItem {
            cart_id: r.cart_id,
            listing_id: r.listing_id,
            variant_id: r.variant_id,
            quantity: r.quantity,
            price_snapshot_cents: r.price_snapshot_cents,
        }
    }
}

/// Repository for cart database operations.
#[derive(Debug, Clone)]
pub struct CartRepository {
    pool: SqlitePool,
}

impl CartRepository {
    pub fn new(pool: SqlitePool) -> Self {
        CartRepository { pool }
    }

    /// Opens an empty cart.
    pub async fn create(&self, buyer_id: Option<i64>) -> DbResult<Cart> {
        let now = timestamp(Utc::now());
        let record = sqlx::query_as::<_, CartRecord>(
            r#"
            INSERT INTO carts (buyer_id, status, created_at, updated_at)
            VALUES (?, 'open', ?, ?)
            RETURNING id, buyer_id, status, created_at, updated_at
            "#,
        )
        .bind(buyer_id)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        Ok(record.into())
    }

    /// Adds a line, snapshotting the price the buyer saw.
    pub async fn add_item(
        &self,
        cart_id: i64,
        listing_id: i64,
        variant_id: Option<i64>,
        quantity: i64,
        price_snapshot_cents: i64,
    ) -> DbResult<CartItem> {
        let record = sqlx::query_as::<_, CartItemRecord>(
            r#"
            INSERT INTO cart_items (
                cart_id, listing_id, variant_id, quantity, price_snapshot_cents, created_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            RETURNING cart_id, listing_id, variant_id, quantity, price_snapshot_cents
            "#,
        )
        .bind(cart_id)
        .bind(listing_id)
        .bind(variant_id)
        .bind(quantity)
        .bind(price_snapshot_cents)
        .bind(timestamp(Utc::now()))
        .fetch_one(&self.pool)
        .await?;

        Ok(record.into())
    }

    pub async fn get(&self, cart_id: i64) -> DbResult<Option<Cart>> {
        let record = sqlx::query_as::<_, CartRecord>(
            "SELECT id, buyer_id, status, created_at, updated_at FROM carts WHERE id = ?",
        )
        .bind(cart_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record.map(Cart::from))
    }

    /// Lines of a cart in the order they were added.
    pub async fn items(&self, cart_id: i64) -> DbResult<Vec<CartItem>> {
        let records = sqlx::query_as::<_, CartItemRecord>(
            r#"
            SELECT cart_id, listing_id, variant_id, quantity, price_snapshot_cents
            FROM cart_items
            WHERE cart_id = ?
            ORDER BY id
            "#,
        )
        .bind(cart_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records.into_iter().map(CartItem::from).collect())
    }

    /// Marks an open cart converted.
    ///
    /// Returns `false` if the cart is missing or another checkout already
    /// claimed it.
    pub async fn claim(
        conn: &mut SqliteConnection,
        cart_id: i64,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE carts SET status = 'converted', updated_at = ? WHERE id = ? AND status = 'open'",
        )
        .bind(timestamp(now))
        .bind(cart_id)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Empties a cart, returning how many lines were removed.
    pub async fn clear_items(&self, cart_id: i64) -> DbResult<u64> {
        let removed = sqlx::query("DELETE FROM cart_items WHERE cart_id = ?")
            .bind(cart_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        debug!(cart_id, removed, "Cart emptied");
        Ok(removed)
    }
}
