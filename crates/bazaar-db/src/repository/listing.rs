//! # Listing Repository and Stock Ledger
//!
//! [`ListingRepository`] reads and writes catalog rows. [`StockLedger`] is the
//! only code that changes `listings.stock_quantity`.
//!
//! ## Stock Ledger Operations
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  All ledger calls run on a connection inside the caller's transaction.  │
//! │                                                                         │
//! │  lock(id)       UPDATE listings SET lock_version = lock_version + 1    │
//! │                 WHERE id = ? AND is_active = 1                          │
//! │                 → first write of the tx, takes SQLite's write lock     │
//! │                                                                         │
//! │  deduct(id, q)  UPDATE listings SET stock_quantity = stock_quantity - q│
//! │                 WHERE id = ? AND stock_quantity >= q                    │
//! │                 → check and write in one statement                     │
//! │                                                                         │
//! │  restore(id, q) stock_quantity = stock_quantity + q                    │
//! │                                                                         │
//! │  available(id)  stock_quantity − Σ active reservation quantity         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use bazaar_core::{
    lock_order, CoreError, Document, Listing, ListingVariant, MovementDirection, MovementReason,
    NewMovement, StockLevel,
};
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::repository::movement::MovementRepository;
use crate::repository::timestamp;

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct ListingRecord {
    id: i64,
    storefront_id: i64,
    sku: String,
    name: String,
    image_url: Option<String>,
    price_cents: i64,
    stock_quantity: i64,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ListingRecord> for Listing {
    fn from(r: ListingRecord) -> Self {
        Listing {
            id: r.id,
            storefront_id: r.storefront_id,
            sku: r.sku,
            name: r.name,
            image_url: r.image_url,
            price_cents: r.price_cents,
            stock_quantity: r.stock_quantity,
            is_active: r.is_active,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct VariantRecord {
    id: i64,
    listing_id: i64,
    sku: String,
    name: String,
    attributes: String,
    price_cents: Option<i64>,
}

impl TryFrom<VariantRecord> for ListingVariant {
    type Error = DbError;

    fn try_from(r: VariantRecord) -> DbResult<Self> {
        let attributes = Document::from_json(&r.attributes)
            .map_err(|e| DbError::serialization("listing_variants.attributes", e))?;
        Ok(ListingVariant {
            id: r.id,
            listing_id: r.listing_id,
            sku: r.sku,
            name: r.name,
            attributes,
            price_cents: r.price_cents,
        })
    }
}

const LISTING_COLUMNS: &str = "id, storefront_id, sku, name, image_url, price_cents, \
     stock_quantity, is_active, created_at, updated_at";

const VARIANT_COLUMNS: &str = "id, listing_id, sku, name, attributes, price_cents";

// =============================================================================
// Inserts
// =============================================================================

/// A catalog listing to insert.
#[derive(Debug, Clone)]
pub struct NewListing {
    pub storefront_id: i64,
    pub sku: String,
    pub name: String,
    pub image_url: Option<String>,
    pub price_cents: i64,
    pub stock_quantity: i64,
    pub is_active: bool,
}

impl NewListing {
    pub fn new(
        storefront_id: i64,
        sku: impl Into<String>,
        name: impl Into<String>,
        price_cents: i64,
        stock_quantity: i64,
    ) -> Self {
        NewListing {
            storefront_id,
            sku: sku.into(),
            name: name.into(),
            image_url: None,
            price_cents,
            stock_quantity,
            is_active: true,
        }
    }

    pub fn image_url(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct NewVariant {
    pub listing_id: i64,
    pub sku: String,
    pub name: String,
    pub attributes: Document,
    pub price_cents: Option<i64>,
}

// =============================================================================
// Listing Repository
// =============================================================================

/// Repository for listing database operations.
#[derive(Debug, Clone)]
pub struct ListingRepository {
    pool: SqlitePool,
}

impl ListingRepository {
    /// Creates a new ListingRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ListingRepository { pool }
    }

    /// Inserts a listing.
    pub async fn insert(&self, listing: &NewListing) -> DbResult<Listing> {
        debug!(sku = %listing.sku, stock = listing.stock_quantity, "Inserting listing");

        let now = timestamp(Utc::now());
        let sql = format!(
            r#"
            INSERT INTO listings (
                storefront_id, sku, name, image_url, price_cents,
                stock_quantity, is_active, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {}
            "#,
            LISTING_COLUMNS
        );

        let record = sqlx::query_as::<_, ListingRecord>(&sql)
            .bind(listing.storefront_id)
            .bind(&listing.sku)
            .bind(&listing.name)
            .bind(&listing.image_url)
            .bind(listing.price_cents)
            .bind(listing.stock_quantity)
            .bind(listing.is_active)
            .bind(&now)
            .bind(&now)
            .fetch_one(&self.pool)
            .await?;

        Ok(record.into())
    }

    /// Inserts a variant of an existing listing.
    pub async fn insert_variant(&self, variant: &NewVariant) -> DbResult<ListingVariant> {
        let attributes = variant
            .attributes
            .to_json()
            .map_err(|e| DbError::serialization("listing_variants.attributes", e))?;
        let sql = format!(
            r#"
            INSERT INTO listing_variants (listing_id, sku, name, attributes, price_cents)
            VALUES (?, ?, ?, ?, ?)
            RETURNING {}
            "#,
            VARIANT_COLUMNS
        );

        sqlx::query_as::<_, VariantRecord>(&sql)
            .bind(variant.listing_id)
            .bind(&variant.sku)
            .bind(&variant.name)
            .bind(attributes)
            .bind(variant.price_cents)
            .fetch_one(&self.pool)
            .await?
            .try_into()
    }

    /// Gets a listing by ID.
    pub async fn get(&self, id: i64) -> DbResult<Option<Listing>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_in(&mut conn, id).await
    }

    /// Gets a listing by ID on the caller's connection.
    pub async fn get_in(conn: &mut SqliteConnection, id: i64) -> DbResult<Option<Listing>> {
        let sql = format!("SELECT {} FROM listings WHERE id = ?", LISTING_COLUMNS);
        let record = sqlx::query_as::<_, ListingRecord>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(record.map(Listing::from))
    }

    /// Gets a variant by ID on the caller's connection.
    pub async fn get_variant_in(
        conn: &mut SqliteConnection,
        id: i64,
    ) -> DbResult<Option<ListingVariant>> {
        let sql = format!("SELECT {} FROM listing_variants WHERE id = ?", VARIANT_COLUMNS);
        sqlx::query_as::<_, VariantRecord>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .map(ListingVariant::try_from)
            .transpose()
    }

    /// Changes a listing's price. Open carts keep their snapshot.
    pub async fn set_price(&self, id: i64, price_cents: i64) -> DbResult<()> {
        let result = sqlx::query("UPDATE listings SET price_cents = ?, updated_at = ? WHERE id = ?")
            .bind(price_cents)
            .bind(timestamp(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Listing", id));
        }
        Ok(())
    }

    pub async fn set_active(&self, id: i64, active: bool) -> DbResult<()> {
        let result = sqlx::query("UPDATE listings SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(timestamp(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Listing", id));
        }
        Ok(())
    }

    /// Current stock position of a listing.
    pub async fn stock_level(&self, listing_id: i64) -> DbResult<StockLevel> {
        let mut conn = self.pool.acquire().await?;
        StockLedger::stock_level(&mut conn, listing_id).await
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM listings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Receives new physical stock.
    pub async fn restock(&self, listing_id: i64, quantity: i64, actor: &str) -> DbResult<StockLevel> {
        self.adjust_stock(listing_id, quantity, MovementReason::Restock, actor, None)
            .await
    }

    /// Corrects on-hand stock by `delta` and records why.
    ///
    /// A negative correction cannot eat into stock held by active
    /// reservations.
    pub async fn adjust_stock(
        &self,
        listing_id: i64,
        delta: i64,
        reason: MovementReason,
        actor: &str,
        notes: Option<String>,
    ) -> DbResult<StockLevel> {
        if delta == 0 {
            return Err(bazaar_core::ValidationError::MustBePositive {
                field: "quantity".to_string(),
            }
            .into());
        }

        let mut tx = self.pool.begin().await?;
        StockLedger::lock_any(&mut tx, listing_id).await?;

        let direction = if delta > 0 {
            StockLedger::restore(&mut tx, listing_id, delta).await?;
            MovementDirection::In
        } else {
            let available = StockLedger::available(&mut tx, listing_id).await?;
            if -delta > available {
                return Err(CoreError::InsufficientStock {
                    listing_id,
                    requested: -delta,
                    available,
                }
                .into());
            }
            StockLedger::deduct(&mut tx, listing_id, -delta).await?;
            MovementDirection::Out
        };

        MovementRepository::append(
            &mut tx,
            &NewMovement {
                listing_id,
                variant_id: None,
                direction,
                quantity: delta.abs(),
                reason,
                reference: None,
                notes,
                actor: actor.to_string(),
            },
        )
        .await?;

        let level = StockLedger::stock_level(&mut tx, listing_id).await?;
        tx.commit().await?;

        info!(listing_id, delta, on_hand = level.on_hand, "Stock adjusted");
        Ok(level)
    }
}

// =============================================================================
// Stock Ledger
// =============================================================================

/// Atomic stock mutation and listing locks.
///
/// Stateless; every method takes the transaction's connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct StockLedger;

impl StockLedger {
    /// Takes the write lock on an active listing.
    ///
    /// Fails with NotFound for a missing or inactive listing.
    pub async fn lock(conn: &mut SqliteConnection, listing_id: i64) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE listings SET lock_version = lock_version + 1 WHERE id = ? AND is_active = 1",
        )
        .bind(listing_id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Listing", listing_id));
        }
        Ok(())
    }

    /// Takes the write lock regardless of `is_active`.
    ///
    /// Commits and cancellations must still settle stock for a listing that
    /// was deactivated after the order was placed.
    pub async fn lock_any(conn: &mut SqliteConnection, listing_id: i64) -> DbResult<()> {
        let result = sqlx::query("UPDATE listings SET lock_version = lock_version + 1 WHERE id = ?")
            .bind(listing_id)
            .execute(&mut *conn)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Listing", listing_id));
        }
        Ok(())
    }

    /// Locks every listing in ascending id order and returns that order.
    pub async fn lock_many<I>(conn: &mut SqliteConnection, listing_ids: I) -> DbResult<Vec<i64>>
    where
        I: IntoIterator<Item = i64>,
    {
        let ordered = lock_order(listing_ids);
        for id in &ordered {
            Self::lock(conn, *id).await?;
        }
        debug!(listings = ?ordered, "Listings locked");
        Ok(ordered)
    }

    /// Removes `quantity` units from on-hand stock.
    ///
    /// ## Errors
    /// - `InsufficientStock` when on-hand stock is below `quantity`
    /// - `NotFound` for a missing listing
    pub async fn deduct(conn: &mut SqliteConnection, listing_id: i64, quantity: i64) -> DbResult<()> {
        require_positive(quantity)?;

        let result = sqlx::query(
            r#"
            UPDATE listings
            SET stock_quantity = stock_quantity - ?1, updated_at = ?2
            WHERE id = ?3 AND stock_quantity >= ?1
            "#,
        )
        .bind(quantity)
        .bind(timestamp(Utc::now()))
        .bind(listing_id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            let on_hand: Option<i64> =
                sqlx::query_scalar("SELECT stock_quantity FROM listings WHERE id = ?")
                    .bind(listing_id)
                    .fetch_optional(&mut *conn)
                    .await?;

            return Err(match on_hand {
                None => DbError::not_found("Listing", listing_id),
                Some(available) => CoreError::InsufficientStock {
                    listing_id,
                    requested: quantity,
                    available,
                }
                .into(),
            });
        }

        debug!(listing_id, quantity, "Stock deducted");
        Ok(())
    }

    /// Returns `quantity` units to on-hand stock.
    pub async fn restore(conn: &mut SqliteConnection, listing_id: i64, quantity: i64) -> DbResult<()> {
        require_positive(quantity)?;

        let result = sqlx::query(
            "UPDATE listings SET stock_quantity = stock_quantity + ?, updated_at = ? WHERE id = ?",
        )
        .bind(quantity)
        .bind(timestamp(Utc::now()))
        .bind(listing_id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Listing", listing_id));
        }

        debug!(listing_id, quantity, "Stock restored");
        Ok(())
    }

    /// On-hand stock minus the quantity held by active reservations.
    pub async fn available(conn: &mut SqliteConnection, listing_id: i64) -> DbResult<i64> {
        Ok(Self::stock_level(conn, listing_id).await?.available)
    }

    pub async fn stock_level(conn: &mut SqliteConnection, listing_id: i64) -> DbResult<StockLevel> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT
                l.stock_quantity,
                COALESCE((
                    SELECT SUM(r.quantity)
                    FROM inventory_reservations r
                    WHERE r.listing_id = l.id AND r.status = 'active'
                ), 0)
            FROM listings l
            WHERE l.id = ?
            "#,
        )
        .bind(listing_id)
        .fetch_optional(&mut *conn)
        .await?;

        let (on_hand, reserved) = row.ok_or_else(|| DbError::not_found("Listing", listing_id))?;
        Ok(StockLevel {
            listing_id,
            on_hand,
            reserved,
            available: on_hand - reserved,
        })
    }
}

fn require_positive(quantity: i64) -> DbResult<()> {
    if quantity <= 0 {
        return Err(bazaar_core::ValidationError::MustBePositive {
            field: "quantity".to_string(),
        }
        .into());
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
