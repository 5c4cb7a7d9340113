//! # Reservation Manager
//!
//! Time-bounded holds on listing stock.
//!
//! ## Reservation State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │                ┌──────────── commit ─────────► committed                 │
//! │                │            (deducts stock,                             │
//! │                │             appends "out" movement)                    │
//! │   create ──► active                                                     │
//! │                │──────────── release ────────► released                 │
//! │                │                                                        │
//! │                └──────────── expire_stale ───► expired                  │
//! │                                                                         │
//! │  Stock is deducted at exactly one point: commit. An active hold only   │
//! │  lowers `available`; releasing or expiring it touches no stock.        │
//! │  Every transition is `UPDATE .. WHERE status = 'active'`, so a row     │
//! │  reaches one terminal status once, whoever gets there first.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use bazaar_core::validation::clamp_reservation_ttl;
use bazaar_core::{
    lock_order, CoreError, InventoryReservation, MovementDirection, MovementReason, NewMovement,
    ReservationReference, ReservationStatus, ValidationError,
};
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::repository::listing::StockLedger;
use crate::repository::movement::MovementRepository;
use crate::repository::timestamp;

/// Actor recorded on movements written by reservation transitions.
const ACTOR: &str = "system";

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct ReservationRecord {
    id: i64,
    listing_id: i64,
    variant_id: Option<i64>,
    reference_type: String,
    reference_id: i64,
    quantity: i64,
    status: ReservationStatus,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReservationRecord> for InventoryReservation {
    type Error = DbError;

    fn try_from(r: ReservationRecord) -> DbResult<Self> {
        Ok(InventoryReservation {
            id: r.id,
            listing_id: r.listing_id,
            variant_id: r.variant_id,
            reference: ReservationReference::from_parts(&r.reference_type, r.reference_id)?,
            quantity: r.quantity,
            status: r.status,
            expires_at: r.expires_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
            resolved_at: r.resolved_at,
        })
    }
}

const RESERVATION_COLUMNS: &str = "id, listing_id, variant_id, reference_type, reference_id, \
     quantity, status, expires_at, created_at, updated_at, resolved_at";

/// A hold about to be placed.
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub listing_id: i64,
    pub variant_id: Option<i64>,
    pub reference: ReservationReference,
    pub quantity: i64,
    /// `None` gives the 15 minute default; capped at 24 hours.
    pub ttl: Option<Duration>,
}

impl NewReservation {
    pub fn new(listing_id: i64, reference: ReservationReference, quantity: i64) -> Self {
        NewReservation {
            listing_id,
            variant_id: None,
            reference,
            quantity,
            ttl: None,
        }
    }

    pub fn variant(mut self, variant_id: Option<i64>) -> Self {
        self.variant_id = variant_id;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Whole seconds, rounded up so a sub-second hold does not fall back to
    /// the default.
    fn ttl_secs(&self) -> i64 {
        clamp_reservation_ttl(self.ttl.map(|d| {
            let secs = d.as_secs().saturating_add(u64::from(d.subsec_nanos() > 0));
            secs.min(i64::MAX as u64) as i64
        }))
    }
}

// =============================================================================
// Reservation Manager
// =============================================================================

/// Places, settles and sweeps inventory reservations.
#[derive(Debug, Clone)]
pub struct ReservationManager {
    pool: SqlitePool,
}

impl ReservationManager {
    pub fn new(pool: SqlitePool) -> Self {
        ReservationManager { pool }
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Places a hold in its own transaction.
    pub async fn reserve(&self, new: &NewReservation) -> DbResult<InventoryReservation> {
        let mut tx = self.pool.begin().await?;
        let reservation = Self::create(&mut tx, new).await?;
        tx.commit().await?;
        Ok(reservation)
    }

    /// Places a hold inside the caller's transaction.
    ///
    /// Takes the listing lock (a no-op if the caller already holds it), then
    /// checks availability against on-hand stock minus every active hold.
    ///
    /// ## Errors
    /// - `Validation` for a non-positive quantity
    /// - `NotFound` for a missing or inactive listing
    /// - `StockNotAvailable` when the hold would oversell
    pub async fn create(
        conn: &mut SqliteConnection,
        new: &NewReservation,
    ) -> DbResult<InventoryReservation> {
        if new.quantity <= 0 {
            return Err(ValidationError::MustBePositive {
                field: "quantity".to_string(),
            }
            .into());
        }

        StockLedger::lock(conn, new.listing_id).await?;
        let level = StockLedger::stock_level(conn, new.listing_id).await?;

        if new.quantity > level.available {
            return Err(CoreError::StockNotAvailable {
                listing_id: new.listing_id,
                requested: new.quantity,
                available: level.available,
                total: level.on_hand,
            }
            .into());
        }

        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(new.ttl_secs());
        let sql = format!(
            r#"
            INSERT INTO inventory_reservations (
                listing_id, variant_id, reference_type, reference_id, quantity,
                status, expires_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 'active', ?, ?, ?)
            RETURNING {}
            "#,
            RESERVATION_COLUMNS
        );

        let reservation: InventoryReservation = sqlx::query_as::<_, ReservationRecord>(&sql)
            .bind(new.listing_id)
            .bind(new.variant_id)
            .bind(new.reference.reference_type())
            .bind(new.reference.reference_id())
            .bind(new.quantity)
            .bind(timestamp(expires_at))
            .bind(timestamp(now))
            .bind(timestamp(now))
            .fetch_one(&mut *conn)
            .await?
            .try_into()?;

        debug!(
            reservation_id = reservation.id,
            listing_id = reservation.listing_id,
            quantity = reservation.quantity,
            reference = %reservation.reference,
            expires_at = %reservation.expires_at,
            "Reservation created"
        );
        Ok(reservation)
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Commits one reservation in its own transaction.
    pub async fn commit(&self, reservation_id: i64) -> DbResult<InventoryReservation> {
        let mut tx = self.pool.begin().await?;
        let reservation = Self::commit_in(&mut tx, reservation_id, Utc::now()).await?;
        tx.commit().await?;
        Ok(reservation)
    }

    /// Commits an active, unexpired reservation: status, deduction and the
    /// `out` movement happen in the caller's transaction.
    ///
    /// ## Errors
    /// - `ReservationNotActive` if it already reached a terminal status
    /// - `ReservationExpired` if it is active but past `expires_at`
    /// - `InsufficientStock` if on-hand stock cannot cover it
    pub async fn commit_in(
        conn: &mut SqliteConnection,
        reservation_id: i64,
        now: DateTime<Utc>,
    ) -> DbResult<InventoryReservation> {
        let sql = format!(
            r#"
            UPDATE inventory_reservations
            SET status = 'committed', updated_at = ?1, resolved_at = ?1
            WHERE id = ?2 AND status = 'active' AND expires_at > ?1
            RETURNING {}
            "#,
            RESERVATION_COLUMNS
        );

        let record = sqlx::query_as::<_, ReservationRecord>(&sql)
            .bind(timestamp(now))
            .bind(reservation_id)
            .fetch_optional(&mut *conn)
            .await?;

        let reservation: InventoryReservation = match record {
            Some(record) => record.try_into()?,
            None => return Err(Self::explain_refusal(conn, reservation_id, "commit").await),
        };

        StockLedger::deduct(conn, reservation.listing_id, reservation.quantity).await?;
        MovementRepository::append(
            conn,
            &NewMovement {
                listing_id: reservation.listing_id,
                variant_id: reservation.variant_id,
                direction: MovementDirection::Out,
                quantity: reservation.quantity,
                reason: MovementReason::OrderCommitted,
                reference: Some(reservation.reference),
                notes: None,
                actor: ACTOR.to_string(),
            },
        )
        .await?;

        info!(
            reservation_id,
            listing_id = reservation.listing_id,
            quantity = reservation.quantity,
            "Reservation committed"
        );
        Ok(reservation)
    }

    /// Commits every active reservation filed under `reference`.
    ///
    /// Listings are locked in ascending id order before any deduction.
    pub async fn commit_by_reference(
        conn: &mut SqliteConnection,
        reference: ReservationReference,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<InventoryReservation>> {
        let mut active: Vec<InventoryReservation> = Self::list_by_reference_in(conn, reference)
            .await?
            .into_iter()
            .filter(|r| r.status == ReservationStatus::Active)
            .collect();
        active.sort_by_key(|r| (r.listing_id, r.id));

        for listing_id in lock_order(active.iter().map(|r| r.listing_id)) {
            StockLedger::lock_any(conn, listing_id).await?;
        }

        let mut committed = Vec::with_capacity(active.len());
        for reservation in active {
            committed.push(Self::commit_in(conn, reservation.id, now).await?);
        }
        Ok(committed)
    }

    // =========================================================================
    // Release
    // =========================================================================

    /// Releases one reservation in its own transaction.
    pub async fn release(&self, reservation_id: i64) -> DbResult<InventoryReservation> {
        let mut tx = self.pool.begin().await?;
        let reservation = Self::release_in(&mut tx, reservation_id, Utc::now()).await?;
        tx.commit().await?;
        Ok(reservation)
    }

    /// Withdraws an active hold. No stock is touched: a hold was never
    /// deducted, so availability recovers as soon as it stops counting.
    pub async fn release_in(
        conn: &mut SqliteConnection,
        reservation_id: i64,
        now: DateTime<Utc>,
    ) -> DbResult<InventoryReservation> {
        let sql = format!(
            r#"
            UPDATE inventory_reservations
            SET status = 'released', updated_at = ?1, resolved_at = ?1
            WHERE id = ?2 AND status = 'active'
            RETURNING {}
            "#,
            RESERVATION_COLUMNS
        );

        let record = sqlx::query_as::<_, ReservationRecord>(&sql)
            .bind(timestamp(now))
            .bind(reservation_id)
            .fetch_optional(&mut *conn)
            .await?;

        match record {
            Some(record) => {
                debug!(reservation_id, "Reservation released");
                record.try_into()
            }
            None => Err(Self::explain_refusal(conn, reservation_id, "release").await),
        }
    }

    /// Releases every active reservation filed under `reference`.
    ///
    /// Returns the number of reservations released.
    pub async fn release_by_reference(
        conn: &mut SqliteConnection,
        reference: ReservationReference,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE inventory_reservations
            SET status = 'released', updated_at = ?1, resolved_at = ?1
            WHERE reference_type = ?2 AND reference_id = ?3 AND status = 'active'
            "#,
        )
        .bind(timestamp(now))
        .bind(reference.reference_type())
        .bind(reference.reference_id())
        .execute(&mut *conn)
        .await?;

        let released = result.rows_affected();
        debug!(reference = %reference, released, "Reservations released");
        Ok(released)
    }

    // =========================================================================
    // Restock
    // =========================================================================

    /// Returns the stock of every committed reservation under `reference` and
    /// appends an `in` movement for each.
    ///
    /// The reservations keep their terminal `committed` status, so this must
    /// run once per cancellation; the order's own conditional status update
    /// is what guarantees that.
    pub async fn restock_committed_by_reference(
        conn: &mut SqliteConnection,
        reference: ReservationReference,
        actor: &str,
    ) -> DbResult<Vec<InventoryReservation>> {
        let mut committed: Vec<InventoryReservation> = Self::list_by_reference_in(conn, reference)
            .await?
            .into_iter()
            .filter(|r| r.status == ReservationStatus::Committed)
            .collect();
        committed.sort_by_key(|r| (r.listing_id, r.id));

        for listing_id in lock_order(committed.iter().map(|r| r.listing_id)) {
            StockLedger::lock_any(conn, listing_id).await?;
        }

        for reservation in &committed {
            StockLedger::restore(conn, reservation.listing_id, reservation.quantity).await?;
            MovementRepository::append(
                conn,
                &NewMovement {
                    listing_id: reservation.listing_id,
                    variant_id: reservation.variant_id,
                    direction: MovementDirection::In,
                    quantity: reservation.quantity,
                    reason: MovementReason::OrderCancelled,
                    reference: Some(reference),
                    notes: None,
                    actor: actor.to_string(),
                },
            )
            .await?;
        }

        if !committed.is_empty() {
            info!(reference = %reference, restocked = committed.len(), "Committed stock returned");
        }
        Ok(committed)
    }

    // =========================================================================
    // Expiry
    // =========================================================================

    /// Moves up to `batch_limit` lapsed active holds to `expired`.
    ///
    /// One conditional statement; a row already settled by a concurrent
    /// sweep, commit or release is skipped and not counted. Returns the number
    /// of reservations this call expired.
    pub async fn expire_stale(&self, now: DateTime<Utc>, batch_limit: u32) -> DbResult<u64> {
        let now_text = timestamp(now);
        let expired: Vec<(i64, i64, i64)> = sqlx::query_as(
            r#"
            UPDATE inventory_reservations
            SET status = 'expired', updated_at = ?1, resolved_at = ?1
            WHERE status = 'active'
              AND id IN (
                  SELECT id FROM inventory_reservations
                  WHERE status = 'active' AND expires_at <= ?1
                  ORDER BY expires_at
                  LIMIT ?2
              )
            RETURNING id, listing_id, quantity
            "#,
        )
        .bind(&now_text)
        .bind(batch_limit as i64)
        .fetch_all(&self.pool)
        .await?;

        for (reservation_id, listing_id, quantity) in &expired {
            debug!(reservation_id, listing_id, quantity, "Reservation expired");
        }

        Ok(expired.len() as u64)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get(&self, reservation_id: i64) -> DbResult<Option<InventoryReservation>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_in(&mut conn, reservation_id).await
    }

    pub async fn get_in(
        conn: &mut SqliteConnection,
        reservation_id: i64,
    ) -> DbResult<Option<InventoryReservation>> {
        let sql = format!(
            "SELECT {} FROM inventory_reservations WHERE id = ?",
            RESERVATION_COLUMNS
        );
        sqlx::query_as::<_, ReservationRecord>(&sql)
            .bind(reservation_id)
            .fetch_optional(&mut *conn)
            .await?
            .map(InventoryReservation::try_from)
            .transpose()
    }

    /// Every reservation filed under `reference`, oldest first.
    pub async fn list_by_reference(
        &self,
        reference: ReservationReference,
    ) -> DbResult<Vec<InventoryReservation>> {
        let mut conn = self.pool.acquire().await?;
        Self::list_by_reference_in(&mut conn, reference).await
    }

    pub async fn list_by_reference_in(
        conn: &mut SqliteConnection,
        reference: ReservationReference,
    ) -> DbResult<Vec<InventoryReservation>> {
        let sql = format!(
            "SELECT {} FROM inventory_reservations \
             WHERE reference_type = ? AND reference_id = ? ORDER BY id",
            RESERVATION_COLUMNS
        );
        sqlx::query_as::<_, ReservationRecord>(&sql)
            .bind(reference.reference_type())
            .bind(reference.reference_id())
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .map(InventoryReservation::try_from)
            .collect()
    }

    /// Builds the error for a transition whose conditional update matched no
    /// row.
    async fn explain_refusal(
        conn: &mut SqliteConnection,
        reservation_id: i64,
        action: &'static str,
    ) -> DbError {
        match Self::get_in(conn, reservation_id).await {
            Err(err) => err,
            Ok(None) => DbError::not_found("Reservation", reservation_id),
            Ok(Some(r)) if r.status == ReservationStatus::Active => CoreError::ReservationExpired {
                reservation_id,
                expired_at: r.expires_at,
            }
            .into(),
            Ok(Some(r)) => CoreError::ReservationNotActive {
                reservation_id,
                action,
                status: r.status,
            }
            .into(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::testing;
    use bazaar_core::{ErrorKind, DEFAULT_RESERVATION_TTL_SECS};

    fn hold(listing_id: i64, order_id: i64, quantity: i64) -> NewReservation {
        NewReservation::new(listing_id, ReservationReference::Order(order_id), quantity)
    }

    #[tokio::test]
    async fn test_create_holds_availability_not_stock() {
        let db = testing::database().await;
        let listing_id = testing::listing(&db, "SOCK", 500, 5).await;

        let reservation = db.reservations().reserve(&hold(listing_id, 1, 3)).await.unwrap();
        assert_eq!(reservation.status, ReservationStatus::Active);
        assert!(reservation.expires_at > reservation.created_at);

        let level = db.listings().stock_level(listing_id).await.unwrap();
        assert_eq!(level.on_hand, 5);
        assert_eq!(level.reserved, 3);
        assert_eq!(level.available, 2);
    }

    #[tokio::test]
    async fn test_create_rejects_oversell() {
        let db = testing::database().await;
        let listing_id = testing::listing(&db, "SOCK", 500, 5).await;
        db.reservations().reserve(&hold(listing_id, 1, 4)).await.unwrap();

        let err = db.reservations().reserve(&hold(listing_id, 2, 2)).await.unwrap_err();
        match err {
            DbError::Core(CoreError::StockNotAvailable {
                requested,
                available,
                total,
                ..
            }) => {
                assert_eq!((requested, available, total), (2, 1, 5));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_rejects_zero_quantity() {
        let db = testing::database().await;
        let listing_id = testing::listing(&db, "SOCK", 500, 5).await;
        let err = db.reservations().reserve(&hold(listing_id, 1, 0)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_ttl_is_capped() {
        let db = testing::database().await;
        let listing_id = testing::listing(&db, "SOCK", 500, 5).await;
        let reservation = db
            .reservations()
            .reserve(&hold(listing_id, 1, 1).ttl(Duration::from_secs(7 * 86_400)))
            .await
            .unwrap();
        let window = reservation.expires_at - reservation.created_at;
        assert_eq!(window.num_seconds(), 86_400);
    }

    #[tokio::test]
    async fn test_sub_second_ttl_rounds_up() {
        let db = testing::database().await;
        let listing_id = testing::listing(&db, "SOCK", 500, 5).await;
        let reservation = db
            .reservations()
            .reserve(&hold(listing_id, 1, 1).ttl(Duration::from_millis(500)))
            .await
            .unwrap();
        let window = reservation.expires_at - reservation.created_at;
        assert_eq!(window.num_seconds(), 1);

        let odd = hold(listing_id, 2, 1).ttl(Duration::from_millis(1_500));
        assert_eq!(odd.ttl_secs(), 2);
        assert_eq!(hold(listing_id, 3, 1).ttl(Duration::from_secs(4)).ttl_secs(), 4);
        assert_eq!(hold(listing_id, 4, 1).ttl_secs(), DEFAULT_RESERVATION_TTL_SECS);
    }

    #[tokio::test]
    async fn test_commit_deducts_exactly_once() {
        let db = testing::database().await;
        let listing_id = testing::listing(&db, "SOCK", 500, 5).await;
        let reservation = db.reservations().reserve(&hold(listing_id, 9, 2)).await.unwrap();

        let committed = db.reservations().commit(reservation.id).await.unwrap();
        assert_eq!(committed.status, ReservationStatus::Committed);
        assert!(committed.resolved_at.is_some());

        let err = db.reservations().commit(reservation.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(
            err.to_string(),
            format!(
                "Cannot commit reservation {}, current status=committed",
                reservation.id
            )
        );

        let level = db.listings().stock_level(listing_id).await.unwrap();
        assert_eq!(level.on_hand, 3);
        assert_eq!(level.available, 3);

        let movements = db.movements().list_for_listing(listing_id).await.unwrap();
        assert_eq!(movements.len(), 1);
        assert_eq!(movements[0].direction, MovementDirection::Out);
        assert_eq!(movements[0].quantity, 2);
    }

    #[tokio::test]
    async fn test_commit_after_expiry_is_refused() {
        let db = testing::database().await;
        let listing_id = testing::listing(&db, "SOCK", 500, 5).await;
        let reservation = db
            .reservations()
            .reserve(&hold(listing_id, 9, 2).ttl(Duration::from_secs(60)))
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::minutes(5);
        let mut tx = db.pool().begin().await.unwrap();
        let err = ReservationManager::commit_in(&mut tx, reservation.id, later)
            .await
            .unwrap_err();
        drop(tx);

        assert!(matches!(err, DbError::Core(CoreError::ReservationExpired { .. })));
        assert_eq!(err.kind(), ErrorKind::Expired);
        assert_eq!(db.listings().stock_level(listing_id).await.unwrap().on_hand, 5);
    }

    #[tokio::test]
    async fn test_release_frees_hold_without_touching_stock() {
        let db = testing::database().await;
        let listing_id = testing::listing(&db, "SOCK", 500, 5).await;
        let reservation = db.reservations().reserve(&hold(listing_id, 3, 5)).await.unwrap();

        let released = db.reservations().release(reservation.id).await.unwrap();
        assert_eq!(released.status, ReservationStatus::Released);

        let err = db.reservations().release(reservation.id).await.unwrap_err();
        assert!(matches!(
            err,
            DbError::Core(CoreError::ReservationNotActive { action: "release", .. })
        ));

        let level = db.listings().stock_level(listing_id).await.unwrap();
        assert_eq!((level.on_hand, level.available), (5, 5));
        assert!(db.movements().list_for_listing(listing_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_reservation() {
        let db = testing::database().await;
        let err = db.reservations().commit(404).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_expire_stale_counts_only_transitions() {
        let db = testing::database().await;
        let listing_id = testing::listing(&db, "SOCK", 500, 5).await;
        let short = db
            .reservations()
            .reserve(&hold(listing_id, 1, 3).ttl(Duration::from_secs(1)))
            .await
            .unwrap();
        let long = db.reservations().reserve(&hold(listing_id, 2, 1)).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(db.reservations().expire_stale(later, 100).await.unwrap(), 1);
        assert_eq!(db.reservations().expire_stale(later, 100).await.unwrap(), 0);

        let short = db.reservations().get(short.id).await.unwrap().unwrap();
        let long = db.reservations().get(long.id).await.unwrap().unwrap();
        assert_eq!(short.status, ReservationStatus::Expired);
        assert_eq!(long.status, ReservationStatus::Active);

        let level = db.listings().stock_level(listing_id).await.unwrap();
        assert_eq!((level.on_hand, level.available), (5, 4));
    }

    #[tokio::test]
    async fn test_expire_stale_respects_batch_limit() {
        let db = testing::database().await;
        let listing_id = testing::listing(&db, "SOCK", 500, 10).await;
        for order_id in 0..5 {
            db.reservations()
                .reserve(&hold(listing_id, order_id, 1).ttl(Duration::from_secs(1)))
                .await
                .unwrap();
        }

        let later = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(db.reservations().expire_stale(later, 2).await.unwrap(), 2);
        assert_eq!(db.reservations().expire_stale(later, 2).await.unwrap(), 2);
        assert_eq!(db.reservations().expire_stale(later, 2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_by_reference_operations() {
        let db = testing::database().await;
        let a = testing::listing(&db, "A", 500, 5).await;
        let b = testing::listing(&db, "B", 500, 5).await;
        let order = ReservationReference::Order(42);

        db.reservations().reserve(&NewReservation::new(b, order, 2)).await.unwrap();
        db.reservations().reserve(&NewReservation::new(a, order, 1)).await.unwrap();
        db.reservations().reserve(&hold(a, 43, 1)).await.unwrap();

        let mut tx = db.pool().begin().await.unwrap();
        let committed = ReservationManager::commit_by_reference(&mut tx, order, Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let listings: Vec<i64> = committed.iter().map(|r| r.listing_id).collect();
        assert_eq!(listings, vec![a, b]);
        assert_eq!(db.listings().stock_level(a).await.unwrap().on_hand, 4);
        assert_eq!(db.listings().stock_level(b).await.unwrap().on_hand, 3);

        let mut tx = db.pool().begin().await.unwrap();
        let restocked = ReservationManager::restock_committed_by_reference(&mut tx, order, "buyer")
            .await
            .unwrap();
        let released = ReservationManager::release_by_reference(
            &mut tx,
            ReservationReference::Order(43),
            Utc::now(),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(restocked.len(), 2);
        assert_eq!(released, 1);
        let level_a = db.listings().stock_level(a).await.unwrap();
        assert_eq!((level_a.on_hand, level_a.available), (5, 5));
        assert_eq!(db.listings().stock_level(b).await.unwrap().on_hand, 5);

        let statuses: Vec<ReservationStatus> = db
            .reservations()
            .list_by_reference(order)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.status)
            .collect();
        assert_eq!(statuses, vec![ReservationStatus::Committed; 2]);

        let trail = db.movements().list_by_reference(order).await.unwrap();
        assert_eq!(trail.len(), 4);
        assert_eq!(
            trail.iter().filter(|m| m.direction == MovementDirection::In).count(),
            2
        );
    }
}
