//! # Inventory Movement Repository
//!
//! Append-only audit trail of physical stock changes. Rows are only ever
//! inserted; triggers in the schema reject updates and deletes.

use bazaar_core::{
    InventoryMovement, MovementDirection, MovementReason, NewMovement, ReservationReference,
};
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::DbResult;
use crate::repository::timestamp;

#[derive(Debug, sqlx::FromRow)]
struct MovementRecord {
    id: i64,
    listing_id: i64,
    variant_id: Option<i64>,
    direction: MovementDirection,
    quantity: i64,
    reason: MovementReason,
    reference_type: Option<String>,
    reference_id: Option<i64>,
    notes: Option<String>,
    actor: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<MovementRecord> for InventoryMovement {
    type Error = crate::error::DbError;

    fn try_from(r: MovementRecord) -> DbResult<Self> {
        let reference = match (r.reference_type.as_deref(), r.reference_id) {
            (Some(kind), Some(id)) => Some(ReservationReference::from_parts(kind, id)?),
            _ => None,
        };
        Ok(InventoryMovement {
            id: r.id,
            listing_id: r.listing_id,
            variant_id: r.variant_id,
            direction: r.direction,
            quantity: r.quantity,
            reason: r.reason,
            reference,
            notes: r.notes,
            actor: r.actor,
            created_at: r.created_at,
        })
    }
}

const MOVEMENT_COLUMNS: &str = "id, listing_id, variant_id, direction, quantity, reason, \
     reference_type, reference_id, notes, actor, created_at";

/// Repository for the inventory audit trail.
#[derive(Debug, Clone)]
pub struct MovementRepository {
    pool: SqlitePool,
}

impl MovementRepository {
    pub fn new(pool: SqlitePool) -> Self {
        MovementRepository { pool }
    }

    /// Appends a movement inside the caller's transaction.
    pub async fn append(conn: &mut SqliteConnection, movement: &NewMovement) -> DbResult<i64> {
        let (reference_type, reference_id) = match movement.reference {
            Some(reference) => (Some(reference.reference_type()), Some(reference.reference_id())),
            None => (None, None),
        };

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO inventory_movements (
                listing_id, variant_id, direction, quantity, reason,
                reference_type, reference_id, notes, actor, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(movement.listing_id)
        .bind(movement.variant_id)
        .bind(movement.direction)
        .bind(movement.quantity)
        .bind(movement.reason)
        .bind(reference_type)
        .bind(reference_id)
        .bind(&movement.notes)
        .bind(&movement.actor)
        .bind(timestamp(Utc::now()))
        .fetch_one(&mut *conn)
        .await?;

        debug!(
            movement_id = id,
            listing_id = movement.listing_id,
            direction = ?movement.direction,
            quantity = movement.quantity,
            "Inventory movement recorded"
        );
        Ok(id)
    }

    /// All movements of a listing, oldest first.
    pub async fn list_for_listing(&self, listing_id: i64) -> DbResult<Vec<InventoryMovement>> {
        let sql = format!(
            "SELECT {} FROM inventory_movements WHERE listing_id = ? ORDER BY id",
            MOVEMENT_COLUMNS
        );
        sqlx::query_as::<_, MovementRecord>(&sql)
            .bind(listing_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(InventoryMovement::try_from)
            .collect()
    }

    /// All movements filed under an order (or cart), oldest first.
    pub async fn list_by_reference(
        &self,
        reference: ReservationReference,
    ) -> DbResult<Vec<InventoryMovement>> {
        let sql = format!(
            "SELECT {} FROM inventory_movements \
             WHERE reference_type = ? AND reference_id = ? ORDER BY id",
            MOVEMENT_COLUMNS
        );
        sqlx::query_as::<_, MovementRecord>(&sql)
            .bind(reference.reference_type())
            .bind(reference.reference_id())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(InventoryMovement::try_from)
            .collect()
    }
}
