//! # Order Repository
//!
//! Database operations for orders and order items.
//!
//! ## Order Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Order Lifecycle                                   │
//! │                                                                         │
//! │  1. CREATE (one checkout transaction)                                  │
//! │     └── next_order_number() → ORD-2026-000042                          │
//! │     └── insert()            → Order { status: pending }                │
//! │     └── insert_items()      → immutable OrderItem snapshots            │
//! │                                                                         │
//! │  2. PAYMENT WEBHOOK                                                    │
//! │     └── mark_paid()  pending/pending → confirmed/completed             │
//! │                                                                         │
//! │  3. FULFILMENT                                                         │
//! │     └── transition() confirmed → shipped → delivered                   │
//! │                                                                         │
//! │  4. (OPTIONAL) CANCEL                                                  │
//! │     └── mark_cancelled() pending | confirmed → cancelled               │
//! │                                                                         │
//! │  5. (OPTIONAL) REFUND                                                  │
//! │     └── claim_refund()   completed, unclaimed → claimed by key         │
//! │     └── settle_refund()  claimed → refunded | partially_refunded       │
//! │                                                                         │
//! │  Every status write is conditional on the status the caller read, so   │
//! │  a lost race returns `false` instead of overwriting.                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use bazaar_core::finance::OrderFinancials;
use bazaar_core::{
    Address, Document, NewOrderItem, Order, OrderItem, OrderStatus, PaymentStatus,
};
use chrono::{DateTime, Datelike, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::repository::timestamp;

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct OrderRecord {
    id: i64,
    order_number: String,
    buyer_id: Option<i64>,
    storefront_id: i64,
    status: OrderStatus,
    payment_status: PaymentStatus,
    subtotal_cents: i64,
    tax_cents: i64,
    shipping_cents: i64,
    discount_cents: i64,
    total_cents: i64,
    commission_cents: i64,
    seller_amount_cents: i64,
    currency: String,
    shipping_address: String,
    billing_address: String,
    escrow_days: i64,
    escrow_release_date: Option<DateTime<Utc>>,
    customer_notes: Option<String>,
    payment_reference: Option<String>,
    payment_details: Option<String>,
    cancellation_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    confirmed_at: Option<DateTime<Utc>>,
    shipped_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl TryFrom<OrderRecord> for Order {
    type Error = DbError;

    fn try_from(r: OrderRecord) -> DbResult<Self> {
        let shipping_address: Address = serde_json::from_str(&r.shipping_address)
            .map_err(|e| DbError::serialization("orders.shipping_address", e))?;
        let billing_address: Address = serde_json::from_str(&r.billing_address)
            .map_err(|e| DbError::serialization("orders.billing_address", e))?;
        let payment_details = r
            .payment_details
            .as_deref()
            .map(Document::from_json)
            .transpose()
            .map_err(|e| DbError::serialization("orders.payment_details", e))?;

        Ok(Order {
            id: r.id,
            order_number: r.order_number,
            buyer_id: r.buyer_id,
            storefront_id: r.storefront_id,
            status: r.status,
            payment_status: r.payment_status,
            subtotal_cents: r.subtotal_cents,
            tax_cents: r.tax_cents,
            shipping_cents: r.shipping_cents,
            discount_cents: r.discount_cents,
            total_cents: r.total_cents,
            commission_cents: r.commission_cents,
            seller_amount_cents: r.seller_amount_cents,
            currency: r.currency,
            shipping_address,
            billing_address,
            escrow_days: r.escrow_days,
            escrow_release_date: r.escrow_release_date,
            customer_notes: r.customer_notes,
            payment_reference: r.payment_reference,
            payment_details,
            cancellation_reason: r.cancellation_reason,
            created_at: r.created_at,
            updated_at: r.updated_at,
            confirmed_at: r.confirmed_at,
            shipped_at: r.shipped_at,
            delivered_at: r.delivered_at,
            cancelled_at: r.cancelled_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderItemRecord {
    id: i64,
    order_id: i64,
    listing_id: i64,
    variant_id: Option<i64>,
    quantity: i64,
    unit_price_cents: i64,
    subtotal_cents: i64,
    discount_cents: i64,
    total_cents: i64,
    name_snapshot: String,
    sku_snapshot: String,
    attributes_snapshot: String,
    image_snapshot: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<OrderItemRecord> for OrderItem {
    type Error = DbError;

    fn try_from(r: OrderItemRecord) -> DbResult<Self> {
        let attributes_snapshot = Document::from_json(&r.attributes_snapshot)
            .map_err(|e| DbError::serialization("order_items.attributes_snapshot", e))?;
        Ok(OrderItem {
            id: r.id,
            order_id: r.order_id,
            listing_id: r.listing_id,
            variant_id: r.variant_id,
            quantity: r.quantity,
            unit_price_cents: r.unit_price_cents,
            subtotal_cents: r.subtotal_cents,
            discount_cents: r.discount_cents,
            total_cents: r.total_cents,
            name_snapshot: r.name_snapshot,
            sku_snapshot: r.sku_snapshot,
            attributes_snapshot,
            image_snapshot: r.image_snapshot,
            created_at: r.created_at,
        })
    }
}

const ORDER_COLUMNS: &str = "id, order_number, buyer_id, storefront_id, status, payment_status, \
     subtotal_cents, tax_cents, shipping_cents, discount_cents, total_cents, commission_cents, \
     seller_amount_cents, currency, shipping_address, billing_address, escrow_days, \
     escrow_release_date, customer_notes, payment_reference, payment_details, \
     cancellation_reason, created_at, updated_at, confirmed_at, shipped_at, delivered_at, \
     cancelled_at";

const ITEM_COLUMNS: &str = "id, order_id, listing_id, variant_id, quantity, unit_price_cents, \
     subtotal_cents, discount_cents, total_cents, name_snapshot, sku_snapshot, \
     attributes_snapshot, image_snapshot, created_at";

/// An order about to be persisted.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_number: String,
    pub buyer_id: Option<i64>,
    pub storefront_id: i64,
    pub financials: OrderFinancials,
    pub shipping_address: Address,
    pub billing_address: Address,
    pub customer_notes: Option<String>,
}

fn address_json(column: &str, address: &Address) -> DbResult<String> {
    serde_json::to_string(address).map_err(|e| DbError::serialization(column, e))
}

/// Formats the human-readable order number.
pub fn format_order_number(year: i32, sequence: i64) -> String {
    format!("ORD-{}-{:06}", year, sequence)
}

// =============================================================================
// Order Repository
// =============================================================================

/// Repository for order database operations.
#[derive(Debug, Clone)]
pub struct OrderRepository {
    pool: SqlitePool,
}

impl OrderRepository {
    /// Creates a new OrderRepository.
    pub fn new(pool: SqlitePool) -> Self {
        OrderRepository { pool }
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Allocates the next order number for the year of `now`.
    ///
    /// The sequence row is bumped with a single upsert, so two checkouts can
    /// never draw the same number.
    pub async fn next_order_number(
        conn: &mut SqliteConnection,
        now: DateTime<Utc>,
    ) -> DbResult<String> {
        let year = now.year();
        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO order_sequences (year, last_value) VALUES (?, 1)
            ON CONFLICT (year) DO UPDATE SET last_value = last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(year)
        .fetch_one(&mut *conn)
        .await?;

        Ok(format_order_number(year, sequence))
    }

    /// Inserts a pending order.
    pub async fn insert(
        conn: &mut SqliteConnection,
        order: &NewOrder,
        now: DateTime<Utc>,
    ) -> DbResult<Order> {
        debug!(order_number = %order.order_number, "Inserting order");

        let f = &order.financials;
        let now_text = timestamp(now);
        let sql = format!(
            r#"
            INSERT INTO orders (
                order_number, buyer_id, storefront_id, status, payment_status,
                subtotal_cents, tax_cents, shipping_cents, discount_cents, total_cents,
                commission_cents, seller_amount_cents, currency,
                shipping_address, billing_address, escrow_days, customer_notes,
                created_at, updated_at
            ) VALUES (
                ?, ?, ?, 'pending', 'pending',
                ?, ?, ?, ?, ?,
                ?, ?, ?,
                ?, ?, ?, ?,
                ?, ?
            )
            RETURNING {}
            "#,
            ORDER_COLUMNS
        );

        sqlx::query_as::<_, OrderRecord>(&sql)
            .bind(&order.order_number)
            .bind(order.buyer_id)
            .bind(order.storefront_id)
            .bind(f.subtotal.cents())
            .bind(f.tax.cents())
            .bind(f.shipping.cents())
            .bind(f.discount.cents())
            .bind(f.total.cents())
            .bind(f.commission.cents())
            .bind(f.seller_amount.cents())
            .bind(&f.currency)
            .bind(address_json("orders.shipping_address", &order.shipping_address)?)
            .bind(address_json("orders.billing_address", &order.billing_address)?)
            .bind(f.escrow_days)
            .bind(&order.customer_notes)
            .bind(&now_text)
            .bind(&now_text)
            .fetch_one(&mut *conn)
            .await?
            .try_into()
    }

    /// Inserts the item snapshots of an order.
    pub async fn insert_items(
        conn: &mut SqliteConnection,
        order_id: i64,
        items: &[NewOrderItem],
        now: DateTime<Utc>,
    ) -> DbResult<Vec<OrderItem>> {
        let sql = format!(
            r#"
            INSERT INTO order_items (
                order_id, listing_id, variant_id, quantity, unit_price_cents,
                subtotal_cents, discount_cents, total_cents,
                name_snapshot, sku_snapshot, attributes_snapshot, image_snapshot, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {}
            "#,
            ITEM_COLUMNS
        );
        let now_text = timestamp(now);

        let mut inserted = Vec::with_capacity(items.len());
        for item in items {
            let attributes = item
                .attributes_snapshot
                .to_json()
                .map_err(|e| DbError::serialization("order_items.attributes_snapshot", e))?;

            let record = sqlx::query_as::<_, OrderItemRecord>(&sql)
                .bind(order_id)
                .bind(item.listing_id)
                .bind(item.variant_id)
                .bind(item.quantity)
                .bind(item.unit_price.cents())
                .bind(item.subtotal.cents())
                .bind(item.discount.cents())
                .bind(item.total.cents())
                .bind(&item.name_snapshot)
                .bind(&item.sku_snapshot)
                .bind(attributes)
                .bind(&item.image_snapshot)
                .bind(&now_text)
                .fetch_one(&mut *conn)
                .await?;
            inserted.push(OrderItem::try_from(record)?);
        }

        debug!(order_id, count = inserted.len(), "Order items inserted");
        Ok(inserted)
    }

    // =========================================================================
    // Status Writes
    // =========================================================================

    /// Records payment: `pending/pending → confirmed/completed`.
    ///
    /// Returns `false` if the order was no longer pending.
    pub async fn mark_paid(
        conn: &mut SqliteConnection,
        order_id: i64,
        payment_reference: &str,
        payment_details: &Document,
        escrow_release_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let details = payment_details
            .to_json()
            .map_err(|e| DbError::serialization("orders.payment_details", e))?;

        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'confirmed',
                payment_status = 'completed',
                payment_reference = ?1,
                payment_details = ?2,
                escrow_release_date = ?3,
                confirmed_at = ?4,
                updated_at = ?4
            WHERE id = ?5 AND status = 'pending' AND payment_status = 'pending'
            "#,
        )
        .bind(payment_reference)
        .bind(details)
        .bind(timestamp(escrow_release_date))
        .bind(timestamp(now))
        .bind(order_id)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Cancels an order that is still in `expected` status.
    pub async fn mark_cancelled(
        conn: &mut SqliteConnection,
        order_id: i64,
        expected: OrderStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'cancelled',
                cancellation_reason = ?1,
                cancelled_at = ?2,
                updated_at = ?2
            WHERE id = ?3 AND status = ?4
            "#,
        )
        .bind(reason)
        .bind(timestamp(now))
        .bind(order_id)
        .bind(expected)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Moves an order from `from` to `to` and stamps the matching lifecycle
    /// column. Callers check the state machine first; cancellation goes
    /// through [`OrderRepository::mark_cancelled`].
    pub async fn transition(
        conn: &mut SqliteConnection,
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let stamp = match to {
            OrderStatus::Confirmed => ", confirmed_at = ?1",
            OrderStatus::Shipped => ", shipped_at = ?1",
            OrderStatus::Delivered => ", delivered_at = ?1",
            OrderStatus::Cancelled => ", cancelled_at = ?1",
            OrderStatus::Pending => "",
        };
        let sql = format!(
            "UPDATE orders SET status = ?2, updated_at = ?1{} WHERE id = ?3 AND status = ?4",
            stamp
        );

        let result = sqlx::query(&sql)
            .bind(timestamp(now))
            .bind(to)
            .bind(order_id)
            .bind(from)
            .execute(&mut *conn)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Refund Claims
    // =========================================================================

    /// Claims a completed payment for refund under `key`.
    ///
    /// Fails while another key holds the claim. A claim under the same key
    /// can be retaken once it was placed at or before `stale_before`, which
    /// lets a caller resume a refund whose settlement never landed.
    pub async fn claim_refund(
        conn: &mut SqliteConnection,
        order_id: i64,
        key: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET refund_key = ?1,
                refund_claimed_at = ?2,
                updated_at = ?2
            WHERE id = ?3
              AND payment_status = 'completed'
              AND (refund_key IS NULL OR (refund_key = ?1 AND refund_claimed_at <= ?4))
            "#,
        )
        .bind(key)
        .bind(timestamp(now))
        .bind(order_id)
        .bind(timestamp(stale_before))
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Drops an unsettled claim so the refund can be attempted again.
    pub async fn release_refund_claim(
        conn: &mut SqliteConnection,
        order_id: i64,
        key: &str,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET refund_key = NULL,
                refund_claimed_at = NULL,
                updated_at = ?1
            WHERE id = ?2 AND refund_key = ?3 AND payment_status = 'completed'
            "#,
        )
        .bind(timestamp(now))
        .bind(order_id)
        .bind(key)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Moves a claimed payment from `completed` to `outcome`.
    pub async fn settle_refund(
        conn: &mut SqliteConnection,
        order_id: i64,
        key: &str,
        outcome: PaymentStatus,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET payment_status = ?1,
                updated_at = ?2
            WHERE id = ?3 AND refund_key = ?4 AND payment_status = 'completed'
            "#,
        )
        .bind(outcome)
        .bind(timestamp(now))
        .bind(order_id)
        .bind(key)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Gets an order by ID.
    pub async fn get(&self, order_id: i64) -> DbResult<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_in(&mut conn, order_id).await
    }

    pub async fn get_in(conn: &mut SqliteConnection, order_id: i64) -> DbResult<Option<Order>> {
        let sql = format!("SELECT {} FROM orders WHERE id = ?", ORDER_COLUMNS);
        sqlx::query_as::<_, OrderRecord>(&sql)
            .bind(order_id)
            .fetch_optional(&mut *conn)
            .await?
            .map(Order::try_from)
            .transpose()
    }

    pub async fn get_by_number(&self, order_number: &str) -> DbResult<Option<Order>> {
        let sql = format!("SELECT {} FROM orders WHERE order_number = ?", ORDER_COLUMNS);
        sqlx::query_as::<_, OrderRecord>(&sql)
            .bind(order_number)
            .fetch_optional(&self.pool)
            .await?
            .map(Order::try_from)
            .transpose()
    }

    /// A buyer's orders, newest first.
    pub async fn list_for_buyer(&self, buyer_id: i64, limit: u32) -> DbResult<Vec<Order>> {
        let sql = format!(
            "SELECT {} FROM orders WHERE buyer_id = ? ORDER BY id DESC LIMIT ?",
            ORDER_COLUMNS
        );
        sqlx::query_as::<_, OrderRecord>(&sql)
            .bind(buyer_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Order::try_from)
            .collect()
    }

    /// Items of an order in insertion order.
    pub async fn items(&self, order_id: i64) -> DbResult<Vec<OrderItem>> {
        let mut conn = self.pool.acquire().await?;
        Self::items_in(&mut conn, order_id).await
    }

    pub async fn items_in(conn: &mut SqliteConnection, order_id: i64) -> DbResult<Vec<OrderItem>> {
        let sql = format!(
            "SELECT {} FROM order_items WHERE order_id = ? ORDER BY id",
            ITEM_COLUMNS
        );
        sqlx::query_as::<_, OrderItemRecord>(&sql)
            .bind(order_id)
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .map(OrderItem::try_from)
            .collect()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::testing;
    use bazaar_core::finance::{item_financials, order_financials, FinancialConfig};
    use bazaar_core::{Money, Rate};
    use chrono::TimeZone;

    fn address() -> Address {
        Address {
            recipient: "Lin Park".to_string(),
            line1: "8 Quay Rd".to_string(),
            city: "Busan".to_string(),
            postal_code: "48943".to_string(),
            country: "KR".to_string(),
            ..Default::default()
        }
    }

    fn new_order(order_number: String, listing_id: i64) -> (NewOrder, Vec<NewOrderItem>) {
        let config = FinancialConfig::new(Rate::from_bps(2000), Rate::from_bps(1000), "USD");
        let line = item_financials(2, Money::from_cents(1000), Rate::zero());
        let financials =
            order_financials(&[line], Money::from_cents(500), Money::zero(), &config).unwrap();
        let order = NewOrder {
            order_number,
            buyer_id: Some(77),
            storefront_id: 1,
            financials,
            shipping_address: address(),
            billing_address: address(),
            customer_notes: Some("leave at door".to_string()),
        };
        let items = vec![NewOrderItem {
            listing_id,
            variant_id: None,
            quantity: 2,
            unit_price: Money::from_cents(1000),
            subtotal: line.subtotal,
            discount: line.discount,
            total: line.total,
            name_snapshot: "Notebook".to_string(),
            sku_snapshot: "NB-1".to_string(),
            attributes_snapshot: Document::new().with("ruled", true),
            image_snapshot: None,
        }];
        (order, items)
    }

    async fn insert_order(db: &crate::Database) -> Order {
        let listing_id = testing::listing(db, "NB-1", 1000, 10).await;
        let now = Utc::now();
        let mut tx = db.pool().begin().await.unwrap();
        let number = OrderRepository::next_order_number(&mut tx, now).await.unwrap();
        let (order, items) = new_order(number, listing_id);
        let order = OrderRepository::insert(&mut tx, &order, now).await.unwrap();
        OrderRepository::insert_items(&mut tx, order.id, &items, now)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        order
    }

    #[tokio::test]
    async fn test_order_numbers_are_sequential_per_year() {
        let db = testing::database().await;
        let mut tx = db.pool().begin().await.unwrap();
        let in_2026 = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let in_2027 = Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap();

        assert_eq!(
            OrderRepository::next_order_number(&mut tx, in_2026).await.unwrap(),
            "ORD-2026-000001"
        );
        assert_eq!(
            OrderRepository::next_order_number(&mut tx, in_2026).await.unwrap(),
            "ORD-2026-000002"
        );
        assert_eq!(
            OrderRepository::next_order_number(&mut tx, in_2027).await.unwrap(),
            "ORD-2027-000001"
        );
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let db = testing::database().await;
        let order = insert_order(&db).await;

        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.payment_status, PaymentStatus::Pending);
        assert_eq!(order.total_cents, 2900);
        assert_eq!(order.commission_cents + order.seller_amount_cents, 2900);
        assert_eq!(order.shipping_address.city, "Busan");

        let by_number = db
            .orders()
            .get_by_number(&order.order_number)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_number.id, order.id);

        let items = db.orders().items(order.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].total_cents, 2000);
        assert_eq!(
            items[0].attributes_snapshot.get("ruled"),
            Some(&bazaar_core::DocValue::Bool(true))
        );

        let mine = db.orders().list_for_buyer(77, 10).await.unwrap();
        assert_eq!(mine.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_paid_is_conditional() {
        let db = testing::database().await;
        let order = insert_order(&db).await;
        let now = Utc::now();
        let payload = Document::new().with("gateway", "stripe").with("amount", 2900);

        let mut tx = db.pool().begin().await.unwrap();
        let release = now + chrono::Duration::days(7);
        assert!(OrderRepository::mark_paid(&mut tx, order.id, "pi_1", &payload, release, now)
            .await
            .unwrap());
        assert!(!OrderRepository::mark_paid(&mut tx, order.id, "pi_2", &payload, release, now)
            .await
            .unwrap());
        tx.commit().await.unwrap();

        let paid = db.orders().get(order.id).await.unwrap().unwrap();
        assert_eq!(paid.status, OrderStatus::Confirmed);
        assert_eq!(paid.payment_status, PaymentStatus::Completed);
        assert_eq!(paid.payment_reference.as_deref(), Some("pi_1"));
        assert_eq!(paid.payment_details, Some(payload));
        assert!(paid.confirmed_at.is_some());
        assert!(paid.escrow_release_date.is_some());
    }

    #[tokio::test]
    async fn test_refund_claim_admits_one_key() {
        let db = testing::database().await;
        let order = insert_order(&db).await;
        let now = Utc::now();
        let earlier = now - chrono::Duration::minutes(10);
        let payload = Document::new();

        let mut tx = db.pool().begin().await.unwrap();
        OrderRepository::mark_paid(&mut tx, order.id, "pi_1", &payload, now, now)
            .await
            .unwrap();

        assert!(OrderRepository::claim_refund(&mut tx, order.id, "rk-full", now, earlier)
            .await
            .unwrap());
        // Held by a live claim, whichever key asks.
        assert!(!OrderRepository::claim_refund(&mut tx, order.id, "rk-full", now, earlier)
            .await
            .unwrap());
        assert!(!OrderRepository::claim_refund(&mut tx, order.id, "rk-items", now, now)
            .await
            .unwrap());
        // A stale claim is only retaken by its own key.
        let later = now + chrono::Duration::minutes(10);
        assert!(OrderRepository::claim_refund(&mut tx, order.id, "rk-full", later, now)
            .await
            .unwrap());

        assert!(!OrderRepository::settle_refund(
            &mut tx,
            order.id,
            "rk-items",
            PaymentStatus::Refunded,
            later
        )
        .await
        .unwrap());
        assert!(OrderRepository::settle_refund(
            &mut tx,
            order.id,
            "rk-full",
            PaymentStatus::Refunded,
            later
        )
        .await
        .unwrap());
        assert!(!OrderRepository::release_refund_claim(&mut tx, order.id, "rk-full", later)
            .await
            .unwrap());
        tx.commit().await.unwrap();

        let refunded = db.orders().get(order.id).await.unwrap().unwrap();
        assert_eq!(refunded.payment_status, PaymentStatus::Refunded);
    }

    #[tokio::test]
    async fn test_released_refund_claim_can_be_taken_again() {
        let db = testing::database().await;
        let order = insert_order(&db).await;
        let now = Utc::now();

        let mut tx = db.pool().begin().await.unwrap();
        OrderRepository::mark_paid(&mut tx, order.id, "pi_1", &Document::new(), now, now)
            .await
            .unwrap();
        assert!(OrderRepository::claim_refund(&mut tx, order.id, "rk-a", now, now)
            .await
            .unwrap());
        assert!(OrderRepository::release_refund_claim(&mut tx, order.id, "rk-a", now)
            .await
            .unwrap());
        assert!(OrderRepository::claim_refund(&mut tx, order.id, "rk-b", now, now)
            .await
            .unwrap());
        tx.commit().await.unwrap();

        let order = db.orders().get(order.id).await.unwrap().unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn test_transitions_stamp_lifecycle() {
        let db = testing::database().await;
        let order = insert_order(&db).await;
        let now = Utc::now();

        let mut tx = db.pool().begin().await.unwrap();
        assert!(!OrderRepository::transition(
            &mut tx,
            order.id,
            OrderStatus::Confirmed,
            OrderStatus::Shipped,
            now
        )
        .await
        .unwrap());
        assert!(OrderRepository::transition(
            &mut tx,
            order.id,
            OrderStatus::Pending,
            OrderStatus::Confirmed,
            now
        )
        .await
        .unwrap());
        assert!(OrderRepository::transition(
            &mut tx,
            order.id,
            OrderStatus::Confirmed,
            OrderStatus::Shipped,
            now
        )
        .await
        .unwrap());
        tx.commit().await.unwrap();

        let shipped = db.orders().get(order.id).await.unwrap().unwrap();
        assert_eq!(shipped.status, OrderStatus::Shipped);
        assert!(shipped.shipped_at.is_some());
        assert!(shipped.delivered_at.is_none());
    }

    #[tokio::test]
    async fn test_cancel_and_refund_status() {
        let db = testing::database().await;
        let order = insert_order(&db).await;
        let now = Utc::now();

        let mut tx = db.pool().begin().await.unwrap();
        assert!(OrderRepository::mark_cancelled(
            &mut tx,
            order.id,
            OrderStatus::Pending,
            Some("changed mind"),
            now
        )
        .await
        .unwrap());
        assert!(!OrderRepository::claim_refund(&mut tx, order.id, "rk-1", now, now)
            .await
            .unwrap());
        tx.commit().await.unwrap();

        let cancelled = db.orders().get(order.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("changed mind"));
        assert!(cancelled.cancelled_at.is_some());
    }

    #[tokio::test]
    async fn test_orders_and_items_are_protected() {
        let db = testing::database().await;
        let order = insert_order(&db).await;

        let err: DbError = sqlx::query("DELETE FROM orders WHERE id = ?")
            .bind(order.id)
            .execute(db.pool())
            .await
            .unwrap_err()
            .into();
        assert!(matches!(err, DbError::ConstraintViolation { .. }));

        let err: DbError = sqlx::query("UPDATE order_items SET quantity = 9")
            .execute(db.pool())
            .await
            .unwrap_err()
            .into();
        assert!(matches!(err, DbError::ConstraintViolation { .. }));
    }
}
