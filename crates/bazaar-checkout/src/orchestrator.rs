//! # Order Orchestrator
//!
//! Turns a cart or an item list into a durable order and drives it through
//! payment, fulfilment, cancellation and refunds.
//!
//! ## Checkout Transaction
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      create_order (one transaction)                     │
//! │                                                                         │
//! │  resolve source ─► validate ─► BEGIN                                    │
//! │                                  │                                      │
//! │                                  ├─ claim cart (open → converted)       │
//! │                                  ├─ lock listings (ascending id)        │
//! │                                  ├─ Σ requested ≤ available per listing │
//! │                                  ├─ price drift vs. cart snapshot       │
//! │                                  ├─ single storefront                   │
//! │                                  ├─ item snapshots + order financials   │
//! │                                  ├─ allocate ORD-<year>-<seq>           │
//! │                                  ├─ insert order + items                │
//! │                                  └─ one reservation per item            │
//! │                                COMMIT                                   │
//! │                                  │                                      │
//! │                 empty cart (best-effort), spawn notification            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every other mutation reads the order first, then opens a transaction whose
//! first statement is a conditional status update. If that update matches no
//! row the order moved concurrently and the operation reports the conflict.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use bazaar_core::finance::{
    item_financials, order_financials, partial_refund, refund_amount, FinancialConfig,
};
use bazaar_core::validation::{
    validate_address, validate_item_count, validate_non_negative_money, validate_note,
    validate_quantity,
};
use bazaar_core::{
    Address, CartStatus, CoreError, Document, InventoryReservation, Listing, ListingVariant, Money,
    NewOrderItem, Order, OrderItem, OrderStatus, PaymentStatus, PriceChange, Rate,
    ReservationReference, ReservationStatus, ValidationError, CHECKOUT_RESERVATION_TTL_SECS,
    MAX_ESCROW_DAYS,
};
use bazaar_db::{
    CartRepository, Database, DbError, ListingRepository, NewOrder, NewReservation, OrderRepository,
    ReservationManager, StockLedger,
};
use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collaborators::{
    LogNotifier, OrderCreatedNotice, OrderNotifier, PaymentGateway, RefundReceipt, RefundRequest,
};
use crate::config::CheckoutConfig;
use crate::error::{CheckoutError, CheckoutResult};

/// Actor recorded on movements written when the platform cancels an order.
const SYSTEM_ACTOR: &str = "system";

/// How long a refund claim blocks a retry under the same key.
const REFUND_CLAIM_LEASE_SECS: i64 = 300;

// =============================================================================
// Requests
// =============================================================================

/// One line of a direct checkout.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderLine {
    pub listing_id: i64,
    pub variant_id: Option<i64>,
    pub quantity: i64,
    /// Price the buyer saw; compared against the current price.
    pub price_snapshot: Option<Money>,
    /// Line discount; ignored outside (0%, 100%].
    pub discount_rate: Rate,
}

impl OrderLine {
    pub fn new(listing_id: i64, quantity: i64) -> Self {
        OrderLine {
            listing_id,
            variant_id: None,
            quantity,
            price_snapshot: None,
            discount_rate: Rate::zero(),
        }
    }

    pub fn variant(mut self, variant_id: i64) -> Self {
        self.variant_id = Some(variant_id);
        self
    }

    pub fn snapshot(mut self, price: Money) -> Self {
        self.price_snapshot = Some(price);
        self
    }

    pub fn discount(mut self, rate: Rate) -> Self {
        self.discount_rate = rate;
        self
    }
}

/// Where the lines of a new order come from.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderSource {
    /// An open cart; it is converted with the order and emptied afterwards.
    Cart(i64),
    Items(Vec<OrderLine>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateOrderRequest {
    /// `None` for guest checkout.
    pub buyer_id: Option<i64>,
    pub source: OrderSource,
    pub shipping_address: Address,
    /// Defaults to the shipping address.
    pub billing_address: Option<Address>,
    pub shipping: Money,
    pub discount: Money,
    pub customer_notes: Option<String>,
    /// Proceed at current prices instead of failing with `PriceChanged`.
    pub accept_price_changes: bool,
}

impl CreateOrderRequest {
    pub fn new(buyer_id: Option<i64>, source: OrderSource, shipping_address: Address) -> Self {
        CreateOrderRequest {
            buyer_id,
            source,
            shipping_address,
            billing_address: None,
            shipping: Money::zero(),
            discount: Money::zero(),
            customer_notes: None,
            accept_price_changes: false,
        }
    }
}

/// Webhook payload confirming a charge.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentConfirmation {
    pub transaction_ref: String,
    pub gateway_payload: Document,
}

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub reservations: Vec<InventoryReservation>,
    /// Drift accepted because `accept_price_changes` was set.
    pub price_changes: Vec<PriceChange>,
}

#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub order: Order,
    pub amount: Money,
    pub receipt: RefundReceipt,
}

// =============================================================================
// Order Service
// =============================================================================

/// Coordinates the stock ledger, reservations and order repository.
#[derive(Clone)]
pub struct OrderService {
    db: Database,
    finance: FinancialConfig,
    checkout_ttl: Duration,
    notifier: Arc<dyn OrderNotifier>,
    gateway: Arc<dyn PaymentGateway>,
}

impl OrderService {
    pub fn new(db: Database, finance: FinancialConfig, gateway: Arc<dyn PaymentGateway>) -> Self {
        OrderService {
            db,
            finance,
            checkout_ttl: Duration::from_secs(CHECKOUT_RESERVATION_TTL_SECS as u64),
            notifier: Arc::new(LogNotifier),
            gateway,
        }
    }

    pub fn from_config(
        db: Database,
        config: &CheckoutConfig,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self::new(db, config.financial_config(), gateway).with_checkout_ttl(config.checkout_ttl())
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn OrderNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_checkout_ttl(mut self, ttl: Duration) -> Self {
        self.checkout_ttl = ttl;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn financial_config(&self) -> &FinancialConfig {
        &self.finance
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Places an order and holds its stock.
    ///
    /// ## Errors
    /// - `Validation` for empty or malformed input, or mixed storefronts
    /// - `CartNotFound`, or `NotFound` for a missing listing or variant
    /// - `InsufficientStock` when a listing cannot cover the lines
    /// - `PriceChanged` when a snapshot price drifted and the buyer has not
    ///   accepted current prices
    ///
    /// Any failure leaves no trace: the transaction rolls back.
    pub async fn create_order(&self, request: CreateOrderRequest) -> CheckoutResult<PlacedOrder> {
        let (lines, cart_id) = self.resolve_lines(&request).await?;
        validate_request(&request, &lines)?;

        let now = Utc::now();
        let mut tx = self.db.pool().begin().await?;

        // 0. A cart is claimed by exactly one checkout
        if let Some(cart_id) = cart_id {
            if !CartRepository::claim(&mut tx, cart_id, now).await? {
                tx.rollback().await?;
                debug!(cart_id, "Checkout refused, cart already claimed");
                return Err(cart_checked_out(cart_id));
            }
        }

        // 1. Locks, ascending id
        let locked = StockLedger::lock_many(&mut tx, lines.iter().map(|l| l.listing_id)).await?;

        // 2. Availability against the summed request per listing
        let mut requested: BTreeMap<i64, i64> = BTreeMap::new();
        for line in &lines {
            *requested.entry(line.listing_id).or_insert(0) += line.quantity;
        }
        let mut listings: BTreeMap<i64, Listing> = BTreeMap::new();
        for listing_id in &locked {
            let wanted = requested.get(listing_id).copied().unwrap_or(0);
            let available = StockLedger::available(&mut tx, *listing_id).await?;
            if wanted > available {
                debug!(listing_id, wanted, available, "Checkout refused, stock short");
                return Err(CoreError::InsufficientStock {
                    listing_id: *listing_id,
                    requested: wanted,
                    available,
                }
                .into());
            }

            let listing = ListingRepository::get_in(&mut tx, *listing_id)
                .await?
                .ok_or_else(|| DbError::not_found("Listing", listing_id))?;
            listings.insert(*listing_id, listing);
        }

        // 3. Variants and current prices
        let mut priced = Vec::with_capacity(lines.len());
        let mut price_changes = Vec::new();
        for line in &lines {
            let listing = listings
                .get(&line.listing_id)
                .ok_or_else(|| DbError::not_found("Listing", line.listing_id))?;
            let variant = match line.variant_id {
                Some(variant_id) => Some(load_variant(&mut tx, listing, variant_id).await?),
                None => None,
            };
            let current = variant
                .as_ref()
                .map(|v| v.effective_price(listing))
                .unwrap_or_else(|| listing.price());

            if let Some(change) = line
                .price_snapshot
                .and_then(|old| PriceChange::between(line.listing_id, line.variant_id, old, current))
            {
                price_changes.push(change);
            }
            priced.push((line, listing, variant, current));
        }

        if !price_changes.is_empty() && !request.accept_price_changes {
            info!(changed = price_changes.len(), "Checkout refused, prices drifted");
            return Err(CoreError::PriceChanged {
                changes: price_changes,
            }
            .into());
        }

        // 4. One storefront per order
        let storefronts: BTreeSet<i64> = listings.values().map(|l| l.storefront_id).collect();
        if storefronts.len() > 1 {
            return Err(CoreError::MixedStorefronts {
                storefronts: storefronts.into_iter().collect(),
            }
            .into());
        }
        let storefront_id = listings
            .values()
            .next()
            .map(|l| l.storefront_id)
            .ok_or_else(|| ValidationError::required("items"))?;

        // 5. Snapshots and money
        let mut new_items = Vec::with_capacity(priced.len());
        let mut line_money = Vec::with_capacity(priced.len());
        for (line, listing, variant, unit_price) in priced {
            let money = item_financials(line.quantity, unit_price, line.discount_rate);
            line_money.push(money);
            new_items.push(NewOrderItem {
                listing_id: line.listing_id,
                variant_id: line.variant_id,
                quantity: line.quantity,
                unit_price,
                subtotal: money.subtotal,
                discount: money.discount,
                total: money.total,
                name_snapshot: variant
                    .as_ref()
                    .map(|v| v.name.clone())
                    .unwrap_or_else(|| listing.name.clone()),
                sku_snapshot: variant
                    .as_ref()
                    .map(|v| v.sku.clone())
                    .unwrap_or_else(|| listing.sku.clone()),
                attributes_snapshot: variant.map(|v| v.attributes).unwrap_or_default(),
                image_snapshot: listing.image_url.clone(),
            });
        }
        let financials = order_financials(&line_money, request.shipping, request.discount, &self.finance)?;

        // 6. Number, order, items
        let order_number = OrderRepository::next_order_number(&mut tx, now).await?;
        let new_order = NewOrder {
            order_number,
            buyer_id: request.buyer_id,
            storefront_id,
            financials,
            shipping_address: request.shipping_address.clone(),
            billing_address: request
                .billing_address
                .clone()
                .unwrap_or_else(|| request.shipping_address.clone()),
            customer_notes: request.customer_notes.clone(),
        };
        let order = OrderRepository::insert(&mut tx, &new_order, now).await?;
        let items = OrderRepository::insert_items(&mut tx, order.id, &new_items, now).await?;

        // 7. Holds
        let reference = order.reservation_reference();
        let mut reservations = Vec::with_capacity(items.len());
        for item in &items {
            let hold = NewReservation::new(item.listing_id, reference, item.quantity)
                .variant(item.variant_id)
                .ttl(self.checkout_ttl);
            reservations.push(ReservationManager::create(&mut tx, &hold).await?);
        }

        tx.commit().await?;

        info!(
            order_id = order.id,
            order_number = %order.order_number,
            storefront_id,
            total = %order.total(),
            items = items.len(),
            "Order placed"
        );

        if let Some(cart_id) = cart_id {
            if let Err(e) = self.db.carts().clear_items(cart_id).await {
                warn!(?e, cart_id, order_id = order.id, "Failed to empty cart after checkout");
            }
        }
        self.notify_created(&order, items.len());

        Ok(PlacedOrder {
            order,
            items,
            reservations,
            price_changes,
        })
    }

    /// Reads the lines of the request, from the cart when it names one.
    async fn resolve_lines(
        &self,
        request: &CreateOrderRequest,
    ) -> CheckoutResult<(Vec<OrderLine>, Option<i64>)> {
        match &request.source {
            OrderSource::Items(lines) => Ok((lines.clone(), None)),
            OrderSource::Cart(cart_id) => {
                let cart = self
                    .db
                    .carts()
                    .get(*cart_id)
                    .await?
                    .ok_or(CheckoutError::CartNotFound(*cart_id))?;

                if cart.status != CartStatus::Open {
                    return Err(cart_checked_out(*cart_id));
                }
                if cart.buyer_id.is_some() && cart.buyer_id != request.buyer_id {
                    return Err(ValidationError::InvalidFormat {
                        field: "buyer_id".to_string(),
                        reason: format!("cart {} belongs to another buyer", cart_id),
                    }
                    .into());
                }

                let lines = self
                    .db
                    .carts()
                    .items(*cart_id)
                    .await?
                    .into_iter()
                    .map(|item| OrderLine {
                        listing_id: item.listing_id,
                        variant_id: item.variant_id,
                        quantity: item.quantity,
                        price_snapshot: Some(Money::from_cents(item.price_snapshot_cents)),
                        discount_rate: Rate::zero(),
                    })
                    .collect();
                Ok((lines, Some(*cart_id)))
            }
        }
    }

    fn notify_created(&self, order: &Order, item_count: usize) {
        let notice = OrderCreatedNotice {
            order_id: order.id,
            order_number: order.order_number.clone(),
            buyer_id: order.buyer_id,
            storefront_id: order.storefront_id,
            total: order.total(),
            currency: order.currency.clone(),
            item_count,
        };
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            let order_id = notice.order_id;
            if let Err(e) = notifier.order_created(notice).await {
                warn!(?e, order_id, "Order notification failed");
            }
        });
    }

    // =========================================================================
    // Payment
    // =========================================================================

    /// Records a confirmed charge and commits the order's reservations.
    ///
    /// ## Errors
    /// - `PaymentNotPending` unless the order is pending with pending payment
    /// - `PaymentWindowExpired` if any hold lapsed; the order stays pending
    pub async fn confirm_order_payment(
        &self,
        order_id: i64,
        confirmation: PaymentConfirmation,
    ) -> CheckoutResult<Order> {
        if confirmation.transaction_ref.trim().is_empty() {
            return Err(ValidationError::required("transaction_ref").into());
        }

        let order = self.get_order(order_id).await?;
        if order.status != OrderStatus::Pending || order.payment_status != PaymentStatus::Pending {
            return Err(CoreError::PaymentNotPending {
                order_id,
                status: order.status,
                payment_status: order.payment_status,
            }
            .into());
        }

        let now = Utc::now();
        let escrow_release = chrono::Duration::try_days(order.escrow_days)
            .and_then(|hold| now.checked_add_signed(hold))
            .ok_or_else(|| ValidationError::OutOfRange {
                field: "escrow_days".to_string(),
                min: 0,
                max: MAX_ESCROW_DAYS,
            })?;
        let mut tx = self.db.pool().begin().await?;

        let paid = OrderRepository::mark_paid(
            &mut tx,
            order_id,
            &confirmation.transaction_ref,
            &confirmation.gateway_payload,
            escrow_release,
            now,
        )
        .await?;
        if !paid {
            tx.rollback().await?;
            let current = self.get_order(order_id).await?;
            return Err(CoreError::PaymentNotPending {
                order_id,
                status: current.status,
                payment_status: current.payment_status,
            }
            .into());
        }

        let reference = order.reservation_reference();
        let holds = ReservationManager::list_by_reference_in(&mut tx, reference).await?;
        if holds
            .iter()
            .any(|r| r.status == ReservationStatus::Expired || r.is_lapsed_at(now))
        {
            tx.rollback().await?;
            warn!(
                order_id,
                transaction_ref = %confirmation.transaction_ref,
                "Payment arrived after the reservation window closed"
            );
            return Err(CoreError::PaymentWindowExpired { order_id }.into());
        }

        let committed = ReservationManager::commit_by_reference(&mut tx, reference, now).await?;
        let confirmed = OrderRepository::get_in(&mut tx, order_id)
            .await?
            .ok_or(CheckoutError::OrderNotFound(order_id))?;
        tx.commit().await?;

        info!(
            order_id,
            transaction_ref = %confirmation.transaction_ref,
            committed = committed.len(),
            escrow_release = %escrow_release,
            "Payment confirmed"
        );
        Ok(confirmed)
    }

    // =========================================================================
    // Cancellation & Status
    // =========================================================================

    /// Cancels an order on behalf of its buyer.
    ///
    /// Active holds are released; stock already committed by payment is
    /// returned with an `in` movement.
    pub async fn cancel_order(
        &self,
        order_id: i64,
        requester_id: i64,
        reason: Option<&str>,
    ) -> CheckoutResult<Order> {
        validate_note("reason", reason)?;

        let order = self.get_order(order_id).await?;
        if !order.is_owned_by(requester_id) {
            return Err(CoreError::NotOrderOwner {
                order_id,
                requester_id,
            }
            .into());
        }
        if !order.status.is_cancellable() {
            return Err(CoreError::OrderCannotCancel {
                order_id,
                status: order.status,
            }
            .into());
        }

        self.apply_cancellation(&order, reason, &format!("buyer:{}", requester_id))
            .await
    }

    /// Moves an order along the state machine.
    ///
    /// Cancellation takes the same release/restock path as
    /// [`OrderService::cancel_order`]. Confirmation only happens through
    /// [`OrderService::confirm_order_payment`].
    pub async fn update_order_status(
        &self,
        order_id: i64,
        new_status: OrderStatus,
    ) -> CheckoutResult<Order> {
        let order = self.get_order(order_id).await?;
        if !order.status.can_transition_to(new_status) || new_status == OrderStatus::Confirmed {
            return Err(CoreError::InvalidTransition {
                order_id,
                from: order.status,
                to: new_status,
            }
            .into());
        }

        if new_status == OrderStatus::Cancelled {
            return self.apply_cancellation(&order, None, SYSTEM_ACTOR).await;
        }

        let now = Utc::now();
        let mut tx = self.db.pool().begin().await?;
        if !OrderRepository::transition(&mut tx, order_id, order.status, new_status, now).await? {
            tx.rollback().await?;
            return Err(self.status_conflict(order_id, new_status).await);
        }
        let updated = OrderRepository::get_in(&mut tx, order_id)
            .await?
            .ok_or(CheckoutError::OrderNotFound(order_id))?;
        tx.commit().await?;

        info!(order_id, from = %order.status, to = %new_status, "Order status updated");
        Ok(updated)
    }

    async fn apply_cancellation(
        &self,
        order: &Order,
        reason: Option<&str>,
        actor: &str,
    ) -> CheckoutResult<Order> {
        let now = Utc::now();
        let reference = order.reservation_reference();
        let mut tx = self.db.pool().begin().await?;

        if !OrderRepository::mark_cancelled(&mut tx, order.id, order.status, reason, now).await? {
            tx.rollback().await?;
            return Err(self.status_conflict(order.id, OrderStatus::Cancelled).await);
        }

        let released = ReservationManager::release_by_reference(&mut tx, reference, now).await?;
        let restocked =
            ReservationManager::restock_committed_by_reference(&mut tx, reference, actor).await?;
        let cancelled = OrderRepository::get_in(&mut tx, order.id)
            .await?
            .ok_or(CheckoutError::OrderNotFound(order.id))?;
        tx.commit().await?;

        info!(
            order_id = order.id,
            previous = %order.status,
            released,
            restocked = restocked.len(),
            actor,
            "Order cancelled"
        );
        Ok(cancelled)
    }

    /// Explains why a conditional status update matched no row.
    async fn status_conflict(&self, order_id: i64, wanted: OrderStatus) -> CheckoutError {
        let current = match self.db.orders().get(order_id).await {
            Ok(Some(order)) => order,
            Ok(None) => return CheckoutError::OrderNotFound(order_id),
            Err(e) => return e.into(),
        };

        if wanted == OrderStatus::Cancelled && !current.status.is_cancellable() {
            CoreError::OrderCannotCancel {
                order_id,
                status: current.status,
            }
            .into()
        } else if !current.status.can_transition_to(wanted) {
            CoreError::InvalidTransition {
                order_id,
                from: current.status,
                to: wanted,
            }
            .into()
        } else {
            CheckoutError::ConcurrentModification { order_id }
        }
    }

    // =========================================================================
    // Refunds
    // =========================================================================

    /// Refunds the full order total.
    ///
    /// The order is claimed before the gateway is called, so concurrent
    /// callers forward at most one request. The idempotency key is derived
    /// from the order and the refunded items; a retry after a failed
    /// settlement sends the same key again once the claim goes stale.
    pub async fn process_refund(&self, order_id: i64, reason: &str) -> CheckoutResult<RefundOutcome> {
        let order = self.get_order(order_id).await?;
        require_refundable(&order)?;

        let amount = refund_amount(&order);
        let key = refund_idempotency_key(order_id, "full");
        self.settle_refund(order, amount, key, reason, PaymentStatus::Refunded)
            .await
    }

    /// Refunds the named items plus the tax charged on them.
    ///
    /// Shipping and commission are kept. The amount never exceeds what the
    /// buyer paid.
    pub async fn process_partial_refund(
        &self,
        order_id: i64,
        item_ids: &[i64],
        reason: &str,
    ) -> CheckoutResult<RefundOutcome> {
        if item_ids.is_empty() {
            return Err(ValidationError::required("item_ids").into());
        }
        let mut wanted = BTreeSet::new();
        for id in item_ids {
            if !wanted.insert(*id) {
                return Err(ValidationError::Duplicate {
                    field: "item_ids".to_string(),
                    value: id.to_string(),
                }
                .into());
            }
        }

        let order = self.get_order(order_id).await?;
        require_refundable(&order)?;

        let items = self.db.orders().items(order_id).await?;
        let known: BTreeSet<i64> = items.iter().map(|i| i.id).collect();
        if let Some(missing) = wanted.difference(&known).next() {
            return Err(DbError::not_found("OrderItem", missing).into());
        }
        let selected: Vec<OrderItem> = items
            .into_iter()
            .filter(|i| wanted.contains(&i.id))
            .collect();

        let amount = partial_refund(&selected, &self.finance).min(order.total());
        let scope = wanted
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let key = refund_idempotency_key(order_id, &format!("items:{}", scope));
        self.settle_refund(order, amount, key, reason, PaymentStatus::PartiallyRefunded)
            .await
    }

    async fn settle_refund(
        &self,
        order: Order,
        amount: Money,
        idempotency_key: Uuid,
        reason: &str,
        outcome: PaymentStatus,
    ) -> CheckoutResult<RefundOutcome> {
        let order_id = order.id;
        let key = idempotency_key.to_string();

        let now = Utc::now();
        let stale_before = now - chrono::Duration::seconds(REFUND_CLAIM_LEASE_SECS);
        let mut tx = self.db.pool().begin().await?;
        if !OrderRepository::claim_refund(&mut tx, order_id, &key, now, stale_before).await? {
            tx.rollback().await?;
            let current = self.get_order(order_id).await?;
            if current.payment_status != PaymentStatus::Completed {
                return Err(CoreError::PaymentNotRefundable {
                    order_id,
                    payment_status: current.payment_status,
                }
                .into());
            }
            debug!(order_id, %idempotency_key, "Refund already claimed");
            return Err(CheckoutError::RefundInProgress {
                order_id,
                idempotency_key,
            });
        }
        tx.commit().await?;

        let request = RefundRequest {
            order_id,
            payment_reference: order.payment_reference.clone(),
            amount,
            currency: order.currency.clone(),
            idempotency_key,
            reason: reason.to_string(),
        };
        let receipt = match self.gateway.request_refund(request).await {
            Ok(receipt) => receipt,
            Err(e) => {
                self.release_refund_claim(order_id, &key).await;
                return Err(e);
            }
        };

        let now = Utc::now();
        let mut tx = self.db.pool().begin().await?;
        if !OrderRepository::settle_refund(&mut tx, order_id, &key, outcome, now).await? {
            tx.rollback().await?;
            let current = self.get_order(order_id).await?;
            error!(
                order_id,
                %idempotency_key,
                refund_reference = %receipt.refund_reference,
                payment_status = %current.payment_status,
                "Refund accepted by gateway but order payment moved concurrently"
            );
            return Err(CheckoutError::RefundConflict {
                order_id,
                idempotency_key,
                payment_status: current.payment_status,
            });
        }
        let refunded = OrderRepository::get_in(&mut tx, order_id)
            .await?
            .ok_or(CheckoutError::OrderNotFound(order_id))?;
        tx.commit().await?;

        info!(
            order_id,
            amount = %amount,
            %idempotency_key,
            refund_reference = %receipt.refund_reference,
            payment_status = %outcome,
            "Refund processed"
        );
        Ok(RefundOutcome {
            order: refunded,
            amount,
            receipt,
        })
    }

    /// Lets a refund the gateway refused be attempted again.
    async fn release_refund_claim(&self, order_id: i64, key: &str) {
        let released = async {
            let mut tx = self.db.pool().begin().await?;
            let released =
                OrderRepository::release_refund_claim(&mut tx, order_id, key, Utc::now()).await?;
            tx.commit().await?;
            Ok::<bool, DbError>(released)
        }
        .await;

        if let Err(e) = released {
            warn!(?e, order_id, key, "Failed to release refund claim");
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get_order(&self, order_id: i64) -> CheckoutResult<Order> {
        self.db
            .orders()
            .get(order_id)
            .await?
            .ok_or(CheckoutError::OrderNotFound(order_id))
    }

    pub async fn get_order_items(&self, order_id: i64) -> CheckoutResult<Vec<OrderItem>> {
        self.get_order(order_id).await?;
        Ok(self.db.orders().items(order_id).await?)
    }

    pub async fn order_reservations(
        &self,
        order_id: i64,
    ) -> CheckoutResult<Vec<InventoryReservation>> {
        Ok(self
            .db
            .reservations()
            .list_by_reference(ReservationReference::Order(order_id))
            .await?)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn validate_request(request: &CreateOrderRequest, lines: &[OrderLine]) -> CheckoutResult<()> {
    validate_item_count(lines.len())?;
    for line in lines {
        validate_quantity(line.quantity)?;
    }
    validate_address("shipping_address", &request.shipping_address)?;
    if let Some(billing) = &request.billing_address {
        validate_address("billing_address", billing)?;
    }
    validate_non_negative_money("shipping", request.shipping)?;
    validate_non_negative_money("discount", request.discount)?;
    validate_note("customer_notes", request.customer_notes.as_deref())?;
    Ok(())
}

async fn load_variant(
    conn: &mut sqlx::SqliteConnection,
    listing: &Listing,
    variant_id: i64,
) -> CheckoutResult<ListingVariant> {
    let variant = ListingRepository::get_variant_in(conn, variant_id)
        .await?
        .ok_or_else(|| DbError::not_found("ListingVariant", variant_id))?;
    if variant.listing_id != listing.id {
        return Err(ValidationError::InvalidFormat {
            field: "variant_id".to_string(),
            reason: format!("variant {} does not belong to listing {}", variant_id, listing.id),
        }
        .into());
    }
    Ok(variant)
}

fn cart_checked_out(cart_id: i64) -> CheckoutError {
    ValidationError::InvalidFormat {
        field: "cart".to_string(),
        reason: format!("cart {} has already been checked out", cart_id),
    }
    .into()
}

/// Same order and same items always give the same key.
fn refund_idempotency_key(order_id: i64, scope: &str) -> Uuid {
    let name = format!("bazaar-refund:{}:{}", order_id, scope);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

fn require_refundable(order: &Order) -> CheckoutResult<()> {
    if order.payment_status != PaymentStatus::Completed {
        return Err(CoreError::PaymentNotRefundable {
            order_id: order.id,
            payment_status: order.payment_status,
        }
        .into());
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bazaar_core::{ErrorKind, MovementDirection, MovementReason};
    use bazaar_db::{DbConfig, NewListing, NewVariant};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    // -------------------------------------------------------------------------
    // Fixtures
    // -------------------------------------------------------------------------

    #[derive(Default)]
    struct RecordingGateway {
        requests: Mutex<Vec<RefundRequest>>,
        decline: AtomicBool,
    }

    #[async_trait]
    impl PaymentGateway for RecordingGateway {
        async fn request_refund(&self, request: RefundRequest) -> CheckoutResult<RefundReceipt> {
            if self.decline.load(Ordering::SeqCst) {
                return Err(CheckoutError::Gateway {
                    message: "refund declined".into(),
                    retryable: false,
                });
            }
            let receipt = RefundReceipt {
                refund_reference: format!("re_{}", request.idempotency_key.simple()),
                amount: request.amount,
            };
            self.requests.lock().unwrap().push(request);
            Ok(receipt)
        }
    }

    struct ChannelNotifier(mpsc::UnboundedSender<OrderCreatedNotice>);

    #[async_trait]
    impl OrderNotifier for ChannelNotifier {
        async fn order_created(&self, notice: OrderCreatedNotice) -> CheckoutResult<()> {
            self.0
                .send(notice)
                .map_err(|e| CheckoutError::ChannelError(e.to_string()))
        }
    }

    struct Fixture {
        db: Database,
        service: OrderService,
        gateway: Arc<RecordingGateway>,
    }

    async fn fixture() -> Fixture {
        fixture_with(RecordingGateway::default()).await
    }

    async fn fixture_with(gateway: RecordingGateway) -> Fixture {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let gateway = Arc::new(gateway);
        let finance = FinancialConfig::new(Rate::from_bps(2000), Rate::from_bps(1000), "USD");
        let service = OrderService::new(db.clone(), finance, gateway.clone());
        Fixture {
            db,
            service,
            gateway,
        }
    }

    async fn listing(db: &Database, storefront_id: i64, sku: &str, price_cents: i64, stock: i64) -> i64 {
        db.listings()
            .insert(&NewListing::new(storefront_id, sku, sku, price_cents, stock))
            .await
            .unwrap()
            .id
    }

    fn address() -> Address {
        Address {
            recipient: "Noor Haddad".to_string(),
            line1: "41 Cedar St".to_string(),
            city: "Amman".to_string(),
            postal_code: "11181".to_string(),
            country: "JO".to_string(),
            ..Default::default()
        }
    }

    const BUYER: i64 = 501;

    fn items_request(lines: Vec<OrderLine>) -> CreateOrderRequest {
        let mut request = CreateOrderRequest::new(Some(BUYER), OrderSource::Items(lines), address());
        request.shipping = Money::from_cents(500);
        request
    }

    fn payment(reference: &str) -> PaymentConfirmation {
        PaymentConfirmation {
            transaction_ref: reference.to_string(),
            gateway_payload: Document::new()
                .with("gateway", "acme-pay")
                .with("status", "succeeded"),
        }
    }

    async fn available(db: &Database, listing_id: i64) -> i64 {
        db.listings().stock_level(listing_id).await.unwrap().available
    }

    // -------------------------------------------------------------------------
    // Create
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_create_order_computes_money_and_holds_stock() {
        let f = fixture().await;
        let mug = listing(&f.db, 1, "MUG", 1000, 5).await;
        let bowl = listing(&f.db, 1, "BOWL", 2000, 5).await;

        let placed = f
            .service
            .create_order(items_request(vec![OrderLine::new(mug, 2), OrderLine::new(bowl, 1)]))
            .await
            .unwrap();

        let order = &placed.order;
        assert_eq!(order.subtotal_cents, 4000);
        assert_eq!(order.tax_cents, 800);
        assert_eq!(order.total_cents, 5300);
        assert_eq!(order.commission_cents, 400);
        assert_eq!(order.seller_amount_cents, 4900);
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(order.order_number.starts_with("ORD-"));
        assert_eq!(order.billing_address, address());

        assert_eq!(placed.items.len(), 2);
        assert_eq!(placed.reservations.len(), 2);
        assert!(placed
            .reservations
            .iter()
            .all(|r| r.status == ReservationStatus::Active));

        let level = f.db.listings().stock_level(mug).await.unwrap();
        assert_eq!((level.on_hand, level.reserved, level.available), (5, 2, 3));
    }

    #[tokio::test]
    async fn test_variant_snapshot_and_price_override() {
        let f = fixture().await;
        let tee = listing(&f.db, 2, "TEE", 2400, 10).await;
        let xl = f
            .db
            .listings()
            .insert_variant(&NewVariant {
                listing_id: tee,
                sku: "TEE-XL".into(),
                name: "TEE / XL".into(),
                attributes: Document::new().with("size", "XL"),
                price_cents: Some(2600),
            })
            .await
            .unwrap();

        let placed = f
            .service
            .create_order(items_request(vec![OrderLine::new(tee, 1).variant(xl.id)]))
            .await
            .unwrap();

        let item = &placed.items[0];
        assert_eq!(item.unit_price_cents, 2600);
        assert_eq!(item.sku_snapshot, "TEE-XL");
        assert_eq!(item.attributes_snapshot.get_str("size"), Some("XL"));
        assert_eq!(placed.reservations[0].variant_id, Some(xl.id));
    }

    #[tokio::test]
    async fn test_variant_of_another_listing_is_rejected() {
        let f = fixture().await;
        let tee = listing(&f.db, 2, "TEE", 2400, 10).await;
        let cap = listing(&f.db, 2, "CAP", 1900, 10).await;
        let variant = f
            .db
            .listings()
            .insert_variant(&NewVariant {
                listing_id: cap,
                sku: "CAP-RED".into(),
                name: "CAP / red".into(),
                attributes: Document::new(),
                price_cents: None,
            })
            .await
            .unwrap();

        let err = f
            .service
            .create_order(items_request(vec![OrderLine::new(tee, 1).variant(variant.id)]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_insufficient_stock_leaves_nothing_behind() {
        let f = fixture().await;
        let mug = listing(&f.db, 1, "MUG", 1000, 3).await;
        let bowl = listing(&f.db, 1, "BOWL", 2000, 5).await;

        // Two lines of the same listing count together.
        let err = f
            .service
            .create_order(items_request(vec![
                OrderLine::new(bowl, 1),
                OrderLine::new(mug, 2),
                OrderLine::new(mug, 2),
            ]))
            .await
            .unwrap_err();

        match err.as_core() {
            Some(CoreError::InsufficientStock {
                listing_id,
                requested,
                available,
            }) => assert_eq!((*listing_id, *requested, *available), (mug, 4, 3)),
            other => panic!("unexpected error: {:?}", other),
        }

        assert!(f.db.orders().list_for_buyer(BUYER, 10).await.unwrap().is_empty());
        assert_eq!(available(&f.db, bowl).await, 5);
        assert_eq!(available(&f.db, mug).await, 3);
    }

    #[tokio::test]
    async fn test_rejects_invalid_input() {
        let f = fixture().await;
        let mug = listing(&f.db, 1, "MUG", 1000, 3).await;

        let empty = f.service.create_order(items_request(vec![])).await.unwrap_err();
        assert_eq!(empty.kind(), ErrorKind::Validation);

        let zero = f
            .service
            .create_order(items_request(vec![OrderLine::new(mug, 0)]))
            .await
            .unwrap_err();
        assert_eq!(zero.kind(), ErrorKind::Validation);

        let mut no_city = items_request(vec![OrderLine::new(mug, 1)]);
        no_city.shipping_address.city = "  ".into();
        assert_eq!(
            f.service.create_order(no_city).await.unwrap_err().kind(),
            ErrorKind::Validation
        );

        let mut negative = items_request(vec![OrderLine::new(mug, 1)]);
        negative.shipping = Money::from_cents(-1);
        assert_eq!(
            f.service.create_order(negative).await.unwrap_err().kind(),
            ErrorKind::Validation
        );

        let missing = f
            .service
            .create_order(items_request(vec![OrderLine::new(9_999, 1)]))
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_mixed_storefronts_rejected() {
        let f = fixture().await;
        let a = listing(&f.db, 1, "A", 1000, 3).await;
        let b = listing(&f.db, 2, "B", 1000, 3).await;

        let err = f
            .service
            .create_order(items_request(vec![OrderLine::new(a, 1), OrderLine::new(b, 1)]))
            .await
            .unwrap_err();
        assert!(matches!(
            err.as_core(),
            Some(CoreError::MixedStorefronts { storefronts }) if storefronts == &vec![1, 2]
        ));
    }

    #[tokio::test]
    async fn test_cart_price_drift() {
        let f = fixture().await;
        let mug = listing(&f.db, 1, "MUG", 1000, 5).await;
        let cart = f.db.carts().create(Some(BUYER)).await.unwrap();
        f.db.carts().add_item(cart.id, mug, None, 2, 900).await.unwrap();

        let request = CreateOrderRequest::new(Some(BUYER), OrderSource::Cart(cart.id), address());
        let err = f.service.create_order(request.clone()).await.unwrap_err();
        match err.as_core() {
            Some(CoreError::PriceChanged { changes }) => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].old_price, Money::from_cents(900));
                assert_eq!(changes[0].new_price, Money::from_cents(1000));
                assert_eq!(changes[0].direction, bazaar_core::PriceDirection::Increased);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(f.db.carts().items(cart.id).await.unwrap().len(), 1);
        let cart = f.db.carts().get(cart.id).await.unwrap().unwrap();
        assert_eq!(cart.status, CartStatus::Open);

        let accepted = CreateOrderRequest {
            accept_price_changes: true,
            ..request
        };
        let placed = f.service.create_order(accepted).await.unwrap();
        assert_eq!(placed.items[0].unit_price_cents, 1000);
        assert_eq!(placed.price_changes.len(), 1);

        let cart = f.db.carts().get(cart.id).await.unwrap().unwrap();
        assert_eq!(cart.status, CartStatus::Converted);
        assert!(f.db.carts().items(cart.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_and_converted_cart() {
        let f = fixture().await;
        let err = f
            .service
            .create_order(CreateOrderRequest::new(Some(BUYER), OrderSource::Cart(77), address()))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::CartNotFound(77)));

        let mug = listing(&f.db, 1, "MUG", 1000, 5).await;
        let cart = f.db.carts().create(Some(BUYER)).await.unwrap();
        f.db.carts().add_item(cart.id, mug, None, 1, 1000).await.unwrap();
        let request = CreateOrderRequest::new(Some(BUYER), OrderSource::Cart(cart.id), address());
        f.service.create_order(request.clone()).await.unwrap();

        let again = f.service.create_order(request).await.unwrap_err();
        assert_eq!(again.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_notifier_receives_notice() {
        let f = fixture().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let service = f.service.clone().with_notifier(Arc::new(ChannelNotifier(tx)));
        let mug = listing(&f.db, 1, "MUG", 1000, 5).await;

        let placed = service
            .create_order(items_request(vec![OrderLine::new(mug, 1)]))
            .await
            .unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.order_id, placed.order.id);
        assert_eq!(notice.item_count, 1);
        assert_eq!(notice.total, placed.order.total());
    }

    // -------------------------------------------------------------------------
    // Payment
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_confirm_payment_commits_stock() {
        let f = fixture().await;
        let mug = listing(&f.db, 1, "MUG", 1000, 5).await;
        let placed = f
            .service
            .create_order(items_request(vec![OrderLine::new(mug, 2)]))
            .await
            .unwrap();

        let confirmed = f
            .service
            .confirm_order_payment(placed.order.id, payment("ch_1"))
            .await
            .unwrap();
        assert_eq!(confirmed.status, OrderStatus::Confirmed);
        assert_eq!(confirmed.payment_status, PaymentStatus::Completed);
        assert_eq!(confirmed.payment_reference.as_deref(), Some("ch_1"));
        assert_eq!(
            confirmed.payment_details.as_ref().and_then(|d| d.get_str("gateway")),
            Some("acme-pay")
        );
        let release = confirmed.escrow_release_date.unwrap();
        assert_eq!((release - confirmed.confirmed_at.unwrap()).num_days(), 7);

        let level = f.db.listings().stock_level(mug).await.unwrap();
        assert_eq!((level.on_hand, level.reserved, level.available), (3, 0, 3));
        let holds = f.service.order_reservations(placed.order.id).await.unwrap();
        assert!(holds.iter().all(|r| r.status == ReservationStatus::Committed));

        let again = f
            .service
            .confirm_order_payment(placed.order.id, payment("ch_2"))
            .await
            .unwrap_err();
        assert!(matches!(
            again.as_core(),
            Some(CoreError::PaymentNotPending { .. })
        ));
        assert_eq!(f.db.listings().stock_level(mug).await.unwrap().on_hand, 3);
    }

    #[tokio::test]
    async fn test_confirm_after_expiry_keeps_order_pending() {
        let f = fixture().await;
        let mug = listing(&f.db, 1, "MUG", 1000, 5).await;
        let placed = f
            .service
            .create_order(items_request(vec![OrderLine::new(mug, 2)]))
            .await
            .unwrap();

        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(f.db.reservations().expire_stale(later, 100).await.unwrap(), 1);

        let err = f
            .service
            .confirm_order_payment(placed.order.id, payment("ch_late"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.as_core(),
            Some(CoreError::PaymentWindowExpired { .. })
        ));
        assert_eq!(err.kind(), ErrorKind::Expired);

        let order = f.service.get_order(placed.order.id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.payment_status, PaymentStatus::Pending);
        assert!(order.payment_reference.is_none());
        assert_eq!(f.db.listings().stock_level(mug).await.unwrap().on_hand, 5);
    }

    #[tokio::test]
    async fn test_confirm_with_unrepresentable_escrow_is_refused() {
        let f = fixture().await;
        let mug = listing(&f.db, 1, "MUG", 1000, 5).await;
        let placed = f
            .service
            .create_order(items_request(vec![OrderLine::new(mug, 1)]))
            .await
            .unwrap();
        sqlx::query("UPDATE orders SET escrow_days = ? WHERE id = ?")
            .bind(1_000_000_000_000_i64)
            .bind(placed.order.id)
            .execute(f.db.pool())
            .await
            .unwrap();

        let err = f
            .service
            .confirm_order_payment(placed.order.id, payment("ch_far"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let order = f.service.get_order(placed.order.id).await.unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Pending);
        assert_eq!(available(&f.db, mug).await, 4);
    }

    #[tokio::test]
    async fn test_unbounded_escrow_config_refuses_checkout() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let finance = FinancialConfig::new(Rate::from_bps(2000), Rate::from_bps(1000), "USD")
            .with_escrow_days(1_000_000_000_000);
        let service = OrderService::new(db.clone(), finance, Arc::new(RecordingGateway::default()));
        let mug = listing(&db, 1, "MUG", 1000, 5).await;

        let err = service
            .create_order(items_request(vec![OrderLine::new(mug, 1)]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(available(&db, mug).await, 5);
    }

    #[tokio::test]
    async fn test_confirm_requires_transaction_ref() {
        let f = fixture().await;
        let err = f
            .service
            .confirm_order_payment(1, payment(" "))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = f.service.confirm_order_payment(404, payment("ch")).await.unwrap_err();
        assert!(matches!(err, CheckoutError::OrderNotFound(404)));
    }

    // -------------------------------------------------------------------------
    // Cancellation & Status
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_cancel_pending_releases_holds() {
        let f = fixture().await;
        let mug = listing(&f.db, 1, "MUG", 1000, 5).await;
        let placed = f
            .service
            .create_order(items_request(vec![OrderLine::new(mug, 4)]))
            .await
            .unwrap();
        assert_eq!(available(&f.db, mug).await, 1);

        let stranger = f
            .service
            .cancel_order(placed.order.id, BUYER + 1, None)
            .await
            .unwrap_err();
        assert!(matches!(
            stranger.as_core(),
            Some(CoreError::NotOrderOwner { .. })
        ));

        let cancelled = f
            .service
            .cancel_order(placed.order.id, BUYER, Some("ordered twice"))
            .await
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("ordered twice"));
        assert_eq!(available(&f.db, mug).await, 5);

        let holds = f.service.order_reservations(placed.order.id).await.unwrap();
        assert!(holds.iter().all(|r| r.status == ReservationStatus::Released));
        assert!(f.db.movements().list_for_listing(mug).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_confirmed_returns_stock() {
        let f = fixture().await;
        let mug = listing(&f.db, 1, "MUG", 1000, 5).await;
        let placed = f
            .service
            .create_order(items_request(vec![OrderLine::new(mug, 2)]))
            .await
            .unwrap();
        f.service
            .confirm_order_payment(placed.order.id, payment("ch_1"))
            .await
            .unwrap();
        assert_eq!(f.db.listings().stock_level(mug).await.unwrap().on_hand, 3);

        f.service
            .cancel_order(placed.order.id, BUYER, None)
            .await
            .unwrap();

        let level = f.db.listings().stock_level(mug).await.unwrap();
        assert_eq!((level.on_hand, level.available), (5, 5));

        let trail = f
            .db
            .movements()
            .list_by_reference(ReservationReference::Order(placed.order.id))
            .await
            .unwrap();
        let kinds: Vec<(MovementDirection, MovementReason)> =
            trail.iter().map(|m| (m.direction, m.reason)).collect();
        assert_eq!(
            kinds,
            vec![
                (MovementDirection::Out, MovementReason::OrderCommitted),
                (MovementDirection::In, MovementReason::OrderCancelled),
            ]
        );
        assert_eq!(trail[1].actor, format!("buyer:{}", BUYER));
    }

    #[tokio::test]
    async fn test_delivered_order_cannot_be_cancelled() {
        let f = fixture().await;
        let mug = listing(&f.db, 1, "MUG", 1000, 5).await;
        let placed = f
            .service
            .create_order(items_request(vec![OrderLine::new(mug, 1)]))
            .await
            .unwrap();
        let id = placed.order.id;
        f.service.confirm_order_payment(id, payment("ch_1")).await.unwrap();
        f.service.update_order_status(id, OrderStatus::Shipped).await.unwrap();
        let delivered = f
            .service
            .update_order_status(id, OrderStatus::Delivered)
            .await
            .unwrap();
        assert!(delivered.shipped_at.is_some());
        assert!(delivered.delivered_at.is_some());
        let before = f.db.listings().stock_level(mug).await.unwrap();

        let err = f.service.cancel_order(id, BUYER, None).await.unwrap_err();
        assert!(matches!(
            err.as_core(),
            Some(CoreError::OrderCannotCancel {
                status: OrderStatus::Delivered,
                ..
            })
        ));
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let after = f.service.get_order(id).await.unwrap();
        assert_eq!(after, delivered);
        assert_eq!(f.db.listings().stock_level(mug).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_update_status_follows_state_machine() {
        let f = fixture().await;
        let mug = listing(&f.db, 1, "MUG", 1000, 5).await;
        let placed = f
            .service
            .create_order(items_request(vec![OrderLine::new(mug, 3)]))
            .await
            .unwrap();
        let id = placed.order.id;

        for illegal in [OrderStatus::Shipped, OrderStatus::Delivered, OrderStatus::Confirmed] {
            let err = f.service.update_order_status(id, illegal).await.unwrap_err();
            assert!(matches!(
                err.as_core(),
                Some(CoreError::InvalidTransition { .. })
            ));
        }

        let cancelled = f
            .service
            .update_order_status(id, OrderStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(available(&f.db, mug).await, 5);

        let err = f
            .service
            .update_order_status(id, OrderStatus::Pending)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    // -------------------------------------------------------------------------
    // Refunds
    // -------------------------------------------------------------------------

    async fn paid_order(f: &Fixture) -> PlacedOrder {
        let mug = listing(&f.db, 1, "MUG", 1000, 5).await;
        let bowl = listing(&f.db, 1, "BOWL", 2000, 5).await;
        let placed = f
            .service
            .create_order(items_request(vec![OrderLine::new(mug, 2), OrderLine::new(bowl, 1)]))
            .await
            .unwrap();
        f.service
            .confirm_order_payment(placed.order.id, payment("ch_paid"))
            .await
            .unwrap();
        placed
    }

    #[tokio::test]
    async fn test_full_refund() {
        let f = fixture().await;
        let placed = paid_order(&f).await;

        let outcome = f
            .service
            .process_refund(placed.order.id, "damaged in transit")
            .await
            .unwrap();
        assert_eq!(outcome.amount, Money::from_cents(5300));
        assert_eq!(outcome.order.payment_status, PaymentStatus::Refunded);

        let requests = f.gateway.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].amount, Money::from_cents(5300));
        assert_eq!(requests[0].payment_reference.as_deref(), Some("ch_paid"));
        assert_eq!(requests[0].currency, "USD");

        let again = f
            .service
            .process_refund(placed.order.id, "again")
            .await
            .unwrap_err();
        assert!(matches!(
            again.as_core(),
            Some(CoreError::PaymentNotRefundable {
                payment_status: PaymentStatus::Refunded,
                ..
            })
        ));
        assert_eq!(f.gateway.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_refund_requires_completed_payment() {
        let f = fixture().await;
        let mug = listing(&f.db, 1, "MUG", 1000, 5).await;
        let placed = f
            .service
            .create_order(items_request(vec![OrderLine::new(mug, 1)]))
            .await
            .unwrap();

        let err = f
            .service
            .process_refund(placed.order.id, "not paid yet")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(f.gateway.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_refund() {
        let f = fixture().await;
        let placed = paid_order(&f).await;
        let mug_line = placed.items[0].id;

        let outcome = f
            .service
            .process_partial_refund(placed.order.id, &[mug_line], "one mug chipped")
            .await
            .unwrap();
        // 2 × $10 plus 20% tax; shipping and commission stay.
        assert_eq!(outcome.amount, Money::from_cents(2400));
        assert_eq!(outcome.order.payment_status, PaymentStatus::PartiallyRefunded);

        let dup = f
            .service
            .process_partial_refund(placed.order.id, &[mug_line, mug_line], "dup")
            .await
            .unwrap_err();
        assert_eq!(dup.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_partial_refund_unknown_item() {
        let f = fixture().await;
        let placed = paid_order(&f).await;

        let err = f
            .service
            .process_partial_refund(placed.order.id, &[placed.items[0].id, 9_999], "mixup")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(f.gateway.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_declined_refund_leaves_payment_completed() {
        let f = fixture_with(RecordingGateway {
            decline: AtomicBool::new(true),
            ..Default::default()
        })
        .await;
        let placed = paid_order(&f).await;

        let err = f
            .service
            .process_refund(placed.order.id, "changed mind")
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::Gateway { retryable: false, .. }));

        let order = f.service.get_order(placed.order.id).await.unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Completed);

        // The declined attempt gives up its claim.
        f.gateway.decline.store(false, Ordering::SeqCst);
        let outcome = f
            .service
            .process_refund(placed.order.id, "changed mind")
            .await
            .unwrap();
        assert_eq!(outcome.order.payment_status, PaymentStatus::Refunded);
    }

    #[tokio::test]
    async fn test_claimed_refund_is_not_forwarded_again() {
        let f = fixture().await;
        let placed = paid_order(&f).await;
        let order_id = placed.order.id;

        let key = refund_idempotency_key(order_id, "full");
        let now = Utc::now();
        let mut tx = f.db.pool().begin().await.unwrap();
        assert!(OrderRepository::claim_refund(&mut tx, order_id, &key.to_string(), now, now)
            .await
            .unwrap());
        tx.commit().await.unwrap();

        let err = f.service.process_refund(order_id, "retry").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(matches!(
            err,
            CheckoutError::RefundInProgress { idempotency_key, .. } if idempotency_key == key
        ));
        let partial = f
            .service
            .process_partial_refund(order_id, &[placed.items[0].id], "retry")
            .await
            .unwrap_err();
        assert!(matches!(partial, CheckoutError::RefundInProgress { .. }));
        assert!(f.gateway.requests.lock().unwrap().is_empty());

        let order = f.service.get_order(order_id).await.unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Completed);
    }

    #[test]
    fn test_refund_key_is_stable_per_order_and_items() {
        assert_eq!(refund_idempotency_key(7, "full"), refund_idempotency_key(7, "full"));
        assert_ne!(refund_idempotency_key(7, "full"), refund_idempotency_key(8, "full"));
        assert_ne!(
            refund_idempotency_key(7, "full"),
            refund_idempotency_key(7, "items:1,2")
        );
    }

    #[tokio::test]
    async fn test_partial_refund_key_ignores_item_order() {
        let f = fixture().await;
        let placed = paid_order(&f).await;
        let (mug, bowl) = (placed.items[0].id, placed.items[1].id);

        f.service
            .process_partial_refund(placed.order.id, &[bowl, mug], "both chipped")
            .await
            .unwrap();

        let requests = f.gateway.requests.lock().unwrap().clone();
        let scope = format!("items:{},{}", mug.min(bowl), mug.max(bowl));
        assert_eq!(
            requests[0].idempotency_key,
            refund_idempotency_key(placed.order.id, &scope)
        );
    }

    #[tokio::test]
    async fn test_reads() {
        let f = fixture().await;
        let placed = paid_order(&f).await;

        let items = f.service.get_order_items(placed.order.id).await.unwrap();
        assert_eq!(items, placed.items);
        assert!(matches!(
            f.service.get_order_items(12_345).await,
            Err(CheckoutError::OrderNotFound(12_345))
        ));
        assert!(f.service.order_reservations(12_345).await.unwrap().is_empty());
    }
}
