//! Shared fixtures for checkout integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bazaar_checkout::{
    CheckoutResult, CreateOrderRequest, OrderLine, OrderService, OrderSource, PaymentConfirmation,
    PaymentGateway, RefundReceipt, RefundRequest,
};
use bazaar_core::finance::FinancialConfig;
use bazaar_core::{Address, Document, Money, Rate};
use bazaar_db::{Database, DbConfig, NewListing};
use uuid::Uuid;

/// Accepts every refund and counts them.
#[derive(Default)]
pub struct AcceptingGateway {
    pub refunds: AtomicUsize,
}

#[async_trait]
impl PaymentGateway for AcceptingGateway {
    async fn request_refund(&self, request: RefundRequest) -> CheckoutResult<RefundReceipt> {
        self.refunds.fetch_add(1, Ordering::SeqCst);
        Ok(RefundReceipt {
            refund_reference: format!("re_{}", request.idempotency_key.simple()),
            amount: request.amount,
        })
    }
}

/// Takes its time before accepting, so overlapping refunds meet in flight.
pub struct SlowGateway {
    pub refunds: AtomicUsize,
    delay: Duration,
}

impl SlowGateway {
    pub fn new(delay: Duration) -> Self {
        SlowGateway {
            refunds: AtomicUsize::new(0),
            delay,
        }
    }
}

#[async_trait]
impl PaymentGateway for SlowGateway {
    async fn request_refund(&self, request: RefundRequest) -> CheckoutResult<RefundReceipt> {
        self.refunds.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(RefundReceipt {
            refund_reference: format!("re_{}", request.idempotency_key.simple()),
            amount: request.amount,
        })
    }
}

/// A file-backed database in the temp dir; concurrent tests need more than
/// the single connection an in-memory database allows.
pub struct ScratchDb {
    pub db: Database,
    path: PathBuf,
}

impl ScratchDb {
    pub async fn new() -> Self {
        let path = std::env::temp_dir().join(format!("bazaar-test-{}.db", Uuid::new_v4()));
        let db = Database::new(DbConfig::new(&path).max_connections(8))
            .await
            .unwrap();
        ScratchDb { db, path }
    }
}

impl Drop for ScratchDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            let _ = std::fs::remove_file(file);
        }
    }
}

pub async fn memory_db() -> Database {
    Database::new(DbConfig::in_memory()).await.unwrap()
}

pub fn service(db: &Database) -> (OrderService, Arc<AcceptingGateway>) {
    let gateway = Arc::new(AcceptingGateway::default());
    (service_with(db, gateway.clone()), gateway)
}

pub fn service_with<G: PaymentGateway + 'static>(db: &Database, gateway: Arc<G>) -> OrderService {
    let finance = FinancialConfig::new(Rate::from_bps(2000), Rate::from_bps(1000), "USD");
    OrderService::new(db.clone(), finance, gateway)
}

pub async fn listing(db: &Database, storefront_id: i64, sku: &str, price_cents: i64, stock: i64) -> i64 {
    db.listings()
        .insert(&NewListing::new(storefront_id, sku, sku, price_cents, stock))
        .await
        .unwrap()
        .id
}

pub fn address() -> Address {
    Address {
        recipient: "Tomas Ortega".to_string(),
        line1: "9 Harbour Rd".to_string(),
        city: "Valparaíso".to_string(),
        postal_code: "2340000".to_string(),
        country: "CL".to_string(),
        ..Default::default()
    }
}

pub fn order_for(buyer_id: i64, lines: Vec<OrderLine>) -> CreateOrderRequest {
    let mut request = CreateOrderRequest::new(Some(buyer_id), OrderSource::Items(lines), address());
    request.shipping = Money::from_cents(500);
    request
}

pub fn payment(reference: &str) -> PaymentConfirmation {
    PaymentConfirmation {
        transaction_ref: reference.to_string(),
        gateway_payload: Document::new().with("status", "succeeded"),
    }
}
