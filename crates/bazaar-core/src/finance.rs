//! # Financial Calculator
//!
//! Pure, deterministic monetary derivation for orders.
//!
//! ## Order Totals
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Order Financials                                  │
//! │                                                                         │
//! │  line:   subtotal = qty × unit_price                                   │
//! │          discount = subtotal × line_rate        (0 unless 0% < r ≤ 100%)│
//! │          total    = subtotal − discount                                 │
//! │                                                                         │
//! │  order:  subtotal = Σ line.total                                        │
//! │          tax      = subtotal × tax_rate                                 │
//! │          discount = clamp(discount_amount, 0, subtotal)                 │
//! │          total    = max(0, subtotal + tax + shipping − discount)        │
//! │          commission    = min(subtotal × commission_rate, total)         │
//! │          seller_amount = total − commission                             │
//! │                                                                         │
//! │  Every product with a rate rounds half-up to a whole cent once, so     │
//! │  no unrounded value ever leaves this module.                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::money::{Money, Rate};
use crate::types::{Order, OrderItem};
use crate::validation::validate_escrow_days;
use crate::DEFAULT_ESCROW_DAYS;

// =============================================================================
// Configuration
// =============================================================================

/// Platform-wide rates applied to every order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialConfig {
    pub tax_rate: Rate,
    pub commission_rate: Rate,
    /// ISO 4217 code.
    pub currency: String,
    /// Days seller funds are held after payment confirmation.
    pub escrow_days: i64,
}

impl FinancialConfig {
    pub fn new(tax_rate: Rate, commission_rate: Rate, currency: impl Into<String>) -> Self {
        FinancialConfig {
            tax_rate,
            commission_rate,
            currency: currency.into(),
            escrow_days: DEFAULT_ESCROW_DAYS,
        }
    }

    pub fn with_escrow_days(mut self, days: i64) -> Self {
        self.escrow_days = days;
        self
    }
}

impl Default for FinancialConfig {
    fn default() -> Self {
        FinancialConfig::new(Rate::zero(), Rate::zero(), "USD")
    }
}

// =============================================================================
// Line Financials
// =============================================================================

/// Money for one order line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFinancials {
    pub subtotal: Money,
    pub discount: Money,
    pub total: Money,
}

/// Computes a line's subtotal, discount and total.
///
/// A discount rate outside (0%, 100%] is ignored.
///
/// ## Example
/// ```rust
/// use bazaar_core::finance::item_financials;
/// use bazaar_core::money::{Money, Rate};
///
/// let line = item_financials(3, Money::from_cents(1000), Rate::from_bps(1000));
/// assert_eq!(line.subtotal.cents(), 3000);
/// assert_eq!(line.discount.cents(), 300);
/// assert_eq!(line.total.cents(), 2700);
/// ```
pub fn item_financials(quantity: i64, unit_price: Money, discount_rate: Rate) -> ItemFinancials {
    let subtotal = unit_price.multiply_quantity(quantity);
    let discount = if discount_rate.is_valid_discount() {
        subtotal.apply_rate(discount_rate)
    } else {
        Money::zero()
    };

    ItemFinancials {
        subtotal,
        discount,
        total: subtotal - discount,
    }
}

// =============================================================================
// Order Financials
// =============================================================================

/// Money for a whole order, ready to persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFinancials {
    pub subtotal: Money,
    pub tax: Money,
    pub shipping: Money,
    /// Order-level discount after clamping.
    pub discount: Money,
    pub total: Money,
    pub commission: Money,
    pub seller_amount: Money,
    pub currency: String,
    pub escrow_days: i64,
}

impl OrderFinancials {
    /// Checks the order invariants:
    /// `total == max(0, subtotal + tax + shipping − discount)` and
    /// `commission + seller_amount == total` whenever `total > 0`.
    pub fn verify(&self) -> CoreResult<()> {
        check_invariants(
            self.subtotal,
            self.tax,
            self.shipping,
            self.discount,
            self.total,
            self.commission,
            self.seller_amount,
        )
    }
}

fn check_invariants(
    subtotal: Money,
    tax: Money,
    shipping: Money,
    discount: Money,
    total: Money,
    commission: Money,
    seller_amount: Money,
) -> CoreResult<()> {
    let expected = (subtotal + tax + shipping - discount).non_negative();
    if total != expected {
        return Err(CoreError::FinancialInvariant(format!(
            "total {} does not equal subtotal {} + tax {} + shipping {} - discount {}",
            total, subtotal, tax, shipping, discount
        )));
    }
    if total.is_positive() && commission + seller_amount != total {
        return Err(CoreError::FinancialInvariant(format!(
            "commission {} + seller amount {} does not equal total {}",
            commission, seller_amount, total
        )));
    }
    if commission.is_negative() || seller_amount.is_negative() {
        return Err(CoreError::FinancialInvariant(
            "commission and seller amount must not be negative".to_string(),
        ));
    }
    Ok(())
}

/// Derives order money from its lines.
///
/// ## Errors
/// - `Validation(Required { field: "items" })` for an empty line list
/// - `Validation(MustNotBeNegative)` for a negative shipping cost
///
/// ## Example
/// ```rust
/// use bazaar_core::finance::{item_financials, order_financials, FinancialConfig};
/// use bazaar_core::money::{Money, Rate};
///
/// let config = FinancialConfig::new(Rate::from_bps(2000), Rate::from_bps(1000), "USD");
/// let items = [
///     item_financials(2, Money::from_cents(1000), Rate::zero()),
///     item_financials(1, Money::from_cents(2000), Rate::zero()),
/// ];
/// let order = order_financials(&items, Money::from_cents(500), Money::zero(), &config).unwrap();
///
/// assert_eq!(order.subtotal.cents(), 4000);
/// assert_eq!(order.tax.cents(), 800);
/// assert_eq!(order.total.cents(), 5300);
/// assert_eq!(order.commission.cents(), 400);
/// assert_eq!(order.seller_amount.cents(), 4900);
/// ```
pub fn order_financials(
    items: &[ItemFinancials],
    shipping: Money,
    discount_amount: Money,
    config: &FinancialConfig,
) -> CoreResult<OrderFinancials> {
    if items.is_empty() {
        return Err(ValidationError::required("items").into());
    }
    if shipping.is_negative() {
        return Err(ValidationError::MustNotBeNegative {
            field: "shipping".to_string(),
        }
        .into());
    }
    validate_escrow_days(config.escrow_days)?;

    let subtotal: Money = items.iter().map(|i| i.total).sum();
    let tax = subtotal.apply_rate(config.tax_rate);
    let discount = discount_amount.non_negative().min(subtotal.non_negative());
    let total = (subtotal + tax + shipping - discount).non_negative();
    let commission = subtotal.apply_rate(config.commission_rate).non_negative().min(total);
    let seller_amount = (total - commission).non_negative();

    let financials = OrderFinancials {
        subtotal,
        tax,
        shipping,
        discount,
        total,
        commission,
        seller_amount,
        currency: config.currency.clone(),
        escrow_days: config.escrow_days,
    };
    financials.verify()?;
    Ok(financials)
}

/// Re-checks the invariants on a persisted order.
pub fn verify_order(order: &Order) -> CoreResult<()> {
    check_invariants(
        order.subtotal(),
        Money::from_cents(order.tax_cents),
        Money::from_cents(order.shipping_cents),
        Money::from_cents(order.discount_cents),
        order.total(),
        order.commission(),
        order.seller_amount(),
    )
}

// =============================================================================
// Refunds
// =============================================================================

/// Full refund: the buyer gets back exactly what was charged.
pub fn refund_amount(order: &Order) -> Money {
    order.total()
}

/// Refund for a subset of lines: their totals plus the tax charged on them.
///
/// Shipping and commission are not refunded.
pub fn partial_refund(items: &[OrderItem], config: &FinancialConfig) -> Money {
    let subtotal: Money = items.iter().map(OrderItem::total).sum();
    subtotal + subtotal.apply_rate(config.tax_rate)
}

// =============================================================================
// Unit Tests
// =============================================================================
