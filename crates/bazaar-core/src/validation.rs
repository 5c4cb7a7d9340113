//! # Validation Module
//!
//! Input checks run by the orchestrator before any row is touched.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Layer 1: THIS MODULE                                                   │
//! │  ├── Quantities, line counts, addresses, money inputs                  │
//! │  └── Rejected with ValidationError, nothing mutated                    │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Database (SQLite)                                            │
//! │  ├── CHECK constraints (quantity > 0, stock >= 0)                      │
//! │  └── Foreign key / UNIQUE constraints                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use bazaar_core::validation::{validate_quantity, clamp_reservation_ttl};
//!
//! validate_quantity(5).unwrap();
//! assert!(validate_quantity(0).is_err());
//! assert_eq!(clamp_reservation_ttl(None), 900);
//! ```

use crate::error::ValidationError;
use crate::money::{Money, Rate};
use crate::types::Address;
use crate::{
    DEFAULT_RESERVATION_TTL_SECS, MAX_ESCROW_DAYS, MAX_ITEM_QUANTITY, MAX_ORDER_ITEMS,
    MAX_RESERVATION_TTL_SECS,
};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a line quantity.
///
/// ## Rules
/// - Must be at least 1
/// - Must not exceed MAX_ITEM_QUANTITY (999)
pub fn validate_quantity(quantity: i64) -> ValidationResult<()> {
    if quantity <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if quantity > MAX_ITEM_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_ITEM_QUANTITY,
        });
    }

    Ok(())
}

/// Validates the number of lines in an order.
pub fn validate_item_count(count: usize) -> ValidationResult<()> {
    if count == 0 {
        return Err(ValidationError::required("items"));
    }

    if count > MAX_ORDER_ITEMS {
        return Err(ValidationError::OutOfRange {
            field: "items".to_string(),
            min: 1,
            max: MAX_ORDER_ITEMS as i64,
        });
    }

    Ok(())
}

/// Rejects negative amounts (shipping, order discount).
pub fn validate_non_negative_money(field: &str, amount: Money) -> ValidationResult<()> {
    if amount.is_negative() {
        return Err(ValidationError::MustNotBeNegative {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Validates a configured rate (tax or commission): 0% to 100%.
pub fn validate_rate(field: &str, rate: Rate) -> ValidationResult<()> {
    if rate.bps() > Rate::FULL_BPS {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min: 0,
            max: Rate::FULL_BPS as i64,
        });
    }
    Ok(())
}

/// Escrow holds run from zero days up to ten years.
pub fn validate_escrow_days(days: i64) -> ValidationResult<()> {
    if !(0..=MAX_ESCROW_DAYS).contains(&days) {
        return Err(ValidationError::OutOfRange {
            field: "escrow_days".to_string(),
            min: 0,
            max: MAX_ESCROW_DAYS,
        });
    }
    Ok(())
}

/// Resolves a requested hold length in seconds.
///
/// `None` or a non-positive value gives the 15 minute default; anything
/// longer than 24 hours is capped.
pub fn clamp_reservation_ttl(requested_secs: Option<i64>) -> i64 {
    match requested_secs {
        Some(secs) if secs > 0 => secs.min(MAX_RESERVATION_TTL_SECS),
        _ => DEFAULT_RESERVATION_TTL_SECS,
    }
}

// =============================================================================
// String Validators
// =============================================================================

fn require_text(field: &str, value: &str, max: usize) -> ValidationResult<()> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::required(field));
    }
    if value.chars().count() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        });
    }
    Ok(())
}

/// Validates a postal address.
///
/// ## Rules
/// - recipient, line1, city and postal_code are required
/// - country is a two-letter ISO code
///
/// ## Example
/// ```rust
/// use bazaar_core::types::Address;
/// use bazaar_core::validation::validate_address;
///
/// let address = Address {
///     recipient: "Ada Lovelace".into(),
///     line1: "12 Analytical Way".into(),
///     city: "London".into(),
///     postal_code: "N1 9GU".into(),
///     country: "GB".into(),
///     ..Default::default()
/// };
/// assert!(validate_address("shipping_address", &address).is_ok());
/// ```
pub fn validate_address(field: &str, address: &Address) -> ValidationResult<()> {
    require_text(&format!("{}.recipient", field), &address.recipient, 200)?;
    require_text(&format!("{}.line1", field), &address.line1, 200)?;
    require_text(&format!("{}.city", field), &address.city, 100)?;
    require_text(&format!("{}.postal_code", field), &address.postal_code, 20)?;

    let country = address.country.trim();
    if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ValidationError::InvalidFormat {
            field: format!("{}.country", field),
            reason: "must be a two-letter ISO 3166-1 code".to_string(),
        });
    }

    Ok(())
}

/// Validates a free-text note (customer notes, cancellation reason).
pub fn validate_note(field: &str, note: Option<&str>) -> ValidationResult<()> {
    match note {
        Some(text) if text.chars().count() > 1000 => Err(ValidationError::TooLong {
            field: field.to_string(),
            max: 1000,
        }),
        _ => Ok(()),
    }
}

/// Validates an ISO 4217 currency code.
pub fn validate_currency(code: &str) -> ValidationResult<()> {
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(ValidationError::InvalidFormat {
            field: "currency".to_string(),
            reason: "must be a three-letter uppercase ISO 4217 code".to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
