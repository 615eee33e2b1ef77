//! Fixed-precision quantities.
//!
//! Balances are `rust_decimal::Decimal`. Inputs carrying more fractional digits than the
//! configured scale are rejected, never rounded. Every amount, stored or computed,
//! stays below [`max_quantity`] so it fits a `NUMERIC(20, 6)` column.

use crate::error::ValidationError;

pub type Quantity = rust_decimal::Decimal;

/// Most fractional digits a stored quantity can carry
pub const MAX_SCALE: u32 = 6;

/// Exclusive upper bound on any quantity or balance magnitude
pub fn max_quantity() -> Quantity {
    Quantity::new(100_000_000_000_000, 0)
}

/// `balance + delta`, refused when the sum overflows or leaves the storable range
pub fn checked_sum(balance: Quantity, delta: Quantity) -> Result<Quantity, ValidationError> {
    balance
        .checked_add(delta)
        .filter(|sum| sum.abs() < max_quantity())
        .ok_or(ValidationError::QuantityTooLarge)
}

/// Accepts `quantity > 0` with at most `scale` fractional digits
pub fn positive(quantity: Quantity, scale: u32) -> Result<Quantity, ValidationError> {
    if quantity <= Quantity::ZERO {
        return Err(ValidationError::NonPositiveQuantity);
    }
    within_scale(quantity, scale)
}

/// Accepts `quantity >= 0` with at most `scale` fractional digits
pub fn non_negative(quantity: Quantity, scale: u32) -> Result<Quantity, ValidationError> {
    if quantity < Quantity::ZERO {
        return Err(ValidationError::NegativeQuantity);
    }
    within_scale(quantity, scale)
}

fn within_scale(quantity: Quantity, scale: u32) -> Result<Quantity, ValidationError> {
    if quantity.abs() >= max_quantity() {
        return Err(ValidationError::QuantityTooLarge);
    }
    let scale = scale.min(MAX_SCALE);
    let normalized = quantity.normalize();
    if normalized.scale() > scale {
        return Err(ValidationError::ExcessPrecision { scale });
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn q(s: &str) -> Quantity {
        Quantity::from_str(s).unwrap()
    }

    #[test]
    fn test_positive_rejects_zero_and_negative() {
        assert_eq!(positive(q("0"), 3), Err(ValidationError::NonPositiveQuantity));
        assert_eq!(positive(q("-1"), 3), Err(ValidationError::NonPositiveQuantity));
        assert_eq!(positive(q("0.5"), 3), Ok(q("0.5")));
    }

    #[test]
    fn test_scale_is_enforced_after_normalizing() {
        assert_eq!(positive(q("1.2500"), 3), Ok(q("1.25")));
        assert_eq!(
            positive(q("1.2345"), 3),
            Err(ValidationError::ExcessPrecision { scale: 3 })
        );
    }

    #[test]
    fn test_non_negative_accepts_zero() {
        assert_eq!(non_negative(q("0"), 3), Ok(Quantity::ZERO));
        assert_eq!(non_negative(q("-0.001"), 3), Err(ValidationError::NegativeQuantity));
    }

    #[test]
    fn test_quantity_below_bound_is_accepted() {
        assert_eq!(positive(q("99999999999999.5"), 3), Ok(q("99999999999999.5")));
        assert_eq!(positive(q("100000000000000"), 3), Err(ValidationError::QuantityTooLarge));
        assert_eq!(
            non_negative(Quantity::MAX, 3),
            Err(ValidationError::QuantityTooLarge)
        );
    }

    #[test]
    fn test_scale_never_exceeds_storable_digits() {
        assert_eq!(positive(q("0.000001"), 10), Ok(q("0.000001")));
        assert_eq!(
            positive(q("0.0000001"), 10),
            Err(ValidationError::ExcessPrecision { scale: MAX_SCALE })
        );
    }

    #[test]
    fn test_checked_sum_refuses_out_of_range_results() {
        assert_eq!(checked_sum(q("10"), q("-4")), Ok(q("6")));
        assert_eq!(
            checked_sum(q("99999999999999"), q("1")),
            Err(ValidationError::QuantityTooLarge)
        );
        assert_eq!(
            checked_sum(Quantity::MAX, Quantity::MAX),
            Err(ValidationError::QuantityTooLarge)
        );
    }
}
