// src/utils/precision.rs
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

/// Rounds a quantity DOWN to the nearest multiple of `step_size`.
/// Example: amount=10.999, step=1.0 -> 10.0
pub fn normalize_quantity(amount: Decimal, step_size: Decimal) -> Decimal {
    if step_size.is_zero() {
        return amount;
    }
    ((amount / step_size).floor() * step_size).normalize()
}

/// Converts an advisor quantity to an order quantity. Negative, NaN and
/// infinite inputs map to zero.
pub fn order_quantity(amount: f64, step_size: Decimal) -> Decimal {
    if !amount.is_finite() || amount <= 0.0 {
        return Decimal::ZERO;
    }
    Decimal::from_f64(amount)
        .map(|qty| normalize_quantity(qty, step_size))
        .unwrap_or(Decimal::ZERO)
}
