//! Decimal arithmetic for calculations and aggregates.
//!
//! JSON numbers are converted to `rust_decimal::Decimal` through their
//! shortest textual form, so `2.03` is exactly 2.03. Rounding uses
//! `RoundingStrategy::MidpointNearestEven`. Results leave the engine as
//! JSON floats.

use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::{Number, Value};

use carbonmap_rules::Operator;

/// Convert a JSON number to a Decimal. Non-numbers yield `None`.
pub fn to_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => number_to_decimal(n),
        _ => None,
    }
}

fn number_to_decimal(n: &Number) -> Option<Decimal> {
    if let Some(i) = n.as_i64() {
        return Some(Decimal::from(i));
    }
    if let Some(u) = n.as_u64() {
        return Some(Decimal::from(u));
    }
    let text = n.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// Round to `dp` decimal places, ties to even.
pub fn round(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::MidpointNearestEven)
}

/// Apply one formula operator with overflow checking.
pub fn apply(op: Operator, left: Decimal, right: Decimal) -> Option<Decimal> {
    match op {
        Operator::Mul => left.checked_mul(right),
        Operator::Add => left.checked_add(right),
    }
}

/// Render a Decimal as a JSON float (`6250` becomes `6250.0`).
pub fn to_json_float(value: Decimal) -> Value {
    value
        .normalize()
        .to_string()
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Equality that treats `1` and `1.0` as the same number.
pub fn json_eq(a: &Value, b: &Value) -> bool {
    match (to_decimal(a), to_decimal(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn converts_integers_and_floats() {
        assert_eq!(to_decimal(&json!(12500)), Some(dec("12500")));
        assert_eq!(to_decimal(&json!(2.03)), Some(dec("2.03")));
        assert_eq!(to_decimal(&json!(1e3)), Some(dec("1000")));
        assert_eq!(to_decimal(&json!("12")), None);
    }

    #[test]
    fn product_is_exact() {
        let product = apply(Operator::Mul, dec("850"), dec("2.03")).unwrap();
        assert_eq!(product, dec("1725.5"));
        assert_eq!(to_json_float(product), json!(1725.5));
    }

    #[test]
    fn rounding_ties_to_even() {
        assert_eq!(round(dec("0.125"), 2), dec("0.12"));
        assert_eq!(round(dec("0.135"), 2), dec("0.14"));
        assert_eq!(round(dec("2.5"), 0), dec("2"));
        assert_eq!(round(dec("3.5"), 0), dec("4"));
    }

    #[test]
    fn whole_numbers_render_as_floats() {
        assert_eq!(to_json_float(dec("6250.00")), json!(6250.0));
        assert_eq!(to_json_float(Decimal::ZERO), json!(0.0));
    }

    #[test]
    fn overflow_is_none() {
        assert_eq!(apply(Operator::Mul, Decimal::MAX, dec("2")), None);
    }

    #[test]
    fn numeric_equality_ignores_representation() {
        assert!(json_eq(&json!(1), &json!(1.0)));
        assert!(json_eq(&json!("a"), &json!("a")));
        assert!(!json_eq(&json!(1), &json!("1")));
    }
}
