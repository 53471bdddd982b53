//! Exact money conversions
//!
//! Engines report amounts as float literals, hex integers or atomic-unit
//! integers. Everything is converted into [`Decimal`] in the human unit here,
//! and converted back into whole atomic units right before a payment.

use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

use crate::error::{Error, Result};

lazy_static::lazy_static! {
    /// "<amount> <unit>" as printed by Electrum ("3.14 BTC", "-0.0 BTC")
    static ref VALUE_WITH_UNIT: Regex =
        Regex::new(r"^\s*([+-]?(?:\d+\.?\d*|\.\d+))\s+([A-Za-z]+)\s*$").expect("Invalid value regex");

    /// Unsigned plain decimal: digits, optionally a point and more digits
    static ref PLAIN_DECIMAL: Regex = Regex::new(r"^[0-9]+(\.[0-9]+)?$").expect("Invalid amount regex");
}

/// Smallest indivisible amount of a currency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicUnit {
    pub name: &'static str,
    /// Number of decimal places between the human unit and the atomic unit
    pub decimals: u32,
}

pub const SATOSHI: AtomicUnit = AtomicUnit {
    name: "satoshi",
    decimals: 8,
};

pub const PICONERO: AtomicUnit = AtomicUnit {
    name: "piconero",
    decimals: 12,
};

pub const WEI: AtomicUnit = AtomicUnit {
    name: "wei",
    decimals: 18,
};

impl AtomicUnit {
    /// Atomic units in one human unit (10^decimals)
    pub fn per_coin(&self) -> Decimal {
        Decimal::from_i128_with_scale(10i128.pow(self.decimals), 0)
    }
}

/// Convert a float through its shortest decimal representation
///
/// `0.3_f64` becomes exactly `0.3`, not the binary expansion
/// `0.299999999999999988897769753748434595763683319091796875`.
pub fn inexact_to_decimal(value: f64) -> Result<Decimal> {
    if !value.is_finite() {
        return Err(Error::MalformedResponse(format!(
            "non-finite amount {}",
            value
        )));
    }
    Decimal::from_str(&value.to_string())
        .map_err(|e| Error::MalformedResponse(format!("amount {} out of range: {}", value, e)))
}

/// Read a human-unit amount from a JSON string or number
pub fn decimal_from_json(value: &Value) -> Result<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s.trim())
            .map_err(|e| Error::MalformedResponse(format!("bad amount {:?}: {}", s, e))),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Decimal::from(i))
            } else if let Some(u) = n.as_u64() {
                Ok(Decimal::from(u))
            } else {
                let f = n
                    .as_f64()
                    .ok_or_else(|| Error::MalformedResponse(format!("bad amount {}", n)))?;
                inexact_to_decimal(f)
            }
        }
        other => Err(Error::MalformedResponse(format!(
            "expected amount, got {}",
            other
        ))),
    }
}

/// Parse user-supplied amount text; only plain decimal literals are accepted
pub fn parse_amount(text: &str) -> Result<Decimal> {
    let trimmed = text.trim();
    if !PLAIN_DECIMAL.is_match(trimmed) {
        return Err(Error::InvalidAmountType(text.to_string()));
    }
    Decimal::from_str_exact(trimmed).map_err(|_| Error::InvalidAmountType(text.to_string()))
}

/// Parse Electrum style "<amount> <unit>", requiring the expected unit
pub fn parse_value_with_unit(text: &str, expected_unit: &str) -> Result<Decimal> {
    let caps = VALUE_WITH_UNIT
        .captures(text)
        .ok_or_else(|| Error::MalformedResponse(format!("bad value {:?}", text)))?;

    if &caps[2] != expected_unit {
        return Err(Error::MalformedResponse(format!(
            "expected {} value, got {:?}",
            expected_unit, text
        )));
    }

    Decimal::from_str(&caps[1])
        .map_err(|e| Error::MalformedResponse(format!("bad value {:?}: {}", text, e)))
}

/// Convert a human-unit amount into whole atomic units
///
/// Fails with `NonIntegerUnitConversion` when the amount has more decimal
/// places than the unit can express.
pub fn to_atomic(amount: Decimal, unit: AtomicUnit) -> Result<u128> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(Error::InvalidAmount(format!(
            "negative amount {} cannot be expressed in {}",
            amount, unit.name
        )));
    }

    let normalized = amount.normalize();
    if normalized.scale() > unit.decimals {
        return Err(Error::NonIntegerUnitConversion {
            amount: amount.to_string(),
            unit: unit.name,
        });
    }

    let shift = 10i128.pow(unit.decimals - normalized.scale());
    let atoms = normalized
        .mantissa()
        .checked_mul(shift)
        .ok_or_else(|| Error::InvalidAmount(format!("{} overflows {}", amount, unit.name)))?;

    // -0 normalizes to a zero mantissa
    Ok(atoms.unsigned_abs())
}

/// Convert whole atomic units into a human-unit amount
pub fn from_atomic(atoms: u128, unit: AtomicUnit) -> Result<Decimal> {
    let mantissa = i128::try_from(atoms)
        .map_err(|_| Error::MalformedResponse(format!("{} {} out of range", atoms, unit.name)))?;
    Decimal::try_from_i128_with_scale(mantissa, unit.decimals)
        .map(|d| d.normalize())
        .map_err(|e| Error::MalformedResponse(format!("{} {}: {}", atoms, unit.name, e)))
}

/// Read an atomic-unit integer from JSON (number or numeric string)
pub fn atomic_from_json(value: &Value, unit: AtomicUnit) -> Result<Decimal> {
    let atoms = match value {
        Value::Number(n) => n.as_u64().map(u128::from),
        Value::String(s) => s.trim().parse::<u128>().ok(),
        _ => None,
    }
    .ok_or_else(|| Error::MalformedResponse(format!("expected {} integer, got {}", unit.name, value)))?;

    from_atomic(atoms, unit)
}

pub fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

/// Parse a 0x-prefixed hex quantity ("0x0" and "0x" are zero)
pub fn parse_hex_u128(s: &str) -> Result<u128> {
    let digits = strip_0x(s.trim());
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| Error::MalformedResponse(format!("bad hex quantity {:?}: {}", s, e)))
}

pub fn parse_hex_u64(s: &str) -> Result<u64> {
    let value = parse_hex_u128(s)?;
    u64::try_from(value).map_err(|_| Error::MalformedResponse(format!("hex {:?} exceeds u64", s)))
}

pub fn to_hex(value: u128) -> String {
    format!("0x{:x}", value)
}

/// Hex atomic units (e.g. wei) to a human-unit amount
pub fn from_hex_atomic(hex: &str, unit: AtomicUnit) -> Result<Decimal> {
    from_atomic(parse_hex_u128(hex)?, unit)
}

/// Human-unit amount to hex atomic units
pub fn to_hex_atomic(amount: Decimal, unit: AtomicUnit) -> Result<String> {
    Ok(to_hex(to_atomic(amount, unit)?))
}

/// Round a fractional atomic amount up to the next whole unit
pub fn ceil_atomic(atoms: Decimal) -> Result<u128> {
    atoms
        .ceil()
        .to_u128()
        .ok_or_else(|| Error::MalformedResponse(format!("{} is not a valid unit count", atoms)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_inexact_float_goes_through_shortest_repr() {
        assert_eq!(inexact_to_decimal(0.3).unwrap(), dec("0.3"));
        assert_eq!(inexact_to_decimal(0.1 + 0.2).unwrap(), dec("0.30000000000000004"));
        assert_eq!(inexact_to_decimal(0.00000001).unwrap(), dec("0.00000001"));
        assert!(inexact_to_decimal(f64::NAN).is_err());
    }

    #[test]
    fn test_atomic_round_trip_is_exact() {
        for text in ["3.14", "0.00000001", "20999999.97690000", "0"] {
            let amount = dec(text);
            let atoms = to_atomic(amount, SATOSHI).unwrap();
            assert_eq!(from_atomic(atoms, SATOSHI).unwrap(), amount);
        }

        let wei = dec("1.000000000000000001");
        assert_eq!(to_atomic(wei, WEI).unwrap(), 1_000_000_000_000_000_001);
        assert_eq!(from_atomic(1_000_000_000_000_000_001, WEI).unwrap(), wei);
    }

    #[test]
    fn test_sub_atomic_amount_is_rejected() {
        let err = to_atomic(dec("0.000000001"), SATOSHI).unwrap_err();
        assert!(matches!(
            err,
            Error::NonIntegerUnitConversion { unit: "satoshi", .. }
        ));
        // Trailing zeros beyond the unit are fine
        assert_eq!(to_atomic(dec("1.0000000000000"), SATOSHI).unwrap(), 100_000_000);
    }

    #[test]
    fn test_negative_amounts_are_rejected() {
        assert!(matches!(
            to_atomic(dec("-1"), PICONERO),
            Err(Error::InvalidAmount(_))
        ));
        assert_eq!(to_atomic(dec("-0.0"), PICONERO).unwrap(), 0);
    }

    #[test]
    fn test_hex_wei() {
        assert_eq!(from_hex_atomic("0x0", WEI).unwrap(), Decimal::ZERO);
        assert_eq!(
            from_hex_atomic("0xde0b6b3a7640000", WEI).unwrap(),
            Decimal::ONE
        );
        assert_eq!(
            to_hex_atomic(dec("0.001"), WEI).unwrap(),
            "0x38d7ea4c68000"
        );
        assert_eq!(parse_hex_u64("0X2a").unwrap(), 42);
        assert!(parse_hex_u128("0xzz").is_err());
    }

    #[test]
    fn test_value_with_unit() {
        assert_eq!(parse_value_with_unit("3.14 BTC", "BTC").unwrap(), dec("3.14"));
        assert_eq!(parse_value_with_unit("-3.14 BTC", "BTC").unwrap(), dec("-3.14"));
        assert!(parse_value_with_unit("-0.0 BTC", "BTC").unwrap().is_zero());
        assert!(matches!(
            parse_value_with_unit("3.14 LTC", "BTC"),
            Err(Error::MalformedResponse(_))
        ));
        assert!(parse_value_with_unit("three BTC", "BTC").is_err());
    }

    #[test]
    fn test_parse_amount_accepts_only_plain_decimals() {
        assert_eq!(parse_amount(" 0.0015 ").unwrap(), dec("0.0015"));
        for bad in ["1e-3", "", "abc", "0.1.2", "NaN", "1_000", "1_0.5", "+1", "-1", ".5", "1."] {
            assert!(
                matches!(parse_amount(bad), Err(Error::InvalidAmountType(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_json_amounts() {
        assert_eq!(
            decimal_from_json(&serde_json::json!("0.5")).unwrap(),
            dec("0.5")
        );
        assert_eq!(
            decimal_from_json(&serde_json::json!(0.1)).unwrap(),
            dec("0.1")
        );
        assert_eq!(
            atomic_from_json(&serde_json::json!(3140000000000u64), PICONERO).unwrap(),
            dec("3.14")
        );
        assert!(decimal_from_json(&serde_json::json!(null)).is_err());
    }

    #[test]
    fn test_ceil_atomic() {
        assert_eq!(ceil_atomic(dec("2260.2")).unwrap(), 2261);
        assert_eq!(ceil_atomic(dec("2260")).unwrap(), 2260);
    }
}
