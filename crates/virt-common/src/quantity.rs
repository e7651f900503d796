//! Byte arithmetic on Kubernetes resource quantities
//!
//! `k8s_openapi` models a quantity as an opaque string. Memory overhead math
//! needs exact byte values, so this module parses the canonical quantity
//! grammar (`128Mi`, `1.5Gi`, `64M`, `1e9`, `4096`) into bytes and formats
//! byte counts back into the shortest exact quantity string.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::{Error, Result};

/// One kibibyte
pub const KIB: u64 = 1024;
/// One mebibyte
pub const MIB: u64 = 1024 * KIB;
/// One gibibyte
pub const GIB: u64 = 1024 * MIB;

const BINARY_SUFFIXES: [(&str, u64); 6] = [
    ("Ei", 1 << 60),
    ("Pi", 1 << 50),
    ("Ti", 1 << 40),
    ("Gi", 1 << 30),
    ("Mi", 1 << 20),
    ("Ki", 1 << 10),
];

const DECIMAL_SUFFIXES: [(&str, u64); 6] = [
    ("E", 1_000_000_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("T", 1_000_000_000_000),
    ("G", 1_000_000_000),
    ("M", 1_000_000),
    ("k", 1_000),
];

/// Parse a quantity into a whole number of bytes, rounding fractions up.
pub fn parse_bytes(quantity: &Quantity) -> Result<u64> {
    parse_bytes_str(&quantity.0)
}

/// Parse a quantity string into a whole number of bytes, rounding fractions up.
///
/// Negative quantities are rejected; memory can't be negative.
pub fn parse_bytes_str(value: &str) -> Result<u64> {
    let trimmed = value.trim();
    let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if unsigned.starts_with('-') {
        return Err(Error::invalid_quantity(value, "negative quantity"));
    }

    let number_end = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_end);

    let (whole, fraction) = match number.split_once('.') {
        Some((w, f)) => (w, f),
        None => (number, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(Error::invalid_quantity(value, "missing numeric value"));
    }
    if fraction.contains('.') {
        return Err(Error::invalid_quantity(value, "more than one decimal point"));
    }

    // mantissa / 10^scale is the numeric value as written
    let digits = format!("{whole}{fraction}");
    let mantissa: u128 = if digits.is_empty() {
        0
    } else {
        digits
            .parse()
            .map_err(|_| Error::invalid_quantity(value, "numeric value too large"))?
    };
    let scale = u32::try_from(fraction.len())
        .map_err(|_| Error::invalid_quantity(value, "too many fractional digits"))?;

    let (numerator, denominator) = scale_for_suffix(value, suffix)?;

    let divisor = 10u128
        .checked_pow(scale)
        .and_then(|d| d.checked_mul(denominator))
        .ok_or_else(|| Error::invalid_quantity(value, "too many fractional digits"))?;
    let scaled = mantissa
        .checked_mul(numerator)
        .ok_or_else(|| Error::invalid_quantity(value, "quantity overflows"))?;

    let bytes = scaled.div_ceil(divisor);
    u64::try_from(bytes).map_err(|_| Error::invalid_quantity(value, "quantity overflows"))
}

/// Resolve a suffix into a (numerator, denominator) multiplier.
fn scale_for_suffix(value: &str, suffix: &str) -> Result<(u128, u128)> {
    if suffix.is_empty() {
        return Ok((1, 1));
    }
    if suffix == "m" {
        return Ok((1, 1000));
    }
    if let Some((_, factor)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Ok((u128::from(*factor), 1));
    }
    if let Some((_, factor)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Ok((u128::from(*factor), 1));
    }

    // Exponent form: 1e3, 5E-2. A bare "E" was handled above as exa.
    if let Some(exponent) = suffix
        .strip_prefix('e')
        .or_else(|| suffix.strip_prefix('E'))
    {
        let exponent: i32 = exponent
            .parse()
            .map_err(|_| Error::invalid_quantity(value, format!("invalid exponent '{suffix}'")))?;
        let power = 10u128
            .checked_pow(exponent.unsigned_abs())
            .ok_or_else(|| Error::invalid_quantity(value, "exponent out of range"))?;
        return Ok(if exponent >= 0 { (power, 1) } else { (1, power) });
    }

    Err(Error::invalid_quantity(
        value,
        format!("unknown suffix '{suffix}'"),
    ))
}

/// Format a byte count as the shortest exact quantity.
///
/// Every suffix that divides `bytes` exactly is a candidate; the one with the
/// smallest mantissa wins, binary before decimal on ties. `617 MiB` becomes
/// `617Mi`, `64_000_000` becomes `64M`, and anything indivisible stays a
/// plain integer.
pub fn format_bytes(bytes: u64) -> Quantity {
    if bytes == 0 {
        return Quantity("0".to_string());
    }

    let best = BINARY_SUFFIXES
        .iter()
        .chain(DECIMAL_SUFFIXES.iter())
        .filter(|(_, factor)| bytes % factor == 0)
        .min_by_key(|(_, factor)| bytes / factor);

    match best {
        Some((suffix, factor)) => Quantity(format!("{}{}", bytes / factor, suffix)),
        None => Quantity(bytes.to_string()),
    }
}

/// Sum two memory quantities.
pub fn add_bytes(a: &Quantity, b: &Quantity) -> Result<Quantity> {
    let sum = parse_bytes(a)?
        .checked_add(parse_bytes(b)?)
        .ok_or_else(|| Error::invalid_quantity(&a.0, "sum overflows"))?;
    Ok(format_bytes(sum))
}
