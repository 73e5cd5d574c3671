use std::cmp::Ordering;

use crate::error::ExprError;

/// Parse a Kubernetes resource quantity into an absolute f64.
///
/// Accepts plain and decimal numbers, scientific notation, the binary
/// suffixes `Ki Mi Gi Ti Pi Ei`, and the decimal suffixes
/// `n u m k M G T P E`.
pub fn parse_quantity(input: &str) -> Result<f64, ExprError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ExprError::Quantity(input.to_string()));
    }

    const BINARY: &[(&str, f64)] = &[
        ("Ki", 1024f64),
        ("Mi", 1048576f64),
        ("Gi", 1073741824f64),
        ("Ti", 1099511627776f64),
        ("Pi", 1125899906842624f64),
        ("Ei", 1152921504606846976f64),
    ];
    const DECIMAL: &[(&str, f64)] = &[
        ("n", 1e-9),
        ("u", 1e-6),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];

    for (suffix, mult) in BINARY {
        if let Some(num) = s.strip_suffix(suffix) {
            return parse_number(num, input).map(|n| n * mult);
        }
    }
    for (suffix, mult) in DECIMAL {
        if let Some(num) = s.strip_suffix(suffix) {
            // Scientific notation also ends in digits after 'e'/'E'; only
            // treat 'E' as a suffix when the remainder parses on its own.
            if let Ok(n) = parse_number(num, input) {
                return Ok(n * mult);
            }
        }
    }
    parse_number(s, input)
}

fn parse_number(s: &str, original: &str) -> Result<f64, ExprError> {
    if s.is_empty() {
        return Err(ExprError::Quantity(original.to_string()));
    }
    s.parse::<f64>()
        .map_err(|_| ExprError::Quantity(original.to_string()))
}

/// Compare two resource quantities: -1, 0, or 1.
pub fn compare_quantities(a: &str, b: &str) -> Result<i64, ExprError> {
    let (a, b) = (parse_quantity(a)?, parse_quantity(b)?);
    Ok(match a.partial_cmp(&b).unwrap_or(Ordering::Equal) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    })
}
