//! Advisory resource hints such as `"1g"` or `"512m"`.

use crate::error::EngineError;

/// Parse a memory hint into megabytes.
///
/// Accepts a number with an optional `k`, `m`, `g` or `t` suffix (case
/// insensitive). A bare number is megabytes.
pub fn parse_memory_mb(hint: &str) -> Result<u64, EngineError> {
    let hint = hint.trim().to_ascii_lowercase();
    let invalid = || EngineError::invalid(format!("invalid resource hint `{hint}`"));
    let (digits, scale_kb) = match hint.char_indices().last() {
        Some((at, 'k')) => (&hint[..at], 1),
        Some((at, 'm')) => (&hint[..at], 1024),
        Some((at, 'g')) => (&hint[..at], 1024 * 1024),
        Some((at, 't')) => (&hint[..at], 1024 * 1024 * 1024),
        Some(_) => (hint.as_str(), 1024),
        None => return Err(invalid()),
    };
    let amount: u64 = digits.trim().parse().map_err(|_| invalid())?;
    let kb = amount.checked_mul(scale_kb).ok_or_else(invalid)?;
    Ok(kb.div_ceil(1024))
}
