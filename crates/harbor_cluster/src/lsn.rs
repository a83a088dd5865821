//! Log sequence position codec.
//!
//! Positions arrive as `"XXXXXXXX/XXXXXXXX"` (two hex 32-bit fields). They
//! are folded into one comparable integer with
//! `segment * (0xFFFF_FFFF - SEGMENT_SIZE) + offset`. This is not the true
//! byte offset (`segment << 32 | offset`); delay thresholds already
//! configured against it depend on its exact magnitude, so it is kept.

use harbor_common::LsnError;

/// WAL segment size assumed by the position formula.
pub const SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

const SEGMENT_MULTIPLIER: u64 = 0xFFFF_FFFF - SEGMENT_SIZE;

fn parse_hex_field(field: &str, text: &str) -> Result<u64, LsnError> {
    if field.is_empty() || field.len() > 8 || !field.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(LsnError::InvalidFormat(text.to_string()));
    }
    u64::from_str_radix(field, 16).map_err(|_| LsnError::InvalidFormat(text.to_string()))
}

/// Decode `"segment/offset"` into its comparable integer.
pub fn decode_lsn(text: &str) -> Result<u64, LsnError> {
    let trimmed = text.trim();
    let (segment, offset) = trimmed
        .split_once('/')
        .ok_or_else(|| LsnError::InvalidFormat(text.to_string()))?;
    let segment = parse_hex_field(segment, text)?;
    let offset = parse_hex_field(offset, text)?;
    Ok(segment * SEGMENT_MULTIPLIER + offset)
}

/// Bytes a standby is behind; never negative.
pub fn compute_lag(primary: u64, standby: u64) -> u64 {
    primary.saturating_sub(standby)
}
