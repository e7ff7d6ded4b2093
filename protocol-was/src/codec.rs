//! Payload codecs for the fixed-format packet payloads.
//!
//! HEADER and PARAMETER payloads carry `name=value`; METHOD and STATUS
//! carry a little-endian u32; LENGTH and PREMATURE carry a little-endian
//! u64; the worker-to-peer METRIC payload carries an f32 value followed
//! by the metric name.

use crate::error::ParseError;

/// Maximum metric name length that still fits a packet payload.
pub const MAX_METRIC_NAME: usize = u16::MAX as usize - 4;

/// Split a HEADER or PARAMETER payload at the first `=`.
///
/// Returns `(name, value)`. A payload without a separator is malformed.
pub fn split_pair(payload: &[u8]) -> Result<(&[u8], &[u8]), ParseError> {
    let sep = payload
        .iter()
        .position(|&b| b == b'=')
        .ok_or(ParseError::Malformed("missing '=' separator"))?;
    Ok((&payload[..sep], &payload[sep + 1..]))
}

/// Decode a u32 payload (METHOD, STATUS).
pub fn parse_u32(payload: &[u8]) -> Result<u32, ParseError> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| ParseError::Malformed("expected 4-byte payload"))?;
    Ok(u32::from_le_bytes(bytes))
}

/// Decode a u64 payload (LENGTH, PREMATURE).
pub fn parse_u64(payload: &[u8]) -> Result<u64, ParseError> {
    let bytes: [u8; 8] = payload
        .try_into()
        .map_err(|_| ParseError::Malformed("expected 8-byte payload"))?;
    Ok(u64::from_le_bytes(bytes))
}

/// Encode a worker-to-peer METRIC payload: f32 value, then the name.
///
/// Returns `None` if the name does not fit a packet payload.
pub fn encode_metric(name: &str, value: f32) -> Option<Vec<u8>> {
    if name.len() > MAX_METRIC_NAME {
        return None;
    }
    let mut payload = Vec::with_capacity(4 + name.len());
    payload.extend_from_slice(&value.to_le_bytes());
    payload.extend_from_slice(name.as_bytes());
    Some(payload)
}
