use crate::proto::ProtocolError;

/// Validates that `input` is UTF-8.
#[cfg(feature = "simd")]
#[inline]
pub fn parse_str(input: &[u8]) -> Result<&str, ProtocolError> {
    simdutf8::basic::from_utf8(input).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Validates that `input` is UTF-8.
#[cfg(not(feature = "simd"))]
#[inline]
pub fn parse_str(input: &[u8]) -> Result<&str, ProtocolError> {
    std::str::from_utf8(input).map_err(|_| ProtocolError::InvalidUtf8)
}
