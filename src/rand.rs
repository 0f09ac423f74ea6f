//! Random numbers generation utilities required for outbound masking.

/// Generate a random 4-byte WebSocket mask.
pub fn get_mask() -> [u8; 4] {
    fastrand::u32(..).to_ne_bytes()
}
