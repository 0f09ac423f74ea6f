//! Payload (un-)masking as described in
//! [Section 5.3 of RFC6455](https://datatracker.ietf.org/doc/html/rfc6455#section-5.3).
//!
//! Masking XORs byte `i` of a payload with `key[i % 4]`, which makes it its
//! own inverse. Unaligned head and tail bytes are handled one at a time, the
//! aligned middle of the payload eight bytes at a time.

/// (Un-)masks input bytes with the framing key, one byte at a time.
///
/// The input bytes may be further in the payload and therefore the offset into
/// the payload must be specified.
#[inline]
fn one_byte_at_once(key: [u8; 4], input: &mut [u8], offset: usize) {
    #[allow(clippy::cast_possible_truncation)] // offset is 0..4
    let key = u32::from_be_bytes(key)
        .rotate_left((offset % 4) as u32 * u8::BITS)
        .to_be_bytes();

    for (index, byte) in input.iter_mut().enumerate() {
        *byte ^= key[index % key.len()];
    }
}

/// (Un-)masks input bytes with the framing key.
///
/// The input bytes may be further in the payload and therefore the offset into
/// the payload must be specified.
pub fn frame(key: [u8; 4], input: &mut [u8], offset: usize) {
    // SAFETY: Any bit pattern is a valid u64, so reinterpreting aligned bytes is
    // sound.
    let (prefix, aligned_data, suffix) = unsafe { input.align_to_mut::<u64>() };

    one_byte_at_once(key, prefix, offset);
    let offset = (offset + prefix.len()) % key.len();

    if !aligned_data.is_empty() {
        #[allow(clippy::cast_possible_truncation)] // offset is 0..4
        let rotated = u32::from_be_bytes(key)
            .rotate_left(offset as u32 * u8::BITS)
            .to_be_bytes();
        let mut wide = [0; 8];
        wide[..4].copy_from_slice(&rotated);
        wide[4..].copy_from_slice(&rotated);
        let mask = u64::from_ne_bytes(wide);

        for block in aligned_data {
            *block ^= mask;
        }
    }

    one_byte_at_once(key, suffix, offset);
}
