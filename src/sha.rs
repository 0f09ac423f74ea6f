use sha1_smol::Sha1;

/// Fixed GUID appended to the client's key before hashing.
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Calculate the SHA-1 digest of a websocket key and the GUID using the
/// [`sha1_smol`] crate.
pub fn digest(key: &[u8]) -> [u8; 20] {
    let mut s = Sha1::new();
    s.update(key);
    s.update(GUID.as_bytes());
    s.digest().bytes()
}
