use bytes::BytesMut;

/// Incoming byte buffer of a connection.
///
/// Bytes are appended as they arrive from the transport and taken off the
/// front in exactly the amounts the parser asks for. A request that cannot be
/// satisfied yet leaves the buffer untouched.
#[derive(Debug, Default)]
pub(crate) struct ByteReader {
    /// Bytes received but not consumed yet.
    buffer: BytesMut,
}

impl ByteReader {
    /// Appends a chunk received from the transport.
    pub fn put(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Takes the next `length` bytes, or returns `None` if fewer are buffered.
    pub fn read(&mut self, length: usize) -> Option<BytesMut> {
        (self.buffer.len() >= length).then(|| self.buffer.split_to(length))
    }

    /// Drops everything buffered.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
