//! Sender-side coalescing cache.
//!
//! One `CacheBuf` per target batches small messages so they reach the remote
//! queue in a single reservation + write, amortizing the round trips of the
//! sender protocol. The buffer holds fully encoded messages (header plus
//! payload, tightly packed), ready to be handed to the raw send path as-is.

use crate::wire::{self, Header, HEADER_SIZE};

/// Default capacity of a per-target message cache in bytes.
pub const MSGCACHE_SIZE: usize = 4 * 1024;

/// A per-target batch of encoded messages.
pub(crate) struct CacheBuf {
    buf: Box<[u8]>,
    pos: usize,
}

impl CacheBuf {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            pos: 0,
        }
    }

    /// Bytes currently batched.
    #[inline]
    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    /// Free space left in the buffer.
    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// The batched messages, ready for injection.
    #[inline]
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    /// Forget the batched messages after a successful injection.
    #[inline]
    pub(crate) fn reset(&mut self) {
        self.pos = 0;
    }

    /// Append one encoded message. The caller must have checked `remaining`.
    pub(crate) fn append(&mut self, header: &Header, data: &[u8]) {
        debug_assert_eq!(header.data_size as usize, data.len());
        debug_assert!(HEADER_SIZE + data.len() <= self.remaining());

        // Safety: bounds checked above; the buffer outlives the writes.
        unsafe { wire::encode_header(self.buf.as_mut_ptr().add(self.pos), header) };
        self.buf[self.pos + HEADER_SIZE..self.pos + HEADER_SIZE + data.len()]
            .copy_from_slice(data);
        self.pos += HEADER_SIZE + data.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(msgid: u32, data_size: u32) -> Header {
        Header {
            action: 0,
            remote: 1,
            data_size,
            msgid,
        }
    }

    #[test]
    fn test_append_packs_messages_back_to_back() {
        let mut cache = CacheBuf::new(256);
        cache.append(&header(0, 3), b"abc");
        cache.append(&header(1, 0), b"");
        assert_eq!(cache.pos(), 2 * HEADER_SIZE + 3);

        let bytes = cache.bytes();
        let first = unsafe { wire::decode_header(bytes.as_ptr()) };
        assert_eq!(first.data_size, 3);
        assert_eq!(&bytes[HEADER_SIZE..HEADER_SIZE + 3], b"abc");
        let second = unsafe { wire::decode_header(bytes.as_ptr().add(HEADER_SIZE + 3)) };
        assert_eq!(second.msgid, 1);
        assert_eq!(second.data_size, 0);
    }

    #[test]
    fn test_remaining_and_reset() {
        let mut cache = CacheBuf::new(HEADER_SIZE + 8);
        assert_eq!(cache.remaining(), HEADER_SIZE + 8);
        cache.append(&header(0, 8), &[7u8; 8]);
        assert_eq!(cache.remaining(), 0);
        cache.reset();
        assert_eq!(cache.pos(), 0);
        assert_eq!(cache.remaining(), HEADER_SIZE + 8);
    }
}
