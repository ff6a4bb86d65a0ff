//! Message-header encoding/decoding for the packed queue data regions.
//!
//! A message is a fixed header followed by exactly `data_size` payload bytes,
//! with no padding between messages. Headers therefore land at arbitrary
//! byte offsets and must be read and written unaligned. All fields are
//! little-endian so a team of homogeneous peers agrees on the layout.

/// Message header size in bytes.
/// Layout: action (4) + remote (4) + data_size (4) + msgid (4).
pub const HEADER_SIZE: usize = 16;

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Handler identifier, resolved at the receiver.
    pub action: u32,
    /// Originating unit id.
    pub remote: u32,
    /// Payload length in bytes.
    pub data_size: u32,
    /// Diagnostic sequence number assigned by the sender.
    pub msgid: u32,
}

/// Encode a message header into the buffer.
///
/// # Safety
/// The buffer must have at least `HEADER_SIZE` bytes available.
#[inline]
pub unsafe fn encode_header(buf: *mut u8, header: &Header) {
    let ptr = buf as *mut u32;
    std::ptr::write_unaligned(ptr, header.action.to_le());
    std::ptr::write_unaligned(ptr.add(1), header.remote.to_le());
    std::ptr::write_unaligned(ptr.add(2), header.data_size.to_le());
    std::ptr::write_unaligned(ptr.add(3), header.msgid.to_le());
}

/// Decode a message header from the buffer.
///
/// # Safety
/// The buffer must have at least `HEADER_SIZE` bytes of valid data.
#[inline]
pub unsafe fn decode_header(buf: *const u8) -> Header {
    let ptr = buf as *const u32;
    Header {
        action: u32::from_le(std::ptr::read_unaligned(ptr)),
        remote: u32::from_le(std::ptr::read_unaligned(ptr.add(1))),
        data_size: u32::from_le(std::ptr::read_unaligned(ptr.add(2))),
        msgid: u32::from_le(std::ptr::read_unaligned(ptr.add(3))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = Header {
            action: 7,
            remote: 3,
            data_size: 256,
            msgid: 0xDEAD_BEEF,
        };
        let mut buf = [0u8; HEADER_SIZE];
        unsafe {
            encode_header(buf.as_mut_ptr(), &header);
            assert_eq!(decode_header(buf.as_ptr()), header);
        }
    }

    #[test]
    fn test_header_unaligned() {
        let header = Header {
            action: 1,
            remote: 2,
            data_size: 3,
            msgid: 4,
        };
        // Headers are tightly packed behind variable-length payloads, so
        // they must survive odd offsets.
        let mut buf = [0u8; HEADER_SIZE + 1];
        unsafe {
            encode_header(buf.as_mut_ptr().add(1), &header);
            assert_eq!(decode_header(buf.as_ptr().add(1)), header);
        }
    }

    #[test]
    fn test_header_is_little_endian() {
        let header = Header {
            action: 0x0102_0304,
            remote: 0,
            data_size: 0,
            msgid: 0,
        };
        let mut buf = [0u8; HEADER_SIZE];
        unsafe { encode_header(buf.as_mut_ptr(), &header) };
        assert_eq!(&buf[0..4], &[0x04, 0x03, 0x02, 0x01]);
    }
}
