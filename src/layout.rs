//! Offset map of the per-unit queue region.
//!
//! Every unit exposes one RMA window with this layout; all peers of a team
//! must agree on it, so the offsets are part of the wire contract:
//!
//! ```text
//! | offset | width | field       |
//! |--------|-------|-------------|
//! | 0      | 8     | selector    |  active sub-queue index, 0 or 1
//! | 8      | 8     | tail[0]     |  bytes reserved by senders in sub-queue 0
//! | 16     | 8     | ready[0]    |  bytes whose payload write has completed
//! | 24     | 8     | tail[1]     |
//! | 32     | 8     | ready[1]    |
//! | 40     | Q     | data[0]     |  packed messages of sub-queue 0
//! | 40+Q   | Q     | data[1]     |  packed messages of sub-queue 1
//! ```
//!
//! All control words are 64-bit signed integers accessed exclusively through
//! remote atomics; the data regions are accessed exclusively through remote
//! byte writes and drain-time local reads.

/// Offset of the sub-queue selector.
pub const SELECTOR: usize = 0;

/// Offset of the reservation counter of sub-queue `q`.
#[inline]
pub const fn tail(q: usize) -> usize {
    8 + q * 16
}

/// Offset of the completion counter of sub-queue `q`.
#[inline]
pub const fn ready(q: usize) -> usize {
    tail(q) + 8
}

/// Offset of the data region of sub-queue `q`, for a sub-queue capacity of
/// `queue_size` bytes.
#[inline]
pub const fn data(q: usize, queue_size: usize) -> usize {
    ready(1) + 8 + q * queue_size
}

/// Total window size for a sub-queue capacity of `queue_size` bytes.
#[inline]
pub const fn window_size(queue_size: usize) -> usize {
    data(1, queue_size) + queue_size
}
