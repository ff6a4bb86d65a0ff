//! Remote-memory-access capability expected by the queue.
//!
//! The queue is written against these traits rather than a concrete network
//! layer. A substrate must provide per-team window allocation, 64-bit remote
//! atomics, remote byte writes, completion flushes, and (split-phase) team
//! barriers. [`crate::inproc`] provides the in-process implementation; an
//! MPI- or verbs-backed one plugs in the same way.
//!
//! # Ordering contract
//!
//! The queue protocol relies on exactly these guarantees and no others:
//!
//! - `fetch_op` is atomic with respect to every other `fetch_op` on the same
//!   8-byte location, from any origin.
//! - Two `fetch_op`s issued by one origin to the same location complete in
//!   program order once a later `fetch_op` on the same window has returned
//!   its value. A substrate that buffers accumulates without this property
//!   must flush internally before completing the later operation.
//! - The value returned by `fetch_op` may only be inspected after
//!   `flush_local` (or `flush`) on the target has returned.
//! - `put` followed by `flush` makes the written bytes visible to any peer
//!   that subsequently observes an accumulate issued by the same origin
//!   after the flush, even at a different offset.
//! - `FetchOp::NoOp` reads the current remote value with no side effect.
//!
//! No ordering is assumed across different locations without a flush, and
//! no fairness is assumed among concurrent origins.
//!
//! Collective calls (`allocate`, `barrier`, `ibarrier`) must be issued by
//! every unit of the team in the same order, from one thread per unit.

use crate::error::Result;

/// Remote atomic operation selector.
///
/// The protocol restricts itself to same-op/no-op accumulates so it runs on
/// substrates without compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOp {
    /// Fetch the prior value and add the operand.
    Add,
    /// Fetch the prior value and store the operand.
    Replace,
    /// Fetch the current value; the operand is ignored.
    NoOp,
}

/// A per-unit handle onto a team of peers.
pub trait Rma: Send + Sync {
    /// Remotely accessible memory window.
    type Window: RmaWindow;
    /// In-flight split-phase barrier.
    type Ibarrier: IbarrierRequest;

    /// This unit's id within the team.
    fn unit(&self) -> usize;

    /// Number of units in the team.
    fn team_size(&self) -> usize;

    /// Collectively allocate a zero-initialized window of `size` bytes on
    /// every unit. Returns once all windows are usable.
    fn allocate(&self, size: usize) -> Result<Self::Window>;

    /// Block until every unit of the team has entered the barrier.
    fn barrier(&self) -> Result<()>;

    /// Enter a barrier without blocking; completion is observed via
    /// [`IbarrierRequest::test`].
    fn ibarrier(&self) -> Result<Self::Ibarrier>;
}

/// One unit's view of a collectively allocated window.
///
/// Dropping the handle releases the local region; callers are responsible
/// for quiescing remote accesses first (the queue does so with a team
/// barrier on close).
pub trait RmaWindow: Send + Sync {
    /// Atomic fetch-and-op on the 8-byte integer at `offset` in `target`'s
    /// window. The returned value is valid only after a flush.
    fn fetch_op(&self, target: usize, offset: usize, op: FetchOp, operand: i64) -> Result<i64>;

    /// Non-atomic write of `bytes` into `target`'s window at `offset`.
    /// The caller must hold an exclusive reservation on the byte range.
    fn put(&self, target: usize, offset: usize, bytes: &[u8]) -> Result<()>;

    /// Complete outstanding operations on `target` at the origin: fetched
    /// values become valid locally.
    fn flush_local(&self, target: usize) -> Result<()>;

    /// Complete outstanding operations on `target` remotely: puts and
    /// accumulates become visible at the target.
    fn flush(&self, target: usize) -> Result<()>;

    /// Borrow `len` bytes of the local window starting at `offset`.
    ///
    /// # Safety
    /// The caller must guarantee that no peer writes to the range for the
    /// lifetime of the returned slice.
    unsafe fn local_bytes(&self, offset: usize, len: usize) -> &[u8];
}

/// Handle to a split-phase barrier in flight.
pub trait IbarrierRequest {
    /// Poll for completion. Returns `true` once every unit has entered the
    /// barrier; never blocks.
    fn test(&mut self) -> Result<bool>;
}
