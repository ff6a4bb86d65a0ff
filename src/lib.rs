//! amsgq - One-sided active-message queue over remote-memory-access windows.
//!
//! Any unit of a team can inject an active message (handler id + opaque
//! payload) into a peer's receive window using only one-sided operations:
//! fetch-and-op reservations, a raw byte write, and completion flushes. The
//! receiver drains its own window at its leisure and dispatches each message
//! to the registered handler. No locks and no receiver participation are
//! needed on the injection path.
//!
//! # Architecture
//!
//! ```text
//!                 sender units                        receiving unit
//!  ┌──────────────┐ ┌──────────────┐       ┌───────────────────────────────┐
//!  │ try_send ────┼─┼─ try_send ───┼──────▶│ window                        │
//!  │ bsend ─┐     │ │              │ RMA   │  selector ──┐                 │
//!  │        ▼     │ │              │       │  tail[0] ready[0] data[0] ◀─┐ │
//!  │  per-target  │ │              │       │  tail[1] ready[1] data[1]   │ │
//!  │  cache ──────┼─┼──────────────┼──────▶│             │               │ │
//!  └──────────────┘ └──────────────┘       │   process() ┴ swap, freeze, ┘ │
//!                                          │   dispatch handlers in order  │
//!                                          └───────────────────────────────┘
//! ```
//!
//! Each window holds two sub-queues in a ping-pong arrangement. Senders
//! reserve space in the sub-queue named by `selector` with a fetch-and-add
//! on its `tail`, write their bytes, then publish them by bumping `ready`.
//! The drainer atomically retires the active sub-queue: it redirects new
//! senders to the other sub-queue, drives the retired `tail` so far negative
//! that every in-flight reservation cancels itself, waits until `ready`
//! matches the bytes actually claimed, and only then walks the frozen data
//! region, invoking handlers in reservation order.
//!
//! The RMA substrate is injected through the [`rma`] traits; [`inproc`]
//! provides the thread-backed fabric used in tests and single-node runs.

pub mod error;
pub mod handler;
pub mod inproc;
pub mod layout;
pub mod rma;
pub mod wire;

mod cache;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use cache::CacheBuf;
pub use cache::MSGCACHE_SIZE;
pub use error::{Error, Result};
pub use handler::{ActionId, ActionRegistry};
use rma::{FetchOp, IbarrierRequest, Rma, RmaWindow};
use wire::{Header, HEADER_SIZE};

/// Default maximum payload size per message in bytes.
pub const DEFAULT_MSG_SIZE: usize = 256;

/// Default per-sub-queue message capacity.
pub const DEFAULT_MSG_COUNT: usize = 64;

/// Bias added to a retired sub-queue's reservation counter. Large enough
/// that any reservation racing with the drainer fetches a negative offset
/// and rolls itself back.
const FREEZE_BIAS: i64 = i32::MAX as i64;

// ============================================================================
// Builder
// ============================================================================

/// Configures and collectively opens an [`Amsgq`].
pub struct AmsgqBuilder {
    msg_size: usize,
    msg_count: usize,
    registry: Arc<ActionRegistry>,
}

impl AmsgqBuilder {
    /// Start a builder over a frozen handler registry.
    ///
    /// Every unit of the team must have registered the same handlers in the
    /// same order, since slab keys travel in message headers.
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self {
            msg_size: DEFAULT_MSG_SIZE,
            msg_count: DEFAULT_MSG_COUNT,
            registry,
        }
    }

    /// Set the maximum payload size per message.
    pub fn msg_size(mut self, msg_size: usize) -> Self {
        self.msg_size = msg_size;
        self
    }

    /// Set the per-sub-queue message capacity.
    pub fn msg_count(mut self, msg_count: usize) -> Self {
        self.msg_count = msg_count;
        self
    }

    /// Collectively open the queue over `rma`. Returns once every unit's
    /// window is visible to the whole team.
    pub fn open<R: Rma>(self, rma: R) -> Result<Amsgq<R>> {
        if self.msg_size == 0 {
            return Err(Error::InvalidArg("msg_size must be non-zero"));
        }
        if self.msg_count == 0 {
            return Err(Error::InvalidArg("msg_count must be non-zero"));
        }

        let queue_size = self.msg_count * (HEADER_SIZE + self.msg_size);
        let win = rma.allocate(layout::window_size(queue_size))?;

        let unit = rma.unit();
        let team_size = rma.team_size();
        // Cap the cache at the sub-queue capacity so a full cache flush is
        // always representable as a single reservation.
        let cache_capacity = MSGCACHE_SIZE.min(queue_size);
        let caches = (0..team_size).map(|_| OnceLock::new()).collect();

        debug!(unit, team_size, queue_size, "opened active-message queue");

        // All windows are allocated and zeroed at this point.
        rma.barrier()?;

        Ok(Amsgq {
            win,
            rma,
            unit,
            team_size,
            queue_size: queue_size as i64,
            max_msg_size: self.msg_size,
            cache_capacity,
            registry: self.registry,
            send_mutex: Mutex::new(()),
            drainer: Mutex::new(Drainer { prev_tail: 0 }),
            caches,
            msg_seq: AtomicU32::new(0),
        })
    }
}

// ============================================================================
// Queue
// ============================================================================

/// State owned by whichever thread is draining; holding the mutex is what
/// makes that thread the single drainer.
struct Drainer {
    /// Residual value the freeze left in the now-inactive sub-queue's tail.
    /// The next cycle waits for the counter to settle back to exactly this
    /// value before reactivating the sub-queue.
    prev_tail: i64,
}

/// A one-sided active-message queue bound to one unit of a team.
///
/// Shareable across the unit's threads: any number of threads may send
/// concurrently, and drains are serialized internally. Collective calls
/// ([`Amsgq::process_blocking`], [`Amsgq::close`]) must be issued by one
/// thread per unit, in the same order on every unit.
pub struct Amsgq<R: Rma> {
    // Field order is load-bearing: the window must be released before the
    // local locks and caches it synchronizes with.
    win: R::Window,
    rma: R,
    unit: usize,
    team_size: usize,
    /// Capacity of one sub-queue's data region in bytes.
    queue_size: i64,
    max_msg_size: usize,
    cache_capacity: usize,
    registry: Arc<ActionRegistry>,
    /// Serializes whole-cache flushes.
    send_mutex: Mutex<()>,
    drainer: Mutex<Drainer>,
    /// Per-target coalescing caches, allocated on first use.
    caches: Box<[OnceLock<Mutex<CacheBuf>>]>,
    /// Diagnostic message sequence numbers.
    msg_seq: AtomicU32,
}

impl<R: Rma> Amsgq<R> {
    /// Start building a queue. See [`AmsgqBuilder`].
    pub fn builder(registry: Arc<ActionRegistry>) -> AmsgqBuilder {
        AmsgqBuilder::new(registry)
    }

    /// This unit's id within the team.
    pub fn unit(&self) -> usize {
        self.unit
    }

    /// Number of units in the team.
    pub fn team_size(&self) -> usize {
        self.team_size
    }

    /// Maximum payload size accepted per message.
    pub fn max_msg_size(&self) -> usize {
        self.max_msg_size
    }

    fn encode_message(&self, action: ActionId, data: &[u8]) -> Header {
        Header {
            action: action.raw(),
            remote: self.unit as u32,
            data_size: data.len() as u32,
            msgid: self.msg_seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn check_send_args(&self, target: usize, data: &[u8]) -> Result<()> {
        if target >= self.team_size {
            return Err(Error::InvalidArg("target unit out of range"));
        }
        if data.len() > self.max_msg_size {
            return Err(Error::InvalidArg("payload exceeds max message size"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Sender path
    // ------------------------------------------------------------------------

    /// Send one active message to `target` without blocking.
    ///
    /// Returns [`Error::Again`] if the target's active sub-queue is full or
    /// being drained; the message has not been sent and the remote counters
    /// are left untouched. The caller decides whether to retry, drain its
    /// own queue, or give up.
    pub fn try_send(&self, target: usize, action: ActionId, data: &[u8]) -> Result<()> {
        self.check_send_args(target, data)?;

        let header = self.encode_message(action, data);
        let mut buf = vec![0u8; HEADER_SIZE + data.len()];
        // Safety: buf holds exactly HEADER_SIZE + data.len() bytes.
        unsafe { wire::encode_header(buf.as_mut_ptr(), &header) };
        buf[HEADER_SIZE..].copy_from_slice(data);

        trace!(to = target, msgid = header.msgid, size = buf.len(), "sending active message");
        self.send_buffer(target, &buf)
    }

    /// Inject a buffer of pre-encoded messages into `target`'s queue.
    ///
    /// One attempt: reserve space in the active sub-queue, write the bytes,
    /// publish them. A failed reservation is rolled back durably before
    /// [`Error::Again`] is returned.
    fn send_buffer(&self, target: usize, buf: &[u8]) -> Result<()> {
        let n = buf.len() as i64;

        // Which sub-queue is accepting writes right now?
        let q = self.win.fetch_op(target, layout::SELECTOR, FetchOp::NoOp, 0)?;
        self.win.flush_local(target)?;
        assert!(q == 0 || q == 1, "selector out of range: {}", q);
        let q = q as usize;

        // Claim our byte range.
        let offset = self.win.fetch_op(target, layout::tail(q), FetchOp::Add, n)?;
        self.win.flush_local(target)?;

        if offset < 0 || offset + n > self.queue_size {
            // Full, or the drainer froze this sub-queue under us. Undo the
            // claim; the rollback must be remotely durable before we report
            // back, or the drainer could wait on it forever.
            trace!(to = target, queue = q, offset, "queue full or draining, rolling back");
            self.win.fetch_op(target, layout::tail(q), FetchOp::Add, -n)?;
            self.win.flush(target)?;
            return Err(Error::Again);
        }

        let data_base = layout::data(q, self.queue_size as usize);
        self.win.put(target, data_base + offset as usize, buf)?;
        // The payload must land before the readiness bump becomes visible.
        self.win.flush(target)?;

        self.win.fetch_op(target, layout::ready(q), FetchOp::Add, n)?;
        // And the bump itself must not linger in a local buffer.
        self.win.flush(target)?;

        trace!(to = target, queue = q, offset, len = n, "active message injected");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Coalescing cache
    // ------------------------------------------------------------------------

    /// Queue one active message for batched delivery to `target`.
    ///
    /// The message is copied into a per-target cache and injected together
    /// with its neighbors by [`Amsgq::flush`], or earlier when the cache
    /// overflows. May block briefly inside an overflow drain.
    pub fn bsend(&self, target: usize, action: ActionId, data: &[u8]) -> Result<()> {
        self.check_send_args(target, data)?;

        let slot = self.caches[target]
            .get_or_init(|| Mutex::new(CacheBuf::new(self.cache_capacity)));
        let need = HEADER_SIZE + data.len();

        if need > self.cache_capacity {
            // Too big to ever fit the cache; preserve ordering by draining
            // what is batched, then inject directly.
            self.drain_cache(target, slot)?;
            let header = self.encode_message(action, data);
            let mut buf = vec![0u8; need];
            // Safety: buf holds exactly `need` bytes.
            unsafe { wire::encode_header(buf.as_mut_ptr(), &header) };
            buf[HEADER_SIZE..].copy_from_slice(data);
            return self.send_retry(target, &buf);
        }

        loop {
            {
                let mut cache = slot.lock();
                if cache.remaining() >= need {
                    let header = self.encode_message(action, data);
                    cache.append(&header, data);
                    trace!(to = target, msgid = header.msgid, pos = cache.pos(), "cached active message");
                    return Ok(());
                }
            }
            // Cache full: push the batch out, then retry the append.
            self.drain_cache(target, slot)?;
        }
    }

    /// Drain all per-target caches.
    ///
    /// Safe to call on empty caches (a no-op). Not callable from inside a
    /// handler.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.send_mutex.lock();
        for target in 0..self.team_size {
            if let Some(slot) = self.caches[target].get() {
                self.drain_cache(target, slot)?;
            }
        }
        Ok(())
    }

    /// Inject `target`'s batched messages, retrying around back-pressure.
    ///
    /// The cache mutex is dropped before each interleaved drain of our own
    /// queue, so handlers running under that drain may themselves `bsend`
    /// to any target.
    fn drain_cache(&self, target: usize, slot: &Mutex<CacheBuf>) -> Result<()> {
        loop {
            {
                let mut cache = slot.lock();
                if cache.pos() == 0 {
                    return Ok(());
                }
                trace!(to = target, len = cache.pos(), "flushing message cache");
                match self.send_buffer(target, cache.bytes()) {
                    Ok(()) => {
                        cache.reset();
                        return Ok(());
                    }
                    Err(Error::Again) => {}
                    Err(e) => return Err(e),
                }
            }
            // The peer is full or draining; make progress on our own queue
            // so two mutually-blocked units cannot livelock.
            match self.process() {
                Ok(()) | Err(Error::Again) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Inject an already-encoded buffer, interleaving local drains while the
    /// target pushes back.
    fn send_retry(&self, target: usize, buf: &[u8]) -> Result<()> {
        loop {
            match self.send_buffer(target, buf) {
                Ok(()) => return Ok(()),
                Err(Error::Again) => match self.process() {
                    Ok(()) | Err(Error::Again) => {}
                    Err(e) => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Drainer
    // ------------------------------------------------------------------------

    /// Drain and dispatch the local queue without blocking.
    ///
    /// Returns [`Error::Again`] if another thread is already draining.
    pub fn process(&self) -> Result<()> {
        match self.drainer.try_lock() {
            Some(mut state) => self.drain(&mut state, false),
            None => Err(Error::Again),
        }
    }

    /// Drain and dispatch the local queue, waiting for the drainer lock and
    /// looping until the queue is observed empty.
    fn process_all(&self) -> Result<()> {
        let mut state = self.drainer.lock();
        self.drain(&mut state, true)
    }

    /// Collectively process until global quiescence: every message sent by
    /// any unit before it entered this call has been dispatched at its
    /// target when this call returns.
    pub fn process_blocking(&self) -> Result<()> {
        self.flush()?;

        let mut barrier = self.rma.ibarrier()?;
        loop {
            self.process_all()?;
            if barrier.test()? {
                break;
            }
        }
        // Catch messages that landed between our barrier entry and its
        // completion.
        self.process_all()?;
        self.rma.barrier()
    }

    fn drain(&self, state: &mut Drainer, blocking: bool) -> Result<()> {
        loop {
            let me = self.unit;

            // Only this unit ever writes the selector, but it lives in the
            // window, so read it through the substrate like any other word.
            let q = self.win.fetch_op(me, layout::SELECTOR, FetchOp::NoOp, 0)?;
            self.win.flush_local(me)?;
            assert!(q == 0 || q == 1, "selector out of range: {}", q);
            let q = q as usize;

            let tailpos = self.win.fetch_op(me, layout::tail(q), FetchOp::NoOp, 0)?;
            self.win.flush_local(me)?;

            if tailpos > 0 {
                self.retire_and_dispatch(state, q, tailpos)?;
            }

            if !(blocking && tailpos > 0) {
                return Ok(());
            }
        }
    }

    /// Retire the active sub-queue `q` and dispatch its frozen contents.
    fn retire_and_dispatch(&self, state: &mut Drainer, q: usize, tailpos: i64) -> Result<()> {
        let me = self.unit;
        let newq = 1 - q;
        trace!(queue = q, tailpos, "draining active-message queue");

        // Late senders racing the previous cycle may still have rollbacks in
        // flight on the inactive sub-queue; its tail has settled once it
        // reads exactly the residual the last freeze left behind.
        loop {
            let t = self.win.fetch_op(me, layout::tail(newq), FetchOp::NoOp, 0)?;
            self.win.flush_local(me)?;
            if t == state.prev_tail {
                break;
            }
            std::hint::spin_loop();
        }

        // Reactivate the inactive sub-queue.
        self.win.fetch_op(me, layout::tail(newq), FetchOp::Replace, 0)?;
        self.win.flush(me)?;

        // Swap the selector; new reservations land in `newq` from here on.
        let swap = if q == 0 { 1 } else { -1 };
        let prev = self.win.fetch_op(me, layout::SELECTOR, FetchOp::Add, swap)?;
        self.win.flush(me)?;
        assert_eq!(prev, q as i64, "selector modified by another unit");

        // Freeze the retired sub-queue: any reservation still targeting it
        // now fetches a negative offset and rolls itself back.
        let sub = -tailpos - FREEZE_BIAS;
        self.win.fetch_op(me, layout::tail(q), FetchOp::Add, sub)?;
        // Flush deferred: the completion loop below issues fetch_ops on the
        // same window, which forces this accumulate to complete first.

        // Wait for every writer that did reserve to finish publishing.
        // Re-fetch the tail each round: late reservations and rollbacks keep
        // adjusting it until the freeze is globally visible.
        let mut tail_now;
        loop {
            let ready = self.win.fetch_op(me, layout::ready(q), FetchOp::NoOp, 0)?;
            let tail = self.win.fetch_op(me, layout::tail(q), FetchOp::NoOp, 0)?;
            self.win.flush_local(me)?;
            tail_now = tail - sub;
            assert!(
                ready <= tail_now,
                "completion counter {} ahead of reservations {}",
                ready,
                tail_now
            );
            if ready == tail_now {
                break;
            }
            std::hint::spin_loop();
        }

        // What the freeze leaves in tail once all writers are done; the next
        // cycle waits for the counter to settle here before reactivating.
        state.prev_tail = sub + tail_now;

        self.win.fetch_op(me, layout::ready(q), FetchOp::Replace, 0)?;
        self.win.flush(me)?;

        self.dispatch(q, tail_now)
    }

    /// Walk the frozen data region `[0, tail_now)` of sub-queue `q` and
    /// invoke handlers in reservation order.
    fn dispatch(&self, q: usize, tail_now: i64) -> Result<()> {
        let end = tail_now as usize;
        let data_base = layout::data(q, self.queue_size as usize);
        // Safety: the sub-queue stays frozen until a later cycle of this
        // drainer reactivates it, so no peer writes this range while the
        // slice is live.
        let bytes = unsafe { self.win.local_bytes(data_base, end) };

        let mut pos = 0usize;
        let mut num_msg = 0u32;
        while pos < end {
            assert!(pos + HEADER_SIZE <= end, "message header out of bounds");
            // Safety: bounds checked above.
            let header = unsafe { wire::decode_header(bytes.as_ptr().add(pos)) };
            pos += HEADER_SIZE;

            let data_size = header.data_size as usize;
            assert!(pos + data_size <= end, "message straddles the reservation mark");
            let payload = &bytes[pos..pos + data_size];
            pos += data_size;

            trace!(
                action = header.action,
                remote = header.remote,
                msgid = header.msgid,
                size = data_size,
                "dispatching active message"
            );
            match self.registry.get(header.action) {
                Some(f) => f(payload),
                None => panic!("no handler registered for action {}", header.action),
            }
            num_msg += 1;
        }

        debug!(queue = q, messages = num_msg, bytes = end, "drained active-message queue");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Collectively close the queue.
    ///
    /// Messages still sitting in the local window are discarded with a
    /// warning; their handlers are not invoked. The window is released only
    /// after the whole team has entered the call, so no unit tears down
    /// memory a peer might still address.
    pub fn close(self) -> Result<()> {
        let me = self.unit;

        let q = self.win.fetch_op(me, layout::SELECTOR, FetchOp::NoOp, 0)?;
        self.win.flush_local(me)?;
        let tailpos = self
            .win
            .fetch_op(me, layout::tail(q as usize), FetchOp::NoOp, 0)?;
        self.win.flush_local(me)?;

        if tailpos > 0 {
            warn!(
                tailpos,
                "cowardly refusing to invoke unhandled incoming active messages on shutdown"
            );
        }

        self.rma.barrier()?;
        // Drop order releases the window first, then the locks and caches.
        Ok(())
    }
}
