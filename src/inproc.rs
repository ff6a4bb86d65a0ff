//! In-process RMA fabric: units are threads of one process.
//!
//! [`InprocFabric::create`] returns one [`InprocRma`] handle per unit; move
//! each into its unit's thread. Windows are plain shared memory, so remote
//! atomics map onto CPU atomics and the completion flushes reduce to fences.
//! This substrate backs the integration tests and single-node runs; it
//! deliberately implements nothing beyond the contract in [`crate::rma`].

use std::collections::HashMap;
use std::sync::atomic::{fence, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::rma::{FetchOp, IbarrierRequest, Rma, RmaWindow};

// ============================================================================
// Region
// ============================================================================

/// Backing store of one unit's window.
///
/// Allocated as 64-bit words so every 8-aligned offset can be accessed
/// atomically; the data areas are accessed bytewise through the same
/// allocation. Control words and data bytes never overlap, so the two access
/// modes never race on the same memory.
struct Region {
    words: Box<[AtomicI64]>,
}

impl Region {
    fn new(size: usize) -> Self {
        Self {
            words: (0..size.div_ceil(8)).map(|_| AtomicI64::new(0)).collect(),
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.words.len() * 8
    }

    #[inline]
    fn word(&self, offset: usize) -> &AtomicI64 {
        debug_assert_eq!(offset % 8, 0, "atomic access must be 8-aligned");
        &self.words[offset / 8]
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.words.as_ptr() as *mut u8
    }
}

// ============================================================================
// Fabric
// ============================================================================

struct FabricShared {
    team_size: usize,
    /// Per-unit collective epoch; a barrier is complete once every slot has
    /// reached the issuing epoch.
    arrivals: Box<[AtomicU64]>,
    /// Rendezvous for collective window allocation, keyed by each unit's
    /// allocation sequence number.
    exchange: Mutex<HashMap<u64, ExchangeSlot>>,
}

struct ExchangeSlot {
    regions: Vec<Option<Arc<Region>>>,
    taken: usize,
}

/// Factory for in-process teams.
pub struct InprocFabric;

impl InprocFabric {
    /// Create a team of `team_size` units and return one RMA handle per
    /// unit, indexed by unit id.
    ///
    /// # Panics
    /// Panics if `team_size` is 0.
    pub fn create(team_size: usize) -> Vec<InprocRma> {
        assert!(team_size > 0, "a team must have at least one unit");
        let shared = Arc::new(FabricShared {
            team_size,
            arrivals: (0..team_size).map(|_| AtomicU64::new(0)).collect(),
            exchange: Mutex::new(HashMap::new()),
        });
        (0..team_size)
            .map(|unit| InprocRma {
                shared: shared.clone(),
                unit,
                epoch: AtomicU64::new(0),
                alloc_seq: AtomicU64::new(0),
            })
            .collect()
    }
}

/// One unit's handle onto an in-process team.
pub struct InprocRma {
    shared: Arc<FabricShared>,
    unit: usize,
    /// Collective epoch of this unit; advanced by each barrier entry.
    epoch: AtomicU64,
    /// Number of collective allocations this unit has issued.
    alloc_seq: AtomicU64,
}

impl InprocRma {
    fn enter_barrier(&self) -> InprocIbarrier {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.arrivals[self.unit].store(epoch, Ordering::SeqCst);
        InprocIbarrier {
            shared: self.shared.clone(),
            epoch,
        }
    }
}

impl Rma for InprocRma {
    type Window = InprocWindow;
    type Ibarrier = InprocIbarrier;

    fn unit(&self) -> usize {
        self.unit
    }

    fn team_size(&self) -> usize {
        self.shared.team_size
    }

    fn allocate(&self, size: usize) -> Result<InprocWindow> {
        let seq = self.alloc_seq.fetch_add(1, Ordering::SeqCst);
        let mine = Arc::new(Region::new(size));

        {
            let mut exchange = self.shared.exchange.lock();
            let slot = exchange.entry(seq).or_insert_with(|| ExchangeSlot {
                regions: vec![None; self.shared.team_size],
                taken: 0,
            });
            slot.regions[self.unit] = Some(mine);
        }

        // All units have published their regions once the barrier completes.
        self.barrier()?;

        let regions = {
            let mut exchange = self.shared.exchange.lock();
            let slot = exchange.get_mut(&seq).expect("allocation rendezvous lost");
            let regions: Box<[Arc<Region>]> = slot
                .regions
                .iter()
                .map(|r| r.clone().expect("peer region missing"))
                .collect();
            slot.taken += 1;
            if slot.taken == self.shared.team_size {
                exchange.remove(&seq);
            }
            regions
        };

        Ok(InprocWindow {
            unit: self.unit,
            regions,
        })
    }

    fn barrier(&self) -> Result<()> {
        let mut request = self.enter_barrier();
        while !request.test()? {
            std::thread::yield_now();
        }
        Ok(())
    }

    fn ibarrier(&self) -> Result<InprocIbarrier> {
        Ok(self.enter_barrier())
    }
}

/// Split-phase barrier over the fabric's arrival counters.
pub struct InprocIbarrier {
    shared: Arc<FabricShared>,
    epoch: u64,
}

impl IbarrierRequest for InprocIbarrier {
    fn test(&mut self) -> Result<bool> {
        Ok(self
            .shared
            .arrivals
            .iter()
            .all(|a| a.load(Ordering::SeqCst) >= self.epoch))
    }
}

// ============================================================================
// Window
// ============================================================================

/// One unit's view of a collectively allocated in-process window.
pub struct InprocWindow {
    unit: usize,
    regions: Box<[Arc<Region>]>,
}

impl RmaWindow for InprocWindow {
    fn fetch_op(&self, target: usize, offset: usize, op: FetchOp, operand: i64) -> Result<i64> {
        let word = self.regions[target].word(offset);
        let prior = match op {
            FetchOp::Add => word.fetch_add(operand, Ordering::SeqCst),
            FetchOp::Replace => word.swap(operand, Ordering::SeqCst),
            FetchOp::NoOp => word.load(Ordering::SeqCst),
        };
        Ok(prior)
    }

    fn put(&self, target: usize, offset: usize, bytes: &[u8]) -> Result<()> {
        let region = &self.regions[target];
        assert!(offset + bytes.len() <= region.len(), "put out of bounds");
        // Safety: the caller holds an exclusive reservation on the range, so
        // no other thread reads or writes these bytes concurrently.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), region.base().add(offset), bytes.len());
        }
        Ok(())
    }

    fn flush_local(&self, _target: usize) -> Result<()> {
        // Shared memory: fetched values are already valid; the fence pins
        // the ordering the trait contract promises.
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn flush(&self, _target: usize) -> Result<()> {
        fence(Ordering::SeqCst);
        Ok(())
    }

    unsafe fn local_bytes(&self, offset: usize, len: usize) -> &[u8] {
        let region = &self.regions[self.unit];
        assert!(offset + len <= region.len(), "local read out of bounds");
        std::slice::from_raw_parts(region.base().add(offset) as *const u8, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fetch_op_semantics() {
        let rmas = InprocFabric::create(1);
        let win = rmas[0].allocate(64).unwrap();

        assert_eq!(win.fetch_op(0, 0, FetchOp::NoOp, 99).unwrap(), 0);
        assert_eq!(win.fetch_op(0, 0, FetchOp::Add, 5).unwrap(), 0);
        assert_eq!(win.fetch_op(0, 0, FetchOp::Add, -2).unwrap(), 5);
        assert_eq!(win.fetch_op(0, 0, FetchOp::Replace, 42).unwrap(), 3);
        assert_eq!(win.fetch_op(0, 0, FetchOp::NoOp, 0).unwrap(), 42);
    }

    #[test]
    fn test_put_then_local_bytes() {
        let rmas = InprocFabric::create(1);
        let win = rmas[0].allocate(64).unwrap();

        win.put(0, 40, b"hello").unwrap();
        win.flush(0).unwrap();
        let bytes = unsafe { win.local_bytes(40, 5) };
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn test_windows_are_zeroed() {
        let rmas = InprocFabric::create(1);
        let win = rmas[0].allocate(128).unwrap();
        assert_eq!(unsafe { win.local_bytes(0, 128) }, &[0u8; 128][..]);
    }

    #[test]
    fn test_collective_allocate_and_remote_put() {
        let rmas = InprocFabric::create(2);
        let mut rmas = rmas.into_iter();
        let (r0, r1) = (rmas.next().unwrap(), rmas.next().unwrap());

        thread::scope(|s| {
            s.spawn(move || {
                let win = r0.allocate(64).unwrap();
                // Signal unit 1 through its own window.
                win.put(1, 8, &[7u8]).unwrap();
                win.flush(1).unwrap();
                win.fetch_op(1, 0, FetchOp::Add, 1).unwrap();
                win.flush(1).unwrap();
                r0.barrier().unwrap();
            });
            s.spawn(move || {
                let win = r1.allocate(64).unwrap();
                while win.fetch_op(1, 0, FetchOp::NoOp, 0).unwrap() == 0 {
                    std::hint::spin_loop();
                }
                win.flush_local(1).unwrap();
                assert_eq!(unsafe { win.local_bytes(8, 1) }, &[7u8]);
                r1.barrier().unwrap();
            });
        });
    }

    #[test]
    fn test_ibarrier_completes_only_after_all_arrive() {
        let rmas = InprocFabric::create(2);
        let mut rmas = rmas.into_iter();
        let (r0, r1) = (rmas.next().unwrap(), rmas.next().unwrap());

        let mut req = r0.ibarrier().unwrap();
        assert!(!req.test().unwrap());

        thread::scope(|s| {
            s.spawn(move || {
                r1.barrier().unwrap();
            });
            while !req.test().unwrap() {
                thread::yield_now();
            }
        });
    }
}
