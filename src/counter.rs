//! Packed worker/request counter.
//!
//! A single 32-bit word holds two counters so that both can be observed and
//! updated in one atomic operation:
//!
//! - **request count** (bits 0..20): a lower bound of the pairs in the queue
//!   that have been reserved for workers. Incremented after a successful
//!   enqueue, decremented before dequeuing, so the number of
//!   [`ConcurrentFifo::take`](crate::ConcurrentFifo::take) calls it licenses
//!   never exceeds the number of successful appends.
//! - **active workers** (bits 20..32): the number of currently running
//!   workers.
//!
//! Keeping both in one word is load-bearing: with two separate atomics a
//! producer could observe a full worker roster on one word while the last
//! worker retires through the other, stranding a counted request with nobody
//! to take it. Every update here CASes the full word against a snapshot the
//! caller previously loaded, which makes that interleaving unrepresentable.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::common::CachePadded;

/// Mask of the request-count bits.
pub const REQUEST_COUNT_MASK: u32 = 0x000F_FFFF;

/// Bit offset of the active-workers count.
pub const ACTIVE_WORKERS_BIT_OFFSET: u32 = 20;

/// Largest representable active-workers count.
pub const ACTIVE_WORKERS_MAX: u32 = 0x0000_0FFF;

const ONE_REQUEST: u32 = 1;
const ONE_ACTIVE_WORKER: u32 = 1 << ACTIVE_WORKERS_BIT_OFFSET;

/// A consistent view of both counters, read with a single load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Snapshot {
    raw: u32,
}

impl Snapshot {
    /// Number of active workers at the time of the snapshot.
    #[inline]
    pub fn active_workers(self) -> u32 {
        self.raw >> ACTIVE_WORKERS_BIT_OFFSET
    }

    /// Lower bound of reserved queued pairs at the time of the snapshot.
    #[inline]
    pub fn request_count(self) -> u32 {
        self.raw & REQUEST_COUNT_MASK
    }
}

/// The packed counter word.
///
/// All transitions CAS against a caller-provided [`Snapshot`] and report
/// whether they won; callers re-read and retry on failure. The guards on each
/// transition (worker target not reached, request count non-zero, and so on)
/// are the caller's responsibility because they belong to the retry loop that
/// owns the snapshot.
pub struct PackedCounter {
    word: CachePadded<AtomicU32>,
}

impl PackedCounter {
    pub fn new() -> Self {
        Self {
            word: CachePadded::new(AtomicU32::new(0)),
        }
    }

    /// Loads both counters at once.
    #[inline]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            raw: self.word.load(Ordering::Acquire),
        }
    }

    #[inline]
    fn transition(&self, seen: Snapshot, target: u32) -> bool {
        self.word
            .compare_exchange(seen.raw, target, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Reserves one worker slot. The request count is untouched.
    pub fn try_reserve_worker(&self, seen: Snapshot) -> bool {
        debug_assert!(seen.active_workers() < ACTIVE_WORKERS_MAX);
        self.transition(seen, seen.raw + ONE_ACTIVE_WORKER)
    }

    /// Releases one worker slot. Callers must have observed a zero request
    /// count in `seen`; otherwise a counted pair could be left with no worker.
    pub fn try_retire_worker(&self, seen: Snapshot) -> bool {
        debug_assert!(seen.active_workers() > 0);
        debug_assert_eq!(seen.request_count(), 0);
        self.transition(seen, seen.raw - ONE_ACTIVE_WORKER)
    }

    /// Counts one freshly enqueued pair. Callers must have observed the
    /// worker roster at target in `seen`, which pins at least one worker
    /// until the count drains back to zero.
    pub fn try_increment_requests(&self, seen: Snapshot) -> bool {
        debug_assert!(seen.active_workers() > 0);
        self.transition(seen, seen.raw + ONE_REQUEST)
    }

    /// Reserves `n` counted pairs for the calling worker's batch.
    pub fn try_decrement_requests(&self, seen: Snapshot, n: u32) -> bool {
        debug_assert!(n >= 1);
        debug_assert!(n <= seen.request_count());
        self.transition(seen, seen.raw - n)
    }
}
