//! Bounded lock-free MPMC FIFO.
//!
//! A fixed-capacity ring of pointer slots (null means empty). Producers and
//! consumers claim positions with fetch_add on two monotonically increasing
//! 64-bit indices; a separate size word reserves capacity before a position is
//! claimed, so at most `capacity` elements are ever in flight per lap.
//!
//! Claiming a position and publishing into its slot are two separate steps, so
//! a consumer can reach a slot before the matching producer has stored into
//! it (and a producer can reach a slot the previous lap's consumer has not
//! cleared yet). Both sides spin across that window. The wait is bounded:
//! [`ConcurrentFifo::take`] may only be called by a caller holding evidence
//! that a matching append has happened or is in its claim-to-publish window,
//! and that window contains no fallible work.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::thread;

use crate::common::CachePadded;

/// Spins before a waiting take starts yielding the CPU.
const TAKE_SPIN_LIMIT: u32 = 128;

/// Bounded MPMC queue of boxed elements.
pub struct ConcurrentFifo<T> {
    slots: Box<[AtomicPtr<T>]>,
    capacity: u32,
    mask: u64,
    size: CachePadded<AtomicU32>,
    append_index: CachePadded<AtomicU64>,
    take_index: CachePadded<AtomicU64>,
}

unsafe impl<T: Send> Send for ConcurrentFifo<T> {}
unsafe impl<T: Send> Sync for ConcurrentFifo<T> {}

impl<T> ConcurrentFifo<T> {
    /// Creates a queue with `capacity` slots. `capacity` must be a power of
    /// two so positions can be masked into slot indices.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());
        assert!(capacity <= u32::MAX as usize);
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            capacity: capacity as u32,
            mask: capacity as u64 - 1,
            size: CachePadded::new(AtomicU32::new(0)),
            append_index: CachePadded::new(AtomicU64::new(0)),
            take_index: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Number of published elements. Approximate under concurrency.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempts to publish `elem`, returning it when the queue is full.
    pub fn try_append(&self, elem: Box<T>) -> Result<(), Box<T>> {
        // Reserve capacity first. The reservation caps how far append
        // positions can run ahead of take positions, which is what makes the
        // publish spin below finite.
        let mut size = self.size.load(Ordering::Relaxed);
        loop {
            if size == self.capacity {
                return Err(elem);
            }
            match self.size.compare_exchange_weak(
                size,
                size + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => size = observed,
            }
        }

        // Nothing fallible may happen between claiming the position and
        // publishing the slot; a waiting consumer spins on this slot with no
        // timeout. Unboxing to a raw pointer up front keeps the window to a
        // spin and a store.
        let elem = Box::into_raw(elem);
        let pos = self.append_index.fetch_add(1, Ordering::Relaxed);
        let slot = &self.slots[(pos & self.mask) as usize];

        // The consumer of the previous lap may not have cleared the slot yet.
        while !slot.load(Ordering::Acquire).is_null() {
            std::hint::spin_loop();
        }
        slot.store(elem, Ordering::Release);
        Ok(())
    }

    /// Claims and returns the next element.
    ///
    /// Callers must hold evidence that at least one matching append has
    /// happened or is about to complete: either they decremented the packed
    /// request count (which is only incremented after a successful append),
    /// or they themselves just appended an element that has not been counted.
    /// Without that evidence this call can spin forever.
    pub fn take(&self) -> Box<T> {
        let pos = self.take_index.fetch_add(1, Ordering::Relaxed);
        let slot = &self.slots[(pos & self.mask) as usize];

        let mut spins = 0u32;
        loop {
            let elem = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !elem.is_null() {
                self.size.fetch_sub(1, Ordering::Release);
                return unsafe { Box::from_raw(elem) };
            }
            // The producer claimed this position but has not published yet.
            if spins < TAKE_SPIN_LIMIT {
                std::hint::spin_loop();
            } else {
                thread::yield_now();
            }
            spins += 1;
        }
    }
}

impl<T> Drop for ConcurrentFifo<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            let elem = *slot.get_mut();
            if !elem.is_null() {
                drop(unsafe { Box::from_raw(elem) });
            }
        }
    }
}

impl<T> fmt::Debug for ConcurrentFifo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size={}, appendIndex={}, takeIndex={}",
            self.size.load(Ordering::Acquire),
            self.append_index.load(Ordering::Acquire),
            self.take_index.load(Ordering::Acquire),
        )
    }
}
