use crate::invariants::debug_assert_cell_sequence;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::hint;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicIsize, Ordering};

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// This is the bounded multiple-producer multiple-consumer ring described by
// Dmitry Vyukov on 1024cores, used here as the ready ring, the worker-0 local
// ring and the free-slot rings of the fiber and chain pools.
//
// ## Per-Cell Sequence Numbers
//
// Each cell carries an unbounded isize sequence. At rest, cell `i` observed
// from position `pos` (with `pos & mask == i`) is in one of three states:
// - `seq == pos`            the cell is empty, a producer may claim it
// - `seq == pos + 1`        the cell is full, a consumer may claim it
// - `seq == pos + capacity` the cell was just consumed; the producer one lap
//                           ahead claims it next
//
// ## Memory Ordering Protocol
//
// **Producer (enqueue):**
// 1. Load `enqueue_pos` with Relaxed (the cursor carries no data)
// 2. Load the cell `sequence` with Acquire (synchronizes with the consumer's
//    lap-advancing Release store)
// 3. If `seq == pos`: claim the position with a weak Relaxed compare-exchange
// 4. Write the payload (protected by the claim, no ordering needed)
// 5. Store `sequence = pos + 1` with Release (publishes the payload)
//
// **Consumer (dequeue):**
// 1. Load `dequeue_pos` with Relaxed
// 2. Load the cell `sequence` with Acquire (synchronizes with step 5 above;
//    this pairing is what makes an enqueued payload visible to its dequeuer)
// 3. If `seq == pos + 1`: claim the position with a weak Relaxed
//    compare-exchange
// 4. Read the payload out
// 5. Store `sequence = pos + capacity` with Release (frees the cell for the
//    producer one lap ahead)
//
// The cursors never synchronize anything by themselves; all payload
// visibility flows through the sequence fields. No total order between
// unrelated enqueues is implied.
//
// ## False Sharing
//
// The producer cursor, the consumer cursor and the cell array live in three
// separate cache-padded regions.
//
// =============================================================================

struct Cell<T> {
    sequence: AtomicIsize,
    slot: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded MPMC ring buffer.
///
/// Fixed power-of-two capacity, no blocking, no allocation after
/// construction. `enqueue` on a full ring and `dequeue` on an empty ring are
/// observable outcomes, not errors.
pub struct Mpmc<T> {
    // === PRODUCER HOT ===
    enqueue_pos: CachePadded<AtomicIsize>,

    // === CONSUMER HOT ===
    dequeue_pos: CachePadded<AtomicIsize>,

    // === SHARED CELLS ===
    buffer: CachePadded<Box<[Cell<T>]>>,
    mask: isize,
}

// Safety: cells are claimed through the sequence protocol before any slot
// access; the protocol provides the required synchronization.
unsafe impl<T: Send> Send for Mpmc<T> {}
unsafe impl<T: Send> Sync for Mpmc<T> {}

impl<T> Mpmc<T> {
    /// Creates a ring with `capacity` cells.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or not a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity.is_power_of_two(),
            "mpmc capacity must be a non-zero power of two"
        );

        let buffer = (0..capacity)
            .map(|i| Cell {
                sequence: AtomicIsize::new(i as isize),
                slot: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            enqueue_pos: CachePadded::new(AtomicIsize::new(0)),
            dequeue_pos: CachePadded::new(AtomicIsize::new(0)),
            buffer: CachePadded::new(buffer),
            mask: capacity as isize - 1,
        }
    }

    /// Returns the ring capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Returns an instantaneous element count.
    ///
    /// Only a hint under concurrent use; exact when the ring is quiescent.
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.enqueue_pos.load(Ordering::Relaxed);
        let head = self.dequeue_pos.load(Ordering::Relaxed);
        tail.saturating_sub(head).max(0) as usize
    }

    /// Returns true if the ring observed no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempts to enqueue `value`.
    ///
    /// Returns `Err(value)` back to the caller when the ring is full.
    pub fn enqueue(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[(pos & self.mask) as usize];
            let seq = cell.sequence.load(Ordering::Acquire);
            let delta = seq - pos;
            debug_assert_cell_sequence!(delta, self.capacity());

            if delta == 0 {
                // Cell is empty at our position: claim it. Weak exchange, as
                // this sits in a retry loop (spurious failure is just a lap).
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the claim above grants exclusive write
                        // access to this slot until the Release store below.
                        unsafe { (*cell.slot.get()).write(value) };
                        cell.sequence.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if delta < 0 {
                // The cell still holds a value from the previous lap.
                return Err(value);
            } else {
                // Another producer advanced past us; reload and retry.
                hint::spin_loop();
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Attempts to dequeue a value.
    ///
    /// Returns `None` when the ring is empty.
    pub fn dequeue(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[(pos & self.mask) as usize];
            let seq = cell.sequence.load(Ordering::Acquire);
            let delta = seq - (pos + 1);
            debug_assert_cell_sequence!(delta, self.capacity());

            if delta == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the claim above grants exclusive read
                        // access; the Acquire load of `sequence` synchronized
                        // with the producer's Release publish.
                        let value = unsafe { (*cell.slot.get()).assume_init_read() };
                        // Advance the cell one lap: the next producer claims
                        // it at `pos + capacity`.
                        cell.sequence.store(pos + self.mask + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if delta < 0 {
                // The cell has not been published at our position yet.
                return None;
            } else {
                hint::spin_loop();
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for Mpmc<T> {
    fn drop(&mut self) {
        // Drop whatever is still enqueued. Exclusive access: &mut self.
        while let Some(value) = self.dequeue() {
            drop(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_enqueue_dequeue_roundtrip() {
        let ring = Mpmc::<u64>::with_capacity(8);

        for i in 0..8 {
            assert!(ring.enqueue(i).is_ok());
        }
        assert!(ring.enqueue(99).is_err(), "ring should be full");

        for i in 0..8 {
            assert_eq!(ring.dequeue(), Some(i));
        }
        assert_eq!(ring.dequeue(), None, "ring should be empty");
    }

    #[test]
    fn test_wraparound_many_laps() {
        let ring = Mpmc::<u32>::with_capacity(4);

        for lap in 0..100u32 {
            for i in 0..4 {
                assert!(ring.enqueue(lap * 4 + i).is_ok());
            }
            for i in 0..4 {
                assert_eq!(ring.dequeue(), Some(lap * 4 + i));
            }
        }
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_rejects_non_pow2_capacity() {
        let _ = Mpmc::<u8>::with_capacity(12);
    }

    // Eight producers of consecutive integers against four consumers: every
    // enqueued value is dequeued exactly once and the producers drain.
    #[test]
    fn test_concurrent_producers_consumers() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 10_000;
        const CONSUMERS: usize = 4;
        const PER_CONSUMER: usize = PRODUCERS * PER_PRODUCER / CONSUMERS;

        let ring = Arc::new(Mpmc::<usize>::with_capacity(1024));
        let mut handles = vec![];

        for p in 0..PRODUCERS {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut value = p * PER_PRODUCER + i;
                    loop {
                        match ring.enqueue(value) {
                            Ok(()) => break,
                            Err(back) => {
                                value = back;
                                thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    let mut seen = Vec::with_capacity(PER_CONSUMER);
                    while seen.len() < PER_CONSUMER {
                        if let Some(v) = ring.dequeue() {
                            seen.push(v);
                        } else {
                            thread::yield_now();
                        }
                    }
                    seen
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let mut all = HashSet::new();
        for consumer in consumers {
            for v in consumer.join().unwrap() {
                assert!(v < PRODUCERS * PER_PRODUCER, "value {v} was never enqueued");
                assert!(all.insert(v), "value {v} dequeued twice");
            }
        }
        assert_eq!(all.len(), PRODUCERS * PER_PRODUCER);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_drop_drains_remaining() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        DROPS.store(0, Ordering::SeqCst);
        {
            let ring = Mpmc::<Tracked>::with_capacity(8);
            for _ in 0..5 {
                assert!(ring.enqueue(Tracked).is_ok());
            }
            let consumed = ring.dequeue();
            assert!(consumed.is_some());
            drop(consumed);
            assert_eq!(DROPS.load(Ordering::SeqCst), 1);
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 5);
    }
}
