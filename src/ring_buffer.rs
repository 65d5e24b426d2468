/// Lock-free byte ring shared between the foreground and the interrupt handler.
///
/// One side pushes, the other pops. Cursors are free-running `usize` counters; the slot index is
/// the cursor modulo the capacity. The read cursor is advanced with compare-and-swap so the
/// producer can drop the oldest byte (overwrite on full) and `clear` can run from either side
/// without a lock. Slots are atomics, so a pop racing an overwrite reads a stale value and retries
/// instead of tearing.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

pub struct RingBuffer {
    slots: Box<[AtomicU8]>,
    /// Write cursor, advanced only by the producer
    head: AtomicUsize,
    /// Read cursor
    tail: AtomicUsize,
}

impl RingBuffer {
    /// Create an empty ring holding up to `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        RingBuffer {
            slots: (0..capacity).map(|_| AtomicU8::new(0)).collect(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Producer side. Returns `false` and leaves the ring untouched when full.
    pub fn push(&self, byte: u8) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.capacity() {
            return false;
        }
        self.store(head, byte);
        true
    }

    /// Producer side. Always stores `byte`, discarding the oldest byte when full.
    /// Returns `true` if a byte was discarded.
    pub fn push_overwrite(&self, byte: u8) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let mut dropped = false;
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if head.wrapping_sub(tail) < self.capacity() {
                break;
            }
            if self
                .tail
                .compare_exchange(tail, tail.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                dropped = true;
                break;
            }
        }
        self.store(head, byte);
        dropped
    }

    /// Consumer side.
    pub fn pop(&self) -> Option<u8> {
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let head = self.head.load(Ordering::Acquire);
            if tail == head {
                return None;
            }
            let byte = self.slots[tail % self.capacity()].load(Ordering::Relaxed);
            if self
                .tail
                .compare_exchange(tail, tail.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(byte);
            }
        }
    }

    /// Pop up to `out.len()` bytes, returning how many were copied.
    pub fn pop_into(&self, out: &mut [u8]) -> usize {
        let mut count = 0;
        for slot in out.iter_mut() {
            match self.pop() {
                Some(byte) => {
                    *slot = byte;
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    /// Discard everything currently stored.
    pub fn clear(&self) {
        let head = self.head.load(Ordering::Acquire);
        let mut tail = self.tail.load(Ordering::Acquire);
        // A concurrent pop may already have moved past the snapshot; never move the cursor back.
        while (head.wrapping_sub(tail) as isize) > 0 {
            match self
                .tail
                .compare_exchange(tail, head, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => tail = current,
            }
        }
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.wrapping_sub(tail).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    fn store(&self, head: usize, byte: u8) {
        self.slots[head % self.capacity()].store(byte, Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    /// Producers never run more than this many bytes ahead of what the consumer has seen, so a
    /// popped byte maps back to exactly one sequence number.
    const MAX_LEAD: usize = 200;

    /// Sequence number of `byte`, given that every number below `seen` was already consumed.
    fn sequence_of(seen: usize, byte: u8) -> usize {
        seen + byte.wrapping_sub(seen as u8) as usize
    }

    /// Pop until `done` is set and the ring is empty, checking that sequence numbers only move
    /// forward. Returns how many bytes were popped.
    fn consume_in_order(ring: &RingBuffer, seen: &AtomicUsize, done: &AtomicBool) -> usize {
        let mut popped = 0;
        loop {
            let finished = done.load(Ordering::Acquire);
            match ring.pop() {
                Some(byte) => {
                    let current = seen.load(Ordering::Relaxed);
                    let index = sequence_of(current, byte);
                    // A duplicate or an older byte wraps around to a huge lead.
                    assert!(
                        index <= current + MAX_LEAD,
                        "byte {} out of order after {}",
                        byte,
                        current
                    );
                    seen.store(index + 1, Ordering::Release);
                    popped += 1;
                }
                None if finished => return popped,
                None => thread::yield_now(),
            }
        }
    }

    #[test]
    fn test_fifo_order() {
        let ring = RingBuffer::new(8);
        for b in 0..5u8 {
            assert!(ring.push(b));
        }
        for b in 0..5u8 {
            assert_eq!(ring.pop(), Some(b));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_full_rejects_push() {
        let ring = RingBuffer::new(3);
        assert!(ring.push(1));
        assert!(ring.push(2));
        assert!(ring.push(3));
        assert!(ring.is_full());
        assert!(!ring.push(4));
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.pop(), Some(1));
    }

    #[test]
    fn test_overwrite_drops_oldest() {
        let ring = RingBuffer::new(3);
        assert!(!ring.push_overwrite(1));
        assert!(!ring.push_overwrite(2));
        assert!(!ring.push_overwrite(3));
        assert!(ring.push_overwrite(4));
        assert_eq!(ring.len(), 3);

        let mut out = [0u8; 4];
        assert_eq!(ring.pop_into(&mut out), 3);
        assert_eq!(&out[..3], &[2, 3, 4]);
    }

    #[test]
    fn test_wraparound() {
        let ring = RingBuffer::new(4);
        for round in 0..10u8 {
            for i in 0..3 {
                assert!(ring.push(round * 10 + i));
            }
            for i in 0..3 {
                assert_eq!(ring.pop(), Some(round * 10 + i));
            }
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_clear() {
        let ring = RingBuffer::new(4);
        ring.push(1);
        ring.push(2);
        ring.clear();
        assert!(ring.is_empty());
        assert!(ring.push(3));
        assert_eq!(ring.pop(), Some(3));
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let ring = Arc::new(RingBuffer::new(16));
        let producer_ring = Arc::clone(&ring);
        let total = 10_000usize;

        let producer = thread::spawn(move || {
            for i in 0..total {
                while !producer_ring.push((i % 251) as u8) {
                    thread::yield_now();
                }
            }
        });

        let mut received = 0usize;
        while received < total {
            match ring.pop() {
                Some(byte) => {
                    assert_eq!(byte, (received % 251) as u8);
                    received += 1;
                }
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert!(ring.is_empty());
    }

    #[test]
    fn test_concurrent_overwrite_keeps_order() {
        let ring = Arc::new(RingBuffer::new(7));
        let seen = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let total = 200_000usize;

        let producer = {
            let (ring, seen, done) = (Arc::clone(&ring), Arc::clone(&seen), Arc::clone(&done));
            thread::spawn(move || {
                let mut dropped = 0usize;
                for i in 0..total {
                    while i > seen.load(Ordering::Acquire) + MAX_LEAD {
                        thread::yield_now();
                    }
                    if ring.push_overwrite(i as u8) {
                        dropped += 1;
                    }
                }
                done.store(true, Ordering::Release);
                dropped
            })
        };

        let popped = consume_in_order(&ring, &seen, &done);
        let dropped = producer.join().unwrap();
        // Nothing is both delivered and discarded, and the newest byte is never lost.
        assert_eq!(popped + dropped, total);
        assert_eq!(seen.load(Ordering::Acquire), total);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_concurrent_clear_never_replays() {
        let ring = Arc::new(RingBuffer::new(8));
        let seen = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let total = 100_000usize;

        let consumer = {
            let (ring, seen, done) = (Arc::clone(&ring), Arc::clone(&seen), Arc::clone(&done));
            thread::spawn(move || consume_in_order(&ring, &seen, &done))
        };

        for i in 0..total {
            while i > seen.load(Ordering::Acquire) + MAX_LEAD {
                thread::yield_now();
            }
            if i % 5 == 0 {
                ring.clear();
            }
            while !ring.push(i as u8) {
                thread::yield_now();
            }
        }
        done.store(true, Ordering::Release);

        let popped = consumer.join().unwrap();
        assert!(popped > 0 && popped <= total);
        assert_eq!(seen.load(Ordering::Acquire), total);
        assert!(ring.is_empty());
    }
}
