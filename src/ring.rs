use std::cell::UnsafeCell;
use std::cmp::max;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

pub const IPV4_HDR_SIZE: usize = 20;
pub const UDP_HDR_SIZE: usize = 8;

/// Largest payload a single UDP datagram can carry over IPv4, which is the
/// capacity every ring slot is allocated with. Slots are never resized, so
/// a receive can always run without knowing the datagram size up front.
pub const SLOT_CAPACITY: usize = 0xffff - IPV4_HDR_SIZE - UDP_HDR_SIZE;

/// Cursor value meaning no write (or read) has completed yet. Kept distinct
/// from every valid slot index so the initial state never aliases slot 0.
const VACANT: usize = usize::MAX;

struct Slot {
    data: Box<[u8]>,
    read: usize,
}

impl Slot {
    fn empty() -> Self {
        Self {
            data: vec![0u8; SLOT_CAPACITY].into_boxed_slice(),
            read: 0,
        }
    }
}

/// Single-producer single-consumer ring of datagram slots.
///
/// The receiver thread is the only writer of `write_index` and of slot
/// contents; the processor thread is the only reader of slots and, outside
/// of growth, the only writer of `read_index`. A write is published by
/// storing `write_index` after the slot bytes and length are in place, so
/// the consumer side needs no lock to read a published slot.
///
/// One slot is always left unused so that `read_index == write_index`
/// unambiguously means empty. When the producer is about to wrap into the
/// consumer frontier it grows the ring instead, inserting fresh slots right
/// after the write cursor so already buffered datagrams keep their order.
pub(crate) struct RingBuffer {
    slots: UnsafeCell<Vec<UnsafeCell<Slot>>>,
    write_index: CachePadded<AtomicUsize>,
    read_index: CachePadded<AtomicUsize>,
    grow_lock: Mutex<()>,
}

unsafe impl Send for RingBuffer {}

// SAFETY: access follows a strict SPSC protocol. The slot vec itself is only
// touched with `grow_lock` held (growth on the producer side, the whole drain
// on the consumer side) or by the producer alone, which is also the only
// thread that mutates it. Slot contents are written by the producer strictly
// before the slot index is published through `write_index` (Release), and the
// consumer only dereferences slots whose index it observed through an Acquire
// load, so the two threads never hold references into the same slot.
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Allocate `max(1, total_bytes / SLOT_CAPACITY)` empty slots.
    pub fn new(total_bytes: usize) -> Self {
        Self {
            slots: UnsafeCell::new(Self::allocate(total_bytes)),
            write_index: CachePadded::new(AtomicUsize::new(VACANT)),
            read_index: CachePadded::new(AtomicUsize::new(VACANT)),
            grow_lock: Mutex::new(()),
        }
    }

    fn allocate(total_bytes: usize) -> Vec<UnsafeCell<Slot>> {
        (0..max(1, total_bytes / SLOT_CAPACITY))
            .map(|_| UnsafeCell::new(Slot::empty()))
            .collect()
    }

    /// Drop the current slots and allocate a fresh ring for `total_bytes`.
    /// The owning flow guarantees both threads are stopped when this runs.
    pub fn resize(&self, total_bytes: usize) {
        let _guard = self.grow_lock.lock();
        unsafe { *self.slots.get() = Self::allocate(total_bytes) };
        self.write_index.store(VACANT, Ordering::Release);
        self.read_index.store(VACANT, Ordering::Release);
    }

    pub fn slot_count(&self) -> usize {
        let _guard = self.grow_lock.lock();
        unsafe { (*self.slots.get()).len() }
    }

    fn claimed_write_pos(&self, len: usize) -> usize {
        match self.write_index.load(Ordering::Relaxed) {
            VACANT => 0,
            w => (w + 1) % len,
        }
    }

    /// True when the next write would land on the consumer frontier. That is
    /// the moment the producer must grow the ring instead of wrapping into
    /// unread datagrams. Producer side only.
    pub fn write_would_overrun(&self) -> bool {
        // Only the producer mutates the vec, so reading its length without
        // the lock is fine on this thread.
        let len = unsafe { (*self.slots.get()).len() };
        let frontier = match self.read_index.load(Ordering::Acquire) {
            // Nothing consumed yet behaves like a consumer parked on the
            // slot just before index 0.
            VACANT => len - 1,
            r => r,
        };

        self.claimed_write_pos(len) == frontier
    }

    /// Insert `max(1, N / 4)` empty slots immediately after the write
    /// cursor, shifting the read cursor when the insertion point displaces
    /// it. Serialized against the consumer's drain by the growth lock, so
    /// the cursor adjustment and the slot insertions are observed together.
    /// Producer side only.
    pub fn grow(&self) {
        let _guard = self.grow_lock.lock();

        // Exclusive: the consumer only touches the vec while holding the
        // growth lock, which this thread now owns.
        let slots = unsafe { &mut *self.slots.get() };
        let increase = max(1, slots.len() / 4);

        // Unwrapped insertion position. When the write cursor sits on the
        // last slot this appends at the end instead of rotating the whole
        // vec through index 0, which would detach the cursor from its slot.
        let insert_at = match self.write_index.load(Ordering::Relaxed) {
            VACANT => 0,
            w => w + 1,
        };

        for _ in 0..increase {
            slots.insert(insert_at, UnsafeCell::new(Slot::empty()));
        }

        let read = self.read_index.load(Ordering::Relaxed);
        if read != VACANT && read >= insert_at {
            self.read_index.store(read + increase, Ordering::Release);
        }
    }

    /// Receive one datagram into the next free slot. `recv` fills the slot
    /// and reports how many bytes landed in it; the write cursor is only
    /// published once the contents are complete, so the consumer never
    /// observes a half-written slot. Producer side only.
    ///
    /// `Ok(None)` passes through `recv` reporting end of burst, and also
    /// covers zero-length reads. Errors are the caller's fatal condition.
    pub fn produce_with<F>(&self, recv: F) -> io::Result<Option<usize>>
    where
        F: FnOnce(&mut [u8]) -> io::Result<Option<usize>>,
    {
        let slots = unsafe { &*self.slots.get() };
        let pos = self.claimed_write_pos(slots.len());

        // The claimed slot is outside the published range, so the consumer
        // cannot be holding a reference into it.
        let slot = unsafe { &mut *slots[pos].get() };
        match recv(&mut slot.data)? {
            Some(n) if n > 0 => {
                slot.read = n;
                self.write_index.store(pos, Ordering::Release);
                Ok(Some(n))
            }
            _ => Ok(None),
        }
    }

    /// Consume every slot published since the previous drain, in arrival
    /// order. The growth lock is held for the whole drain so the slot vec
    /// cannot move underneath the read cursor. Consumer side only.
    pub fn drain<F>(&self, mut consume: F)
    where
        F: FnMut(&[u8]),
    {
        let _guard = self.grow_lock.lock();
        let slots = unsafe { &*self.slots.get() };

        loop {
            let write = self.write_index.load(Ordering::Acquire);
            if write == VACANT {
                break;
            }

            let read = self.read_index.load(Ordering::Relaxed);
            if read == write {
                break;
            }

            let next = match read {
                VACANT => 0,
                r => (r + 1) % slots.len(),
            };

            // Advance before inspection; the slot is immutable from the
            // moment its index was published.
            self.read_index.store(next, Ordering::Release);

            let slot = unsafe { &*slots[next].get() };
            consume(&slot.data[..slot.read]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn produce(ring: &RingBuffer, payload: &[u8]) {
        let stored = ring
            .produce_with(|buf| {
                buf[..payload.len()].copy_from_slice(payload);
                Ok(Some(payload.len()))
            })
            .unwrap();
        assert_eq!(stored, Some(payload.len()));
    }

    fn drain_all(ring: &RingBuffer) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        ring.drain(|datagram| out.push(datagram.to_vec()));
        out
    }

    #[test]
    fn sizing_rounds_down_with_floor_of_one() {
        assert_eq!(RingBuffer::new(0).slot_count(), 1);
        assert_eq!(RingBuffer::new(SLOT_CAPACITY - 1).slot_count(), 1);
        assert_eq!(RingBuffer::new(4 * SLOT_CAPACITY).slot_count(), 4);
    }

    #[test]
    fn empty_ring_drains_nothing() {
        let ring = RingBuffer::new(4 * SLOT_CAPACITY);
        assert!(drain_all(&ring).is_empty());
    }

    #[test]
    fn fifo_order_without_growth() {
        let ring = RingBuffer::new(8 * SLOT_CAPACITY);
        for i in 0..7u8 {
            produce(&ring, &[i, i, i]);
        }

        let drained = drain_all(&ring);
        assert_eq!(drained.len(), 7);
        for (i, datagram) in drained.iter().enumerate() {
            assert_eq!(datagram.as_slice(), &[i as u8, i as u8, i as u8]);
        }
    }

    #[test]
    fn zero_length_reads_are_not_published() {
        let ring = RingBuffer::new(2 * SLOT_CAPACITY);
        assert_eq!(ring.produce_with(|_| Ok(Some(0))).unwrap(), None);
        assert_eq!(ring.produce_with(|_| Ok(None)).unwrap(), None);
        assert!(drain_all(&ring).is_empty());
    }

    #[test]
    fn receive_errors_propagate_without_publishing() {
        let ring = RingBuffer::new(2 * SLOT_CAPACITY);
        let err = ring
            .produce_with(|_| Err(io::Error::new(io::ErrorKind::Other, "boom")))
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(drain_all(&ring).is_empty());
    }

    #[test]
    fn overrun_triggers_exactly_at_the_reserved_slot() {
        let ring = RingBuffer::new(4 * SLOT_CAPACITY);

        // Three writes fill a four slot ring up to the reserved slot.
        for i in 0..3u8 {
            assert!(!ring.write_would_overrun());
            produce(&ring, &[i]);
        }
        assert!(ring.write_would_overrun());
    }

    #[test]
    fn growth_under_pressure_preserves_order() {
        let ring = RingBuffer::new(2 * SLOT_CAPACITY);
        let mut fed = Vec::new();

        for i in 0..64u8 {
            if ring.write_would_overrun() {
                ring.grow();
                assert!(!ring.write_would_overrun());
            }
            produce(&ring, &[i]);
            fed.push(vec![i]);
        }

        assert!(ring.slot_count() > 2);
        assert_eq!(drain_all(&ring), fed);
    }

    #[test]
    fn growth_with_wrapped_cursors_preserves_order() {
        let ring = RingBuffer::new(4 * SLOT_CAPACITY);

        // Park the cursors in the middle of the ring.
        for i in 0..3u8 {
            produce(&ring, &[i]);
        }
        assert_eq!(drain_all(&ring).len(), 3);

        // Wrap the producer until it hits the consumer frontier, growing
        // whenever the reserved slot comes up, and drain between bursts so
        // the cursors sit at a different position each round.
        let mut next = 3u8;
        let mut collected = Vec::new();
        let mut grown = 0;
        for _ in 0..5 {
            for _ in 0..4 {
                if ring.write_would_overrun() {
                    ring.grow();
                    grown += 1;
                }
                produce(&ring, &[next]);
                next = next.wrapping_add(1);
            }
            collected.extend(drain_all(&ring));
        }

        assert!(grown > 0);
        let expected: Vec<Vec<u8>> = (3..next).map(|i| vec![i]).collect();
        assert_eq!(collected, expected);
    }

    #[test]
    fn resize_discards_content_and_cursors() {
        let ring = RingBuffer::new(4 * SLOT_CAPACITY);
        produce(&ring, &[1, 2, 3]);

        ring.resize(8 * SLOT_CAPACITY);
        assert_eq!(ring.slot_count(), 8);
        assert!(drain_all(&ring).is_empty());
    }

    #[test]
    fn single_slot_ring_grows_before_first_write() {
        let ring = RingBuffer::new(1);
        assert_eq!(ring.slot_count(), 1);

        // With one slot the reserved-slot rule leaves no writable space at
        // all, so the very first write forces growth.
        assert!(ring.write_would_overrun());
        ring.grow();
        assert!(!ring.write_would_overrun());

        produce(&ring, &[9]);
        assert_eq!(drain_all(&ring), vec![vec![9]]);
    }
}
