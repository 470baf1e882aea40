//! The ring proper.
//!
//! Cursor scheme: `head` (producer-owned write cursor) and `tail`
//! (consumer-owned read cursor) are free-running wrapping `u32`s; the byte
//! index into storage is `cursor % capacity`. The occupied region is
//! `[tail, head)`. `head` is stored with `Release` only after the record
//! bytes are fully written, and the consumer loads it with `Acquire` before
//! trusting any byte, so publication of the cursor publishes the payload.
//! `tail` works the same way in the other direction.
//!
//! Exactly one thread may call the producer methods and exactly one thread
//! the consumer methods. The span accessors are `unsafe` because that
//! discipline, plus staying inside the spans the cursors delimit, is what
//! makes the returned references sound.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::RECORD_ALIGN;

pub struct RingBuffer {
    cap: u32,
    head: AtomicU32,
    tail: AtomicU32,

    data_ptr: *mut u8,
    _storage: Box<[u8]>,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create a ring with `capacity_bytes` of storage.
    ///
    /// The capacity must be a power of two (so the free-running cursors stay
    /// consistent across `u32` wraparound), at least [`RECORD_ALIGN`], and
    /// small enough that occupancy arithmetic cannot overflow.
    pub fn with_capacity(capacity_bytes: usize) -> Self {
        assert!(capacity_bytes.is_power_of_two());
        assert!(capacity_bytes >= RECORD_ALIGN);
        assert!(capacity_bytes <= 1 << 30);
        let mut storage = vec![0u8; capacity_bytes].into_boxed_slice();
        let data_ptr = storage.as_mut_ptr();
        Self {
            cap: capacity_bytes as u32,
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            data_ptr,
            _storage: storage,
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.cap as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    // --- producer side ---

    /// Byte index the next reservation starts at.
    pub fn write_index(&self) -> usize {
        (self.head.load(Ordering::Relaxed) % self.cap) as usize
    }

    /// Bytes between the write index and the physical end of storage.
    ///
    /// A reservation larger than this cannot be satisfied contiguously; the
    /// caller must first consume the remainder (e.g. with a padding record).
    pub fn contiguous_writable(&self) -> usize {
        self.capacity_bytes() - self.write_index()
    }

    /// Bytes currently free, accounting for unconsumed data.
    pub fn free_bytes(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        (self.cap - head.wrapping_sub(tail)) as usize
    }

    /// Spin until at least `len` bytes are free.
    ///
    /// `len` must not exceed the capacity; that reservation could never be
    /// satisfied and the wait would not terminate.
    pub fn wait_free(&self, len: usize) {
        assert!(len <= self.capacity_bytes());
        let mut spins = 0u32;
        while self.free_bytes() < len {
            spins += 1;
            if spins % 1024 == 0 {
                std::thread::yield_now();
            } else {
                core::hint::spin_loop();
            }
        }
    }

    /// Writable span of `len` bytes starting at the write index.
    ///
    /// # Safety
    ///
    /// The caller must be the single producer, `len` must not exceed
    /// [`contiguous_writable`](Self::contiguous_writable) or
    /// [`free_bytes`](Self::free_bytes), and the span must not be held across
    /// a call to [`publish`](Self::publish) for it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn writable_slice(&self, len: usize) -> &mut [u8] {
        debug_assert!(len <= self.contiguous_writable());
        debug_assert!(len <= self.free_bytes());
        core::slice::from_raw_parts_mut(self.data_ptr.add(self.write_index()), len)
    }

    /// Advance the write cursor by `len`, making the bytes visible to the
    /// consumer.
    pub fn publish(&self, len: usize) {
        debug_assert!(len <= self.contiguous_writable());
        let head = self.head.load(Ordering::Relaxed);
        self.head.store(head.wrapping_add(len as u32), Ordering::Release);
    }

    // --- consumer side ---

    /// Byte index the next read starts at.
    pub fn read_index(&self) -> usize {
        (self.tail.load(Ordering::Relaxed) % self.cap) as usize
    }

    /// Bytes published and not yet released.
    pub fn readable_bytes(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail) as usize
    }

    /// Readable span of `len` bytes starting at the read index.
    ///
    /// # Safety
    ///
    /// The caller must be the single consumer, `len` must not exceed
    /// [`readable_bytes`](Self::readable_bytes), and the span must not cross
    /// the physical end of storage (the producer's framing discipline is
    /// responsible for never publishing a record that does).
    pub unsafe fn readable_slice(&self, len: usize) -> &[u8] {
        debug_assert!(len <= self.readable_bytes());
        debug_assert!(self.read_index() + len <= self.capacity_bytes());
        core::slice::from_raw_parts(self.data_ptr.add(self.read_index()), len)
    }

    /// Advance the read cursor by `len`, returning the bytes to the producer.
    pub fn release(&self, len: usize) {
        debug_assert!(len <= self.readable_bytes());
        let tail = self.tail.load(Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(len as u32), Ordering::Release);
    }
}
