//! One-shot fences and result slots for synchronous round-trips.
//!
//! A fence lives in the producer's call frame; the queued record carries its
//! address and the producer spins until the consumer signals it, so the frame
//! always outlives the consumer's access. Result slots bundle a fence with
//! status/value words the handler fills before signaling; the release store
//! of the signal publishes the payload to the acquire load in the wait.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Spin with a periodic yield; waits here are expected to be short.
pub(crate) fn spin_wait(mut done: impl FnMut() -> bool) {
    let mut spins = 0u32;
    while !done() {
        spins += 1;
        if spins % 1024 == 0 {
            std::thread::yield_now();
        } else {
            core::hint::spin_loop();
        }
    }
}

/// One-shot completion flag. Initialized unsignaled, signaled exactly once,
/// never reset.
pub(crate) struct Fence {
    signaled: AtomicBool,
}

impl Fence {
    pub(crate) fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
        }
    }

    pub(crate) fn addr(&self) -> u64 {
        self as *const Self as usize as u64
    }

    pub(crate) fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
    }

    pub(crate) fn wait(&self) {
        spin_wait(|| self.signaled.load(Ordering::Acquire));
    }
}

pub(crate) const QUERY_STATUS_READY: u32 = 0;
pub(crate) const QUERY_STATUS_NOT_READY: u32 = 1;

/// Result cell for a query readback round-trip.
pub(crate) struct QuerySlot {
    pub status: AtomicU32,
    pub value: AtomicU64,
    pub fence: Fence,
}

impl QuerySlot {
    pub(crate) fn new() -> Self {
        Self {
            status: AtomicU32::new(QUERY_STATUS_NOT_READY),
            value: AtomicU64::new(0),
            fence: Fence::new(),
        }
    }

    pub(crate) fn addr(&self) -> u64 {
        self as *const Self as usize as u64
    }
}

pub(crate) const MAP_STATUS_OK: u32 = 0;

/// Result cell for a map/unmap round-trip. `token` is the backend's opaque
/// mapping handle; `status` is zero on success or a `MapError` code.
pub(crate) struct MapSlot {
    pub status: AtomicU32,
    pub token: AtomicU64,
    pub fence: Fence,
}

impl MapSlot {
    pub(crate) fn new() -> Self {
        Self {
            status: AtomicU32::new(MAP_STATUS_OK),
            token: AtomicU64::new(0),
            fence: Fence::new(),
        }
    }

    pub(crate) fn addr(&self) -> u64 {
        self as *const Self as usize as u64
    }
}
