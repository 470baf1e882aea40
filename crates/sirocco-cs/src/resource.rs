//! Resource identity and bind-count bookkeeping.
//!
//! The stream treats resources as opaque: identity, kind, and a usage
//! counter. Records reference resources by raw address and the replicated
//! state stores non-owning [`ResourceRef`]s, so queueing or binding a
//! resource never extends its lifetime. Callers keep resources alive while
//! records referencing them are in flight (the device layer above flushes
//! before destroying a resource, which is the same contract the immediate
//! path already needs).

use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Texture,
    Surface,
    SwapChain,
    Shader,
    VertexDeclaration,
    Query,
}

/// An externally owned graphics object, seen by the stream as identity plus
/// a bind count.
pub struct Resource {
    id: u32,
    kind: ResourceKind,
    /// How many consumer-side state slots currently reference this resource.
    /// Atomic because producer call sites may inspect it concurrently with
    /// consumer-side rebinds.
    bind_count: AtomicU32,
}

impl Resource {
    pub fn new(id: u32, kind: ResourceKind) -> Self {
        Self {
            id,
            kind,
            bind_count: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn bind_count(&self) -> u32 {
        self.bind_count.load(Ordering::Relaxed)
    }

    pub(crate) fn acquire_binding(&self) {
        self.bind_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn release_binding(&self) {
        let prev = self.bind_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev != 0, "bind count underflow");
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("bind_count", &self.bind_count())
            .finish()
    }
}

/// Non-owning reference to a [`Resource`] held in replicated state.
///
/// Compares and hashes by address. Dereferencing is `unsafe`: the referent
/// must still be alive, which the in-flight liveness contract guarantees
/// while the stream is running but not for refs inspected after the owning
/// resource was destroyed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceRef(NonNull<Resource>);

// The stream moves replicated state (and the refs inside it) between the
// producer and the worker thread; the referents are externally synchronized
// per the liveness contract, and all shared mutation goes through atomics.
unsafe impl Send for ResourceRef {}
unsafe impl Sync for ResourceRef {}

impl ResourceRef {
    /// Rehydrate a ref from a record's address field; zero means "none".
    pub(crate) fn from_addr(addr: u64) -> Option<Self> {
        NonNull::new(addr as usize as *mut Resource).map(Self)
    }

    /// # Safety
    ///
    /// The referenced resource must still be alive.
    pub unsafe fn resource(&self) -> &Resource {
        self.0.as_ref()
    }
}

impl fmt::Debug for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceRef({:p})", self.0.as_ptr())
    }
}

/// Swap the resource referenced by a state slot, keeping bind counts
/// balanced. The incoming resource is acquired before the outgoing one is
/// released so a rebind of the same resource never drops its count to zero.
pub(crate) fn rebind(slot: &mut Option<ResourceRef>, next: Option<ResourceRef>) {
    // SAFETY: both refs point at live resources per the in-flight contract.
    unsafe {
        if let Some(next) = &next {
            next.resource().acquire_binding();
        }
        if let Some(prev) = slot.take() {
            prev.resource().release_binding();
        }
    }
    *slot = next;
}
