//! Epoch-based memory reclamation with write linearization.
//!
//! This module plays two intertwined roles for the tables built on top of
//! it. It is a memory manager: threads *pin* an epoch before touching
//! shared records, and retired allocations are only freed once no pinned
//! thread could still reach them. And it is the linearization authority:
//! every committed write atomically advances the global epoch and stamps
//! the resulting value into its record, producing a total order over all
//! writes that readers and snapshot views agree on.
//!
//! # Usage
//!
//! Allocations managed here embed a [`Header`] as their first field and
//! assert that layout by implementing [`AsHeader`]. A writer installs its
//! record into a shared structure first and calls [`commit_write`] second;
//! any thread that encounters the record in between is obligated to call
//! [`help_commit`] before acting on it, so all threads agree on the
//! record's epoch.
//!
//! Reclamation goes through [`retire`], which defers the actual free until
//! every reservation has advanced past the retirement, or through
//! [`retire_unused`] when the caller can prove no other thread ever saw
//! the pointer.

mod cfg;
mod slots;

pub mod reclaim;

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

pub use slots::MAX_THREADS;

// The global epoch. Advanced by one at every write commit; the first
// committed write linearizes at epoch 1.
static EPOCH: AtomicU64 = AtomicU64::new(0);

/// Returns the current global epoch.
///
/// Under an active [`Guard`] obtained from [`pin_linearized`], the returned
/// value is a valid linearization point: any allocation alive at it is
/// protected from reclamation.
#[inline]
pub fn current_epoch() -> u64 {
    EPOCH.load(Ordering::SeqCst)
}

/// A function invoked to free a retired allocation.
pub type Reclaim = unsafe fn(*mut Header);

unsafe fn reclaim_noop(_: *mut Header) {}

/// Epoch bookkeeping carried by every managed allocation.
///
/// The header must be the very first field of the allocation so that a
/// pointer to the value and a pointer to its header coincide; implementing
/// [`AsHeader`] asserts exactly that.
#[repr(C)]
pub struct Header {
    // The epoch of the insertion that first made this key present, carried
    // forward across overwrites. Zero until resolved, written once by CAS:
    // either by the overwriting writer propagating it, or by a snapshot
    // view deriving it from `write_epoch`.
    create_epoch: AtomicU64,
    // The write's linearization point. Zero until committed.
    write_epoch: AtomicU64,
    // Retirement bookkeeping. Owned by the retiring thread, then by
    // whichever scan frees the allocation; handoffs synchronize through
    // the list the header is linked into.
    node: UnsafeCell<ReclaimNode>,
}

struct ReclaimNode {
    next: *mut Header,
    retire_epoch: u64,
    reclaim: Reclaim,
}

// Safety: the node is only touched by one thread at a time (see above);
// the epochs are atomics.
unsafe impl Send for Header {}
unsafe impl Sync for Header {}

impl Header {
    pub fn new() -> Header {
        Header {
            create_epoch: AtomicU64::new(0),
            write_epoch: AtomicU64::new(0),
            node: UnsafeCell::new(ReclaimNode {
                next: ptr::null_mut(),
                retire_epoch: 0,
                reclaim: reclaim_noop,
            }),
        }
    }

    #[inline]
    fn node(header: *mut Header) -> *mut ReclaimNode {
        unsafe { UnsafeCell::raw_get(ptr::addr_of!((*header).node)) }
    }
}

impl Default for Header {
    fn default() -> Header {
        Header::new()
    }
}

/// Asserts that a [`Header`] is the first field of the implementing type,
/// making the type eligible for [`retire`], [`commit_write`], and friends.
///
/// # Safety
///
/// The type must be `#[repr(C)]` with a `Header` as its first field.
pub unsafe trait AsHeader {}

unsafe impl AsHeader for Header {}

/// Keeps the current thread's reservation armed, protecting every
/// allocation retired at or after the reservation from being reclaimed.
///
/// Obtained from [`pin`] or [`pin_linearized`]. Pins are reentrant: nested
/// guards share the outermost reservation and the slot is only released
/// when the last guard on the thread is dropped.
pub struct Guard {
    epoch: u64,
    // reservations are thread-local; a guard must not cross threads
    _not_send: PhantomData<*mut ()>,
}

impl Guard {
    /// The epoch observed when this guard was created.
    ///
    /// For a guard from [`pin_linearized`], every allocation alive at this
    /// epoch is protected for the guard's lifetime.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        slots::with(|thread| thread.unpin());
    }
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard").field("epoch", &self.epoch).finish()
    }
}

/// Pins the current thread at the current epoch.
///
/// The reservation is published without validating it against a
/// re-read of the epoch, which is sufficient for operations that only
/// dereference pointers loaded *after* pinning: anything such a load can
/// observe was necessarily retired at or after the reservation. Operations
/// that walk backwards through history must use [`pin_linearized`].
pub fn pin() -> Guard {
    slots::with(|thread| thread.pin_basic());

    Guard {
        epoch: current_epoch(),
        _not_send: PhantomData,
    }
}

/// Pins the current thread, validating the reservation against the global
/// epoch until both agree.
///
/// The returned guard's [`epoch`](Guard::epoch), and every epoch read from
/// [`current_epoch`] while the guard is alive, is a linearization point:
/// a writer committing at a later epoch cannot have retired anything the
/// pinned thread still needs.
pub fn pin_linearized() -> Guard {
    let epoch = slots::with(|thread| thread.pin_linearized());

    Guard {
        epoch,
        _not_send: PhantomData,
    }
}

/// Commits a write, assigning the record its linearization epoch.
///
/// Advances the global epoch by one and installs the resulting value as
/// the record's write epoch, unless a helping thread already committed it.
/// Losing that race is benign: both sides observe the same epoch afterward.
///
/// # Safety
///
/// `ptr` must point to a live allocation of a type honoring [`AsHeader`].
pub unsafe fn commit_write<T: AsHeader>(ptr: *mut T) {
    #[cfg(feature = "reservation-help")]
    slots::help_waiting_pins();

    let header = ptr.cast::<Header>();
    let epoch = EPOCH.fetch_add(1, Ordering::SeqCst) + 1;
    debug_assert!(epoch < 1 << 63, "epoch space exhausted");

    let _ = unsafe {
        (*header)
            .write_epoch
            .compare_exchange(0, epoch, Ordering::AcqRel, Ordering::Relaxed)
    };
}

/// Commits a write on behalf of its stalled writer.
///
/// Readers must call this on any record whose write epoch is still zero
/// before comparing it against their own read epoch; otherwise a reader
/// could miss a write that linearizes before it.
///
/// # Safety
///
/// Same as [`commit_write`].
pub unsafe fn help_commit<T: AsHeader>(ptr: *mut T) {
    let header = ptr.cast::<Header>();

    if unsafe { (*header).write_epoch.load(Ordering::Acquire) } == 0 {
        unsafe { commit_write(ptr) }
    }
}

/// Returns the record's write epoch, or zero if it is uncommitted.
///
/// # Safety
///
/// Same as [`commit_write`].
#[inline]
pub unsafe fn write_epoch<T: AsHeader>(ptr: *mut T) -> u64 {
    let header = ptr.cast::<Header>();
    unsafe { (*header).write_epoch.load(Ordering::Acquire) }
}

/// Returns the epoch of the insertion that first made this record's key
/// present, falling back to the record's own write epoch when it has not
/// been resolved yet.
///
/// # Safety
///
/// Same as [`commit_write`].
#[inline]
pub unsafe fn create_epoch<T: AsHeader>(ptr: *mut T) -> u64 {
    let header = ptr.cast::<Header>();

    match unsafe { (*header).create_epoch.load(Ordering::Acquire) } {
        0 => unsafe { (*header).write_epoch.load(Ordering::Acquire) },
        epoch => epoch,
    }
}

/// Resolves the record's create epoch, unless it already is resolved.
///
/// Called by overwriting writers to carry the displaced record's create
/// epoch forward, and by snapshot views to cache the fallback they
/// derived. Racing resolutions are settled by CAS.
///
/// # Safety
///
/// Same as [`commit_write`].
pub unsafe fn set_create_epoch<T: AsHeader>(ptr: *mut T, epoch: u64) {
    let header = ptr.cast::<Header>();

    let _ = unsafe {
        (*header)
            .create_epoch
            .compare_exchange(0, epoch, Ordering::AcqRel, Ordering::Relaxed)
    };
}

/// Retires an allocation, freeing it once every reservation has advanced
/// past the current epoch.
///
/// # Safety
///
/// `ptr` must point to a live allocation of a type honoring [`AsHeader`]
/// that is no longer reachable by threads that pin after this call, and
/// must not be retired twice. `reclaim` must be safe to call with it.
pub unsafe fn retire<T: AsHeader>(ptr: *mut T, reclaim: Reclaim) {
    debug_assert!(!ptr.is_null(), "attempted to retire a null pointer");

    let header = ptr.cast::<Header>();

    unsafe {
        let node = Header::node(header);
        (*node).retire_epoch = EPOCH.load(Ordering::SeqCst);
        (*node).reclaim = reclaim;
    }

    slots::with(|thread| thread.retire(header));
}

/// Reclaims an allocation immediately.
///
/// # Safety
///
/// In addition to the requirements of [`retire`], the caller must
/// guarantee that no other thread could ever have observed the pointer,
/// e.g. a record abandoned after losing the CAS that would have published
/// it.
pub unsafe fn retire_unused<T: AsHeader>(ptr: *mut T, reclaim: Reclaim) {
    debug_assert!(!ptr.is_null(), "attempted to retire a null pointer");

    unsafe { reclaim(ptr.cast::<Header>()) }
}
