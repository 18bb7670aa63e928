use std::alloc;
use std::alloc::Layout;
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize};

use portable_atomic::AtomicU128;

use crate::ebr::{self, Header};

// A bucket store layed out in a single allocation.
#[repr(transparent)]
pub struct RawStore(u8);

// Safety: ebr::Header is the first field (see StoreLayout)
unsafe impl ebr::AsHeader for RawStore {}

// One open-addressed slot: a write-once 128-bit hash (zero means empty)
// and the head of the bucket's record history.
#[repr(C)]
pub struct Bucket<V> {
    pub hash: AtomicU128,
    pub head: AtomicPtr<super::Record<V>>,
}

// The store allocation's layout. Bucket layout does not depend on the
// value type, so the trailing array can be declared untyped.
#[allow(unused)]
#[repr(C)]
struct StoreLayout {
    header: Header,
    len: usize,
    threshold: usize,
    used: AtomicUsize,
    deleted: AtomicUsize,
    next: AtomicPtr<RawStore>,
    claim: AtomicUsize,
    moved: AtomicUsize,
    buckets: [Bucket<()>; 0],
}

// Manages a store allocation.
#[repr(C)]
pub struct Store<V> {
    // the raw store pointer
    pub raw: *mut RawStore,
    // the cached bucket count, always a power of two
    len: usize,
    _v: PhantomData<V>,
}

impl<V> Copy for Store<V> {}

impl<V> Clone for Store<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Store<V> {
    pub fn alloc(len: usize) -> Store<V> {
        assert!(len.is_power_of_two());

        unsafe {
            let layout = Self::layout(len);
            let ptr = alloc::alloc(layout);

            if ptr.is_null() {
                alloc::handle_alloc_error(layout);
            }

            // write the store layout state
            ptr.cast::<StoreLayout>().write(StoreLayout {
                header: Header::new(),
                len,
                // migrate at 75% occupancy
                threshold: len - (len >> 2),
                used: AtomicUsize::new(0),
                deleted: AtomicUsize::new(0),
                next: AtomicPtr::new(ptr::null_mut()),
                claim: AtomicUsize::new(0),
                moved: AtomicUsize::new(0),
                buckets: [],
            });

            // zero the bucket array: empty hashes and null record heads
            ptr.add(mem::size_of::<StoreLayout>())
                .write_bytes(0, len * mem::size_of::<Bucket<()>>());

            Store {
                len,
                raw: ptr.cast::<RawStore>(),
                _v: PhantomData,
            }
        }
    }

    pub unsafe fn from_raw(raw: *mut RawStore) -> Store<V> {
        let layout = unsafe { &*raw.cast::<StoreLayout>() };

        Store {
            raw,
            len: layout.len,
            _v: PhantomData,
        }
    }

    #[inline]
    fn layout_ref(&self) -> &StoreLayout {
        unsafe { &*self.raw.cast::<StoreLayout>() }
    }

    // The number of buckets in this store.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    // The occupancy at which the store must migrate.
    #[inline]
    pub fn threshold(&self) -> usize {
        self.layout_ref().threshold
    }

    // The number of buckets with a claimed hash. Approximate.
    #[inline]
    pub fn used(&self) -> &AtomicUsize {
        &self.layout_ref().used
    }

    // The number of buckets whose head record is a tombstone. Approximate.
    #[inline]
    pub fn deleted(&self) -> &AtomicUsize {
        &self.layout_ref().deleted
    }

    // The store this one is migrating into. Write-once via CAS.
    #[inline]
    pub fn next(&self) -> &AtomicPtr<RawStore> {
        &self.layout_ref().next
    }

    // The migration chunk claim counter.
    #[inline]
    pub fn claim(&self) -> &AtomicUsize {
        &self.layout_ref().claim
    }

    // The number of buckets fully migrated to the target store.
    #[inline]
    pub fn moved(&self) -> &AtomicUsize {
        &self.layout_ref().moved
    }

    #[inline]
    pub fn bucket(&self, i: usize) -> &Bucket<V> {
        debug_assert!(i < self.len);

        unsafe {
            &*self
                .raw
                .cast::<u8>()
                .add(mem::size_of::<StoreLayout>())
                .cast::<Bucket<V>>()
                .add(i)
        }
    }

    pub unsafe fn dealloc(store: Store<V>) {
        let layout = Self::layout(store.len);
        unsafe { alloc::dealloc(store.raw.cast::<u8>(), layout) }
    }

    fn layout(len: usize) -> Layout {
        let size = mem::size_of::<StoreLayout>() + len * mem::size_of::<Bucket<()>>();
        Layout::from_size_align(size, mem::align_of::<StoreLayout>()).unwrap()
    }
}

// Frees a retired store. Records hosted in its buckets are not touched:
// live ones were re-hosted by the migration that retired the store, and
// superseded or deleted ones were retired individually.
pub unsafe fn reclaim_store<V>(header: *mut Header) {
    let store = unsafe { Store::<V>::from_raw(header.cast::<RawStore>()) };
    unsafe { Store::dealloc(store) }
}

#[test]
fn layout() {
    use std::sync::atomic::Ordering;

    let table: Store<u8> = Store::alloc(16);
    let table: Store<u8> = unsafe { Store::from_raw(table.raw) };
    assert_eq!(table.len(), 16);
    assert_eq!(table.threshold(), 12);

    for i in 0..16 {
        assert_eq!(table.bucket(i).hash.load(Ordering::Relaxed), 0);
        assert!(table.bucket(i).head.load(Ordering::Relaxed).is_null());
    }

    unsafe { Store::dealloc(table) };
}
