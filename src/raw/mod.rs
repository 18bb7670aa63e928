mod alloc;
mod utils;

use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use self::alloc::{Bucket, RawStore, Store};
use self::utils::{StrictProvenance, Unpack};
use crate::ebr::{self, Guard, Header};
use crate::map::HashValue;

// How many buckets a migrating thread copies per claimed chunk.
const MIGRATION_CHUNK: usize = 1024;

// The smallest store ever allocated.
const MIN_BUCKETS: usize = 16;

// A wait-free, linearizable hash table keyed by caller-supplied 128-bit
// hashes, with history-preserving buckets and cooperative migration.
pub struct Table<V> {
    // the active store
    store: AtomicPtr<RawStore>,
    _v: PhantomData<V>,
}

// Safety: values are shared across and dropped on arbitrary threads, but
// never handed out mutably.
unsafe impl<V: Send + Sync> Send for Table<V> {}
unsafe impl<V: Send + Sync> Sync for Table<V> {}

// One entry in a bucket's modification history. Records are pushed onto
// the bucket head like a stack and never unlinked; a superseded record is
// retired to the epoch manager and reclaimed once no reader can descend
// to it.
#[repr(C)]
pub struct Record<V> {
    // epoch bookkeeping, must come first
    header: Header,
    // the record this one superseded
    prev: *mut Record<V>,
    // a tombstone marks the key absent without unlinking history
    deleted: bool,
    value: MaybeUninit<V>,
}

unsafe impl<V> ebr::AsHeader for Record<V> {}

impl Record<()> {
    // the bucket is being migrated; writers must help and retry
    const MOVING: usize = 0b01;

    // the bucket has been fully migrated to the target store
    const MOVED: usize = 0b10;

    // mask for the record pointer, ignoring tag bits
    const POINTER: usize = !(Record::MOVING | Record::MOVED);
}

impl<V> Unpack for Record<V> {
    const MASK: usize = Record::POINTER;
}

impl<V> Record<V> {
    fn alloc(value: MaybeUninit<V>, deleted: bool) -> *mut Record<V> {
        Box::into_raw(Box::new(Record {
            header: Header::new(),
            prev: ptr::null_mut(),
            deleted,
            value,
        }))
    }
}

unsafe fn reclaim_record<V>(header: *mut Header) {
    let record = unsafe { Box::from_raw(header.cast::<Record<V>>()) };

    if !record.deleted {
        // drop the value
        let _ = unsafe { record.value.assume_init() };
    }
}

// Walks a record history from `record` down, returning the first record
// committed at or before `epoch`. Uncommitted records are helped along
// the way, so every thread agrees on which records are visible.
fn visible<V>(mut record: *mut Record<V>, epoch: u64) -> Option<*mut Record<V>> {
    while !record.is_null() {
        unsafe { ebr::help_commit(record) };

        if unsafe { ebr::write_epoch(record) } <= epoch {
            return Some(record);
        }

        record = unsafe { (*record).prev };
    }

    None
}

// Precondition a write applies to the record it displaces.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Gate {
    Always,
    IfAbsent,
    IfPresent,
}

// The outcome of installing a record.
enum Upsert<'g, V> {
    // the write linearized without displacing a value
    Inserted,
    // the write linearized, displacing this value
    Updated(&'g V),
    // the gate failed; the record was never installed and is handed back
    Rejected {
        current: Option<&'g V>,
        record: *mut Record<V>,
    },
}

// The store ran out of buckets.
struct StoreFull;

impl<V> Store<V> {
    // Probe for the bucket owning `hash`, stopping at the first empty slot.
    fn find(&self, hash: HashValue) -> Option<&Bucket<V>> {
        let mask = self.len() - 1;
        let hash = hash.get();

        for probe in 0..self.len() {
            let bucket = self.bucket((hash as usize).wrapping_add(probe) & mask);

            let found = bucket.hash.load(Ordering::Acquire);
            if found == 0 {
                return None;
            }

            if found == hash {
                return Some(bucket);
            }
        }

        None
    }

    // Probe for the bucket owning `hash`, claiming the first empty slot if
    // no bucket does. The hash slot is write-once for the store's lifetime.
    fn acquire(&self, hash: HashValue) -> Result<(&Bucket<V>, bool), StoreFull> {
        let mask = self.len() - 1;
        let hash = hash.get();

        for probe in 0..self.len() {
            let bucket = self.bucket((hash as usize).wrapping_add(probe) & mask);

            let found = bucket.hash.load(Ordering::Acquire);
            if found == 0 {
                match bucket
                    .hash
                    .compare_exchange(0, hash, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => return Ok((bucket, true)),
                    Err(found) if found == hash => return Ok((bucket, false)),
                    // lost the slot to a different key, keep probing
                    Err(_) => continue,
                }
            }

            if found == hash {
                return Ok((bucket, false));
            }
        }

        Err(StoreFull)
    }
}

impl<V> Table<V> {
    pub fn with_capacity(capacity: usize) -> Table<V> {
        let store = Store::<V>::alloc(capacity_to_buckets(capacity));

        Table {
            store: AtomicPtr::new(store.raw),
            _v: PhantomData,
        }
    }

    // The active store. The guard witnesses that a reservation protects
    // the dereference.
    #[inline]
    fn store(&self, _guard: &Guard) -> Store<V> {
        unsafe { Store::from_raw(self.store.load(Ordering::Acquire)) }
    }
}

impl<V> Table<V>
where
    V: Send + Sync,
{
    pub fn get<'g>(&'g self, hash: HashValue, guard: &'g Guard) -> Option<&'g V> {
        let epoch = ebr::current_epoch();
        let store = self.store(guard);

        let bucket = store.find(hash)?;
        let head = bucket.head.load(Ordering::Acquire).unpack();

        let record = visible(head.ptr, epoch)?;
        let record = unsafe { &*record };

        if record.deleted {
            return None;
        }

        Some(unsafe { record.value.assume_init_ref() })
    }

    pub fn insert<'g>(&'g self, hash: HashValue, value: V, guard: &'g Guard) -> Option<&'g V> {
        let record = Record::alloc(MaybeUninit::new(value), false);

        match self.upsert(hash, record, Gate::Always, guard) {
            Upsert::Inserted => None,
            Upsert::Updated(displaced) => Some(displaced),
            Upsert::Rejected { .. } => unreachable!(),
        }
    }

    pub fn try_insert<'g>(
        &'g self,
        hash: HashValue,
        value: V,
        guard: &'g Guard,
    ) -> Result<(), (&'g V, V)> {
        let record = Record::alloc(MaybeUninit::new(value), false);

        match self.upsert(hash, record, Gate::IfAbsent, guard) {
            Upsert::Inserted => Ok(()),
            Upsert::Updated(_) => unreachable!(),
            Upsert::Rejected { current, record } => {
                // the gate only fails on a present key
                let current = current.unwrap();
                let record = unsafe { Box::from_raw(record) };
                Err((current, unsafe { record.value.assume_init() }))
            }
        }
    }

    pub fn replace<'g>(&'g self, hash: HashValue, value: V, guard: &'g Guard) -> Result<&'g V, V> {
        let record = Record::alloc(MaybeUninit::new(value), false);

        match self.upsert(hash, record, Gate::IfPresent, guard) {
            Upsert::Updated(displaced) => Ok(displaced),
            Upsert::Inserted => unreachable!(),
            Upsert::Rejected { record, .. } => {
                let record = unsafe { Box::from_raw(record) };
                Err(unsafe { record.value.assume_init() })
            }
        }
    }

    fn upsert<'g>(
        &'g self,
        hash: HashValue,
        record: *mut Record<V>,
        gate: Gate,
        guard: &'g Guard,
    ) -> Upsert<'g, V> {
        loop {
            let store = self.store(guard);

            match self.upsert_in(store, hash, record, gate, guard) {
                Some(result) => return result,
                // the store was migrated out from under us, retry
                None => continue,
            }
        }
    }

    fn upsert_in<'g>(
        &'g self,
        store: Store<V>,
        hash: HashValue,
        record: *mut Record<V>,
        gate: Gate,
        guard: &'g Guard,
    ) -> Option<Upsert<'g, V>> {
        let (bucket, claimed) = match gate {
            // a conditional update never claims a bucket for a missing key
            Gate::IfPresent => match store.find(hash) {
                Some(bucket) => (bucket, false),
                None => {
                    return Some(Upsert::Rejected {
                        current: None,
                        record,
                    })
                }
            },
            _ => match store.acquire(hash) {
                Ok(found) => found,
                Err(StoreFull) => {
                    self.migrate(store, guard);
                    return None;
                }
            },
        };

        if claimed {
            let used = store.used().fetch_add(1, Ordering::Relaxed) + 1;

            if used >= store.threshold() {
                self.migrate(store, guard);
                return None;
            }
        }

        let head = bucket.head.load(Ordering::Acquire).unpack();
        if head.tag() != 0 {
            // migration in progress, help and retry on the new store
            self.migrate(store, guard);
            return None;
        }

        let prev = head.ptr;
        let prev_ref = unsafe { prev.as_ref() };

        // the displaced record's epoch must precede ours
        if !prev.is_null() {
            unsafe { ebr::help_commit(prev) };
        }

        let prev_used = prev_ref.map_or(false, |prev| !prev.deleted);

        match gate {
            Gate::IfAbsent if prev_used => {
                let current = prev_ref.map(|prev| unsafe { prev.value.assume_init_ref() });
                return Some(Upsert::Rejected { current, record });
            }
            Gate::IfPresent if !prev_used => {
                return Some(Upsert::Rejected {
                    current: None,
                    record,
                });
            }
            _ => {}
        }

        unsafe { (*record).prev = prev }

        match bucket
            .head
            .compare_exchange(head.raw, record, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                if prev_used {
                    // carry the first-insertion epoch forward so views keep
                    // insertion order across overwrites
                    unsafe { ebr::set_create_epoch(record, ebr::create_epoch(prev)) };
                }

                unsafe { ebr::commit_write(record) };

                Some(match prev_ref {
                    None => Upsert::Inserted,
                    Some(prev_ref) if prev_ref.deleted => {
                        store.deleted().fetch_sub(1, Ordering::Relaxed);
                        unsafe { ebr::retire(prev, reclaim_record::<V>) };
                        Upsert::Inserted
                    }
                    Some(prev_ref) => {
                        unsafe { ebr::retire(prev, reclaim_record::<V>) };
                        Upsert::Updated(unsafe { prev_ref.value.assume_init_ref() })
                    }
                })
            }

            Err(found) => {
                let found = found.unpack();

                if found.tag() != 0 {
                    self.migrate(store, guard);
                    return None;
                }

                // combining: the winner linearized immediately after us in
                // the same epoch, so no reader could have observed our
                // record. abandon it and report the value we both displaced,
                // instead of retrying.
                unsafe { ebr::help_commit(found.ptr) };
                unsafe { ebr::retire_unused(record, reclaim_record::<V>) };

                Some(match prev_ref {
                    Some(prev_ref) if prev_used => {
                        Upsert::Updated(unsafe { prev_ref.value.assume_init_ref() })
                    }
                    _ => Upsert::Inserted,
                })
            }
        }
    }

    pub fn remove<'g>(&'g self, hash: HashValue, guard: &'g Guard) -> Option<&'g V> {
        // the tombstone is allocated lazily and reused across retries
        let mut tombstone: *mut Record<V> = ptr::null_mut();

        let removed = loop {
            let store = self.store(guard);

            match self.remove_in(store, hash, &mut tombstone, guard) {
                Some(removed) => break removed,
                None => continue,
            }
        };

        if !tombstone.is_null() {
            // never installed; nothing could have observed it
            unsafe { ebr::retire_unused(tombstone, reclaim_record::<V>) };
        }

        removed
    }

    fn remove_in<'g>(
        &'g self,
        store: Store<V>,
        hash: HashValue,
        tombstone: &mut *mut Record<V>,
        guard: &'g Guard,
    ) -> Option<Option<&'g V>> {
        let bucket = match store.find(hash) {
            Some(bucket) => bucket,
            None => return Some(None),
        };

        let head = bucket.head.load(Ordering::Acquire).unpack();
        if head.tag() != 0 {
            self.migrate(store, guard);
            return None;
        }

        let prev = head.ptr;
        let prev_ref = match unsafe { prev.as_ref() } {
            Some(prev_ref) => prev_ref,
            None => return Some(None),
        };

        unsafe { ebr::help_commit(prev) };

        if prev_ref.deleted {
            return Some(None);
        }

        if tombstone.is_null() {
            *tombstone = Record::alloc(MaybeUninit::uninit(), true);
        }

        let record = *tombstone;
        unsafe { (*record).prev = prev }

        match bucket
            .head
            .compare_exchange(head.raw, record, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                *tombstone = ptr::null_mut();

                unsafe { ebr::commit_write(record) };

                let deleted = store.deleted().fetch_add(1, Ordering::Relaxed) + 1;
                unsafe { ebr::retire(prev, reclaim_record::<V>) };

                // purge tombstones once they dominate the live entries
                let used = store.used().load(Ordering::Relaxed);
                if deleted >= used / 2 && used >= store.threshold() / 2 {
                    self.migrate(store, guard);
                }

                Some(Some(unsafe { prev_ref.value.assume_init_ref() }))
            }

            Err(found) => {
                let found = found.unpack();

                if found.tag() != 0 {
                    self.migrate(store, guard);
                    return None;
                }

                // combining: our removal linearized immediately before the
                // winner, displacing the value we observed
                unsafe { ebr::help_commit(found.ptr) };

                Some(Some(unsafe { prev_ref.value.assume_init_ref() }))
            }
        }
    }

    // The number of live entries in the active store. Approximate: the
    // counters trail in-flight operations.
    pub fn len(&self) -> usize {
        let guard = ebr::pin();
        let store = self.store(&guard);

        let used = store.used().load(Ordering::Relaxed);
        let deleted = store.deleted().load(Ordering::Relaxed);
        used.saturating_sub(deleted)
    }

    // A consistent snapshot of the table at the current epoch, sorted by
    // each entry's first-insertion epoch. Ties are broken by write epoch,
    // then bucket index, so repeated views at one epoch agree on order.
    pub fn view<'g>(&'g self, guard: &'g Guard) -> Vec<(u64, &'g V)> {
        let epoch = ebr::current_epoch();
        let store = self.store(guard);

        let mut entries = Vec::new();

        for i in 0..store.len() {
            let bucket = store.bucket(i);

            if bucket.hash.load(Ordering::Acquire) == 0 {
                continue;
            }

            let head = bucket.head.load(Ordering::Acquire).unpack();
            let record = match visible(head.ptr, epoch) {
                Some(record) => record,
                None => continue,
            };

            let record_ref = unsafe { &*record };
            if record_ref.deleted {
                continue;
            }

            let write = unsafe { ebr::write_epoch(record) };
            let create = unsafe { ebr::create_epoch(record) };

            // cache the resolution for later views
            unsafe { ebr::set_create_epoch(record, create) };

            entries.push((create, write, i, unsafe {
                record_ref.value.assume_init_ref()
            }));
        }

        entries.sort_unstable_by_key(|&(create, write, i, _)| (create, write, i));
        entries
            .into_iter()
            .map(|(create, _, _, value)| (create, value))
            .collect()
    }

    // Get or create the store `store` migrates into. The target slot is
    // write-once; losing the race discards the speculative allocation.
    fn next_store(&self, store: Store<V>) -> Store<V> {
        let next = store.next().load(Ordering::Acquire);
        if !next.is_null() {
            return unsafe { Store::from_raw(next) };
        }

        let used = store.used().load(Ordering::Relaxed);
        let deleted = store.deleted().load(Ordering::Relaxed);

        // mostly tombstones: rehash at the same size instead of growing
        let len = if deleted >= used / 2 {
            store.len()
        } else {
            if store.len() > isize::MAX as usize / 2 {
                panic!("hash table exceeded maximum capacity");
            }

            store.len() << 1
        };

        let new = Store::<V>::alloc(len);
        match store.next().compare_exchange(
            ptr::null_mut(),
            new.raw,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => new,
            // another thread allocated the target first
            Err(found) => unsafe {
                Store::dealloc(new);
                Store::from_raw(found)
            },
        }
    }

    // Cooperatively migrate every bucket of `store` into its target, then
    // swing the root pointer. Callable from any number of threads in any
    // interleaving; the migration is complete when this returns.
    fn migrate(&self, store: Store<V>, guard: &Guard) {
        let target = self.next_store(store);

        // already complete? just help swing the root
        if self.try_promote(store, target, 0, guard) {
            return;
        }

        // claim disjoint chunks first to spread the copy across helpers
        let chunk = store.len().min(MIGRATION_CHUNK);
        loop {
            let start = store.claim().fetch_add(chunk, Ordering::Relaxed);
            if start >= store.len() {
                break;
            }

            let mut moved = 0;
            for i in start..store.len().min(start + chunk) {
                if self.migrate_bucket(store, target, i, guard) {
                    moved += 1;
                }
            }

            if self.try_promote(store, target, moved, guard) {
                return;
            }
        }

        // claims are exhausted but the copy has not been confirmed done:
        // sweep every bucket, finishing any left behind by preempted
        // helpers. the per-bucket transitions are idempotent, so after one
        // sweep the copy is complete no matter how helpers interleaved.
        let mut moved = 0;
        for i in 0..store.len() {
            if self.migrate_bucket(store, target, i, guard) {
                moved += 1;
            }
        }

        if moved > 0 {
            store.moved().fetch_add(moved, Ordering::AcqRel);
        }

        self.promote(store, target, guard);
    }

    // Migrate bucket `i`, whatever state it is in. Returns true if this
    // thread performed the final transition to MOVED.
    fn migrate_bucket(&self, store: Store<V>, target: Store<V>, i: usize, guard: &Guard) -> bool {
        let bucket = store.bucket(i);
        let mut head = bucket.head.load(Ordering::Acquire).unpack();

        // freeze the bucket so writers fail their install and help instead
        while head.tag() & Record::MOVING == 0 {
            match bucket.head.compare_exchange(
                head.raw,
                head.raw.map_addr(|addr| addr | Record::MOVING),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    head = head.map_tag(|addr| addr | Record::MOVING);
                    break;
                }
                Err(found) => head = found.unpack(),
            }
        }

        if head.tag() & Record::MOVED != 0 {
            return false;
        }

        let record = head.ptr;
        let live = matches!(unsafe { record.as_ref() }, Some(r) if !r.deleted);

        if live {
            // the record allocation moves as-is: its epochs travel with it,
            // the target store is a re-hosting, not a new linearization
            unsafe { ebr::help_commit(record) };

            let hash = bucket.hash.load(Ordering::Acquire);
            self.install_copy(target, hash, record, guard);
        }

        // seal the bucket
        loop {
            match bucket.head.compare_exchange(
                head.raw,
                head.raw.map_addr(|addr| addr | Record::MOVED),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if !record.is_null() && !live {
                        // tombstones do not survive a migration
                        unsafe { ebr::retire(record, reclaim_record::<V>) };
                    }

                    return true;
                }
                Err(found) => {
                    head = found.unpack();

                    if head.tag() & Record::MOVED != 0 {
                        return false;
                    }
                }
            }
        }
    }

    // Install a record being migrated into the target store. Idempotent
    // across helpers: an existing head for the hash means another helper
    // already installed it.
    fn install_copy(&self, target: Store<V>, hash: u128, record: *mut Record<V>, guard: &Guard) {
        let mask = target.len() - 1;

        for probe in 0..target.len() {
            let bucket = target.bucket((hash as usize).wrapping_add(probe) & mask);

            let found = bucket.hash.load(Ordering::Acquire);
            if found == 0 {
                match bucket
                    .hash
                    .compare_exchange(0, hash, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        target.used().fetch_add(1, Ordering::Relaxed);
                    }
                    Err(found) if found != hash => continue,
                    Err(_) => {}
                }
            } else if found != hash {
                continue;
            }

            match bucket.head.compare_exchange(
                ptr::null_mut(),
                record,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(found) => {
                    let found = found.unpack();

                    if found.ptr.is_null() {
                        // the target is itself migrating and sealed this
                        // bucket empty; chase the next store
                        break;
                    }

                    // another helper already installed the record
                    return;
                }
            }
        }

        // either the target sealed the bucket under us, or it filled up
        // before this record found a slot (the deletion estimate lied
        // during sizing); push the migration one store further
        self.migrate(target, guard);

        let next = unsafe { Store::from_raw(target.next().load(Ordering::Acquire)) };
        self.install_copy(next, hash, record, guard)
    }

    fn try_promote(&self, store: Store<V>, target: Store<V>, moved: usize, guard: &Guard) -> bool {
        let total = if moved > 0 {
            store.moved().fetch_add(moved, Ordering::AcqRel) + moved
        } else {
            store.moved().load(Ordering::Acquire)
        };

        if total == store.len() {
            self.promote(store, target, guard);
            return true;
        }

        false
    }

    // Swing the root pointer to the migration target. The CAS succeeds for
    // exactly one thread, which retires the frozen store.
    fn promote(&self, store: Store<V>, target: Store<V>, _guard: &Guard) {
        if self
            .store
            .compare_exchange(store.raw, target.raw, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            unsafe { ebr::retire(store.raw, alloc::reclaim_store::<V>) };
        }
    }
}

impl<V> Drop for Table<V> {
    fn drop(&mut self) {
        // exclusive access: no guard can still hold references into this
        // table, so head records and stores are freed directly. history
        // below each head, and anything displaced earlier, was already
        // retired to the epoch manager when it was superseded.
        let mut store = unsafe { Store::<V>::from_raw(*self.store.get_mut()) };

        // skip any fully-migrated stores the root was never swung to; their
        // live records were re-hosted into the terminal store
        loop {
            let next = store.next().load(Ordering::Relaxed);
            if next.is_null() {
                break;
            }

            unsafe { Store::dealloc(store) };
            store = unsafe { Store::from_raw(next) };
        }

        for i in 0..store.len() {
            let head = store.bucket(i).head.load(Ordering::Relaxed).unpack();

            if !head.ptr.is_null() {
                unsafe { reclaim_record::<V>(head.ptr.cast::<Header>()) };
            }
        }

        unsafe { Store::dealloc(store) };
    }
}

fn capacity_to_buckets(capacity: usize) -> usize {
    // leave threshold headroom so `capacity` inserts fit without migrating
    capacity
        .saturating_add(capacity / 3)
        .next_power_of_two()
        .max(MIN_BUCKETS)
}
