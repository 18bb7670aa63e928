use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use super::cfg::trace;
use super::{Header, EPOCH};

/// The maximum number of threads that may concurrently hold reservation
/// slots. Registering more is fatal.
pub const MAX_THREADS: usize = 8192;

// Retirement lists are swept every `RETIRE_SCAN_FREQ` retirements.
// Must be a power of two.
const RETIRE_SCAN_FREQ: usize = 32;

// Slot values that are not epochs. Epochs are confined to 63 bits, so the
// sentinels and the help flag all sort above every real epoch: a minimum
// scan over the reservation array naturally treats them as "no reservation".
const VACANT: u64 = u64::MAX;
const UNRESERVED: u64 = u64::MAX - 1;

// A reservation slot whose owner is waiting for a committing writer to
// install a validated epoch on its behalf.
#[cfg(feature = "reservation-help")]
const HELP: u64 = 1 << 63;

// How many validation failures a linearized pin tolerates before asking
// writers for help.
#[cfg(feature = "reservation-help")]
const HELP_RETRIES: usize = 8;

// The process-wide reservation array. Each live thread owns one slot,
// identified by index; slots are returned on thread exit and reused.
static RESERVATIONS: [AtomicU64; MAX_THREADS] = [const { AtomicU64::new(VACANT) }; MAX_THREADS];

// One past the highest slot index ever claimed; bounds reservation scans.
static HIGH_WATER: AtomicUsize = AtomicUsize::new(0);

// Retirements handed over by exiting threads, adopted by later scans.
static ORPHANS: AtomicPtr<Header> = AtomicPtr::new(ptr::null_mut());

// The number of threads currently waiting in `arm_helped`.
#[cfg(feature = "reservation-help")]
static HELP_WAITERS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static THREAD: ThreadState = ThreadState::register();
}

pub(super) fn with<R>(f: impl FnOnce(&ThreadState) -> R) -> R {
    THREAD.with(f)
}

// Per-thread epoch manager state: the owned reservation slot, the pin
// depth, and the list of retired allocations awaiting reclamation.
pub(super) struct ThreadState {
    tid: usize,
    pins: Cell<usize>,
    retired: Cell<*mut Header>,
    retire_count: Cell<usize>,
}

impl ThreadState {
    fn register() -> ThreadState {
        for (tid, slot) in RESERVATIONS.iter().enumerate() {
            if slot
                .compare_exchange(VACANT, UNRESERVED, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                HIGH_WATER.fetch_max(tid + 1, Ordering::AcqRel);
                trace!("registered reservation slot {}", tid);

                return ThreadState {
                    tid,
                    pins: Cell::new(0),
                    retired: Cell::new(ptr::null_mut()),
                    retire_count: Cell::new(0),
                };
            }
        }

        panic!("exceeded the maximum thread count ({MAX_THREADS})");
    }

    #[inline]
    fn slot(&self) -> &'static AtomicU64 {
        &RESERVATIONS[self.tid]
    }

    // Record the current epoch as this thread's reservation. Nothing retired
    // at or after it can be reclaimed until the pin is released. Only safe
    // for operations that follow forward pointers loaded after this call;
    // walking backwards in time requires `pin_linearized`.
    pub(super) fn pin_basic(&self) {
        if self.pins.get() == 0 {
            self.slot()
                .store(EPOCH.load(Ordering::SeqCst), Ordering::SeqCst);
        }
        self.pins.set(self.pins.get() + 1);
    }

    // Record a reservation that was observed equal to the global epoch
    // *after* being published, and return it. Closes the race in which a
    // retirement scan runs between a thread reading the epoch and writing
    // its slot, and thereby makes the returned epoch a valid linearization
    // point: no memory alive at it can have been reclaimed.
    pub(super) fn pin_linearized(&self) -> u64 {
        if self.pins.get() > 0 {
            // an outer pin already protects everything retired since it; the
            // current epoch is a valid linearization point above it
            self.pins.set(self.pins.get() + 1);
            return EPOCH.load(Ordering::SeqCst);
        }

        let epoch = self.arm_validated();
        self.pins.set(1);
        epoch
    }

    fn arm_validated(&self) -> u64 {
        let slot = self.slot();
        let mut epoch = EPOCH.load(Ordering::SeqCst);

        #[cfg(feature = "reservation-help")]
        let mut attempts = 0;

        loop {
            slot.store(epoch, Ordering::SeqCst);

            let current = EPOCH.load(Ordering::SeqCst);
            if current == epoch {
                return epoch;
            }

            epoch = current;

            #[cfg(feature = "reservation-help")]
            {
                attempts += 1;
                if attempts >= HELP_RETRIES {
                    return self.arm_helped();
                }
            }
        }
    }

    // Publish the help flag and wait for a committing writer (or this
    // thread) to install a validated epoch. Writers check the waiter count
    // before every epoch advance, so the wait is bounded by the number of
    // concurrent writers.
    #[cfg(feature = "reservation-help")]
    #[cold]
    fn arm_helped(&self) -> u64 {
        let slot = self.slot();

        slot.store(HELP, Ordering::SeqCst);
        HELP_WAITERS.fetch_add(1, Ordering::SeqCst);

        loop {
            let value = slot.load(Ordering::SeqCst);

            if value & HELP == 0 {
                // a writer installed an epoch for us. the writer does not
                // validate, so accept it only if it is still current;
                // otherwise raise the flag again and keep waiting. a stale
                // install is merely over-protective in the meantime.
                if EPOCH.load(Ordering::SeqCst) == value {
                    HELP_WAITERS.fetch_sub(1, Ordering::SeqCst);
                    return value;
                }

                slot.store(HELP, Ordering::SeqCst);
                continue;
            }

            // try to help ourselves
            let epoch = EPOCH.load(Ordering::SeqCst);
            if slot
                .compare_exchange(value, epoch, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
                && EPOCH.load(Ordering::SeqCst) == epoch
            {
                HELP_WAITERS.fetch_sub(1, Ordering::SeqCst);
                return epoch;
            }
        }
    }

    // Drop the innermost pin, clearing the reservation when it is the last.
    pub(super) fn unpin(&self) {
        let pins = self.pins.get();
        self.pins.set(pins - 1);

        if pins == 1 {
            self.slot().store(UNRESERVED, Ordering::SeqCst);
        }
    }

    // Add a retired allocation to this thread's list, sweeping the list
    // periodically.
    pub(super) fn retire(&self, header: *mut Header) {
        unsafe { (*Header::node(header)).next = self.retired.get() }
        self.retired.set(header);

        let count = self.retire_count.get() + 1;
        self.retire_count.set(count);

        if count % RETIRE_SCAN_FREQ == 0 {
            self.scan();
        }
    }

    // Reclaim every retired allocation whose retire epoch is strictly below
    // the minimum reservation across all live threads.
    fn scan(&self) {
        trace!("scanning retirement list");

        self.adopt_orphans();

        let min = min_reservation();
        let mut kept: *mut Header = ptr::null_mut();
        let mut current = self.retired.replace(ptr::null_mut());

        while !current.is_null() {
            unsafe {
                let node = Header::node(current);
                let next = (*node).next;

                if (*node).retire_epoch < min {
                    ((*node).reclaim)(current);
                } else {
                    (*node).next = kept;
                    kept = current;
                }

                current = next;
            }
        }

        self.retired.set(kept);
    }

    // Take over any retirements left behind by exited threads.
    fn adopt_orphans(&self) {
        let orphans = ORPHANS.swap(ptr::null_mut(), Ordering::AcqRel);
        if orphans.is_null() {
            return;
        }

        unsafe {
            let mut tail = orphans;
            while !(*Header::node(tail)).next.is_null() {
                tail = (*Header::node(tail)).next;
            }

            (*Header::node(tail)).next = self.retired.get();
        }

        self.retired.set(orphans);
    }
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        self.scan();

        // anything still protected by other threads' reservations is handed
        // over; their scans will free it once it is safe
        let head = self.retired.replace(ptr::null_mut());
        if !head.is_null() {
            unsafe {
                let mut tail = head;
                while !(*Header::node(tail)).next.is_null() {
                    tail = (*Header::node(tail)).next;
                }

                let mut current = ORPHANS.load(Ordering::Relaxed);
                loop {
                    (*Header::node(tail)).next = current;

                    match ORPHANS.compare_exchange_weak(
                        current,
                        head,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(found) => current = found,
                    }
                }
            }
        }

        trace!("releasing reservation slot {}", self.tid);
        self.slot().store(VACANT, Ordering::SeqCst);
    }
}

// The minimum reservation across all claimed slots. Unreserved and vacant
// slots hold sentinels above the epoch space, so they never bound the
// minimum.
fn min_reservation() -> u64 {
    let high = HIGH_WATER.load(Ordering::Acquire);

    let mut min = u64::MAX;
    for slot in &RESERVATIONS[..high] {
        min = min.min(slot.load(Ordering::SeqCst));
    }

    min
}

// Install epochs into reservation slots that are flagged for help. Called
// by writers before every epoch advance; the slot owner revalidates before
// trusting the installed value, so no validation is needed here.
#[cfg(feature = "reservation-help")]
pub(super) fn help_waiting_pins() {
    if HELP_WAITERS.load(Ordering::SeqCst) == 0 {
        return;
    }

    let high = HIGH_WATER.load(Ordering::Acquire);
    for slot in &RESERVATIONS[..high] {
        let value = slot.load(Ordering::SeqCst);

        if value & HELP != 0 && value != VACANT && value != UNRESERVED {
            let epoch = EPOCH.load(Ordering::SeqCst);
            let _ = slot.compare_exchange(value, epoch, Ordering::SeqCst, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
pub(super) fn current_tid() -> usize {
    with(|thread| thread.tid)
}

#[cfg(test)]
mod tests {
    use std::thread;

    #[test]
    fn distinct_slots() {
        let here = super::current_tid();

        let there = thread::scope(|s| {
            let a = s.spawn(super::current_tid);
            let b = s.spawn(super::current_tid);
            (a.join().unwrap(), b.join().unwrap())
        });

        assert_ne!(here, there.0);
        assert_ne!(here, there.1);
        assert_ne!(there.0, there.1);
    }

    #[test]
    fn slots_are_reused() {
        // sequential threads cannot exhaust the slot array
        let mut max = 0;
        for _ in 0..64 {
            let tid = thread::spawn(super::current_tid).join().unwrap();
            max = max.max(tid);
        }

        assert!(max < super::MAX_THREADS);
    }
}
