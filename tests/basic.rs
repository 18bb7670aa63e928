use std::sync::Barrier;
use std::thread;

mod common;
use common::{h, threads, with_table};

#[test]
fn new() {
    with_table::<usize>(|table| drop(table()));
}

#[test]
fn get_empty() {
    with_table::<usize>(|table| {
        let table = table();
        let guard = table.guard();
        assert_eq!(table.get(h(42), &guard), None);
    });
}

#[test]
fn insert_and_get() {
    with_table::<usize>(|table| {
        let table = table();
        let guard = table.guard();

        assert_eq!(table.insert(h(1), 1, &guard), None);
        assert_eq!(table.get(h(1), &guard), Some(&1));
    });
}

#[test]
fn reinsert() {
    with_table::<usize>(|table| {
        let table = table();
        let guard = table.guard();

        assert_eq!(table.insert(h(2), 10, &guard), None);
        assert_eq!(table.insert(h(2), 20, &guard), Some(&10));
        assert_eq!(table.get(h(2), &guard), Some(&20));
    });
}

#[test]
fn remove_empty() {
    with_table::<usize>(|table| {
        let table = table();
        let guard = table.guard();
        assert_eq!(table.remove(h(3), &guard), None);
    });
}

#[test]
fn insert_and_remove() {
    with_table::<usize>(|table| {
        let table = table();
        let guard = table.guard();

        table.insert(h(2), 10, &guard);
        table.insert(h(2), 20, &guard);
        assert_eq!(table.remove(h(2), &guard), Some(&20));
        assert_eq!(table.get(h(2), &guard), None);

        // removing an absent key reports absence, once
        assert_eq!(table.remove(h(2), &guard), None);
    });
}

#[test]
fn reinsert_after_remove() {
    with_table::<usize>(|table| {
        let table = table();
        let guard = table.guard();

        table.insert(h(7), 1, &guard);
        table.remove(h(7), &guard);

        // a tombstoned key reads as absent and reinserts displace nothing
        assert_eq!(table.insert(h(7), 2, &guard), None);
        assert_eq!(table.get(h(7), &guard), Some(&2));
    });
}

#[test]
fn try_insert() {
    with_table::<usize>(|table| {
        let table = table();
        let guard = table.guard();

        assert!(table.try_insert(h(5), 1, &guard).is_ok());

        let err = table.try_insert(h(5), 2, &guard).unwrap_err();
        assert_eq!(err.current, &1);
        assert_eq!(err.not_inserted, 2);
        assert_eq!(table.get(h(5), &guard), Some(&1));

        // a tombstone does not count as present
        table.remove(h(5), &guard);
        assert!(table.try_insert(h(5), 3, &guard).is_ok());
        assert_eq!(table.get(h(5), &guard), Some(&3));
    });
}

#[test]
fn replace() {
    with_table::<usize>(|table| {
        let table = table();
        let guard = table.guard();

        // replacing an absent key hands the value back
        assert_eq!(table.replace(h(6), 1, &guard), Err(1));
        assert_eq!(table.get(h(6), &guard), None);

        table.insert(h(6), 1, &guard);
        assert_eq!(table.replace(h(6), 2, &guard), Ok(&1));
        assert_eq!(table.get(h(6), &guard), Some(&2));

        table.remove(h(6), &guard);
        assert_eq!(table.replace(h(6), 3, &guard), Err(3));
    });
}

#[test]
fn len() {
    with_table::<usize>(|table| {
        let table = table();
        let guard = table.guard();

        assert!(table.is_empty());

        for i in 1..=100u128 {
            table.insert(h(i), i as usize, &guard);
        }
        assert_eq!(table.len(), 100);

        for i in 1..=50u128 {
            table.remove(h(i), &guard);
        }
        assert_eq!(table.len(), 50);

        // overwrites do not change the length
        for i in 51..=100u128 {
            table.insert(h(i), 0, &guard);
        }
        assert_eq!(table.len(), 50);
    });
}

// Hashes that agree in their low 64 bits collide on the same home bucket
// and must be separated by probing.
#[test]
fn colliding_low_bits() {
    with_table::<usize>(|table| {
        let table = table();
        let guard = table.guard();

        let low = 0x1234_5678u128;
        for high in 1..=64u128 {
            table.insert(h((high << 64) | low), high as usize, &guard);
        }

        for high in 1..=64u128 {
            assert_eq!(table.get(h((high << 64) | low), &guard), Some(&(high as usize)));
        }
    });
}

// Enough inserts to migrate the default store several times over.
#[test]
fn growth() {
    let entries = if cfg!(miri) { 128 } else { 4096 };

    with_table::<usize>(|table| {
        let table = table();

        {
            let guard = table.guard();
            for i in 1..=entries as u128 {
                table.insert(h(i), i as usize, &guard);
            }
        }

        let guard = table.guard();
        for i in 1..=entries as u128 {
            assert_eq!(table.get(h(i), &guard), Some(&(i as usize)));
        }
        assert_eq!(table.len(), entries);
    });
}

// Tombstone-heavy workloads trigger same-size rehashes that purge them.
#[test]
fn churn() {
    let rounds = if cfg!(miri) { 4 } else { 64 };

    with_table::<usize>(|table| {
        let table = table();
        let guard = table.guard();

        for round in 0..rounds {
            for i in 1..=64u128 {
                table.insert(h(i), round, &guard);
            }
            for i in 1..=64u128 {
                assert_eq!(table.remove(h(i), &guard), Some(&round));
            }
        }

        assert_eq!(table.len(), 0);
        for i in 1..=64u128 {
            assert_eq!(table.get(h(i), &guard), None);
        }
    });
}

#[test]
fn guards_keep_displaced_values_alive() {
    with_table::<String>(|table| {
        let table = table();
        let guard = table.guard();

        table.insert(h(9), "first".to_owned(), &guard);
        let displaced = table.insert(h(9), "second".to_owned(), &guard).unwrap();
        let removed = table.remove(h(9), &guard).unwrap();

        // both references outlive the writes that displaced them
        assert_eq!(displaced, "first");
        assert_eq!(removed, "second");
    });
}

#[test]
fn concurrent_insert() {
    let entries = if cfg!(miri) { 64 } else { 1 << 12 };

    with_table::<usize>(|table| {
        let table = table();
        let threads = threads();
        let barrier = Barrier::new(threads);

        thread::scope(|s| {
            for t in 0..threads {
                let table = &table;
                let barrier = &barrier;

                s.spawn(move || {
                    barrier.wait();
                    let guard = table.guard();

                    for i in 0..entries {
                        let key = (t * entries + i + 1) as u128;
                        assert_eq!(table.insert(h(key), t, &guard), None);
                    }
                });
            }
        });

        let guard = table.guard();
        for t in 0..threads {
            for i in 0..entries {
                let key = (t * entries + i + 1) as u128;
                assert_eq!(table.get(h(key), &guard), Some(&t));
            }
        }
        assert_eq!(table.len(), threads * entries);
    });
}

#[test]
fn concurrent_remove() {
    let entries = if cfg!(miri) { 64 } else { 1 << 12 };

    with_table::<usize>(|table| {
        let table = table();

        {
            let guard = table.guard();
            for i in 1..=entries as u128 {
                table.insert(h(i), i as usize, &guard);
            }
        }

        let threads = threads();
        let barrier = Barrier::new(threads);

        thread::scope(|s| {
            for _ in 0..threads {
                let table = &table;
                let barrier = &barrier;

                s.spawn(move || {
                    barrier.wait();
                    let guard = table.guard();

                    for i in 1..=entries as u128 {
                        if let Some(&value) = table.remove(h(i), &guard) {
                            // a removal always reports the value some insert
                            // put there
                            assert_eq!(value, i as usize);
                        }
                    }
                });
            }
        });

        let guard = table.guard();
        for i in 1..=entries as u128 {
            assert_eq!(table.get(h(i), &guard), None);
        }
    });
}

// Concurrent writers racing on the same key combine rather than retry;
// every reader must still see one of the written values.
#[test]
fn concurrent_same_key() {
    let iterations = if cfg!(miri) { 32 } else { 1 << 10 };

    with_table::<usize>(|table| {
        let table = table();
        let threads = threads();
        let barrier = Barrier::new(threads);

        thread::scope(|s| {
            for t in 0..threads {
                let table = &table;
                let barrier = &barrier;

                s.spawn(move || {
                    barrier.wait();
                    let guard = table.guard();

                    for i in 0..iterations {
                        table.insert(h(1), t * iterations + i, &guard);

                        let seen = *table.get(h(1), &guard).unwrap();
                        assert!(seen < threads * iterations);
                    }
                });
            }
        });

        let guard = table.guard();
        assert!(table.get(h(1), &guard).is_some());
        assert_eq!(table.len(), 1);
    });
}

// With a single writer storing an increasing counter, linearizable reads
// can never observe the counter going backwards.
#[test]
fn monotonic_reads() {
    let writes = if cfg!(miri) { 128 } else { 1 << 14 };

    let table = strata::Table::new();
    let writer_done = std::sync::atomic::AtomicBool::new(false);

    thread::scope(|s| {
        {
            let table = &table;
            let writer_done = &writer_done;
            s.spawn(move || {
                let guard = table.guard();
                for i in 0..writes {
                    table.insert(h(1), i, &guard);
                }
                writer_done.store(true, std::sync::atomic::Ordering::Relaxed);
            });
        };

        for _ in 0..2 {
            let table = &table;
            let writer_done = &writer_done;
            s.spawn(move || {
                let mut last = 0;
                let guard = table.guard();

                while last + 1 < writes {
                    if let Some(&seen) = table.get(h(1), &guard) {
                        assert!(seen >= last, "read went backwards: {seen} < {last}");
                        last = seen;
                    }

                    if writer_done.load(std::sync::atomic::Ordering::Relaxed) {
                        break;
                    }
                }
            });
        }
    });
}
