#![allow(dead_code)]

use strata::{HashValue, Table};

// A hash for tests that want short, readable key material.
pub fn h(hash: u128) -> HashValue {
    HashValue::new(hash).unwrap()
}

// How many threads concurrent tests should spawn.
pub fn threads() -> usize {
    num_cpus::get().clamp(2, 8)
}

// Run the test on different initial store sizes.
pub fn with_table<V>(mut test: impl FnMut(&dyn Fn() -> Table<V>)) {
    // the default store, migrating early and often
    test(&Table::new);

    // a store large enough that small tests never migrate
    test(&(|| Table::with_capacity(1 << 12)));
}
