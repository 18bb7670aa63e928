use criterion::{black_box, criterion_group, criterion_main, Criterion};
use strata::{HashValue, Table};

fn h(hash: u128) -> HashValue {
    HashValue::new(hash).unwrap()
}

fn insert(c: &mut Criterion) {
    c.bench_function("insert", |b| {
        let table = Table::new();
        let guard = table.guard();
        let mut key = 0u128;

        b.iter(|| {
            key += 1;
            table.insert(h(key), key, &guard);
        });
    });

    c.bench_function("overwrite", |b| {
        let table = Table::new();
        let guard = table.guard();
        table.insert(h(1), 0u128, &guard);

        b.iter(|| {
            table.insert(h(1), 1, &guard);
        });
    });
}

fn get(c: &mut Criterion) {
    c.bench_function("get", |b| {
        let table = Table::new();
        let guard = table.guard();

        for key in 1..=1024u128 {
            table.insert(h(key), key, &guard);
        }

        let mut key = 0u128;
        b.iter(|| {
            key = key % 1024 + 1;
            black_box(table.get(h(key), &guard));
        });
    });
}

fn view(c: &mut Criterion) {
    c.bench_function("view_1024", |b| {
        let table = Table::new();
        let guard = table.guard();

        for key in 1..=1024u128 {
            table.insert(h(key), key, &guard);
        }

        b.iter(|| black_box(table.view(&guard).len()));
    });
}

criterion_group!(benches, insert, get, view);
criterion_main!(benches);
