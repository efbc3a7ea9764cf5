//! Dispatch-table hot paths:
//!   cargo bench --bench dispatch

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use weiche::{Heap, HeapCreateInfo, Method, MethodTable, SymbolTable, Value, Visibility};

fn bench_dispatch(c: &mut Criterion) {
    let heap = Heap::new(HeapCreateInfo {
        size: 8 * 1024 * 1024,
    });
    let symbols = SymbolTable::new();
    let table = MethodTable::create(&heap, 0);

    let names: Vec<_> = (0..128)
        .map(|i| symbols.intern(&format!("method_{i}")))
        .collect();
    for &name in &names {
        let exec = heap.allocate_bytecode_executable(Value::from_fixnum(1));
        table.store(&heap, name, Method::Resolved(exec), Visibility::Public);
    }
    let missing = symbols.intern("missing");

    c.bench_function("lookup_hit", |b| {
        b.iter(|| {
            for &name in &names {
                black_box(table.lookup(black_box(name)));
            }
        })
    });

    c.bench_function("lookup_miss", |b| {
        b.iter(|| black_box(table.lookup(black_box(missing))))
    });

    c.bench_function("store_overwrite", |b| {
        let name = names[0];
        let exec = heap.allocate_bytecode_executable(Value::from_fixnum(2));
        b.iter(|| {
            black_box(table.store(&heap, name, Method::Resolved(exec), Visibility::Public));
        })
    });
}

criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
