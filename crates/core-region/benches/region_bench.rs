use core_region::{Rect, Region};
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

fn checker(cols: i32, rows: i32, cell: i32) -> Region {
    let mut reg = Region::new();
    for y in 0..rows {
        for x in 0..cols {
            if (x + y) % 2 == 0 {
                reg.add(Rect::from_size(x * cell, y * cell, cell, cell));
            }
        }
    }
    reg
}

fn bench_exclusion(c: &mut Criterion) {
    // The tree's hot path: subtracting an accumulating exclusion region from
    // every earlier sibling.
    let occluder = Region::from_rect(Rect::new(10, 10, 500, 400));
    let busy = checker(32, 24, 20);
    c.bench_function("subtract_checker_32x24", |b| {
        b.iter(|| {
            let mut reg = busy.clone();
            reg.subtract(black_box(&occluder));
            black_box(reg)
        })
    });
    c.bench_function("test_checker_32x24", |b| {
        b.iter(|| black_box(busy.test(black_box(&occluder))))
    });
}

criterion_group!(benches, bench_exclusion);
criterion_main!(benches);
