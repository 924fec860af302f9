use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pagestore::bitmap::find_free_range;

/// A bitmap with a repeating busy/free texture: runs of `free` clear bits
/// every `period` bits.
fn textured_bitmap(words: usize, period: u64, free: u64) -> Vec<u64> {
    let mut bitmap = vec![u64::MAX; words];
    let bits = words as u64 * 64;
    let mut pos = period;
    while pos + free < bits {
        for bit in pos..pos + free {
            bitmap[(bit / 64) as usize] &= !(1u64 << (bit % 64));
        }
        pos += period;
    }
    bitmap
}

fn bench_find_free_range(c: &mut Criterion) {
    // 1 GiB worth of pages: 131072 bits
    let sparse = textured_bitmap(2048, 4096, 8);
    let dense = textured_bitmap(2048, 64, 4);
    let full = vec![u64::MAX; 2048];

    c.bench_function("find_single_near_start", |b| {
        b.iter(|| find_free_range(black_box(&dense), 1, 0))
    });

    c.bench_function("find_run_with_locality_hint", |b| {
        b.iter(|| find_free_range(black_box(&sparse), 8, 65536))
    });

    c.bench_function("find_in_mostly_full_bitmap", |b| {
        b.iter(|| find_free_range(black_box(&sparse), 4, 131000))
    });

    c.bench_function("exhaustive_miss", |b| {
        b.iter(|| find_free_range(black_box(&full), 1, 0))
    });
}

criterion_group!(benches, bench_find_free_range);
criterion_main!(benches);
