use criterion::{criterion_group, criterion_main, Criterion};
use entangled_core::{codec, flatten, Delta, Dto, Node, Value};
use serde_json::json;
use std::hint::black_box;

fn sample(rows: usize, changed: Option<usize>) -> Value {
    let items: Vec<serde_json::Value> = (0..rows)
        .map(|id| {
            let qty = if Some(id) == changed { -1 } else { id as i64 * 3 };
            json!({"id": id, "name": format!("item {id}"), "qty": qty, "tags": ["a", "b"], "price": 9.5})
        })
        .collect();
    Value::from(json!({"items": items, "total": rows}))
}

fn canonical(value: &Value) -> Node {
    flatten(value).unwrap().into_node().unwrap()
}

fn bench_flatten_1k(c: &mut Criterion) {
    let value = sample(1_000, None);
    c.bench_function("flatten_1k_rows", |b| {
        b.iter(|| black_box(flatten(black_box(&value)).unwrap()))
    });
}

fn bench_compress_1k(c: &mut Criterion) {
    let node = canonical(&sample(1_000, None));
    c.bench_function("compress_1k_rows", |b| {
        b.iter(|| black_box(codec::compress(black_box(&node)).unwrap()))
    });
}

fn bench_decompress_1k(c: &mut Criterion) {
    let text = codec::compress(&canonical(&sample(1_000, None))).unwrap();
    c.bench_function("decompress_1k_rows", |b| {
        b.iter(|| black_box(codec::decompress(black_box(&text)).unwrap()))
    });
}

fn bench_diff_single_change(c: &mut Criterion) {
    let before = canonical(&sample(1_000, None));
    let after = canonical(&sample(1_000, Some(500)));
    c.bench_function("diff_1k_rows_one_change", |b| {
        b.iter(|| black_box(Delta::diff(black_box(&before), black_box(&after))))
    });
}

fn bench_patch_compressed(c: &mut Criterion) {
    let before = Dto::new(sample(1_000, None)).unwrap();
    let after = Dto::new(sample(1_000, Some(500))).unwrap();
    let wire = before.diff(&after).unwrap().compress().unwrap();
    before.canonical().unwrap();

    c.bench_function("patch_compressed_1k_rows", |b| {
        b.iter(|| black_box(before.patch_compressed(black_box(&wire)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_flatten_1k,
    bench_compress_1k,
    bench_decompress_1k,
    bench_diff_single_change,
    bench_patch_compressed,
);
criterion_main!(benches);
