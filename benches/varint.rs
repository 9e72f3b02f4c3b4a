use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use protodyn::leb128 as vint;

fn varint_decoding(c: &mut Criterion) {
    let values: Vec<u64> = vec![
        1,
        1 << 7,
        1 << 14,
        1 << 21,
        1 << 28,
        1 << 35,
        1 << 42,
        1 << 49,
        1 << 56,
        u64::MAX,
    ];
    let encoded: Vec<Vec<u8>> = values
        .iter()
        .map(|&value| {
            let mut buf = Vec::new();
            vint::write_u64(value, &mut buf);
            buf
        })
        .collect();

    let mut group = c.benchmark_group("varint_decode");
    for data in &encoded {
        group.bench_with_input(BenchmarkId::new("protodyn", data.len()), data, |b, data| {
            b.iter(|| {
                let value = vint::read_u64(&mut &data[..]).unwrap();
                std::hint::black_box(value)
            })
        });
        group.bench_with_input(
            BenchmarkId::new("leb128 crate", data.len()),
            data,
            |b, data| {
                b.iter(|| {
                    let value = leb128::read::unsigned(&mut &data[..]).unwrap();
                    std::hint::black_box(value)
                })
            },
        );
    }
    group.finish();
}

criterion_group!(decoding, varint_decoding);
criterion_main!(decoding);
