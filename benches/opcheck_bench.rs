use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use opcheck::args::{ArgValue, CallArgs};
use opcheck::catalog;
use opcheck::config::SearchConfig;
use opcheck::dtype::DType;
use opcheck::schema::OpSchema;

// Check and generation latency on the catalog operations.
// Every call below is well-formed; the "repair" calls need one edit.

fn schema(name: &str) -> OpSchema {
    catalog::lookup(name)
        .expect("catalog op")
        .expect("catalog schema must build")
}

fn pool_call(dtype: DType, spatial: &[i64]) -> CallArgs {
    let mut shape = vec![8];
    shape.extend(spatial);
    shape.push(16);
    CallArgs::new()
        .with("input", ArgValue::tensor(&shape, dtype))
        .with("ksize", ArgValue::ints(&[3]))
        .with("strides", ArgValue::ints(&[2]))
        .with("padding", ArgValue::str("SAME"))
}

fn scenarios() -> [(&'static str, &'static str, CallArgs); 4] {
    [
        ("avg_pool/valid", "avg_pool", pool_call(DType::Float32, &[32, 32])),
        ("avg_pool/repair_dtype", "avg_pool", pool_call(DType::Int32, &[32, 32])),
        (
            "add/repair_dim",
            "add",
            CallArgs::new()
                .with("x", ArgValue::tensor(&[4, 5, 6], DType::Float32))
                .with("y", ArgValue::tensor(&[4, 5, 7], DType::Float32)),
        ),
        (
            "space_to_depth/valid",
            "space_to_depth",
            CallArgs::new()
                .with("input", ArgValue::tensor(&[1, 12, 12, 3], DType::Float32))
                .with("block_size", ArgValue::int(3)),
        ),
    ]
}

// Full `check_args`: local predicates plus the budgeted search.
fn bench_check_args(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_args");
    let config = SearchConfig::default();

    for (name, op, args) in scenarios() {
        let s = schema(op);
        group.bench_with_input(BenchmarkId::from_parameter(name), &args, |b, args| {
            b.iter(|| black_box(s.check_args(black_box(args), &config)));
        });
    }

    group.finish();
}

// Schema finalisation: declaration checks, graph construction, fingerprint.
fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    for name in catalog::names() {
        group.bench_function(name, |b| b.iter(|| black_box(schema(name))));
    }
    group.finish();
}

// First 50 generated cases at the default edit budget.
fn bench_generate(c: &mut Criterion) {
    let mut group = c.benchmark_group("generate_args");
    let config = SearchConfig::default();

    for name in catalog::names() {
        let s = schema(name);
        group.bench_function(name, |b| {
            b.iter(|| {
                let n = s
                    .generate_args(&config)
                    .map(|cases| cases.take(50).count())
                    .unwrap_or(0);
                black_box(n)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_check_args, bench_build, bench_generate);
criterion_main!(benches);
