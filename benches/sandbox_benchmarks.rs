//! Benchmarks for the analysis sandbox.
//!
//! Run with: cargo bench
//!
//! The end-to-end group needs `python3` on `PATH` and is skipped otherwise.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use tokio::runtime::Runtime as TokioRuntime;

use analysis_sandbox_rs::prelude::*;
use analysis_sandbox_rs::{validate_code, GuardedProgram};

fn sample_array(n: usize) -> SafeArray {
    (0..n).map(|i| ((i * 7919) % 1000) as f64 / 10.0).collect()
}

fn sample_records(n: usize, groups: usize) -> Vec<Value> {
    (0..n)
        .map(|i| {
            json!({
                "symbol": format!("S{}", i % groups),
                "price": ((i * 31) % 500) as f64 / 4.0,
                "volume": (i * 13) % 1000,
            })
        })
        .collect()
}

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

fn bench_array(c: &mut Criterion) {
    let mut group = c.benchmark_group("safe_array");

    for size in [100, 10_000, 100_000] {
        let array = sample_array(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("percentile", size), &array, |b, a| {
            b.iter(|| black_box(a.percentile(black_box(95.0))))
        });
        group.bench_with_input(BenchmarkId::new("describe", size), &array, |b, a| {
            b.iter(|| black_box(a.describe()))
        });
    }

    group.finish();
}

fn bench_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("safe_table");

    for size in [100, 10_000] {
        let table = SafeTable::from_records(&sample_records(size, 20)).unwrap();
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("groupby_mean", size), &table, |b, t| {
            b.iter(|| {
                let grouped = t.groupby(&["symbol"]).unwrap();
                black_box(grouped.mean("price").unwrap())
            })
        });
        group.bench_with_input(BenchmarkId::new("sort_values", size), &table, |b, t| {
            b.iter(|| black_box(t.sort_values(&["price"], false).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("where", size), &table, |b, t| {
            b.iter(|| black_box(t.where_("volume", ">", &json!(500)).unwrap()))
        });
    }

    let left = SafeTable::from_records(&sample_records(5_000, 50)).unwrap();
    let sectors: Vec<Value> = (0..50)
        .map(|i| json!({"symbol": format!("S{}", i), "sector": format!("sector-{}", i % 7)}))
        .collect();
    let right = SafeTable::from_records(&sectors).unwrap();
    group.bench_function("merge_inner_5000x50", |b| {
        b.iter(|| black_box(SafeTable::merge(&left, &right, "symbol", JoinHow::Inner).unwrap()))
    });

    group.finish();
}

fn bench_program(c: &mut Criterion) {
    let mut group = c.benchmark_group("program");

    let policy = IsolationPolicy::analysis();
    let mut context = Context::new();
    context
        .insert("trades", Value::Array(sample_records(1_000, 10)))
        .unwrap();
    let script = "from safe_data import SafeTable\nresult = SafeTable(trades).groupby('symbol').mean('price')\n";

    group.bench_function("compose", |b| {
        b.iter(|| black_box(GuardedProgram::compose(&policy, &context, black_box(script)).unwrap()))
    });

    let long_script = script.repeat(200);
    group.bench_function("validate_code_400_lines", |b| {
        b.iter(|| black_box(validate_code(black_box(&long_script))))
    });

    group.finish();
}

fn bench_execution(c: &mut Criterion) {
    if !python_available() {
        eprintln!("Skipping execution benchmark: python3 not found");
        return;
    }

    let rt = TokioRuntime::new().unwrap();
    let manager = SandboxFactory::new().filtering().unwrap();
    let mut context = Context::new();
    context
        .insert("prices", json!((0..100).collect::<Vec<_>>()))
        .unwrap();

    let mut group = c.benchmark_group("execution");
    group.sample_size(10);

    group.bench_function("simple_result", |b| {
        b.iter(|| black_box(rt.block_on(manager.execute("result = 1 + 1", &Context::new()))))
    });

    group.bench_function("safe_array_summary", |b| {
        b.iter(|| {
            black_box(rt.block_on(manager.execute(
                "from safe_data import SafeArray\nresult = SafeArray(prices).describe()",
                &context,
            )))
        })
    });

    group.finish();
}

criterion_group!(benches, bench_array, bench_table, bench_program, bench_execution);
criterion_main!(benches);
