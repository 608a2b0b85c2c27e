//! Safepoint Table Benchmarks
//!
//! Lookups the stack walker performs on every frame: position to index,
//! direct-call enumeration and code-cache address resolution.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use prism_target::target::safepoints::{self, DIRECT_CALL, INDIRECT_CALL, SAFEPOINT, Safepoints};
use prism_target::target::{RawTarget, TargetKind};
use prism_target::{
    CodegenResult, CompileContext, CompileError, MethodRef, Nature, RuntimeCompiler, TargetConfig, TargetMethod,
    TargetRuntime,
};

// =============================================================================
// Helpers
// =============================================================================

/// A table of `n` entries, cycling direct call, indirect call and poll.
fn table(n: usize) -> Safepoints {
    let entries: Vec<u32> = (0..n)
        .map(|i| {
            let pos = 16 + i * 12;
            match i % 3 {
                0 => safepoints::make(pos, pos - 5, DIRECT_CALL),
                1 => safepoints::make(pos, pos - 3, INDIRECT_CALL),
                _ => safepoints::make(pos, pos, SAFEPOINT),
            }
        })
        .collect();
    Safepoints::new(entries)
}

struct Unused;

impl RuntimeCompiler for Unused {
    fn name(&self) -> &str {
        "unused"
    }

    fn nature(&self) -> Nature {
        Nature::Opt
    }

    fn compile(
        &self,
        _rt: &TargetRuntime,
        _method: &MethodRef,
        _for_deopt: bool,
        _ctx: &mut CompileContext,
    ) -> Result<CodegenResult, CompileError> {
        Err(CompileError::new("benchmarks do not compile"))
    }
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_index_of(c: &mut Criterion) {
    let mut group = c.benchmark_group("safepoints/index_of");
    for n in [8usize, 64, 512] {
        let table = table(n);
        let probe = table.pos_at(n / 2);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(n), &table, |b, table| {
            b.iter(|| table.index_of(black_box(probe)))
        });
    }
    group.finish();
}

fn bench_direct_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("safepoints/direct_calls");
    for n in [8usize, 64, 512] {
        let table = table(n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &table, |b, table| {
            b.iter(|| black_box(table).direct_calls().count())
        });
    }
    group.finish();
}

fn bench_find_by_ip(c: &mut Criterion) {
    let rt = TargetRuntime::new(TargetConfig::for_testing(), Arc::new(Unused), None).expect("runtime");
    let methods: Vec<Arc<TargetMethod>> = (0..256)
        .map(|i| {
            TargetMethod::install_raw(&rt, RawTarget::new(format!("m{i}"), TargetKind::Compiled, vec![0x90; 64]))
                .expect("install")
        })
        .collect();
    let ips: Vec<usize> = methods.iter().map(|tm| tm.code_start() + 17).collect();

    c.bench_function("code_cache/find_by_ip", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % ips.len();
            rt.code_cache().find_by_ip(black_box(ips[i]))
        })
    });
}

criterion_group!(benches, bench_index_of, bench_direct_calls, bench_find_by_ip);
criterion_main!(benches);
