//! Performance benchmarks for the Quicksilver JIT core
//!
//! Run with: cargo bench
//!
//! These benchmarks measure the paths that run most often:
//! - Execution counter hot path (increment and checkpoint)
//! - Inline cache state transitions
//! - Linker finalize with and without branch compaction
//! - Whole-runtime calls once a function is optimized

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use quicksilver_jit::assembler::{CodeBuffer, Condition, Instruction, JitCompilationEffort, Linker};
use quicksilver_jit::bytecode::{BytecodeBuilder, Slot};
use quicksilver_jit::executable::{CodeOwner, ExecutablePool};
use quicksilver_jit::ic::{next_state, AccessObservation, StubState};
use quicksilver_jit::profile::{ExecutionCounter, MemoryPressure};
use quicksilver_jit::structure::{JsObject, StructureTable};
use quicksilver_jit::{JitOptions, JitRuntime};

/// Benchmark: counting executions until a threshold trips
fn bench_execution_counter(c: &mut Criterion) {
    let mut group = c.benchmark_group("execution_counter");

    for &multiplier in &[1.0, 4.0] {
        group.bench_with_input(BenchmarkId::new("until_crossed", multiplier), &multiplier, |b, &multiplier| {
            let pressure = MemoryPressure::new(multiplier, 1000);
            b.iter(|| {
                let mut counter = ExecutionCounter::new();
                counter.set_new_threshold(black_box(1000), &pressure);
                let mut ticks = 0u32;
                loop {
                    ticks += 1;
                    if counter.tick() && counter.check_if_threshold_crossed_and_set(&pressure) {
                        break;
                    }
                }
                ticks
            })
        });
    }

    group.finish();
}

/// Benchmark: inline cache transitions over a growing set of shapes
fn bench_ic_transitions(c: &mut Criterion) {
    let mut group = c.benchmark_group("ic_transitions");
    let mut table = StructureTable::new();
    let objects: Vec<_> = (0..16)
        .map(|i| {
            let tag = format!("s{}", i);
            JsObject::new(table.create_with_properties(None, &[tag.as_str(), "x"]))
        })
        .collect();
    let observations: Vec<_> = objects.iter().map(|o| AccessObservation::for_get(o, "x")).collect();

    group.bench_function("monomorphic", |b| {
        b.iter(|| {
            let mut state = StubState::Unset;
            for _ in 0..16 {
                state = next_state(&state, black_box(&observations[0]), 8);
            }
            state
        })
    });

    group.bench_function("to_generic", |b| {
        b.iter(|| {
            let mut state = StubState::Unset;
            for observation in &observations {
                state = next_state(&state, black_box(observation), 8);
            }
            state
        })
    });

    group.bench_function("fast_path_hit", |b| {
        let state = next_state(&StubState::Unset, &observations[3], 8);
        b.iter(|| state.try_get(black_box(&objects[3])))
    });

    group.finish();
}

fn branchy_buffer(branches: usize) -> CodeBuffer {
    let mut buffer = CodeBuffer::new();
    let labels: Vec<_> = (0..branches).map(|_| buffer.new_label()).collect();
    for (i, label) in labels.iter().enumerate() {
        buffer.emit(Instruction::Nop);
        let target = labels[(i * 7 + 3) % branches];
        buffer.branch(Condition::NotEqual, target).unwrap();
        buffer.bind(*label);
    }
    buffer.emit(Instruction::Return);
    buffer
}

/// Benchmark: finalize with and without branch compaction
fn bench_finalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("finalize");
    let pool = ExecutablePool::new(&JitOptions::default());

    for &branches in &[16usize, 256, 2048] {
        group.throughput(Throughput::Elements(branches as u64));
        for compaction in [true, false] {
            let name = if compaction { "compacted" } else { "uncompacted" };
            group.bench_with_input(BenchmarkId::new(name, branches), &branches, |b, &branches| {
                let linker = Linker::new(&pool).with_compaction(compaction);
                b.iter_batched(
                    || branchy_buffer(branches),
                    |buffer| {
                        linker
                            .finalize(buffer, CodeOwner::Thunk, JitCompilationEffort::MustSucceed)
                            .unwrap()
                    },
                    criterion::BatchSize::SmallInput,
                )
            });
        }
    }

    group.finish();
}

/// Benchmark: calls into a function that already tiered up
fn bench_optimized_calls(c: &mut Criterion) {
    let mut runtime = JitRuntime::new(JitOptions {
        threshold_for_jit_after_warm_up: 4,
        threshold_for_optimize_after_warm_up: 20,
        minimum_optimization_delay: 0,
        desired_profile_liveness_rate: 0.0,
        desired_profile_fullness_rate: 0.0,
        ..JitOptions::default()
    })
    .unwrap();

    let mut b = BytecodeBuilder::new("sum", 1);
    let object = b.param(0);
    let x = b.new_register();
    let y = b.new_register();
    b.get_by_id(x, object, "x");
    b.get_by_id(y, object, "y");
    b.add(x, x, y);
    b.ret(x);
    let sum = runtime.register(b.finish().unwrap());
    let point = [Slot::Object(runtime.create_object(&[("x", 1), ("y", 2)]))];
    for _ in 0..1000 {
        runtime.call(sum, &point).unwrap();
    }

    c.bench_function("optimized_call", |b| {
        b.iter(|| runtime.call(sum, black_box(&point)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_execution_counter,
    bench_ic_transitions,
    bench_finalize,
    bench_optimized_calls,
);
criterion_main!(benches);
