//! Benchmarks for the allocation engine.
//!
//! Benchmarks cover:
//! - ResourcePool reserve/release
//! - One allocation tick over a large pending history
//! - Group completion checks for a generator with a long history
//! - A short end-to-end run on real worker threads

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use async_trait::async_trait;
use prometheus_ensemble::builders::ManagerBuilder;
use prometheus_ensemble::config::{GenSpec, ResourceConfig, RunConfig, SimSpec};
use prometheus_ensemble::core::{
    AllocConfig, Allocator, CalcStatus, CallInput, FieldType, FieldValue, GenOutput, Generator, History, Holder,
    NewPoint, PersistentGenAllocator, ResourcePool, Row, Schema, SimOutput, Simulator, UnitPolicy, WorkerContext,
    WorkerRegistry,
};

// ============================================================================
// Helper Functions
// ============================================================================

fn history_with(points: usize, subbatch_width: usize) -> History {
    let mut history = History::new(
        Schema::new().with("x", FieldType::Float),
        Schema::new().with("f", FieldType::Float),
    )
    .unwrap();
    let points = (0..points)
        .map(|i| {
            NewPoint::new(Row::from([("x".to_string(), FieldValue::Float(i as f64))]))
                .tagged(0, (i / subbatch_width) as i64)
                .with_resource_sets(1)
        })
        .collect();
    history.append_points(1, points, 0.0).unwrap();
    history
}

fn allocator() -> PersistentGenAllocator {
    PersistentGenAllocator::new(
        AllocConfig::default(),
        UnitPolicy {
            default_units_per_point: 1,
            gen_units: 1,
        },
        vec!["x".into()],
        vec!["sim_id".into(), "f".into()],
    )
}

// ============================================================================
// ResourcePool Benchmarks
// ============================================================================

fn bench_pool_reserve_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_reserve_release");

    for capacity in [16u32, 256, 4_096] {
        group.throughput(Throughput::Elements(u64::from(capacity)));
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, &capacity| {
            let pool = ResourcePool::new(capacity);
            b.iter(|| {
                let handles: Vec<_> = (0..capacity)
                    .filter_map(|i| pool.reserve(1, Holder::Worker(i as usize)).handle())
                    .collect();
                for handle in handles {
                    pool.release(handle).unwrap();
                }
            });
        });
    }
    group.finish();
}

// ============================================================================
// Allocation Benchmarks
// ============================================================================

fn bench_allocation_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation_tick");

    for points in [1_000usize, 10_000, 100_000] {
        group.throughput(Throughput::Elements(points as u64));
        group.bench_with_input(BenchmarkId::from_parameter(points), &points, |b, &points| {
            let history = history_with(points, 4);
            let workers = WorkerRegistry::new(64);
            let pool = ResourcePool::new(64);
            let mut alloc = allocator();
            b.iter(|| {
                let allocation = alloc.allocate(&workers, &history, &pool).unwrap();
                allocation.release_all(&pool).unwrap();
                black_box(allocation);
            });
        });
    }
    group.finish();
}

fn bench_group_completion(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_completion");

    for points in [1_000usize, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(points), &points, |b, &points| {
            let mut history = History::new(
                Schema::new().with("x", FieldType::Float),
                Schema::new().with("f", FieldType::Float),
            )
            .unwrap();
            let mut workers = WorkerRegistry::new(2);
            workers.start_gen(1, None).unwrap();
            let batch: Vec<NewPoint> = (0..points)
                .map(|i| NewPoint::new(Row::from([("x".to_string(), FieldValue::Float(i as f64))])))
                .collect();
            let ids: Vec<usize> = history.append_points(1, batch, 0.0).unwrap().collect();
            workers.gen_output(1, ids.iter().copied()).unwrap();
            history.mark_given(&ids, 2, 0.0).unwrap();
            let rows: Vec<Row> = ids
                .iter()
                .map(|_| Row::from([("f".to_string(), FieldValue::Float(0.0))]))
                .collect();
            history.merge_results(2, &ids, &rows, CalcStatus::Success, 0.0).unwrap();

            let pool = ResourcePool::new(0);
            let mut alloc = allocator();
            b.iter(|| black_box(alloc.allocate(&workers, &history, &pool).unwrap()));
        });
    }
    group.finish();
}

// ============================================================================
// End-to-End Scenario Benchmarks
// ============================================================================

struct Sweep {
    round: u32,
}

#[async_trait]
impl Generator for Sweep {
    async fn start(&mut self, _ctx: &mut WorkerContext) -> anyhow::Result<GenOutput> {
        Ok(self.next())
    }

    async fn resume(&mut self, _returned: CallInput, _ctx: &mut WorkerContext) -> anyhow::Result<GenOutput> {
        Ok(self.next())
    }
}

impl Sweep {
    fn next(&mut self) -> GenOutput {
        self.round += 1;
        GenOutput::points(
            (0..8)
                .map(|i| {
                    NewPoint::new(Row::from([("x".to_string(), FieldValue::Float(f64::from(i)))]))
                        .tagged(i64::from(self.round), i64::from(i))
                })
                .collect(),
        )
    }
}

struct Identity;

#[async_trait]
impl Simulator for Identity {
    async fn evaluate(&self, input: CallInput, _ctx: &mut WorkerContext) -> anyhow::Result<SimOutput> {
        let rows = input
            .rows
            .iter()
            .map(|row| Row::from([("f".to_string(), row["x"].clone())]))
            .collect();
        Ok(SimOutput::success(rows))
    }
}

fn bench_end_to_end_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("end_to_end_run");
    group.sample_size(10);

    group.bench_function("sim_max_200", |b| {
        b.iter(|| {
            let config = RunConfig::new()
                .with_workers(5)
                .with_sim_max(200)
                .with_result_poll_ms(1)
                .with_resources(ResourceConfig {
                    total_units: 4,
                    default_units_per_point: 1,
                    gen_units: 0,
                });
            let outcome = ManagerBuilder::new(config)
                .gen_spec(GenSpec::new(Schema::new().with("x", FieldType::Float)))
                .sim_spec(SimSpec::new(["x"], Schema::new().with("f", FieldType::Float)))
                .generator(|_| Sweep { round: 0 })
                .simulator(Identity)
                .build()
                .unwrap()
                .run()
                .unwrap();
            black_box(outcome.history.returned_count());
        });
    });
    group.finish();
}

// ============================================================================
// Benchmark Groups
// ============================================================================

criterion_group!(pool_benches, bench_pool_reserve_release);

criterion_group!(alloc_benches, bench_allocation_tick, bench_group_completion);

criterion_group!(scenario_benches, bench_end_to_end_run);

criterion_main!(pool_benches, alloc_benches, scenario_benches);
