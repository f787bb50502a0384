//! Benchmarks for flow routing and accumulation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use terraflow_algorithms::hydrology::{
    flow_accumulation, flow_direction, flow_tracing, AccumulationInputs, AccumulationParams,
    FlowMethod, LineMethod, RoutingParams, TraceInputs, TraceMethod, TraceParams,
};
use terraflow_core::{GeoTransform, NoProgress, Raster};

/// Bowl sloping towards the centre, with a little noise against flats
fn create_basin_dem(size: usize) -> Raster<f64> {
    let mut dem = Raster::new(size, size);
    dem.set_transform(GeoTransform::new(0.0, size as f64, 1.0, -1.0));
    let center = size as f64 / 2.0;
    for row in 0..size {
        for col in 0..size {
            let dx = col as f64 - center;
            let dy = row as f64 - center;
            let noise = ((row * 7 + col * 13) % 17) as f64 * 0.01;
            dem.set(row, col, (dx * dx + dy * dy).sqrt() + noise).unwrap();
        }
    }
    dem
}

fn bench_flow_direction(c: &mut Criterion) {
    let mut group = c.benchmark_group("hydrology/flow_direction");
    for method in [FlowMethod::D8, FlowMethod::Braunschweig] {
        for size in [256, 1024] {
            let dem = create_basin_dem(size);
            let params = RoutingParams::new(method);
            group.bench_with_input(BenchmarkId::new(method.name(), size), &size, |b, _| {
                b.iter(|| flow_direction(black_box(&dem), &params).unwrap())
            });
        }
    }
    group.finish();
}

fn bench_flow_accumulation(c: &mut Criterion) {
    let mut group = c.benchmark_group("hydrology/flow_accumulation");
    for method in [FlowMethod::D8, FlowMethod::DInfinity, FlowMethod::Mfd] {
        for size in [256, 512, 1024] {
            let dem = create_basin_dem(size);
            let params = AccumulationParams::new(RoutingParams::new(method));
            group.bench_with_input(BenchmarkId::new(method.name(), size), &size, |b, _| {
                b.iter(|| {
                    flow_accumulation(
                        black_box(&dem),
                        &AccumulationInputs::default(),
                        &params,
                        &mut NoProgress,
                    )
                    .unwrap()
                })
            });
        }
    }
    group.finish();
}

fn bench_flow_tracing(c: &mut Criterion) {
    let mut group = c.benchmark_group("hydrology/flow_tracing");
    group.sample_size(10);
    for method in [LineMethod::Kinematic, LineMethod::Demon] {
        let dem = create_basin_dem(128);
        let params = TraceParams {
            seed: Some(1),
            ..TraceParams::new(TraceMethod::LineTracing(method))
        };
        group.bench_with_input(BenchmarkId::new(format!("{:?}", method), 128), &128, |b, _| {
            b.iter(|| flow_tracing(black_box(&dem), &TraceInputs::default(), &params, &mut NoProgress).unwrap())
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_flow_direction,
    bench_flow_accumulation,
    bench_flow_tracing,
);
criterion_main!(benches);
