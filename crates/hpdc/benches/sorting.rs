// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sorting-path benchmarks.
//!
//! Measures the measurement-to-frame hot path in isolation: the
//! concentrators are never started and the tolerance windows are wide
//! enough that no frame comes due, so nothing publishes (and no timer
//! thread runs) while the benchmark loops.

use std::hint::black_box as bb;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use hpdc::publisher::wire;
use hpdc::{
    time, Concentrator, ConcentratorConfig, DownsamplingMethod, Frame, FrameSink, Measurement,
    MeasurementKey, Result, TimerRegistry,
};

struct NullSink;

impl FrameSink for NullSink {
    fn publish(&self, _frame: &Frame, _frame_index: u16) -> Result<()> {
        Ok(())
    }
}

fn concentrator(config: ConcentratorConfig) -> Concentrator {
    Concentrator::new(config, Arc::new(TimerRegistry::new()), Arc::new(NullSink))
        .expect("concentrator creation")
}

/// Tolerance windows wide enough to park every frame for the whole run.
fn parked_config() -> ConcentratorConfig {
    ConcentratorConfig {
        frames_per_second: 30,
        lag_time: 600.0,
        lead_time: 600.0,
        use_local_clock: true,
        ..ConcentratorConfig::default()
    }
}

/// `keys` signals per frame slot across `frames` consecutive slots.
fn batch(keys: usize, frames: usize) -> Vec<Measurement> {
    fastrand::seed(42);
    let base = time::now_ticks();
    let mut measurements = Vec::with_capacity(keys * frames);
    for frame in 0..frames as i64 {
        let timestamp = base + (frame * time::TICKS_PER_SECOND) / 30;
        for id in 0..keys as u32 {
            measurements.push(Measurement::new(
                MeasurementKey::new("BENCH", id),
                timestamp,
                fastrand::f64() * 120.0,
            ));
        }
    }
    measurements
}

/// Batch size scaling with all measurements landing in one frame.
fn bench_sort_batch_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort_batch_size");

    for size in [10usize, 100, 1000] {
        let concentrator = concentrator(parked_config());
        let measurements = batch(size, 1);
        group.bench_with_input(BenchmarkId::from_parameter(size), &measurements, |b, m| {
            b.iter(|| concentrator.sort_measurements(bb(m)));
        });
    }

    group.finish();
}

/// Fixed batch size spread over a growing number of destination frames.
fn bench_sort_frame_spread(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort_frame_spread");

    for frames in [1usize, 10, 30] {
        let concentrator = concentrator(parked_config());
        let measurements = batch(32, frames);
        group.bench_with_input(BenchmarkId::from_parameter(frames), &measurements, |b, m| {
            b.iter(|| concentrator.sort_measurements(bb(m)));
        });
    }

    group.finish();
}

/// Same-key collision resolution cost per downsampling method.
fn bench_downsampling_methods(c: &mut Criterion) {
    let mut group = c.benchmark_group("downsampling");

    for (name, method) in [
        ("last_received", DownsamplingMethod::LastReceived),
        ("closest", DownsamplingMethod::Closest),
        ("filtered", DownsamplingMethod::Filtered),
    ] {
        let concentrator = concentrator(ConcentratorConfig {
            downsampling: method,
            ..parked_config()
        });

        // One key, 100 jittered arrivals inside roughly one frame cell
        fastrand::seed(7);
        let base = time::now_ticks();
        let measurements: Vec<Measurement> = (0..100)
            .map(|_| {
                Measurement::new(
                    MeasurementKey::new("BENCH", 1),
                    base + fastrand::i64(0..300_000),
                    fastrand::f64() * 120.0,
                )
            })
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(name), &measurements, |b, m| {
            b.iter(|| concentrator.sort_measurements(bb(m)));
        });
    }

    group.finish();
}

/// Wire serialization of a typical 30-signal frame.
fn bench_wire_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_encoding");

    fastrand::seed(11);
    let timestamp = time::now_ticks();
    let measurements: Vec<Measurement> = (0..30u32)
        .map(|id| {
            Measurement::new(
                MeasurementKey::new("SHELBY", id),
                timestamp,
                fastrand::f64() * 120.0,
            )
        })
        .collect();

    group.bench_function("synchronized_full", |b| {
        b.iter(|| {
            wire::build_synchronized_packet(bb(timestamp), bb(&measurements), false)
                .expect("encode should succeed")
        });
    });
    group.bench_function("synchronized_compact", |b| {
        b.iter(|| {
            wire::build_synchronized_packet(bb(timestamp), bb(&measurements), true)
                .expect("encode should succeed")
        });
    });

    let packet = wire::build_synchronized_packet(timestamp, &measurements, true)
        .expect("encode should succeed");
    group.bench_function("parse_compact", |b| {
        b.iter(|| wire::parse_data_packet(bb(&packet)).expect("parse should succeed"));
    });

    group.finish();
}

criterion_group!(
    sorting_benches,
    bench_sort_batch_sizes,
    bench_sort_frame_spread,
    bench_downsampling_methods,
    bench_wire_encoding
);
criterion_main!(sorting_benches);
