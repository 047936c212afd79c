// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Measurement concentrator: the central time-alignment engine.
//!
//! Producers throw unordered, jittery measurement batches at
//! [`Concentrator::sort_measurements`]; the concentrator assigns each
//! one to the frame responsible for its instant (or discards it), and a
//! dedicated worker publishes completed frames to the injected
//! [`FrameSink`] in timestamp order at the configured cadence.
//!
//! # Architecture
//!
//! ```text
//! producers (any thread)
//!   |  sort_measurements(batch)
//!   v
//! SharedState
//! +-- clock: RealTimeClock        (measurement-tracked "now")
//! +-- queue: FrameQueue           (ordered buckets of TrackingFrame)
//! +-- stats: ConcentrationStats
//! +-- latest: LatestMeasurementCache (optional)
//! +-- signal: WakeSignal  <---- TimerRegistry tick (shared per rate)
//!   |                     <---- sort path (preemptive completion)
//!   v
//! publication worker ("hpdc-publish", elevated priority)
//!   pops due frames -> FrameSink::publish(frame, index)
//! ```
//!
//! Sorting never blocks on I/O and never fails outward: anomalies are
//! counted, optionally reported through [`ConcentratorListener`], and
//! the stream keeps flowing.

pub mod clock;
pub mod downsample;
pub mod latest;
pub mod listener;
pub mod queue;
pub mod stats;
pub mod wake;
pub(crate) mod worker;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::config::ConcentratorConfig;
use crate::core::frame::Frame;
use crate::core::measurement::Measurement;
use crate::core::time::{self, Ticks};
use crate::error::{Error, Result};
use crate::scheduler::{TimerHandle, TimerRegistry};

pub use clock::RealTimeClock;
pub use downsample::{average_filter, FilterFn};
pub use latest::LatestMeasurementCache;
pub use listener::{ConcentratorListener, LogListener};
pub use queue::{FrameQueue, TrackingFrame};
pub use stats::{ConcentrationStats, StatsSnapshot};
pub use wake::WakeSignal;

// =======================================================================
// Extension Points
// =======================================================================

/// Consumer of published frames.
///
/// Called exactly once per frame from the publication worker, in
/// non-decreasing timestamp order. `frame_index` is the frame's slot
/// within its second (0-based). Errors are reported and counted; the
/// frame is popped regardless (at-most-once, no retry).
pub trait FrameSink: Send + Sync {
    fn publish(&self, frame: &Frame, frame_index: u16) -> Result<()>;
}

/// Creates the frame for a new timestamp bucket.
pub type FrameFactory = Arc<dyn Fn(Ticks) -> Frame + Send + Sync>;

/// Places a derived measurement into a frame, returning `false` when
/// the frame no longer accepts inserts.
pub type MeasurementAssigner = Arc<dyn Fn(&Frame, Measurement) -> bool + Send + Sync>;

/// Injected sorting behavior; the defaults cover normal operation.
///
/// Custom factories pre-populate frames (e.g. with expected keys),
/// custom assigners veto or transform at insert time, and the filter
/// combines candidates in filtered downsampling mode.
pub struct SortingHooks {
    pub frame_factory: FrameFactory,
    pub assigner: MeasurementAssigner,
    pub filter: FilterFn,
}

impl Default for SortingHooks {
    fn default() -> Self {
        Self {
            frame_factory: Arc::new(Frame::new),
            assigner: Arc::new(|frame: &Frame, measurement: Measurement| {
                frame.try_insert(measurement)
            }),
            filter: Arc::new(average_filter),
        }
    }
}

// =======================================================================
// Shared State
// =======================================================================

/// State shared between the public API, producer threads, and the
/// worker threads.
pub(crate) struct SharedState {
    pub(crate) config: ConcentratorConfig,
    /// Lag window in ticks, precomputed.
    pub(crate) lag_ticks: i64,
    /// Ticks per frame at the configured rate.
    pub(crate) ticks_per_frame: f64,
    /// Half the time resolution, for frame-index rounding.
    pub(crate) time_offset: f64,
    /// Worker threads run while set.
    pub(crate) enabled: AtomicBool,
    pub(crate) clock: RealTimeClock,
    pub(crate) queue: FrameQueue,
    pub(crate) stats: ConcentrationStats,
    /// Wakes the publication worker.
    pub(crate) signal: WakeSignal,
    /// Wakes the backlog monitor (shutdown only).
    pub(crate) monitor_signal: WakeSignal,
    pub(crate) sink: Arc<dyn FrameSink>,
    pub(crate) assigner: MeasurementAssigner,
    pub(crate) filter: FilterFn,
    pub(crate) latest: Option<Arc<LatestMeasurementCache>>,
    pub(crate) listeners: Mutex<Vec<Arc<dyn ConcentratorListener>>>,
}

impl SharedState {
    pub(crate) fn notify_status(&self, message: &str) {
        for listener in self.listeners.lock().iter() {
            listener.on_status_message(message);
        }
    }

    pub(crate) fn notify_process_exception(&self, error: &Error) {
        for listener in self.listeners.lock().iter() {
            listener.on_process_exception(error);
        }
    }

    pub(crate) fn notify_discarding(&self, discarded: &[Measurement]) {
        for listener in self.listeners.lock().iter() {
            listener.on_discarding_measurements(discarded);
        }
    }

    pub(crate) fn notify_unpublished_samples(&self, seconds: usize) {
        for listener in self.listeners.lock().iter() {
            listener.on_unpublished_samples(seconds);
        }
    }
}

// =======================================================================
// Concentrator
// =======================================================================

struct RunState {
    timer_handle: Option<TimerHandle>,
    publication_thread: Option<JoinHandle<()>>,
    monitor_thread: Option<JoinHandle<()>>,
}

/// Sorts measurement streams into fixed-rate frames and publishes them.
///
/// Concurrency: any number of producer threads may call
/// [`sort_measurements`](Self::sort_measurements) at once; one internal
/// worker publishes. `start`/`stop` are idempotent and may be called
/// from any thread.
pub struct Concentrator {
    shared: Arc<SharedState>,
    registry: Arc<TimerRegistry>,
    run_state: Mutex<RunState>,
    /// Tick timestamps of the current (or last) run.
    start_time: AtomicI64,
    stop_time: AtomicI64,
}

impl Concentrator {
    /// Create a concentrator with default sorting behavior.
    pub fn new(
        config: ConcentratorConfig,
        registry: Arc<TimerRegistry>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self> {
        Self::with_hooks(config, registry, sink, SortingHooks::default())
    }

    /// Create a concentrator with injected sorting hooks.
    pub fn with_hooks(
        config: ConcentratorConfig,
        registry: Arc<TimerRegistry>,
        sink: Arc<dyn FrameSink>,
        hooks: SortingHooks,
    ) -> Result<Self> {
        config.validate()?;

        let latest = config
            .track_latest_measurements
            .then(|| Arc::new(LatestMeasurementCache::new(config.lag_time, config.lead_time)));

        let shared = Arc::new(SharedState {
            lag_ticks: config.lag_ticks(),
            ticks_per_frame: config.ticks_per_frame(),
            time_offset: if config.time_resolution > 1 {
                (config.time_resolution / 2) as f64
            } else {
                1.0
            },
            enabled: AtomicBool::new(false),
            clock: RealTimeClock::new(config.use_local_clock, config.lead_time),
            queue: FrameQueue::new(
                config.time_resolution,
                config.downsampling,
                Arc::clone(&hooks.frame_factory),
            ),
            stats: ConcentrationStats::new(),
            signal: WakeSignal::new(),
            monitor_signal: WakeSignal::new(),
            sink,
            assigner: hooks.assigner,
            filter: hooks.filter,
            latest,
            listeners: Mutex::new(Vec::new()),
            config,
        });

        Ok(Self {
            shared,
            registry,
            run_state: Mutex::new(RunState {
                timer_handle: None,
                publication_thread: None,
                monitor_thread: None,
            }),
            start_time: AtomicI64::new(0),
            stop_time: AtomicI64::new(0),
        })
    }

    /// Register an event listener.
    pub fn add_listener(&self, listener: Arc<dyn ConcentratorListener>) {
        self.shared.listeners.lock().push(listener);
    }

    /// Begin concentration: reset statistics, clear stale frames, spawn
    /// the worker threads and attach to the shared frame-rate timer.
    ///
    /// No-op when already running.
    pub fn start(&self) -> Result<()> {
        let mut run = self.run_state.lock();
        if self.shared.enabled.load(Ordering::Acquire) {
            log::debug!("[Concentrator] Start ignored, already running");
            return Ok(());
        }

        self.shared.stats.reset();
        self.shared.queue.clear();
        self.stop_time.store(0, Ordering::Relaxed);
        self.start_time.store(time::now_ticks(), Ordering::Relaxed);
        self.shared.enabled.store(true, Ordering::Release);

        let worker_shared = Arc::clone(&self.shared);
        let publication_thread = match thread::Builder::new()
            .name("hpdc-publish".into())
            .spawn(move || worker::run_publication_loop(&worker_shared))
        {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.enabled.store(false, Ordering::Release);
                return Err(Error::SchedulerFailed(format!(
                    "failed to spawn publication thread: {e}"
                )));
            }
        };

        let monitor_shared = Arc::clone(&self.shared);
        let monitor_thread = match thread::Builder::new()
            .name("hpdc-monitor".into())
            .spawn(move || worker::run_monitor_loop(&monitor_shared))
        {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.enabled.store(false, Ordering::Release);
                self.shared.signal.notify();
                let _ = publication_thread.join();
                return Err(Error::SchedulerFailed(format!(
                    "failed to spawn monitor thread: {e}"
                )));
            }
        };

        let tick_shared = Arc::clone(&self.shared);
        let timer_handle = match self.registry.acquire(
            self.shared.config.frames_per_second,
            Arc::new(move || tick_shared.signal.notify()),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.enabled.store(false, Ordering::Release);
                self.shared.signal.notify();
                self.shared.monitor_signal.notify();
                let _ = publication_thread.join();
                let _ = monitor_thread.join();
                return Err(e);
            }
        };

        run.timer_handle = Some(timer_handle);
        run.publication_thread = Some(publication_thread);
        run.monitor_thread = Some(monitor_thread);

        log::info!(
            "[Concentrator] Started at {} fps (lag {:.3}s, lead {:.3}s)",
            self.shared.config.frames_per_second,
            self.shared.config.lag_time,
            self.shared.config.lead_time
        );
        self.shared.notify_status("Concentration started");
        Ok(())
    }

    /// Stop concentration: detach from the shared timer, stop the
    /// worker threads, then clear the queue. Idempotent.
    pub fn stop(&self) {
        let mut run = self.run_state.lock();
        if !self.shared.enabled.load(Ordering::Acquire) && run.publication_thread.is_none() {
            return;
        }

        // Release the shared timer first so no new ticks arrive, then
        // stop the workers, then drop buffered frames.
        run.timer_handle.take();
        self.shared.enabled.store(false, Ordering::Release);
        self.shared.signal.notify();
        self.shared.monitor_signal.notify();
        if let Some(handle) = run.publication_thread.take() {
            if handle.join().is_err() {
                log::error!("[Concentrator] Publication thread panicked");
            }
        }
        if let Some(handle) = run.monitor_thread.take() {
            if handle.join().is_err() {
                log::error!("[Concentrator] Monitor thread panicked");
            }
        }
        self.shared.queue.clear();
        self.stop_time.store(time::now_ticks(), Ordering::Relaxed);

        log::info!("[Concentrator] Stopped");
        self.shared.notify_status("Concentration stopped");
    }

    /// Whether the publication worker is active.
    pub fn is_running(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    /// Sort a batch of measurements into their destination frames.
    ///
    /// Callable concurrently from any number of producer threads. Never
    /// fails: anomalous measurements are counted and dropped, and a
    /// discard notification carries the batch's rejects.
    pub fn sort_measurements(&self, measurements: &[Measurement]) {
        if measurements.is_empty() {
            return;
        }

        let shared = &self.shared;
        let config = &shared.config;
        shared.stats.add_received(measurements.len() as u64);

        let mut discarded: Vec<Measurement> = Vec::new();
        let mut processed = 0u64;
        let mut sorted_by_arrival = 0u64;
        let mut missed_by_timeout = 0u64;
        // One-entry bucket cache: bursts from a device share a timestamp.
        let mut cached: Option<(Ticks, Arc<TrackingFrame>)> = None;

        for original in measurements {
            let mut measurement = original.clone();

            // Assignment timestamp. A bad source timestamp is either
            // trusted anyway, replaced with real time, or fatal to the
            // measurement.
            if !measurement.timestamp_quality_good && !config.ignore_bad_timestamps {
                if config.allow_sorts_by_arrival {
                    measurement = measurement.with_timestamp(shared.clock.real_time());
                    sorted_by_arrival += 1;
                } else {
                    discarded.push(original.clone());
                    continue;
                }
            }
            let timestamp = measurement.timestamp;

            // Tolerance windows around real time. No frame exists for
            // expired time and none will be created for it.
            let distance = shared.clock.seconds_from_real_time(timestamp);
            if distance > config.lag_time || distance < -config.lead_time {
                discarded.push(original.clone());
                cached = None;
                continue;
            }

            let tracking = match &cached {
                Some((ts, frame)) if *ts == timestamp => Arc::clone(frame),
                _ => {
                    let frame = shared.queue.get_frame(timestamp);
                    cached = Some((timestamp, Arc::clone(&frame)));
                    frame
                }
            };

            // Downsampling: the measurement may lose its collision.
            let Some(derived) = tracking.derive(measurement) else {
                discarded.push(original.clone());
                continue;
            };

            if (shared.assigner)(tracking.frame(), derived.clone()) {
                processed += 1;
                tracking.set_last_sorted(derived.clone());
                if let Some(latest) = &shared.latest {
                    latest.update(&derived);
                }
                // A sorted measurement is a real-time candidate.
                shared.clock.update(timestamp);
            } else {
                // Frame sealed between lookup and assignment.
                missed_by_timeout += 1;
                discarded.push(original.clone());
            }
        }

        shared.stats.add_processed(processed);
        shared.stats.add_sorted_by_arrival(sorted_by_arrival);
        shared.stats.add_missed_by_timeout(missed_by_timeout);
        if !discarded.is_empty() {
            shared.stats.add_discarded(discarded.len() as u64);
            shared.notify_discarding(&discarded);
        }

        // New sorts can complete a preemptive frame; let the worker look.
        if processed > 0 {
            shared.signal.notify();
        }
    }

    /// Current real-time estimate in ticks.
    pub fn real_time(&self) -> Ticks {
        self.shared.clock.real_time()
    }

    /// Point-in-time statistics.
    pub fn statistics(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Zero all statistics counters.
    pub fn reset_statistics(&self) {
        self.shared.stats.reset();
    }

    /// Latest-value table, when tracking is enabled.
    pub fn latest_measurements(&self) -> Option<Arc<LatestMeasurementCache>> {
        self.shared.latest.clone()
    }

    /// Active configuration.
    pub fn config(&self) -> &ConcentratorConfig {
        &self.shared.config
    }

    /// Frames currently buffered awaiting publication.
    pub fn queued_frames(&self) -> usize {
        self.shared.queue.len()
    }

    /// Seconds this concentrator has been (or was) running.
    pub fn run_time(&self) -> f64 {
        let start = self.start_time.load(Ordering::Relaxed);
        if start == 0 {
            return 0.0;
        }
        let stop = self.stop_time.load(Ordering::Relaxed);
        let end = if stop == 0 { time::now_ticks() } else { stop };
        time::to_seconds(end - start)
    }

    /// Multi-line operator status report.
    pub fn status(&self) -> String {
        use std::fmt::Write;

        let snap = self.statistics();
        let config = &self.shared.config;
        let mut report = String::with_capacity(768);

        let mut line = |label: &str, value: String| {
            let _ = writeln!(report, "{label:>26}: {value}");
        };

        line(
            "State",
            if self.is_running() { "running" } else { "stopped" }.into(),
        );
        line(
            "Frame rate",
            format!(
                "{} frames/sec ({:.2} ticks/frame)",
                config.frames_per_second, self.shared.ticks_per_frame
            ),
        );
        line(
            "Lag time / lead time",
            format!("{:.3}s / {:.3}s", config.lag_time, config.lead_time),
        );
        line("Downsampling", config.downsampling.to_string());
        line("Queued frames", self.queued_frames().to_string());
        line("Run time", format!("{:.1}s", self.run_time()));
        line("Received measurements", snap.received.to_string());
        line("Sorted measurements", snap.processed.to_string());
        line("Discarded measurements", snap.discarded.to_string());
        line("Sorted by arrival", snap.sorted_by_arrival.to_string());
        line("Missed by timeout", snap.missed_by_timeout.to_string());
        line("Downsampled", snap.downsampled.to_string());
        line("Published frames", snap.published_frames.to_string());
        line(
            "Published measurements",
            snap.published_measurements.to_string(),
        );
        line(
            "Frames ahead of schedule",
            snap.frames_ahead_of_schedule.to_string(),
        );
        line(
            "Average publish time",
            format!("{:.6}s/frame", snap.average_publish_time()),
        );
        let _ = write!(
            report,
            "{:>26}: {:.2}%",
            "Sorting efficiency",
            snap.sorting_efficiency() * 100.0
        );
        report
    }
}

impl Drop for Concentrator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Concentrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Concentrator")
            .field("frames_per_second", &self.shared.config.frames_per_second)
            .field("running", &self.is_running())
            .field("queued_frames", &self.queued_frames())
            .finish()
    }
}

// =======================================================================
// Tests
// =======================================================================

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// Sink that records each published frame's timestamp, contents and
    /// frame index.
    pub(crate) struct CollectingSink {
        pub(crate) published: Mutex<Vec<(Ticks, Vec<Measurement>, u16)>>,
    }

    impl FrameSink for CollectingSink {
        fn publish(&self, frame: &Frame, frame_index: u16) -> Result<()> {
            self.published
                .lock()
                .push((frame.timestamp(), frame.measurements(), frame_index));
            Ok(())
        }
    }

    /// Sink that rejects every frame.
    pub(crate) struct FailingSink;

    impl FrameSink for FailingSink {
        fn publish(&self, _frame: &Frame, _frame_index: u16) -> Result<()> {
            Err(Error::PublishFailed("sink rejected frame".into()))
        }
    }

    pub(crate) fn build(config: ConcentratorConfig) -> (Concentrator, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink {
            published: Mutex::new(Vec::new()),
        });
        let registry = Arc::new(TimerRegistry::new());
        let concentrator = Concentrator::new(config, registry, sink.clone())
            .expect("Failed to build concentrator");
        (concentrator, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::build as concentrator;
    use super::*;
    use crate::core::measurement::MeasurementKey;
    use crate::core::time::TICKS_PER_SECOND;

    fn key(id: u32) -> MeasurementKey {
        MeasurementKey::new("PMU", id)
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let sink = Arc::new(tests_support::FailingSink);
        let registry = Arc::new(TimerRegistry::new());
        let config = ConcentratorConfig {
            frames_per_second: 0,
            ..ConcentratorConfig::default()
        };
        assert!(Concentrator::new(config, registry, sink).is_err());
    }

    #[test]
    fn test_in_tolerance_measurement_is_sorted() {
        let (concentrator, _sink) = concentrator(ConcentratorConfig::default());
        let now = concentrator.real_time();

        concentrator.sort_measurements(&[Measurement::new(key(1), now, 1.0)]);

        let snap = concentrator.statistics();
        assert_eq!(snap.received, 1);
        assert_eq!(snap.processed, 1);
        assert_eq!(snap.discarded, 0);
        assert_eq!(concentrator.queued_frames(), 1);
    }

    #[test]
    fn test_expired_measurement_is_discarded() {
        let (concentrator, _sink) = concentrator(ConcentratorConfig::default());
        let now = concentrator.real_time();

        // 10 s old with a 3 s lag window.
        concentrator.sort_measurements(&[Measurement::new(
            key(1),
            now - 10 * TICKS_PER_SECOND,
            1.0,
        )]);

        let snap = concentrator.statistics();
        assert_eq!(snap.discarded, 1);
        assert_eq!(snap.processed, 0);
        assert_eq!(concentrator.queued_frames(), 0, "no frame for expired time");
    }

    #[test]
    fn test_future_measurement_is_discarded() {
        let (concentrator, _sink) = concentrator(ConcentratorConfig::default());
        let now = concentrator.real_time();

        concentrator.sort_measurements(&[Measurement::new(
            key(1),
            now + 10 * TICKS_PER_SECOND,
            1.0,
        )]);

        let snap = concentrator.statistics();
        assert_eq!(snap.discarded, 1);
        assert_eq!(snap.processed, 0);
    }

    #[test]
    fn test_bad_timestamp_sorted_by_arrival() {
        let (concentrator, _sink) = concentrator(ConcentratorConfig::default());

        let mut measurement = Measurement::new(key(1), 12_345, 1.0);
        measurement.timestamp_quality_good = false;
        concentrator.sort_measurements(&[measurement]);

        let snap = concentrator.statistics();
        assert_eq!(snap.sorted_by_arrival, 1);
        assert_eq!(snap.processed, 1);
        assert_eq!(snap.discarded, 0);

        // Re-stamped near real time, not at the bogus source timestamp.
        let head = concentrator.shared.queue.head().expect("frame expected");
        let distance = time::to_seconds(concentrator.real_time() - head.timestamp());
        assert!(distance.abs() < 1.0);
    }

    #[test]
    fn test_bad_timestamp_discarded_without_arrival_sorts() {
        let config = ConcentratorConfig {
            allow_sorts_by_arrival: false,
            ..ConcentratorConfig::default()
        };
        let (concentrator, _sink) = concentrator(config);

        let mut measurement = Measurement::new(key(1), concentrator.real_time(), 1.0);
        measurement.timestamp_quality_good = false;
        concentrator.sort_measurements(&[measurement]);

        let snap = concentrator.statistics();
        assert_eq!(snap.discarded, 1);
        assert_eq!(snap.sorted_by_arrival, 0);
        assert_eq!(snap.processed, 0);
    }

    #[test]
    fn test_ignore_bad_timestamps_sorts_as_is() {
        let config = ConcentratorConfig {
            ignore_bad_timestamps: true,
            ..ConcentratorConfig::default()
        };
        let (concentrator, _sink) = concentrator(config);
        let now = concentrator.real_time();

        let mut measurement = Measurement::new(key(1), now, 1.0);
        measurement.timestamp_quality_good = false;
        concentrator.sort_measurements(&[measurement]);

        let snap = concentrator.statistics();
        assert_eq!(snap.processed, 1);
        assert_eq!(snap.sorted_by_arrival, 0);
    }

    #[test]
    fn test_missed_sort_counted_distinctly() {
        let (concentrator, _sink) = concentrator(ConcentratorConfig::default());
        let now = concentrator.real_time();

        concentrator.sort_measurements(&[Measurement::new(key(1), now, 1.0)]);

        // Seal the frame behind the sorter's back.
        let head = concentrator.shared.queue.head().expect("frame expected");
        assert!(head.frame().mark_published());

        concentrator.sort_measurements(&[Measurement::new(key(2), now, 2.0)]);

        let snap = concentrator.statistics();
        assert_eq!(snap.missed_by_timeout, 1);
        assert_eq!(snap.discarded, 1);
        assert_eq!(snap.processed, 1);
    }

    #[test]
    fn test_downsampling_counted_on_collision() {
        let (concentrator, _sink) = concentrator(ConcentratorConfig::default());
        let now = concentrator.real_time();

        concentrator.sort_measurements(&[
            Measurement::new(key(1), now, 1.0),
            Measurement::new(key(1), now, 2.0),
        ]);

        let head = concentrator.shared.queue.head().expect("frame expected");
        assert_eq!(head.downsampled_count(), 1);
        let held = head.frame().get(&key(1)).expect("measurement expected");
        assert_eq!(held.value, 2.0, "last received wins");
    }

    #[test]
    fn test_latest_value_tracking() {
        let config = ConcentratorConfig {
            track_latest_measurements: true,
            ..ConcentratorConfig::default()
        };
        let (concentrator, _sink) = concentrator(config);
        let now = concentrator.real_time();

        concentrator.sort_measurements(&[Measurement::new(key(7), now, 42.5)]);

        let cache = concentrator
            .latest_measurements()
            .expect("tracking enabled");
        assert_eq!(cache.value(&key(7), now), Some(42.5));
    }

    #[test]
    fn test_discard_listener_receives_batch() {
        use std::sync::atomic::AtomicUsize;

        #[derive(Default)]
        struct DiscardCounter(AtomicUsize);
        impl ConcentratorListener for DiscardCounter {
            fn on_discarding_measurements(&self, discarded: &[Measurement]) {
                self.0.fetch_add(discarded.len(), Ordering::Relaxed);
            }
        }

        let (concentrator, _sink) = concentrator(ConcentratorConfig::default());
        let counter = Arc::new(DiscardCounter::default());
        concentrator.add_listener(counter.clone());

        let now = concentrator.real_time();
        concentrator.sort_measurements(&[
            Measurement::new(key(1), now - 60 * TICKS_PER_SECOND, 1.0),
            Measurement::new(key(2), now, 2.0),
            Measurement::new(key(3), now + 60 * TICKS_PER_SECOND, 3.0),
        ]);

        assert_eq!(counter.0.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let (concentrator, _sink) = concentrator(ConcentratorConfig::default());

        concentrator.start().expect("Failed to start");
        assert!(concentrator.is_running());
        concentrator.start().expect("second start should be a no-op");

        concentrator.stop();
        assert!(!concentrator.is_running());
        let stopped_at = concentrator.statistics();
        concentrator.stop();
        assert_eq!(concentrator.statistics(), stopped_at);
    }

    #[test]
    fn test_restart_resets_statistics_and_queue() {
        let (concentrator, _sink) = concentrator(ConcentratorConfig::default());
        let now = concentrator.real_time();

        concentrator.sort_measurements(&[Measurement::new(key(1), now, 1.0)]);
        assert_eq!(concentrator.statistics().received, 1);

        concentrator.start().expect("Failed to start");
        assert_eq!(concentrator.statistics().received, 0, "start resets stats");
        concentrator.stop();
    }

    #[test]
    fn test_stop_releases_shared_timer() {
        let sink = Arc::new(tests_support::CollectingSink {
            published: Mutex::new(Vec::new()),
        });
        let registry = Arc::new(TimerRegistry::new());
        let concentrator = Concentrator::new(
            ConcentratorConfig::default(),
            Arc::clone(&registry),
            sink,
        )
        .expect("Failed to build concentrator");

        concentrator.start().expect("Failed to start");
        assert_eq!(registry.active_timer_count(), 1);

        concentrator.stop();
        assert_eq!(registry.active_timer_count(), 0);
    }

    #[test]
    fn test_status_report_mentions_state() {
        let (concentrator, _sink) = concentrator(ConcentratorConfig::default());
        let status = concentrator.status();
        assert!(status.contains("stopped"));
        assert!(status.contains("30 frames/sec"));
    }
}
