// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-client subscriptions: filtering, serialization and delivery.
//!
//! One subscription binds one connected client to a measurement feed.
//! The two delivery modes share the key filter and send path and differ
//! only in how measurements become packets:
//!
//! - **Synchronized**: owns a full concentrator; published frames are
//!   serialized as synchronized data packets at the configured rate.
//! - **Unsynchronized**: no frame alignment; filtered batches go out as
//!   they arrive, or, when latest-value tracking is on, a snapshot of
//!   the newest value per key is flushed at most once per lag interval
//!   with stale entries read as NaN.
//!
//! Key-set reads and writes share one mutex so a resubscription that
//! swaps the filter can never interleave with a half-filtered batch.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::concentrator::{Concentrator, FrameSink, LatestMeasurementCache};
use crate::config::ConcentratorConfig;
use crate::core::frame::Frame;
use crate::core::measurement::{Measurement, MeasurementKey};
use crate::core::time;
use crate::error::{Error, Result};
use crate::publisher::wire::{self, SubscribeRequest};
use crate::scheduler::TimerRegistry;
use crate::transport::PacketSender;

// =======================================================================
// Send path abstraction
// =======================================================================

/// Delivers a framed payload to one client.
///
/// The server's [`PacketSender`] is the production route; tests collect
/// packets in memory instead.
pub trait PacketRoute: Send + Sync {
    fn send_packet(&self, client_id: u64, payload: Vec<u8>) -> std::io::Result<()>;
}

impl PacketRoute for PacketSender {
    fn send_packet(&self, client_id: u64, payload: Vec<u8>) -> std::io::Result<()> {
        self.send(client_id, payload)
    }
}

// =======================================================================
// Subscription
// =======================================================================

/// Delivery mode internals.
enum Mode {
    /// Frame-aligned feed through a dedicated concentrator.
    Synchronized { concentrator: Concentrator },
    /// Raw batches, optionally reduced to a throttled latest-value feed.
    Unsynchronized {
        /// Minimum ticks between latest-value flushes.
        flush_interval: i64,
        /// Cap on measurements per flushed packet.
        flush_limit: usize,
        /// Present when latest-value tracking was requested.
        latest: Option<LatestMeasurementCache>,
        /// Tick time of the last flush.
        last_flush: AtomicI64,
    },
}

/// One client's view of the measurement feed.
pub struct ClientSubscription {
    client_id: u64,
    route: Arc<dyn PacketRoute>,
    /// Input filter; the lock fences resubscription against delivery.
    keys: Mutex<HashSet<MeasurementKey>>,
    /// Compact encoding flag, shared with the frame sink.
    compact: Arc<AtomicBool>,
    disposed: AtomicBool,
    mode: Mode,
}

impl ClientSubscription {
    /// Build and start a synchronized subscription.
    ///
    /// The subscriber may override `framesPerSecond`, `lagTime` and
    /// `leadTime` through the connection string; everything else comes
    /// from the publisher's base concentration settings.
    pub fn synchronized(
        client_id: u64,
        request: &SubscribeRequest,
        base: &ConcentratorConfig,
        registry: Arc<TimerRegistry>,
        route: Arc<dyn PacketRoute>,
    ) -> Result<Self> {
        let compact = Arc::new(AtomicBool::new(request.compact));
        let config = sync_config(base, request)?;

        let sink = Arc::new(FrameSerializer {
            client_id,
            compact: Arc::clone(&compact),
            route: Arc::clone(&route),
        });
        let concentrator = Concentrator::new(config, registry, sink)?;
        concentrator.start()?;

        Ok(Self {
            client_id,
            route,
            keys: Mutex::new(parse_input_keys(request)),
            compact,
            disposed: AtomicBool::new(false),
            mode: Mode::Synchronized { concentrator },
        })
    }

    /// Build an unsynchronized subscription.
    pub fn unsynchronized(
        client_id: u64,
        request: &SubscribeRequest,
        base: &ConcentratorConfig,
        flush_limit: usize,
        route: Arc<dyn PacketRoute>,
    ) -> Result<Self> {
        let mut lag_time = base.lag_time;
        let mut lead_time = base.lead_time;
        if let Some(value) = request.setting("lagTime") {
            lag_time = parse_f64("lagTime", value)?;
        }
        if let Some(value) = request.setting("leadTime") {
            lead_time = parse_f64("leadTime", value)?;
        }

        let latest = if track_latest_requested(request) {
            // Staleness judgment needs sane windows even without a concentrator
            if lag_time <= 0.0 || lag_time.is_nan() {
                return Err(Error::InvalidLagTime(lag_time));
            }
            if lead_time <= 0.0 || lead_time.is_nan() {
                return Err(Error::InvalidLeadTime(lead_time));
            }
            Some(LatestMeasurementCache::new(lag_time, lead_time))
        } else {
            None
        };

        Ok(Self {
            client_id,
            route,
            keys: Mutex::new(parse_input_keys(request)),
            compact: Arc::new(AtomicBool::new(request.compact)),
            disposed: AtomicBool::new(false),
            mode: Mode::Unsynchronized {
                flush_interval: time::from_seconds(lag_time),
                flush_limit,
                latest,
                last_flush: AtomicI64::new(0),
            },
        })
    }

    /// Client this subscription delivers to.
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Whether this is the frame-aligned mode.
    pub fn is_synchronized(&self) -> bool {
        matches!(self.mode, Mode::Synchronized { .. })
    }

    /// Number of keys currently subscribed.
    pub fn key_count(&self) -> usize {
        self.keys.lock().len()
    }

    /// Concentration statistics, for synchronized subscriptions.
    pub fn statistics(&self) -> Option<crate::concentrator::StatsSnapshot> {
        match &self.mode {
            Mode::Synchronized { concentrator } => Some(concentrator.statistics()),
            Mode::Unsynchronized { .. } => None,
        }
    }

    /// Whether a same-mode resubscribe can be applied in place.
    ///
    /// Key-set and encoding changes always can; timing changes rebuild
    /// the subscription because they reshape the concentration pipeline.
    pub fn needs_rebuild(&self, request: &SubscribeRequest, base: &ConcentratorConfig) -> bool {
        match &self.mode {
            Mode::Synchronized { concentrator } => match sync_config(base, request) {
                Ok(desired) => {
                    let current = concentrator.config();
                    desired.frames_per_second != current.frames_per_second
                        || desired.lag_time != current.lag_time
                        || desired.lead_time != current.lead_time
                }
                // Bad settings surface as an error during the rebuild
                Err(_) => true,
            },
            Mode::Unsynchronized { latest, .. } => {
                track_latest_requested(request) != latest.is_some()
            }
        }
    }

    /// Apply a same-mode resubscribe: swap the key filter and encoding.
    pub fn reinitialize(&self, request: &SubscribeRequest) {
        *self.keys.lock() = parse_input_keys(request);
        self.compact.store(request.compact, Ordering::Relaxed);
        log::debug!(
            "[ClientSubscription] Client {} resubscribed with {} signals",
            self.client_id,
            self.key_count()
        );
    }

    /// Route a measurement batch through this subscription.
    ///
    /// An empty key set subscribes to the whole feed. Called from
    /// arbitrary producer threads.
    pub fn process(&self, measurements: &[Measurement]) {
        if self.disposed.load(Ordering::Relaxed) {
            return;
        }

        let filtered: Vec<Measurement> = {
            let keys = self.keys.lock();
            if keys.is_empty() {
                measurements.to_vec()
            } else {
                measurements
                    .iter()
                    .filter(|m| keys.contains(&m.key))
                    .cloned()
                    .collect()
            }
        };
        if filtered.is_empty() {
            return;
        }

        match &self.mode {
            Mode::Synchronized { concentrator } => concentrator.sort_measurements(&filtered),
            Mode::Unsynchronized {
                flush_interval,
                flush_limit,
                latest: Some(latest),
                last_flush,
            } => {
                for measurement in &filtered {
                    latest.update(measurement);
                }
                self.maybe_flush(latest, *flush_interval, *flush_limit, last_flush);
            }
            Mode::Unsynchronized { .. } => self.publish_batch(&filtered),
        }
    }

    /// Detach this subscription.
    ///
    /// Stops the inner concentrator when present. The network socket is
    /// left alone so the client can resubscribe over the same
    /// connection. Safe to call more than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Mode::Synchronized { concentrator } = &self.mode {
            concentrator.stop();
        }
        log::debug!(
            "[ClientSubscription] Client {} subscription disposed",
            self.client_id
        );
    }

    /// Serialize and send one unsynchronized batch.
    fn publish_batch(&self, batch: &[Measurement]) {
        let compact = self.compact.load(Ordering::Relaxed);
        match wire::build_unsynchronized_packet(batch, compact) {
            Ok(data) => self.send_data_packet(&data),
            Err(e) => log::warn!(
                "[ClientSubscription] Failed to serialize batch for client {}: {}",
                self.client_id,
                e
            ),
        }
    }

    /// Flush the latest-value snapshot if the lag interval has elapsed.
    fn maybe_flush(
        &self,
        latest: &LatestMeasurementCache,
        flush_interval: i64,
        flush_limit: usize,
        last_flush: &AtomicI64,
    ) {
        let now = time::now_ticks();
        let last = last_flush.load(Ordering::Relaxed);
        if now - last < flush_interval {
            return;
        }
        // One producer wins the flush window; losers return
        if last_flush
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let mut snapshot = latest.snapshot(now);
        if snapshot.is_empty() {
            return;
        }
        snapshot.truncate(flush_limit);

        let compact = self.compact.load(Ordering::Relaxed);
        match wire::build_unsynchronized_packet(&snapshot, compact) {
            Ok(data) => self.send_data_packet(&data),
            Err(e) => log::warn!(
                "[ClientSubscription] Failed to serialize snapshot for client {}: {}",
                self.client_id,
                e
            ),
        }
    }

    fn send_data_packet(&self, data: &[u8]) {
        let packet = wire::build_response(wire::RESP_DATA_PACKET, wire::CMD_SUBSCRIBE, data);
        if let Err(e) = self.route.send_packet(self.client_id, packet) {
            // Client teardown races are routine; the publisher disposes
            // the subscription when the disconnect event lands.
            log::debug!(
                "[ClientSubscription] Send to client {} failed: {}",
                self.client_id,
                e
            );
        }
    }
}

impl Drop for ClientSubscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for ClientSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSubscription")
            .field("client_id", &self.client_id)
            .field("synchronized", &self.is_synchronized())
            .field("keys", &self.key_count())
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

// =======================================================================
// Frame sink for synchronized mode
// =======================================================================

/// Serializes published frames into synchronized data packets.
struct FrameSerializer {
    client_id: u64,
    compact: Arc<AtomicBool>,
    route: Arc<dyn PacketRoute>,
}

impl FrameSink for FrameSerializer {
    fn publish(&self, frame: &Frame, _frame_index: u16) -> Result<()> {
        let measurements = frame.measurements();
        let compact = self.compact.load(Ordering::Relaxed);

        let data = wire::build_synchronized_packet(frame.timestamp(), &measurements, compact)?;
        let packet = wire::build_response(wire::RESP_DATA_PACKET, wire::CMD_SUBSCRIBE, &data);

        self.route
            .send_packet(self.client_id, packet)
            .map_err(|e| Error::SendFailed(format!("client {}: {}", self.client_id, e)))
    }
}

// =======================================================================
// Connection string settings
// =======================================================================

/// Parse the `inputMeasurementKeys` filter list.
///
/// Malformed entries are skipped with a warning rather than failing the
/// whole subscription.
fn parse_input_keys(request: &SubscribeRequest) -> HashSet<MeasurementKey> {
    let mut keys = HashSet::new();

    if let Some(list) = request.setting("inputMeasurementKeys") {
        for item in list.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            match MeasurementKey::parse(item) {
                Some(key) => {
                    keys.insert(key);
                }
                None => log::warn!(
                    "[ClientSubscription] Ignoring malformed measurement key: {item}"
                ),
            }
        }
    }

    keys
}

/// Base concentration settings with per-connection overrides applied.
fn sync_config(base: &ConcentratorConfig, request: &SubscribeRequest) -> Result<ConcentratorConfig> {
    let mut config = base.clone();
    // The subscription's cache would shadow the frame feed; not wanted here
    config.track_latest_measurements = false;

    if let Some(value) = request.setting("framesPerSecond") {
        config.frames_per_second = value
            .parse()
            .map_err(|_| Error::Protocol(format!("invalid framesPerSecond: {value}")))?;
    }
    if let Some(value) = request.setting("lagTime") {
        config.lag_time = parse_f64("lagTime", value)?;
    }
    if let Some(value) = request.setting("leadTime") {
        config.lead_time = parse_f64("leadTime", value)?;
    }

    Ok(config)
}

fn parse_f64(name: &str, value: &str) -> Result<f64> {
    value
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid {name}: {value}")))
}

fn track_latest_requested(request: &SubscribeRequest) -> bool {
    request
        .setting("trackLatestMeasurements")
        .map(parse_bool)
        .unwrap_or(false)
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

// =======================================================================
// Tests
// =======================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::wire::{parse_data_packet, parse_response, RESP_DATA_PACKET};

    /// In-memory route capturing sent packets.
    struct CollectingRoute {
        packets: Mutex<Vec<(u64, Vec<u8>)>>,
    }

    impl CollectingRoute {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                packets: Mutex::new(Vec::new()),
            })
        }

        fn take(&self) -> Vec<(u64, Vec<u8>)> {
            std::mem::take(&mut self.packets.lock())
        }
    }

    impl PacketRoute for CollectingRoute {
        fn send_packet(&self, client_id: u64, payload: Vec<u8>) -> std::io::Result<()> {
            self.packets.lock().push((client_id, payload));
            Ok(())
        }
    }

    fn request(connection_string: &str, synchronized: bool, compact: bool) -> SubscribeRequest {
        SubscribeRequest {
            synchronized,
            compact,
            connection_string: connection_string.to_string(),
            settings: wire::parse_key_value_pairs(connection_string),
        }
    }

    fn measurement(source: &str, id: u32, value: f64) -> Measurement {
        Measurement::new(
            MeasurementKey::new(source, id),
            time::now_ticks(),
            value,
        )
    }

    #[test]
    fn test_parse_input_keys_skips_malformed() {
        let req = request(
            "inputMeasurementKeys=SHELBY:1, SHELBY:2 ,bogus,CUMB:xyz,CUMB:3",
            false,
            false,
        );
        let keys = parse_input_keys(&req);

        assert_eq!(keys.len(), 3);
        assert!(keys.contains(&MeasurementKey::new("SHELBY", 2)));
        assert!(keys.contains(&MeasurementKey::new("CUMB", 3)));
    }

    #[test]
    fn test_sync_config_overrides() {
        let base = ConcentratorConfig::default();
        let req = request(
            "framesPerSecond=60;lagTime=0.5;leadTime=2.0",
            true,
            false,
        );

        let config = sync_config(&base, &req).expect("Failed to build config");
        assert_eq!(config.frames_per_second, 60);
        assert_eq!(config.lag_time, 0.5);
        assert_eq!(config.lead_time, 2.0);
        assert!(!config.track_latest_measurements);
    }

    #[test]
    fn test_sync_config_rejects_garbage() {
        let base = ConcentratorConfig::default();
        let req = request("framesPerSecond=fast", true, false);
        assert!(matches!(
            sync_config(&base, &req),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_unsynchronized_filters_and_publishes_batches() {
        let route = CollectingRoute::new();
        let req = request("inputMeasurementKeys=PMU:1,PMU:2", false, false);
        let sub = ClientSubscription::unsynchronized(
            42,
            &req,
            &ConcentratorConfig::default(),
            1_000,
            route.clone(),
        )
        .expect("Failed to create subscription");

        sub.process(&[
            measurement("PMU", 1, 1.0),
            measurement("PMU", 9, 9.0), // not subscribed
            measurement("PMU", 2, 2.0),
        ]);

        let sent = route.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 42);

        let (code, command, data) = parse_response(&sent[0].1).expect("Failed to parse");
        assert_eq!(code, RESP_DATA_PACKET);
        assert_eq!(command, wire::CMD_SUBSCRIBE);

        let packet = parse_data_packet(data).expect("Failed to parse data");
        assert!(!packet.synchronized);
        assert_eq!(packet.measurements.len(), 2);
    }

    #[test]
    fn test_unsynchronized_without_keys_receives_the_whole_feed() {
        let route = CollectingRoute::new();
        let req = request("password=x", false, false);
        let sub = ClientSubscription::unsynchronized(
            1,
            &req,
            &ConcentratorConfig::default(),
            1_000,
            route.clone(),
        )
        .expect("Failed to create subscription");

        // No inputMeasurementKeys filter: everything passes through
        sub.process(&[measurement("PMU", 1, 1.0), measurement("OTHER", 9, 9.0)]);

        let sent = route.take();
        assert_eq!(sent.len(), 1);
        let (_, _, data) = parse_response(&sent[0].1).expect("Failed to parse");
        let packet = parse_data_packet(data).expect("Failed to parse data");
        assert_eq!(packet.measurements.len(), 2);
    }

    #[test]
    fn test_latest_value_flush_snapshots_newest() {
        let route = CollectingRoute::new();
        let req = request(
            "inputMeasurementKeys=PMU:1;trackLatestMeasurements=true",
            false,
            false,
        );
        let sub = ClientSubscription::unsynchronized(
            7,
            &req,
            &ConcentratorConfig::default(),
            1_000,
            route.clone(),
        )
        .expect("Failed to create subscription");

        // Two updates for the same key; the flush carries only the newest
        let older = measurement("PMU", 1, 1.0);
        let newer = older.with_timestamp(older.timestamp + 1).with_value(5.0);
        sub.process(&[older, newer]);

        let sent = route.take();
        assert_eq!(sent.len(), 1);
        let (_, _, data) = parse_response(&sent[0].1).expect("Failed to parse");
        let packet = parse_data_packet(data).expect("Failed to parse data");
        assert_eq!(packet.measurements.len(), 1);
        assert_eq!(packet.measurements[0].value, 5.0);

        // Immediately afterwards the interval has not elapsed; no flush
        sub.process(&[measurement("PMU", 1, 6.0)]);
        assert!(route.take().is_empty());
    }

    #[test]
    fn test_tracking_requires_positive_windows() {
        let route = CollectingRoute::new();
        let req = request("trackLatestMeasurements=true;lagTime=-1", false, false);
        assert!(matches!(
            ClientSubscription::unsynchronized(
                1,
                &req,
                &ConcentratorConfig::default(),
                1_000,
                route,
            ),
            Err(Error::InvalidLagTime(_))
        ));
    }

    #[test]
    fn test_reinitialize_swaps_filter() {
        let route = CollectingRoute::new();
        let req = request("inputMeasurementKeys=PMU:1", false, false);
        let sub = ClientSubscription::unsynchronized(
            3,
            &req,
            &ConcentratorConfig::default(),
            1_000,
            route.clone(),
        )
        .expect("Failed to create subscription");

        sub.reinitialize(&request("inputMeasurementKeys=PMU:2,PMU:3", false, true));
        assert_eq!(sub.key_count(), 2);

        sub.process(&[measurement("PMU", 1, 1.0), measurement("PMU", 2, 2.0)]);
        let sent = route.take();
        assert_eq!(sent.len(), 1);

        let (_, _, data) = parse_response(&sent[0].1).expect("Failed to parse");
        let packet = parse_data_packet(data).expect("Failed to parse data");
        // Old key filtered out, and the resubscribe switched to compact
        assert!(packet.compact);
        assert_eq!(packet.measurements.len(), 1);
        assert_eq!(packet.measurements[0].key.id, 2);
    }

    #[test]
    fn test_needs_rebuild_on_timing_change() {
        let route = CollectingRoute::new();
        let base = ConcentratorConfig::default();
        let registry = Arc::new(TimerRegistry::new());

        let req = request("password=x;framesPerSecond=30", true, false);
        let sub = ClientSubscription::synchronized(1, &req, &base, registry, route)
            .expect("Failed to create subscription");

        assert!(!sub.needs_rebuild(&request("password=x;framesPerSecond=30", true, false), &base));
        assert!(sub.needs_rebuild(&request("password=x;framesPerSecond=60", true, false), &base));
        assert!(sub.needs_rebuild(&request("password=x;framesPerSecond=30;lagTime=9", true, false), &base));

        sub.dispose();
    }

    #[test]
    fn test_track_latest_toggle_needs_rebuild() {
        let route = CollectingRoute::new();
        let base = ConcentratorConfig::default();
        let req = request("password=x", false, false);
        let sub = ClientSubscription::unsynchronized(1, &req, &base, 1_000, route)
            .expect("Failed to create subscription");

        assert!(!sub.needs_rebuild(&request("password=x", false, false), &base));
        assert!(sub.needs_rebuild(
            &request("password=x;trackLatestMeasurements=true", false, false),
            &base
        ));
    }

    #[test]
    fn test_synchronized_releases_timer_on_dispose() {
        let route = CollectingRoute::new();
        let registry = Arc::new(TimerRegistry::new());
        let req = request("inputMeasurementKeys=PMU:1", true, false);

        let sub = ClientSubscription::synchronized(
            5,
            &req,
            &ConcentratorConfig::default(),
            Arc::clone(&registry),
            route,
        )
        .expect("Failed to create subscription");

        assert!(sub.is_synchronized());
        assert_eq!(registry.active_timer_count(), 1);

        sub.dispose();
        sub.dispose(); // idempotent
        assert_eq!(registry.active_timer_count(), 0);
    }

    #[test]
    fn test_disposed_subscription_drops_batches() {
        let route = CollectingRoute::new();
        let req = request("inputMeasurementKeys=PMU:1", false, false);
        let sub = ClientSubscription::unsynchronized(
            1,
            &req,
            &ConcentratorConfig::default(),
            1_000,
            route.clone(),
        )
        .expect("Failed to create subscription");

        sub.dispose();
        sub.process(&[measurement("PMU", 1, 1.0)]);
        assert!(route.take().is_empty());
    }
}
