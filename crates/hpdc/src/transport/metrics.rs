// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server transport metrics.
//!
//! Tracks client connections, packet throughput and error counts for
//! the publisher's TCP server. All counters are lock-free.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Metrics for the publisher's TCP server.
#[derive(Debug)]
pub struct ServerMetrics {
    /// Currently connected clients
    active_clients: AtomicUsize,

    /// Total clients accepted
    clients_accepted: AtomicU64,

    /// Total packets sent
    packets_sent: AtomicU64,

    /// Total packets received
    packets_received: AtomicU64,

    /// Total bytes sent (including framing)
    bytes_sent: AtomicU64,

    /// Total payload bytes received
    bytes_received: AtomicU64,

    /// Send errors (connection reset, broken pipe)
    send_errors: AtomicU64,

    /// Receive errors (framing, oversized, reset)
    recv_errors: AtomicU64,

    /// Times a send hit socket backpressure
    send_blocked: AtomicU64,

    /// When metrics collection started
    start_time: Instant,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            active_clients: AtomicUsize::new(0),
            clients_accepted: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            recv_errors: AtomicU64::new(0),
            send_blocked: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_client_accepted(&self) {
        self.clients_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_client_closed(&self) {
        self.active_clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_packet_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_packet_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_blocked(&self) {
        self.send_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_clients(&self) -> usize {
        self.active_clients.load(Ordering::Relaxed)
    }

    /// Take a snapshot of all counters.
    pub fn snapshot(&self) -> ServerMetricsSnapshot {
        ServerMetricsSnapshot {
            active_clients: self.active_clients.load(Ordering::Relaxed),
            clients_accepted: self.clients_accepted.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
            send_blocked: self.send_blocked.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the server counters.
#[derive(Clone, Debug, Default)]
pub struct ServerMetricsSnapshot {
    pub active_clients: usize,
    pub clients_accepted: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_errors: u64,
    pub recv_errors: u64,
    pub send_blocked: u64,
    pub uptime_secs: f64,
}

impl ServerMetricsSnapshot {
    /// Outbound byte rate over the collection period (bytes/second).
    pub fn send_rate(&self) -> f64 {
        if self.uptime_secs > 0.0 {
            self.bytes_sent as f64 / self.uptime_secs
        } else {
            0.0
        }
    }
}
