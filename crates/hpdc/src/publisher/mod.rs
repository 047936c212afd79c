// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Measurement publication over TCP.
//!
//! ```text
//!                 +-----------+  events   +---------------+
//!  subscribers -->| TcpServer |---------->| router thread |
//!                 +-----------+           +-------+-------+
//!                       ^                         | subscribe /
//!                       | data packets            | unsubscribe
//!                       |                         v
//!                 +-----+------------------------------+
//!  measurements ->|   ClientSubscription (per client)  |
//!                 +------------------------------------+
//! ```
//!
//! [`DataPublisher`] owns the server and a router thread that turns
//! transport events into subscription lifecycle changes. Subscribe
//! requests are authenticated against the publisher's shared secret
//! before any subscription state is touched. Measurements enter through
//! [`DataPublisher::distribute`] and fan out to every live
//! subscription, each of which filters, serializes and sends on its
//! own terms.
//!
//! Unsubscribing, and any subscribe failure, leaves the TCP connection
//! open; only the client closing its socket (or server shutdown) tears
//! the connection down.

pub mod auth;
pub mod subscription;
pub mod wire;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::PublisherConfig;
use crate::core::measurement::Measurement;
use crate::error::{Error, Result};
use crate::scheduler::TimerRegistry;
use crate::transport::{
    PacketSender, ServerEvent, ServerHandle, ServerMetrics, TcpServer, DEFAULT_MAX_PACKET_SIZE,
};

pub use auth::{decrypt_password, encrypt_password, verify_password, PasswordCipher};
pub use subscription::{ClientSubscription, PacketRoute};
pub use wire::{DataPacket, SubscribeRequest};

/// Poll interval for the router thread's shutdown check.
const ROUTER_POLL_INTERVAL: Duration = Duration::from_millis(100);

// =======================================================================
// Publisher
// =======================================================================

/// Serves concentrated and raw measurement feeds to TCP subscribers.
pub struct DataPublisher {
    inner: Arc<PublisherInner>,
    run_state: Mutex<RunState>,
}

/// State shared with the router thread.
struct PublisherInner {
    config: PublisherConfig,
    /// Live subscriptions, keyed by transport client id.
    clients: DashMap<u64, Arc<ClientSubscription>>,
    /// Frame-rate timers shared across synchronized subscriptions.
    registry: Arc<TimerRegistry>,
    metrics: Arc<ServerMetrics>,
    /// Present while the server is up.
    sender: Mutex<Option<PacketSender>>,
    local_addr: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
}

#[derive(Default)]
struct RunState {
    router_thread: Option<JoinHandle<()>>,
}

impl DataPublisher {
    pub fn new(config: PublisherConfig) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                config,
                clients: DashMap::new(),
                registry: Arc::new(TimerRegistry::new()),
                metrics: Arc::new(ServerMetrics::new()),
                sender: Mutex::new(None),
                local_addr: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
            run_state: Mutex::new(RunState::default()),
        }
    }

    /// Bind the listen socket and start accepting subscribers.
    ///
    /// No-op when already running.
    pub fn start(&self) -> Result<()> {
        let mut run = self.run_state.lock();
        if self.inner.running.load(Ordering::Acquire) {
            log::debug!("[DataPublisher] Start ignored, already running");
            return Ok(());
        }

        let addr: SocketAddr = self.inner.config.listen_addr.parse().map_err(|e| {
            Error::BindFailed(format!(
                "invalid listen address {:?}: {}",
                self.inner.config.listen_addr, e
            ))
        })?;
        let handle =
            TcpServer::spawn(addr, DEFAULT_MAX_PACKET_SIZE, Arc::clone(&self.inner.metrics))
                .map_err(|e| Error::BindFailed(format!("failed to bind {addr}: {e}")))?;

        let local_addr = handle.local_addr();
        *self.inner.sender.lock() = Some(handle.sender());
        *self.inner.local_addr.lock() = Some(local_addr);
        self.inner.running.store(true, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        let router_thread = thread::Builder::new()
            .name("hpdc-router".into())
            .spawn(move || route_events(&inner, handle))
            .map_err(|e| {
                // The dropped handle shuts the server thread down
                self.inner.running.store(false, Ordering::Release);
                *self.inner.sender.lock() = None;
                *self.inner.local_addr.lock() = None;
                Error::IoError(e)
            })?;
        run.router_thread = Some(router_thread);

        log::info!("[DataPublisher] Publishing on {local_addr}");
        Ok(())
    }

    /// Stop the server and dispose every subscription. Idempotent.
    ///
    /// Synchronized subscribers get their concentrators stopped, which
    /// releases the shared frame-rate timers.
    pub fn stop(&self) {
        let mut run = self.run_state.lock();
        self.inner.running.store(false, Ordering::Release);
        if let Some(handle) = run.router_thread.take() {
            if handle.join().is_err() {
                log::error!("[DataPublisher] Router thread panicked");
            }
        }
        log::info!("[DataPublisher] Stopped");
    }

    /// Whether the server and router are up.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Bound listen address, once started.
    ///
    /// Useful when the configured address has port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Number of live subscriptions.
    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Transport-level counters.
    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Route a measurement batch to every live subscription.
    ///
    /// Each subscription applies its own key filter, so callers pass
    /// the full feed without pre-splitting it.
    pub fn distribute(&self, measurements: &[Measurement]) {
        if measurements.is_empty() {
            return;
        }
        for entry in self.inner.clients.iter() {
            entry.value().process(measurements);
        }
    }

    /// Multi-line operator status report.
    pub fn status(&self) -> String {
        use std::fmt::Write;

        let snap = self.inner.metrics.snapshot();
        let mut report = String::with_capacity(512);

        let _ = writeln!(
            report,
            "                 State: {}",
            if self.is_running() { "running" } else { "stopped" }
        );
        let _ = writeln!(
            report,
            "        Listen address: {}",
            match self.local_addr() {
                Some(addr) => addr.to_string(),
                None => self.inner.config.listen_addr.clone(),
            }
        );
        let _ = writeln!(report, "    Subscribed clients: {}", self.client_count());
        let _ = writeln!(
            report,
            "    Shared timer rates: {}",
            self.inner.registry.active_timer_count()
        );
        let _ = writeln!(report, "      Clients accepted: {}", snap.clients_accepted);
        let _ = writeln!(report, "          Packets sent: {}", snap.packets_sent);
        let _ = writeln!(report, "      Packets received: {}", snap.packets_received);
        let _ = writeln!(
            report,
            "            Bytes sent: {} ({:.0} B/s)",
            snap.bytes_sent,
            snap.send_rate()
        );
        let _ = writeln!(
            report,
            " Send / receive errors: {} / {}",
            snap.send_errors, snap.recv_errors
        );
        let _ = write!(report, "     Send backpressure: {}", snap.send_blocked);

        for entry in self.inner.clients.iter() {
            let sub = entry.value();
            let _ = write!(
                report,
                "\n             Client {}: {} with {} signals",
                sub.client_id(),
                if sub.is_synchronized() {
                    "synchronized"
                } else {
                    "unsynchronized"
                },
                sub.key_count()
            );
        }

        report
    }
}

impl Drop for DataPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DataPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPublisher")
            .field("running", &self.is_running())
            .field("clients", &self.client_count())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

// =======================================================================
// Router thread
// =======================================================================

/// Consume transport events until shutdown or server exit.
fn route_events(inner: &Arc<PublisherInner>, mut handle: ServerHandle) {
    loop {
        if !inner.running.load(Ordering::Acquire) {
            break;
        }
        let Some(event) = handle.recv_timeout(ROUTER_POLL_INTERVAL) else {
            continue;
        };
        match event {
            ServerEvent::Started { local_addr } => {
                log::debug!("[DataPublisher] Transport up on {local_addr}");
            }
            ServerEvent::ClientConnected {
                client_id,
                remote_addr,
            } => {
                log::info!("[DataPublisher] Client {client_id} connected from {remote_addr}");
            }
            ServerEvent::PacketReceived { client_id, payload } => {
                handle_packet(inner, client_id, &payload);
            }
            ServerEvent::ClientDisconnected {
                client_id,
                remote_addr,
                reason,
            } => {
                if let Some((_, subscription)) = inner.clients.remove(&client_id) {
                    subscription.dispose();
                }
                log::info!(
                    "[DataPublisher] Client {client_id} ({remote_addr}) disconnected: {}",
                    reason.as_deref().unwrap_or("gone")
                );
            }
            ServerEvent::Error { client_id, error } => match client_id {
                Some(id) => log::warn!("[DataPublisher] Transport error for client {id}: {error}"),
                None => log::warn!("[DataPublisher] Transport error: {error}"),
            },
            ServerEvent::Stopped => {
                log::debug!("[DataPublisher] Transport stopped");
                break;
            }
        }
    }

    if let Err(e) = handle.shutdown() {
        log::warn!("[DataPublisher] Server shutdown reported: {e}");
    }
    for entry in inner.clients.iter() {
        entry.value().dispose();
    }
    inner.clients.clear();
    *inner.sender.lock() = None;
    inner.running.store(false, Ordering::Release);
}

/// Dispatch one command packet from a client.
fn handle_packet(inner: &Arc<PublisherInner>, client_id: u64, payload: &[u8]) {
    let (command, body) = match wire::split_command(payload) {
        Ok(parts) => parts,
        Err(e) => {
            log::debug!("[DataPublisher] Dropping unusable packet from client {client_id}: {e}");
            return;
        }
    };

    match command {
        wire::CMD_SUBSCRIBE => {
            let (code, message) = handle_subscribe(inner, client_id, body);
            if code == wire::RESP_SUCCEEDED {
                log::info!("[DataPublisher] Client {client_id}: {message}");
            } else {
                log::warn!("[DataPublisher] Client {client_id} subscribe failed: {message}");
            }
            respond(inner, client_id, code, wire::CMD_SUBSCRIBE, &message);
        }
        wire::CMD_UNSUBSCRIBE => {
            if let Some((_, subscription)) = inner.clients.remove(&client_id) {
                subscription.dispose();
            }
            log::info!("[DataPublisher] Client {client_id} unsubscribed");
            respond(
                inner,
                client_id,
                wire::RESP_SUCCEEDED,
                wire::CMD_UNSUBSCRIBE,
                "Client unsubscribed.",
            );
        }
        wire::CMD_QUERY_POINTS => {
            respond(
                inner,
                client_id,
                wire::RESP_FAILED,
                wire::CMD_QUERY_POINTS,
                "Query points command is not implemented yet.",
            );
        }
        other => {
            log::warn!(
                "[DataPublisher] Client {client_id} sent an unrecognized command: 0x{other:02X}"
            );
            respond(
                inner,
                client_id,
                wire::RESP_FAILED,
                other,
                &format!("Client sent an unrecognized server command: 0x{other:02X}"),
            );
        }
    }
}

/// Process a subscribe request body into a response code and message.
fn handle_subscribe(inner: &Arc<PublisherInner>, client_id: u64, body: &[u8]) -> (u8, String) {
    let request = match wire::parse_subscribe(body) {
        Ok(request) => request,
        Err(e) => return (wire::RESP_FAILED, e.to_string()),
    };

    match apply_subscription(inner, client_id, &request) {
        Ok(signals) => (wire::RESP_SUCCEEDED, subscription_ack(&request, signals)),
        Err(e) => (
            wire::RESP_FAILED,
            format!("Failed to process client data subscription due to exception: {e}"),
        ),
    }
}

/// Create, replace or update the client's subscription.
///
/// A resubscribe in the same mode with unchanged timing is applied in
/// place; a mode or timing change tears the old subscription down and
/// builds a fresh one.
fn apply_subscription(
    inner: &Arc<PublisherInner>,
    client_id: u64,
    request: &SubscribeRequest,
) -> Result<usize> {
    authenticate(&inner.config.shared_secret, request)?;

    let route: Arc<dyn PacketRoute> = {
        let sender = inner.sender.lock();
        match sender.as_ref() {
            Some(sender) => Arc::new(sender.clone()),
            None => return Err(Error::InvalidState("publisher is not running".into())),
        }
    };

    let existing = inner
        .clients
        .get(&client_id)
        .map(|entry| Arc::clone(entry.value()));
    if let Some(existing) = existing {
        if existing.is_synchronized() == request.synchronized
            && !existing.needs_rebuild(request, &inner.config.concentration)
        {
            existing.reinitialize(request);
            return Ok(existing.key_count());
        }
        if let Some((_, old)) = inner.clients.remove(&client_id) {
            old.dispose();
        }
    }

    let subscription = if request.synchronized {
        ClientSubscription::synchronized(
            client_id,
            request,
            &inner.config.concentration,
            Arc::clone(&inner.registry),
            route,
        )?
    } else {
        ClientSubscription::unsynchronized(
            client_id,
            request,
            &inner.config.concentration,
            inner.config.latest_flush_limit,
            route,
        )?
    };

    let signals = subscription.key_count();
    inner.clients.insert(client_id, Arc::new(subscription));
    Ok(signals)
}

/// Check the encrypted password in a subscribe request against the
/// publisher's shared secret.
fn authenticate(shared_secret: &str, request: &SubscribeRequest) -> Result<()> {
    let encoded = request.setting("password").ok_or_else(|| {
        Error::AuthenticationFailed("no password was provided in the connection string".into())
    })?;
    auth::verify_password(encoded, shared_secret)
}

fn subscription_ack(request: &SubscribeRequest, signals: usize) -> String {
    let compact = if request.compact { "" } else { "non-" };
    let synchronized = if request.synchronized { "" } else { "un" };
    if signals == 0 {
        // No filter subscribes to the whole feed, but flag the omission
        format!(
            "Client subscribed as {compact}compact {synchronized}synchronized, \
             but no signals were specified. Make sure \"inputMeasurementKeys\" \
             setting is properly defined."
        )
    } else {
        format!(
            "Client subscribed as {compact}compact {synchronized}synchronized \
             with {signals} signals."
        )
    }
}

fn respond(inner: &Arc<PublisherInner>, client_id: u64, code: u8, command: u8, message: &str) {
    let packet = wire::build_response(code, command, message.as_bytes());
    let sender = inner.sender.lock();
    if let Some(sender) = sender.as_ref() {
        if let Err(e) = sender.send(client_id, packet) {
            log::debug!("[DataPublisher] Response to client {client_id} not sent: {e}");
        }
    }
}

// =======================================================================
// Tests
// =======================================================================
