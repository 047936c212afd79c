// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Non-blocking TCP server for subscriber clients.
//!
//! One dedicated thread multiplexes the listener and every client
//! socket through a mio poll loop. Callers interact through a
//! [`ServerHandle`]: commands (send, close, shutdown) go in via a
//! channel plus a poll waker, decoded packets and connection events
//! come back out on an event channel.
//!
//! # Architecture
//!
//! ```text
//! +------------------------------------------------------------+
//! |                     "hpdc-server" thread                   |
//! |  +------------------------------------------------------+  |
//! |  |                     mio::Poll                        |  |
//! |  |  - TcpListener  (accept subscriber connections)      |  |
//! |  |  - TcpStreams   (read commands / write responses)    |  |
//! |  |  - Waker        (command channel doorbell)           |  |
//! |  +------------------------------------------------------+  |
//! |        |                  |                   |            |
//! |     accept         PacketCodec read      queued write      |
//! |        |                  |                   |            |
//! |        +------------------v-------------------+            |
//! |                   event channel -> ServerHandle            |
//! +------------------------------------------------------------+
//! ```
//!
//! The server never initiates connections and never parses payloads;
//! command routing lives in the publisher layer.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use super::codec::PacketCodec;
use super::metrics::ServerMetrics;

// =======================================================================
// Constants
// =======================================================================

/// Token for the TCP listener
const LISTENER_TOKEN: Token = Token(0);

/// Token for the waker (command channel doorbell)
const WAKER_TOKEN: Token = Token(1);

/// Starting token for client connections
const CLIENT_TOKEN_START: usize = 2;

/// Poll timeout; bounds command latency when the waker edge is missed
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum events to process per poll
const MAX_EVENTS: usize = 128;

/// Listener backlog
const LISTEN_BACKLOG: i32 = 128;

// =======================================================================
// Events and Commands
// =======================================================================

/// Events emitted by the server thread.
#[derive(Debug)]
pub enum ServerEvent {
    /// Server thread is up and listening.
    Started { local_addr: SocketAddr },

    /// A subscriber connected.
    ClientConnected {
        client_id: u64,
        remote_addr: SocketAddr,
    },

    /// A complete packet arrived from a client.
    PacketReceived { client_id: u64, payload: Vec<u8> },

    /// A client went away (peer close, error, or requested close).
    ClientDisconnected {
        client_id: u64,
        remote_addr: SocketAddr,
        reason: Option<String>,
    },

    /// Non-fatal error, connection-scoped when `client_id` is set.
    Error {
        client_id: Option<u64>,
        error: String,
    },

    /// Server thread exited.
    Stopped,
}

/// Commands accepted by the server thread.
#[derive(Debug)]
enum ServerCommand {
    /// Frame and send a payload to one client.
    Send { client_id: u64, payload: Vec<u8> },

    /// Close one client connection.
    Close { client_id: u64 },

    /// Stop the server thread.
    Shutdown,
}

// =======================================================================
// Handles
// =======================================================================

/// Cloneable, thread-safe sender half of the server interface.
///
/// Subscription publish paths hold one of these to push packets
/// without touching the event receiver.
#[derive(Clone)]
pub struct PacketSender {
    cmd_tx: Sender<ServerCommand>,
    waker: Arc<Waker>,
}

impl PacketSender {
    /// Queue a payload for framing and delivery to `client_id`.
    pub fn send(&self, client_id: u64, payload: Vec<u8>) -> io::Result<()> {
        self.cmd_tx
            .send(ServerCommand::Send { client_id, payload })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "server thread stopped"))?;
        self.waker.wake()
    }

    /// Close one client connection.
    pub fn close(&self, client_id: u64) -> io::Result<()> {
        self.cmd_tx
            .send(ServerCommand::Close { client_id })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "server thread stopped"))?;
        self.waker.wake()
    }
}

impl std::fmt::Debug for PacketSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketSender").finish_non_exhaustive()
    }
}

/// Handle for the server thread: command submission, event consumption
/// and shutdown.
pub struct ServerHandle {
    cmd_tx: Sender<ServerCommand>,
    event_rx: Receiver<ServerEvent>,
    waker: Arc<Waker>,
    thread_handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// Address the listener is bound to (resolves port 0 requests).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cloneable sender for use from other threads.
    pub fn sender(&self) -> PacketSender {
        PacketSender {
            cmd_tx: self.cmd_tx.clone(),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Queue a payload for framing and delivery to `client_id`.
    pub fn send(&self, client_id: u64, payload: Vec<u8>) -> io::Result<()> {
        self.cmd_tx
            .send(ServerCommand::Send { client_id, payload })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "server thread stopped"))?;
        self.waker.wake()
    }

    /// Close one client connection.
    pub fn close(&self, client_id: u64) -> io::Result<()> {
        self.cmd_tx
            .send(ServerCommand::Close { client_id })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "server thread stopped"))?;
        self.waker.wake()
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&self) -> Option<ServerEvent> {
        match self.event_rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(ServerEvent::Stopped),
        }
    }

    /// Receive an event, waiting up to `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ServerEvent> {
        match self.event_rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(ServerEvent::Stopped),
        }
    }

    /// Whether the server thread is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the server thread and wait for it to exit.
    pub fn shutdown(&mut self) -> io::Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        let _ = self.cmd_tx.send(ServerCommand::Shutdown);
        let _ = self.waker.wake();

        if let Some(handle) = self.thread_handle.take() {
            handle
                .join()
                .map_err(|_| io::Error::other("server thread panicked"))?;
        }

        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

// =======================================================================
// Server
// =======================================================================

/// Per-client state inside the server thread.
struct ClientConnection {
    stream: TcpStream,
    client_id: u64,
    remote_addr: SocketAddr,
    codec: PacketCodec,
    /// Framed bytes awaiting the socket.
    send_queue: Vec<u8>,
    /// Progress into `send_queue` across partial writes.
    send_offset: usize,
}

/// Server thread state.
pub struct TcpServer {
    poll: Poll,
    listener: TcpListener,
    clients: HashMap<Token, ClientConnection>,
    client_id_to_token: HashMap<u64, Token>,
    next_token: usize,
    max_packet_size: usize,
    cmd_rx: Receiver<ServerCommand>,
    event_tx: Sender<ServerEvent>,
    metrics: Arc<ServerMetrics>,
    running: Arc<AtomicBool>,
}

impl TcpServer {
    /// Bind `listen_addr` and spawn the server thread.
    pub fn spawn(
        listen_addr: SocketAddr,
        max_packet_size: usize,
        metrics: Arc<ServerMetrics>,
    ) -> io::Result<ServerHandle> {
        let poll = Poll::new()?;

        let std_listener = bind_listener(listen_addr)?;
        let local_addr = std_listener.local_addr()?;
        let mut listener = TcpListener::from_std(std_listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let (cmd_tx, cmd_rx) = channel::unbounded();
        let (event_tx, event_rx) = channel::unbounded();
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let running = Arc::new(AtomicBool::new(true));

        let server = Self {
            poll,
            listener,
            clients: HashMap::new(),
            client_id_to_token: HashMap::new(),
            next_token: CLIENT_TOKEN_START,
            max_packet_size,
            cmd_rx,
            event_tx,
            metrics,
            running: Arc::clone(&running),
        };

        let thread_handle = thread::Builder::new()
            .name("hpdc-server".to_string())
            .spawn(move || server.run())?;

        Ok(ServerHandle {
            cmd_tx,
            event_rx,
            waker,
            thread_handle: Some(thread_handle),
            running,
            local_addr,
        })
    }

    /// Run the poll loop until shutdown.
    fn run(mut self) {
        let local_addr = self
            .listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let _ = self.event_tx.send(ServerEvent::Started { local_addr });
        log::info!("[TcpServer] Listening on {local_addr}");

        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    let _ = self.event_tx.send(ServerEvent::Error {
                        client_id: None,
                        error: format!("poll error: {e}"),
                    });
                }
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.handle_accept(),
                    WAKER_TOKEN => self.handle_commands(),
                    token => {
                        if event.is_readable() {
                            self.handle_readable(token);
                        }
                        if event.is_writable() {
                            self.handle_writable(token);
                        }
                    }
                }
            }
        }

        for (_, client) in self.clients.drain() {
            self.metrics.record_client_closed();
            let _ = self.event_tx.send(ServerEvent::ClientDisconnected {
                client_id: client.client_id,
                remote_addr: client.remote_addr,
                reason: Some("server shutdown".to_string()),
            });
        }

        log::info!("[TcpServer] Stopped");
        let _ = self.event_tx.send(ServerEvent::Stopped);
    }

    /// Accept every pending connection.
    fn handle_accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, remote_addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    let client_id = token.0 as u64;

                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        let _ = self.event_tx.send(ServerEvent::Error {
                            client_id: Some(client_id),
                            error: format!("failed to register connection: {e}"),
                        });
                        continue;
                    }

                    // Responses and data packets are latency-sensitive.
                    let _ = stream.set_nodelay(true);

                    self.clients.insert(
                        token,
                        ClientConnection {
                            stream,
                            client_id,
                            remote_addr,
                            codec: PacketCodec::new(self.max_packet_size),
                            send_queue: Vec::new(),
                            send_offset: 0,
                        },
                    );
                    self.client_id_to_token.insert(client_id, token);
                    self.metrics.record_client_accepted();

                    log::debug!("[TcpServer] Client {client_id} connected from {remote_addr}");
                    let _ = self.event_tx.send(ServerEvent::ClientConnected {
                        client_id,
                        remote_addr,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    let _ = self.event_tx.send(ServerEvent::Error {
                        client_id: None,
                        error: format!("accept error: {e}"),
                    });
                    break;
                }
            }
        }
    }

    /// Drain the command channel.
    fn handle_commands(&mut self) {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(ServerCommand::Send { client_id, payload }) => {
                    self.handle_send(client_id, payload);
                }
                Ok(ServerCommand::Close { client_id }) => {
                    self.handle_close(client_id);
                }
                Ok(ServerCommand::Shutdown) => {
                    self.running.store(false, Ordering::Relaxed);
                    break;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.running.store(false, Ordering::Relaxed);
                    break;
                }
            }
        }
    }

    fn handle_send(&mut self, client_id: u64, payload: Vec<u8>) {
        let Some(&token) = self.client_id_to_token.get(&client_id) else {
            // Races with disconnect; the sender learns via the event stream.
            let _ = self.event_tx.send(ServerEvent::Error {
                client_id: Some(client_id),
                error: "client not found".to_string(),
            });
            return;
        };

        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };

        PacketCodec::encode_into(&payload, &mut client.send_queue);
        self.metrics.record_packet_sent();
        self.try_flush(token);
    }

    fn handle_close(&mut self, client_id: u64) {
        if let Some(token) = self.client_id_to_token.remove(&client_id) {
            if let Some(mut client) = self.clients.remove(&token) {
                let _ = self.poll.registry().deregister(&mut client.stream);
                self.metrics.record_client_closed();

                let _ = self.event_tx.send(ServerEvent::ClientDisconnected {
                    client_id,
                    remote_addr: client.remote_addr,
                    reason: Some("closed by request".to_string()),
                });
            }
        }
    }

    /// Decode every complete packet currently buffered on the socket.
    fn handle_readable(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };

        loop {
            match client.codec.decode(&mut client.stream) {
                Ok(Some(payload)) => {
                    self.metrics.record_packet_received(payload.len());
                    let _ = self.event_tx.send(ServerEvent::PacketReceived {
                        client_id: client.client_id,
                        payload,
                    });
                }
                Ok(None) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.close_client(token, Some("connection closed by peer".to_string()));
                    return;
                }
                Err(e) => {
                    self.metrics.record_recv_error();
                    self.close_client(token, Some(format!("read error: {e}")));
                    return;
                }
            }
        }
    }

    fn handle_writable(&mut self, token: Token) {
        self.try_flush(token);
    }

    /// Push queued bytes into the socket until done or backpressured.
    fn try_flush(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };

        if client.send_queue.is_empty() {
            return;
        }

        while client.send_offset < client.send_queue.len() {
            match client.stream.write(&client.send_queue[client.send_offset..]) {
                Ok(0) => {
                    self.close_client(token, Some("write returned 0".to_string()));
                    return;
                }
                Ok(n) => {
                    client.send_offset += n;
                    self.metrics.record_bytes_sent(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Remainder goes out on the next writable event.
                    self.metrics.record_send_blocked();
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.metrics.record_send_error();
                    self.close_client(token, Some(format!("write error: {e}")));
                    return;
                }
            }
        }

        client.send_queue.clear();
        client.send_offset = 0;
    }

    /// Remove a client and tell the event stream why.
    fn close_client(&mut self, token: Token, reason: Option<String>) {
        if let Some(mut client) = self.clients.remove(&token) {
            let _ = self.poll.registry().deregister(&mut client.stream);
            self.client_id_to_token.remove(&client.client_id);
            self.metrics.record_client_closed();

            log::debug!(
                "[TcpServer] Client {} disconnected: {}",
                client.client_id,
                reason.as_deref().unwrap_or("unknown")
            );
            let _ = self.event_tx.send(ServerEvent::ClientDisconnected {
                client_id: client.client_id,
                remote_addr: client.remote_addr,
                reason,
            });
        }
    }
}

/// Build a reusable, non-blocking std listener for mio to adopt.
fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let listener: std::net::TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    Ok(listener)
}

// =======================================================================
// Tests
// =======================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;

    const RECV_WAIT: Duration = Duration::from_secs(2);

    fn spawn_server() -> ServerHandle {
        TcpServer::spawn(
            "127.0.0.1:0".parse().expect("Failed to parse address"),
            64 * 1024,
            Arc::new(ServerMetrics::new()),
        )
        .expect("Failed to spawn server")
    }

    /// Pull events until one matches, tolerating interleaved noise.
    fn wait_for<F: Fn(&ServerEvent) -> bool>(handle: &ServerHandle, matches: F) -> ServerEvent {
        let deadline = std::time::Instant::now() + RECV_WAIT;
        while std::time::Instant::now() < deadline {
            if let Some(event) = handle.recv_timeout(Duration::from_millis(100)) {
                if matches(&event) {
                    return event;
                }
            }
        }
        panic!("expected event not received within {RECV_WAIT:?}");
    }

    #[test]
    fn test_constants() {
        assert_eq!(LISTENER_TOKEN, Token(0));
        assert_eq!(WAKER_TOKEN, Token(1));
        assert_eq!(CLIENT_TOKEN_START, 2);
        assert_eq!(POLL_TIMEOUT, Duration::from_millis(100));
    }

    #[test]
    fn test_spawn_and_shutdown() {
        let mut handle = spawn_server();
        assert!(handle.is_running());
        assert_ne!(handle.local_addr().port(), 0);

        let started = wait_for(&handle, |e| matches!(e, ServerEvent::Started { .. }));
        let ServerEvent::Started { local_addr } = started else {
            unreachable!();
        };
        assert_eq!(local_addr, handle.local_addr());

        handle.shutdown().expect("Failed to shut down");
        assert!(!handle.is_running());
    }

    #[test]
    fn test_client_connect_send_receive() {
        let mut handle = spawn_server();

        let mut client = StdTcpStream::connect(handle.local_addr()).expect("Failed to connect");

        let connected = wait_for(&handle, |e| matches!(e, ServerEvent::ClientConnected { .. }));
        let ServerEvent::ClientConnected { client_id, .. } = connected else {
            unreachable!();
        };

        // Client -> server.
        client
            .write_all(&PacketCodec::encode(b"hello publisher"))
            .expect("Failed to write");

        let received = wait_for(&handle, |e| matches!(e, ServerEvent::PacketReceived { .. }));
        let ServerEvent::PacketReceived { payload, .. } = received else {
            unreachable!();
        };
        assert_eq!(payload, b"hello publisher");

        // Server -> client, framed by the server.
        handle
            .send(client_id, b"hello subscriber".to_vec())
            .expect("Failed to send");

        let mut header = [0u8; 4];
        client.read_exact(&mut header).expect("Failed to read");
        let len = u32::from_be_bytes(header) as usize;
        let mut body = vec![0u8; len];
        client.read_exact(&mut body).expect("Failed to read");
        assert_eq!(body, b"hello subscriber");

        handle.shutdown().expect("Failed to shut down");
    }

    #[test]
    fn test_client_disconnect_event() {
        let mut handle = spawn_server();

        let client = StdTcpStream::connect(handle.local_addr()).expect("Failed to connect");
        wait_for(&handle, |e| matches!(e, ServerEvent::ClientConnected { .. }));

        drop(client);

        let disconnected = wait_for(&handle, |e| {
            matches!(e, ServerEvent::ClientDisconnected { .. })
        });
        let ServerEvent::ClientDisconnected { reason, .. } = disconnected else {
            unreachable!();
        };
        assert!(reason.is_some());

        handle.shutdown().expect("Failed to shut down");
    }

    #[test]
    fn test_send_to_unknown_client_reports_error() {
        let mut handle = spawn_server();

        handle.send(9_999, b"nobody home".to_vec()).expect("queue");

        let error = wait_for(&handle, |e| matches!(e, ServerEvent::Error { .. }));
        let ServerEvent::Error { client_id, .. } = error else {
            unreachable!();
        };
        assert_eq!(client_id, Some(9_999));

        handle.shutdown().expect("Failed to shut down");
    }

    #[test]
    fn test_sender_is_usable_from_other_threads() {
        let mut handle = spawn_server();
        let sender = handle.sender();

        let mut client = StdTcpStream::connect(handle.local_addr()).expect("Failed to connect");
        let connected = wait_for(&handle, |e| matches!(e, ServerEvent::ClientConnected { .. }));
        let ServerEvent::ClientConnected { client_id, .. } = connected else {
            unreachable!();
        };

        let worker = thread::spawn(move || {
            sender
                .send(client_id, b"from a worker".to_vec())
                .expect("Failed to send");
        });
        worker.join().expect("worker panicked");

        let mut header = [0u8; 4];
        client.read_exact(&mut header).expect("Failed to read");
        let mut body = vec![0u8; u32::from_be_bytes(header) as usize];
        client.read_exact(&mut body).expect("Failed to read");
        assert_eq!(body, b"from a worker");

        handle.shutdown().expect("Failed to shut down");
    }
}
