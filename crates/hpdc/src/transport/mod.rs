// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP transport layer for the data publisher.
//!
//! Every packet on the wire is length-prefixed: a 4-byte big-endian
//! payload length followed by the payload itself. The codec restores
//! packet boundaries from the TCP byte stream; the server multiplexes
//! all subscriber sockets on one mio-driven thread and exposes them
//! through command and event channels.
//!
//! # Modules
//!
//! - `codec` - length-prefixed packet encoding and incremental decoding
//! - `server` - non-blocking TCP accept/read/write loop
//! - `metrics` - atomic counters for connections and traffic

/// Length-prefixed packet framing.
pub mod codec;
/// Connection and traffic counters.
pub mod metrics;
/// Non-blocking TCP server thread.
pub mod server;

// Re-export main types
pub use codec::{PacketCodec, DEFAULT_MAX_PACKET_SIZE, PACKET_HEADER_SIZE};
pub use metrics::{ServerMetrics, ServerMetricsSnapshot};
pub use server::{PacketSender, ServerEvent, ServerHandle, TcpServer};
