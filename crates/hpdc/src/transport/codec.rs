// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing codec for the subscriber wire protocol.
//!
//! TCP is a stream without message boundaries. Every command and
//! response travels as one length-prefixed packet:
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | Packet payload    |
//! +----------------+-------------------+
//! ```
//!
//! The length field is a 32-bit big-endian integer counting payload
//! bytes only (the 4-byte prefix is excluded). Payload contents are
//! opaque to the codec; command and response layout lives in the
//! publisher layer.

use std::io::{self, Read};

/// Packet header size (4 bytes for length).
pub const PACKET_HEADER_SIZE: usize = 4;

/// Default maximum packet size (4 MB).
///
/// Data packets scale with subscription width; 4 MB covers tens of
/// thousands of full-format measurements per frame.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 4 * 1024 * 1024;

/// Length-prefix packet codec.
///
/// Maintains partial-read state so it can be driven by a non-blocking
/// socket: call [`decode`](Self::decode) whenever the socket is
/// readable, until it returns `Ok(None)`.
#[derive(Debug)]
pub struct PacketCodec {
    /// Current read state
    state: ReadState,

    /// Buffer for accumulating bytes
    buffer: Vec<u8>,

    /// Maximum allowed packet size (anti-OOM protection)
    max_size: usize,

    /// Statistics: packets decoded
    packets_decoded: u64,

    /// Statistics: payload bytes decoded
    bytes_decoded: u64,

    /// Statistics: packets rejected as oversized
    packets_rejected: u64,
}

/// Internal state for incremental reading.
#[derive(Debug, Clone, Copy)]
enum ReadState {
    /// Reading the 4-byte length header
    ReadingLength { bytes_read: usize },

    /// Reading the packet body
    ReadingBody {
        expected_len: usize,
        bytes_read: usize,
    },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::ReadingLength { bytes_read: 0 }
    }
}

impl PacketCodec {
    /// Create a codec with the specified max packet size.
    pub fn new(max_size: usize) -> Self {
        Self {
            state: ReadState::default(),
            buffer: vec![0u8; PACKET_HEADER_SIZE],
            max_size,
            packets_decoded: 0,
            bytes_decoded: 0,
            packets_rejected: 0,
        }
    }

    /// Create a codec with the default max size (4 MB).
    pub fn with_default_max() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }

    /// Maximum allowed packet size.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of packets successfully decoded.
    pub fn packets_decoded(&self) -> u64 {
        self.packets_decoded
    }

    /// Total payload bytes decoded.
    pub fn bytes_decoded(&self) -> u64 {
        self.bytes_decoded
    }

    /// Number of packets rejected as oversized.
    pub fn packets_rejected(&self) -> u64 {
        self.packets_rejected
    }

    /// Reset the read state (e.g. after a connection reset).
    pub fn reset(&mut self) {
        self.state = ReadState::default();
        self.buffer.resize(PACKET_HEADER_SIZE, 0);
    }

    /// Frame a payload: `[length: u32 BE][payload]`.
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(PACKET_HEADER_SIZE + payload.len());
        Self::encode_into(payload, &mut packet);
        packet
    }

    /// Frame a payload into an existing buffer.
    pub fn encode_into(payload: &[u8], buf: &mut Vec<u8>) {
        let len = payload.len() as u32;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(payload);
    }

    /// Try to decode one complete packet from the reader.
    ///
    /// Returns:
    /// - `Ok(Some(payload))` - a complete packet was decoded
    /// - `Ok(None)` - need more data (`WouldBlock`)
    /// - `Err(e)` - I/O error or oversized packet
    pub fn decode<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.state {
                ReadState::ReadingLength { bytes_read } => {
                    match reader.read(&mut self.buffer[bytes_read..PACKET_HEADER_SIZE]) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                if bytes_read == 0 {
                                    "connection closed"
                                } else {
                                    "incomplete packet header"
                                },
                            ));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < PACKET_HEADER_SIZE {
                                self.state = ReadState::ReadingLength { bytes_read: total };
                                continue;
                            }

                            let len = u32::from_be_bytes([
                                self.buffer[0],
                                self.buffer[1],
                                self.buffer[2],
                                self.buffer[3],
                            ]) as usize;

                            if len > self.max_size {
                                self.packets_rejected += 1;
                                self.state = ReadState::default();
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!(
                                        "packet too large: {} bytes (max {})",
                                        len, self.max_size
                                    ),
                                ));
                            }

                            if len == 0 {
                                // Empty packet; legal but carries nothing.
                                self.packets_decoded += 1;
                                self.state = ReadState::default();
                                return Ok(Some(Vec::new()));
                            }

                            self.buffer.resize(len, 0);
                            self.state = ReadState::ReadingBody {
                                expected_len: len,
                                bytes_read: 0,
                            };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.state = ReadState::ReadingLength { bytes_read };
                            return Ok(None);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }

                ReadState::ReadingBody {
                    expected_len,
                    bytes_read,
                } => {
                    match reader.read(&mut self.buffer[bytes_read..expected_len]) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "incomplete packet body",
                            ));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < expected_len {
                                self.state = ReadState::ReadingBody {
                                    expected_len,
                                    bytes_read: total,
                                };
                                continue;
                            }

                            let payload = self.buffer[..expected_len].to_vec();
                            self.packets_decoded += 1;
                            self.bytes_decoded += expected_len as u64;

                            self.buffer.resize(PACKET_HEADER_SIZE, 0);
                            self.state = ReadState::default();

                            return Ok(Some(payload));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.state = ReadState::ReadingBody {
                                expected_len,
                                bytes_read,
                            };
                            return Ok(None);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Whether the codec is mid-packet.
    pub fn is_partial(&self) -> bool {
        match self.state {
            ReadState::ReadingLength { bytes_read } => bytes_read > 0,
            ReadState::ReadingBody { .. } => true,
        }
    }

    /// Bytes still needed to complete the current read.
    pub fn bytes_needed(&self) -> usize {
        match self.state {
            ReadState::ReadingLength { bytes_read } => PACKET_HEADER_SIZE - bytes_read,
            ReadState::ReadingBody {
                expected_len,
                bytes_read,
            } => expected_len - bytes_read,
        }
    }
}

// =======================================================================
// Tests
// =======================================================================
