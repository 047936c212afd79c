// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Binary subscription protocol: commands, responses and data packets.
//!
//! All multi-byte integers are big-endian. Connection strings travel as
//! UTF-16LE; response message text is UTF-8.
//!
//! # Command packets (client to publisher)
//!
//! ```text
//! 0               1               2               3
//! +---------------+---------------+---------------+---------------+
//! |  command code |    payload (command-specific, may be empty)   |
//! +---------------+---------------+---------------+---------------+
//!
//! Subscribe (0xC0):
//! +---------------+---------------+-------------------------------+
//! |     0xC0      |     flags     |   connection string length    |
//! +---------------+---------------+          (4 bytes BE)         +
//! |               |               |                               |
//! +---------------+---------------+-------------------------------+
//! |            connection string bytes (UTF-16LE) ...             |
//! +---------------------------------------------------------------+
//! ```
//!
//! # Response packets (publisher to client)
//!
//! ```text
//! +---------------+---------------+-------------------------------+
//! | response code | command code  |     data length (4 bytes BE)  |
//! +---------------+---------------+-------------------------------+
//! |                        data bytes ...                         |
//! +---------------------------------------------------------------+
//! ```
//!
//! Data packets ride inside `DataPacket (0xD2)` responses; their layout
//! depends on the synchronized and compact flag bits.

use std::collections::HashMap;

use crate::core::time::Ticks;
use crate::core::{Measurement, MeasurementKey};
use crate::error::{Error, Result};

// =======================================================================
// Codes and flags
// =======================================================================

/// Subscribe to a measurement feed.
pub const CMD_SUBSCRIBE: u8 = 0xC0;
/// Tear down the current subscription.
pub const CMD_UNSUBSCRIBE: u8 = 0xC1;
/// Reserved point-metadata query.
pub const CMD_QUERY_POINTS: u8 = 0xC2;

/// Command accepted and acted on.
pub const RESP_SUCCEEDED: u8 = 0xD0;
/// Command rejected; data carries a UTF-8 reason.
pub const RESP_FAILED: u8 = 0xD1;
/// Measurement payload for the active subscription.
pub const RESP_DATA_PACKET: u8 = 0xD2;

/// Data packet carries one concentrated frame (bit clear: raw batch).
pub const FLAG_SYNCHRONIZED: u8 = 0x01;
/// Measurements use the compact encoding.
pub const FLAG_COMPACT: u8 = 0x02;

/// Measurement value passed source quality checks.
const QUALITY_VALUE_GOOD: u8 = 0x01;
/// Measurement timestamp is trusted.
const QUALITY_TIME_GOOD: u8 = 0x02;

/// Response header: response code + command code + data length.
pub const RESPONSE_HEADER_SIZE: usize = 6;

/// Subscribe body header: flags + connection string length.
const SUBSCRIBE_BODY_HEADER: usize = 5;

// =======================================================================
// Bounded reads
// =======================================================================

fn take_u8(buf: &[u8], offset: &mut usize, what: &str) -> Result<u8> {
    if buf.len() < *offset + 1 {
        return Err(Error::Protocol(format!("packet truncated reading {what}")));
    }
    let value = buf[*offset];
    *offset += 1;
    Ok(value)
}

fn take_u16(buf: &[u8], offset: &mut usize, what: &str) -> Result<u16> {
    if buf.len() < *offset + 2 {
        return Err(Error::Protocol(format!("packet truncated reading {what}")));
    }
    let value = u16::from_be_bytes([buf[*offset], buf[*offset + 1]]);
    *offset += 2;
    Ok(value)
}

fn take_u32(buf: &[u8], offset: &mut usize, what: &str) -> Result<u32> {
    if buf.len() < *offset + 4 {
        return Err(Error::Protocol(format!("packet truncated reading {what}")));
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(raw))
}

fn take_i64(buf: &[u8], offset: &mut usize, what: &str) -> Result<i64> {
    if buf.len() < *offset + 8 {
        return Err(Error::Protocol(format!("packet truncated reading {what}")));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[*offset..*offset + 8]);
    *offset += 8;
    Ok(i64::from_be_bytes(raw))
}

fn take_f32(buf: &[u8], offset: &mut usize, what: &str) -> Result<f32> {
    if buf.len() < *offset + 4 {
        return Err(Error::Protocol(format!("packet truncated reading {what}")));
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[*offset..*offset + 4]);
    *offset += 4;
    Ok(f32::from_be_bytes(raw))
}

fn take_f64(buf: &[u8], offset: &mut usize, what: &str) -> Result<f64> {
    if buf.len() < *offset + 8 {
        return Err(Error::Protocol(format!("packet truncated reading {what}")));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[*offset..*offset + 8]);
    *offset += 8;
    Ok(f64::from_be_bytes(raw))
}

fn take_bytes<'a>(buf: &'a [u8], offset: &mut usize, len: usize, what: &str) -> Result<&'a [u8]> {
    if buf.len() < *offset + len {
        return Err(Error::Protocol(format!("packet truncated reading {what}")));
    }
    let slice = &buf[*offset..*offset + len];
    *offset += len;
    Ok(slice)
}

// =======================================================================
// Connection strings
// =======================================================================

/// Encode a connection string as UTF-16LE bytes.
pub fn encode_connection_string(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() * 2);
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}

/// Decode UTF-16LE connection string bytes.
pub fn decode_connection_string(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(Error::Protocol(
            "connection string has odd byte length".to_string(),
        ));
    }

    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    String::from_utf16(&units)
        .map_err(|_| Error::Protocol("connection string is not valid UTF-16".to_string()))
}

/// Parse a `key=value;key=value` list into a settings map.
///
/// Keys are matched case-insensitively, so they are stored lowercased.
/// Values keep their original case; the first `=` splits key from
/// value, so base64 padding inside values survives. Segments without
/// `=` are ignored.
pub fn parse_key_value_pairs(connection_string: &str) -> HashMap<String, String> {
    let mut settings = HashMap::new();

    for segment in connection_string.split(';') {
        let Some((key, value)) = segment.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            continue;
        }
        settings.insert(key, value.trim().to_string());
    }

    settings
}

// =======================================================================
// Commands
// =======================================================================

/// Parsed `Subscribe` command.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    /// Frame-aligned concentrated feed when set, raw batches when clear.
    pub synchronized: bool,
    /// Compact measurement encoding requested.
    pub compact: bool,
    /// Raw connection string as received.
    pub connection_string: String,
    /// Parsed settings, keys lowercased.
    pub settings: HashMap<String, String>,
}

impl SubscribeRequest {
    /// Case-insensitive settings lookup.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Split a command packet into its code and body.
pub fn split_command(packet: &[u8]) -> Result<(u8, &[u8])> {
    match packet.split_first() {
        Some((&code, body)) => Ok((code, body)),
        None => Err(Error::Protocol("empty command packet".to_string())),
    }
}

/// Parse a `Subscribe` body (everything after the command code).
pub fn parse_subscribe(body: &[u8]) -> Result<SubscribeRequest> {
    if body.len() < SUBSCRIBE_BODY_HEADER {
        return Err(Error::Protocol(
            "subscribe request truncated before connection string length".to_string(),
        ));
    }

    let flags = body[0];
    let mut raw_len = [0u8; 4];
    raw_len.copy_from_slice(&body[1..5]);
    let byte_length = u32::from_be_bytes(raw_len) as usize;

    if byte_length == 0 {
        return Err(Error::Protocol(
            "subscribe request has no connection string".to_string(),
        ));
    }
    if body.len() < SUBSCRIBE_BODY_HEADER + byte_length {
        return Err(Error::Protocol(
            "subscribe request shorter than its declared connection string".to_string(),
        ));
    }

    let connection_string =
        decode_connection_string(&body[SUBSCRIBE_BODY_HEADER..SUBSCRIBE_BODY_HEADER + byte_length])?;
    let settings = parse_key_value_pairs(&connection_string);

    Ok(SubscribeRequest {
        synchronized: flags & FLAG_SYNCHRONIZED != 0,
        compact: flags & FLAG_COMPACT != 0,
        connection_string,
        settings,
    })
}

/// Build a `Subscribe` command packet (client side).
pub fn build_subscribe(synchronized: bool, compact: bool, connection_string: &str) -> Vec<u8> {
    let mut flags = 0u8;
    if synchronized {
        flags |= FLAG_SYNCHRONIZED;
    }
    if compact {
        flags |= FLAG_COMPACT;
    }

    let encoded = encode_connection_string(connection_string);
    let mut packet = Vec::with_capacity(1 + SUBSCRIBE_BODY_HEADER + encoded.len());
    packet.push(CMD_SUBSCRIBE);
    packet.push(flags);
    packet.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
    packet.extend_from_slice(&encoded);
    packet
}

/// Build an `Unsubscribe` command packet.
pub fn build_unsubscribe() -> Vec<u8> {
    vec![CMD_UNSUBSCRIBE]
}

/// Build a `QueryPoints` command packet.
pub fn build_query_points() -> Vec<u8> {
    vec![CMD_QUERY_POINTS]
}

// =======================================================================
// Responses
// =======================================================================

/// Build a response packet: `[response][command][4-byte BE length][data]`.
pub fn build_response(response_code: u8, command_code: u8, data: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(RESPONSE_HEADER_SIZE + data.len());
    packet.push(response_code);
    packet.push(command_code);
    packet.extend_from_slice(&(data.len() as u32).to_be_bytes());
    packet.extend_from_slice(data);
    packet
}

/// Parse a response packet into `(response code, command code, data)`.
///
/// The declared data length must match the bytes present exactly.
pub fn parse_response(packet: &[u8]) -> Result<(u8, u8, &[u8])> {
    if packet.len() < RESPONSE_HEADER_SIZE {
        return Err(Error::Protocol("response packet too short".to_string()));
    }

    let mut raw_len = [0u8; 4];
    raw_len.copy_from_slice(&packet[2..6]);
    let data_length = u32::from_be_bytes(raw_len) as usize;

    if packet.len() != RESPONSE_HEADER_SIZE + data_length {
        return Err(Error::Protocol(format!(
            "response data length mismatch: declared {}, packet holds {}",
            data_length,
            packet.len() - RESPONSE_HEADER_SIZE
        )));
    }

    Ok((packet[0], packet[1], &packet[RESPONSE_HEADER_SIZE..]))
}

// =======================================================================
// Measurement encodings
// =======================================================================

fn quality_flags(measurement: &Measurement) -> u8 {
    let mut flags = 0u8;
    if measurement.value_quality_good {
        flags |= QUALITY_VALUE_GOOD;
    }
    if measurement.timestamp_quality_good {
        flags |= QUALITY_TIME_GOOD;
    }
    flags
}

fn write_key(buf: &mut Vec<u8>, key: &MeasurementKey) -> Result<()> {
    let source = key.source.as_bytes();
    if source.len() > usize::from(u16::MAX) {
        return Err(Error::SerializationError(format!(
            "source name too long: {} bytes",
            source.len()
        )));
    }
    buf.extend_from_slice(&(source.len() as u16).to_be_bytes());
    buf.extend_from_slice(source);
    buf.extend_from_slice(&key.id.to_be_bytes());
    Ok(())
}

fn read_key(buf: &[u8], offset: &mut usize) -> Result<MeasurementKey> {
    let source_len = take_u16(buf, offset, "source length")? as usize;
    let source_bytes = take_bytes(buf, offset, source_len, "source name")?;
    let source = std::str::from_utf8(source_bytes)
        .map_err(|_| Error::Protocol("source name is not valid UTF-8".to_string()))?;
    let id = take_u32(buf, offset, "signal id")?;
    Ok(MeasurementKey::new(source, id))
}

/// Append the full encoding: key, 8-byte timestamp, f64 value, quality.
pub fn encode_full_measurement(buf: &mut Vec<u8>, measurement: &Measurement) -> Result<()> {
    write_key(buf, &measurement.key)?;
    buf.extend_from_slice(&measurement.timestamp.to_be_bytes());
    buf.extend_from_slice(&measurement.value.to_be_bytes());
    buf.push(quality_flags(measurement));
    Ok(())
}

/// Decode one full-format measurement.
pub fn decode_full_measurement(buf: &[u8], offset: &mut usize) -> Result<Measurement> {
    let key = read_key(buf, offset)?;
    let timestamp = take_i64(buf, offset, "timestamp")?;
    let value = take_f64(buf, offset, "value")?;
    let quality = take_u8(buf, offset, "quality flags")?;

    Ok(Measurement {
        key,
        timestamp,
        value,
        timestamp_quality_good: quality & QUALITY_TIME_GOOD != 0,
        value_quality_good: quality & QUALITY_VALUE_GOOD != 0,
    })
}

/// Append the compact encoding: key, f32 value, quality.
///
/// Synchronized packets share the frame timestamp, so per-measurement
/// time is only appended when `include_time` is set.
pub fn encode_compact_measurement(
    buf: &mut Vec<u8>,
    measurement: &Measurement,
    include_time: bool,
) -> Result<()> {
    write_key(buf, &measurement.key)?;
    buf.extend_from_slice(&(measurement.value as f32).to_be_bytes());
    buf.push(quality_flags(measurement));
    if include_time {
        buf.extend_from_slice(&measurement.timestamp.to_be_bytes());
    }
    Ok(())
}

/// Decode one compact-format measurement.
///
/// When `include_time` is clear the caller supplies `timestamp` (the
/// enclosing frame's).
pub fn decode_compact_measurement(
    buf: &[u8],
    offset: &mut usize,
    include_time: bool,
    timestamp: Ticks,
) -> Result<Measurement> {
    let key = read_key(buf, offset)?;
    let value = f64::from(take_f32(buf, offset, "value")?);
    let quality = take_u8(buf, offset, "quality flags")?;
    let timestamp = if include_time {
        take_i64(buf, offset, "timestamp")?
    } else {
        timestamp
    };

    Ok(Measurement {
        key,
        timestamp,
        value,
        timestamp_quality_good: quality & QUALITY_TIME_GOOD != 0,
        value_quality_good: quality & QUALITY_VALUE_GOOD != 0,
    })
}

// =======================================================================
// Data packets
// =======================================================================

/// Smallest possible serialized measurement; bounds count sanity checks.
const MIN_MEASUREMENT_SIZE: usize = 2 + 4 + 4 + 1;

/// Decoded data packet payload.
#[derive(Debug, Clone)]
pub struct DataPacket {
    /// Frame-aligned packet with a shared timestamp.
    pub synchronized: bool,
    /// Measurements used the compact encoding.
    pub compact: bool,
    /// Frame timestamp; present only for synchronized packets.
    pub frame_timestamp: Option<Ticks>,
    /// Carried measurements.
    pub measurements: Vec<Measurement>,
}

/// Build a synchronized data packet from one published frame.
///
/// Layout: `[flags][8-byte BE frame timestamp][4-byte BE count][measurements]`.
pub fn build_synchronized_packet(
    frame_timestamp: Ticks,
    measurements: &[Measurement],
    compact: bool,
) -> Result<Vec<u8>> {
    let mut flags = FLAG_SYNCHRONIZED;
    if compact {
        flags |= FLAG_COMPACT;
    }

    let mut buf = Vec::with_capacity(1 + 8 + 4 + measurements.len() * 32);
    buf.push(flags);
    buf.extend_from_slice(&frame_timestamp.to_be_bytes());
    buf.extend_from_slice(&(measurements.len() as u32).to_be_bytes());

    for measurement in measurements {
        if compact {
            // Frame timestamp serves every measurement in the packet
            encode_compact_measurement(&mut buf, measurement, false)?;
        } else {
            encode_full_measurement(&mut buf, measurement)?;
        }
    }

    Ok(buf)
}

/// Build an unsynchronized data packet from a raw measurement batch.
///
/// Layout: `[flags][4-byte BE count][measurements]`; every measurement
/// carries its own timestamp since there is no shared frame time.
pub fn build_unsynchronized_packet(measurements: &[Measurement], compact: bool) -> Result<Vec<u8>> {
    let mut flags = 0u8;
    if compact {
        flags |= FLAG_COMPACT;
    }

    let mut buf = Vec::with_capacity(1 + 4 + measurements.len() * 40);
    buf.push(flags);
    buf.extend_from_slice(&(measurements.len() as u32).to_be_bytes());

    for measurement in measurements {
        if compact {
            encode_compact_measurement(&mut buf, measurement, true)?;
        } else {
            encode_full_measurement(&mut buf, measurement)?;
        }
    }

    Ok(buf)
}

/// Parse a data packet payload (the data bytes of a `DataPacket` response).
pub fn parse_data_packet(buf: &[u8]) -> Result<DataPacket> {
    let mut offset = 0usize;

    let flags = take_u8(buf, &mut offset, "data packet flags")?;
    let synchronized = flags & FLAG_SYNCHRONIZED != 0;
    let compact = flags & FLAG_COMPACT != 0;

    let frame_timestamp = if synchronized {
        Some(take_i64(buf, &mut offset, "frame timestamp")?)
    } else {
        None
    };

    let count = take_u32(buf, &mut offset, "measurement count")? as usize;
    if count.saturating_mul(MIN_MEASUREMENT_SIZE) > buf.len() - offset {
        return Err(Error::Protocol(format!(
            "measurement count {count} exceeds packet size"
        )));
    }

    let mut measurements = Vec::with_capacity(count);
    for _ in 0..count {
        let measurement = if compact {
            let shared = frame_timestamp.unwrap_or(0);
            decode_compact_measurement(buf, &mut offset, !synchronized, shared)?
        } else {
            decode_full_measurement(buf, &mut offset)?
        };
        measurements.push(measurement);
    }

    if offset != buf.len() {
        return Err(Error::Protocol(format!(
            "data packet has {} trailing bytes",
            buf.len() - offset
        )));
    }

    Ok(DataPacket {
        synchronized,
        compact,
        frame_timestamp,
        measurements,
    })
}

// =======================================================================
// Tests
// =======================================================================
