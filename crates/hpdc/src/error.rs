// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error type for concentrator and publisher operations.

/// Errors returned by HPDC operations.
///
/// This enum covers all error conditions that can occur, from configuration
/// issues rejected at construction time to runtime transport failures.
///
/// # Example
///
/// ```rust
/// use hpdc::{ConcentratorConfig, Error};
///
/// let config = ConcentratorConfig {
///     frames_per_second: 0, // Invalid!
///     ..Default::default()
/// };
///
/// match config.validate() {
///     Err(Error::InvalidFramesPerSecond(fps)) => println!("Bad rate: {}", fps),
///     Err(e) => println!("Other error: {}", e),
///     Ok(()) => println!("Valid"),
/// }
/// ```
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Frames per second out of range (must be 1-1000).
    InvalidFramesPerSecond(u16),
    /// Lag time must be greater than zero seconds.
    InvalidLagTime(f64),
    /// Lead time must be greater than zero seconds.
    InvalidLeadTime(f64),
    /// Time resolution must not be negative.
    InvalidTimeResolution(i64),

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// Invalid state for the requested operation.
    InvalidState(String),
    /// Shared frame-rate timer could not be created for a rate.
    SchedulerFailed(String),

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// I/O error with underlying cause.
    IoError(std::io::Error),
    /// Failed to bind the listener socket.
    BindFailed(String),
    /// Send operation failed.
    SendFailed(String),

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Malformed command payload (truncated, bad encoding, bad length field).
    Protocol(String),
    /// Subscription request carried a missing or incorrect password.
    AuthenticationFailed(String),
    /// Key derivation or AEAD primitive failed.
    CryptoError(String),
    /// Frame serialization failed (oversize payload, bad measurement key).
    SerializationError(String),

    // ========================================================================
    // Publication Errors
    // ========================================================================
    /// Frame sink rejected a frame; reported via the process-exception path.
    PublishFailed(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // Configuration
            Error::InvalidFramesPerSecond(fps) => {
                write!(f, "Invalid frames_per_second: {} (must be 1-1000)", fps)
            }
            Error::InvalidLagTime(lag) => {
                write!(f, "Invalid lag_time: {} (must be greater than zero)", lag)
            }
            Error::InvalidLeadTime(lead) => {
                write!(f, "Invalid lead_time: {} (must be greater than zero)", lead)
            }
            Error::InvalidTimeResolution(res) => {
                write!(f, "Invalid time_resolution: {} ticks (must not be negative)", res)
            }
            // Lifecycle
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::SchedulerFailed(msg) => write!(f, "Frame rate timer failed: {}", msg),
            // Transport
            Error::IoError(e) => write!(f, "I/O error: {}", e),
            Error::BindFailed(msg) => write!(f, "Bind failed: {}", msg),
            Error::SendFailed(msg) => write!(f, "Send failed: {}", msg),
            // Protocol
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Error::AuthenticationFailed(msg) => write!(f, "Authentication failed: {}", msg),
            Error::CryptoError(msg) => write!(f, "Cryptographic operation failed: {}", msg),
            Error::SerializationError(msg) => write!(f, "Serialization failed: {}", msg),
            // Publication
            Error::PublishFailed(msg) => write!(f, "Publish failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e)
    }
}

/// Convenient alias for API results using the public `Error` type.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::InvalidFramesPerSecond(0).to_string(),
            "Invalid frames_per_second: 0 (must be 1-1000)"
        );
        assert_eq!(
            Error::AuthenticationFailed("bad password".into()).to_string(),
            "Authentication failed: bad password"
        );
        assert_eq!(
            Error::SendFailed("socket closed".into()).to_string(),
            "Send failed: socket closed"
        );
    }

    #[test]
    fn test_io_error_source() {
        use std::error::Error as _;

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = Error::from(io);
        assert!(err.source().is_some());
        assert!(Error::InvalidLagTime(-1.0).source().is_none());
    }
}
