// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the bridge.
//!
//! The hierarchy mirrors the recovery boundaries of the daemon: cloud-side
//! errors are absorbed by the cloud client, broker-side errors by the
//! bridge, and only [`Error::Fatal`] and [`ConfigError`] terminate the
//! process. Expected conditions (cache miss, spontaneous disconnect) are
//! not errors at all; they are modelled as `Option` returns and events.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration is structurally or semantically invalid. Fatal on
    /// startup.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A stage of the token pipeline was rejected.
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// A transient network failure (timeout, refused, DNS).
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// An MQTT protocol violation on either session.
    #[error("MQTT protocol error: {0}")]
    Mqtt(#[from] MqttError),

    /// A register frame could not be decoded.
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),

    /// A local command payload was malformed or out of range.
    #[error("invalid command: {0}")]
    Command(#[from] CommandError),

    /// An operation that requires a live session was attempted while
    /// disconnected.
    #[error("not connected")]
    NotConnected,

    /// Unrecoverable condition; the daemon exits non-zero.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Errors detected while loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// Path that was attempted.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON.
    #[error("invalid JSON in {path}: {source}")]
    Json {
        /// Path that was attempted.
        path: String,
        /// Underlying parse error.
        source: serde_json::Error,
    },

    /// A required key is absent.
    #[error("missing required key: {0}")]
    MissingKey(&'static str),

    /// A key is present but its value is unusable.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Dotted key path.
        key: &'static str,
        /// Human-readable reason.
        reason: String,
    },
}

/// Errors from the three-stage authentication pipeline.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The vendor endpoint rejected a stage (HTTP 401/403 or an error
    /// body).
    #[error("{stage} rejected: {reason}")]
    StageRejected {
        /// Pipeline stage that failed.
        stage: &'static str,
        /// Status or vendor error message.
        reason: String,
    },

    /// The vendor response did not carry the expected token field.
    #[error("{stage} response missing token")]
    MissingToken {
        /// Pipeline stage that failed.
        stage: &'static str,
    },

    /// The MQTT JWT could not be decoded to extract its expiry.
    #[error("cannot decode MQTT token expiry: {0}")]
    BadJwt(String),

    /// The broker refused the session (CONNACK return code 5).
    #[error("MQTT session not authorised (return code {0})")]
    NotAuthorised(u8),
}

/// Transient network failures. These trigger backoff, never termination.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket handshake or framing failed.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The peer sent a text frame where only binary is defined.
    #[error("unexpected text frame on WebSocket transport")]
    UnexpectedTextFrame,

    /// An operation did not complete in time.
    #[error("{operation} timed out after {seconds} s")]
    Timeout {
        /// What was being attempted.
        operation: &'static str,
        /// Configured limit.
        seconds: u64,
    },

    /// The connection was closed by the peer.
    #[error("connection closed{}", display_reason(reason.as_deref()))]
    Closed {
        /// Peer-supplied close reason, where the transport exposes one.
        reason: Option<String>,
    },
}

fn display_reason(reason: Option<&str>) -> String {
    reason.map(|r| format!(": {r}")).unwrap_or_default()
}

/// MQTT 3.1.1 protocol violations.
#[derive(Debug, Error)]
pub enum MqttError {
    /// The remaining-length field used more than four continuation bytes.
    #[error("malformed remaining-length field")]
    MalformedRemainingLength,

    /// A packet was shorter than its header declared.
    #[error("truncated packet (type 0x{packet_type:02X})")]
    TruncatedPacket {
        /// High nibble of the fixed header.
        packet_type: u8,
    },

    /// A packet type this client never expects (e.g. an inbound CONNECT).
    #[error("unexpected packet type 0x{0:02X}")]
    UnexpectedPacket(u8),

    /// A UTF-8 field (topic name) was not valid UTF-8.
    #[error("invalid UTF-8 in packet field")]
    InvalidUtf8,

    /// CONNACK carried a non-zero return code.
    #[error("connection refused by broker (return code {0})")]
    ConnectionRefused(u8),

    /// The expected CONNACK never arrived.
    #[error("no CONNACK received")]
    MissingConnAck,

    /// PINGRESP did not arrive within the keep-alive window.
    #[error("keep-alive expired without PINGRESP")]
    KeepAliveTimeout,
}

/// Register frame decoding failures. The frame is dropped and logged at
/// warn; these never propagate past the message handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than the 8-byte minimum.
    #[error("frame too short: {len} bytes")]
    TooShort {
        /// Observed length.
        len: usize,
    },

    /// The declared payload size exceeds the buffer.
    #[error("declared size {declared} exceeds buffer of {len} bytes")]
    Truncated {
        /// Bytes the header declared.
        declared: usize,
        /// Bytes actually present.
        len: usize,
    },

    /// A register-bearing frame declared zero registers.
    #[error("register count is zero")]
    EmptyRegisterCount,

    /// The payload byte count is odd and cannot hold 16-bit registers.
    #[error("odd payload byte count: {0}")]
    OddByteCount(usize),

    /// Trailing CRC does not match the frame content.
    #[error("CRC mismatch: computed {computed:#06X}, frame carries {found:#06X}")]
    CrcMismatch {
        /// CRC computed over the frame body.
        computed: u16,
        /// CRC carried by the frame.
        found: u16,
    },
}

/// Invalid local command payloads. Logged at warn; nothing is published.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The payload is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The `action` key is absent or not a string.
    #[error("missing action")]
    MissingAction,

    /// The action is outside the supported set.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// A required argument is absent for the given action.
    #[error("action {action} requires argument {argument}")]
    MissingArgument {
        /// Action name.
        action: &'static str,
        /// Missing argument name.
        argument: &'static str,
    },

    /// A numeric argument is outside the allowed range.
    #[error("{what} {actual} is out of range [{min}, {max}]")]
    OutOfRange {
        /// Which value was rejected.
        what: &'static str,
        /// Minimum allowed value.
        min: f64,
        /// Maximum allowed value.
        max: f64,
        /// The rejected value.
        actual: f64,
    },

    /// A value must come from a fixed set of legal values.
    #[error("{what} {actual} is not one of the legal values {allowed:?}")]
    NotInSet {
        /// Which value was rejected.
        what: &'static str,
        /// The legal values.
        allowed: &'static [u16],
        /// The rejected value.
        actual: u16,
    },
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_error_display() {
        let err = FrameError::TooShort { len: 7 };
        assert_eq!(err.to_string(), "frame too short: 7 bytes");
    }

    #[test]
    fn command_error_display() {
        let err = CommandError::OutOfRange {
            what: "charging current",
            min: 1.0,
            max: 20.0,
            actual: 21.0,
        };
        assert_eq!(
            err.to_string(),
            "charging current 21 is out of range [1, 20]"
        );
    }

    #[test]
    fn error_from_frame_error() {
        let err: Error = FrameError::EmptyRegisterCount.into();
        assert!(matches!(err, Error::Frame(FrameError::EmptyRegisterCount)));
    }

    #[test]
    fn network_closed_display() {
        let with_reason = NetworkError::Closed {
            reason: Some("going away".to_string()),
        };
        assert_eq!(with_reason.to_string(), "connection closed: going away");

        let without = NetworkError::Closed { reason: None };
        assert_eq!(without.to_string(), "connection closed");
    }
}
