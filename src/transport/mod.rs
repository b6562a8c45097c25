// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-stream transports underneath the MQTT engine.
//!
//! The engine only needs a connector that yields an ordered stream of
//! opaque byte chunks. Two implementations exist: a raw TCP socket for
//! the local broker and a WebSocket carrying one MQTT fragment per
//! binary frame for the vendor cloud. Both dial with a 10 s timeout and
//! never block the runtime.

mod tcp;
mod ws;

pub use tcp::TcpTransport;
pub use ws::WebSocketTransport;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::NetworkError;

/// How long a transport may spend establishing a connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A connector producing fresh byte streams.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dials the peer and returns a live stream.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError`] on dial failure or timeout.
    async fn connect(&self) -> Result<Box<dyn TransportStream>, NetworkError>;

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> String;
}

/// A live byte stream.
#[async_trait]
pub trait TransportStream: Send {
    /// Waits for the next chunk of bytes.
    ///
    /// Returns `Ok(None)` on an orderly close without a stated reason.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Closed`] when the peer supplied a close
    /// reason, or the underlying failure otherwise.
    async fn read(&mut self) -> Result<Option<Bytes>, NetworkError>;

    /// Writes one chunk. WebSocket streams wrap each call in a single
    /// binary frame.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError`] on write failure.
    async fn write(&mut self, buf: &[u8]) -> Result<(), NetworkError>;

    /// Closes the stream. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError`] only on unexpected teardown failures.
    async fn close(&mut self) -> Result<(), NetworkError>;
}
