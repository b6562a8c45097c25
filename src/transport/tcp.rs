// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Plain TCP transport; bytes pass through unchanged.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::NetworkError;

use super::{DIAL_TIMEOUT, Transport, TransportStream};

const READ_CHUNK: usize = 4096;

/// Connector for the local broker.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    host: String,
    port: u16,
}

impl TcpTransport {
    /// Creates a connector for `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> Result<Box<dyn TransportStream>, NetworkError> {
        let stream = timeout(
            DIAL_TIMEOUT,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| NetworkError::Timeout {
            operation: "TCP dial",
            seconds: DIAL_TIMEOUT.as_secs(),
        })??;
        // Small MQTT control packets should not sit in Nagle buffers.
        stream.set_nodelay(true)?;
        tracing::debug!(endpoint = %self.endpoint(), "TCP transport connected");
        Ok(Box::new(TcpStreamHandle {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }))
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

struct TcpStreamHandle {
    stream: TcpStream,
    buf: BytesMut,
}

#[async_trait]
impl TransportStream for TcpStreamHandle {
    async fn read(&mut self) -> Result<Option<Bytes>, NetworkError> {
        self.buf.reserve(READ_CHUNK);
        let n = self.stream.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf.split().freeze()))
    }

    async fn write(&mut self, buf: &[u8]) -> Result<(), NetworkError> {
        self.stream.write_all(buf).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), NetworkError> {
        self.stream.shutdown().await.or_else(ignore_not_connected)?;
        Ok(())
    }
}

fn ignore_not_connected(error: std::io::Error) -> std::io::Result<()> {
    if error.kind() == std::io::ErrorKind::NotConnected {
        Ok(())
    } else {
        Err(error)
    }
}
