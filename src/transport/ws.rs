// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! WebSocket transport for the vendor cloud.
//!
//! The cloud broker speaks MQTT wrapped in WebSocket binary frames on
//! the `/mqtt` path, negotiated with the `mqtt` sub-protocol. Text
//! frames are a protocol violation; control frames (ping, pong, close)
//! are handled here and never reach the MQTT engine.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::NetworkError;

use super::{DIAL_TIMEOUT, Transport, TransportStream};

/// Connector for the cloud MQTT endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    host: String,
    port: u16,
}

impl WebSocketTransport {
    /// Creates a connector for `ws://host:port/mqtt`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}:{}/mqtt", self.host, self.port)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<Box<dyn TransportStream>, NetworkError> {
        let mut request = self.url().into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));

        let (stream, response) = timeout(DIAL_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| NetworkError::Timeout {
                operation: "WebSocket dial",
                seconds: DIAL_TIMEOUT.as_secs(),
            })??;
        tracing::debug!(
            endpoint = %self.endpoint(),
            protocol = ?response.headers().get("Sec-WebSocket-Protocol"),
            "WebSocket transport connected"
        );
        Ok(Box::new(WsStreamHandle { inner: stream }))
    }

    fn endpoint(&self) -> String {
        self.url()
    }
}

struct WsStreamHandle {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportStream for WsStreamHandle {
    async fn read(&mut self) -> Result<Option<Bytes>, NetworkError> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Ok(Message::Binary(payload))) => return Ok(Some(payload)),
                Some(Ok(Message::Text(_))) => {
                    return Err(NetworkError::UnexpectedTextFrame);
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .filter(|f| !f.reason.is_empty())
                        .map(|f| format!("{} ({})", f.reason, f.code));
                    return match reason {
                        Some(reason) => Err(NetworkError::Closed {
                            reason: Some(reason),
                        }),
                        None => Ok(None),
                    };
                }
                // Ping replies are queued by tungstenite itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Ok(None);
                }
                Some(Err(error)) => return Err(error.into()),
            }
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<(), NetworkError> {
        self.inner
            .send(Message::Binary(Bytes::copy_from_slice(buf)))
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), NetworkError> {
        match self.inner.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    fn with_mqtt_subprotocol(
        _request: &Request,
        mut response: Response,
    ) -> Result<Response, ErrorResponse> {
        response
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));
        Ok(response)
    }

    #[test]
    fn endpoint_includes_mqtt_path() {
        let transport = WebSocketTransport::new("mqtt.example.com", 8083);
        assert_eq!(transport.endpoint(), "ws://mqtt.example.com:8083/mqtt");
    }

    #[tokio::test]
    async fn binary_frames_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_hdr_async(socket, with_mqtt_subprotocol)
                .await
                .unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Binary(payload) = message {
                    ws.send(Message::Binary(payload)).await.unwrap();
                    break;
                }
            }
        });

        let transport = WebSocketTransport::new("127.0.0.1", port);
        let mut stream = transport.connect().await.unwrap();
        stream.write(&[0xC0, 0x00]).await.unwrap();
        let echoed = stream.read().await.unwrap().unwrap();
        assert_eq!(&echoed[..], &[0xC0, 0x00]);
        stream.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn text_frame_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_hdr_async(socket, with_mqtt_subprotocol)
                .await
                .unwrap();
            ws.send(Message::Text("hello".into())).await.unwrap();
        });

        let transport = WebSocketTransport::new("127.0.0.1", port);
        let mut stream = transport.connect().await.unwrap();
        assert!(matches!(
            stream.read().await,
            Err(NetworkError::UnexpectedTextFrame)
        ));
    }
}
