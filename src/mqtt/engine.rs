// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asynchronous MQTT 3.1.1 client engine over a [`Transport`].
//!
//! Connection lifecycle:
//!
//! ```text
//! connect() --transport dial--> CONNECT sent
//!     --CONNACK rc=0-->  engine task running, handle returned
//!     --CONNACK rc!=0--> error (rc=5 marks an authorisation failure)
//! running --close/error/keep-alive loss--> Disconnected event, task ends
//! ```
//!
//! The engine owns the stream inside a single task; callers drive it
//! through an [`MqttEngine`] handle and consume [`EngineEvent`]s. The
//! caller decides whether to reconnect; the engine never does so itself.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, interval, timeout};

use crate::error::{Error, MqttError};
use crate::transport::{Transport, TransportStream};

use super::packet::{
    LastWill, Packet, PacketDecoder, QoS, encode_connect, encode_disconnect, encode_pingreq,
    encode_puback, encode_publish, encode_subscribe,
};

/// How long to wait for CONNACK after the transport is up.
const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);
/// Command channel depth; publishes beyond this apply backpressure.
const COMMAND_QUEUE: usize = 64;
/// Event channel depth towards the owner.
const EVENT_QUEUE: usize = 256;

/// Session parameters for [`connect`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Client identifier sent in CONNECT.
    pub client_id: String,
    /// Optional username.
    pub username: Option<String>,
    /// Optional password.
    pub password: Option<String>,
    /// Keep-alive interval; PINGREQ fires after half of it idle.
    pub keep_alive: Duration,
    /// Clean-session flag.
    pub clean_session: bool,
    /// Optional will message.
    pub last_will: Option<LastWill>,
    /// Reply PUBACK to inbound QoS 1 publishes. Off by default; the
    /// vendor broker does not currently expect it.
    pub ack_inbound_publish: bool,
}

impl EngineOptions {
    /// Options with the protocol defaults: 30 s keep-alive, clean
    /// session, no credentials, no will.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            clean_session: true,
            last_will: None,
            ack_inbound_publish: false,
        }
    }
}

/// Events emitted by a running engine.
#[derive(Debug)]
pub enum EngineEvent {
    /// An inbound PUBLISH; topic and payload verbatim.
    Message {
        /// Topic name.
        topic: String,
        /// Raw payload.
        payload: Bytes,
    },
    /// The session ended. The engine task is gone afterwards.
    Disconnected {
        /// Close reason, when one is known.
        reason: Option<String>,
    },
}

enum EngineCommand {
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        done: oneshot::Sender<Result<(), Error>>,
    },
    Subscribe {
        topic: String,
        qos: QoS,
        done: oneshot::Sender<Result<(), Error>>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a running MQTT session.
///
/// Dropping the handle tears the session down without a DISCONNECT
/// packet; call [`MqttEngine::disconnect`] for a graceful close.
#[derive(Debug, Clone)]
pub struct MqttEngine {
    commands: mpsc::Sender<EngineCommand>,
}

impl MqttEngine {
    /// Publishes a message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] when the session is gone, or the
    /// write failure that ended it.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Error> {
        let (done, result) = oneshot::channel();
        self.commands
            .send(EngineCommand::Publish {
                topic: topic.into(),
                payload: payload.into(),
                qos,
                retain,
                done,
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        result.await.map_err(|_| Error::NotConnected)?
    }

    /// Subscribes to a topic filter and waits for the SUBACK.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] when the session ends before the
    /// acknowledgement, or [`MqttError`] when the broker refuses the
    /// subscription.
    pub async fn subscribe(&self, topic: impl Into<String>, qos: QoS) -> Result<(), Error> {
        let (done, result) = oneshot::channel();
        self.commands
            .send(EngineCommand::Subscribe {
                topic: topic.into(),
                qos,
                done,
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        result.await.map_err(|_| Error::NotConnected)?
    }

    /// Sends DISCONNECT and closes the transport. Idempotent: calling
    /// on a dead session is a no-op.
    pub async fn disconnect(&self) {
        let (done, finished) = oneshot::channel();
        if self
            .commands
            .send(EngineCommand::Disconnect { done })
            .await
            .is_ok()
        {
            let _ = finished.await;
        }
    }

    /// Whether the engine task is still alive.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Dials the transport, performs the CONNECT/CONNACK handshake and
/// spawns the engine task.
///
/// # Errors
///
/// Returns [`Error::Network`] on dial failure, [`MqttError::MissingConnAck`]
/// when the broker closes early, and [`MqttError::ConnectionRefused`]
/// carrying the CONNACK return code when the broker rejects the session.
pub async fn connect(
    transport: &dyn Transport,
    options: EngineOptions,
) -> Result<(MqttEngine, mpsc::Receiver<EngineEvent>), Error> {
    let mut stream = transport.connect().await?;
    let connect_packet = encode_connect(
        &options.client_id,
        options.username.as_deref(),
        options.password.as_deref(),
        keep_alive_secs(options.keep_alive),
        options.clean_session,
        options.last_will.as_ref(),
    );
    stream.write(&connect_packet).await?;

    let mut decoder = PacketDecoder::new();
    let connack = timeout(CONNACK_TIMEOUT, wait_for_connack(&mut stream, &mut decoder))
        .await
        .map_err(|_| {
            Error::Network(crate::error::NetworkError::Timeout {
                operation: "CONNACK wait",
                seconds: CONNACK_TIMEOUT.as_secs(),
            })
        })??;

    match connack {
        Packet::ConnAck {
            return_code: 0,
            session_present,
        } => {
            tracing::debug!(
                client_id = %options.client_id,
                endpoint = %transport.endpoint(),
                session_present,
                "MQTT session established"
            );
        }
        Packet::ConnAck { return_code, .. } => {
            let _ = stream.close().await;
            return Err(Error::Mqtt(MqttError::ConnectionRefused(return_code)));
        }
        other => {
            let _ = stream.close().await;
            tracing::warn!(?other, "Expected CONNACK, got different packet");
            return Err(Error::Mqtt(MqttError::MissingConnAck));
        }
    }

    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
    tokio::spawn(run_engine(stream, decoder, options, command_rx, event_tx));

    Ok((MqttEngine { commands: command_tx }, event_rx))
}

#[allow(clippy::cast_possible_truncation)]
fn keep_alive_secs(keep_alive: Duration) -> u16 {
    keep_alive.as_secs().min(u64::from(u16::MAX)) as u16
}

async fn wait_for_connack(
    stream: &mut Box<dyn TransportStream>,
    decoder: &mut PacketDecoder,
) -> Result<Packet, Error> {
    loop {
        if let Some(packet) = decoder.next_packet()? {
            return Ok(packet);
        }
        match stream.read().await? {
            Some(chunk) => decoder.feed(&chunk),
            None => return Err(Error::Mqtt(MqttError::MissingConnAck)),
        }
    }
}

struct EngineState {
    stream: Box<dyn TransportStream>,
    decoder: PacketDecoder,
    options: EngineOptions,
    events: mpsc::Sender<EngineEvent>,
    pending_subscribes: HashMap<u16, oneshot::Sender<Result<(), Error>>>,
    next_packet_id: u16,
    last_write: Instant,
    ping_sent_at: Option<Instant>,
}

impl EngineState {
    /// Allocates the next packet identifier, wrapping 1..65535 and
    /// skipping 0.
    fn next_id(&mut self) -> u16 {
        self.next_packet_id = match self.next_packet_id {
            u16::MAX => 1,
            n => n + 1,
        };
        self.next_packet_id
    }

    async fn write(&mut self, packet: &[u8]) -> Result<(), Error> {
        self.stream.write(packet).await?;
        self.last_write = Instant::now();
        Ok(())
    }
}

async fn run_engine(
    stream: Box<dyn TransportStream>,
    decoder: PacketDecoder,
    options: EngineOptions,
    mut commands: mpsc::Receiver<EngineCommand>,
    events: mpsc::Sender<EngineEvent>,
) {
    let keep_alive = options.keep_alive;
    let mut state = EngineState {
        stream,
        decoder,
        options,
        events,
        pending_subscribes: HashMap::new(),
        next_packet_id: 0,
        last_write: Instant::now(),
        ping_sent_at: None,
    };

    let mut ping_ticker = interval((keep_alive / 2).max(Duration::from_secs(1)));
    ping_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_ticker.reset();

    // Resolve the select into a plain value first; the handlers below
    // need the whole state mutably.
    enum Step {
        Command(Option<EngineCommand>),
        Chunk(Result<Option<Bytes>, crate::error::NetworkError>),
        Tick,
    }

    let reason = loop {
        let step = tokio::select! {
            command = commands.recv() => Step::Command(command),
            chunk = state.stream.read() => Step::Chunk(chunk),
            _ = ping_ticker.tick() => Step::Tick,
        };

        match step {
            Step::Command(Some(command)) => {
                if let Some(reason) = handle_command(&mut state, command).await {
                    break reason;
                }
            }
            // Handle dropped: tear down silently.
            Step::Command(None) => break ExitReason::HandleDropped,
            Step::Chunk(Ok(Some(data))) => {
                state.decoder.feed(&data);
                if let Some(reason) = drain_packets(&mut state).await {
                    break reason;
                }
            }
            Step::Chunk(Ok(None)) => break ExitReason::Closed(None),
            Step::Chunk(Err(error)) => break ExitReason::Closed(Some(error.to_string())),
            Step::Tick => {
                if let Some(sent_at) = state.ping_sent_at {
                    if sent_at.elapsed() >= keep_alive {
                        break ExitReason::Closed(Some(
                            MqttError::KeepAliveTimeout.to_string(),
                        ));
                    }
                } else if state.last_write.elapsed() >= keep_alive / 2 {
                    if let Err(error) = state.write(&encode_pingreq()).await {
                        break ExitReason::Closed(Some(error.to_string()));
                    }
                    state.ping_sent_at = Some(Instant::now());
                }
            }
        }
    };

    let _ = state.stream.close().await;
    state.pending_subscribes.clear();

    match reason {
        ExitReason::HandleDropped => {}
        ExitReason::Graceful => {
            let _ = state
                .events
                .send(EngineEvent::Disconnected { reason: None })
                .await;
        }
        ExitReason::Closed(reason) => {
            tracing::debug!(?reason, "MQTT session ended");
            let _ = state
                .events
                .send(EngineEvent::Disconnected { reason })
                .await;
        }
    }
}

enum ExitReason {
    /// Caller asked for DISCONNECT.
    Graceful,
    /// The handle was dropped; nobody is listening.
    HandleDropped,
    /// Transport or protocol failure.
    Closed(Option<String>),
}

async fn handle_command(state: &mut EngineState, command: EngineCommand) -> Option<ExitReason> {
    match command {
        EngineCommand::Publish {
            topic,
            payload,
            qos,
            retain,
            done,
        } => {
            let packet_id = (qos == QoS::AtLeastOnce).then(|| state.next_id());
            let packet = encode_publish(&topic, &payload, qos, retain, packet_id);
            let result = state.write(&packet).await;
            let failed = result.is_err();
            let _ = done.send(result);
            if failed {
                return Some(ExitReason::Closed(Some("publish write failed".to_string())));
            }
        }
        EngineCommand::Subscribe { topic, qos, done } => {
            let packet_id = state.next_id();
            let packet = encode_subscribe(packet_id, &topic, qos);
            match state.write(&packet).await {
                Ok(()) => {
                    state.pending_subscribes.insert(packet_id, done);
                }
                Err(error) => {
                    let _ = done.send(Err(error));
                    return Some(ExitReason::Closed(Some(
                        "subscribe write failed".to_string(),
                    )));
                }
            }
        }
        EngineCommand::Disconnect { done } => {
            let _ = state.write(&encode_disconnect()).await;
            let _ = done.send(());
            return Some(ExitReason::Graceful);
        }
    }
    None
}

async fn drain_packets(state: &mut EngineState) -> Option<ExitReason> {
    loop {
        match state.decoder.next_packet() {
            Ok(Some(packet)) => {
                if let Some(reason) = handle_packet(state, packet).await {
                    return Some(reason);
                }
            }
            Ok(None) => return None,
            Err(error) => {
                tracing::warn!(%error, "MQTT framing error, closing session");
                return Some(ExitReason::Closed(Some(error.to_string())));
            }
        }
    }
}

async fn handle_packet(state: &mut EngineState, packet: Packet) -> Option<ExitReason> {
    match packet {
        Packet::Publish {
            topic,
            payload,
            qos,
            packet_id,
        } => {
            if qos == 1
                && state.options.ack_inbound_publish
                && let Some(id) = packet_id
                && let Err(error) = state.write(&encode_puback(id)).await
            {
                return Some(ExitReason::Closed(Some(error.to_string())));
            }
            // Delivered verbatim; the engine does not parse topics.
            if state
                .events
                .send(EngineEvent::Message { topic, payload })
                .await
                .is_err()
            {
                return Some(ExitReason::HandleDropped);
            }
        }
        Packet::SubAck {
            packet_id,
            return_codes,
        } => match state.pending_subscribes.remove(&packet_id) {
            Some(done) => {
                let rejected = return_codes.iter().any(|&code| code == 0x80);
                let result = if rejected {
                    Err(Error::Mqtt(MqttError::ConnectionRefused(0x80)))
                } else {
                    Ok(())
                };
                let _ = done.send(result);
            }
            None => {
                tracing::warn!(packet_id, "Unmatched SUBACK, dropping");
            }
        },
        Packet::PubAck { packet_id } => {
            // Outbound QoS 1 correlation is not tracked; log and move on.
            tracing::trace!(packet_id, "PUBACK received");
        }
        Packet::PingResp => {
            state.ping_sent_at = None;
        }
        Packet::PingReq | Packet::ConnAck { .. } => {
            let error = MqttError::UnexpectedPacket(match packet {
                Packet::PingReq => 12,
                _ => 2,
            });
            tracing::warn!(%error, "Unexpected packet mid-session, closing");
            return Some(ExitReason::Closed(Some(error.to_string())));
        }
    }
    None
}
