// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT 3.1.1 packet encoding and decoding.
//!
//! Only the packets this client exchanges are modelled: CONNECT,
//! CONNACK, PUBLISH, PUBACK, SUBSCRIBE, SUBACK, PINGREQ, PINGRESP and
//! DISCONNECT. The decoder accumulates raw transport chunks and slices
//! packets on the variable-length remaining-length field.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::MqttError;

/// Protocol name carried in CONNECT.
const PROTOCOL_NAME: &str = "MQTT";
/// Protocol level 4 = MQTT 3.1.1.
const PROTOCOL_LEVEL: u8 = 4;

/// Quality of service for outbound traffic. This client never publishes
/// or subscribes at QoS 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// Acknowledged delivery.
    AtLeastOnce,
}

impl QoS {
    #[must_use]
    pub(crate) fn bits(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
        }
    }
}

/// A will message registered at connect time.
#[derive(Debug, Clone)]
pub struct LastWill {
    /// Topic the broker publishes to on ungraceful disconnect.
    pub topic: String,
    /// Will payload.
    pub payload: Bytes,
    /// Will QoS.
    pub qos: QoS,
    /// Whether the will is retained.
    pub retain: bool,
}

/// Inbound packets the engine reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Connection acknowledgement.
    ConnAck {
        /// Whether the broker resumed a previous session.
        session_present: bool,
        /// 0 = accepted; 5 = not authorised.
        return_code: u8,
    },
    /// An application message.
    Publish {
        /// Topic name, verbatim.
        topic: String,
        /// Payload, verbatim.
        payload: Bytes,
        /// Delivery QoS (0–2 on the wire).
        qos: u8,
        /// Present when `qos > 0`.
        packet_id: Option<u16>,
    },
    /// Acknowledgement of an outbound QoS 1 publish.
    PubAck {
        /// Identifier of the acknowledged publish.
        packet_id: u16,
    },
    /// Subscription acknowledgement.
    SubAck {
        /// Identifier of the acknowledged subscribe.
        packet_id: u16,
        /// Granted QoS per filter; `0x80` marks a failure.
        return_codes: Vec<u8>,
    },
    /// Keep-alive probe (only ever sent by this client; decoded for
    /// completeness).
    PingReq,
    /// Keep-alive answer.
    PingResp,
}

/// Encodes a CONNECT packet.
#[must_use]
pub fn encode_connect(
    client_id: &str,
    username: Option<&str>,
    password: Option<&str>,
    keep_alive_secs: u16,
    clean_session: bool,
    last_will: Option<&LastWill>,
) -> Bytes {
    let mut body = BytesMut::new();
    put_utf8(&mut body, PROTOCOL_NAME);
    body.put_u8(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if clean_session {
        flags |= 0x02;
    }
    if let Some(will) = last_will {
        flags |= 0x04 | (will.qos.bits() << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if password.is_some() {
        flags |= 0x40;
    }
    if username.is_some() {
        flags |= 0x80;
    }
    body.put_u8(flags);
    body.put_u16(keep_alive_secs);

    put_utf8(&mut body, client_id);
    if let Some(will) = last_will {
        put_utf8(&mut body, &will.topic);
        put_binary(&mut body, &will.payload);
    }
    if let Some(username) = username {
        put_utf8(&mut body, username);
    }
    if let Some(password) = password {
        put_utf8(&mut body, password);
    }

    finish(0x10, &body)
}

/// Encodes a PUBLISH packet. `packet_id` must be set iff `qos` is
/// [`QoS::AtLeastOnce`].
#[must_use]
pub fn encode_publish(
    topic: &str,
    payload: &[u8],
    qos: QoS,
    retain: bool,
    packet_id: Option<u16>,
) -> Bytes {
    let mut body = BytesMut::new();
    put_utf8(&mut body, topic);
    if qos == QoS::AtLeastOnce
        && let Some(id) = packet_id
    {
        body.put_u16(id);
    }
    body.put_slice(payload);

    let mut first = 0x30 | (qos.bits() << 1);
    if retain {
        first |= 0x01;
    }
    finish(first, &body)
}

/// Encodes a SUBSCRIBE packet for a single topic filter.
#[must_use]
pub fn encode_subscribe(packet_id: u16, topic: &str, qos: QoS) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u16(packet_id);
    put_utf8(&mut body, topic);
    body.put_u8(qos.bits());
    finish(0x82, &body)
}

/// Encodes a PUBACK packet.
#[must_use]
pub fn encode_puback(packet_id: u16) -> Bytes {
    Bytes::from(vec![0x40, 0x02, (packet_id >> 8) as u8, (packet_id & 0xFF) as u8])
}

/// Encodes a PINGREQ packet.
#[must_use]
pub fn encode_pingreq() -> Bytes {
    Bytes::from_static(&[0xC0, 0x00])
}

/// Encodes a DISCONNECT packet.
#[must_use]
pub fn encode_disconnect() -> Bytes {
    Bytes::from_static(&[0xE0, 0x00])
}

fn put_utf8(buf: &mut BytesMut, s: &str) {
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_binary(buf: &mut BytesMut, data: &[u8]) {
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
}

/// Prepends the fixed header and remaining-length field.
fn finish(first_byte: u8, body: &[u8]) -> Bytes {
    let mut packet = BytesMut::with_capacity(body.len() + 5);
    packet.put_u8(first_byte);
    let mut remaining = body.len();
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        packet.put_u8(byte);
        if remaining == 0 {
            break;
        }
    }
    packet.put_slice(body);
    packet.freeze()
}

/// Accumulates transport chunks and yields whole packets.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buf: BytesMut,
}

impl PacketDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Attempts to slice and parse the next packet.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a whole
    /// packet.
    ///
    /// # Errors
    ///
    /// Returns [`MqttError`] on framing violations; the connection must
    /// be torn down, the buffer is no longer trustworthy.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, MqttError> {
        let Some((remaining_len, header_len)) = self.peek_remaining_length()? else {
            return Ok(None);
        };
        let total = header_len + remaining_len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let mut packet = self.buf.split_to(total).freeze();
        let first = packet[0];
        packet.advance(header_len);
        parse_packet(first, packet).map(Some)
    }

    /// Decodes the remaining-length varint without consuming. Returns
    /// the value and the total header size (fixed byte + varint bytes).
    fn peek_remaining_length(&self) -> Result<Option<(usize, usize)>, MqttError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let mut value: usize = 0;
        let mut shift = 0u32;
        for (i, &byte) in self.buf[1..].iter().enumerate() {
            if i >= 4 {
                return Err(MqttError::MalformedRemainingLength);
            }
            value |= usize::from(byte & 0x7F) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(Some((value, 2 + i)));
            }
        }
        // Continuation bit still set at the end of the buffer.
        if self.buf.len() >= 5 {
            return Err(MqttError::MalformedRemainingLength);
        }
        Ok(None)
    }
}

fn parse_packet(first: u8, mut body: Bytes) -> Result<Packet, MqttError> {
    let packet_type = first >> 4;
    match packet_type {
        2 => {
            if body.len() < 2 {
                return Err(MqttError::TruncatedPacket { packet_type });
            }
            Ok(Packet::ConnAck {
                session_present: body[0] & 0x01 != 0,
                return_code: body[1],
            })
        }
        3 => {
            let qos = (first >> 1) & 0x03;
            if qos == 3 {
                return Err(MqttError::UnexpectedPacket(first));
            }
            let topic = take_utf8(&mut body, packet_type)?;
            let packet_id = if qos > 0 {
                if body.len() < 2 {
                    return Err(MqttError::TruncatedPacket { packet_type });
                }
                Some(body.get_u16())
            } else {
                None
            };
            Ok(Packet::Publish {
                topic,
                payload: body,
                qos,
                packet_id,
            })
        }
        4 => {
            if body.len() < 2 {
                return Err(MqttError::TruncatedPacket { packet_type });
            }
            Ok(Packet::PubAck {
                packet_id: body.get_u16(),
            })
        }
        9 => {
            if body.len() < 2 {
                return Err(MqttError::TruncatedPacket { packet_type });
            }
            let packet_id = body.get_u16();
            Ok(Packet::SubAck {
                packet_id,
                return_codes: body.to_vec(),
            })
        }
        12 => Ok(Packet::PingReq),
        13 => Ok(Packet::PingResp),
        _ => Err(MqttError::UnexpectedPacket(packet_type)),
    }
}

fn take_utf8(body: &mut Bytes, packet_type: u8) -> Result<String, MqttError> {
    if body.len() < 2 {
        return Err(MqttError::TruncatedPacket { packet_type });
    }
    let len = usize::from(body.get_u16());
    if body.len() < len {
        return Err(MqttError::TruncatedPacket { packet_type });
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| MqttError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> Packet {
        let mut decoder = PacketDecoder::new();
        decoder.feed(bytes);
        decoder.next_packet().unwrap().unwrap()
    }

    #[test]
    fn connect_packet_layout() {
        let packet = encode_connect("bridge", Some("jwt"), Some("helloyou"), 30, true, None);
        assert_eq!(packet[0], 0x10);
        // Variable header: "MQTT", level 4, flags, keep-alive 30.
        assert_eq!(&packet[2..8], &[0x00, 0x04, b'M', b'Q', b'T', b'T']);
        assert_eq!(packet[8], 4);
        assert_eq!(packet[9], 0x02 | 0x40 | 0x80);
        assert_eq!(u16::from_be_bytes([packet[10], packet[11]]), 30);
    }

    #[test]
    fn connect_packet_with_will() {
        let will = LastWill {
            topic: "fossibot/bridge/status".to_string(),
            payload: Bytes::from_static(b"offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        let packet = encode_connect("bridge", None, None, 30, true, Some(&will));
        // clean session + will flag + will qos 1 + will retain.
        assert_eq!(packet[9], 0x02 | 0x04 | 0x08 | 0x20);
    }

    #[test]
    fn connack_parses() {
        let packet = decode_one(&[0x20, 0x02, 0x00, 0x00]);
        assert_eq!(
            packet,
            Packet::ConnAck {
                session_present: false,
                return_code: 0
            }
        );
    }

    #[test]
    fn connack_not_authorised() {
        let packet = decode_one(&[0x20, 0x02, 0x00, 0x05]);
        assert!(matches!(packet, Packet::ConnAck { return_code: 5, .. }));
    }

    #[test]
    fn publish_qos0_parses() {
        let mut bytes = vec![0x30, 0x00];
        let topic = b"a/b";
        bytes[1] = (2 + topic.len() + 4) as u8;
        bytes.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        bytes.extend_from_slice(topic);
        bytes.extend_from_slice(&[1, 2, 3, 4]);

        match decode_one(&bytes) {
            Packet::Publish {
                topic,
                payload,
                qos,
                packet_id,
            } => {
                assert_eq!(topic, "a/b");
                assert_eq!(&payload[..], &[1, 2, 3, 4]);
                assert_eq!(qos, 0);
                assert_eq!(packet_id, None);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn publish_qos1_carries_packet_id() {
        let mut bytes = vec![0x32, 0x00];
        let topic = b"t";
        bytes[1] = (2 + topic.len() + 2 + 2) as u8;
        bytes.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        bytes.extend_from_slice(topic);
        bytes.extend_from_slice(&0x1234u16.to_be_bytes());
        bytes.extend_from_slice(&[0xAB, 0xCD]);

        match decode_one(&bytes) {
            Packet::Publish { packet_id, qos, .. } => {
                assert_eq!(qos, 1);
                assert_eq!(packet_id, Some(0x1234));
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn publish_round_trips_through_decoder() {
        let encoded = encode_publish("fossibot/AA/state", b"{}", QoS::AtMostOnce, false, None);
        match decode_one(&encoded) {
            Packet::Publish { topic, payload, .. } => {
                assert_eq!(topic, "fossibot/AA/state");
                assert_eq!(&payload[..], b"{}");
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn suback_parses_return_codes() {
        let packet = decode_one(&[0x90, 0x04, 0x00, 0x07, 0x00, 0x01]);
        assert_eq!(
            packet,
            Packet::SubAck {
                packet_id: 7,
                return_codes: vec![0x00, 0x01]
            }
        );
    }

    #[test]
    fn pingresp_parses() {
        assert_eq!(decode_one(&[0xD0, 0x00]), Packet::PingResp);
    }

    #[test]
    fn partial_feeds_accumulate() {
        let encoded = encode_publish("topic/x", b"payload", QoS::AtMostOnce, false, None);
        let mut decoder = PacketDecoder::new();
        for &byte in &encoded[..encoded.len() - 1] {
            decoder.feed(&[byte]);
            assert!(decoder.next_packet().unwrap().is_none());
        }
        decoder.feed(&[encoded[encoded.len() - 1]]);
        assert!(decoder.next_packet().unwrap().is_some());
    }

    #[test]
    fn two_packets_in_one_chunk() {
        let mut bytes = encode_pingreq().to_vec();
        bytes.extend_from_slice(&[0xD0, 0x00]);
        let mut decoder = PacketDecoder::new();
        decoder.feed(&bytes);
        assert_eq!(decoder.next_packet().unwrap(), Some(Packet::PingReq));
        assert_eq!(decoder.next_packet().unwrap(), Some(Packet::PingResp));
        assert_eq!(decoder.next_packet().unwrap(), None);
    }

    #[test]
    fn remaining_length_two_bytes() {
        // 321 bytes encodes as [0xC1, 0x02].
        let payload = vec![0u8; 321 - 2 - 5];
        let encoded = encode_publish("abc", &payload, QoS::AtMostOnce, false, None);
        assert_eq!(encoded[1] & 0x80, 0x80);
        let mut decoder = PacketDecoder::new();
        decoder.feed(&encoded);
        assert!(decoder.next_packet().unwrap().is_some());
    }

    #[test]
    fn malformed_remaining_length_is_rejected() {
        let mut decoder = PacketDecoder::new();
        decoder.feed(&[0x30, 0x80, 0x80, 0x80, 0x80, 0x80]);
        assert!(matches!(
            decoder.next_packet(),
            Err(MqttError::MalformedRemainingLength)
        ));
    }

    #[test]
    fn unexpected_packet_type_is_rejected() {
        let mut decoder = PacketDecoder::new();
        // Packet type 5 (PUBREC) is outside this client's set.
        decoder.feed(&[0x50, 0x02, 0x00, 0x01]);
        assert!(matches!(
            decoder.next_packet(),
            Err(MqttError::UnexpectedPacket(5))
        ));
    }

    #[test]
    fn disconnect_is_two_bytes() {
        assert_eq!(&encode_disconnect()[..], &[0xE0, 0x00]);
    }

    #[test]
    fn puback_layout() {
        assert_eq!(&encode_puback(0x0102)[..], &[0x40, 0x02, 0x01, 0x02]);
    }

    #[test]
    fn subscribe_layout() {
        let packet = encode_subscribe(1, "AA/device/response/state", QoS::AtMostOnce);
        assert_eq!(packet[0], 0x82);
        // Packet id follows the remaining-length byte.
        assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), 1);
        // Final byte is the requested QoS.
        assert_eq!(packet[packet.len() - 1], 0);
    }
}
