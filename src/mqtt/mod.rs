// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal MQTT 3.1.1 client: packet codec and connection engine.

mod engine;
mod packet;

pub use engine::{EngineEvent, EngineOptions, MqttEngine, connect};
pub use packet::{LastWill, Packet, PacketDecoder, QoS};
