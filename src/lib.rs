// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fossibot MQTT bridge.
//!
//! A long-running daemon that connects Fossibot power stations, which
//! are only reachable through the vendor's authenticated
//! MQTT-over-WebSocket cloud, to a local MQTT broker. Home-automation
//! consumers observe device state as JSON on `fossibot/<MAC>/state` and
//! issue JSON commands on `fossibot/<MAC>/command`; the bridge handles
//! authentication, discovery, binary register frames and reconnection.
//!
//! # Architecture
//!
//! ```text
//! vendor cloud (MQTT over WebSocket)          local broker (MQTT over TCP)
//!        │                                            ▲
//!   CloudClient ──frames──► Bridge ──state JSON──► MqttEngine
//!        ▲                    │  ▲
//!        └──register writes───┘  └── command JSON from consumers
//! ```
//!
//! One [`cloud::CloudClient`] per configured account owns an
//! [`mqtt::MqttEngine`] bound to a WebSocket transport and survives
//! token expiry and network loss through a three-tier reconnect
//! strategy. The [`bridge::Bridge`] owns the event loop, the local
//! broker session, the per-device [`state::StateStore`] and all timers.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::path::Path;
//!
//! use fossibot_bridge::bridge::Bridge;
//! use fossibot_bridge::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> fossibot_bridge::Result<()> {
//!     let config = Config::load(Path::new("/etc/fossibot/config.json"))?;
//!     Bridge::run(config).await
//! }
//! ```

pub mod bridge;
pub mod cache;
pub mod cloud;
pub mod command;
pub mod config;
pub mod error;
pub mod modbus;
pub mod mqtt;
pub mod payload;
pub mod state;
pub mod topic;
pub mod transport;

pub use command::{Command, ResponseClass};
pub use config::Config;
pub use error::{
    AuthError, CommandError, ConfigError, Error, FrameError, MqttError, NetworkError, Result,
};
pub use state::{DeviceState, StateStore};
