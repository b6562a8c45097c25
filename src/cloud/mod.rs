// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Vendor cloud access: authentication, discovery, MQTT supervision.

mod api;
mod auth;
mod client;

pub use api::{Device, fetch_device_list};
pub use auth::{AuthPipeline, CachedTokenPair, TokenSet};
pub use client::{
    CLOUD_MQTT_HOST, CLOUD_MQTT_PORT, CloudClient, CloudClientOptions, CloudEvent,
    cloud_transport,
};
