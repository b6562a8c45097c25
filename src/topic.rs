// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stateless topic translation between the cloud and local namespaces.
//!
//! Cloud topics lead with the device MAC (`<MAC>/device/response/...`);
//! local topics live under the `fossibot/` prefix. The MAC is the
//! canonical key on both sides: exactly 12 hexadecimal characters, no
//! separators.

/// Local prefix for every bridge-owned topic.
pub const LOCAL_PREFIX: &str = "fossibot";

/// Retained bridge status topic (also the last-will target).
pub const BRIDGE_STATUS_TOPIC: &str = "fossibot/bridge/status";

/// Wildcard the bridge subscribes to for inbound commands.
pub const COMMAND_SUBSCRIPTION: &str = "fossibot/+/command";

/// Returns `true` when `s` is a canonical device MAC: exactly 12
/// hexadecimal characters. Case is preserved, not enforced.
#[must_use]
pub fn is_valid_mac(s: &str) -> bool {
    s.len() == 12 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Extracts the MAC from a cloud-side topic (`<MAC>/...`).
#[must_use]
pub fn extract_mac_from_cloud_topic(topic: &str) -> Option<&str> {
    let mac = topic.split('/').next()?;
    is_valid_mac(mac).then_some(mac)
}

/// Extracts the MAC from a local topic (`fossibot/<MAC>/...`).
#[must_use]
pub fn extract_mac_from_broker_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    if parts.next()? != LOCAL_PREFIX {
        return None;
    }
    let mac = parts.next()?;
    is_valid_mac(mac).then_some(mac)
}

/// Maps a cloud device-response topic to the local state topic.
///
/// Recognises the command acknowledgement (`.../client/04`), the data
/// response (`.../client/data`) and the spontaneous state push
/// (`.../device/response/state`). Returns `None` for anything else.
#[must_use]
pub fn cloud_to_broker(topic: &str) -> Option<String> {
    let mac = extract_mac_from_cloud_topic(topic)?;
    let rest = &topic[mac.len()..];
    matches!(
        rest,
        "/device/response/client/04" | "/device/response/client/data" | "/device/response/state"
    )
    .then(|| state_topic(mac))
}

/// Maps a local command topic to the cloud request topic.
#[must_use]
pub fn broker_to_cloud(topic: &str) -> Option<String> {
    let mac = extract_mac_from_broker_topic(topic)?;
    let rest = &topic[LOCAL_PREFIX.len() + 1 + mac.len()..];
    (rest == "/command").then(|| command_request_topic(mac))
}

/// Whether a cloud topic is the command acknowledgement channel.
#[must_use]
pub fn is_command_ack_topic(topic: &str) -> bool {
    topic.ends_with("/device/response/client/04")
}

/// Local state topic for a device.
#[must_use]
pub fn state_topic(mac: &str) -> String {
    format!("{LOCAL_PREFIX}/{mac}/state")
}

/// Local retained availability topic for a device.
#[must_use]
pub fn availability_topic(mac: &str) -> String {
    format!("{LOCAL_PREFIX}/{mac}/availability")
}

/// Cloud topic commands are published to.
#[must_use]
pub fn command_request_topic(mac: &str) -> String {
    format!("{mac}/client/request/data")
}

/// The two cloud subscriptions required per device.
#[must_use]
pub fn device_subscriptions(mac: &str) -> [String; 2] {
    [
        format!("{mac}/device/response/client/+"),
        format!("{mac}/device/response/state"),
    ]
}
