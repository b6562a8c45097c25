// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device discovery against the vendor cloud.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::Error;

use super::auth::{AuthPipeline, TokenSet};

/// Page size for the device list request.
const PAGE_SIZE: u64 = 100;
/// Hard cap on pages, in case the endpoint misreports totals.
const MAX_PAGES: u64 = 32;

/// A discovered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Canonical MAC: 12 uppercase hex digits, no separators.
    pub mac: String,
    /// Human-readable name from the vendor account.
    pub name: String,
    /// Product model.
    pub model: String,
    /// Online flag as reported at discovery time.
    pub online: bool,
    /// Creation time as reported by the vendor, when present.
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Device {
    /// Normalises a vendor device id to the canonical MAC form: strips
    /// `:` and `-` separators, uppercases, and requires exactly 12 hex
    /// digits. Returns `None` for anything else.
    #[must_use]
    pub fn canonical_mac(raw: &str) -> Option<String> {
        let cleaned: String = raw
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect::<String>()
            .to_uppercase();
        (cleaned.len() == 12 && cleaned.bytes().all(|b| b.is_ascii_hexdigit()))
            .then_some(cleaned)
    }
}

/// Fetches the full device list for the account, walking pages until
/// the reported total is covered.
///
/// # Errors
///
/// Returns [`Error`] on gateway rejection or transient network failure.
pub async fn fetch_device_list(
    auth: &AuthPipeline,
    tokens: &TokenSet,
) -> Result<Vec<Device>, Error> {
    let mut devices = Vec::new();
    let mut page = 1u64;

    loop {
        let response = auth
            .invoke(
                "client/api/device/list",
                json!({ "pageIndex": page, "pageSize": PAGE_SIZE }),
                Some(&tokens.login.token),
            )
            .await?;

        let rows = response
            .pointer("/data/rows")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total = response
            .pointer("/data/total")
            .and_then(Value::as_u64)
            .unwrap_or(rows.len() as u64);

        let received = rows.len();
        for row in &rows {
            match parse_device(row) {
                Some(device) => devices.push(device),
                None => {
                    tracing::warn!(?row, "Skipping device row without a usable MAC");
                }
            }
        }

        let done = received == 0 || devices.len() as u64 >= total || page >= MAX_PAGES;
        if done {
            break;
        }
        page += 1;
    }

    tracing::info!(count = devices.len(), "Device discovery complete");
    Ok(devices)
}

fn parse_device(row: &Value) -> Option<Device> {
    let raw_id = row
        .get("device_id")
        .or_else(|| row.get("deviceId"))
        .and_then(Value::as_str)?;
    let mac = Device::canonical_mac(raw_id)?;
    let name = row
        .get("device_name")
        .or_else(|| row.get("deviceName"))
        .and_then(Value::as_str)
        .unwrap_or(&mac)
        .to_string();
    let model = row
        .get("model")
        .or_else(|| row.get("product_name"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let online = row
        .get("is_online")
        .or_else(|| row.get("online"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let created_at = row
        .get("create_date")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    Some(Device {
        mac,
        name,
        model,
        online,
        created_at,
    })
}
