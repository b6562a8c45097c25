// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Payload transformation between wire frames, state JSON and command
//! JSON.
//!
//! Consumers see a flat camelCase JSON object per state update and send
//! `{"action": ...}` documents; the device sees binary register frames.
//! Everything in between is pure translation.

use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};

use crate::command::Command;
use crate::error::{CommandError, FrameError};
use crate::modbus::{self, RegisterFrame};
use crate::state::DeviceState;

/// Decodes raw bytes into a register frame.
///
/// # Errors
///
/// Returns [`FrameError`] for malformed frames.
pub fn parse_frame(bytes: &[u8]) -> Result<RegisterFrame, FrameError> {
    modbus::decode(bytes)
}

/// Serialises a state snapshot as the flat JSON document published on
/// the local state topic.
#[must_use]
pub fn state_to_json(state: &DeviceState) -> String {
    let timestamp = state
        .last_full_update
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    json!({
        "soc": state.soc,
        "inputWatts": state.input_watts,
        "outputWatts": state.output_watts,
        "dcInputWatts": state.dc_input_watts,
        "usbOutput": state.usb_output,
        "acOutput": state.ac_output,
        "dcOutput": state.dc_output,
        "ledOutput": state.led_output,
        "maxChargingCurrent": state.max_charging_current,
        "dischargeLowerLimit": state.discharge_lower_limit,
        "acChargingUpperLimit": state.ac_charging_upper_limit,
        "acSilentCharging": state.ac_silent_charging,
        "usbStandbyTime": state.usb_standby_minutes,
        "acStandbyTime": state.ac_standby_minutes,
        "dcStandbyTime": state.dc_standby_minutes,
        "screenRestTime": state.screen_rest_seconds,
        "acChargingTimer": state.ac_charging_timer_minutes,
        "sleepTime": state.sleep_minutes,
        "wasCommandTriggered": state.last_update_was_command_triggered,
        "lastUpdateSource": state.last_update_source,
        "timestamp": timestamp,
    })
    .to_string()
}

/// Parses a consumer command document into a typed [`Command`].
///
/// # Errors
///
/// Returns [`CommandError`] for invalid JSON, unknown actions, missing
/// arguments, or out-of-range values.
pub fn json_to_command(payload: &str) -> Result<Command, CommandError> {
    let value: Value = serde_json::from_str(payload)?;
    let action = value
        .get("action")
        .and_then(Value::as_str)
        .ok_or(CommandError::MissingAction)?;

    match action {
        "usb_on" => Ok(Command::usb_output(true)),
        "usb_off" => Ok(Command::usb_output(false)),
        "ac_on" => Ok(Command::ac_output(true)),
        "ac_off" => Ok(Command::ac_output(false)),
        "dc_on" => Ok(Command::dc_output(true)),
        "dc_off" => Ok(Command::dc_output(false)),
        "led_on" => Ok(Command::led_output(true)),
        "led_off" => Ok(Command::led_output(false)),
        "read_settings" => Ok(Command::read_settings()),
        "read_holding_registers" => {
            let start = optional_u16(&value, "start")?.unwrap_or(crate::command::HOLDING_READ_START);
            let count = optional_u16(&value, "count")?.unwrap_or(crate::command::HOLDING_READ_COUNT);
            Ok(Command::read_holding_registers(start, count))
        }
        "set_charging_current" => {
            Command::max_charging_current(require_u16(&value, "set_charging_current", "amperes")?)
        }
        "set_discharge_limit" => {
            Command::discharge_lower_limit(require_f64(&value, "set_discharge_limit", "percentage")?)
        }
        "set_ac_charging_limit" => Command::ac_charging_upper_limit(require_f64(
            &value,
            "set_ac_charging_limit",
            "percentage",
        )?),
        "set_ac_silent_charging" => Ok(Command::ac_silent_charging(require_bool(
            &value,
            "set_ac_silent_charging",
            "enabled",
        )?)),
        "set_usb_standby_time" => {
            Command::usb_standby_time(require_u16(&value, "set_usb_standby_time", "minutes")?)
        }
        "set_ac_standby_time" => {
            Command::ac_standby_time(require_u16(&value, "set_ac_standby_time", "minutes")?)
        }
        "set_dc_standby_time" => {
            Command::dc_standby_time(require_u16(&value, "set_dc_standby_time", "minutes")?)
        }
        "set_screen_rest_time" => {
            Command::screen_rest_time(require_u16(&value, "set_screen_rest_time", "seconds")?)
        }
        "set_ac_charging_timer" => {
            Command::ac_charging_timer(require_u16(&value, "set_ac_charging_timer", "minutes")?)
        }
        "set_sleep_time" => Command::sleep_time(require_u16(&value, "set_sleep_time", "minutes")?),
        other => Err(CommandError::UnknownAction(other.to_string())),
    }
}

/// Encodes a command as its wire frame.
#[must_use]
pub fn command_to_bytes(command: &Command) -> Vec<u8> {
    command.frame_bytes().to_vec()
}

fn require_u16(value: &Value, action: &'static str, argument: &'static str) -> Result<u16, CommandError> {
    let raw = value
        .get(argument)
        .and_then(Value::as_u64)
        .ok_or(CommandError::MissingArgument { action, argument })?;
    u16::try_from(raw).map_err(|_| u16_out_of_range(argument, raw))
}

fn optional_u16(value: &Value, argument: &'static str) -> Result<Option<u16>, CommandError> {
    match value.get(argument) {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => {
            let raw = raw.as_u64().ok_or(CommandError::MissingArgument {
                action: "read_holding_registers",
                argument,
            })?;
            u16::try_from(raw)
                .map(Some)
                .map_err(|_| u16_out_of_range(argument, raw))
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn u16_out_of_range(argument: &'static str, raw: u64) -> CommandError {
    CommandError::OutOfRange {
        what: argument,
        min: 0.0,
        max: f64::from(u16::MAX),
        actual: raw as f64,
    }
}

fn require_f64(value: &Value, action: &'static str, argument: &'static str) -> Result<f64, CommandError> {
    value
        .get(argument)
        .and_then(Value::as_f64)
        .ok_or(CommandError::MissingArgument { action, argument })
}

fn require_bool(value: &Value, action: &'static str, argument: &'static str) -> Result<bool, CommandError> {
    value
        .get(argument)
        .and_then(Value::as_bool)
        .ok_or(CommandError::MissingArgument { action, argument })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ResponseClass;
    use crate::modbus::crc16;

    #[test]
    fn state_json_is_flat_camel_case() {
        let mut state = DeviceState::new();
        state.soc = Some(85.6);
        state.usb_output = Some(true);
        state.ac_output = Some(false);
        state.max_charging_current = Some(15);
        let value: Value = serde_json::from_str(&state_to_json(&state)).unwrap();

        assert_eq!(value["soc"], json!(85.6));
        assert_eq!(value["usbOutput"], json!(true));
        assert_eq!(value["acOutput"], json!(false));
        assert_eq!(value["maxChargingCurrent"], json!(15));
        // Unknown fields serialise as null, not as absent keys.
        assert!(value["dcOutput"].is_null());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn state_json_timestamp_is_iso8601() {
        let state = DeviceState::new();
        let value: Value = serde_json::from_str(&state_to_json(&state)).unwrap();
        let timestamp = value["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[test]
    fn output_actions_parse() {
        for (action, register, value) in [
            ("usb_on", 24, 1),
            ("usb_off", 24, 0),
            ("dc_on", 25, 1),
            ("dc_off", 25, 0),
            ("ac_on", 26, 1),
            ("ac_off", 26, 0),
            ("led_on", 27, 1),
            ("led_off", 27, 0),
        ] {
            let command = json_to_command(&format!(r#"{{"action":"{action}"}}"#)).unwrap();
            assert_eq!(command.register(), register, "action {action}");
            assert_eq!(command.value(), value, "action {action}");
        }
    }

    #[test]
    fn settings_actions_parse() {
        let command =
            json_to_command(r#"{"action":"set_charging_current","amperes":15}"#).unwrap();
        assert_eq!(command.register(), 20);
        assert_eq!(command.value(), 15);

        let command =
            json_to_command(r#"{"action":"set_discharge_limit","percentage":100.0}"#).unwrap();
        assert_eq!(command.register(), 66);
        assert_eq!(command.value(), 1000);

        let command =
            json_to_command(r#"{"action":"set_ac_silent_charging","enabled":true}"#).unwrap();
        assert_eq!(command.register(), 57);
        assert_eq!(command.value(), 1);

        let command =
            json_to_command(r#"{"action":"set_sleep_time","minutes":480}"#).unwrap();
        assert_eq!(command.register(), 68);
    }

    #[test]
    fn read_actions_parse() {
        let command = json_to_command(r#"{"action":"read_settings"}"#).unwrap();
        assert_eq!(command.response_class(), ResponseClass::ReadResponse);

        let command =
            json_to_command(r#"{"action":"read_holding_registers","start":10,"count":4}"#).unwrap();
        assert_eq!(command.register(), 10);
        assert_eq!(command.value(), 4);
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = json_to_command(r#"{"action":"self_destruct"}"#).unwrap_err();
        assert!(matches!(err, CommandError::UnknownAction(a) if a == "self_destruct"));
    }

    #[test]
    fn missing_action_is_rejected() {
        assert!(matches!(
            json_to_command(r#"{"amperes":5}"#),
            Err(CommandError::MissingAction)
        ));
        assert!(matches!(
            json_to_command(r#"{"action":7}"#),
            Err(CommandError::MissingAction)
        ));
    }

    #[test]
    fn missing_argument_is_rejected() {
        let err = json_to_command(r#"{"action":"set_charging_current"}"#).unwrap_err();
        assert!(matches!(
            err,
            CommandError::MissingArgument { argument: "amperes", .. }
        ));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(json_to_command(r#"{"action":"set_charging_current","amperes":0}"#).is_err());
        assert!(json_to_command(r#"{"action":"set_charging_current","amperes":21}"#).is_err());
        assert!(json_to_command(r#"{"action":"set_discharge_limit","percentage":100.1}"#).is_err());
        assert!(json_to_command(r#"{"action":"set_usb_standby_time","minutes":7}"#).is_err());
    }

    #[test]
    fn invalid_json_is_rejected() {
        assert!(matches!(
            json_to_command("{not json"),
            Err(CommandError::Json(_))
        ));
    }

    #[test]
    fn command_bytes_carry_modbus_crc() {
        let command = json_to_command(r#"{"action":"usb_on"}"#).unwrap();
        let bytes = command_to_bytes(&command);
        assert_eq!(bytes.len(), 8);
        let crc = crc16(&bytes[..6]);
        assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), crc);
    }

    #[test]
    fn command_pipeline_is_deterministic() {
        let a = command_to_bytes(&json_to_command(r#"{"action":"set_charging_current","amperes":15}"#).unwrap());
        let b = command_to_bytes(&json_to_command(r#"{"action":"set_charging_current","amperes":15}"#).unwrap());
        assert_eq!(a, b);
        assert_eq!(&a[..6], &[0x11, 0x06, 0x00, 0x14, 0x00, 0x0F]);
    }
}
