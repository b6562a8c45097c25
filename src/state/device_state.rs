// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed device state decoded from register frames.

use chrono::{DateTime, Utc};

use crate::command::{
    REG_AC_CHARGING_TIMER, REG_AC_CHARGING_UPPER_LIMIT, REG_AC_SILENT_CHARGING, REG_AC_STANDBY,
    REG_DC_STANDBY, REG_DISCHARGE_LOWER_LIMIT, REG_MAX_CHARGING_CURRENT, REG_SCREEN_REST,
    REG_SLEEP_TIME, REG_USB_STANDBY,
};
use crate::modbus::{RegisterFrame, RegisterKind};

/// DC input power, watts.
const REG_DC_INPUT_WATTS: u16 = 4;
/// State of charge, whole percent (older firmware).
const REG_SOC_PERCENT: u16 = 5;
/// Total input power, watts.
const REG_INPUT_WATTS: u16 = 6;
/// Total output power, watts.
const REG_OUTPUT_WATTS: u16 = 39;
/// Output switch bitfield.
const REG_OUTPUT_BITS: u16 = 41;
/// State of charge, tenths of a percent (preferred when present).
const REG_SOC_TENTHS: u16 = 56;

const BIT_LED: u16 = 1 << 3;
const BIT_AC: u16 = 1 << 4;
const BIT_DC: u16 = 1 << 5;
const BIT_USB: u16 = 1 << 6;

/// Snapshot of one device.
///
/// Every field is optional until a frame carrying its register arrives;
/// frames merge, they never clear fields they do not mention.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    /// State of charge, percent (0–100).
    pub soc: Option<f64>,
    /// Total input power, watts.
    pub input_watts: Option<u32>,
    /// Total output power, watts.
    pub output_watts: Option<u32>,
    /// DC input power, watts.
    pub dc_input_watts: Option<u32>,
    /// USB output switch.
    pub usb_output: Option<bool>,
    /// AC output switch.
    pub ac_output: Option<bool>,
    /// DC output switch.
    pub dc_output: Option<bool>,
    /// LED light switch.
    pub led_output: Option<bool>,
    /// Maximum charging current, amperes.
    pub max_charging_current: Option<u16>,
    /// Discharge lower limit, percent.
    pub discharge_lower_limit: Option<f64>,
    /// AC charging upper limit, percent.
    pub ac_charging_upper_limit: Option<f64>,
    /// Silent AC charging flag.
    pub ac_silent_charging: Option<bool>,
    /// USB standby timer, minutes.
    pub usb_standby_minutes: Option<u16>,
    /// AC standby timer, minutes.
    pub ac_standby_minutes: Option<u16>,
    /// DC standby timer, minutes.
    pub dc_standby_minutes: Option<u16>,
    /// Screen rest timer, seconds.
    pub screen_rest_seconds: Option<u16>,
    /// AC charging timer, minutes.
    pub ac_charging_timer_minutes: Option<u16>,
    /// Sleep timer, minutes.
    pub sleep_minutes: Option<u16>,
    /// When the last frame was applied. Non-decreasing per device.
    pub last_full_update: Option<DateTime<Utc>>,
    /// Topic that produced the last update.
    pub last_update_source: Option<String>,
    /// Whether the last update followed a command within the
    /// correlation window.
    pub last_update_was_command_triggered: bool,
    /// Register bank of the last frame; observability only.
    pub last_register_kind: Option<RegisterKind>,
}

impl DeviceState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a decoded frame. Only fields whose registers are present
    /// change; each is replaced whole.
    pub fn apply_frame(&mut self, frame: &RegisterFrame) {
        // Register 56 carries tenths and wins over the whole-percent
        // register when both are present.
        if let Some(tenths) = frame.register(REG_SOC_TENTHS) {
            self.soc = Some((f64::from(tenths) / 10.0).min(100.0));
        } else if let Some(percent) = frame.register(REG_SOC_PERCENT) {
            self.soc = Some(f64::from(percent).min(100.0));
        }

        if let Some(bits) = self.output_bits(frame) {
            self.usb_output = Some(bits & BIT_USB != 0);
            self.dc_output = Some(bits & BIT_DC != 0);
            self.ac_output = Some(bits & BIT_AC != 0);
            self.led_output = Some(bits & BIT_LED != 0);
        }

        if let Some(watts) = frame.register(REG_INPUT_WATTS) {
            self.input_watts = Some(u32::from(watts));
        }
        if let Some(watts) = frame.register(REG_OUTPUT_WATTS) {
            self.output_watts = Some(u32::from(watts));
        }
        if let Some(watts) = frame.register(REG_DC_INPUT_WATTS) {
            self.dc_input_watts = Some(u32::from(watts));
        }

        if let Some(amperes) = frame.register(REG_MAX_CHARGING_CURRENT) {
            self.max_charging_current = Some(amperes);
        }
        if let Some(flag) = frame.register(REG_AC_SILENT_CHARGING) {
            self.ac_silent_charging = Some(flag != 0);
        }
        if let Some(minutes) = frame.register(REG_USB_STANDBY) {
            self.usb_standby_minutes = Some(minutes);
        }
        if let Some(minutes) = frame.register(REG_AC_STANDBY) {
            self.ac_standby_minutes = Some(minutes);
        }
        if let Some(minutes) = frame.register(REG_DC_STANDBY) {
            self.dc_standby_minutes = Some(minutes);
        }
        if let Some(seconds) = frame.register(REG_SCREEN_REST) {
            self.screen_rest_seconds = Some(seconds);
        }
        if let Some(minutes) = frame.register(REG_AC_CHARGING_TIMER) {
            self.ac_charging_timer_minutes = Some(minutes);
        }
        if let Some(tenths) = frame.register(REG_DISCHARGE_LOWER_LIMIT) {
            self.discharge_lower_limit = Some(f64::from(tenths) / 10.0);
        }
        if let Some(tenths) = frame.register(REG_AC_CHARGING_UPPER_LIMIT) {
            self.ac_charging_upper_limit = Some(f64::from(tenths) / 10.0);
        }
        if let Some(minutes) = frame.register(REG_SLEEP_TIME) {
            self.sleep_minutes = Some(minutes);
        }
    }

    /// The output switch word. Full dumps carry it at its absolute
    /// register; the short two-word command acknowledgement carries it
    /// in its second word.
    fn output_bits(&self, frame: &RegisterFrame) -> Option<u16> {
        frame.register(REG_OUTPUT_BITS).or_else(|| {
            (frame.start_register.is_none() && frame.registers.len() == 2)
                .then(|| frame.register(1))
                .flatten()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn frame(fc: u8, start: Option<u16>, pairs: &[(u16, u16)]) -> RegisterFrame {
        RegisterFrame {
            slave_id: 0x11,
            function_code: fc,
            start_register: start,
            registers: pairs.iter().copied().collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn soc_prefers_tenths_register() {
        let mut state = DeviceState::new();
        state.apply_frame(&frame(0x03, Some(0), &[(5, 80), (56, 856)]));
        assert_eq!(state.soc, Some(85.6));
    }

    #[test]
    fn soc_falls_back_to_percent_register() {
        let mut state = DeviceState::new();
        state.apply_frame(&frame(0x03, Some(0), &[(5, 80)]));
        assert_eq!(state.soc, Some(80.0));
    }

    #[test]
    fn soc_is_clamped_to_100() {
        let mut state = DeviceState::new();
        state.apply_frame(&frame(0x03, Some(0), &[(56, 1100)]));
        assert_eq!(state.soc, Some(100.0));
    }

    #[test]
    fn output_bitfield_decodes_all_switches() {
        let mut state = DeviceState::new();
        // USB (bit 6) and LED (bit 3) on.
        state.apply_frame(&frame(0x03, Some(0), &[(41, 0x48)]));
        assert_eq!(state.usb_output, Some(true));
        assert_eq!(state.led_output, Some(true));
        assert_eq!(state.ac_output, Some(false));
        assert_eq!(state.dc_output, Some(false));
    }

    #[test]
    fn short_ack_frame_updates_outputs() {
        // Two index-keyed words, switch word second: USB on only.
        let mut state = DeviceState::new();
        state.apply_frame(&frame(0x04, None, &[(0, 0), (1, 0x40)]));
        assert_eq!(state.usb_output, Some(true));
        assert_eq!(state.ac_output, Some(false));
        assert_eq!(state.dc_output, Some(false));
        assert_eq!(state.led_output, Some(false));
    }

    #[test]
    fn index_keyed_frame_without_ack_shape_leaves_outputs() {
        let mut state = DeviceState::new();
        state.apply_frame(&frame(0x04, None, &[(0, 1), (1, 2), (2, 3)]));
        assert_eq!(state.usb_output, None);
    }

    #[test]
    fn partial_update_merges() {
        let mut state = DeviceState::new();
        state.apply_frame(&frame(0x03, Some(0), &[(56, 500), (41, 0x40)]));
        // A later frame without those registers leaves them alone.
        state.apply_frame(&frame(0x03, Some(0), &[(20, 10)]));
        assert_eq!(state.soc, Some(50.0));
        assert_eq!(state.usb_output, Some(true));
        assert_eq!(state.max_charging_current, Some(10));
    }

    #[test]
    fn settings_registers_decode() {
        let mut state = DeviceState::new();
        state.apply_frame(&frame(
            0x03,
            Some(0),
            &[
                (20, 15),
                (57, 1),
                (59, 10),
                (60, 480),
                (61, 1440),
                (62, 300),
                (64, 120),
                (66, 150),
                (67, 800),
                (68, 30),
            ],
        ));
        assert_eq!(state.max_charging_current, Some(15));
        assert_eq!(state.ac_silent_charging, Some(true));
        assert_eq!(state.usb_standby_minutes, Some(10));
        assert_eq!(state.ac_standby_minutes, Some(480));
        assert_eq!(state.dc_standby_minutes, Some(1440));
        assert_eq!(state.screen_rest_seconds, Some(300));
        assert_eq!(state.ac_charging_timer_minutes, Some(120));
        assert_eq!(state.discharge_lower_limit, Some(15.0));
        assert_eq!(state.ac_charging_upper_limit, Some(80.0));
        assert_eq!(state.sleep_minutes, Some(30));
    }

    #[test]
    fn watts_registers_decode() {
        let mut state = DeviceState::new();
        state.apply_frame(&frame(0x04, Some(0), &[(4, 120), (6, 350), (39, 410)]));
        assert_eq!(state.dc_input_watts, Some(120));
        assert_eq!(state.input_watts, Some(350));
        assert_eq!(state.output_watts, Some(410));
    }
}
