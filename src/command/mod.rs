// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed device command catalog.
//!
//! Commands are a closed set: every constructor targets a known register
//! and validates its input, so an encoded frame can never carry an
//! out-of-range value. The set is a tagged value type rather than a
//! trait hierarchy; [`ResponseClass`] tells the bridge how the device
//! will answer.
//!
//! | Register | Meaning | Legal values |
//! |----------|---------|--------------|
//! | 20 | Max charging current | 1–20 A |
//! | 24–27 | USB / DC / AC / LED output | 0/1 |
//! | 57 | AC silent charging | 0/1 |
//! | 59 | USB standby time | 0, 3, 5, 10, 30 min |
//! | 60 | AC standby time | 0, 480, 960, 1440 min |
//! | 61 | DC standby time | 0, 480, 960, 1440 min |
//! | 62 | Screen rest time | 0, 180, 300, 600, 1800 s |
//! | 64 | AC charging timer | 0–1440 min |
//! | 66 | Discharge lower limit | 0–1000 tenths of a percent |
//! | 67 | AC charging upper limit | 0–1000 tenths of a percent |
//! | 68 | Sleep time | 5, 10, 30, 480 min |

use crate::error::CommandError;
use crate::modbus::{encode_read_range, encode_write_single};

/// Max charging current register.
pub const REG_MAX_CHARGING_CURRENT: u16 = 20;
/// USB output switch register.
pub const REG_USB_OUTPUT: u16 = 24;
/// DC output switch register.
pub const REG_DC_OUTPUT: u16 = 25;
/// AC output switch register.
pub const REG_AC_OUTPUT: u16 = 26;
/// LED output switch register.
pub const REG_LED_OUTPUT: u16 = 27;
/// AC silent charging register.
pub const REG_AC_SILENT_CHARGING: u16 = 57;
/// USB standby time register.
pub const REG_USB_STANDBY: u16 = 59;
/// AC standby time register.
pub const REG_AC_STANDBY: u16 = 60;
/// DC standby time register.
pub const REG_DC_STANDBY: u16 = 61;
/// Screen rest time register.
pub const REG_SCREEN_REST: u16 = 62;
/// AC charging timer register.
pub const REG_AC_CHARGING_TIMER: u16 = 64;
/// Discharge lower limit register (tenths of a percent).
pub const REG_DISCHARGE_LOWER_LIMIT: u16 = 66;
/// AC charging upper limit register (tenths of a percent).
pub const REG_AC_CHARGING_UPPER_LIMIT: u16 = 67;
/// Sleep time register.
pub const REG_SLEEP_TIME: u16 = 68;

/// Default window for settings reads: the full holding bank.
pub const HOLDING_READ_START: u16 = 0;
/// Number of registers covered by a full settings read.
pub const HOLDING_READ_COUNT: u16 = 80;

const USB_STANDBY_MINUTES: &[u16] = &[0, 3, 5, 10, 30];
const AC_DC_STANDBY_MINUTES: &[u16] = &[0, 480, 960, 1440];
const SCREEN_REST_SECONDS: &[u16] = &[0, 180, 300, 600, 1800];
const SLEEP_MINUTES: &[u16] = &[5, 10, 30, 480];

/// How the device answers a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// Output toggles: the device acknowledges promptly on the
    /// `/client/04` response topic.
    Immediate,
    /// Settings writes: the new value surfaces only in the next
    /// spontaneous update or explicit read.
    Delayed,
    /// Read requests: the device answers with a register dump.
    ReadResponse,
}

/// A single device command: target register, value, and response class.
///
/// # Examples
///
/// ```
/// use fossibot_bridge::command::{Command, ResponseClass};
///
/// let cmd = Command::usb_output(true);
/// assert_eq!(cmd.register(), 24);
/// assert_eq!(cmd.value(), 1);
/// assert_eq!(cmd.response_class(), ResponseClass::Immediate);
///
/// assert!(Command::max_charging_current(21).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    register: u16,
    value: u16,
    response_class: ResponseClass,
    description: String,
}

impl Command {
    fn write(register: u16, value: u16, class: ResponseClass, description: String) -> Self {
        Self {
            register,
            value,
            response_class: class,
            description,
        }
    }

    /// Switches the USB output.
    #[must_use]
    pub fn usb_output(on: bool) -> Self {
        Self::write(
            REG_USB_OUTPUT,
            u16::from(on),
            ResponseClass::Immediate,
            format!("USB output {}", on_off(on)),
        )
    }

    /// Switches the DC output.
    #[must_use]
    pub fn dc_output(on: bool) -> Self {
        Self::write(
            REG_DC_OUTPUT,
            u16::from(on),
            ResponseClass::Immediate,
            format!("DC output {}", on_off(on)),
        )
    }

    /// Switches the AC output.
    #[must_use]
    pub fn ac_output(on: bool) -> Self {
        Self::write(
            REG_AC_OUTPUT,
            u16::from(on),
            ResponseClass::Immediate,
            format!("AC output {}", on_off(on)),
        )
    }

    /// Switches the LED light.
    #[must_use]
    pub fn led_output(on: bool) -> Self {
        Self::write(
            REG_LED_OUTPUT,
            u16::from(on),
            ResponseClass::Immediate,
            format!("LED output {}", on_off(on)),
        )
    }

    /// Sets the maximum charging current in amperes (1–20).
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::OutOfRange`] outside 1–20 A.
    pub fn max_charging_current(amperes: u16) -> Result<Self, CommandError> {
        if !(1..=20).contains(&amperes) {
            return Err(CommandError::OutOfRange {
                what: "charging current",
                min: 1.0,
                max: 20.0,
                actual: f64::from(amperes),
            });
        }
        Ok(Self::write(
            REG_MAX_CHARGING_CURRENT,
            amperes,
            ResponseClass::Delayed,
            format!("max charging current {amperes} A"),
        ))
    }

    /// Enables or disables silent (reduced-power) AC charging.
    #[must_use]
    pub fn ac_silent_charging(enabled: bool) -> Self {
        Self::write(
            REG_AC_SILENT_CHARGING,
            u16::from(enabled),
            ResponseClass::Delayed,
            format!("AC silent charging {}", on_off(enabled)),
        )
    }

    /// Sets the USB standby timeout in minutes.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::NotInSet`] unless `minutes` is one of
    /// 0, 3, 5, 10 or 30.
    pub fn usb_standby_time(minutes: u16) -> Result<Self, CommandError> {
        value_in_set("USB standby time", USB_STANDBY_MINUTES, minutes)?;
        Ok(Self::write(
            REG_USB_STANDBY,
            minutes,
            ResponseClass::Delayed,
            format!("USB standby {minutes} min"),
        ))
    }

    /// Sets the AC standby timeout in minutes.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::NotInSet`] unless `minutes` is one of
    /// 0, 480, 960 or 1440.
    pub fn ac_standby_time(minutes: u16) -> Result<Self, CommandError> {
        value_in_set("AC standby time", AC_DC_STANDBY_MINUTES, minutes)?;
        Ok(Self::write(
            REG_AC_STANDBY,
            minutes,
            ResponseClass::Delayed,
            format!("AC standby {minutes} min"),
        ))
    }

    /// Sets the DC standby timeout in minutes.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::NotInSet`] unless `minutes` is one of
    /// 0, 480, 960 or 1440.
    pub fn dc_standby_time(minutes: u16) -> Result<Self, CommandError> {
        value_in_set("DC standby time", AC_DC_STANDBY_MINUTES, minutes)?;
        Ok(Self::write(
            REG_DC_STANDBY,
            minutes,
            ResponseClass::Delayed,
            format!("DC standby {minutes} min"),
        ))
    }

    /// Sets the screen rest timeout in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::NotInSet`] unless `seconds` is one of
    /// 0, 180, 300, 600 or 1800.
    pub fn screen_rest_time(seconds: u16) -> Result<Self, CommandError> {
        value_in_set("screen rest time", SCREEN_REST_SECONDS, seconds)?;
        Ok(Self::write(
            REG_SCREEN_REST,
            seconds,
            ResponseClass::Delayed,
            format!("screen rest {seconds} s"),
        ))
    }

    /// Sets the AC charging timer in minutes (0–1440; 0 disables).
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::OutOfRange`] above 1440 minutes.
    pub fn ac_charging_timer(minutes: u16) -> Result<Self, CommandError> {
        if minutes > 1440 {
            return Err(CommandError::OutOfRange {
                what: "AC charging timer",
                min: 0.0,
                max: 1440.0,
                actual: f64::from(minutes),
            });
        }
        Ok(Self::write(
            REG_AC_CHARGING_TIMER,
            minutes,
            ResponseClass::Delayed,
            format!("AC charging timer {minutes} min"),
        ))
    }

    /// Sets the discharge lower limit as a user-facing percentage with
    /// 0.1 granularity.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::OutOfRange`] outside 0.0–100.0.
    pub fn discharge_lower_limit(percentage: f64) -> Result<Self, CommandError> {
        let tenths = percent_to_tenths("discharge lower limit", percentage)?;
        Ok(Self::write(
            REG_DISCHARGE_LOWER_LIMIT,
            tenths,
            ResponseClass::Delayed,
            format!("discharge lower limit {percentage}%"),
        ))
    }

    /// Sets the AC charging upper limit as a user-facing percentage with
    /// 0.1 granularity.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::OutOfRange`] outside 0.0–100.0.
    pub fn ac_charging_upper_limit(percentage: f64) -> Result<Self, CommandError> {
        let tenths = percent_to_tenths("AC charging upper limit", percentage)?;
        Ok(Self::write(
            REG_AC_CHARGING_UPPER_LIMIT,
            tenths,
            ResponseClass::Delayed,
            format!("AC charging upper limit {percentage}%"),
        ))
    }

    /// Sets the sleep timeout in minutes. Zero is not a legal value for
    /// this register.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::NotInSet`] unless `minutes` is one of
    /// 5, 10, 30 or 480.
    pub fn sleep_time(minutes: u16) -> Result<Self, CommandError> {
        value_in_set("sleep time", SLEEP_MINUTES, minutes)?;
        Ok(Self::write(
            REG_SLEEP_TIME,
            minutes,
            ResponseClass::Delayed,
            format!("sleep time {minutes} min"),
        ))
    }

    /// Requests a read of `count` holding registers starting at `start`.
    #[must_use]
    pub fn read_holding_registers(start: u16, count: u16) -> Self {
        Self {
            register: start,
            value: count,
            response_class: ResponseClass::ReadResponse,
            description: format!("read {count} holding registers from {start}"),
        }
    }

    /// Requests the full settings bank.
    #[must_use]
    pub fn read_settings() -> Self {
        Self::read_holding_registers(HOLDING_READ_START, HOLDING_READ_COUNT)
    }

    /// Target register for writes, start register for reads.
    #[must_use]
    pub fn register(&self) -> u16 {
        self.register
    }

    /// Value for writes, register count for reads.
    #[must_use]
    pub fn value(&self) -> u16 {
        self.value
    }

    /// How the device will answer this command.
    #[must_use]
    pub fn response_class(&self) -> ResponseClass {
        self.response_class
    }

    /// Human-readable summary for logs.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether this command writes a settings register whose effect only
    /// becomes visible on the next read.
    #[must_use]
    pub fn is_settings_write(&self) -> bool {
        self.response_class == ResponseClass::Delayed
    }

    /// Encodes the command as a wire frame.
    #[must_use]
    pub fn frame_bytes(&self) -> [u8; 8] {
        match self.response_class {
            ResponseClass::ReadResponse => encode_read_range(self.register, self.value, true),
            ResponseClass::Immediate | ResponseClass::Delayed => {
                encode_write_single(self.register, self.value)
            }
        }
    }
}

fn on_off(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}

fn value_in_set(
    what: &'static str,
    allowed: &'static [u16],
    actual: u16,
) -> Result<(), CommandError> {
    if allowed.contains(&actual) {
        Ok(())
    } else {
        Err(CommandError::NotInSet {
            what,
            allowed,
            actual,
        })
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn percent_to_tenths(what: &'static str, percentage: f64) -> Result<u16, CommandError> {
    if !(0.0..=100.0).contains(&percentage) || !percentage.is_finite() {
        return Err(CommandError::OutOfRange {
            what,
            min: 0.0,
            max: 100.0,
            actual: percentage,
        });
    }
    // Safe: 0.0..=100.0 scaled by 10 fits u16.
    Ok((percentage * 10.0).round() as u16)
}
