// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Modbus-style register frame codec.

mod crc;
mod frame;

pub use crc::crc16;
pub use frame::{
    FC_READ_HOLDING, FC_READ_INPUT, FC_WRITE_SINGLE, RegisterFrame, RegisterKind, SLAVE_ID,
    decode, encode_read_range, encode_write_single,
};
