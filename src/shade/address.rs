//! Channel addresses.
//!
//! A shade is identified by `SS_CC_NN`: serial port number, URTSii unit number
//! and channel number, each two zero-padded digits (`01_01_05`). The serial port
//! number only distinguishes links on the host; the URTSii itself is addressed
//! with the unit and channel digits, separators stripped (`0105`).

use crate::error::UrtsError;
use crate::shade::command::MotorCommand;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Frame terminator expected by the URTSii.
pub const FRAME_TERMINATOR: char = '\r';

/// Identifies one shade: (serial port, controller unit, channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelAddress {
    /// Host serial port number (1-based)
    pub serial_port: u8,
    /// URTSii unit number on that port
    pub controller: u8,
    /// Channel on the unit (1-16)
    pub channel: u8,
}

impl ChannelAddress {
    /// Address on the default serial port and URTSii unit.
    pub fn on_default_controller(channel: u8) -> Self {
        Self {
            serial_port: 1,
            controller: 1,
            channel,
        }
    }

    /// Controller/channel prefix sent on the wire (`0105`).
    pub fn wire_prefix(&self) -> String {
        format!("{:02}{:02}", self.controller, self.channel)
    }

    /// Complete frame for a motor command: `<prefix><U|D|S>\r`.
    pub fn frame(&self, command: MotorCommand) -> Vec<u8> {
        format!(
            "{}{}{}",
            self.wire_prefix(),
            command.as_char(),
            FRAME_TERMINATOR
        )
        .into_bytes()
    }

    /// Default node name for the shade.
    pub fn default_name(&self) -> String {
        format!("Shade_{self}")
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}_{:02}_{:02}",
            self.serial_port, self.controller, self.channel
        )
    }
}

impl FromStr for ChannelAddress {
    type Err = UrtsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || UrtsError::UnknownAddress(s.to_string());

        let mut parts = s.trim().split('_');
        let mut next = || -> Result<u8, UrtsError> {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            part.parse::<u8>().map_err(|_| invalid())
        };

        let address = Self {
            serial_port: next()?,
            controller: next()?,
            channel: next()?,
        };

        if parts.next().is_some() || address.serial_port == 0 || address.channel == 0 {
            return Err(invalid());
        }
        Ok(address)
    }
}
