//! Motor commands and the supervisor command vocabulary.

use crate::error::{AppResult, UrtsError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Single-character motor instruction understood by the URTSii.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MotorCommand {
    /// Open (`U`)
    Up,
    /// Close (`D`)
    Down,
    /// Halt (`S`)
    Stop,
}

impl MotorCommand {
    /// Wire character.
    pub fn as_char(self) -> char {
        match self {
            Self::Up => 'U',
            Self::Down => 'D',
            Self::Stop => 'S',
        }
    }
}

impl fmt::Display for MotorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Direction of a running motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Towards fully open (100%)
    Up,
    /// Towards fully closed (0%)
    Down,
}

impl Direction {
    /// Position the shade ends at after a full-travel run.
    pub fn boundary(self) -> u8 {
        match self {
            Self::Up => 100,
            Self::Down => 0,
        }
    }
}

impl From<Direction> for MotorCommand {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Up => Self::Up,
            Direction::Down => Self::Down,
        }
    }
}

/// Commands the host supervisor can send to one shade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ShadeCommand {
    /// `DON`: fully open, or move to a percentage when a value is given
    On(Option<i32>),
    /// `DOF`: fully close
    Off,
    /// `BRT`: open by 5%
    NudgeUp,
    /// `DIM`: close by 5%
    NudgeDown,
    /// `STOP`: halt and finalize the position estimate
    Stop,
    /// `QUERY`: re-report position and travel time
    Query,
    /// `SET_TRAVEL_TIME`: recalibrate full travel time in seconds
    SetTravelTime(f64),
}

impl ShadeCommand {
    /// Parse a supervisor command name with its optional value.
    pub fn parse(name: &str, value: Option<&str>) -> AppResult<Self> {
        let value = value.map(str::trim).filter(|v| !v.is_empty());
        match name.trim().to_ascii_uppercase().as_str() {
            "DON" => match value {
                None => Ok(Self::On(None)),
                Some(raw) => parse_percent(raw).map(|p| Self::On(Some(p))),
            },
            "DOF" => Ok(Self::Off),
            "BRT" => Ok(Self::NudgeUp),
            "DIM" => Ok(Self::NudgeDown),
            "STOP" => Ok(Self::Stop),
            "QUERY" => Ok(Self::Query),
            "SET_TRAVEL_TIME" => parse_travel_time(value.unwrap_or_default()).map(Self::SetTravelTime),
            other => Err(UrtsError::InvalidCommand(format!(
                "unknown shade command '{other}'"
            ))),
        }
    }

    /// Supervisor name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::On(_) => "DON",
            Self::Off => "DOF",
            Self::NudgeUp => "BRT",
            Self::NudgeDown => "DIM",
            Self::Stop => "STOP",
            Self::Query => "QUERY",
            Self::SetTravelTime(_) => "SET_TRAVEL_TIME",
        }
    }
}

fn parse_percent(raw: &str) -> AppResult<i32> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v as i32)
        .ok_or_else(|| UrtsError::InvalidCommand(format!("invalid position '{raw}'")))
}

/// Parse a travel time in seconds. Range checking is the shade's job.
pub fn parse_travel_time(raw: &str) -> AppResult<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| UrtsError::Calibration(format!("'{raw}' is not a number of seconds")))
}
