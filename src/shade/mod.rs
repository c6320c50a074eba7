//! Shade channels: addressing, command vocabulary, position estimation and
//! the per-shade sequencer.

pub mod address;
pub mod command;
pub mod controller;
pub mod position;

pub use address::ChannelAddress;
pub use command::{Direction, MotorCommand, ShadeCommand};
pub use controller::{FollowUp, MotionState, PendingTimer, ShadeController, ShadeReport};
