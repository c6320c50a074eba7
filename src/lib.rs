//! # Somfy URTSii Shade Controller
//!
//! This crate drives motorized window shades attached to a Somfy URTSii serial
//! controller. The URTSii accepts one-character motor commands per channel and
//! reports nothing back, so every shade's position is estimated from how long
//! its motor has been running.
//!
//! ## Crate Structure
//!
//! - **`controller`**: `UrtsController`, the node that discovers shades, routes
//!   supervisor commands and owns the shared serial link.
//! - **`shade`**: per-shade addressing, command vocabulary, position math and
//!   the `ShadeController` sequencer with its one-shot motor timers.
//! - **`hardware`**: serial port opening (local device or `socket://` bridge),
//!   the self-healing `UrtsTransport`, and a scripted mock link.
//! - **`observable`**: watch-channel values reported to the host supervisor.
//! - **`config`**: figment configuration (TOML file + environment).
//! - **`logging`**: tracing-subscriber initialization.
//! - **`error`** / **`error_recovery`**: the `UrtsError` taxonomy and retry policy.

pub mod config;
pub mod controller;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod logging;
pub mod observable;
pub mod shade;

pub use controller::UrtsController;
pub use error::{AppResult, UrtsError};
