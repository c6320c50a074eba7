//! URTSii serial link
//!
//! - `serial`: port abstraction and the real serial/TCP opener
//! - `transport`: the shared, self-healing link used by every shade
//! - `mock_serial`: scripted in-memory link for tests and dry runs

pub mod mock_serial;
pub mod serial;
pub mod transport;

pub use transport::{LinkState, TransportSettings, UrtsTransport};
