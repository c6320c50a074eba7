//! Serial Port Abstractions
//!
//! Shared types for the URTSii link and the seam used to open it.
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//! - [`PortOpener`]: Opens a fresh connection to a configured port
//! - [`SerialOpener`]: Real opener (local device or network serial bridge)
//!
//! # Port strings
//!
//! A port string containing `://` is treated as a URL. `socket://host:port` and
//! `tcp://host:port` connect to a raw TCP serial server (ser2net and similar).
//! Anything else is opened as a local device at 9600 baud, 8N1, no flow control.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::spawn_blocking;
use tokio_serial::SerialPortBuilderExt;
use tracing::info;

/// URTSii line speed.
pub const URTS_BAUD_RATE: u32 = 9600;

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::net::TcpStream` (network serial bridge)
/// - [`crate::hardware::mock_serial::MockSerialPort`] (testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Opens connections to a serial port identified by a string.
///
/// The transport calls this every time it needs a fresh connection, so an
/// implementation must be able to open the same port repeatedly.
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open `port` and return a ready-to-write connection.
    async fn open(&self, port: &str) -> anyhow::Result<DynSerial>;
}

/// Opens real serial devices and network serial bridges.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

#[async_trait]
impl PortOpener for SerialOpener {
    async fn open(&self, port: &str) -> anyhow::Result<DynSerial> {
        if port.contains("://") {
            info!(port, "Connecting to serial port via url");
            let stream = open_url(port).await?;
            Ok(Box::new(stream))
        } else {
            info!(port, "Connecting to local serial port");
            let stream = open_serial_async(port, URTS_BAUD_RATE, "URTSii").await?;
            Ok(Box::new(stream))
        }
    }
}

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control.
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!(
                "Failed to open {} serial port: {}",
                device_name_owned, port_path_owned
            ))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

async fn open_url(url: &str) -> anyhow::Result<TcpStream> {
    let address = parse_socket_url(url)?;
    let stream = TcpStream::connect(address)
        .await
        .with_context(|| format!("Failed to connect to serial server {url}"))?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Extract `host:port` from a `socket://` or `tcp://` URL.
pub fn parse_socket_url(url: &str) -> anyhow::Result<&str> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| anyhow!("Not a URL: {url}"))?;

    if !matches!(scheme, "socket" | "tcp") {
        return Err(anyhow!("Unsupported serial URL scheme '{scheme}' in {url}"));
    }

    let address = rest.trim_end_matches('/');
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(address),
        _ => Err(anyhow!("Serial URL must be of the form {scheme}://host:port, got {url}")),
    }
}
