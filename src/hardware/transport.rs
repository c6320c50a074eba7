//! URTSii serial transport
//!
//! One `UrtsTransport` owns the single physical link shared by every shade.
//! It serializes writes behind one async mutex, so frames from different
//! shades never interleave, and recovers from a dropped link on its own:
//!
//! ```text
//! Disconnected ──connect()──> Connecting ──open ok──> Connected
//!      ▲                          │                      │
//!      │                   2 failed opens          write error
//!      └──────────────────────────┴──────────────────────┘
//! ```
//!
//! - `connect` is idempotent and tries the port twice before giving up.
//! - `send` runs up to three full connect+write cycles. After the last failure
//!   the link is force-closed so the next call starts from a clean reconnect.
//! - Every attempt is bounded by the configured open/write timeouts.
//!
//! Transport failures are logged and returned to the caller; they never take
//! down the process.

use crate::config::SerialConfig;
use crate::error::{AppResult, UrtsError};
use crate::error_recovery::RetryPolicy;
use crate::hardware::serial::{DynSerial, PortOpener, SerialOpener};
use crate::observable::Observable;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

/// Connection lifecycle of the serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No open connection.
    Disconnected,
    /// An open attempt is in progress.
    Connecting,
    /// The port is open and writable.
    Connected,
}

/// Timeouts and retry pacing for the link.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Per-attempt open timeout
    pub open_timeout: Duration,
    /// Per-attempt write timeout
    pub write_timeout: Duration,
    /// Pause between attempts
    pub retry_backoff: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::from(&SerialConfig::default())
    }
}

impl From<&SerialConfig> for TransportSettings {
    fn from(config: &SerialConfig) -> Self {
        Self {
            open_timeout: config.open_timeout(),
            write_timeout: config.write_timeout(),
            retry_backoff: config.retry_backoff(),
        }
    }
}

/// Shared, self-healing serial link to a URTSii controller.
pub struct UrtsTransport {
    port: RwLock<String>,
    opener: Arc<dyn PortOpener>,
    connection: Mutex<Option<DynSerial>>,
    settings: TransportSettings,
    state: Observable<LinkState>,
    link_up: Observable<bool>,
}

impl std::fmt::Debug for UrtsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrtsTransport")
            .field("port", &*self.port.read())
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl UrtsTransport {
    /// Transport for a real serial device or network bridge.
    pub fn new(config: &SerialConfig) -> Self {
        Self::with_opener(&config.port, Arc::new(SerialOpener), config.into())
    }

    /// Transport using a custom opener (mock links, alternative backends).
    pub fn with_opener(
        port: impl Into<String>,
        opener: Arc<dyn PortOpener>,
        settings: TransportSettings,
    ) -> Self {
        Self {
            port: RwLock::new(port.into()),
            opener,
            connection: Mutex::new(None),
            settings,
            state: Observable::new("link_state", LinkState::Disconnected)
                .with_description("Serial link lifecycle state")
                .read_only(),
            link_up: Observable::new("GV1", false)
                .with_description("Serial Port Connected")
                .read_only(),
        }
    }

    /// Currently configured port string.
    pub fn port(&self) -> String {
        self.port.read().clone()
    }

    /// Point the transport at a different port.
    ///
    /// An open connection to the old port is dropped; the next `connect` or
    /// `send` opens the new one.
    pub async fn set_port(&self, port: impl Into<String>) {
        let port = port.into();
        if *self.port.read() == port {
            return;
        }
        let mut connection = self.connection.lock().await;
        info!(old = %self.port(), new = %port, "Serial port reconfigured");
        *self.port.write() = port;
        if connection.take().is_some() {
            self.mark(LinkState::Disconnected);
        }
    }

    /// Observable "serial link connected" status for the host supervisor.
    pub fn link_up(&self) -> Observable<bool> {
        self.link_up.clone()
    }

    /// Observable link lifecycle state.
    pub fn link_state(&self) -> Observable<LinkState> {
        self.state.clone()
    }

    /// Whether a connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.state.get() == LinkState::Connected
    }

    /// Open the link if it is not already open.
    #[instrument(skip(self), fields(port = %self.port()))]
    pub async fn connect(&self) -> AppResult<()> {
        let mut connection = self.connection.lock().await;
        self.connect_locked(&mut connection).await
    }

    /// Close the link. Closing an already closed link is a no-op.
    ///
    /// Fails only when no port was ever configured.
    #[instrument(skip(self), fields(port = %self.port()))]
    pub async fn disconnect(&self) -> AppResult<()> {
        let mut connection = self.connection.lock().await;
        self.mark(LinkState::Disconnected);

        let port = self.port();
        if port.trim().is_empty() {
            return Err(UrtsError::Transport(
                "Disconnect requested but no serial port is configured".to_string(),
            ));
        }

        match connection.take() {
            Some(mut stream) => {
                info!("Disconnecting serial port {port}");
                if let Err(e) = stream.shutdown().await {
                    debug!(error = %e, "Error while closing serial port");
                }
            }
            None => debug!("Disconnect requested but serial port {port} is not open"),
        }
        Ok(())
    }

    /// Write one complete frame, reconnecting as needed.
    ///
    /// Either the whole payload is written or the call fails; a partially
    /// written frame counts as a failure and the connection is dropped.
    #[instrument(skip(self, payload), fields(port = %self.port(), frame = %String::from_utf8_lossy(payload).escape_debug()))]
    pub async fn send(&self, payload: &[u8]) -> AppResult<()> {
        if payload.is_empty() {
            return Err(UrtsError::InvalidCommand("empty serial frame".to_string()));
        }

        let mut connection = self.connection.lock().await;
        let policy = RetryPolicy::send(self.settings.retry_backoff);

        for attempt in 1..=policy.attempts() {
            policy.pause_before(attempt).await;

            if self.connect_locked(&mut connection).await.is_err() {
                continue;
            }
            let Some(stream) = connection.as_mut() else {
                continue;
            };

            debug!(attempt, "Writing frame to serial port");
            match timeout(self.settings.write_timeout, write_frame(stream, payload)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    error!(attempt, error = %e, "Serial write failed. Check serial port connection");
                }
                Err(_) => {
                    error!(attempt, timeout = ?self.settings.write_timeout, "Serial write timed out");
                }
            }
            // Reopen on the next attempt rather than reuse a half-dead handle.
            *connection = None;
            self.mark(LinkState::Disconnected);
        }

        warn!("Too many serial failures, forcing disconnect");
        self.mark(LinkState::Disconnected);
        Err(UrtsError::Transport(format!(
            "Failed to write to {} after {} attempts",
            self.port(),
            policy.attempts()
        )))
    }

    async fn connect_locked(&self, connection: &mut Option<DynSerial>) -> AppResult<()> {
        if connection.is_some() {
            self.mark(LinkState::Connected);
            return Ok(());
        }

        let port = self.port();
        if port.trim().is_empty() {
            self.mark(LinkState::Disconnected);
            return Err(UrtsError::Transport(
                "No serial port configured".to_string(),
            ));
        }

        let policy = RetryPolicy::connect(self.settings.retry_backoff);
        let mut last_error = String::new();

        for attempt in 1..=policy.attempts() {
            policy.pause_before(attempt).await;
            self.mark(LinkState::Connecting);

            match timeout(self.settings.open_timeout, self.opener.open(&port)).await {
                Ok(Ok(stream)) => {
                    *connection = Some(stream);
                    self.mark(LinkState::Connected);
                    info!("Connected to {port}");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    last_error = format!("{e:#}");
                    error!(
                        attempt,
                        error = %last_error,
                        "Serial port connection error on connect. Check \"port\" setting ({port})"
                    );
                }
                Err(_) => {
                    last_error = format!("open timed out after {:?}", self.settings.open_timeout);
                    error!(attempt, "Serial port connection timed out ({port})");
                }
            }
        }

        self.mark(LinkState::Disconnected);
        Err(UrtsError::Transport(format!(
            "Could not open {port}: {last_error}"
        )))
    }

    fn mark(&self, state: LinkState) {
        if self.state.get() != state {
            self.state.set_unchecked(state);
        }
        let up = state == LinkState::Connected;
        if self.link_up.get() != up {
            self.link_up.set_unchecked(up);
        }
    }
}

async fn write_frame(stream: &mut DynSerial, payload: &[u8]) -> std::io::Result<()> {
    stream.write_all(payload).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock_serial::{MockLine, MockOpener};

    fn mock_transport() -> (UrtsTransport, MockLine) {
        let (opener, line) = MockOpener::new();
        let transport = UrtsTransport::with_opener(
            "/dev/ttyUSB0",
            Arc::new(opener),
            TransportSettings {
                open_timeout: Duration::from_millis(100),
                write_timeout: Duration::from_millis(100),
                retry_backoff: Duration::ZERO,
            },
        );
        (transport, line)
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (transport, line) = mock_transport();
        transport.connect().await.unwrap();
        transport.connect().await.unwrap();

        assert_eq!(line.open_count(), 1);
        assert!(transport.link_up().get());
        assert_eq!(transport.link_state().get(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_connect_retries_once() {
        let (transport, line) = mock_transport();
        line.fail_next_opens(1);
        transport.connect().await.unwrap();
        assert_eq!(line.open_count(), 2);

        let (transport, line) = mock_transport();
        line.fail_next_opens(2);
        assert!(transport.connect().await.is_err());
        assert_eq!(line.open_count(), 2);
        assert!(!transport.link_up().get());
    }

    #[tokio::test]
    async fn test_send_connects_on_demand() {
        let (transport, line) = mock_transport();
        transport.send(b"0105U\r").await.unwrap();

        assert_eq!(line.frames(), vec!["0105U\r"]);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_write_failure_reconnects() {
        let (transport, line) = mock_transport();
        transport.connect().await.unwrap();
        line.fail_next_writes(1);

        transport.send(b"0105S\r").await.unwrap();
        assert_eq!(line.frames(), vec!["0105S\r"]);
        assert_eq!(line.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_times_out() {
        let (transport, line) = mock_transport();
        line.stall_next_writes(1);

        transport.send(b"0101D\r").await.unwrap();
        assert_eq!(line.frames(), vec!["0101D\r"]);
    }

    #[tokio::test]
    async fn test_disconnect_when_closed_is_noop() {
        let (transport, _line) = mock_transport();
        assert!(transport.disconnect().await.is_ok());
        assert!(!transport.link_up().get());
    }

    #[tokio::test]
    async fn test_unconfigured_port() {
        let (opener, line) = MockOpener::new();
        let transport =
            UrtsTransport::with_opener("", Arc::new(opener), TransportSettings::default());

        assert!(transport.disconnect().await.is_err());
        assert!(transport.send(b"0101U\r").await.is_err());
        assert_eq!(line.open_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_frame_rejected() {
        let (transport, line) = mock_transport();
        assert!(matches!(
            transport.send(b"").await,
            Err(UrtsError::InvalidCommand(_))
        ));
        assert_eq!(line.open_count(), 0);
    }

    #[tokio::test]
    async fn test_set_port_drops_connection() {
        let (transport, line) = mock_transport();
        transport.connect().await.unwrap();
        transport.set_port("socket://10.0.0.5:4001").await;
        assert!(!transport.is_connected());

        transport.send(b"0101U\r").await.unwrap();
        assert_eq!(line.last_port().as_deref(), Some("socket://10.0.0.5:4001"));
    }
}
