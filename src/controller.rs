//! URTSii node controller
//!
//! `UrtsController` owns the shared serial transport and one
//! [`ShadeController`] per discovered channel. It is the entry point for the
//! host supervisor: commands arrive as `(address, name, value)` triples or as
//! plain text lines and are routed to the right shade, or handled by the
//! controller itself (`DISCOVER`, `CONNECT`, `DISCONNECT`, `QUERY`).
//!
//! Failures never escape as faults. Every routed command collapses to a
//! `bool` result, with the cause logged.

use crate::config::UrtsConfig;
use crate::error::{AppResult, UrtsError};
use crate::hardware::transport::UrtsTransport;
use crate::observable::Observable;
use crate::shade::{ChannelAddress, ShadeCommand, ShadeController, ShadeReport};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Commands addressed to the controller node itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerCommand {
    /// Create shades for configured channels that do not exist yet
    Discover,
    /// Re-read the port setting and open the link
    Connect,
    /// Close the link
    Disconnect,
    /// Re-report every value
    Query,
}

impl ControllerCommand {
    /// Parse a controller command name (case-insensitive).
    pub fn parse(name: &str) -> AppResult<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "DISCOVER" => Ok(Self::Discover),
            "CONNECT" => Ok(Self::Connect),
            "DISCONNECT" => Ok(Self::Disconnect),
            "QUERY" => Ok(Self::Query),
            other => Err(UrtsError::InvalidCommand(format!(
                "unknown controller command '{other}'"
            ))),
        }
    }
}

/// Channel addresses discovery creates for `config`.
///
/// Only the first serial port and the first URTSii unit are scanned.
pub fn discovery_addresses(config: &UrtsConfig) -> Vec<ChannelAddress> {
    config
        .controller
        .channels()
        .into_iter()
        .map(ChannelAddress::on_default_controller)
        .collect()
}

/// Controller node: shade registry plus the shared serial link.
pub struct UrtsController {
    config: RwLock<UrtsConfig>,
    config_path: Option<PathBuf>,
    transport: Arc<UrtsTransport>,
    shades: RwLock<BTreeMap<ChannelAddress, ShadeController>>,
    server_up: Observable<bool>,
    long_poll: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for UrtsController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrtsController")
            .field("transport", &self.transport)
            .field("shades", &self.shades.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl UrtsController {
    /// Controller talking to the configured serial port.
    pub fn new(config: UrtsConfig) -> Self {
        let transport = Arc::new(UrtsTransport::new(&config.serial));
        Self::with_transport(config, transport)
    }

    /// Controller using an existing transport (tests, alternative links).
    pub fn with_transport(config: UrtsConfig, transport: Arc<UrtsTransport>) -> Self {
        Self {
            config: RwLock::new(config),
            config_path: None,
            transport,
            shades: RwLock::new(BTreeMap::new()),
            server_up: Observable::new("ST", false)
                .with_description("Node Server Online")
                .read_only(),
            long_poll: Mutex::new(None),
        }
    }

    /// File `CONNECT` re-reads the port setting from.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Shared serial transport.
    pub fn transport(&self) -> Arc<UrtsTransport> {
        Arc::clone(&self.transport)
    }

    /// Node-server status (`ST`).
    pub fn server_up(&self) -> Observable<bool> {
        self.server_up.clone()
    }

    /// Serial link status (`GV1`).
    pub fn link_up(&self) -> Observable<bool> {
        self.transport.link_up()
    }

    /// Mark the node up, try to open the link and run discovery.
    ///
    /// A link that cannot be opened is logged and retried by later sends and
    /// the long poll; startup continues.
    pub async fn start(&self) -> Vec<ChannelAddress> {
        info!("Started Somfy URTSii node server");
        self.server_up.set_unchecked(true);
        if let Err(e) = self.transport.connect().await {
            warn!(error = %e, "Serial link not available at startup");
        }
        self.discover()
    }

    /// Create a shade for every configured channel not yet registered.
    ///
    /// Returns the newly created addresses.
    pub fn discover(&self) -> Vec<ChannelAddress> {
        let config = self.config.read().clone();
        let mut shades = self.shades.write();
        let mut added = Vec::new();

        for address in discovery_addresses(&config) {
            if shades.contains_key(&address) {
                continue;
            }
            let travel_time = config.travel_time_for(&address.to_string());
            let shade = ShadeController::new(address, travel_time, Arc::clone(&self.transport));
            info!(address = %address, name = shade.name(), travel_time, "Adding shade");
            shades.insert(address, shade);
            added.push(address);
        }

        debug!(added = added.len(), total = shades.len(), "Discovery complete");
        added
    }

    /// Shade registered under `address`.
    pub fn shade(&self, address: &ChannelAddress) -> Option<ShadeController> {
        self.shades.read().get(address).cloned()
    }

    /// All shades in address order.
    pub fn shades(&self) -> Vec<ShadeController> {
        self.shades.read().values().cloned().collect()
    }

    /// Remove a shade, cancelling its pending timer.
    pub async fn remove_shade(&self, address: &ChannelAddress) -> AppResult<()> {
        let shade = self
            .shades
            .write()
            .remove(address)
            .ok_or_else(|| UrtsError::UnknownAddress(address.to_string()))?;
        shade.shutdown().await;
        info!(address = %address, "Removed shade");
        Ok(())
    }

    /// Re-report node status and every shade's values.
    pub async fn query_all(&self) -> Vec<ShadeReport> {
        self.server_up.report();
        self.transport.link_up().report();
        let shades = self.shades();
        join_all(shades.iter().map(|shade| shade.query())).await
    }

    /// Run a controller command.
    pub async fn execute(&self, command: ControllerCommand) -> AppResult<()> {
        match command {
            ControllerCommand::Discover => {
                self.discover();
                Ok(())
            }
            ControllerCommand::Connect => {
                self.reload_port().await;
                self.transport.connect().await
            }
            ControllerCommand::Disconnect => self.transport.disconnect().await,
            ControllerCommand::Query => {
                self.query_all().await;
                Ok(())
            }
        }
    }

    /// Route a supervisor command.
    ///
    /// `address = None` targets the controller node. Returns whether the
    /// command succeeded; the cause of a failure is logged.
    pub async fn command(&self, address: Option<&str>, name: &str, value: Option<&str>) -> bool {
        match self.dispatch(address, name, value).await {
            Ok(()) => true,
            Err(e) => {
                error!(address = address.unwrap_or("controller"), command = name, error = %e, "Command failed");
                false
            }
        }
    }

    /// Handle one text line: `<address> <COMMAND> [value]` or `<COMMAND>`.
    ///
    /// Blank lines and `#` comments succeed without doing anything.
    pub async fn handle_line(&self, line: &str) -> bool {
        let mut tokens = line.split_whitespace();
        let Some(first) = tokens.next() else {
            return true;
        };
        if first.starts_with('#') {
            return true;
        }

        if first.parse::<ChannelAddress>().is_ok() {
            let Some(name) = tokens.next() else {
                error!(address = first, "Missing command for shade");
                return false;
            };
            self.command(Some(first), name, tokens.next()).await
        } else {
            self.command(None, first, tokens.next()).await
        }
    }

    async fn dispatch(&self, address: Option<&str>, name: &str, value: Option<&str>) -> AppResult<()> {
        let Some(address) = address else {
            return self.execute(ControllerCommand::parse(name)?).await;
        };

        let address: ChannelAddress = address.parse()?;
        let shade = self
            .shade(&address)
            .ok_or_else(|| UrtsError::UnknownAddress(address.to_string()))?;
        shade.execute(ShadeCommand::parse(name, value)?).await
    }

    async fn reload_port(&self) {
        if let Some(path) = &self.config_path {
            match UrtsConfig::load_from(path) {
                Ok(config) => *self.config.write() = config,
                Err(e) => warn!(path = %path.display(), error = %e, "Could not re-read configuration, keeping previous port"),
            }
        }
        let port = self.config.read().serial.port.clone();
        self.transport.set_port(port).await;
    }

    /// Start the periodic reconnect check, if enabled in the configuration.
    ///
    /// Replaces a previously started poll.
    pub fn start_long_poll(&self) {
        let Some(period) = self.config.read().controller.long_poll() else {
            debug!("Long poll disabled");
            return;
        };

        let transport = Arc::clone(&self.transport);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = transport.connect().await {
                    debug!(error = %e, "Long poll reconnect failed");
                }
            }
        });

        if let Some(previous) = self.long_poll.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop polling, cancel every shade timer and close the link.
    pub async fn shutdown(&self) {
        if let Some(poll) = self.long_poll.lock().take() {
            poll.abort();
        }
        let shades = self.shades();
        join_all(shades.iter().map(|shade| shade.shutdown())).await;
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "Disconnect during shutdown failed");
        }
        self.server_up.set_unchecked(false);
        info!("Somfy URTSii node server stopped");
    }
}

impl Drop for UrtsController {
    fn drop(&mut self) {
        if let Some(poll) = self.long_poll.get_mut().take() {
            poll.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock_serial::{MockLine, MockOpener};
    use crate::hardware::transport::TransportSettings;
    use std::time::Duration;

    fn controller(channels: Option<Vec<u8>>) -> (UrtsController, MockLine) {
        let (opener, line) = MockOpener::new();
        let transport = Arc::new(UrtsTransport::with_opener(
            "/dev/ttyUSB0",
            Arc::new(opener),
            TransportSettings {
                open_timeout: Duration::from_millis(100),
                write_timeout: Duration::from_millis(100),
                retry_backoff: Duration::ZERO,
            },
        ));
        let mut config = UrtsConfig::default();
        config.controller.channels = channels;
        (UrtsController::with_transport(config, transport), line)
    }

    #[test]
    fn test_controller_command_parse() {
        assert_eq!(ControllerCommand::parse("discover").unwrap(), ControllerCommand::Discover);
        assert_eq!(ControllerCommand::parse("CONNECT").unwrap(), ControllerCommand::Connect);
        assert!(ControllerCommand::parse("REBOOT").is_err());
    }

    #[tokio::test]
    async fn test_discovery_creates_sixteen_shades_once() {
        let (controller, _line) = controller(None);
        assert_eq!(controller.discover().len(), 16);
        assert!(controller.discover().is_empty());

        let first = controller.shades()[0].address();
        assert_eq!(first.to_string(), "01_01_01");
    }

    #[tokio::test]
    async fn test_discovery_honors_channel_subset() {
        let (controller, _line) = controller(Some(vec![3, 1]));
        let added = controller.discover();
        let names: Vec<String> = added.iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["01_01_01", "01_01_03"]);
    }

    #[tokio::test]
    async fn test_start_brings_node_and_link_up() {
        let (controller, line) = controller(Some(vec![1]));
        controller.start().await;
        assert!(controller.server_up().get());
        assert!(controller.link_up().get());
        assert_eq!(line.open_count(), 1);

        controller.shutdown().await;
        assert!(!controller.server_up().get());
        assert!(!controller.link_up().get());
    }

    #[tokio::test(start_paused = true)]
    async fn test_routing_reaches_shade() {
        let (controller, line) = controller(Some(vec![2]));
        controller.discover();

        assert!(controller.command(Some("01_01_02"), "DOF", None).await);
        assert_eq!(line.frames(), vec!["0102D\r"]);

        assert!(!controller.command(Some("01_01_09"), "DOF", None).await);
        assert!(!controller.command(Some("01_01_02"), "WIGGLE", None).await);
        assert!(!controller.command(Some("bogus"), "DOF", None).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_line() {
        let (controller, line) = controller(Some(vec![4]));
        controller.discover();

        assert!(controller.handle_line("").await);
        assert!(controller.handle_line("# comment").await);
        assert!(controller.handle_line("01_01_04 DON 100").await);
        assert!(!controller.handle_line("01_01_04").await);
        assert!(controller.handle_line("disconnect").await);
        assert!(!controller.handle_line("01_01_04 BRT").await);
        assert_eq!(line.frames(), vec!["0104U\r"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_shade_cancels_timer() {
        let (controller, line) = controller(Some(vec![5]));
        controller.discover();
        let address = ChannelAddress::on_default_controller(5);
        let shade = controller.shade(&address).unwrap();
        shade.calibrate_position(10).await;
        shade.set_position(60).await.unwrap();

        controller.remove_shade(&address).await.unwrap();
        assert!(controller.shade(&address).is_none());
        assert!(shade.pending_timer().await.is_none());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(line.frames(), vec!["0105U\r"]);

        assert!(matches!(
            controller.remove_shade(&address).await,
            Err(UrtsError::UnknownAddress(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_reconnects() {
        let (controller, line) = controller(Some(vec![1]));
        controller.transport().disconnect().await.unwrap();
        controller.start_long_poll();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(controller.link_up().get());
        assert_eq!(line.open_count(), 1);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_query_all_reports_every_shade() {
        let (controller, _line) = controller(Some(vec![1, 2]));
        controller.discover();
        let reports = controller.query_all().await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.position.is_none() && r.travel_time == 8.0));
    }
}
