//! Per-shade command sequencing and position tracking.
//!
//! A [`ShadeController`] turns percentage requests into timed motor runs:
//! it sends `U`/`D` to the shared transport, then arms a one-shot timer for
//! the computed run time. When the timer expires it performs the follow-up
//! action chosen with the command:
//!
//! | Request                        | Motor | Run time          | Follow-up                 |
//! |--------------------------------|-------|-------------------|---------------------------|
//! | target <= 0                    | `D`   | full travel       | finalize estimate         |
//! | target >= 100                  | `U`   | full travel       | finalize estimate         |
//! | position unknown, 0 < t < 100  | `D`   | full travel       | reposition to t from 0    |
//! | target > position              | `U`   | proportional      | send `S`                  |
//! | target < position              | `D`   | proportional      | send `S`                  |
//!
//! All operations on one shade are serialized by a single async mutex. Each
//! armed timer carries a generation number; a timer whose generation no longer
//! matches the shade's current one does nothing when it fires, so at most one
//! timer ever acts on a shade.

use crate::config::{DEFAULT_TRAVEL_TIME_SECS, MAX_TRAVEL_TIME_SECS};
use crate::error::{AppResult, UrtsError};
use crate::hardware::transport::UrtsTransport;
use crate::observable::Observable;
use crate::shade::address::ChannelAddress;
use crate::shade::command::{Direction, MotorCommand, ShadeCommand};
use crate::shade::position::{estimate_position, required_travel_secs};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Percentage moved by a nudge (`BRT` / `DIM`).
pub const NUDGE_STEP: i32 = 5;

/// What a shade does when its motor timer expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FollowUp {
    /// Boundary move: the motor stops at its end stop by itself.
    Finalize,
    /// Partial move: halt the motor.
    Stop,
    /// First stage of a move from an unknown position: now at 0, go to target.
    Reposition(i32),
}

/// Snapshot of the armed timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTimer {
    /// Generation the timer was armed with
    pub generation: u64,
    /// Action on expiry
    pub follow_up: FollowUp,
    /// Expiry instant
    pub deadline: Instant,
}

/// Motion state derived from the last command and the armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    /// No motor command in flight.
    Idle,
    /// Running towards a boundary or a proportional target.
    Moving(Direction),
    /// Driving to a known baseline before moving to `target`.
    StagedMove {
        /// Direction of the current stage
        direction: Direction,
        /// Target of the next stage
        target: i32,
    },
}

/// Values reported to the host supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadeReport {
    /// Shade address
    pub address: String,
    /// Estimated position, `None` while unknown
    pub position: Option<u8>,
    /// Calibrated full-travel time in seconds
    pub travel_time: f64,
}

struct ArmedTimer {
    info: PendingTimer,
    handle: JoinHandle<()>,
}

struct ShadeState {
    position: Option<u8>,
    travel_time: f64,
    last_command: Option<Direction>,
    last_command_at: Instant,
    timer: Option<ArmedTimer>,
    generation: u64,
}

struct ShadeInner {
    address: ChannelAddress,
    name: String,
    transport: Arc<UrtsTransport>,
    state: Mutex<ShadeState>,
    position: Observable<Option<u8>>,
    travel_time: Observable<f64>,
}

/// Controller for one shade channel. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ShadeController {
    inner: Arc<ShadeInner>,
}

impl std::fmt::Debug for ShadeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadeController")
            .field("address", &self.inner.address)
            .field("position", &self.inner.position.get())
            .field("travel_time", &self.inner.travel_time.get())
            .finish_non_exhaustive()
    }
}

impl ShadeController {
    /// Create a controller with an unknown position.
    ///
    /// A travel time outside `[0, 60]` seconds is replaced by the default.
    pub fn new(address: ChannelAddress, travel_time: f64, transport: Arc<UrtsTransport>) -> Self {
        let travel_time = if travel_time.is_finite()
            && (0.0..=MAX_TRAVEL_TIME_SECS).contains(&travel_time)
        {
            travel_time
        } else {
            warn!(
                address = %address,
                travel_time,
                "Travel time out of range, defaulting to {DEFAULT_TRAVEL_TIME_SECS} seconds"
            );
            DEFAULT_TRAVEL_TIME_SECS
        };

        Self {
            inner: Arc::new(ShadeInner {
                name: address.default_name(),
                address,
                transport,
                state: Mutex::new(ShadeState {
                    position: None,
                    travel_time,
                    last_command: None,
                    last_command_at: Instant::now(),
                    timer: None,
                    generation: 0,
                }),
                position: Observable::new("ST", None)
                    .with_description("Estimated shade position")
                    .with_units("%")
                    .read_only(),
                travel_time: Observable::new("GV1", travel_time)
                    .with_description("Travel Time")
                    .with_units("s")
                    .with_range(0.0, MAX_TRAVEL_TIME_SECS),
            }),
        }
    }

    /// Channel address.
    pub fn address(&self) -> ChannelAddress {
        self.inner.address
    }

    /// Node name (`Shade_01_01_05`).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Observable position estimate (`None` while unknown).
    pub fn position(&self) -> Observable<Option<u8>> {
        self.inner.position.clone()
    }

    /// Observable travel time calibration.
    pub fn travel_time(&self) -> Observable<f64> {
        self.inner.travel_time.clone()
    }

    /// Current position estimate without finalizing an in-flight move.
    pub async fn estimated_position(&self) -> Option<u8> {
        self.inner.state.lock().await.position
    }

    /// Snapshot of the armed timer, if any.
    pub async fn pending_timer(&self) -> Option<PendingTimer> {
        self.inner
            .state
            .lock()
            .await
            .timer
            .as_ref()
            .map(|t| t.info.clone())
    }

    /// Current motion state.
    pub async fn motion_state(&self) -> MotionState {
        let state = self.inner.state.lock().await;
        match (state.last_command, state.timer.as_ref().map(|t| t.info.follow_up)) {
            (Some(direction), Some(FollowUp::Reposition(target))) => {
                MotionState::StagedMove { direction, target }
            }
            (Some(direction), Some(_)) => MotionState::Moving(direction),
            _ => MotionState::Idle,
        }
    }

    /// Run a supervisor command against this shade.
    pub async fn execute(&self, command: ShadeCommand) -> AppResult<()> {
        match command {
            ShadeCommand::On(None) => {
                info!(address = %self.inner.address, "Received DON command");
                self.move_fully_open().await
            }
            ShadeCommand::On(Some(target)) => {
                info!(address = %self.inner.address, "Received command to set shade to {target} percent");
                self.set_position(target).await
            }
            ShadeCommand::Off => {
                info!(address = %self.inner.address, "Received DOF command");
                self.move_fully_closed().await
            }
            ShadeCommand::NudgeUp => self.nudge_up().await,
            ShadeCommand::NudgeDown => self.nudge_down().await,
            ShadeCommand::Stop => self.stop().await,
            ShadeCommand::Query => {
                self.query().await;
                Ok(())
            }
            ShadeCommand::SetTravelTime(secs) => self.set_travel_time(secs).await,
        }
    }

    /// Fully open (100%).
    pub async fn move_fully_open(&self) -> AppResult<()> {
        self.set_position(100).await
    }

    /// Fully close (0%).
    pub async fn move_fully_closed(&self) -> AppResult<()> {
        self.set_position(0).await
    }

    /// Open by [`NUDGE_STEP`] percent. Requires a known position.
    pub async fn nudge_up(&self) -> AppResult<()> {
        self.nudge(NUDGE_STEP, "BRT").await
    }

    /// Close by [`NUDGE_STEP`] percent. Requires a known position.
    pub async fn nudge_down(&self) -> AppResult<()> {
        self.nudge(-NUDGE_STEP, "DIM").await
    }

    async fn nudge(&self, delta: i32, command: &'static str) -> AppResult<()> {
        let mut state = self.inner.state.lock().await;

        // Rejection must leave an in-flight move and its timer alone.
        let Some(baseline) = current_estimate(&state) else {
            let err = UrtsError::PositionUnknown {
                address: self.inner.address.to_string(),
                command,
            };
            error!(address = %self.inner.address, "{err}");
            return Err(err);
        };
        self.finalize_locked(&mut state);
        let position = state.position.unwrap_or(baseline);

        info!(address = %self.inner.address, "Received {command} command");
        self.set_position_locked(&mut state, i32::from(position) + delta)
            .await
    }

    /// Halt the motor and finalize the estimate from elapsed run time.
    ///
    /// The estimate is finalized even when the stop frame could not be sent.
    pub async fn stop(&self) -> AppResult<()> {
        info!(address = %self.inner.address, "Received STOP command");
        let mut state = self.inner.state.lock().await;
        let sent = self.send(MotorCommand::Stop).await;
        self.finalize_locked(&mut state);
        sent
    }

    /// Move to `target` percent (0 = closed, 100 = open).
    pub async fn set_position(&self, target: i32) -> AppResult<()> {
        let mut state = self.inner.state.lock().await;
        self.set_position_locked(&mut state, target).await
    }

    /// Change the full-travel calibration. Accepts `[0, 60]` seconds.
    pub async fn set_travel_time(&self, secs: f64) -> AppResult<()> {
        if !secs.is_finite() {
            info!(address = %self.inner.address, "Received command to change travel time but value is invalid ({secs})");
            return Err(UrtsError::Calibration(format!("{secs} is not a number of seconds")));
        }
        if let Err(e) = self.inner.travel_time.validate(&secs) {
            info!(address = %self.inner.address, "Received command to change travel time but value is out of range ({secs})");
            return Err(UrtsError::Calibration(e.to_string()));
        }

        info!(address = %self.inner.address, "Received command to change travel time to {secs}");
        let mut state = self.inner.state.lock().await;
        state.travel_time = secs;
        self.inner.travel_time.set_unchecked(secs);
        Ok(())
    }

    /// Declare the current position (e.g. after a manual check).
    ///
    /// Any in-flight move is finalized first and its timer cancelled.
    pub async fn calibrate_position(&self, position: u8) {
        let mut state = self.inner.state.lock().await;
        self.finalize_locked(&mut state);
        state.position = Some(position.min(100));
        self.publish_position(state.position);
    }

    /// Re-report position (if known) and travel time. No state changes.
    pub async fn query(&self) -> ShadeReport {
        let state = self.inner.state.lock().await;
        if state.position.is_some() {
            self.inner.position.report();
        }
        self.inner.travel_time.report();
        ShadeReport {
            address: self.inner.address.to_string(),
            position: state.position,
            travel_time: state.travel_time,
        }
    }

    /// Finalize the position estimate from elapsed motor time.
    ///
    /// Idempotent: a second call immediately after the first changes nothing.
    pub async fn finalize_position(&self) -> Option<u8> {
        let mut state = self.inner.state.lock().await;
        self.finalize_locked(&mut state);
        state.position
    }

    /// Cancel the pending timer. Used when the shade is removed.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
            debug!(address = %self.inner.address, "Cancelled shade position timer");
        }
        // Late timers from before the shutdown must not act.
        state.generation += 1;
    }

    async fn set_position_locked(&self, state: &mut ShadeState, target: i32) -> AppResult<()> {
        let was_moving = state.last_command.is_some();
        self.finalize_locked(state);

        let run_secs = required_travel_secs(state.travel_time, state.position, target);
        let (direction, follow_up) = if target <= 0 {
            (Direction::Down, FollowUp::Finalize)
        } else if target >= 100 {
            (Direction::Up, FollowUp::Finalize)
        } else {
            match state.position {
                None => (Direction::Down, FollowUp::Reposition(target)),
                Some(position) if target > i32::from(position) => (Direction::Up, FollowUp::Stop),
                Some(position) if target < i32::from(position) => {
                    (Direction::Down, FollowUp::Stop)
                }
                Some(_) if was_moving => {
                    debug!(address = %self.inner.address, target, "Requested position reached mid-move, stopping");
                    return self.send(MotorCommand::Stop).await;
                }
                Some(_) => {
                    debug!(address = %self.inner.address, target, "Shade already at requested position");
                    return Ok(());
                }
            }
        };

        debug!(
            address = %self.inner.address,
            target,
            command = %MotorCommand::from(direction),
            run_secs,
            ?follow_up,
            "Processing shade command"
        );

        self.send(direction.into()).await?;

        let now = Instant::now();
        state.last_command = Some(direction);
        state.last_command_at = now;
        self.arm_timer(state, now + Duration::from_secs_f64(run_secs), follow_up);
        Ok(())
    }

    fn arm_timer(&self, state: &mut ShadeState, deadline: Instant, follow_up: FollowUp) {
        if let Some(previous) = state.timer.take() {
            previous.handle.abort();
        }
        state.generation += 1;
        let generation = state.generation;

        let shade = self.clone();
        let handle = tokio::spawn(async move {
            sleep_until(deadline).await;
            shade.on_timer(generation).await;
        });

        debug!(
            address = %self.inner.address,
            generation,
            secs = deadline.saturating_duration_since(Instant::now()).as_secs_f64(),
            "Starting shade position timer"
        );
        state.timer = Some(ArmedTimer {
            info: PendingTimer {
                generation,
                follow_up,
                deadline,
            },
            handle,
        });
    }

    async fn on_timer(&self, generation: u64) {
        let mut state = self.inner.state.lock().await;

        let current = state.timer.as_ref().map(|t| t.info.generation);
        if current != Some(generation) {
            debug!(address = %self.inner.address, generation, "Ignoring superseded shade timer");
            return;
        }
        // Detach rather than abort: this task is the timer.
        let Some(timer) = state.timer.take() else {
            return;
        };

        match timer.info.follow_up {
            FollowUp::Finalize => self.finalize_locked(&mut state),
            FollowUp::Stop => {
                if let Err(e) = self.send(MotorCommand::Stop).await {
                    error!(address = %self.inner.address, error = %e, "Failed to stop shade at end of move");
                }
                self.finalize_locked(&mut state);
            }
            FollowUp::Reposition(target) => {
                if let Err(e) = self.set_position_locked(&mut state, target).await {
                    error!(address = %self.inner.address, target, error = %e, "Second stage of shade move failed");
                }
            }
        }
    }

    fn finalize_locked(&self, state: &mut ShadeState) {
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }

        let now = Instant::now();
        state.position = current_estimate(state);
        state.last_command = None;
        state.last_command_at = now;

        self.publish_position(state.position);
    }

    fn publish_position(&self, position: Option<u8>) {
        if position.is_some() && self.inner.position.get() != position {
            self.inner.position.set_unchecked(position);
        }
    }

    async fn send(&self, command: MotorCommand) -> AppResult<()> {
        let frame = self.inner.address.frame(command);
        self.inner.transport.send(&frame).await.map_err(|e| {
            error!(address = %self.inner.address, %command, error = %e, "Failed to send shade command");
            e
        })
    }
}

/// Position implied by the running command at this instant, without
/// finalizing it.
fn current_estimate(state: &ShadeState) -> Option<u8> {
    let elapsed = Instant::now()
        .saturating_duration_since(state.last_command_at)
        .as_secs_f64();
    estimate_position(
        state.position,
        state.last_command,
        elapsed,
        state.travel_time,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock_serial::{MockLine, MockOpener};
    use crate::hardware::transport::TransportSettings;

    fn shade(travel_time: f64) -> (ShadeController, MockLine) {
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
        let address: ChannelAddress = "01_01_02".parse().unwrap();
        (ShadeController::new(address, travel_time, transport), line)
    }

    #[tokio::test(start_paused = true)]
    async fn test_boundary_move_finalizes_without_follow_up() {
        let (shade, line) = shade(8.0);
        shade.move_fully_open().await.unwrap();

        let timer = shade.pending_timer().await.unwrap();
        assert_eq!(timer.follow_up, FollowUp::Finalize);
        assert_eq!(shade.motion_state().await, MotionState::Moving(Direction::Up));

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(line.frames(), vec!["0102U\r"]);
        assert_eq!(shade.estimated_position().await, Some(100));
        assert_eq!(shade.position().get(), Some(100));
        assert_eq!(shade.motion_state().await, MotionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_position_stages_move() {
        let (shade, _line) = shade(8.0);
        shade.set_position(30).await.unwrap();
        assert_eq!(
            shade.motion_state().await,
            MotionState::StagedMove {
                direction: Direction::Down,
                target: 30
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalize_twice_is_idempotent() {
        let (shade, _line) = shade(10.0);
        shade.calibrate_position(20).await;
        shade.set_position(60).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let first = shade.finalize_position().await;
        let second = shade.finalize_position().await;
        assert_eq!(first, Some(40));
        assert_eq!(second, Some(40));
        assert!(shade.pending_timer().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_move_estimates_position() {
        let (shade, line) = shade(10.0);
        shade.calibrate_position(90).await;
        shade.set_position(10).await.unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        shade.stop().await.unwrap();

        assert_eq!(shade.estimated_position().await, Some(60));
        assert_eq!(line.frames(), vec!["0102D\r", "0102S\r"]);
        assert!(shade.pending_timer().await.is_none());

        // The cancelled timer must not send a second stop.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(line.frames().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nudge_moves_five_percent() {
        let (shade, line) = shade(10.0);
        shade.calibrate_position(50).await;
        shade.nudge_down().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(shade.estimated_position().await, Some(45));
        assert_eq!(line.frames(), vec!["0102D\r", "0102S\r"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_position_is_noop() {
        let (shade, line) = shade(10.0);
        shade.calibrate_position(50).await;
        shade.set_position(50).await.unwrap();

        assert!(line.frames().is_empty());
        assert_eq!(shade.motion_state().await, MotionState::Idle);
    }

    #[tokio::test]
    async fn test_travel_time_rejections_leave_state() {
        let (shade, _line) = shade(8.0);
        assert!(matches!(
            shade.set_travel_time(-1.0).await,
            Err(UrtsError::Calibration(_))
        ));
        assert!(shade.set_travel_time(f64::NAN).await.is_err());
        assert_eq!(shade.travel_time().get(), 8.0);
        assert_eq!(shade.query().await.travel_time, 8.0);
    }

    #[test]
    fn test_out_of_range_construction_uses_default() {
        let (opener, _line) = MockOpener::new();
        let transport = Arc::new(UrtsTransport::with_opener(
            "/dev/ttyUSB0",
            Arc::new(opener),
            TransportSettings::default(),
        ));
        let shade = ShadeController::new(ChannelAddress::on_default_controller(1), 90.0, transport);
        assert_eq!(shade.travel_time().get(), DEFAULT_TRAVEL_TIME_SECS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_arms_no_timer() {
        let (shade, line) = shade(8.0);
        line.fail_next_opens(6);

        assert!(matches!(
            shade.move_fully_closed().await,
            Err(UrtsError::Transport(_))
        ));
        assert!(shade.pending_timer().await.is_none());
        assert_eq!(shade.estimated_position().await, None);
    }
}
