//! Serial link recovery: bounded retries, forced disconnect and link status.

use somfy_urts::hardware::mock_serial::{MockLine, MockOpener};
use somfy_urts::hardware::{LinkState, TransportSettings, UrtsTransport};
use somfy_urts::shade::{ChannelAddress, MotorCommand};
use somfy_urts::UrtsError;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn mock_transport() -> (UrtsTransport, MockLine) {
    let (opener, line) = MockOpener::new();
    let transport = UrtsTransport::with_opener(
        "/dev/ttyUSB0",
        Arc::new(opener),
        TransportSettings {
            open_timeout: Duration::from_millis(200),
            write_timeout: Duration::from_millis(200),
            retry_backoff: Duration::from_millis(50),
        },
    );
    (transport, line)
}

#[tokio::test(start_paused = true)]
async fn test_three_write_failures_force_disconnect() {
    let (transport, line) = mock_transport();
    assert_ok!(transport.connect().await);
    let mut link = transport.link_up().subscribe();
    assert!(*link.borrow_and_update());

    line.fail_next_writes(3);
    let frame = ChannelAddress::on_default_controller(1).frame(MotorCommand::Up);
    let result = transport.send(&frame).await;

    assert!(matches!(result, Err(UrtsError::Transport(_))));
    assert!(line.frames().is_empty());
    // One initial open plus a reopen before each retry.
    assert_eq!(line.open_count(), 3);
    assert_eq!(transport.link_state().get(), LinkState::Disconnected);
    assert!(link.has_changed().unwrap());
    assert!(!*link.borrow_and_update());

    assert_ok!(transport.connect().await);
    assert!(transport.link_up().get());
    assert_eq!(line.open_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_two_failures_then_success() {
    let (transport, line) = mock_transport();
    line.fail_next_writes(2);

    let frame = ChannelAddress::on_default_controller(4).frame(MotorCommand::Stop);
    assert_ok!(transport.send(&frame).await);
    assert_eq!(line.frames(), vec!["0104S\r"]);
    assert!(transport.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_port_bounded_attempts() {
    let (transport, line) = mock_transport();
    line.fail_next_opens(100);

    let frame = ChannelAddress::on_default_controller(2).frame(MotorCommand::Down);
    assert_err!(transport.send(&frame).await);
    // Three send attempts, each trying to open twice.
    assert_eq!(line.open_count(), 6);
    assert!(!transport.link_up().get());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_writes_are_bounded() {
    let (transport, line) = mock_transport();
    line.stall_next_writes(3);

    let started = tokio::time::Instant::now();
    let frame = ChannelAddress::on_default_controller(2).frame(MotorCommand::Down);
    assert_err!(transport.send(&frame).await);

    // Three write timeouts plus two backoffs, no open delays on the mock.
    assert_eq!(started.elapsed(), Duration::from_millis(3 * 200 + 2 * 50));
    assert!(line.frames().is_empty());
}

#[test]
fn test_disconnect_twice_is_safe() {
    let (transport, _line) = mock_transport();
    tokio_test::block_on(async {
        assert_ok!(transport.connect().await);
        assert_ok!(transport.disconnect().await);
        assert_ok!(transport.disconnect().await);
    });
    assert_eq!(transport.link_state().get(), LinkState::Disconnected);
}
