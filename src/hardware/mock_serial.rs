//! Mock serial link for testing the transport and shade controllers
//!
//! This module provides [`MockOpener`], a [`PortOpener`] that hands out
//! [`MockSerialPort`]s, and [`MockLine`], the test-facing handle used to
//! script failures and inspect the frames that reached the "device".
//!
//! # Architecture
//!
//! Every port opened by a `MockOpener` shares one `MockLine`:
//! - `MockSerialPort` (given to the transport): implements AsyncRead/AsyncWrite
//! - `MockLine` (kept in test): scripts open/write failures and records frames
//!
//! # Example
//!
//! ```rust,ignore
//! use somfy_urts::hardware::mock_serial::MockOpener;
//!
//! let (opener, line) = MockOpener::new();
//! line.fail_next_writes(3);
//! let transport = UrtsTransport::with_opener(
//!     "/dev/ttyUSB0",
//!     Arc::new(opener),
//!     TransportSettings::default(),
//! );
//! assert!(transport.send(b"0101U\r").await.is_err());
//! assert!(line.frames().is_empty());
//! ```

use crate::hardware::serial::{DynSerial, PortOpener};
use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Debug, Default)]
struct LineState {
    open_failures: u32,
    write_failures: u32,
    stalled_writes: u32,
    opens: u32,
    last_port: Option<String>,
    frames: Vec<Vec<u8>>,
}

/// Test-facing handle shared by every port a [`MockOpener`] opens.
#[derive(Debug, Clone, Default)]
pub struct MockLine {
    state: Arc<Mutex<LineState>>,
}

impl MockLine {
    /// Make the next `n` open attempts fail.
    pub fn fail_next_opens(&self, n: u32) {
        self.state.lock().open_failures = n;
    }

    /// Make the next `n` writes fail with `BrokenPipe`.
    pub fn fail_next_writes(&self, n: u32) {
        self.state.lock().write_failures = n;
    }

    /// Make the next `n` writes never complete (exercises write timeouts).
    pub fn stall_next_writes(&self, n: u32) {
        self.state.lock().stalled_writes = n;
    }

    /// Number of successful and failed open attempts so far.
    pub fn open_count(&self) -> u32 {
        self.state.lock().opens
    }

    /// Port string passed to the most recent open.
    pub fn last_port(&self) -> Option<String> {
        self.state.lock().last_port.clone()
    }

    /// Frames that were fully written, oldest first.
    pub fn frames(&self) -> Vec<String> {
        self.state
            .lock()
            .frames
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect()
    }

    /// Remove and return all recorded frames.
    pub fn take_frames(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().frames)
            .into_iter()
            .map(|f| String::from_utf8_lossy(&f).into_owned())
            .collect()
    }
}

/// [`PortOpener`] producing [`MockSerialPort`]s.
#[derive(Debug, Clone, Default)]
pub struct MockOpener {
    line: MockLine,
}

impl MockOpener {
    /// Creates an opener and the handle that controls it.
    pub fn new() -> (Self, MockLine) {
        let line = MockLine::default();
        (Self { line: line.clone() }, line)
    }
}

#[async_trait]
impl PortOpener for MockOpener {
    async fn open(&self, port: &str) -> anyhow::Result<DynSerial> {
        let mut state = self.line.state.lock();
        state.opens += 1;
        state.last_port = Some(port.to_string());
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(anyhow!("Mock open failure on {port}"));
        }
        Ok(Box::new(MockSerialPort {
            line: self.line.clone(),
        }))
    }
}

/// The transport-facing side of the mock link.
///
/// Each `write` call is recorded as one frame. Reads report end-of-file since
/// the URTSii never answers.
#[derive(Debug)]
pub struct MockSerialPort {
    line: MockLine,
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.line.state.lock();
        if state.stalled_writes > 0 {
            state.stalled_writes -= 1;
            return Poll::Pending;
        }
        if state.write_failures > 0 {
            state.write_failures -= 1;
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock serial cable unplugged",
            )));
        }
        state.frames.push(buf.to_vec());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
