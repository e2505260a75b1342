//! Mock transport for deterministic testing of the IO engine.
//!
//! [`MockTransport`] implements the [`Transport`] trait with pre-loaded
//! request/response pairs. Because the transport is moved into the IO task,
//! every mock hands out a cloneable [`MockHandle`] that shares its state: tests
//! use it to inject unsolicited lines, simulate faults, and inspect what was
//! written and when.
//!
//! All timing uses `tokio::time`, so tests running with a paused clock
//! (`#[tokio::test(start_paused = true)]`) see deterministic timestamps.
//!
//! # Example
//!
//! ```
//! use avrlink_test_harness::MockTransport;
//!
//! let mut mock = MockTransport::new();
//! // When the engine writes this command, the device answers with this line.
//! mock.expect(b"@PWR:?\r", b"@PWR:2\r");
//! let handle = mock.handle();
//! assert_eq!(handle.remaining_expectations(), 1);
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use avrlink_core::error::{Error, Result};
use avrlink_core::transport::Transport;

/// A pre-loaded request/response pair for the mock transport.
#[derive(Debug, Clone)]
struct Expectation {
    /// The exact bytes we expect to be sent.
    request: Vec<u8>,
    /// The bytes the device answers with, if any.
    response: Option<Vec<u8>>,
}

/// One `send()` call as seen by the mock.
#[derive(Debug, Clone)]
struct SentRecord {
    data: Vec<u8>,
    at: Instant,
}

#[derive(Debug, Default)]
struct MockState {
    expectations: VecDeque<Expectation>,
    /// Bytes waiting to be returned by `receive()`.
    inbound: VecDeque<u8>,
    open: bool,
    /// Opens fail while `false`.
    available: bool,
    /// The next `receive()` reports a dropped link.
    lost: bool,
    failing_opens: u32,
    drop_next_write: bool,
    fail_next_write: bool,
    open_count: u32,
    close_count: u32,
    sent: Vec<SentRecord>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<MockState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A mock [`Transport`] for testing without hardware.
///
/// The mock starts closed, like a real serial port. Expectations are consumed
/// in order: when `send()` is called, the data is recorded and compared with
/// the next expectation, and the expectation's response becomes readable by
/// `receive()`. A mismatch or an exhausted expectation list makes `send()`
/// fail with [`Error::Protocol`].
#[derive(Debug)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

/// Shared view of a [`MockTransport`] that stays usable after the transport
/// has been moved into an IO task.
#[derive(Debug, Clone)]
pub struct MockHandle {
    shared: Arc<Shared>,
}

impl MockTransport {
    /// Create a new, closed mock transport.
    pub fn new() -> Self {
        MockTransport {
            shared: Arc::new(Shared {
                state: Mutex::new(MockState {
                    available: true,
                    ..Default::default()
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// A handle sharing this transport's state.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Add an expected request/response pair.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        self.handle().expect(request, response);
    }

    /// Add an expected request the device does not answer.
    pub fn expect_no_reply(&mut self, request: &[u8]) {
        self.handle().expect_no_reply(request);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHandle {
    /// Add an expected request/response pair.
    pub fn expect(&self, request: &[u8], response: &[u8]) {
        self.shared.lock().expectations.push_back(Expectation {
            request: request.to_vec(),
            response: Some(response.to_vec()),
        });
    }

    /// Add an expected request the device does not answer.
    pub fn expect_no_reply(&self, request: &[u8]) {
        self.shared.lock().expectations.push_back(Expectation {
            request: request.to_vec(),
            response: None,
        });
    }

    /// Make the device emit a line, as if it pushed a status change.
    ///
    /// A carriage return is appended.
    pub fn push_line(&self, line: &str) {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\r');
        self.push_bytes(&bytes);
    }

    /// Make raw bytes readable by the next `receive()`.
    pub fn push_bytes(&self, data: &[u8]) {
        self.shared.lock().inbound.extend(data.iter().copied());
        self.shared.notify.notify_waiters();
    }

    /// Drop the link: the next `receive()` fails with
    /// [`Error::ConnectionLost`] and the transport is closed.
    pub fn disconnect(&self) {
        self.shared.lock().lost = true;
        self.shared.notify.notify_waiters();
    }

    /// Make the port (un)available. While unavailable every `open()` fails.
    pub fn set_available(&self, available: bool) {
        self.shared.lock().available = available;
    }

    /// Make the next `n` calls to `open()` fail.
    pub fn fail_next_opens(&self, n: u32) {
        self.shared.lock().failing_opens = n;
    }

    /// The next `send()` finds the port closed underneath it and fails with
    /// [`Error::NotConnected`].
    pub fn drop_next_write(&self) {
        self.shared.lock().drop_next_write = true;
    }

    /// The next `send()` fails with a broken pipe I/O error.
    pub fn fail_next_write(&self) {
        self.shared.lock().fail_next_write = true;
    }

    /// All data passed to `send()`, one element per call.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.shared.lock().sent.iter().map(|r| r.data.clone()).collect()
    }

    /// Sent data as text with the terminator removed.
    pub fn sent_lines(&self) -> Vec<String> {
        self.shared
            .lock()
            .sent
            .iter()
            .map(|r| {
                String::from_utf8_lossy(&r.data)
                    .trim_end_matches(['\r', '\n'])
                    .to_string()
            })
            .collect()
    }

    /// When each `send()` happened.
    pub fn sent_times(&self) -> Vec<Instant> {
        self.shared.lock().sent.iter().map(|r| r.at).collect()
    }

    /// How many times the transport was actually opened.
    pub fn open_count(&self) -> u32 {
        self.shared.lock().open_count
    }

    /// How many times an open transport was closed.
    pub fn close_count(&self) -> u32 {
        self.shared.lock().close_count
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().open
    }

    /// Return the number of expectations that have not yet been consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.shared.lock().expectations.len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<()> {
        let mut st = self.shared.lock();
        if st.failing_opens > 0 {
            st.failing_opens -= 1;
            return Err(Error::Open("mock port busy".into()));
        }
        if !st.available {
            return Err(Error::Open("mock port unavailable".into()));
        }
        if !st.open {
            st.open = true;
            st.lost = false;
            st.open_count += 1;
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut st = self.shared.lock();
        if !st.open {
            return Err(Error::NotConnected);
        }
        if st.drop_next_write {
            st.drop_next_write = false;
            st.open = false;
            st.inbound.clear();
            return Err(Error::NotConnected);
        }
        if st.fail_next_write {
            st.fail_next_write = false;
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock write failure",
            )));
        }

        st.sent.push(SentRecord {
            data: data.to_vec(),
            at: Instant::now(),
        });

        match st.expectations.pop_front() {
            Some(expectation) if expectation.request == data => {
                if let Some(response) = expectation.response {
                    st.inbound.extend(response);
                    drop(st);
                    self.shared.notify.notify_waiters();
                }
                Ok(())
            }
            Some(expectation) => Err(Error::Protocol(format!(
                "unexpected send data: expected {:?}, got {:?}",
                String::from_utf8_lossy(&expectation.request),
                String::from_utf8_lossy(data)
            ))),
            None => Err(Error::Protocol(
                "no more expectations in mock transport".into(),
            )),
        }
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            // Registered before the state check so a notify between the
            // check and the await is not missed.
            let notified = self.shared.notify.notified();
            {
                let mut st = self.shared.lock();
                if !st.open {
                    return Err(Error::NotConnected);
                }
                if st.lost {
                    st.lost = false;
                    st.open = false;
                    st.inbound.clear();
                    return Err(Error::ConnectionLost);
                }
                if !st.inbound.is_empty() {
                    let n = st.inbound.len().min(buf.len());
                    for (slot, byte) in buf.iter_mut().zip(st.inbound.drain(..n)) {
                        *slot = byte;
                    }
                    return Ok(n);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Timeout);
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let mut st = self.shared.lock();
        if st.open {
            st.open = false;
            st.close_count += 1;
        }
        st.inbound.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.lock().open
    }
}
