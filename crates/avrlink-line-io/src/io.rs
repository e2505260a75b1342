//! IO task types and implementation for line-protocol devices.
//!
//! One tokio task per device connection owns the transport, the command
//! queue, the response correlator and the connection state. Callers talk to it
//! only through the [`DeviceIo`] handle, so nothing in here needs a lock.
//!
//! The task runs a single `select!` loop woken by cancellation, a request
//! from the handle, the earliest timer (queue spacing, response deadline,
//! reconnect), or incoming bytes while the transport is open. Every time
//! source is `tokio::time`, so tests drive the whole engine on a paused
//! clock.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use avrlink_core::error::{Error, Result};
use avrlink_core::events::DeviceEvent;
use avrlink_core::transport::Transport;
use avrlink_core::types::{ConnectionPolicy, ConnectionState, OverflowPolicy};

use crate::correlator::{Correlation, Correlator};
use crate::protocol::{self, DecodeResult};
use crate::queue::{Command, CommandQueue, Reply};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Configuration for the line IO task.
#[derive(Debug, Clone)]
pub struct IoConfig {
    /// How long a written command waits for its reply.
    pub timeout: Duration,
    /// Minimum spacing between two writes.
    pub inter_command_delay: Duration,
    /// Queue length that triggers an overflow clear.
    pub queue_capacity: usize,
    /// When the transport is opened and closed.
    pub policy: ConnectionPolicy,
    /// Whether callers evicted by an overflow clear are told about it.
    pub overflow: OverflowPolicy,
    /// Wait between reconnect attempts (persistent policy).
    pub reconnect_delay: Duration,
    /// Reconnect attempts before giving up. `0` retries forever.
    pub max_reconnect_attempts: u32,
    /// Granularity of reads while the transport is open.
    pub read_timeout: Duration,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            inter_command_delay: Duration::from_millis(1000),
            queue_capacity: 50,
            policy: ConnectionPolicy::PerCommand,
            overflow: OverflowPolicy::Silent,
            reconnect_delay: Duration::from_millis(1000),
            max_reconnect_attempts: 5,
            read_timeout: Duration::from_millis(100),
        }
    }
}

/// A request sent from the [`DeviceIo`] handle to the IO task.
pub enum Request {
    /// Queue a command. `reply` is `None` for fire-and-forget.
    Execute {
        body: String,
        reply: Option<Reply>,
    },
    /// Open the transport now, if it is not open already.
    Connect { reply: oneshot::Sender<Result<()>> },
    /// Report the engine's current state.
    Snapshot { reply: oneshot::Sender<IoSnapshot> },
    /// Graceful shutdown; returns the transport for recovery.
    Shutdown {
        reply: oneshot::Sender<Box<dyn Transport>>,
    },
}

/// Point-in-time view of the IO task's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoSnapshot {
    pub connection: ConnectionState,
    /// Commands waiting to be written.
    pub queued: usize,
    /// Keys of written commands awaiting a reply, sorted.
    pub pending: Vec<String>,
    /// `true` when nothing is in flight and the spacing interval has passed.
    pub ready: bool,
    /// The most recent transport-level failure, if any.
    pub last_error: Option<String>,
}

/// Sink for lines that answer no pending command.
///
/// Each device family implements this to turn status pushes into
/// [`DeviceEvent`]s. The IO task calls [`StatusHandler::process`] for every
/// unsolicited line, including late replies to commands that already timed
/// out.
pub trait StatusHandler: Send + Sync + 'static {
    fn process(&self, line: &str, event_tx: &broadcast::Sender<DeviceEvent>);
}

/// Status handler that forwards every line as [`DeviceEvent::Unsolicited`].
pub struct RawStatusHandler;

impl StatusHandler for RawStatusHandler {
    fn process(&self, line: &str, event_tx: &broadcast::Sender<DeviceEvent>) {
        let _ = event_tx.send(DeviceEvent::Unsolicited {
            line: line.to_string(),
        });
    }
}

/// Handle to the IO task. Stored inside the device driver struct.
pub struct DeviceIo {
    /// Request channel into the IO task.
    pub tx: mpsc::UnboundedSender<Request>,
    /// Event channel the IO task publishes on.
    pub event_tx: broadcast::Sender<DeviceEvent>,
    /// Cancellation token for abrupt shutdown.
    pub cancel: CancellationToken,
    /// Join handle for the IO task.
    pub task: JoinHandle<()>,
}

impl DeviceIo {
    /// Submit a command. The outcome, if wanted, arrives through `reply`.
    ///
    /// Never waits. Only fails with [`Error::NotConnected`] when the IO task
    /// is gone.
    pub fn execute(&self, body: impl Into<String>, reply: Option<Reply>) -> Result<()> {
        self.tx
            .send(Request::Execute {
                body: body.into(),
                reply,
            })
            .map_err(|_| Error::NotConnected)
    }

    /// Submit a command and wait for its reply line (without terminator).
    ///
    /// A command evicted by a silent queue-overflow clear reports
    /// [`Error::Dropped`].
    pub async fn command(&self, body: impl Into<String>) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.execute(body, Some(reply_tx))?;
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Dropped),
        }
    }

    /// Submit a fire-and-forget command.
    pub fn send(&self, body: impl Into<String>) -> Result<()> {
        self.execute(body, None)
    }

    /// Open the transport now. Succeeds immediately if already open.
    pub async fn connect(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request::Connect { reply: reply_tx })
            .map_err(|_| Error::NotConnected)?;
        reply_rx.await.map_err(|_| Error::NotConnected)?
    }

    /// Current connection, queue and correlator state.
    pub async fn snapshot(&self) -> Result<IoSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request::Snapshot { reply: reply_tx })
            .map_err(|_| Error::NotConnected)?;
        reply_rx.await.map_err(|_| Error::NotConnected)
    }

    /// Subscribe to lifecycle and status events.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.event_tx.subscribe()
    }

    /// Shut down the IO task and recover the transport.
    ///
    /// Queued and pending commands fail with [`Error::NotConnected`] and the
    /// transport is closed.
    pub async fn shutdown(self) -> Result<Box<dyn Transport>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Request::Shutdown { reply: reply_tx });
        let transport = reply_rx.await.map_err(|_| Error::NotConnected)?;
        let _ = self.task.await;
        Ok(transport)
    }
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Spawn the IO task. Returns the handle for submitting commands.
///
/// With the persistent policy the transport is opened right away; with the
/// per-command policy it stays closed until the first command needs it.
pub fn spawn_io_task(
    transport: Box<dyn Transport>,
    config: IoConfig,
    event_tx: broadcast::Sender<DeviceEvent>,
    status_handler: Box<dyn StatusHandler>,
) -> DeviceIo {
    let (tx, rx) = mpsc::unbounded_channel::<Request>();
    let cancel = CancellationToken::new();

    let task = IoTask::new(transport, config, event_tx.clone(), status_handler);
    let handle = tokio::spawn(task.run(rx, cancel.clone()));

    DeviceIo {
        tx,
        event_tx,
        cancel,
        task: handle,
    }
}

// ---------------------------------------------------------------------------
// IO Loop
// ---------------------------------------------------------------------------

/// Maximum buffer size before reset to prevent unbounded growth.
/// Lines are typically under 16 bytes; 8192 is generous headroom.
const MAX_BUF: usize = 8192;

#[derive(Debug, Clone, Copy)]
struct Reconnect {
    due: Instant,
    attempt: u32,
}

struct IoTask {
    transport: Box<dyn Transport>,
    config: IoConfig,
    event_tx: broadcast::Sender<DeviceEvent>,
    status_handler: Box<dyn StatusHandler>,
    queue: CommandQueue,
    correlator: Correlator,
    state: ConnectionState,
    last_error: Option<String>,
    line_buf: Vec<u8>,
    reconnect: Option<Reconnect>,
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl IoTask {
    fn new(
        transport: Box<dyn Transport>,
        config: IoConfig,
        event_tx: broadcast::Sender<DeviceEvent>,
        status_handler: Box<dyn StatusHandler>,
    ) -> Self {
        let queue = CommandQueue::new(config.queue_capacity);
        Self {
            transport,
            config,
            event_tx,
            status_handler,
            queue,
            correlator: Correlator::new(),
            state: ConnectionState::Closed,
            last_error: None,
            line_buf: Vec::new(),
            reconnect: None,
        }
    }

    /// The main IO loop. Runs as a spawned Tokio task.
    ///
    /// Uses `tokio::select! { biased; }` to prioritize:
    /// 1. Cancellation
    /// 2. Requests from the handle
    /// 3. Timers (spacing, deadlines, reconnect)
    /// 4. Incoming bytes
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Request>, cancel: CancellationToken) {
        if self.config.policy == ConnectionPolicy::Persistent && self.ensure_open().await.is_err()
        {
            self.schedule_reconnect(1);
        }

        let mut chunk = [0u8; 256];

        loop {
            self.dispatch_ready().await;

            let wake = self.next_wake(Instant::now());
            let reading = self.state == ConnectionState::Open;
            let read_timeout = self.config.read_timeout;

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("line IO task cancelled");
                    self.terminate().await;
                    break;
                }

                req = rx.recv() => {
                    match req {
                        Some(Request::Shutdown { reply }) => {
                            debug!("IO task shutdown requested");
                            self.terminate().await;
                            let _ = reply.send(self.transport);
                            return;
                        }
                        Some(req) => self.handle_request(req).await,
                        None => {
                            debug!("request channel closed, exiting IO task");
                            self.terminate().await;
                            break;
                        }
                    }
                }

                _ = sleep_until_opt(wake) => self.on_timer().await,

                res = self.transport.receive(&mut chunk, read_timeout), if reading => {
                    self.on_receive(res, &chunk).await;
                }
            }
        }
    }

    async fn handle_request(&mut self, req: Request) {
        match req {
            Request::Execute { body, reply } => self.submit(body, reply),
            Request::Connect { reply } => {
                let result = self.ensure_open().await;
                let _ = reply.send(result);
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(self.snapshot(Instant::now()));
            }
            Request::Shutdown { .. } => unreachable!("Shutdown handled in run loop"),
        }
    }

    fn snapshot(&self, now: Instant) -> IoSnapshot {
        IoSnapshot {
            connection: self.state,
            queued: self.queue.len(),
            pending: self.correlator.keys(),
            ready: self.queue.is_ready(now) && self.correlator.is_empty(),
            last_error: self.last_error.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Queue
    // -----------------------------------------------------------------------

    fn submit(&mut self, body: String, reply: Option<Reply>) {
        let command = Command::new(body, reply, Instant::now());
        debug!(key = %command.key, queued = self.queue.len(), "command submitted");

        let evicted = self.queue.push(command);
        if evicted.is_empty() {
            return;
        }

        let pending = self.correlator.drain();
        warn!(
            capacity = self.queue.capacity(),
            evicted = evicted.len(),
            pending = pending.len(),
            policy = %self.config.overflow,
            "command queue overflow, discarding queued and pending commands"
        );
        match self.config.overflow {
            OverflowPolicy::Silent => {}
            OverflowPolicy::Notify => {
                for command in evicted {
                    command.fail(Error::Dropped);
                }
                for entry in pending {
                    entry.complete(Err(Error::Dropped));
                }
            }
        }
    }

    /// Send queued commands while the channel allows it.
    async fn dispatch_ready(&mut self) {
        loop {
            let now = Instant::now();
            // A reply that is due must time out before the next write.
            self.expire_due(now).await;
            if !self.queue.is_ready(now) {
                return;
            }
            if self.reconnect.is_some() {
                return;
            }
            match self.queue.front() {
                None => return,
                // One pending response per key.
                Some(head) if self.correlator.contains(&head.key) => return,
                Some(_) => {}
            }
            let Some(command) = self.queue.pop(now, self.config.inter_command_delay) else {
                return;
            };
            self.dispatch(command).await;
        }
    }

    async fn dispatch(&mut self, command: Command) {
        let Command {
            body, key, reply, ..
        } = command;

        if let Err(e) = self.ensure_open().await {
            warn!(key = %key, error = %e, "dropping command, transport did not open");
            if let Some(reply) = reply {
                let _ = reply.send(Err(e));
            }
            return;
        }

        match self.write_line(&body).await {
            Ok(()) => {
                debug!(key = %key, "command written");
                match reply {
                    Some(reply) => {
                        self.correlator
                            .register(key, reply, Instant::now(), self.config.timeout);
                    }
                    None => self.close_if_idle().await,
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "write failed");
                let err = match e {
                    Error::Open(_) => e,
                    other => Error::Write(other.to_string()),
                };
                let reason = err.to_string();
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err));
                }
                self.drop_connection(reason).await;
            }
        }
    }

    /// Write one framed command. If the transport turns out not to be
    /// connected, fail the replies still pending on the dead link, reopen
    /// it and retry this write once.
    async fn write_line(&mut self, body: &str) -> Result<()> {
        let frame = protocol::frame(body);
        match self.transport.send(frame.as_bytes()).await {
            Err(Error::NotConnected) => {
                debug!("transport not connected on write, reopening");
                let reason = Error::NotConnected.to_string();
                self.last_error = Some(reason.clone());
                let flushed = self.correlator.fail_all(|| Error::ConnectionLost);
                if flushed > 0 {
                    warn!(flushed, "flushed pending responses after connection loss");
                }
                self.mark_closed(Some(reason));
                self.ensure_open().await?;
                self.transport.send(frame.as_bytes()).await
            }
            other => other,
        }
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    async fn ensure_open(&mut self) -> Result<()> {
        if self.state == ConnectionState::Open {
            return Ok(());
        }

        self.state = ConnectionState::Opening;
        match self.transport.open().await {
            Ok(()) => {
                self.state = ConnectionState::Open;
                self.reconnect = None;
                self.line_buf.clear();
                info!("transport open");
                let _ = self.event_tx.send(DeviceEvent::Connected);
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Closed;
                self.last_error = Some(e.to_string());
                warn!(error = %e, "transport open failed");
                Err(e)
            }
        }
    }

    /// Close the transport. Emits `Disconnected` only if it was open.
    async fn close(&mut self, reason: Option<String>) {
        let was_open = self.state == ConnectionState::Open;
        self.state = ConnectionState::Closing;
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "transport close failed");
        }
        if was_open {
            self.mark_closed(reason);
        } else {
            self.state = ConnectionState::Closed;
        }
    }

    fn mark_closed(&mut self, reason: Option<String>) {
        self.state = ConnectionState::Closed;
        info!(reason = reason.as_deref().unwrap_or("idle"), "transport closed");
        let _ = self.event_tx.send(DeviceEvent::Disconnected { reason });
    }

    /// Per-command policy: close once nothing is waiting for a reply.
    async fn close_if_idle(&mut self) {
        if self.config.policy == ConnectionPolicy::PerCommand
            && self.state == ConnectionState::Open
            && self.correlator.is_empty()
        {
            self.close(None).await;
        }
    }

    /// A transport-level failure: flush every pending response, close, and
    /// (persistent policy) schedule a reconnect.
    async fn drop_connection(&mut self, reason: String) {
        self.last_error = Some(reason.clone());
        let flushed = self.correlator.fail_all(|| Error::ConnectionLost);
        if flushed > 0 {
            warn!(flushed, "flushed pending responses after connection loss");
        }
        self.close(Some(reason)).await;
        if self.config.policy == ConnectionPolicy::Persistent {
            self.schedule_reconnect(1);
        }
    }

    fn schedule_reconnect(&mut self, attempt: u32) {
        let max = self.config.max_reconnect_attempts;
        if max > 0 && attempt > max {
            warn!(attempts = max, "giving up on reconnect, next command reopens");
            self.reconnect = None;
            return;
        }
        self.reconnect = Some(Reconnect {
            due: Instant::now() + self.config.reconnect_delay,
            attempt,
        });
    }

    async fn try_reconnect(&mut self, attempt: u32) {
        self.reconnect = None;
        info!(attempt, "reconnecting");
        let _ = self.event_tx.send(DeviceEvent::Reconnecting { attempt });
        if self.ensure_open().await.is_err() {
            self.schedule_reconnect(attempt + 1);
        }
    }

    /// Fail everything outstanding and close. Used on shutdown.
    async fn terminate(&mut self) {
        for command in self.queue.clear() {
            command.fail(Error::NotConnected);
        }
        self.correlator.fail_all(|| Error::NotConnected);
        self.reconnect = None;
        self.close(None).await;
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn next_wake(&self, now: Instant) -> Option<Instant> {
        [
            self.queue.next_wake(now),
            self.correlator.next_deadline(),
            self.reconnect.map(|r| r.due),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();
        self.expire_due(now).await;

        if let Some(reconnect) = self.reconnect {
            if now >= reconnect.due {
                self.try_reconnect(reconnect.attempt).await;
            }
        }
    }

    async fn expire_due(&mut self, now: Instant) {
        let expired = self.correlator.expire(now);
        for key in &expired {
            warn!(
                key = %key,
                timeout_ms = self.config.timeout.as_millis() as u64,
                "no acknowledgement before deadline"
            );
        }
        if !expired.is_empty() {
            self.close_if_idle().await;
        }
    }

    // -----------------------------------------------------------------------
    // Incoming lines
    // -----------------------------------------------------------------------

    async fn on_receive(&mut self, res: Result<usize>, chunk: &[u8]) {
        match res {
            Ok(n) => {
                self.line_buf.extend_from_slice(&chunk[..n]);
                self.process_lines().await;
                // Only an unterminated tail can be left here.
                if self.line_buf.len() > MAX_BUF {
                    warn!(len = self.line_buf.len(), "line buffer overflow, resetting");
                    self.line_buf.clear();
                }
            }
            Err(Error::Timeout) => {}
            Err(e) => {
                warn!(error = %e, "transport read failed");
                self.drop_connection(e.to_string()).await;
            }
        }
    }

    async fn process_lines(&mut self) {
        loop {
            match protocol::decode_line(&self.line_buf) {
                DecodeResult::Line { line, consumed } => {
                    self.line_buf.drain(..consumed);
                    self.on_line(&line).await;
                }
                DecodeResult::Garbage(consumed) => {
                    self.line_buf.drain(..consumed);
                    debug!(consumed, "discarding unusable line");
                }
                DecodeResult::Incomplete => break,
            }
        }
    }

    async fn on_line(&mut self, line: &str) {
        match self.correlator.resolve(line) {
            Correlation::Resolved { key } => {
                debug!(key = %key, line, "response matched");
                self.close_if_idle().await;
            }
            Correlation::Unsolicited => {
                debug!(line, "unsolicited line");
                self.status_handler.process(line, &self.event_tx);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use avrlink_test_harness::{MockHandle, MockTransport};

    const SEC: Duration = Duration::from_secs(1);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn test_config() -> IoConfig {
        IoConfig::default()
    }

    fn persistent_config() -> IoConfig {
        IoConfig {
            policy: ConnectionPolicy::Persistent,
            ..test_config()
        }
    }

    fn spawn(mock: MockTransport, config: IoConfig) -> (DeviceIo, MockHandle) {
        let handle = mock.handle();
        let (event_tx, _) = broadcast::channel(64);
        let io = spawn_io_task(Box::new(mock), config, event_tx, Box::new(RawStatusHandler));
        (io, handle)
    }

    fn drain_events(rx: &mut broadcast::Receiver<DeviceEvent>) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    // =======================================================================
    // Config and handle
    // =======================================================================

    #[test]
    fn io_config_defaults() {
        let config = IoConfig::default();
        assert_eq!(config.timeout, SEC);
        assert_eq!(config.inter_command_delay, SEC);
        assert_eq!(config.queue_capacity, 50);
        assert_eq!(config.policy, ConnectionPolicy::PerCommand);
        assert_eq!(config.overflow, OverflowPolicy::Silent);
    }

    #[tokio::test]
    async fn handle_reports_not_connected_when_task_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let (event_tx, _) = broadcast::channel(4);
        let io = DeviceIo {
            tx,
            event_tx,
            cancel: CancellationToken::new(),
            task: tokio::spawn(async {}),
        };
        assert!(matches!(io.send("@PWR:?\r"), Err(Error::NotConnected)));
        assert!(matches!(io.command("@PWR:?\r").await, Err(Error::NotConnected)));
        assert!(matches!(io.connect().await, Err(Error::NotConnected)));
    }

    // =======================================================================
    // Request/response
    // =======================================================================

    #[tokio::test(start_paused = true)]
    async fn power_query_resolves() {
        let mut mock = MockTransport::new();
        mock.expect(b"@PWR:?\r", b"@PWR:2\r");
        let (io, handle) = spawn(mock, test_config());

        let line = io.command("@PWR:?\r").await.unwrap();
        assert_eq!(line, "@PWR:2");
        assert_eq!(handle.remaining_expectations(), 0);

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn body_without_terminator_is_framed() {
        let mut mock = MockTransport::new();
        mock.expect(b"@AMT:?\r", b"@AMT:1\r");
        let (io, _handle) = spawn(mock, test_config());

        assert_eq!(io.command("@AMT:?").await.unwrap(), "@AMT:1");

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn default_timing_keeps_one_reply_outstanding() {
        let mut mock = MockTransport::new();
        mock.expect_no_reply(b"@PWR:?\r");
        mock.expect_no_reply(b"@VOL:?\r");
        let (io, _handle) = spawn(mock, persistent_config());

        let (tx1, rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        io.execute("@PWR:?\r", Some(tx1)).unwrap();
        io.execute("@VOL:?\r", Some(tx2)).unwrap();

        tokio::time::sleep(ms(500)).await;
        let snapshot = io.snapshot().await.unwrap();
        assert_eq!(snapshot.pending, ["@PWR"]);
        assert_eq!(snapshot.queued, 1);

        tokio::time::sleep(ms(550)).await;
        assert!(matches!(rx1.await.unwrap(), Err(Error::Timeout)));
        let snapshot = io.snapshot().await.unwrap();
        assert_eq!(snapshot.pending, ["@VOL"]);
        assert_eq!(snapshot.queued, 0);

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_then_late_line_is_unsolicited() {
        let mut mock = MockTransport::new();
        mock.expect_no_reply(b"@VOL:0+050\r");
        let config = IoConfig {
            policy: ConnectionPolicy::Persistent,
            ..test_config()
        };
        let (io, handle) = spawn(mock, config);
        let mut events = io.subscribe();

        let start = Instant::now();
        let result = io.command("@VOL:0+050\r").await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(start.elapsed() >= SEC && start.elapsed() < SEC + ms(100));
        assert!(io.snapshot().await.unwrap().pending.is_empty());

        handle.push_line("@VOL:0+050");
        tokio::time::sleep(ms(200)).await;

        let unsolicited: Vec<_> = drain_events(&mut events)
            .into_iter()
            .filter(|e| matches!(e, DeviceEvent::Unsolicited { .. }))
            .collect();
        assert_eq!(
            unsolicited,
            [DeviceEvent::Unsolicited {
                line: "@VOL:0+050".into()
            }]
        );

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_key_does_not_resolve() {
        let mut mock = MockTransport::new();
        mock.expect(b"@PWR:?\r", b"@VOL:0-350\r");
        let (io, _handle) = spawn(mock, persistent_config());
        let mut events = io.subscribe();

        let (reply_tx, mut reply_rx) = oneshot::channel();
        io.execute("@PWR:?\r", Some(reply_tx)).unwrap();
        tokio::time::sleep(ms(500)).await;

        assert!(reply_rx.try_recv().is_err());
        assert_eq!(io.snapshot().await.unwrap().pending, ["@PWR"]);
        assert!(drain_events(&mut events).contains(&DeviceEvent::Unsolicited {
            line: "@VOL:0-350".into()
        }));

        assert!(matches!(reply_rx.await.unwrap(), Err(Error::Timeout)));

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn commands_are_sent_in_order_with_spacing() {
        let mut mock = MockTransport::new();
        mock.expect(b"@PWR:?\r", b"@PWR:2\r");
        mock.expect(b"@AMT:?\r", b"@AMT:1\r");
        mock.expect(b"@VOL:?\r", b"@VOL:0-350\r");
        let (io, handle) = spawn(mock, persistent_config());

        let mut replies = Vec::new();
        for body in ["@PWR:?\r", "@AMT:?\r", "@VOL:?\r"] {
            let (tx, rx) = oneshot::channel();
            io.execute(body, Some(tx)).unwrap();
            replies.push(rx);
        }
        let mut lines = Vec::new();
        for rx in replies {
            lines.push(rx.await.unwrap().unwrap());
        }
        assert_eq!(lines, ["@PWR:2", "@AMT:1", "@VOL:0-350"]);

        assert_eq!(handle.sent_lines(), ["@PWR:?", "@AMT:?", "@VOL:?"]);
        let times = handle.sent_times();
        assert!(times[1] - times[0] >= SEC);
        assert!(times[2] - times[1] >= SEC);

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_waits_for_previous_reply() {
        let mut mock = MockTransport::new();
        mock.expect_no_reply(b"@PWR:?\r");
        mock.expect(b"@PWR:2\r", b"@PWR:2\r");
        let config = IoConfig {
            timeout: ms(3000),
            inter_command_delay: ms(100),
            ..persistent_config()
        };
        let (io, handle) = spawn(mock, config);

        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        io.execute("@PWR:?\r", Some(first_tx)).unwrap();
        io.execute("@PWR:2\r", Some(second_tx)).unwrap();

        assert!(matches!(first_rx.await.unwrap(), Err(Error::Timeout)));
        assert_eq!(second_rx.await.unwrap().unwrap(), "@PWR:2");

        let times = handle.sent_times();
        assert!(times[1] - times[0] >= ms(3000));

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fire_and_forget_is_written_but_not_awaited() {
        let mut mock = MockTransport::new();
        mock.expect_no_reply(b"@TTO:0\r");
        mock.expect(b"@VOL:?\r", b"@VOL:0-200\r");
        let (io, handle) = spawn(mock, test_config());

        io.send("@TTO:0\r").unwrap();
        let line = io.command("@VOL:?\r").await.unwrap();
        assert_eq!(line, "@VOL:0-200");
        assert_eq!(handle.sent_lines(), ["@TTO:0", "@VOL:?"]);

        let _ = io.shutdown().await;
    }

    // =======================================================================
    // Overflow
    // =======================================================================

    #[tokio::test(start_paused = true)]
    async fn overflow_silently_drops_queue_and_pending() {
        let mut mock = MockTransport::new();
        mock.expect_no_reply(b"@PWR:?\r");
        mock.expect(b"@SRC:?\r", b"@SRC:1\r");
        let config = IoConfig {
            queue_capacity: 2,
            ..persistent_config()
        };
        let (io, handle) = spawn(mock, config);

        let (pwr_tx, pwr_rx) = oneshot::channel();
        io.execute("@PWR:?\r", Some(pwr_tx)).unwrap();
        tokio::time::sleep(ms(10)).await;
        assert_eq!(io.snapshot().await.unwrap().pending, ["@PWR"]);

        let (amt_tx, amt_rx) = oneshot::channel();
        let (vol_tx, vol_rx) = oneshot::channel();
        io.execute("@AMT:?\r", Some(amt_tx)).unwrap();
        io.execute("@VOL:?\r", Some(vol_tx)).unwrap();
        // Third queued command overflows capacity 2.
        let (src_tx, src_rx) = oneshot::channel();
        io.execute("@SRC:?\r", Some(src_tx)).unwrap();

        assert!(pwr_rx.await.is_err(), "pending continuation must be dropped");
        assert!(amt_rx.await.is_err());
        assert!(vol_rx.await.is_err());
        assert_eq!(src_rx.await.unwrap().unwrap(), "@SRC:1");
        assert_eq!(handle.sent_lines(), ["@PWR:?", "@SRC:?"]);

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_notify_reports_dropped() {
        let mut mock = MockTransport::new();
        mock.expect_no_reply(b"@PWR:?\r");
        mock.expect(b"@SRC:?\r", b"@SRC:1\r");
        let config = IoConfig {
            queue_capacity: 1,
            overflow: OverflowPolicy::Notify,
            ..persistent_config()
        };
        let (io, _handle) = spawn(mock, config);

        let pwr = {
            let (tx, rx) = oneshot::channel();
            io.execute("@PWR:?\r", Some(tx)).unwrap();
            rx
        };
        tokio::time::sleep(ms(10)).await;

        let amt = {
            let (tx, rx) = oneshot::channel();
            io.execute("@AMT:?\r", Some(tx)).unwrap();
            rx
        };
        let (src_tx, src_rx) = oneshot::channel();
        io.execute("@SRC:?\r", Some(src_tx)).unwrap();

        assert!(matches!(pwr.await.unwrap(), Err(Error::Dropped)));
        assert!(matches!(amt.await.unwrap(), Err(Error::Dropped)));
        assert_eq!(src_rx.await.unwrap().unwrap(), "@SRC:1");

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn command_helper_maps_silent_drop() {
        let mut mock = MockTransport::new();
        mock.expect_no_reply(b"@PWR:?\r");
        mock.expect_no_reply(b"@VOL:?\r");
        let config = IoConfig {
            queue_capacity: 1,
            ..persistent_config()
        };
        let (io, _handle) = spawn(mock, config);

        let io = std::sync::Arc::new(io);
        let first = {
            let io = io.clone();
            tokio::spawn(async move { io.command("@PWR:?\r").await })
        };
        tokio::time::sleep(ms(10)).await;
        io.send("@AMT:?\r").unwrap();
        io.send("@VOL:?\r").unwrap();

        assert!(matches!(first.await.unwrap(), Err(Error::Dropped)));
    }

    // =======================================================================
    // Connection lifecycle
    // =======================================================================

    #[tokio::test(start_paused = true)]
    async fn per_command_opens_and_closes_each_time() {
        let mut mock = MockTransport::new();
        mock.expect(b"@PWR:?\r", b"@PWR:2\r");
        mock.expect(b"@AMT:?\r", b"@AMT:1\r");
        let (io, handle) = spawn(mock, test_config());
        let mut events = io.subscribe();

        assert_eq!(handle.open_count(), 0);
        io.command("@PWR:?\r").await.unwrap();
        tokio::time::sleep(ms(10)).await;
        assert!(!handle.is_open());
        io.command("@AMT:?\r").await.unwrap();
        tokio::time::sleep(ms(10)).await;

        assert_eq!(handle.open_count(), 2);
        assert_eq!(handle.close_count(), 2);
        let snap = io.snapshot().await.unwrap();
        assert_eq!(snap.connection, ConnectionState::Closed);

        assert_eq!(
            drain_events(&mut events),
            [
                DeviceEvent::Connected,
                DeviceEvent::Disconnected { reason: None },
                DeviceEvent::Connected,
                DeviceEvent::Disconnected { reason: None },
            ]
        );

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn per_command_closes_after_timeout() {
        let mut mock = MockTransport::new();
        mock.expect_no_reply(b"@PWR:?\r");
        let (io, handle) = spawn(mock, test_config());

        assert!(matches!(io.command("@PWR:?\r").await, Err(Error::Timeout)));
        tokio::time::sleep(ms(10)).await;
        assert!(!handle.is_open());
        assert_eq!(handle.close_count(), 1);

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_opens_eagerly_and_stays_open() {
        let mut mock = MockTransport::new();
        mock.expect(b"@PWR:?\r", b"@PWR:2\r");
        mock.expect(b"@AMT:?\r", b"@AMT:1\r");
        let (io, handle) = spawn(mock, persistent_config());

        tokio::time::sleep(ms(10)).await;
        assert!(handle.is_open());

        io.command("@PWR:?\r").await.unwrap();
        io.command("@AMT:?\r").await.unwrap();
        assert_eq!(handle.open_count(), 1);
        assert_eq!(handle.close_count(), 0);

        let _ = io.shutdown().await;
        assert!(!handle.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let (io, handle) = spawn(MockTransport::new(), persistent_config());

        io.connect().await.unwrap();
        io.connect().await.unwrap();
        assert_eq!(handle.open_count(), 1);
        assert_eq!(
            io.snapshot().await.unwrap().connection,
            ConnectionState::Open
        );

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn open_failure_fails_only_that_command() {
        let mut mock = MockTransport::new();
        mock.expect(b"@AMT:?\r", b"@AMT:2\r");
        let handle = mock.handle();
        handle.fail_next_opens(1);
        let (io, _) = spawn(mock, test_config());

        assert!(matches!(io.command("@PWR:?\r").await, Err(Error::Open(_))));
        let snap = io.snapshot().await.unwrap();
        assert_eq!(snap.connection, ConnectionState::Closed);
        assert!(snap.last_error.unwrap().contains("mock port busy"));

        assert_eq!(io.command("@AMT:?\r").await.unwrap(), "@AMT:2");

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn write_on_dropped_port_reopens_and_retries_once() {
        let mut mock = MockTransport::new();
        mock.expect(b"@PWR:?\r", b"@PWR:2\r");
        let (io, handle) = spawn(mock, persistent_config());
        tokio::time::sleep(ms(10)).await;

        handle.drop_next_write();
        assert_eq!(io.command("@PWR:?\r").await.unwrap(), "@PWR:2");
        assert_eq!(handle.open_count(), 2);
        assert_eq!(handle.sent_lines(), ["@PWR:?"]);

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_port_on_write_flushes_pending_before_retry() {
        let mut mock = MockTransport::new();
        mock.expect_no_reply(b"@PWR:?\r");
        mock.expect(b"@VOL:?\r", b"@VOL:0-350\r");
        let config = IoConfig {
            timeout: ms(5000),
            inter_command_delay: ms(100),
            ..persistent_config()
        };
        let (io, handle) = spawn(mock, config);

        let start = Instant::now();
        let (pwr_tx, pwr_rx) = oneshot::channel();
        io.execute("@PWR:?\r", Some(pwr_tx)).unwrap();
        tokio::time::sleep(ms(10)).await;

        handle.drop_next_write();
        assert_eq!(io.command("@VOL:?\r").await.unwrap(), "@VOL:0-350");
        assert!(matches!(pwr_rx.await.unwrap(), Err(Error::ConnectionLost)));
        assert!(start.elapsed() < SEC * 5);
        assert_eq!(handle.open_count(), 2);

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn write_error_fails_command_and_flushes_others() {
        let mut mock = MockTransport::new();
        mock.expect_no_reply(b"@PWR:?\r");
        let config = IoConfig {
            timeout: ms(5000),
            inter_command_delay: ms(100),
            ..persistent_config()
        };
        let (io, handle) = spawn(mock, config);

        let (pwr_tx, pwr_rx) = oneshot::channel();
        io.execute("@PWR:?\r", Some(pwr_tx)).unwrap();
        tokio::time::sleep(ms(10)).await;

        handle.fail_next_write();
        let vol = io.command("@VOL:?\r").await;
        assert!(matches!(vol, Err(Error::Write(_))), "got {vol:?}");
        assert!(matches!(pwr_rx.await.unwrap(), Err(Error::ConnectionLost)));
        assert!(!handle.is_open());

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_flushes_all_pending() {
        let mut mock = MockTransport::new();
        mock.expect_no_reply(b"@PWR:?\r");
        mock.expect_no_reply(b"@VOL:?\r");
        let config = IoConfig {
            timeout: ms(5000),
            inter_command_delay: ms(100),
            ..persistent_config()
        };
        let (io, handle) = spawn(mock, config);
        let mut events = io.subscribe();

        let (pwr_tx, pwr_rx) = oneshot::channel();
        let (vol_tx, vol_rx) = oneshot::channel();
        io.execute("@PWR:?\r", Some(pwr_tx)).unwrap();
        io.execute("@VOL:?\r", Some(vol_tx)).unwrap();
        tokio::time::sleep(ms(200)).await;
        assert_eq!(io.snapshot().await.unwrap().pending, ["@PWR", "@VOL"]);

        let start = Instant::now();
        handle.disconnect();
        assert!(matches!(pwr_rx.await.unwrap(), Err(Error::ConnectionLost)));
        assert!(matches!(vol_rx.await.unwrap(), Err(Error::ConnectionLost)));
        assert!(start.elapsed() < SEC);
        assert!(io.snapshot().await.unwrap().pending.is_empty());

        assert!(drain_events(&mut events).contains(&DeviceEvent::Disconnected {
            reason: Some("connection lost".into())
        }));

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_reconnects_after_drop() {
        let mut mock = MockTransport::new();
        mock.expect(b"@PWR:?\r", b"@PWR:2\r");
        let config = IoConfig {
            reconnect_delay: ms(500),
            ..persistent_config()
        };
        let (io, handle) = spawn(mock, config);
        let mut events = io.subscribe();
        tokio::time::sleep(ms(10)).await;

        handle.set_available(false);
        handle.disconnect();
        tokio::time::sleep(ms(200)).await;

        // Queued while the reconnect is pending; sent once reopened.
        let pwr = io.command("@PWR:?\r");
        let restore = async {
            tokio::time::sleep(ms(600)).await;
            handle.set_available(true);
        };
        let (pwr, ()) = tokio::join!(pwr, restore);
        assert_eq!(pwr.unwrap(), "@PWR:2");
        assert_eq!(handle.open_count(), 2);

        let events = drain_events(&mut events);
        assert!(events.contains(&DeviceEvent::Reconnecting { attempt: 1 }));
        assert!(events.contains(&DeviceEvent::Reconnecting { attempt: 2 }));
        assert_eq!(events.last(), Some(&DeviceEvent::Connected));

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_gives_up_then_opens_lazily() {
        let mut mock = MockTransport::new();
        mock.expect(b"@PWR:?\r", b"@PWR:2\r");
        let handle = mock.handle();
        handle.set_available(false);
        let config = IoConfig {
            reconnect_delay: ms(100),
            max_reconnect_attempts: 2,
            ..persistent_config()
        };
        let (io, _) = spawn(mock, config);
        let mut events = io.subscribe();

        tokio::time::sleep(SEC).await;
        let reconnects: Vec<_> = drain_events(&mut events)
            .into_iter()
            .filter(|e| matches!(e, DeviceEvent::Reconnecting { .. }))
            .collect();
        assert_eq!(reconnects.len(), 2);
        assert_eq!(handle.open_count(), 0);

        handle.set_available(true);
        assert_eq!(io.command("@PWR:?\r").await.unwrap(), "@PWR:2");
        assert_eq!(handle.open_count(), 1);

        let _ = io.shutdown().await;
    }

    // =======================================================================
    // Incoming data
    // =======================================================================

    #[tokio::test(start_paused = true)]
    async fn unsolicited_lines_reach_status_handler() {
        let (io, handle) = spawn(MockTransport::new(), persistent_config());
        let mut events = io.subscribe();
        tokio::time::sleep(ms(10)).await;

        handle.push_bytes(b"@AMT:2\r\n@SRC:C\r\r");
        tokio::time::sleep(ms(200)).await;

        let lines: Vec<_> = drain_events(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                DeviceEvent::Unsolicited { line } => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(lines, ["@AMT:2", "@SRC:C"]);

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn response_split_across_reads() {
        let mut mock = MockTransport::new();
        mock.expect(b"@VOL:?\r", b"@VOL:");
        let (io, handle) = spawn(mock, persistent_config());

        let vol = io.command("@VOL:?\r");
        let rest = async {
            tokio::time::sleep(ms(300)).await;
            handle.push_bytes(b"0-350\r");
        };
        let (vol, ()) = tokio::join!(vol, rest);
        assert_eq!(vol.unwrap(), "@VOL:0-350");

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_garbage_is_discarded() {
        let mut mock = MockTransport::new();
        mock.expect(b"@PWR:?\r", b"@PWR:2\r");
        let (io, handle) = spawn(mock, persistent_config());
        tokio::time::sleep(ms(10)).await;

        handle.push_bytes(&vec![b'A'; MAX_BUF + 100]);
        tokio::time::sleep(ms(500)).await;

        assert_eq!(io.command("@PWR:?\r").await.unwrap(), "@PWR:2");

        let _ = io.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reply_completing_a_long_line_survives_buffer_cap() {
        let mut mock = MockTransport::new();
        mock.expect_no_reply(b"@PWR:?\r");
        let config = IoConfig {
            timeout: ms(5000),
            ..persistent_config()
        };
        let (io, handle) = spawn(mock, config);

        let (pwr_tx, pwr_rx) = oneshot::channel();
        io.execute("@PWR:?\r", Some(pwr_tx)).unwrap();
        tokio::time::sleep(ms(10)).await;

        handle.push_bytes(&vec![b'A'; MAX_BUF - 40]);
        tokio::time::sleep(ms(10)).await;
        let mut tail = vec![b'A'; 64];
        tail.extend_from_slice(b"\r@PWR:2\r");
        handle.push_bytes(&tail);

        assert_eq!(pwr_rx.await.unwrap().unwrap(), "@PWR:2");

        let _ = io.shutdown().await;
    }

    // =======================================================================
    // Shutdown
    // =======================================================================

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_outstanding_and_returns_transport() {
        let mut mock = MockTransport::new();
        mock.expect_no_reply(b"@PWR:?\r");
        let (io, handle) = spawn(mock, persistent_config());

        let (pwr_tx, pwr_rx) = oneshot::channel();
        let (amt_tx, amt_rx) = oneshot::channel();
        io.execute("@PWR:?\r", Some(pwr_tx)).unwrap();
        io.execute("@AMT:?\r", Some(amt_tx)).unwrap();
        tokio::time::sleep(ms(10)).await;

        let transport = io.shutdown().await.unwrap();
        assert!(!transport.is_connected());
        assert!(!handle.is_open());
        assert!(matches!(pwr_rx.await.unwrap(), Err(Error::NotConnected)));
        assert!(matches!(amt_rx.await.unwrap(), Err(Error::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_task() {
        let (io, handle) = spawn(MockTransport::new(), persistent_config());
        tokio::time::sleep(ms(10)).await;

        io.cancel.cancel();
        let _ = io.task.await;
        assert!(!handle.is_open());
    }
}
