// Copyright 2025 The Drasi Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Connection supervision: one background task per session driving
//! connect → run → reconnect, plus the thread-safe handoff for outbound writes.
//!
//! ```text
//!            start()
//!   Idle ─────────────► Connecting ──ok──► Connected
//!                          ▲    │              │ I/O error / remote close
//!                          │    │ failure      ▼
//!                          └────┴──────── ReconnectWait
//!                                 (auto_reconnect = false: Terminated)
//!   any state ── stop() ──► Terminated
//! ```
//!
//! Transport failures never escape the task; they become state transitions
//! and log lines. Callers see soft failures (`send` returning `false`) and
//! timeouts only.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result, TransportError};

/// Upper bound a caller waits for an outbound write to be acknowledged.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound `stop()` waits for the session task to finish.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Polling granularity of `wait_connected`.
pub const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const COMMAND_QUEUE_DEPTH: usize = 64;

/// Lifecycle state of a supervised session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    ReconnectWait,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Connecting => "Connecting",
            SessionState::Connected => "Connected",
            SessionState::ReconnectWait => "ReconnectWait",
            SessionState::Terminated => "Terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do after a failed connect or a lost connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub auto_reconnect: bool,
    pub reconnect_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Give up after the first failure.
    pub fn never() -> Self {
        Self {
            auto_reconnect: false,
            ..Self::default()
        }
    }
}

/// One physical connection to a remote endpoint, driven by a supervisor task.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Item handed over from callers by [`ConnectionSupervisor::send`].
    type Outbound: Send + 'static;

    /// Establish the connection and complete the protocol handshake.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Do one unit of receive/keepalive work on a live connection.
    ///
    /// Must be cancel-safe: the supervisor races it against outbound writes
    /// and shutdown.
    async fn next_event(&mut self) -> Result<(), TransportError>;

    /// Write one outbound item on a live connection.
    async fn write(&mut self, item: Self::Outbound) -> Result<(), TransportError>;

    /// Close the connection gracefully. Errors are ignored.
    async fn close(&mut self);
}

struct Command<O> {
    item: O,
    ack: oneshot::Sender<bool>,
}

type Pending<T> = (T, mpsc::Receiver<Command<<T as Transport>::Outbound>>);

/// Flags and state shared between the supervisor handle and its task.
struct Shared {
    name: String,
    state: watch::Sender<SessionState>,
    running: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn transition(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!("[{}] {prev} -> {next}", self.name);
        }
    }

    fn record_error(&self, err: &TransportError) {
        *self.last_error.lock() = Some(err.to_string());
    }
}

/// Owns the background task of one session.
pub struct ConnectionSupervisor<T: Transport> {
    shared: Arc<Shared>,
    policy: ReconnectPolicy,
    commands: mpsc::Sender<Command<T::Outbound>>,
    pending: Mutex<Option<Pending<T>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> ConnectionSupervisor<T> {
    /// Wrap a transport. Nothing runs until [`start`](Self::start).
    pub fn new(name: impl Into<String>, transport: T, policy: ReconnectPolicy) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state,
                running: AtomicBool::new(false),
                last_error: Mutex::new(None),
            }),
            policy,
            commands,
            pending: Mutex::new(Some((transport, command_rx))),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Spawn the session task and return immediately.
    ///
    /// A no-op while the task is running. Fails with [`Error::Terminated`]
    /// once the session has been stopped or has given up.
    pub fn start(&self) -> Result<()> {
        let mut task = self.task.lock();
        if self.shared.running.load(Ordering::Acquire) {
            debug!("[{}] start() ignored, already running", self.shared.name);
            return Ok(());
        }

        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime(self.shared.name.clone()))?;
        let (transport, commands) = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| Error::Terminated(self.shared.name.clone()))?;

        self.shared.running.store(true, Ordering::Release);
        info!("[{}] Starting session", self.shared.name);
        *task = Some(runtime.spawn(run_session(
            transport,
            commands,
            self.policy,
            Arc::clone(&self.shared),
            self.cancel.clone(),
        )));
        Ok(())
    }

    /// Signal termination and wait (bounded) for the task to finish.
    ///
    /// Safe to call repeatedly, and a no-op before `start()`.
    pub async fn stop(&self) {
        let handle = self.task.lock().take();
        let Some(mut handle) = handle else {
            return;
        };

        self.cancel.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => info!("[{}] Session stopped", self.shared.name),
            Ok(Err(e)) => error!("[{}] Session task failed: {e}", self.shared.name),
            Err(_) => {
                error!(
                    "[{}] Session did not stop within {STOP_TIMEOUT:?}, abandoning it",
                    self.shared.name
                );
                handle.abort();
            }
        }
        self.shared.running.store(false, Ordering::Release);
        self.shared.transition(SessionState::Terminated);
    }

    /// Hand an item to the session task and wait for the write to complete.
    ///
    /// Returns `false` without error when the session is not connected, the
    /// write failed, or no acknowledgement arrived within [`SEND_TIMEOUT`].
    /// Callers that ignore the result lose items sent while disconnected.
    pub async fn send(&self, item: T::Outbound) -> bool {
        if !self.is_connected() {
            debug!("[{}] Not connected, dropping outbound item", self.shared.name);
            return false;
        }

        let (ack, acked) = oneshot::channel();
        let handoff = async {
            self.commands.send(Command { item, ack }).await.ok()?;
            acked.await.ok()
        };

        match tokio::time::timeout(SEND_TIMEOUT, handoff).await {
            Ok(Some(written)) => written,
            Ok(None) => false,
            Err(_) => {
                warn!("[{}] Send not acknowledged within {SEND_TIMEOUT:?}", self.shared.name);
                false
            }
        }
    }

    /// Poll the connected flag until it is set or `timeout` elapses.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_connected() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::ConnectionTimeout {
                    endpoint: self.shared.name.clone(),
                    timeout,
                });
            }
            tokio::time::sleep(CONNECT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Receiver observing every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// The most recent transport failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }
}

impl<T: Transport> Drop for ConnectionSupervisor<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Ended {
    Stopped,
    Lost(TransportError),
}

async fn run_session<T: Transport>(
    mut transport: T,
    mut commands: mpsc::Receiver<Command<T::Outbound>>,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let name = shared.name.clone();

    'session: loop {
        shared.transition(SessionState::Connecting);
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = transport.connect() => result,
        };

        match attempt {
            Ok(()) => {
                info!("[{name}] Connected");
                shared.transition(SessionState::Connected);
                match drive(&mut transport, &mut commands, &cancel).await {
                    Ended::Stopped => {
                        transport.close().await;
                        break;
                    }
                    Ended::Lost(e) => {
                        warn!("[{name}] Connection lost: {e}");
                        shared.record_error(&e);
                        reject_queued(&mut commands);
                    }
                }
            }
            Err(e) => {
                error!("[{name}] Failed to connect: {e}");
                shared.record_error(&e);
            }
        }

        if !policy.auto_reconnect {
            info!("[{name}] Auto-reconnect disabled, giving up");
            break;
        }

        shared.transition(SessionState::ReconnectWait);
        info!("[{name}] Retrying connection in {:?}", policy.reconnect_interval);
        let backoff = tokio::time::sleep(policy.reconnect_interval);
        tokio::pin!(backoff);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'session,
                _ = &mut backoff => break,
                // Refuse sends that raced the disconnect.
                Some(Command { ack, .. }) = commands.recv() => {
                    let _ = ack.send(false);
                }
            }
        }
    }

    commands.close();
    reject_queued(&mut commands);
    shared.running.store(false, Ordering::Release);
    shared.transition(SessionState::Terminated);
    debug!("[{name}] Session task finished");
}

/// Serve outbound writes and inbound events until the link drops or stop is requested.
async fn drive<T: Transport>(
    transport: &mut T,
    commands: &mut mpsc::Receiver<Command<T::Outbound>>,
    cancel: &CancellationToken,
) -> Ended {
    loop {
        if cancel.is_cancelled() {
            return Ended::Stopped;
        }
        // Writes and inbound events are polled fairly.
        tokio::select! {
            _ = cancel.cancelled() => return Ended::Stopped,
            Some(Command { item, ack }) = commands.recv() => {
                match transport.write(item).await {
                    Ok(()) => {
                        let _ = ack.send(true);
                    }
                    Err(e) => {
                        let _ = ack.send(false);
                        return Ended::Lost(e);
                    }
                }
            }
            event = transport.next_event() => {
                if let Err(e) = event {
                    return Ended::Lost(e);
                }
            }
        }
    }
}

fn reject_queued<O>(commands: &mut mpsc::Receiver<Command<O>>) {
    while let Ok(Command { ack, .. }) = commands.try_recv() {
        let _ = ack.send(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Scripted transport: the first `failing_connects` attempts fail, and a
    /// live link drops whenever a unit is pushed through `drop_link`.
    struct ScriptedTransport {
        connects: Arc<AtomicUsize>,
        failing_connects: usize,
        drop_link: mpsc::UnboundedReceiver<()>,
        written: mpsc::UnboundedSender<u32>,
    }

    struct Recorder {
        connects: Arc<AtomicUsize>,
        drop_link: mpsc::UnboundedSender<()>,
        written: mpsc::UnboundedReceiver<u32>,
    }

    fn scripted(failing_connects: usize) -> (ScriptedTransport, Recorder) {
        let connects = Arc::new(AtomicUsize::new(0));
        let (drop_tx, drop_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        (
            ScriptedTransport {
                connects: connects.clone(),
                failing_connects,
                drop_link: drop_rx,
                written: written_tx,
            },
            Recorder {
                connects,
                drop_link: drop_tx,
                written: written_rx,
            },
        )
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        type Outbound = u32;

        async fn connect(&mut self) -> Result<(), TransportError> {
            let attempt = self.connects.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failing_connects {
                Err(TransportError::Rejected("scripted".into()))
            } else {
                Ok(())
            }
        }

        async fn next_event(&mut self) -> Result<(), TransportError> {
            match self.drop_link.recv().await {
                Some(()) => Err(TransportError::Closed),
                None => std::future::pending().await,
            }
        }

        async fn write(&mut self, item: u32) -> Result<(), TransportError> {
            self.written.send(item).map_err(|_| TransportError::Closed)
        }

        async fn close(&mut self) {}
    }

    fn policy(interval: Duration) -> ReconnectPolicy {
        ReconnectPolicy {
            auto_reconnect: true,
            reconnect_interval: interval,
        }
    }

    async fn wait_for_state(rx: &mut watch::Receiver<SessionState>, state: SessionState) {
        tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached in time")
            .expect("state channel closed");
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let (transport, recorder) = scripted(0);
        let supervisor = ConnectionSupervisor::new("idle", transport, ReconnectPolicy::default());

        supervisor.stop().await;
        supervisor.stop().await;
        assert_eq!(supervisor.state(), SessionState::Idle);
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 0);

        supervisor.start().unwrap();
        supervisor.wait_connected(Duration::from_secs(1)).await.unwrap();
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (transport, recorder) = scripted(0);
        let supervisor = ConnectionSupervisor::new("twice", transport, ReconnectPolicy::default());

        supervisor.start().unwrap();
        supervisor.start().unwrap();
        supervisor.wait_connected(Duration::from_secs(1)).await.unwrap();
        supervisor.start().unwrap();

        assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_send_while_disconnected_returns_false() {
        let (transport, mut recorder) = scripted(0);
        let supervisor = ConnectionSupervisor::new("offline", transport, ReconnectPolicy::default());

        assert!(!supervisor.send(1).await);
        assert!(recorder.written.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sends_are_written_in_order() {
        let (transport, mut recorder) = scripted(0);
        let supervisor = ConnectionSupervisor::new("fifo", transport, ReconnectPolicy::default());
        supervisor.start().unwrap();
        supervisor.wait_connected(Duration::from_secs(1)).await.unwrap();

        for i in 0..5 {
            assert!(supervisor.send(i).await);
        }
        for i in 0..5 {
            assert_eq!(recorder.written.recv().await, Some(i));
        }
        supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_link_loss() {
        let (transport, recorder) = scripted(0);
        let supervisor =
            ConnectionSupervisor::new("flaky", transport, policy(Duration::from_secs(2)));
        let mut states = supervisor.subscribe_state();

        supervisor.start().unwrap();
        wait_for_state(&mut states, SessionState::Connected).await;

        let lost_at = Instant::now();
        recorder.drop_link.send(()).unwrap();
        wait_for_state(&mut states, SessionState::ReconnectWait).await;
        assert!(!supervisor.is_connected());
        assert!(!supervisor.send(7).await);

        wait_for_state(&mut states, SessionState::Connected).await;
        assert!(lost_at.elapsed() <= Duration::from_secs(3));
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 2);
        assert_eq!(supervisor.last_error().as_deref(), Some("connection closed by remote endpoint"));

        supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_failed_connects() {
        let (transport, recorder) = scripted(2);
        let supervisor =
            ConnectionSupervisor::new("retry", transport, policy(Duration::from_secs(1)));

        supervisor.start().unwrap();
        supervisor.wait_connected(Duration::from_secs(10)).await.unwrap();
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 3);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_gives_up_without_auto_reconnect() {
        let (transport, recorder) = scripted(1);
        let supervisor = ConnectionSupervisor::new("once", transport, ReconnectPolicy::never());
        let mut states = supervisor.subscribe_state();

        supervisor.start().unwrap();
        wait_for_state(&mut states, SessionState::Terminated).await;
        assert!(!supervisor.is_running());
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);
        assert!(matches!(supervisor.start(), Err(Error::Terminated(_))));
    }

    #[tokio::test]
    async fn test_stop_interrupts_reconnect_wait() {
        let (transport, _recorder) = scripted(usize::MAX);
        let supervisor =
            ConnectionSupervisor::new("waiting", transport, policy(Duration::from_secs(3600)));
        let mut states = supervisor.subscribe_state();

        supervisor.start().unwrap();
        wait_for_state(&mut states, SessionState::ReconnectWait).await;

        let begun = std::time::Instant::now();
        supervisor.stop().await;
        assert!(begun.elapsed() < Duration::from_secs(1));
        assert_eq!(supervisor.state(), SessionState::Terminated);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_commands_queued_during_backoff_are_refused() {
        let (transport, mut recorder) = scripted(0);
        let supervisor =
            ConnectionSupervisor::new("backoff", transport, policy(Duration::from_secs(3600)));
        let mut states = supervisor.subscribe_state();

        supervisor.start().unwrap();
        wait_for_state(&mut states, SessionState::Connected).await;
        recorder.drop_link.send(()).unwrap();
        wait_for_state(&mut states, SessionState::ReconnectWait).await;

        // A send that passed the connected check just before the link dropped.
        let (ack, acked) = oneshot::channel();
        supervisor.commands.send(Command { item: 9, ack }).await.unwrap();
        let written = tokio::time::timeout(Duration::from_secs(1), acked)
            .await
            .expect("command left waiting through the backoff")
            .unwrap();

        assert!(!written);
        assert_eq!(supervisor.state(), SessionState::ReconnectWait);
        assert!(recorder.written.try_recv().is_err());
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_restart_after_stop_is_rejected() {
        let (transport, _recorder) = scripted(0);
        let supervisor = ConnectionSupervisor::new("once-only", transport, ReconnectPolicy::default());

        supervisor.start().unwrap();
        supervisor.stop().await;
        supervisor.stop().await;
        assert!(matches!(supervisor.start(), Err(Error::Terminated(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_connected_times_out() {
        let (transport, _recorder) = scripted(usize::MAX);
        let supervisor =
            ConnectionSupervisor::new("unreachable", transport, policy(Duration::from_secs(5)));
        supervisor.start().unwrap();

        let begun = Instant::now();
        let err = supervisor.wait_connected(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionTimeout { .. }));
        assert!(begun.elapsed() < Duration::from_millis(1200));
        assert!(supervisor.is_running());
        supervisor.stop().await;
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let (transport, _recorder) = scripted(0);
        let supervisor = ConnectionSupervisor::new("no-rt", transport, ReconnectPolicy::default());
        assert!(matches!(supervisor.start(), Err(Error::NoRuntime(_))));
        assert!(!supervisor.is_running());
    }
}
