//! Connection state machine
//!
//! One machine per device session. It owns the session's state, the retry
//! counter and the two timers (retry and connection timeout), and it is the
//! only thing that mutates them.
//!
//! Run it with `spawn`: a single task then serializes every request from a
//! `SessionHandle` with every timer expiry, so a transition can never race
//! another transition and a timer cannot fire after it was cancelled. The
//! machine can also be driven directly (as the tests do) when the caller is
//! the sole owner.
//!
//! Every transition is published on the bus as `connection/state_changed`.
//! Retry bookkeeping is published as `connection/retry_attempt`,
//! `connection/retrying_changed`, `connection/recovered` and
//! `connection/max_retries_reached`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, warn};

use crate::broker::Publisher;
use crate::broker::message::payload;
use crate::session::facade::SessionFacade;
use crate::session::state::{ConnectionState, RetryPolicy};

pub const TOPIC_STATE_CHANGED: &str = "connection/state_changed";
pub const TOPIC_RETRY_ATTEMPT: &str = "connection/retry_attempt";
pub const TOPIC_RETRYING_CHANGED: &str = "connection/retrying_changed";
pub const TOPIC_RECOVERED: &str = "connection/recovered";
pub const TOPIC_MAX_RETRIES_REACHED: &str = "connection/max_retries_reached";

/// Message recorded when the connection timeout fires.
pub const CONNECTION_TIMED_OUT: &str = "Connection timed out";

/// Observable view of the machine, refreshed after every step.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub retry_count: u32,
    pub next_retry_delay: Duration,
    pub is_retrying: bool,
    pub last_error: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Requests accepted by a running machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    StartConnection,
    StopConnection,
    ConnectToDevice(String),
    HandleError(String),
    ResetRetryCount,
    ConnectionEstablished(String),
    ConnectionFailed(String),
    ConnectionStateChanged(ConnectionState),
}

pub struct ConnectionStateMachine {
    state: ConnectionState,
    retry_count: u32,
    next_retry_delay: Duration,
    last_error: String,
    last_transition_time: DateTime<Utc>,
    retry_deadline: Option<Instant>,
    timeout_deadline: Option<Instant>,
    policy: RetryPolicy,
    facade: Arc<dyn SessionFacade>,
    publisher: Arc<dyn Publisher>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl std::fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("state", &self.state)
            .field("retry_count", &self.retry_count)
            .field("next_retry_delay", &self.next_retry_delay)
            .field("last_error", &self.last_error)
            .field("retry_deadline", &self.retry_deadline)
            .field("timeout_deadline", &self.timeout_deadline)
            .finish()
    }
}

impl ConnectionStateMachine {
    pub fn new(
        policy: RetryPolicy,
        facade: Arc<dyn SessionFacade>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let now = Utc::now();
        let (snapshot, _) = watch::channel(SessionSnapshot {
            state: ConnectionState::Disconnected,
            retry_count: 0,
            next_retry_delay: policy.initial_delay,
            is_retrying: false,
            last_error: String::new(),
            last_transition_time: now,
        });
        info!("Connection state machine initialized");
        Self {
            state: ConnectionState::Disconnected,
            retry_count: 0,
            next_retry_delay: policy.initial_delay,
            last_error: String::new(),
            last_transition_time: now,
            retry_deadline: None,
            timeout_deadline: None,
            policy,
            facade,
            publisher,
            snapshot,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn next_retry_delay(&self) -> Duration {
        self.next_retry_delay
    }

    pub fn is_retrying(&self) -> bool {
        self.retry_deadline.is_some()
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn last_transition_time(&self) -> DateTime<Utc> {
        self.last_transition_time
    }

    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_deadline
    }

    pub fn timeout_deadline(&self) -> Option<Instant> {
        self.timeout_deadline
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            retry_count: self.retry_count,
            next_retry_delay: self.next_retry_delay,
            is_retrying: self.is_retrying(),
            last_error: self.last_error.clone(),
            last_transition_time: self.last_transition_time,
        }
    }

    /// Begin a fresh connection attempt: reset the retry streak, enter
    /// `Searching` and start discovery. Ignored while connected.
    pub fn start_connection(&mut self) {
        info!("Starting connection");
        if self.state == ConnectionState::Connected {
            warn!("Already connected");
            return;
        }

        self.stop_retry_timer();
        self.reset_retry_count();
        self.transition_to(ConnectionState::Searching);
        if self.state == ConnectionState::Searching {
            self.facade.start_discovery();
        }
    }

    /// Tear the session down and go idle.
    pub fn stop_connection(&mut self) {
        info!("Stopping connection");
        self.stop_retry_timer();
        self.timeout_deadline = None;
        self.facade.disconnect();
        self.transition_to(ConnectionState::Disconnected);
    }

    /// Connect to a discovered device. Only valid while searching.
    pub fn connect_to_device(&mut self, device_id: &str) {
        self.transition_to(ConnectionState::Connecting);
        if self.state == ConnectionState::Connecting {
            info!(device_id, "Connecting to device");
            self.facade.connect_to_device(device_id);
        }
    }

    /// Record `message` and enter `Error`, which schedules a retry while the
    /// retry budget lasts.
    pub fn handle_error(&mut self, message: &str) {
        error!(error = message, "Handling connection error");
        self.last_error = message.to_string();
        self.transition_to(ConnectionState::Error);
    }

    pub fn reset_retry_count(&mut self) {
        debug!("Resetting retry count");
        self.retry_count = 0;
        self.next_retry_delay = self.policy.initial_delay;
    }

    /// Facade callback: the session is up.
    pub fn connection_established(&mut self, device_name: &str) {
        info!(device_name, "Connection established");
        self.transition_to(ConnectionState::Connected);
    }

    /// Facade callback: the attempt failed.
    pub fn connection_failed(&mut self, reason: &str) {
        error!(reason, "Connection failed");
        self.handle_error(reason);
    }

    /// Facade callback: the protocol session reported a raw state.
    pub fn connection_state_changed(&mut self, state: ConnectionState) {
        debug!(state = %state, "Facade state changed");
        self.transition_to(state);
    }

    /// Retry timer expiry: count the attempt, grow the backoff and search again.
    pub fn on_retry_timer(&mut self) {
        if self.retry_deadline.take().is_none() {
            debug!("No retry armed; ignoring expiry");
            return;
        }
        self.publish_retrying(false);
        if self.state != ConnectionState::Error {
            debug!(state = %self.state, "Retry timer expired outside Error; ignoring");
            return;
        }

        let delay = self.next_retry_delay;
        self.retry_count += 1;
        info!(
            attempt = self.retry_count,
            delay_ms = delay.as_millis() as u64,
            "Retry attempt"
        );
        self.publisher.publish(
            TOPIC_RETRY_ATTEMPT,
            payload(json!({
                "retry_count": self.retry_count,
                "delay_ms": delay.as_millis() as u64,
            })),
        );

        self.next_retry_delay = self.policy.delay_for(self.retry_count);
        self.last_error.clear();

        self.transition_to(ConnectionState::Searching);
        if self.state == ConnectionState::Searching {
            self.facade.start_discovery();
        }
    }

    /// Connection timeout expiry while `Connecting`.
    pub fn on_connection_timeout(&mut self) {
        self.timeout_deadline = None;
        if self.state != ConnectionState::Connecting {
            debug!(state = %self.state, "Connection timeout outside Connecting; ignoring");
            return;
        }
        warn!(
            timeout_ms = self.policy.connection_timeout.as_millis() as u64,
            "Connection timeout"
        );
        self.handle_error(CONNECTION_TIMED_OUT);
    }

    /// Apply one queued request.
    pub fn apply(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::StartConnection => self.start_connection(),
            SessionCommand::StopConnection => self.stop_connection(),
            SessionCommand::ConnectToDevice(id) => self.connect_to_device(&id),
            SessionCommand::HandleError(message) => self.handle_error(&message),
            SessionCommand::ResetRetryCount => self.reset_retry_count(),
            SessionCommand::ConnectionEstablished(name) => self.connection_established(&name),
            SessionCommand::ConnectionFailed(reason) => self.connection_failed(&reason),
            SessionCommand::ConnectionStateChanged(state) => self.connection_state_changed(state),
        }
    }

    /// Move to `next` if the table allows it, then run the entry actions.
    ///
    /// Returns `true` if the state changed. Requests for the current state
    /// are silent no-ops; disallowed requests are logged and ignored.
    fn transition_to(&mut self, next: ConnectionState) -> bool {
        let from = self.state;
        if from == next {
            return false;
        }
        if !from.can_transition_to(next) {
            warn!(from = %from, to = %next, "Invalid state transition");
            return false;
        }

        self.state = next;
        self.last_transition_time = Utc::now();
        info!(
            from = %from,
            to = %next,
            retry_count = self.retry_count,
            "State transition"
        );
        self.publisher.publish(
            TOPIC_STATE_CHANGED,
            payload(json!({
                "from": from,
                "to": next,
                "retry_count": self.retry_count,
                "next_retry_delay_ms": self.next_retry_delay.as_millis() as u64,
                "last_error": self.last_error,
                "timestamp": self.last_transition_time.to_rfc3339(),
            })),
        );

        match next {
            ConnectionState::Connecting => {
                self.timeout_deadline = Some(Instant::now() + self.policy.connection_timeout);
            }
            ConnectionState::Connected => {
                self.stop_retry_timer();
                self.timeout_deadline = None;
                let retries = self.retry_count;
                self.reset_retry_count();
                if retries > 0 {
                    info!(retries, "Connection recovered");
                    self.publisher
                        .publish(TOPIC_RECOVERED, payload(json!({ "retry_count": retries })));
                }
            }
            ConnectionState::Disconnected => {
                self.stop_retry_timer();
                self.timeout_deadline = None;
            }
            ConnectionState::Error => {
                self.timeout_deadline = None;
                if self.retry_count < self.policy.max_retry_count {
                    self.start_retry_timer();
                } else {
                    warn!(
                        max_retry_count = self.policy.max_retry_count,
                        "Max retry count reached"
                    );
                    self.publisher.publish(
                        TOPIC_MAX_RETRIES_REACHED,
                        payload(json!({
                            "retry_count": self.retry_count,
                            "last_error": self.last_error,
                        })),
                    );
                }
            }
            ConnectionState::Searching => {
                self.stop_retry_timer();
            }
        }

        true
    }

    fn start_retry_timer(&mut self) {
        info!(
            delay_ms = self.next_retry_delay.as_millis() as u64,
            "Starting retry timer"
        );
        let was_retrying = self.retry_deadline.is_some();
        self.retry_deadline = Some(Instant::now() + self.next_retry_delay);
        if !was_retrying {
            self.publish_retrying(true);
        }
    }

    fn stop_retry_timer(&mut self) {
        if self.retry_deadline.take().is_some() {
            debug!("Stopped retry timer");
            self.publish_retrying(false);
        }
    }

    fn publish_retrying(&self, retrying: bool) {
        self.publisher.publish(
            TOPIC_RETRYING_CHANGED,
            payload(json!({ "retrying": retrying })),
        );
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(self.snapshot());
    }

    /// Move the machine onto its own task and return the handle that drives it.
    pub fn spawn(self) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let snapshot = self.snapshot.subscribe();
        self.publish_snapshot();
        tokio::spawn(self.run(rx));
        SessionHandle {
            commands: tx,
            snapshot,
        }
    }

    /// Serve requests and timer expiries until every handle is dropped.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        info!("Connection state machine running");
        loop {
            let timeout = self.timeout_deadline;
            let retry = self.retry_deadline;
            tokio::select! {
                biased;
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.apply(cmd),
                    None => break,
                },
                _ = sleep_until_deadline(timeout) => self.on_connection_timeout(),
                _ = sleep_until_deadline(retry) => self.on_retry_timer(),
            }
            self.publish_snapshot();
        }

        self.retry_deadline = None;
        self.timeout_deadline = None;
        info!("Connection state machine shutting down");
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cloneable front door to a running machine.
///
/// Calls only enqueue a request; the machine applies them in order.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    fn send(&self, cmd: SessionCommand) {
        if self.commands.send(cmd).is_err() {
            debug!("Connection state machine stopped; request dropped");
        }
    }

    pub fn start_connection(&self) {
        self.send(SessionCommand::StartConnection);
    }

    pub fn stop_connection(&self) {
        self.send(SessionCommand::StopConnection);
    }

    pub fn connect_to_device(&self, device_id: impl Into<String>) {
        self.send(SessionCommand::ConnectToDevice(device_id.into()));
    }

    pub fn handle_error(&self, message: impl Into<String>) {
        self.send(SessionCommand::HandleError(message.into()));
    }

    pub fn reset_retry_count(&self) {
        self.send(SessionCommand::ResetRetryCount);
    }

    pub fn connection_established(&self, device_name: impl Into<String>) {
        self.send(SessionCommand::ConnectionEstablished(device_name.into()));
    }

    pub fn connection_failed(&self, reason: impl Into<String>) {
        self.send(SessionCommand::ConnectionFailed(reason.into()));
    }

    pub fn connection_state_changed(&self, state: ConnectionState) {
        self.send(SessionCommand::ConnectionStateChanged(state));
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// A receiver that is notified after every processed step.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Stop the session and wait, up to `limit`, for the machine to apply
    /// it. Returns `false` if the machine did not get there in time.
    pub async fn shutdown(&self, limit: Duration) -> bool {
        let mut snapshots = self.watch();
        let idle = snapshots.borrow_and_update().state == ConnectionState::Disconnected;
        self.stop_connection();

        let applied = async {
            if idle {
                // No timer is armed while disconnected, so the next step is the stop.
                snapshots.changed().await.is_ok()
            } else {
                snapshots
                    .wait_for(|s| s.state == ConnectionState::Disconnected)
                    .await
                    .is_ok()
            }
        };
        match timeout(limit, applied).await {
            Ok(done) => done,
            Err(_) => {
                warn!(?limit, "Session did not stop in time");
                false
            }
        }
    }
}
