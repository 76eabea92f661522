//! Stream connection driver.
//!
//! One driver task owns all connection state. Public handles only send
//! commands; connect attempts, socket pumps and retry timers report back into
//! the same inbox tagged with the generation they were started for, and
//! anything tagged with a generation no lane currently holds is ignored.

use crate::config::MarketStreamConfig;
use crate::error::MarketError;
use crate::market::backoff::BackoffPolicy;
use crate::market::topics::{multiplexed_url, single_topic_url, Topic};
use crate::market::transport::{Connector, FrameStream, SocketEvent};
use crate::market::types::{now_unix_ms, ConnectionMode, ConnectionSnapshot, ConnectionStatus};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A socket must stay open this long before a server close stops counting
/// against the reconnect budget.
pub const STABLE_CONNECTION: Duration = Duration::from_secs(10);

/// Raw text frame accepted from the current connection generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub generation: u64,
    pub text: String,
}

/// Where the subscription registry pushes its required topic set.
pub trait TopicSink: Send + Sync {
    fn ensure_topics(&self, topics: BTreeSet<Topic>) -> Result<(), MarketError>;
    fn disconnect(&self) -> Result<(), MarketError>;
}

type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

struct Shared {
    snapshot: RwLock<ConnectionSnapshot>,
    listeners: Mutex<Vec<(u64, StatusCallback)>>,
    next_listener_id: AtomicU64,
}

impl Shared {
    fn notify(&self, status: ConnectionStatus) {
        let listeners: Vec<StatusCallback> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(status);
        }
    }
}

/// Registration returned by [`ConnectionManager::on_status_change`].
#[must_use = "dropping the handle keeps the listener registered; call unsubscribe to remove it"]
pub struct StatusListener {
    id: u64,
    shared: Weak<Shared>,
}

impl StatusListener {
    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

enum Command {
    EnsureTopics(BTreeSet<Topic>),
    Disconnect,
    Shutdown,
}

enum DriverEvent {
    ConnectFinished {
        generation: u64,
        result: Result<FrameStream, MarketError>,
    },
    Socket {
        generation: u64,
        event: SocketEvent,
    },
    RetryDue {
        generation: u64,
    },
}

#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Starts the driver task on the current tokio runtime. Frames from the
    /// live connection arrive, in order, on the returned receiver.
    pub fn spawn(
        config: &MarketStreamConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<InboundFrame>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            snapshot: RwLock::new(ConnectionSnapshot::disconnected()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        });

        let driver = Driver {
            ws_base_url: config.ws_base_url.clone(),
            policy: config.reconnect,
            connect_timeout: config.connect_timeout,
            fallback_per_topic: config.fallback_per_topic,
            connector,
            events: events_tx,
            frames: frames_tx,
            shared: Arc::clone(&shared),
            root: CancellationToken::new(),
            topics: BTreeSet::new(),
            pending: None,
            mode: ConnectionMode::Multiplexed,
            lanes: Vec::new(),
            generation: 0,
            last_connected_at_ms: None,
            status: ConnectionStatus::Disconnected,
        };
        tokio::spawn(driver.run(commands_rx, events_rx));

        (
            Self {
                commands: commands_tx,
                shared,
            },
            frames_rx,
        )
    }

    pub fn ensure_topics(&self, topics: BTreeSet<Topic>) -> Result<(), MarketError> {
        self.send(Command::EnsureTopics(topics))
    }

    pub fn disconnect(&self) -> Result<(), MarketError> {
        self.send(Command::Disconnect)
    }

    /// Closes every socket and stops the driver task.
    pub fn shutdown(&self) -> Result<(), MarketError> {
        self.send(Command::Shutdown)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.snapshot.read().status
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.shared.snapshot.read().clone()
    }

    /// Registers a listener called on every status transition.
    pub fn on_status_change<F>(&self, listener: F) -> StatusListener
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.shared.listeners.lock().push((id, Arc::new(listener)));
        StatusListener {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    fn send(&self, command: Command) -> Result<(), MarketError> {
        self.commands
            .send(command)
            .map_err(|_| MarketError::DriverStopped)
    }
}

impl TopicSink for ConnectionManager {
    fn ensure_topics(&self, topics: BTreeSet<Topic>) -> Result<(), MarketError> {
        ConnectionManager::ensure_topics(self, topics)
    }

    fn disconnect(&self) -> Result<(), MarketError> {
        ConnectionManager::disconnect(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LanePhase {
    Connecting,
    Connected,
    Backoff,
    Failed,
}

/// One socket's worth of state: the whole topic set when multiplexed, a
/// single topic in per-topic fallback.
struct Lane {
    topics: BTreeSet<Topic>,
    url: String,
    generation: u64,
    phase: LanePhase,
    attempt: u32,
    /// Attempts spent before the current open; restored if it drops early.
    carried_attempts: u32,
    connected_at: Option<Instant>,
    cancel: CancellationToken,
}

impl Lane {
    fn new(topics: BTreeSet<Topic>, url: String) -> Self {
        Self {
            topics,
            url,
            generation: 0,
            phase: LanePhase::Connecting,
            attempt: 0,
            carried_attempts: 0,
            connected_at: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancels whatever task the lane was running and hands out a fresh token.
    fn renew_token(&mut self, root: &CancellationToken) -> CancellationToken {
        self.cancel.cancel();
        self.cancel = root.child_token();
        self.cancel.clone()
    }
}

struct Driver {
    ws_base_url: String,
    policy: BackoffPolicy,
    connect_timeout: Duration,
    fallback_per_topic: bool,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<DriverEvent>,
    frames: mpsc::UnboundedSender<InboundFrame>,
    shared: Arc<Shared>,
    root: CancellationToken,
    topics: BTreeSet<Topic>,
    pending: Option<BTreeSet<Topic>>,
    mode: ConnectionMode,
    lanes: Vec<Lane>,
    generation: u64,
    last_connected_at_ms: Option<i64>,
    status: ConnectionStatus,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<DriverEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::EnsureTopics(topics)) => self.ensure_topics(topics),
                    Some(Command::Disconnect) => self.disconnect(),
                    Some(Command::Shutdown) | None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }

        self.disconnect();
        self.root.cancel();
        debug!("connection driver stopped");
    }

    fn handle_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::ConnectFinished { generation, result } => {
                self.on_connect_finished(generation, result)
            }
            DriverEvent::Socket { generation, event } => self.on_socket_event(generation, event),
            DriverEvent::RetryDue { generation } => self.on_retry_due(generation),
        }
    }

    fn ensure_topics(&mut self, topics: BTreeSet<Topic>) {
        if topics.is_empty() {
            self.disconnect();
            return;
        }

        if self.connect_in_flight() {
            if topics == self.topics {
                self.pending = None;
            } else {
                debug!(topics = topics.len(), "connect in flight; parking topic set");
                self.pending = Some(topics);
            }
            return;
        }

        if topics == self.topics && !self.lanes.is_empty() && self.status != ConnectionStatus::Error {
            return;
        }

        self.pending = None;
        self.topics = topics;
        self.start_multiplexed();
    }

    fn disconnect(&mut self) {
        if !self.lanes.is_empty() {
            info!(topics = self.topics.len(), "closing stream connections");
        }
        self.teardown_lanes();
        self.topics.clear();
        self.pending = None;
        self.mode = ConnectionMode::Multiplexed;
        self.refresh_status();
    }

    fn start_multiplexed(&mut self) {
        self.teardown_lanes();
        self.mode = ConnectionMode::Multiplexed;
        let url = multiplexed_url(&self.ws_base_url, &self.topics);
        self.lanes.push(Lane::new(self.topics.clone(), url));
        self.begin_connect(0);
        self.refresh_status();
    }

    fn start_per_topic(&mut self) {
        self.teardown_lanes();
        self.mode = ConnectionMode::PerTopic;
        warn!(
            topics = self.topics.len(),
            "multiplexed stream exhausted its retries; falling back to per-topic connections"
        );
        for topic in &self.topics {
            let url = single_topic_url(&self.ws_base_url, topic);
            self.lanes.push(Lane::new(BTreeSet::from([topic.clone()]), url));
        }
        for index in 0..self.lanes.len() {
            self.begin_connect(index);
        }
    }

    fn teardown_lanes(&mut self) {
        for lane in self.lanes.drain(..) {
            lane.cancel.cancel();
        }
    }

    fn begin_connect(&mut self, index: usize) {
        self.generation += 1;
        let generation = self.generation;
        let Some(lane) = self.lanes.get_mut(index) else {
            return;
        };
        lane.generation = generation;
        lane.phase = LanePhase::Connecting;
        let token = lane.renew_token(&self.root);

        info!(
            generation,
            attempt = lane.attempt,
            mode = ?self.mode,
            url = %lane.url,
            "opening stream connection"
        );

        let connector = Arc::clone(&self.connector);
        let events = self.events.clone();
        let url = lane.url.clone();
        let timeout = self.connect_timeout;
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = tokio::time::timeout(timeout, connector.connect(&url)) => match result {
                    Ok(result) => result,
                    Err(_) => Err(MarketError::ConnectTimeout {
                        timeout_ms: timeout.as_millis().min(u64::MAX as u128) as u64,
                    }),
                },
            };
            let _ = events.send(DriverEvent::ConnectFinished { generation, result });
        });
    }

    fn on_connect_finished(&mut self, generation: u64, result: Result<FrameStream, MarketError>) {
        let Some(index) = self.lane_index(generation) else {
            debug!(generation, "discarding connect result for a replaced connection");
            return;
        };

        match result {
            Ok(frames) => {
                let now_ms = now_unix_ms();
                let root = self.root.clone();
                let lane = &mut self.lanes[index];
                lane.phase = LanePhase::Connected;
                lane.carried_attempts = lane.attempt;
                lane.attempt = 0;
                lane.connected_at = Some(Instant::now());
                let token = lane.renew_token(&root);
                self.last_connected_at_ms = Some(now_ms);
                info!(generation, topics = lane.topics.len(), "stream connected");
                spawn_pump(frames, generation, token, self.events.clone());
            }
            Err(error) => {
                warn!(generation, error = %error, "stream connect failed");
                self.schedule_retry(index);
            }
        }

        self.refresh_status();
        if !self.connect_in_flight() {
            if let Some(pending) = self.pending.take() {
                self.ensure_topics(pending);
            }
        }
    }

    fn on_socket_event(&mut self, generation: u64, event: SocketEvent) {
        let Some(index) = self.lane_index(generation) else {
            debug!(generation, "ignoring socket event from a replaced connection");
            return;
        };
        if self.lanes[index].phase != LanePhase::Connected {
            return;
        }

        let normal_close = event.is_normal_close();
        match event {
            SocketEvent::Text(text) => {
                let _ = self.frames.send(InboundFrame { generation, text });
            }
            SocketEvent::Closed { code, reason } => {
                let lane = &mut self.lanes[index];
                let stable = lane
                    .connected_at
                    .take()
                    .is_some_and(|opened| opened.elapsed() >= STABLE_CONNECTION);
                if stable {
                    lane.carried_attempts = 0;
                }
                lane.attempt = lane.carried_attempts;

                if normal_close && stable {
                    info!(generation, reason = %reason, "stream closed by server; reconnecting");
                    self.begin_connect(index);
                } else {
                    warn!(
                        generation,
                        code = ?code,
                        reason = %reason,
                        stable,
                        "stream closed unexpectedly"
                    );
                    self.schedule_retry(index);
                }
                self.refresh_status();
            }
        }
    }

    fn on_retry_due(&mut self, generation: u64) {
        let Some(index) = self.lane_index(generation) else {
            return;
        };
        if self.lanes[index].phase == LanePhase::Backoff {
            self.begin_connect(index);
            self.refresh_status();
        }
    }

    fn schedule_retry(&mut self, index: usize) {
        let root = self.root.clone();
        let Some(lane) = self.lanes.get_mut(index) else {
            return;
        };
        lane.attempt += 1;

        if self.policy.is_exhausted(lane.attempt) {
            lane.phase = LanePhase::Failed;
            lane.cancel.cancel();
            warn!(
                generation = lane.generation,
                attempts = lane.attempt - 1,
                url = %lane.url,
                "reconnect attempts exhausted"
            );
            if self.mode == ConnectionMode::Multiplexed && self.fallback_per_topic {
                self.start_per_topic();
            }
            return;
        }

        let delay = self.policy.delay_for(lane.attempt);
        lane.phase = LanePhase::Backoff;
        let generation = lane.generation;
        let token = lane.renew_token(&root);
        warn!(
            generation,
            attempt = lane.attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );

        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(DriverEvent::RetryDue { generation });
                }
            }
        });
    }

    fn lane_index(&self, generation: u64) -> Option<usize> {
        self.lanes
            .iter()
            .position(|lane| lane.generation == generation)
    }

    fn connect_in_flight(&self) -> bool {
        self.lanes
            .iter()
            .any(|lane| lane.phase == LanePhase::Connecting)
    }

    fn derive_status(&self) -> ConnectionStatus {
        if self.topics.is_empty() || self.lanes.is_empty() {
            return ConnectionStatus::Disconnected;
        }
        let phases = || self.lanes.iter().map(|lane| (lane.phase, lane.attempt));
        if phases().any(|(phase, _)| phase == LanePhase::Connected) {
            ConnectionStatus::Connected
        } else if phases().all(|(phase, _)| phase == LanePhase::Failed) {
            ConnectionStatus::Error
        } else if phases().any(|(phase, attempt)| {
            phase == LanePhase::Backoff || (phase == LanePhase::Connecting && attempt > 0)
        }) {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Connecting
        }
    }

    fn refresh_status(&mut self) {
        let status = self.derive_status();
        {
            let mut snapshot = self.shared.snapshot.write();
            snapshot.status = status;
            snapshot.mode = self.mode;
            snapshot.topics = self.topics.iter().map(|topic| topic.to_string()).collect();
            snapshot.reconnect_attempt = self.lanes.iter().map(|lane| lane.attempt).max().unwrap_or(0);
            snapshot.generation = self.generation;
            snapshot.last_connected_at_ms = self.last_connected_at_ms;
            snapshot.connect_in_flight = self.connect_in_flight();
        }

        if status != self.status {
            debug!(from = ?self.status, to = ?status, "connection status changed");
            self.status = status;
            self.shared.notify(status);
        }
    }
}

fn spawn_pump(
    mut frames: FrameStream,
    generation: u64,
    token: CancellationToken,
    events: mpsc::UnboundedSender<DriverEvent>,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                next = frames.next() => next.unwrap_or_else(|| SocketEvent::Closed {
                    code: None,
                    reason: "stream ended".to_string(),
                }),
            };
            let closed = matches!(event, SocketEvent::Closed { .. });
            if events.send(DriverEvent::Socket { generation, event }).is_err() || closed {
                break;
            }
        }
    });
}
