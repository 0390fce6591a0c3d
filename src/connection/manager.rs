//! Connection manager with authenticated sessions and automatic reconnection
//!
//! [`ConnectionManager`] is a cheap handle. All connection state lives in a
//! single spawned actor that serializes application commands, transport
//! events and timer firings through one `select!` loop.

use super::driver::{self, DriverParams, TransportEvent, TransportEventKind};
use super::event_bus::{EventBus, Subscription};
use super::heartbeat::HeartbeatMonitor;
use super::queue::{MessageQueue, OutboundMessage};
use super::reconnect::ReconnectScheduler;
use super::timer::Timer;
use crate::auth::{AuthNegotiator, CredentialKind};
use crate::config::ClientConfig;
use crate::error::{ConnectError, ConnectionFailure};
use crate::transport::TransportConnector;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_shared::state_machine::is_valid_transition;
use tether_shared::{
    now_ms, AuthErrorInfo, ConnectionState, ConnectionStateMachine, ConnectionTrigger, Envelope,
    Inbound, SessionCreated, TransitionResult,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Capacity of the transport event channel
const EVENT_BUFFER: usize = 64;

/// A confirmed backend session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub is_guest: bool,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
}

impl From<SessionCreated> for Session {
    fn from(created: SessionCreated) -> Self {
        Self {
            session_id: created.session_id,
            user_id: created.user_id,
            is_guest: created.is_guest,
            created_at: created.timestamp.unwrap_or_else(now_ms),
        }
    }
}

enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
    Disconnect,
    Send(OutboundMessage),
}

/// Application-facing handle to one managed connection
///
/// Dropping the handle stops the actor and closes the transport.
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    bus: Arc<EventBus>,
    state_rx: watch::Receiver<ConnectionState>,
    session_rx: watch::Receiver<Option<Session>>,
    latency_us: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl ConnectionManager {
    /// Create a manager and spawn its actor on the current runtime
    ///
    /// Nothing is opened until [`connect`](Self::connect) is called.
    pub fn new<C: TransportConnector>(
        config: ClientConfig,
        connector: C,
        auth: AuthNegotiator,
    ) -> Self {
        let (manager, actor) = Self::build(config, Arc::new(connector), auth);
        tokio::spawn(actor.run());
        manager
    }

    fn build<C: TransportConnector>(
        config: ClientConfig,
        connector: Arc<C>,
        mut auth: AuthNegotiator,
    ) -> (Self, ConnectionActor<C>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (session_tx, session_rx) = watch::channel(None);
        let bus = Arc::new(EventBus::new());
        let latency_us = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));

        auth.set_refresh_timeout(config.refresh_timeout);

        let actor = ConnectionActor {
            queue: MessageQueue::new(config.queue_capacity),
            heartbeat: HeartbeatMonitor::new(config.heartbeat_interval, config.pong_timeout),
            reconnect: ReconnectScheduler::new(config.backoff_ladder.clone()),
            handshake: Timer::new(),
            fsm: ConnectionStateMachine::new(),
            epoch: 0,
            manual_disconnect: false,
            attempt_started: None,
            attempt_credential: None,
            live: None,
            pending_connect: None,
            config,
            connector,
            auth,
            bus: bus.clone(),
            state_tx,
            session_tx,
            latency_us: latency_us.clone(),
            dropped: dropped.clone(),
            commands: command_rx,
            event_tx,
            event_rx,
        };

        let manager = Self {
            commands,
            bus,
            state_rx,
            session_rx,
            latency_us,
            dropped,
        };
        (manager, actor)
    }

    /// Open the connection and wait for this attempt's outcome
    ///
    /// Returns immediately if already connected. Resolves on CONNECTED or on
    /// the first failure of this attempt; later automatic retries are not
    /// awaited.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Connect { reply })
            .map_err(|_| ConnectError::Shutdown)?;
        outcome.await.map_err(|_| ConnectError::Shutdown)?
    }

    /// Close the connection and suppress reconnection until the next `connect()`
    ///
    /// Takes effect before any transport event or timer the actor has not yet
    /// processed.
    pub fn disconnect(&self) {
        if self.commands.send(Command::Disconnect).is_err() {
            debug!("Disconnect after manager shutdown");
        }
    }

    /// Transmit now if connected, otherwise queue for the next session
    pub fn send(&self, message: OutboundMessage) {
        if let Err(mpsc::error::SendError(Command::Send(message))) =
            self.commands.send(Command::Send(message))
        {
            warn!(msg_type = %message.msg_type, "Send after manager shutdown, message dropped");
        }
    }

    /// Subscribe to one inbound event type
    pub fn on<F>(&self, event_type: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.bus.subscribe(event_type, Arc::new(handler))
    }

    /// Subscribe to every inbound application event
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.bus.subscribe_any(Arc::new(handler))
    }

    /// Subscribe to connection-state changes, delivered in transition order
    pub fn on_connection_state_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.bus.subscribe_state(Arc::new(handler))
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Round trip of the last answered heartbeat; zero until measured
    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.latency_us.load(Ordering::Relaxed))
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Outbound messages evicted from the offline queue so far
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// The current session, if one has been confirmed
    pub fn session(&self) -> Option<Session> {
        self.session_rx.borrow().clone()
    }

    /// Watch channel following the connection state
    pub fn state_watcher(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

/// Channels into the driver task of the live epoch
struct LiveTransport {
    outbound_tx: mpsc::Sender<Envelope>,
    close_tx: oneshot::Sender<()>,
    open: bool,
}

enum Step {
    Command(Command),
    Transport(TransportEvent),
    HandshakeTimeout,
    PongTimeout,
    Probe,
    Retry,
    Shutdown,
}

struct ConnectionActor<C> {
    config: ClientConfig,
    connector: Arc<C>,
    auth: AuthNegotiator,
    bus: Arc<EventBus>,
    fsm: ConnectionStateMachine,
    queue: MessageQueue,
    heartbeat: HeartbeatMonitor,
    reconnect: ReconnectScheduler,
    handshake: Timer,
    epoch: u64,
    manual_disconnect: bool,
    attempt_started: Option<Instant>,
    /// Credential kind the live attempt opened with
    attempt_credential: Option<CredentialKind>,
    live: Option<LiveTransport>,
    pending_connect: Option<oneshot::Sender<Result<(), ConnectError>>>,
    state_tx: watch::Sender<ConnectionState>,
    session_tx: watch::Sender<Option<Session>>,
    latency_us: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    commands: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: mpsc::Receiver<TransportEvent>,
}

impl<C: TransportConnector> ConnectionActor<C> {
    /// Wait for the next thing to act on
    ///
    /// Commands come first so `disconnect()` beats anything still pending.
    /// Expired deadlines come before transport events, so a busy peer cannot
    /// hold off a timeout.
    async fn next_step(&mut self) -> Step {
        tokio::select! {
            biased;

            command = self.commands.recv() => match command {
                Some(command) => Step::Command(command),
                None => Step::Shutdown,
            },
            _ = self.handshake.fired() => Step::HandshakeTimeout,
            _ = self.heartbeat.pong_timed_out() => Step::PongTimeout,
            _ = self.heartbeat.probe_due() => Step::Probe,
            _ = self.reconnect.due() => Step::Retry,
            Some(event) = self.event_rx.recv() => Step::Transport(event),
        }
    }

    async fn run(mut self) {
        loop {
            let step = self.next_step().await;
            match step {
                Step::Command(command) => self.handle_command(command),
                Step::Transport(event) => self.handle_transport(event).await,
                Step::HandshakeTimeout => {
                    self.handshake.cancel();
                    self.fail(ConnectionFailure::HandshakeTimeout);
                }
                Step::PongTimeout => self.fail(ConnectionFailure::HeartbeatTimeout),
                Step::Probe => self.probe(),
                Step::Retry => {
                    self.reconnect.cancel();
                    if !self.manual_disconnect {
                        self.begin_attempt(ConnectionTrigger::BackoffElapsed);
                    }
                }
                Step::Shutdown => {
                    debug!(epoch = self.epoch, "Manager dropped, stopping connection actor");
                    self.reconnect.cancel();
                    self.teardown();
                    return;
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => self.handle_connect(reply),
            Command::Disconnect => self.handle_disconnect(),
            Command::Send(message) => self.send_message(message),
        }
    }

    fn handle_connect(&mut self, reply: oneshot::Sender<Result<(), ConnectError>>) {
        if self.fsm.state() == ConnectionState::Connected {
            info!("connect() while already connected");
            let _ = reply.send(Ok(()));
            return;
        }

        if let Some(previous) = self.pending_connect.take() {
            debug!(epoch = self.epoch, "Superseding in-flight connect");
            let _ = previous.send(Err(ConnectError::Superseded));
        }

        self.manual_disconnect = false;
        self.reconnect.cancel();
        self.pending_connect = Some(reply);
        self.begin_attempt(ConnectionTrigger::ConnectRequested);
    }

    fn handle_disconnect(&mut self) {
        info!(epoch = self.epoch, state = %self.fsm.state(), "Disconnect requested");
        self.manual_disconnect = true;
        self.reconnect.cancel();
        self.teardown();

        let dropped = self.queue.len();
        self.queue.clear();
        if dropped > 0 {
            info!(dropped, "Discarded queued messages on disconnect");
        }

        self.session_tx.send_replace(None);
        self.transition(ConnectionTrigger::DisconnectRequested);

        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Err(ConnectError::Cancelled));
        }
    }

    /// Start a fresh epoch and spawn its transport driver
    fn begin_attempt(&mut self, trigger: ConnectionTrigger) {
        self.teardown();
        self.transition(trigger);

        let credential = self.auth.credential();
        self.attempt_credential = Some(credential.kind);
        info!(
            epoch = self.epoch,
            transport = self.connector.name(),
            credential = %credential.kind,
            attempt = self.reconnect.attempts(),
            "Connecting"
        );

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let (close_tx, close_rx) = oneshot::channel();
        let params = DriverParams {
            connector: self.connector.clone(),
            credential,
            epoch: self.epoch,
            open_timeout: self.config.open_timeout,
        };
        tokio::spawn(driver::run(params, outbound_rx, close_rx, self.event_tx.clone()));

        self.attempt_started = Some(Instant::now());
        self.live = Some(LiveTransport {
            outbound_tx,
            close_tx,
            open: false,
        });
    }

    /// Invalidate the current epoch, stop its timers and close its transport
    fn teardown(&mut self) {
        self.epoch += 1;
        self.handshake.cancel();
        self.heartbeat.stop();
        if let Some(live) = self.live.take() {
            // Driver already gone if this fails
            let _ = live.close_tx.send(());
        }
    }

    fn transition(&mut self, trigger: ConnectionTrigger) -> bool {
        match self.fsm.process(trigger) {
            TransitionResult::Changed { from, to } => {
                debug_assert!(is_valid_transition(from, to), "{} -> {}", from, to);
                debug!(%from, %to, ?trigger, "Connection state changed");
                self.state_tx.send_replace(to);
                self.bus.emit_state(to);
                true
            }
            TransitionResult::Unchanged(_) => false,
            TransitionResult::Invalid { from, trigger } => {
                warn!(%from, ?trigger, "Ignoring invalid state transition");
                false
            }
        }
    }

    /// Single failure path for every attempt and live connection
    fn fail(&mut self, failure: ConnectionFailure) {
        let state = self.fsm.state();
        let elapsed_ms = self
            .attempt_started
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or(0);
        warn!(
            epoch = self.epoch,
            failure = failure.kind(),
            credential = ?self.attempt_credential,
            elapsed_ms,
            %state,
            "Connection failed: {}",
            failure
        );

        self.teardown();

        let trigger = if state == ConnectionState::Connected {
            self.session_tx.send_replace(None);
            ConnectionTrigger::ConnectionLost
        } else {
            failure.trigger()
        };
        self.transition(trigger);

        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Err(ConnectError::Failed(failure)));
        }

        if self.manual_disconnect {
            return;
        }
        let attempt = self.reconnect.attempts();
        let delay = self.reconnect.schedule();
        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        self.transition(ConnectionTrigger::RetryScheduled);
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        if event.epoch != self.epoch {
            match event.kind {
                TransportEventKind::Unsent { envelopes } => warn!(
                    epoch = event.epoch,
                    lost = envelopes.len(),
                    "Messages lost with superseded transport"
                ),
                kind => debug!(epoch = event.epoch, current = self.epoch, ?kind, "Dropping stale transport event"),
            }
            return;
        }

        match event.kind {
            TransportEventKind::Opened => {
                if let Some(live) = self.live.as_mut() {
                    live.open = true;
                }
                self.transition(ConnectionTrigger::TransportOpened);
                self.handshake.arm(self.config.handshake_timeout);
            }
            TransportEventKind::OpenFailed { reason } => {
                self.fail(ConnectionFailure::TransportOpen { reason });
            }
            TransportEventKind::Message(envelope) => self.handle_inbound(envelope).await,
            TransportEventKind::Unsent { envelopes } => {
                let requeued: Vec<OutboundMessage> = envelopes
                    .into_iter()
                    .filter(|envelope| !envelope.is_reserved())
                    .map(OutboundMessage::from)
                    .collect();
                if !requeued.is_empty() {
                    warn!(count = requeued.len(), "Transport died with unsent messages, requeued");
                    self.queue.requeue_front(requeued);
                    self.publish_dropped();
                }
            }
            TransportEventKind::Closed { reason } => {
                self.fail(ConnectionFailure::TransportClosed { reason });
            }
        }
    }

    async fn handle_inbound(&mut self, envelope: Envelope) {
        let inbound = match Inbound::try_from(envelope) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Ignoring malformed message: {}", e);
                return;
            }
        };

        match inbound {
            Inbound::Ping => {
                if self.write(Envelope::pong()).is_err() {
                    debug!("Could not answer backend ping");
                }
            }
            Inbound::Pong => {
                if let Some(sample) = self.heartbeat.on_pong() {
                    self.latency_us
                        .store(sample.rtt.as_micros() as u64, Ordering::Relaxed);
                    debug!(latency_ms = sample.rtt.as_millis() as u64, "Heartbeat reply");
                }
            }
            Inbound::SessionCreated(created) => self.confirm_session(created),
            Inbound::AuthError(info) => self.handle_auth_error(info).await,
            Inbound::Event(envelope) => {
                self.bus.emit(&envelope);
            }
        }
    }

    fn confirm_session(&mut self, created: SessionCreated) {
        if self.fsm.state() != ConnectionState::Authenticating {
            debug!(state = %self.fsm.state(), "Ignoring session confirmation outside handshake");
            return;
        }

        let session = Session::from(created);
        info!(
            epoch = self.epoch,
            session_id = %session.session_id,
            is_guest = session.is_guest,
            elapsed_ms = self
                .attempt_started
                .map(|started| started.elapsed().as_millis() as u64)
                .unwrap_or(0),
            "Session confirmed"
        );

        self.handshake.cancel();
        self.reconnect.reset();
        self.session_tx.send_replace(Some(session));
        self.transition(ConnectionTrigger::SessionConfirmed);
        self.heartbeat.start();

        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Ok(()));
        }
        self.flush_queue();
    }

    async fn handle_auth_error(&mut self, info: AuthErrorInfo) {
        let epoch = self.epoch;
        let resolution = self.auth.resolve_failure(&info).await;
        debug!(?resolution, "Auth failure resolved");
        self.bus.emit_typed(&Envelope::auth_error(&info));

        // Commands that queued up while the refresh ran go first
        while let Ok(command) = self.commands.try_recv() {
            self.handle_command(command);
        }
        if self.epoch != epoch {
            debug!(epoch, "Attempt replaced during auth resolution");
            return;
        }

        self.fail(ConnectionFailure::AuthFailure {
            code: info.code,
            message: info.message,
        });
    }

    fn probe(&mut self) {
        let ping = self.heartbeat.on_tick();
        if self.write(ping).is_err() {
            warn!(epoch = self.epoch, "Heartbeat probe not written");
        }
    }

    /// Hand an envelope to the live driver; gives it back if not writable
    fn write(&self, envelope: Envelope) -> Result<(), Envelope> {
        match &self.live {
            Some(live) if live.open => live
                .outbound_tx
                .try_send(envelope)
                .map_err(|e| e.into_inner()),
            _ => Err(envelope),
        }
    }

    fn send_message(&mut self, message: OutboundMessage) {
        if self.fsm.state() == ConnectionState::Connected {
            match self.write(message.to_envelope()) {
                Ok(()) => return,
                Err(_) => warn!(msg_type = %message.msg_type, "Transport not writable, message queued"),
            }
        }
        self.queue.enqueue(message);
        self.publish_dropped();
    }

    fn publish_dropped(&self) {
        self.dropped
            .store(self.queue.dropped_count(), Ordering::Relaxed);
    }

    fn flush_queue(&mut self) {
        let queued = self.queue.drain();
        if queued.is_empty() {
            return;
        }
        info!(count = queued.len(), "Flushing queued messages");
        for item in queued {
            self.send_message(item.message);
        }
    }
}
