use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use shared::{
    domain::{Segment, SessionId},
    error::ProtocolError,
    protocol::{ClientRequest, ServerEvent, ServerStatus},
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    audio::{AudioCueHandler, AudioFetcher, AudioPlayer},
    error::ConnectionError,
    events::ClientEvent,
    lock,
    reconciler::{ApplyOutcome, SegmentReconciler, TranscriptSegment},
    relay::MessageRelay,
    session::{Session, SessionTracker},
    transport::{channel_url, ChannelConnection, OutboundSlot, Transport},
    ClientOptions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Active,
    Errored,
}

impl ConnectionState {
    pub fn can_send(self) -> bool {
        matches!(self, Self::Connected | Self::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub session: Option<SessionId>,
    pub reason: Option<String>,
    /// Set once the retry budget is spent. No further attempts follow.
    pub terminal: bool,
}

pub trait StatusObserver: Send + Sync {
    fn on_status_change(&self, change: &StatusChange);
}

impl<F> StatusObserver for F
where
    F: Fn(&StatusChange) + Send + Sync,
{
    fn on_status_change(&self, change: &StatusChange) {
        self(change)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Exponential { max_delay: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_millis(1000),
            backoff: Backoff::Fixed,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { max_delay } => {
                let exp = retry.saturating_sub(1).min(16);
                self.delay.saturating_mul(1u32 << exp).min(max_delay)
            }
        }
    }
}

/// What entering `Active` does to the transcript.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ActivePolicy {
    /// Start a fresh transcript for each active period.
    #[default]
    ResetTranscript,
    PreserveTranscript,
}

/// Bounded retry counter. Consecutive failures only; a confirmed session resets it.
#[derive(Debug, Clone)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    failures: u32,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Records a failed attempt. Returns how long to wait before the next
    /// one, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.policy.max_retries {
            return None;
        }
        Some(self.policy.delay_for(self.failures))
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Handle to a running connection supervisor. Dropping it also cancels.
pub struct ConnectionTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<Result<(), ConnectionError>>,
}

impl ConnectionTask {
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> Result<(), ConnectionError> {
        let Self { cancel, handle } = self;
        let result = handle.await;
        drop(cancel);
        result.map_err(|err| ConnectionError::TaskFailed(err.to_string()))?
    }

    pub async fn shutdown(self) -> Result<(), ConnectionError> {
        self.cancel();
        self.join().await
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

enum StreamEnd {
    Cancelled,
    Closed(Option<String>),
    Failed(ConnectionError),
}

#[derive(Default)]
struct LinkState {
    session: Option<Session>,
    confirmed: Option<SessionId>,
    terminal: bool,
    last_error: Option<String>,
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Owns the channel lifecycle and the only writable copy of [`ConnectionState`].
///
/// Inbound frames are decoded at the channel boundary and dispatched in
/// arrival order to the transcript, the message relay or the audio cue
/// handler, each tagged with the session generation of the stream they came
/// from.
pub struct ConnectionManager {
    options: ClientOptions,
    channel_url: Url,
    transport: Arc<dyn Transport>,
    sessions: SessionTracker,
    state: watch::Sender<ConnectionState>,
    link: Mutex<LinkState>,
    observers: Mutex<Vec<Arc<dyn StatusObserver>>>,
    transcript: Mutex<SegmentReconciler>,
    outbound: OutboundSlot,
    relay: MessageRelay,
    audio: AudioCueHandler,
    events: broadcast::Sender<ClientEvent>,
    running: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        options: ClientOptions,
        transport: Arc<dyn Transport>,
        fetcher: Arc<dyn AudioFetcher>,
        player: Arc<dyn AudioPlayer>,
    ) -> Result<Arc<Self>, ConnectionError> {
        let channel_url = channel_url(&options.server_url, &options.channel_path)?;
        let sessions = SessionTracker::new();
        let (state, status_rx) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(1024);
        let outbound = OutboundSlot::new(sessions.clone());
        let relay = MessageRelay::new(
            options.sender_label.clone(),
            status_rx,
            outbound.clone(),
            sessions.clone(),
            events.clone(),
        );
        let audio = AudioCueHandler::new(fetcher, player, sessions.clone());

        Ok(Arc::new(Self {
            options,
            channel_url,
            transport,
            transcript: Mutex::new(SegmentReconciler::new(sessions.clone())),
            sessions,
            state,
            link: Mutex::new(LinkState::default()),
            observers: Mutex::new(Vec::new()),
            outbound,
            relay,
            audio,
            events,
            running: AtomicBool::new(false),
        }))
    }

    pub fn status(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn on_status_change(&self, observer: impl StatusObserver + 'static) {
        lock(&self.observers).push(Arc::new(observer));
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> Option<Session> {
        lock(&self.link).session.clone()
    }

    pub fn is_terminal(&self) -> bool {
        lock(&self.link).terminal
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.link).last_error.clone()
    }

    pub fn channel_url(&self) -> &Url {
        &self.channel_url
    }

    pub fn relay(&self) -> &MessageRelay {
        &self.relay
    }

    pub fn audio(&self) -> &AudioCueHandler {
        &self.audio
    }

    pub fn segments(&self) -> Vec<TranscriptSegment> {
        lock(&self.transcript).segments().to_vec()
    }

    /// Starts the connection supervisor: connect, run the stream, and
    /// reconnect per [`ReconnectPolicy`] until cancelled or out of retries.
    pub fn connect(self: &Arc<Self>) -> Result<ConnectionTask, ConnectionError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::AlreadyRunning);
        }
        lock(&self.link).terminal = false;

        let (cancel, cancel_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = manager.supervise(cancel_rx).await;
            manager.running.store(false, Ordering::SeqCst);
            result
        });
        Ok(ConnectionTask { cancel, handle })
    }

    async fn supervise(
        self: &Arc<Self>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), ConnectionError> {
        let mut reconnector = Reconnector::new(self.options.reconnect.clone());
        loop {
            let generation = self.begin_attempt(reconnector.failures() + 1);
            let attempt = tokio::select! {
                _ = cancelled(&mut cancel) => {
                    self.teardown("connection cancelled");
                    return Ok(());
                }
                result = self.transport.connect(&self.channel_url) => result,
            };

            match attempt {
                Ok(connection) => {
                    self.transport_opened(generation);
                    let end = self.drive(generation, connection, &mut cancel).await;
                    if lock(&self.link).confirmed == Some(generation) {
                        reconnector.reset();
                    }
                    match end {
                        StreamEnd::Cancelled => {
                            self.teardown("connection cancelled");
                            return Ok(());
                        }
                        StreamEnd::Closed(reason) => self.end_session(generation, reason),
                        StreamEnd::Failed(err) => {
                            warn!(session = generation.0, error = %err, "channel failed");
                            self.enter_error(generation, &err.to_string());
                            self.end_session(generation, Some(err.to_string()));
                        }
                    }
                }
                Err(err) => {
                    warn!(session = generation.0, error = %err, "connection attempt failed");
                    self.enter_error(generation, &err.to_string());
                    self.sessions.invalidate(generation);
                }
            }

            let Some(delay) = reconnector.next_delay() else {
                let attempts = reconnector.failures();
                self.retries_exhausted(attempts);
                return Err(ConnectionError::RetriesExhausted { attempts });
            };
            info!(
                retry = reconnector.failures(),
                max_retries = self.options.reconnect.max_retries,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::select! {
                _ = cancelled(&mut cancel) => {
                    self.teardown("connection cancelled");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn drive(
        &self,
        generation: SessionId,
        connection: ChannelConnection,
        cancel: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        let ChannelConnection {
            mut outgoing,
            mut incoming,
        } = connection;
        let (tx, mut rx) = mpsc::unbounded_channel::<ClientRequest>();
        self.outbound.install(generation, tx);

        let end = loop {
            tokio::select! {
                _ = cancelled(cancel) => break StreamEnd::Cancelled,
                Some(request) = rx.recv() => {
                    let frame = match request.encode() {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!(error = %err, "dropping unencodable outbound frame");
                            continue;
                        }
                    };
                    if let Err(err) = outgoing.send(frame).await {
                        break StreamEnd::Failed(err);
                    }
                    debug!(session = generation.0, event = request.name(), "sent frame");
                }
                frame = incoming.next() => match frame {
                    None => break StreamEnd::Closed(Some("channel closed by peer".to_string())),
                    Some(Err(err)) => break StreamEnd::Failed(err),
                    Some(Ok(text)) => match ServerEvent::decode(&text) {
                        Ok(event) => {
                            if self.handle_event(generation, event) == Flow::Stop {
                                break StreamEnd::Closed(None);
                            }
                        }
                        Err(err) => self.protocol_error(generation, err),
                    },
                },
            }
        };

        self.outbound.clear(generation);
        if let Err(err) = outgoing.close().await {
            debug!(session = generation.0, error = %err, "closing channel sink failed");
        }
        end
    }

    fn handle_event(&self, generation: SessionId, event: ServerEvent) -> Flow {
        if !self.sessions.is_current(generation) {
            debug!(
                session = generation.0,
                event = event.name(),
                "ignoring event from stale session"
            );
            return Flow::Continue;
        }

        match event {
            ServerEvent::ConfirmConnect { sid } => self.confirm(generation, sid),
            ServerEvent::StatusUpdate { status } => {
                return self.apply_server_status(generation, status);
            }
            ServerEvent::SegmentCreation(segment) => self.apply_segment(generation, segment, false),
            ServerEvent::SegmentUpdate(segment) => self.apply_segment(generation, segment, true),
            ServerEvent::AudioCue => self.audio.on_cue(generation),
            ServerEvent::MessageReceived(payload) => {
                self.relay.receive(generation, payload);
            }
            ServerEvent::MessageAck { id } => {
                self.relay.acknowledge(id);
            }
            ServerEvent::Error { message } => {
                warn!(session = generation.0, %message, "server reported error");
                let _ = self.events.send(ClientEvent::ServerError(message));
            }
            ServerEvent::Disconnect { reason } => {
                info!(
                    session = generation.0,
                    reason = reason.as_deref().unwrap_or("none"),
                    "server disconnected session"
                );
                self.end_session(generation, reason);
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn confirm(&self, generation: SessionId, sid: String) {
        let first = {
            let mut link = lock(&self.link);
            link.confirmed = Some(generation);
            link.last_error = None;
            match link.session.as_mut() {
                Some(session) if session.id == generation => {
                    session.sid = sid.clone();
                    false
                }
                _ => {
                    link.session = Some(Session {
                        id: generation,
                        sid: sid.clone(),
                    });
                    true
                }
            }
        };
        info!(session = generation.0, %sid, first, "channel session confirmed");

        if !self.status().can_send() {
            self.move_to(ConnectionState::Connected, Some(generation), None, false);
        }

        if first {
            if let Some(path) = &self.options.target_model_path {
                let request = ClientRequest::Configuration {
                    sid,
                    target_model_path: path.clone(),
                };
                if let Err(err) = self.outbound.send(request) {
                    warn!(
                        session = generation.0,
                        error = %err,
                        "failed to queue session configuration"
                    );
                }
            }
        }
    }

    fn apply_server_status(&self, generation: SessionId, status: ServerStatus) -> Flow {
        debug!(session = generation.0, ?status, "status update");
        match status {
            ServerStatus::ConnectionError => {
                self.enter_error(generation, &ConnectionError::ServerReported.to_string());
                Flow::Stop
            }
            _ if self.status() == ConnectionState::Errored => {
                debug!(session = generation.0, ?status, "ignoring status while errored");
                Flow::Continue
            }
            ServerStatus::Disconnected => {
                // Status only. The channel and session stay up until `disconnect` or stream end.
                self.clear_error();
                self.move_to(
                    ConnectionState::Disconnected,
                    Some(generation),
                    Some("server reported disconnected".to_string()),
                    false,
                );
                Flow::Continue
            }
            ServerStatus::Connecting => {
                self.clear_error();
                if self.status() == ConnectionState::Disconnected {
                    self.move_to(ConnectionState::Connecting, Some(generation), None, false);
                }
                Flow::Continue
            }
            ServerStatus::Connected | ServerStatus::Active => {
                self.clear_error();
                let target = if status == ServerStatus::Active {
                    ConnectionState::Active
                } else {
                    ConnectionState::Connected
                };
                self.move_to(target, Some(generation), None, false);
                Flow::Continue
            }
        }
    }

    fn apply_segment(&self, generation: SessionId, segment: Segment, update: bool) {
        let (outcome, snapshot) = {
            let mut transcript = lock(&self.transcript);
            let outcome = if update {
                transcript.apply_update(generation, segment)
            } else {
                transcript.apply_create(generation, segment)
            };
            let snapshot = outcome.index().and_then(|index| transcript.get(index).cloned());
            (outcome, snapshot)
        };

        let Some(segment) = snapshot else {
            return;
        };
        let event = match outcome {
            ApplyOutcome::Rewritten(index) => ClientEvent::SegmentRewritten { index, segment },
            ApplyOutcome::Appended(index) | ApplyOutcome::Promoted(index) => {
                ClientEvent::SegmentAppended { index, segment }
            }
            ApplyOutcome::Stale => return,
        };
        let _ = self.events.send(event);
    }

    fn protocol_error(&self, generation: SessionId, err: ProtocolError) {
        warn!(session = generation.0, error = %err, "dropping inbound frame");
        let _ = self.events.send(ClientEvent::ProtocolError(err.to_string()));
    }

    fn begin_attempt(&self, attempt: u32) -> SessionId {
        let generation = self.sessions.begin();
        info!(session = generation.0, attempt, url = %self.channel_url, "connecting");
        if self.status() != ConnectionState::Errored {
            self.move_to(ConnectionState::Connecting, Some(generation), None, false);
        }
        generation
    }

    fn transport_opened(&self, generation: SessionId) {
        debug!(session = generation.0, "channel open");
        if self.status() == ConnectionState::Errored {
            self.move_to(
                ConnectionState::Connecting,
                Some(generation),
                Some("channel reopened".to_string()),
                false,
            );
        }
    }

    fn clear_error(&self) {
        lock(&self.link).last_error = None;
    }

    fn enter_error(&self, generation: SessionId, reason: &str) {
        lock(&self.link).last_error = Some(reason.to_string());
        self.move_to(
            ConnectionState::Errored,
            Some(generation),
            Some(reason.to_string()),
            false,
        );
    }

    fn end_session(&self, generation: SessionId, reason: Option<String>) {
        let invalidated = self.sessions.invalidate(generation);
        {
            let mut link = lock(&self.link);
            if link.session.as_ref().is_some_and(|s| s.id == generation) {
                link.session = None;
            }
        }
        self.outbound.clear(generation);
        lock(&self.transcript).freeze();
        if invalidated {
            info!(
                session = generation.0,
                reason = reason.as_deref().unwrap_or("none"),
                "session ended"
            );
        }

        if self.status() != ConnectionState::Errored {
            self.move_to(ConnectionState::Disconnected, Some(generation), reason, false);
        }
    }

    fn teardown(&self, reason: &str) {
        info!(reason, "tearing down connection");
        self.sessions.invalidate_all();
        lock(&self.link).session = None;
        self.outbound.clear_all();
        lock(&self.transcript).freeze();
        self.move_to(ConnectionState::Disconnected, None, Some(reason.to_string()), false);
    }

    fn retries_exhausted(&self, attempts: u32) {
        error!(attempts, "reconnect budget exhausted; giving up");
        {
            let mut link = lock(&self.link);
            link.terminal = true;
            link.last_error = Some(format!("gave up after {attempts} failed attempts"));
        }
        self.move_to(
            ConnectionState::Errored,
            None,
            Some(format!("gave up after {attempts} failed attempts")),
            true,
        );
        let _ = self.events.send(ClientEvent::ReconnectExhausted { attempts });
    }

    /// Moves toward `target`, passing through Connecting and Connected when
    /// coming up from Disconnected or Errored.
    fn move_to(
        &self,
        target: ConnectionState,
        session: Option<SessionId>,
        reason: Option<String>,
        terminal: bool,
    ) {
        use ConnectionState::*;

        let changes = {
            let _link = lock(&self.link);
            let from = self.status();
            let path: &[ConnectionState] = match (from, target) {
                (Disconnected | Errored, Connected) => &[Connecting, Connected],
                (Disconnected | Errored, Active) => &[Connecting, Connected, Active],
                (Connecting, Active) => &[Connected, Active],
                _ => std::slice::from_ref(&target),
            };

            let mut changes = Vec::with_capacity(path.len());
            let mut current = from;
            for step in path {
                if *step == current && !terminal {
                    continue;
                }
                self.state.send_replace(*step);
                changes.push(StatusChange {
                    from: current,
                    to: *step,
                    session,
                    reason: reason.clone(),
                    terminal,
                });
                current = *step;
            }
            changes
        };

        for change in changes {
            debug!(
                from = ?change.from,
                to = ?change.to,
                terminal = change.terminal,
                "connection state changed"
            );
            if change.to == ConnectionState::Active && change.from != ConnectionState::Active {
                self.enter_active();
            }
            let observers = lock(&self.observers).clone();
            for observer in observers {
                observer.on_status_change(&change);
            }
            let _ = self.events.send(ClientEvent::StatusChanged(change));
        }
    }

    fn enter_active(&self) {
        match self.options.active_policy {
            ActivePolicy::ResetTranscript => {
                let cleared = {
                    let mut transcript = lock(&self.transcript);
                    let cleared = transcript.len();
                    transcript.reset();
                    cleared
                };
                info!(cleared, "entered active; transcript reset");
                let _ = self.events.send(ClientEvent::TranscriptReset);
            }
            ActivePolicy::PreserveTranscript => {
                debug!("entered active; transcript preserved");
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
