use std::sync::atomic::AtomicUsize;

use async_trait::async_trait;
use serde_json::json;

use super::*;
use crate::{
    error::{RelayError, ResourceError},
    transport::testing::ScriptedTransport,
};
use ConnectionState::*;

struct StaticFetcher;

#[async_trait]
impl AudioFetcher for StaticFetcher {
    async fn fetch(&self) -> Result<Vec<u8>, ResourceError> {
        Ok(vec![1, 2, 3])
    }
}

#[derive(Default)]
struct SlowPlayer {
    active: AtomicUsize,
    max_active: AtomicUsize,
    played: AtomicUsize,
}

#[async_trait]
impl AudioPlayer for SlowPlayer {
    async fn play(&self, _audio: Vec<u8>) -> Result<(), ResourceError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.played.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    manager: Arc<ConnectionManager>,
    transport: Arc<ScriptedTransport>,
    player: Arc<SlowPlayer>,
    changes: Arc<Mutex<Vec<StatusChange>>>,
}

impl Harness {
    fn states(&self) -> Vec<ConnectionState> {
        lock(&self.changes).iter().map(|change| change.to).collect()
    }

    fn last_change(&self) -> Option<StatusChange> {
        lock(&self.changes).last().cloned()
    }

    fn texts(&self) -> Vec<String> {
        self.manager
            .segments()
            .into_iter()
            .map(|s| s.segment.text)
            .collect()
    }
}

fn harness(options: ClientOptions) -> Harness {
    let transport = Arc::new(ScriptedTransport::default());
    let player = Arc::new(SlowPlayer::default());
    let manager = ConnectionManager::new(
        options,
        transport.clone(),
        Arc::new(StaticFetcher),
        player.clone(),
    )
    .expect("manager");
    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    manager.on_status_change(move |change: &StatusChange| lock(&sink).push(change.clone()));
    Harness {
        manager,
        transport,
        player,
        changes,
    }
}

fn options_with_retries(max_retries: u32) -> ClientOptions {
    let mut options = ClientOptions::default();
    options.reconnect.max_retries = max_retries;
    options
}

async fn eventually(what: &str, mut done: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn drain(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn segment(text: &str, start: f64, end: f64) -> serde_json::Value {
    json!({ "transcription": text, "start_time": start, "end_time": end })
}

#[test]
fn fixed_backoff_allows_exactly_max_retries() {
    let mut reconnector = Reconnector::new(ReconnectPolicy {
        max_retries: 2,
        delay: Duration::from_millis(1000),
        backoff: Backoff::Fixed,
    });
    assert_eq!(reconnector.next_delay(), Some(Duration::from_millis(1000)));
    assert_eq!(reconnector.next_delay(), Some(Duration::from_millis(1000)));
    assert_eq!(reconnector.next_delay(), None);
    assert_eq!(reconnector.failures(), 3);

    reconnector.reset();
    assert_eq!(reconnector.next_delay(), Some(Duration::from_millis(1000)));
}

#[test]
fn exponential_backoff_doubles_up_to_the_cap() {
    let mut reconnector = Reconnector::new(ReconnectPolicy {
        max_retries: 5,
        delay: Duration::from_millis(500),
        backoff: Backoff::Exponential {
            max_delay: Duration::from_millis(3000),
        },
    });
    let delays: Vec<_> = std::iter::from_fn(|| reconnector.next_delay())
        .map(|d| d.as_millis())
        .collect();
    assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);
}

#[tokio::test(start_paused = true)]
async fn confirm_connect_passes_through_connecting() {
    let h = harness(ClientOptions::default());
    let peer = h.transport.accept();
    let task = h.manager.connect().expect("connect");

    peer.emit("confirm_connect", json!({ "sid": "abc" }));
    eventually("connected", || h.manager.status() == Connected).await;

    assert_eq!(h.states(), vec![Connecting, Connected]);
    assert_eq!(
        h.manager.session().map(|session| session.sid),
        Some("abc".to_string())
    );
    task.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn active_before_confirm_still_passes_through_connected() {
    let h = harness(ClientOptions::default());
    let peer = h.transport.accept();
    let task = h.manager.connect().expect("connect");

    peer.emit("status_update", json!({ "status": "active" }));
    eventually("active", || h.manager.status() == Active).await;

    assert_eq!(h.states(), vec![Connecting, Connected, Active]);
    task.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn second_connect_is_rejected_while_running() {
    let h = harness(ClientOptions::default());
    let _peer = h.transport.accept();
    let task = h.manager.connect().expect("connect");
    assert!(matches!(
        h.manager.connect(),
        Err(ConnectionError::AlreadyRunning)
    ));
    task.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_the_retry_budget() {
    let h = harness(options_with_retries(3));
    let mut events = h.manager.subscribe_events();
    let task = h.manager.connect().expect("connect");

    let result = task.join().await;

    assert_eq!(result, Err(ConnectionError::RetriesExhausted { attempts: 4 }));
    assert_eq!(h.transport.attempts(), 4);
    assert!(h.manager.is_terminal());
    assert_eq!(h.manager.status(), Errored);
    assert_eq!(h.states(), vec![Connecting, Errored, Errored]);
    assert!(h.last_change().expect("change").terminal);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, ClientEvent::ReconnectExhausted { attempts: 4 })));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.transport.attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn confirmed_session_resets_the_retry_budget() {
    let h = harness(options_with_retries(2));
    h.transport.refuse(2);
    let peer = h.transport.accept();
    let task = h.manager.connect().expect("connect");

    peer.emit("confirm_connect", json!({ "sid": "abc" }));
    eventually("connected", || h.manager.status() == Connected).await;
    assert_eq!(h.transport.attempts(), 3);
    assert_eq!(
        &h.states()[..4],
        &[Connecting, Errored, Connecting, Connected]
    );

    peer.close();
    let result = task.join().await;

    assert_eq!(result, Err(ConnectionError::RetriesExhausted { attempts: 3 }));
    assert_eq!(h.transport.attempts(), 5);
}

#[tokio::test(start_paused = true)]
async fn transcript_follows_create_update_create() {
    let h = harness(ClientOptions::default());
    let peer = h.transport.accept();
    let task = h.manager.connect().expect("connect");

    peer.emit("confirm_connect", json!({ "sid": "abc" }));
    peer.emit("status_update", json!({ "status": "active" }));
    peer.emit("segment_creation", segment("Hello", 0.0, 1.0));
    peer.emit("segment_update", segment("Hello world", 0.0, 1.5));
    peer.emit("segment_creation", segment("How", 1.6, 2.0));

    eventually("two segments", || h.texts().len() == 2).await;
    assert_eq!(h.texts(), vec!["Hello world", "How"]);
    let segments = h.manager.segments();
    assert_eq!(segments[0].segment.end_time, 1.5);
    assert!(segments.iter().all(TranscriptSegment::is_valid));
    task.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn reentering_active_resets_the_transcript() {
    let h = harness(ClientOptions::default());
    let mut events = h.manager.subscribe_events();
    let peer = h.transport.accept();
    let task = h.manager.connect().expect("connect");

    peer.emit("confirm_connect", json!({ "sid": "abc" }));
    peer.emit("status_update", json!({ "status": "active" }));
    peer.emit("segment_creation", segment("a", 0.0, 1.0));
    eventually("segment", || h.texts().len() == 1).await;

    peer.emit("status_update", json!({ "status": "connected" }));
    peer.emit("status_update", json!({ "status": "active" }));
    eventually("reset", || h.texts().is_empty()).await;

    let resets = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, ClientEvent::TranscriptReset))
        .count();
    assert_eq!(resets, 2);
    task.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn preserve_policy_keeps_the_transcript_across_active_periods() {
    let mut options = ClientOptions::default();
    options.active_policy = ActivePolicy::PreserveTranscript;
    let h = harness(options);
    let peer = h.transport.accept();
    let task = h.manager.connect().expect("connect");

    peer.emit("confirm_connect", json!({ "sid": "abc" }));
    peer.emit("status_update", json!({ "status": "active" }));
    peer.emit("segment_creation", segment("a", 0.0, 1.0));
    peer.emit("status_update", json!({ "status": "connected" }));
    peer.emit("status_update", json!({ "status": "active" }));
    peer.emit("segment_creation", segment("b", 1.0, 2.0));

    eventually("two segments", || h.texts().len() == 2).await;
    assert_eq!(h.texts(), vec!["a", "b"]);
    assert_eq!(h.manager.status(), Active);
    task.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn disconnected_status_keeps_the_session_until_the_server_recovers() {
    let h = harness(ClientOptions::default());
    let peer = h.transport.accept();
    let task = h.manager.connect().expect("connect");

    peer.emit("confirm_connect", json!({ "sid": "abc" }));
    peer.emit("status_update", json!({ "status": "active" }));
    eventually("active", || h.manager.status() == Active).await;

    peer.emit("status_update", json!({ "status": "disconnected" }));
    eventually("disconnected", || h.manager.status() == Disconnected).await;
    assert_eq!(
        h.manager.session().map(|session| session.sid),
        Some("abc".to_string())
    );

    peer.emit("status_update", json!({ "status": "connecting" }));
    peer.emit("status_update", json!({ "status": "active" }));
    peer.emit("segment_creation", segment("after whisper core restart", 0.0, 1.0));
    eventually("segment", || h.texts().len() == 1).await;

    assert_eq!(
        h.states(),
        vec![Connecting, Connected, Active, Disconnected, Connecting, Connected, Active]
    );
    assert_eq!(h.transport.attempts(), 1);
    assert_eq!(
        h.manager.session().map(|session| session.sid),
        Some("abc".to_string())
    );
    assert_eq!(h.texts(), vec!["after whisper core restart"]);
    task.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn events_from_a_stale_session_are_ignored() {
    let h = harness(ClientOptions::default());
    let old = h.manager.sessions.begin();
    let current = h.manager.sessions.begin();

    let flow = h.manager.handle_event(
        old,
        ServerEvent::SegmentCreation(Segment::new("late", 0.0, 1.0)),
    );
    assert_eq!(flow, Flow::Continue);
    h.manager.handle_event(
        old,
        ServerEvent::StatusUpdate {
            status: ServerStatus::Active,
        },
    );
    h.manager.handle_event(old, ServerEvent::AudioCue);

    assert!(h.manager.segments().is_empty());
    assert_eq!(h.manager.status(), Disconnected);
    assert_eq!(h.manager.audio().stats(), crate::audio::CueStats::default());
    assert!(!h.manager.audio().is_busy());

    h.manager.handle_event(
        current,
        ServerEvent::SegmentCreation(Segment::new("fresh", 0.0, 1.0)),
    );
    assert_eq!(h.texts(), vec!["fresh"]);
}

#[tokio::test(start_paused = true)]
async fn configuration_is_sent_once_per_session() {
    let mut options = ClientOptions::default();
    options.target_model_path = Some("models/base.en".to_string());
    let h = harness(options);
    let mut peer = h.transport.accept();
    let task = h.manager.connect().expect("connect");

    peer.emit("confirm_connect", json!({ "sid": "abc" }));
    let frame = peer.next_request().await.expect("configuration frame");
    assert_eq!(
        frame,
        json!({
            "event": "configuration",
            "data": { "sid": "abc", "target_model_path": "models/base.en" }
        })
    );

    peer.emit("confirm_connect", json!({ "sid": "abc2" }));
    eventually("sid refresh", || {
        h.manager.session().map(|s| s.sid) == Some("abc2".to_string())
    })
    .await;
    h.manager.relay().send("hi").expect("send");
    let frame = peer.next_request().await.expect("message frame");
    assert_eq!(frame["event"], "send_message");
    assert_eq!(frame["data"]["text"], "hi");
    assert_eq!(frame["data"]["sender"], "User");
    task.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn sends_are_refused_once_the_session_ends() {
    let h = harness(ClientOptions::default());
    assert_eq!(
        h.manager.relay().send("early"),
        Err(RelayError::NotConnected(Disconnected))
    );

    let mut peer = h.transport.accept();
    let task = h.manager.connect().expect("connect");
    peer.emit("confirm_connect", json!({ "sid": "abc" }));
    eventually("connected", || h.manager.status() == Connected).await;

    peer.emit("disconnect", json!({ "reason": "server shutdown" }));
    eventually("disconnected", || h.manager.status() == Disconnected).await;

    assert!(h.manager.relay().send("late").is_err());
    assert!(peer.try_next_request().is_none());
    assert!(h.manager.relay().history().is_empty());
    assert_eq!(
        h.last_change().and_then(|change| change.reason),
        Some("server shutdown".to_string())
    );
    task.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn server_error_is_not_fatal() {
    let h = harness(ClientOptions::default());
    let mut events = h.manager.subscribe_events();
    let peer = h.transport.accept();
    let task = h.manager.connect().expect("connect");

    peer.emit("confirm_connect", json!({ "sid": "abc" }));
    peer.emit("status_update", json!({ "status": "active" }));
    peer.emit("error", json!({ "message": "boom" }));
    peer.emit("segment_creation", segment("still here", 0.0, 1.0));

    eventually("segment", || h.texts().len() == 1).await;
    assert_eq!(h.manager.status(), Active);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, ClientEvent::ServerError(message) if message == "boom")));
    task.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_reported_and_not_applied() {
    let h = harness(ClientOptions::default());
    let mut events = h.manager.subscribe_events();
    let peer = h.transport.accept();
    let task = h.manager.connect().expect("connect");

    peer.emit("confirm_connect", json!({ "sid": "abc" }));
    peer.emit_raw("not json");
    peer.emit("mystery_event", json!({}));
    peer.emit("segment_creation", json!({ "bogus": 1 }));
    peer.emit("status_update", json!({ "status": "sleeping" }));
    peer.emit("segment_creation", segment("ok", 0.0, 1.0));

    eventually("segment", || h.texts().len() == 1).await;
    assert_eq!(h.texts(), vec!["ok"]);
    assert_eq!(h.manager.status(), Connected);
    let protocol_errors = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, ClientEvent::ProtocolError(_)))
        .count();
    assert_eq!(protocol_errors, 4);
    task.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn connection_error_status_drops_the_stream_and_retries() {
    let h = harness(options_with_retries(1));
    let peer = h.transport.accept();
    let task = h.manager.connect().expect("connect");

    peer.emit("confirm_connect", json!({ "sid": "abc" }));
    peer.emit("status_update", json!({ "status": "active" }));
    peer.emit("status_update", json!({ "status": "connection_error" }));
    peer.emit("segment_creation", segment("after error", 0.0, 1.0));

    eventually("errored", || h.manager.status() == Errored).await;
    assert!(h.manager.session().is_none());

    let result = task.join().await;
    assert_eq!(result, Err(ConnectionError::RetriesExhausted { attempts: 2 }));
    assert_eq!(h.transport.attempts(), 2);
    assert!(h.texts().is_empty());
    assert!(!h.states().contains(&Disconnected));
}

#[tokio::test(start_paused = true)]
async fn last_error_is_cleared_once_the_server_confirms() {
    let h = harness(options_with_retries(3));
    h.transport.refuse(1);
    let peer = h.transport.accept();
    let task = h.manager.connect().expect("connect");

    eventually("second attempt", || {
        h.transport.attempts() == 2 && h.manager.status() == Connecting
    })
    .await;
    assert!(h.manager.last_error().is_some());

    peer.emit("confirm_connect", json!({ "sid": "abc" }));
    eventually("connected", || h.manager.status() == Connected).await;
    assert_eq!(h.manager.last_error(), None);

    peer.emit("status_update", json!({ "status": "connection_error" }));
    eventually("errored", || h.manager.status() == Errored).await;
    assert_eq!(
        h.manager.last_error(),
        Some(ConnectionError::ServerReported.to_string())
    );
    task.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn update_after_reconnect_starts_a_new_segment() {
    let h = harness(ClientOptions::default());
    let first = h.transport.accept();
    let second = h.transport.accept();
    let task = h.manager.connect().expect("connect");

    first.emit("confirm_connect", json!({ "sid": "abc" }));
    first.emit("segment_creation", segment("a", 0.0, 1.0));
    first.emit("disconnect", json!(null));
    eventually("disconnected", || h.states().contains(&Disconnected)).await;

    second.emit("confirm_connect", json!({ "sid": "def" }));
    second.emit("segment_update", segment("b", 1.0, 2.0));
    eventually("two segments", || h.texts().len() == 2).await;

    assert_eq!(h.texts(), vec!["a", "b"]);
    let segments = h.manager.segments();
    assert_ne!(segments[0].session, segments[1].session);
    assert_eq!(
        h.manager.session().map(|session| session.sid),
        Some("def".to_string())
    );
    task.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn cancel_disconnects_and_stops_retrying() {
    let h = harness(ClientOptions::default());
    let peer = h.transport.accept();
    let task = h.manager.connect().expect("connect");
    peer.emit("confirm_connect", json!({ "sid": "abc" }));
    eventually("connected", || h.manager.status() == Connected).await;

    task.shutdown().await.expect("shutdown");

    assert_eq!(h.manager.status(), Disconnected);
    assert!(h.manager.session().is_none());
    assert!(!h.manager.is_terminal());
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.transport.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn audio_cues_never_overlap() {
    let h = harness(ClientOptions::default());
    let peer = h.transport.accept();
    let task = h.manager.connect().expect("connect");

    peer.emit("confirm_connect", json!({ "sid": "abc" }));
    peer.emit("gemini_response", json!({}));
    peer.emit("audio_cue", json!(null));

    eventually("two plays", || h.player.played.load(Ordering::SeqCst) == 2).await;
    assert_eq!(h.player.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(h.manager.status(), Connected);
    task.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn relayed_messages_and_acks_reach_the_history() {
    let h = harness(ClientOptions::default());
    let mut peer = h.transport.accept();
    let task = h.manager.connect().expect("connect");

    peer.emit("confirm_connect", json!({ "sid": "abc" }));
    eventually("connected", || h.manager.status() == Connected).await;
    let sent = h.manager.relay().send("question").expect("send");
    let frame = peer.next_request().await.expect("frame");
    assert_eq!(frame["data"]["id"], json!(sent.id));

    peer.emit("message_ack", json!({ "id": sent.id }));
    peer.emit(
        "receive_message",
        json!({ "text": "answer", "timestamp": "12:00:01", "sender": "Assistant" }),
    );
    eventually("reply", || h.manager.relay().history().len() == 2).await;

    let history = h.manager.relay().history();
    assert_eq!(history[0].delivery, shared::domain::Delivery::Acknowledged);
    assert_eq!(history[1].text, "answer");
    assert_eq!(history[1].delivery, shared::domain::Delivery::Received);
    task.shutdown().await.expect("shutdown");
}
