use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use shared::domain::ChatMessage;
use tokio::sync::{broadcast, watch};
use tracing::info;

pub mod audio;
pub mod connection;
pub mod error;
pub mod events;
pub mod reconciler;
pub mod relay;
pub mod session;
pub mod transport;

pub use audio::{
    AudioCueHandler, AudioFetcher, AudioPlayer, CueStats, HttpAudioFetcher, DEFAULT_AUDIO_PATH,
};
pub use connection::{
    ActivePolicy, Backoff, ConnectionManager, ConnectionState, ConnectionTask, ReconnectPolicy,
    Reconnector, StatusChange, StatusObserver,
};
pub use error::{ConnectionError, InputError, RelayError, ResourceError};
pub use events::ClientEvent;
pub use reconciler::{SegmentIssue, TranscriptSegment};
pub use relay::{AudioChunk, DEFAULT_SENDER_LABEL};
pub use transport::{Transport, WebSocketTransport};

pub const DEFAULT_SERVER_URL: &str = "http://localhost:5001";
pub const DEFAULT_CHANNEL_PATH: &str = "/propagate_whisper_events";

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// HTTP(S) base url. The channel url is derived from it.
    pub server_url: String,
    pub channel_path: String,
    pub audio_path: String,
    pub reconnect: ReconnectPolicy,
    pub active_policy: ActivePolicy,
    pub sender_label: String,
    /// Sent once per session as a `configuration` frame when set.
    pub target_model_path: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            channel_path: DEFAULT_CHANNEL_PATH.to_string(),
            audio_path: DEFAULT_AUDIO_PATH.to_string(),
            reconnect: ReconnectPolicy::default(),
            active_policy: ActivePolicy::default(),
            sender_label: DEFAULT_SENDER_LABEL.to_string(),
            target_model_path: None,
        }
    }
}

impl ClientOptions {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }
}

/// Everything a front end needs: connection status, the live transcript,
/// chat and audio cues behind one handle.
pub struct SyncClient {
    manager: Arc<ConnectionManager>,
    task: Mutex<Option<ConnectionTask>>,
}

impl SyncClient {
    pub fn new(
        options: ClientOptions,
        transport: Arc<dyn Transport>,
        fetcher: Arc<dyn AudioFetcher>,
        player: Arc<dyn AudioPlayer>,
    ) -> Result<Self, ConnectionError> {
        Ok(Self {
            manager: ConnectionManager::new(options, transport, fetcher, player)?,
            task: Mutex::new(None),
        })
    }

    /// WebSocket channel plus HTTP audio fetch against `options.server_url`.
    pub fn with_websocket(
        options: ClientOptions,
        player: Arc<dyn AudioPlayer>,
    ) -> Result<Self, ConnectionError> {
        let fetcher = HttpAudioFetcher::for_server(&options.server_url, &options.audio_path)?;
        Self::new(
            options,
            Arc::new(WebSocketTransport),
            Arc::new(fetcher),
            player,
        )
    }

    pub fn connect(&self) -> Result<(), ConnectionError> {
        let task = self.manager.connect()?;
        info!(url = %self.manager.channel_url(), "sync client started");
        *lock(&self.task) = Some(task);
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        let task = lock(&self.task).take();
        match task {
            Some(task) => task.shutdown().await,
            None => Ok(()),
        }
    }

    /// Waits for the connection task to stop on its own, e.g. once retries run out.
    pub async fn join(&self) -> Result<(), ConnectionError> {
        let task = lock(&self.task).take();
        match task {
            Some(task) => task.join().await,
            None => Ok(()),
        }
    }

    pub fn status(&self) -> ConnectionState {
        self.manager.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.manager.watch_status()
    }

    pub fn is_terminal(&self) -> bool {
        self.manager.is_terminal()
    }

    pub fn on_status_change(&self, observer: impl StatusObserver + 'static) {
        self.manager.on_status_change(observer);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.manager.subscribe_events()
    }

    pub fn send_message(&self, text: &str) -> Result<ChatMessage, RelayError> {
        self.manager.relay().send(text)
    }

    pub fn send_stt_chunk(&self, chunk: &AudioChunk) -> Result<(), RelayError> {
        let session = self
            .manager
            .session()
            .ok_or(RelayError::NotConnected(self.status()))?;
        self.manager.relay().send_audio_chunk(&session.sid, chunk)
    }

    pub fn segments(&self) -> Vec<TranscriptSegment> {
        self.manager.segments()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.manager.relay().history()
    }

    pub fn cue_stats(&self) -> CueStats {
        self.manager.audio().stats()
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
