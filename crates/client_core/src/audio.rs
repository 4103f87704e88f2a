use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::Client;
use shared::domain::SessionId;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{ConnectionError, ResourceError},
    lock,
    session::SessionTracker,
    transport::endpoint_url,
};

pub const DEFAULT_AUDIO_PATH: &str = "/whispercore/get_audio";

#[async_trait]
pub trait AudioFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Vec<u8>, ResourceError>;
}

/// Local audio output. `play` resolves once playback has finished.
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    async fn play(&self, audio: Vec<u8>) -> Result<(), ResourceError>;
}

pub struct HttpAudioFetcher {
    http: Client,
    url: Url,
}

impl HttpAudioFetcher {
    pub fn new(url: Url) -> Self {
        Self {
            http: Client::new(),
            url,
        }
    }

    pub fn for_server(server_url: &str, path: &str) -> Result<Self, ConnectionError> {
        Ok(Self::new(endpoint_url(server_url, path)?))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl AudioFetcher for HttpAudioFetcher {
    async fn fetch(&self) -> Result<Vec<u8>, ResourceError> {
        let res = self
            .http
            .get(self.url.clone())
            .send()
            .await?
            .error_for_status()?;
        Ok(res.bytes().await?.to_vec())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CueStats {
    pub played: u64,
    pub failed: u64,
    /// Cues whose session ended before playback could start.
    pub suppressed: u64,
    /// Cues folded into an already pending one.
    pub coalesced: u64,
}

struct CueQueue {
    running: bool,
    pending: Option<SessionId>,
    stats: CueStats,
}

struct CueWorker {
    fetcher: Arc<dyn AudioFetcher>,
    player: Arc<dyn AudioPlayer>,
    sessions: SessionTracker,
    queue: Mutex<CueQueue>,
    busy: watch::Sender<bool>,
}

/// Fetches and plays the cue audio off the event path, one at a time.
///
/// A cue that arrives while another is being fetched or played waits as the
/// single pending cue; further cues replace it. Failures are logged and
/// never reach connection state or the transcript.
#[derive(Clone)]
pub struct AudioCueHandler {
    worker: Arc<CueWorker>,
}

impl AudioCueHandler {
    pub fn new(
        fetcher: Arc<dyn AudioFetcher>,
        player: Arc<dyn AudioPlayer>,
        sessions: SessionTracker,
    ) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            worker: Arc::new(CueWorker {
                fetcher,
                player,
                sessions,
                queue: Mutex::new(CueQueue {
                    running: false,
                    pending: None,
                    stats: CueStats::default(),
                }),
                busy,
            }),
        }
    }

    /// Must be called from within a tokio runtime.
    pub fn on_cue(&self, session: SessionId) {
        let worker = &self.worker;
        let mut queue = lock(&worker.queue);
        if !worker.sessions.is_current(session) {
            debug!(session = session.0, "ignoring audio cue from stale session");
            queue.stats.suppressed += 1;
            return;
        }
        if queue.running {
            if queue.pending.replace(session).is_some() {
                queue.stats.coalesced += 1;
            }
            debug!(session = session.0, "audio cue queued behind in-flight playback");
            return;
        }
        queue.running = true;
        worker.busy.send_replace(true);
        drop(queue);

        let worker = Arc::clone(worker);
        tokio::spawn(async move { worker.run(session).await });
    }

    pub fn is_busy(&self) -> bool {
        *self.worker.busy.borrow()
    }

    pub async fn wait_idle(&self) {
        let mut busy = self.worker.busy.subscribe();
        let _ = busy.wait_for(|busy| !*busy).await;
    }

    pub fn stats(&self) -> CueStats {
        lock(&self.worker.queue).stats
    }
}

impl CueWorker {
    async fn run(self: Arc<Self>, mut session: SessionId) {
        loop {
            self.play_once(session).await;
            let mut queue = lock(&self.queue);
            match queue.pending.take() {
                Some(next) => session = next,
                None => {
                    queue.running = false;
                    self.busy.send_replace(false);
                    return;
                }
            }
        }
    }

    async fn play_once(&self, session: SessionId) {
        if !self.sessions.is_current(session) {
            self.record(|stats| stats.suppressed += 1);
            return;
        }

        let audio = match self.fetcher.fetch().await {
            Ok(audio) => audio,
            Err(err) => {
                warn!(session = session.0, error = %err, "audio cue fetch failed");
                self.record(|stats| stats.failed += 1);
                return;
            }
        };

        if !self.sessions.is_current(session) {
            debug!(session = session.0, "session ended during audio fetch; skipping playback");
            self.record(|stats| stats.suppressed += 1);
            return;
        }

        let bytes = audio.len();
        match self.player.play(audio).await {
            Ok(()) => {
                info!(session = session.0, bytes, "played audio cue");
                self.record(|stats| stats.played += 1);
            }
            Err(err) => {
                warn!(session = session.0, error = %err, "audio cue playback failed");
                self.record(|stats| stats.failed += 1);
            }
        }
    }

    fn record(&self, update: impl FnOnce(&mut CueStats)) {
        update(&mut lock(&self.queue).stats);
    }
}
