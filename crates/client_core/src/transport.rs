use std::{
    pin::Pin,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use futures::{future, stream::BoxStream, Sink, SinkExt, StreamExt};
use shared::{domain::SessionId, protocol::ClientRequest};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;
use url::Url;

use crate::{error::ConnectionError, error::RelayError, lock, session::SessionTracker};

pub type FrameSink = Pin<Box<dyn Sink<String, Error = ConnectionError> + Send>>;
pub type FrameStream = BoxStream<'static, Result<String, ConnectionError>>;

/// Both halves of one open channel. The stream ends when the peer closes.
pub struct ChannelConnection {
    pub outgoing: FrameSink,
    pub incoming: FrameStream,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<ChannelConnection, ConnectionError>;
}

pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &Url) -> Result<ChannelConnection, ConnectionError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ConnectionError::Connect {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        let (writer, reader) = ws_stream.split();

        let outgoing = writer
            .sink_map_err(|err| ConnectionError::Send(err.to_string()))
            .with(|text: String| future::ready(Ok::<_, ConnectionError>(Message::Text(text))));

        let incoming = reader
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(other) => {
                        debug!(kind = ?other, "ignoring non-text websocket frame");
                        None
                    }
                    Err(err) => Some(Err(ConnectionError::Receive(err.to_string()))),
                })
            })
            .boxed();

        Ok(ChannelConnection {
            outgoing: Box::pin(outgoing),
            incoming,
        })
    }
}

fn parse_base(server_url: &str) -> Result<Url, ConnectionError> {
    Url::parse(server_url.trim()).map_err(|err| ConnectionError::InvalidUrl {
        url: server_url.to_string(),
        reason: err.to_string(),
    })
}

fn join_path(url: &mut Url, path: &str) {
    let joined = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
}

/// HTTP(S) server url plus path, as a websocket url.
pub fn channel_url(server_url: &str, path: &str) -> Result<Url, ConnectionError> {
    let mut url = parse_base(server_url)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ConnectionError::InvalidUrl {
                url: server_url.to_string(),
                reason: format!("unsupported scheme `{other}`"),
            })
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| ConnectionError::InvalidUrl {
            url: server_url.to_string(),
            reason: format!("cannot switch scheme to `{scheme}`"),
        })?;
    join_path(&mut url, path);
    Ok(url)
}

pub fn endpoint_url(server_url: &str, path: &str) -> Result<Url, ConnectionError> {
    let mut url = parse_base(server_url)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConnectionError::InvalidUrl {
            url: server_url.to_string(),
            reason: format!("unsupported scheme `{}`", url.scheme()),
        });
    }
    join_path(&mut url, path);
    Ok(url)
}

/// Outbound queue of the live session. Only the connection manager installs
/// or clears it; senders find it empty between sessions.
#[derive(Clone)]
pub struct OutboundSlot {
    sessions: SessionTracker,
    inner: Arc<Mutex<Option<(SessionId, mpsc::UnboundedSender<ClientRequest>)>>>,
}

impl OutboundSlot {
    pub fn new(sessions: SessionTracker) -> Self {
        Self {
            sessions,
            inner: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn install(&self, session: SessionId, tx: mpsc::UnboundedSender<ClientRequest>) {
        *lock(&self.inner) = Some((session, tx));
    }

    pub(crate) fn clear(&self, session: SessionId) {
        let mut slot = lock(&self.inner);
        if slot.as_ref().is_some_and(|(owner, _)| *owner == session) {
            *slot = None;
        }
    }

    pub(crate) fn clear_all(&self) {
        *lock(&self.inner) = None;
    }

    pub fn session(&self) -> Option<SessionId> {
        lock(&self.inner).as_ref().map(|(session, _)| *session)
    }

    pub fn send(&self, request: ClientRequest) -> Result<SessionId, RelayError> {
        let slot = lock(&self.inner);
        match slot.as_ref() {
            Some((session, tx)) if self.sessions.is_current(*session) => tx
                .send(request)
                .map(|()| *session)
                .map_err(|_| RelayError::ChannelClosed),
            _ => Err(RelayError::ChannelClosed),
        }
    }
}
