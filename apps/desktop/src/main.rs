use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use clap::Parser;
use client_core::{AudioPlayer, ClientEvent, ResourceError, StatusChange, SyncClient};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use crate::config::Settings;

#[derive(Parser, Debug)]
#[command(about = "Follow a live transcription session from the terminal")]
struct Args {
    /// Configuration file. Defaults to ./transcript.toml when present.
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    sender: Option<String>,
    #[arg(long)]
    target_model_path: Option<String>,
    /// Directory to write fetched cue audio into.
    #[arg(long)]
    audio_output_dir: Option<PathBuf>,
    #[arg(long)]
    max_retries: Option<u32>,
}

impl Args {
    fn apply(self, mut settings: Settings) -> Settings {
        if let Some(v) = self.server_url {
            settings.server_url = v;
        }
        if let Some(v) = self.sender {
            settings.sender_label = v;
        }
        if let Some(v) = self.target_model_path {
            settings.target_model_path = Some(v);
        }
        if let Some(v) = self.audio_output_dir {
            settings.audio_output_dir = Some(v);
        }
        if let Some(v) = self.max_retries {
            settings.reconnect_attempts = v;
        }
        settings
    }
}

/// Writes each cue to `dir` as it arrives, or just logs it when no dir is set.
struct FileAudioPlayer {
    dir: Option<PathBuf>,
    written: AtomicU64,
}

#[async_trait]
impl AudioPlayer for FileAudioPlayer {
    async fn play(&self, audio: Vec<u8>) -> Result<(), ResourceError> {
        let seq = self.written.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(dir) = &self.dir else {
            info!(seq, bytes = audio.len(), "audio cue received");
            return Ok(());
        };
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|err| ResourceError::Playback(err.to_string()))?;
        let path = dir.join(format!("cue-{seq:04}.wav"));
        tokio::fs::write(&path, &audio)
            .await
            .map_err(|err| ResourceError::Playback(err.to_string()))?;
        info!(seq, bytes = audio.len(), path = %path.display(), "audio cue saved");
        Ok(())
    }
}

fn log_event(event: ClientEvent) {
    match event {
        ClientEvent::SegmentAppended { index, segment } => info!(
            index,
            start = segment.segment.start_time,
            end = segment.segment.end_time,
            valid = segment.is_valid(),
            "+ {}",
            segment.segment.text
        ),
        ClientEvent::SegmentRewritten { index, segment } => {
            info!(index, "~ {}", segment.segment.text)
        }
        ClientEvent::TranscriptReset => info!("transcript cleared"),
        ClientEvent::MessageAppended(message) => {
            info!(sender = %message.sender, at = %message.timestamp, "{}", message.text)
        }
        ClientEvent::MessageAcknowledged(id) => info!(message_id = %id, "delivered"),
        ClientEvent::ServerError(message) => warn!(%message, "server error"),
        ClientEvent::ProtocolError(reason) => warn!(%reason, "dropped frame"),
        ClientEvent::StatusChanged(_) | ClientEvent::ReconnectExhausted { .. } => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config.clone();
    let settings = args.apply(Settings::load(config_path.as_deref())?);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter)),
        )
        .init();

    let player = Arc::new(FileAudioPlayer {
        dir: settings.audio_output_dir.clone(),
        written: AtomicU64::new(0),
    });
    let client = SyncClient::with_websocket(settings.client_options(), player)?;
    client.on_status_change(|change: &StatusChange| {
        info!(
            from = ?change.from,
            to = ?change.to,
            reason = change.reason.as_deref().unwrap_or(""),
            terminal = change.terminal,
            "status"
        );
    });
    let mut events = BroadcastStream::new(client.subscribe_events());
    client.connect()?;
    info!(server = %settings.server_url, sender = %settings.sender_label, "type a line to send it");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted");
                break Ok(());
            }
            line = lines.next_line() => match line {
                Ok(Some(text)) => {
                    if let Err(err) = client.send_message(&text) {
                        warn!(error = %err, "message not sent");
                    }
                }
                Ok(None) => break Ok(()),
                Err(err) => break Err(err.into()),
            },
            event = events.next() => match event {
                Some(Ok(ClientEvent::ReconnectExhausted { attempts })) => {
                    error!(attempts, "server unreachable");
                    break Ok(());
                }
                Some(Ok(event)) => log_event(event),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(skipped, "event stream lagged");
                }
                None => break Ok(()),
            },
        }
    };

    if let Err(err) = client.shutdown().await {
        bail!("connection to {} ended: {err}", settings.server_url);
    }
    outcome
}
