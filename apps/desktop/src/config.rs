use std::{path::PathBuf, time::Duration};

use ::config::{Config, Environment, File, Map};
use anyhow::Context;
use client_core::{
    ActivePolicy, Backoff, ClientOptions, ReconnectPolicy, DEFAULT_AUDIO_PATH,
    DEFAULT_CHANNEL_PATH, DEFAULT_SENDER_LABEL, DEFAULT_SERVER_URL,
};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "transcript.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server_url: String,
    pub channel_path: String,
    pub audio_path: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub reconnect_backoff: BackoffKind,
    pub reconnect_max_delay_ms: u64,
    pub reset_on_active: bool,
    pub sender_label: String,
    pub target_model_path: Option<String>,
    pub audio_output_dir: Option<PathBuf>,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.into(),
            channel_path: DEFAULT_CHANNEL_PATH.into(),
            audio_path: DEFAULT_AUDIO_PATH.into(),
            reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            reconnect_backoff: BackoffKind::Fixed,
            reconnect_max_delay_ms: 30_000,
            reset_on_active: true,
            sender_label: DEFAULT_SENDER_LABEL.into(),
            target_model_path: None,
            audio_output_dir: None,
            log_filter: "info".into(),
        }
    }
}

fn app_environment() -> Environment {
    Environment::with_prefix("APP")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

impl Settings {
    /// Reads `path` (or `transcript.toml` if present) and `APP__*` variables.
    /// An explicitly named file must exist.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        Self::load_from(path, app_environment())
    }

    fn load_from(path: Option<&str>, env: Environment) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => File::with_name(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let settings = Config::builder()
            .add_source(file)
            .add_source(env)
            .build()
            .with_context(|| {
                format!(
                    "failed to read configuration from {}",
                    path.unwrap_or(DEFAULT_CONFIG_FILE)
                )
            })?;

        settings
            .try_deserialize()
            .context("invalid transcript client configuration")
    }

    pub fn client_options(&self) -> ClientOptions {
        let backoff = match self.reconnect_backoff {
            BackoffKind::Fixed => Backoff::Fixed,
            BackoffKind::Exponential => Backoff::Exponential {
                max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            },
        };
        ClientOptions {
            server_url: self.server_url.clone(),
            channel_path: self.channel_path.clone(),
            audio_path: self.audio_path.clone(),
            reconnect: ReconnectPolicy {
                max_retries: self.reconnect_attempts,
                delay: Duration::from_millis(self.reconnect_delay_ms),
                backoff,
            },
            active_policy: if self.reset_on_active {
                ActivePolicy::ResetTranscript
            } else {
                ActivePolicy::PreserveTranscript
            },
            sender_label: self.sender_label.clone(),
            target_model_path: self.target_model_path.clone(),
        }
    }
}
