use std::{
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use thiserror::Error;
use tracing::warn;

use crate::{
    commands::CommandOptions,
    connection::{BackoffPolicy, ReconnectConfig},
};

pub const DEFAULT_SETTINGS_FILE: &str = "chat_sync.toml";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse settings file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!("unknown backoff policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub remote_url: String,
    /// Push channel endpoint; derived from `remote_url` when unset.
    pub push_url: Option<String>,
    pub access_token: Option<String>,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff: BackoffKind,
    pub reconnect_max_delay_ms: u64,
    pub max_attachment_bytes: u64,
    pub page_size: u32,
    /// Zero disables the bound.
    pub cache_max_rooms: usize,
    pub typing_ttl_ms: u64,
    pub cleanup_on_attachment_failure: bool,
    pub request_timeout_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            remote_url: "http://127.0.0.1:8443".into(),
            push_url: None,
            access_token: None,
            reconnect_delay_ms: 10_000,
            max_reconnect_attempts: 3,
            reconnect_backoff: BackoffKind::Fixed,
            reconnect_max_delay_ms: 60_000,
            max_attachment_bytes: 10 * 1024 * 1024,
            page_size: 50,
            cache_max_rooms: 64,
            typing_ttl_ms: 5_000,
            cleanup_on_attachment_failure: false,
            request_timeout_ms: 30_000,
        }
    }
}

impl SyncSettings {
    pub fn push_url(&self) -> String {
        self.push_url
            .clone()
            .unwrap_or_else(|| format!("{}/realtime", self.remote_url.trim_end_matches('/')))
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        let delay = Duration::from_millis(self.reconnect_delay_ms);
        let backoff = match self.reconnect_backoff {
            BackoffKind::Fixed => BackoffPolicy::Fixed { delay },
            BackoffKind::Exponential => BackoffPolicy::Exponential {
                base: delay,
                max: Duration::from_millis(self.reconnect_max_delay_ms),
            },
        };
        ReconnectConfig {
            backoff,
            max_attempts: self.max_reconnect_attempts.max(1),
        }
    }

    pub fn command_options(&self) -> CommandOptions {
        CommandOptions {
            max_attachment_bytes: self.max_attachment_bytes,
            page_size: self.page_size.max(1),
            cleanup_on_attachment_failure: self.cleanup_on_attachment_failure,
            ..CommandOptions::default()
        }
    }

    pub fn cache_bound(&self) -> Option<usize> {
        (self.cache_max_rooms > 0).then_some(self.cache_max_rooms)
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.typing_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn apply(&mut self, key: &str, raw: &str, source: &str) {
        match key {
            "remote_url" => self.remote_url = raw.to_string(),
            "push_url" => self.push_url = non_empty(raw),
            "access_token" => self.access_token = non_empty(raw),
            "reconnect_delay_ms" => set_parsed(&mut self.reconnect_delay_ms, key, raw, source),
            "max_reconnect_attempts" => {
                set_parsed(&mut self.max_reconnect_attempts, key, raw, source)
            }
            "reconnect_backoff" => set_parsed(&mut self.reconnect_backoff, key, raw, source),
            "reconnect_max_delay_ms" => {
                set_parsed(&mut self.reconnect_max_delay_ms, key, raw, source)
            }
            "max_attachment_bytes" => set_parsed(&mut self.max_attachment_bytes, key, raw, source),
            "page_size" => set_parsed(&mut self.page_size, key, raw, source),
            "cache_max_rooms" => set_parsed(&mut self.cache_max_rooms, key, raw, source),
            "typing_ttl_ms" => set_parsed(&mut self.typing_ttl_ms, key, raw, source),
            "cleanup_on_attachment_failure" => {
                set_parsed(&mut self.cleanup_on_attachment_failure, key, raw, source)
            }
            "request_timeout_ms" => set_parsed(&mut self.request_timeout_ms, key, raw, source),
            _ => warn!(key, source, "ignoring unknown setting"),
        }
    }
}

const KEYS: &[&str] = &[
    "remote_url",
    "push_url",
    "access_token",
    "reconnect_delay_ms",
    "max_reconnect_attempts",
    "reconnect_backoff",
    "reconnect_max_delay_ms",
    "max_attachment_bytes",
    "page_size",
    "cache_max_rooms",
    "typing_ttl_ms",
    "cleanup_on_attachment_failure",
    "request_timeout_ms",
];

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn set_parsed<T>(slot: &mut T, key: &str, raw: &str, source: &str)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(err) => warn!(key, source, value = raw, %err, "ignoring invalid setting"),
    }
}

/// Reads `chat_sync.toml` from the working directory when present, then
/// applies `CHAT_SYNC_*` and `APP__*` environment overrides.
pub fn load_settings() -> SyncSettings {
    let mut settings = match load_settings_from(DEFAULT_SETTINGS_FILE) {
        Ok(settings) => settings,
        Err(err) => {
            warn!(%err, "falling back to default settings");
            SyncSettings::default()
        }
    };
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    settings
}

pub fn load_settings_from(path: impl AsRef<Path>) -> Result<SyncSettings, SettingsError> {
    let path = path.as_ref();
    let mut settings = SyncSettings::default();
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(settings),
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let table = toml::from_str::<toml::Table>(&raw).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    for (key, value) in &table {
        let raw = match value {
            toml::Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        settings.apply(key, &raw, "file");
    }
    Ok(settings)
}

/// `CHAT_SYNC_<KEY>` first, then `APP__<KEY>` which wins when both are set.
pub fn apply_env_overrides<F>(settings: &mut SyncSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    for key in KEYS {
        let upper = key.to_ascii_uppercase();
        for name in [format!("CHAT_SYNC_{upper}"), format!("APP__{upper}")] {
            if let Some(value) = lookup(&name) {
                settings.apply(key, &value, "env");
            }
        }
    }
}
