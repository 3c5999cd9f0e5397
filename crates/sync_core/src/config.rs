use std::{collections::HashMap, fs, path::Path, time::Duration};

use tracing::warn;
use url::Url;

use crate::{error::TransportError, reconcile::DEFAULT_DEFER_WINDOW};

pub const SETTINGS_FILE: &str = "sync.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub server_url: String,
    pub ws_path: String,
    pub defer_window: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub fetch_limit: u32,
    pub event_buffer: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            ws_path: "/ws".into(),
            defer_window: DEFAULT_DEFER_WINDOW,
            reconnect_initial: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(30),
            fetch_limit: 50,
            event_buffer: 1024,
        }
    }
}

impl SyncSettings {
    /// Websocket endpoint derived from the HTTP server url.
    pub fn ws_url(&self) -> Result<Url, TransportError> {
        let server_url = self.server_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(TransportError::InvalidUrl(format!(
                "server_url must start with http:// or https://: {server_url}"
            )));
        };
        let path = self.ws_path.trim_start_matches('/');
        Url::parse(&format!("{ws_base}/{path}"))
            .map_err(|err| TransportError::InvalidUrl(err.to_string()))
    }

    pub fn api_url(&self) -> Result<Url, TransportError> {
        Url::parse(&self.server_url).map_err(|err| TransportError::InvalidUrl(err.to_string()))
    }
}

pub fn load_settings() -> SyncSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// File values first, then environment overrides. Unparseable values keep
/// the previous setting.
pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> SyncSettings {
    let mut settings = SyncSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(file_cfg) => apply(&mut settings, |key| file_cfg.get(key).cloned()),
            Err(err) => warn!(path = %path.display(), error = %err, "config: ignoring unreadable settings file"),
        }
    }

    if let Some(v) = env("SYNC_SERVER_URL") {
        settings.server_url = v;
    }
    apply(&mut settings, |key| env(&format!("APP__{}", key.to_uppercase())));

    settings
}

fn apply(settings: &mut SyncSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("server_url") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("ws_path") {
        settings.ws_path = v;
    }
    if let Some(ms) = lookup("defer_window_ms").and_then(|v| v.parse::<u64>().ok()) {
        settings.defer_window = Duration::from_millis(ms);
    }
    if let Some(ms) = lookup("reconnect_initial_ms").and_then(|v| v.parse::<u64>().ok()) {
        settings.reconnect_initial = Duration::from_millis(ms);
    }
    if let Some(ms) = lookup("reconnect_max_ms").and_then(|v| v.parse::<u64>().ok()) {
        settings.reconnect_max = Duration::from_millis(ms);
    }
    if let Some(limit) = lookup("fetch_limit").and_then(|v| v.parse::<u32>().ok()) {
        settings.fetch_limit = limit.clamp(1, 100);
    }
    if let Some(buffer) = lookup("event_buffer").and_then(|v| v.parse::<usize>().ok()) {
        settings.event_buffer = buffer.max(1);
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
