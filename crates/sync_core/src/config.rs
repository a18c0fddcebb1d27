use std::{fs, path::Path, str::FromStr, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use url::Url;

use crate::error::SyncError;

const ENV_PREFIX: &str = "DMSYNC__";

/// Behaviour of `emit` while the live channel is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflinePolicy {
    /// Fail immediately with `SyncError::Disconnected`.
    Reject,
    /// Hold the request and write it once the channel is back, unless the
    /// caller stopped waiting in the meantime.
    Queue,
}

impl FromStr for OfflinePolicy {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "queue" => Ok(Self::Queue),
            other => Err(SyncError::Config(format!("unknown offline policy `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub ws_url: Option<String>,
    pub connect_timeout_ms: u64,
    pub join_timeout_ms: u64,
    pub history_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub upload_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: Option<u32>,
    pub offline_policy: OfflinePolicy,
    pub upload_concurrency: usize,
    pub preview_chars: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            ws_url: None,
            connect_timeout_ms: 10_000,
            join_timeout_ms: 3_000,
            history_timeout_ms: 10_000,
            ack_timeout_ms: 10_000,
            upload_timeout_ms: 60_000,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: None,
            offline_policy: OfflinePolicy::Reject,
            upload_concurrency: 3,
            preview_chars: 80,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    server_url: Option<String>,
    ws_url: Option<String>,
    connect_timeout_ms: Option<u64>,
    join_timeout_ms: Option<u64>,
    history_timeout_ms: Option<u64>,
    ack_timeout_ms: Option<u64>,
    upload_timeout_ms: Option<u64>,
    reconnect_base_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    offline_policy: Option<OfflinePolicy>,
    upload_concurrency: Option<usize>,
    preview_chars: Option<usize>,
}

/// Defaults, then the optional TOML file, then `DMSYNC__*` environment variables.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<ClientSettings> {
    let mut settings = ClientSettings::default();

    if let Some(path) = path {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
        apply_toml(&mut settings, &raw)
            .with_context(|| format!("failed to parse settings file '{}'", path.display()))?;
    }

    apply_env(&mut settings, |key| std::env::var(key).ok())?;
    settings.validate()?;
    Ok(settings)
}

fn apply_toml(settings: &mut ClientSettings, raw: &str) -> anyhow::Result<()> {
    let file_cfg: FileSettings = toml::from_str(raw)?;

    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.ws_url {
        settings.ws_url = Some(v);
    }
    if let Some(v) = file_cfg.connect_timeout_ms {
        settings.connect_timeout_ms = v;
    }
    if let Some(v) = file_cfg.join_timeout_ms {
        settings.join_timeout_ms = v;
    }
    if let Some(v) = file_cfg.history_timeout_ms {
        settings.history_timeout_ms = v;
    }
    if let Some(v) = file_cfg.ack_timeout_ms {
        settings.ack_timeout_ms = v;
    }
    if let Some(v) = file_cfg.upload_timeout_ms {
        settings.upload_timeout_ms = v;
    }
    if let Some(v) = file_cfg.reconnect_base_delay_ms {
        settings.reconnect_base_delay_ms = v;
    }
    if let Some(v) = file_cfg.reconnect_max_delay_ms {
        settings.reconnect_max_delay_ms = v;
    }
    if file_cfg.max_reconnect_attempts.is_some() {
        settings.max_reconnect_attempts = file_cfg.max_reconnect_attempts;
    }
    if let Some(v) = file_cfg.offline_policy {
        settings.offline_policy = v;
    }
    if let Some(v) = file_cfg.upload_concurrency {
        settings.upload_concurrency = v;
    }
    if let Some(v) = file_cfg.preview_chars {
        settings.preview_chars = v;
    }
    Ok(())
}

fn apply_env(
    settings: &mut ClientSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

    if let Some(v) = var("SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("WS_URL") {
        settings.ws_url = Some(v);
    }
    if let Some(v) = var("CONNECT_TIMEOUT_MS") {
        settings.connect_timeout_ms = parse_env("CONNECT_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = var("JOIN_TIMEOUT_MS") {
        settings.join_timeout_ms = parse_env("JOIN_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = var("HISTORY_TIMEOUT_MS") {
        settings.history_timeout_ms = parse_env("HISTORY_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = var("ACK_TIMEOUT_MS") {
        settings.ack_timeout_ms = parse_env("ACK_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = var("UPLOAD_TIMEOUT_MS") {
        settings.upload_timeout_ms = parse_env("UPLOAD_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = var("RECONNECT_BASE_DELAY_MS") {
        settings.reconnect_base_delay_ms = parse_env("RECONNECT_BASE_DELAY_MS", &v)?;
    }
    if let Some(v) = var("RECONNECT_MAX_DELAY_MS") {
        settings.reconnect_max_delay_ms = parse_env("RECONNECT_MAX_DELAY_MS", &v)?;
    }
    if let Some(v) = var("MAX_RECONNECT_ATTEMPTS") {
        settings.max_reconnect_attempts = Some(parse_env("MAX_RECONNECT_ATTEMPTS", &v)?);
    }
    if let Some(v) = var("OFFLINE_POLICY") {
        settings.offline_policy = v.parse()?;
    }
    if let Some(v) = var("UPLOAD_CONCURRENCY") {
        settings.upload_concurrency = parse_env("UPLOAD_CONCURRENCY", &v)?;
    }
    if let Some(v) = var("PREVIEW_CHARS") {
        settings.preview_chars = parse_env("PREVIEW_CHARS", &v)?;
    }
    Ok(())
}

fn parse_env<T>(name: &str, raw: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("invalid value for {ENV_PREFIX}{name}: `{raw}`"))
}

impl ClientSettings {
    pub fn validate(&self) -> Result<(), SyncError> {
        self.http_base_url()?;
        self.live_url()?;
        let timeouts = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("join_timeout_ms", self.join_timeout_ms),
            ("history_timeout_ms", self.history_timeout_ms),
            ("ack_timeout_ms", self.ack_timeout_ms),
            ("upload_timeout_ms", self.upload_timeout_ms),
            ("reconnect_max_delay_ms", self.reconnect_max_delay_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(SyncError::Config(format!("{name} must be greater than zero")));
        }
        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(SyncError::Config(
                "reconnect_base_delay_ms must not exceed reconnect_max_delay_ms".into(),
            ));
        }
        if self.upload_concurrency == 0 {
            return Err(SyncError::Config("upload_concurrency must be at least 1".into()));
        }
        Ok(())
    }

    /// Base for the request/response endpoints; always ends with `/` so that
    /// relative joins keep any path prefix.
    pub fn http_base_url(&self) -> Result<Url, SyncError> {
        let raw = self.server_url.trim();
        if !(raw.starts_with("http://") || raw.starts_with("https://")) {
            return Err(SyncError::Config(
                "server_url must start with http:// or https://".into(),
            ));
        }
        let with_slash = if raw.ends_with('/') {
            raw.to_string()
        } else {
            format!("{raw}/")
        };
        Url::parse(&with_slash).map_err(|e| SyncError::Config(format!("invalid server_url: {e}")))
    }

    pub fn live_url(&self) -> Result<Url, SyncError> {
        if let Some(ws_url) = &self.ws_url {
            let url = Url::parse(ws_url.trim())
                .map_err(|e| SyncError::Config(format!("invalid ws_url: {e}")))?;
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(SyncError::Config("ws_url must use ws:// or wss://".into()));
            }
            return Ok(url);
        }

        let raw = self.server_url.trim().trim_end_matches('/');
        let ws_url = if raw.starts_with("https://") {
            raw.replacen("https://", "wss://", 1)
        } else if raw.starts_with("http://") {
            raw.replacen("http://", "ws://", 1)
        } else {
            return Err(SyncError::Config(
                "server_url must start with http:// or https://".into(),
            ));
        };
        Url::parse(&format!("{ws_url}/ws"))
            .map_err(|e| SyncError::Config(format!("invalid server_url: {e}")))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn history_timeout(&self) -> Duration {
        Duration::from_millis(self.history_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }
}
