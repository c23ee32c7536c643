// Client configuration.
//
// Global config: `~/.taskdeck/config.toml`
// Backend URL: runtime override → `TASKDECK_BACKEND_URL` → `http://localhost:8080`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use taskdeck_common::protocol::envelope::WS_PATH;

use crate::connection::{HeartbeatConfig, ReconnectPolicy};
use crate::store::SliceKey;

pub const BACKEND_URL_ENV: &str = "TASKDECK_BACKEND_URL";
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8080";

/// Root directory for taskdeck client state: `~/.taskdeck/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".taskdeck"))
}

/// Path to the global config file: `~/.taskdeck/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

// ── Client config ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend base URL (e.g. `https://deck.example.com`). Takes precedence
    /// over the environment when set.
    pub backend_url: Option<String>,
    /// Workspace selected at startup.
    pub workspace_id: Option<String>,
    pub request_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
    pub hydration: HydrationConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_url: None,
            workspace_id: None,
            request_timeout_ms: 15_000,
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 10_000,
            reconnect: ReconnectConfig::default(),
            hydration: HydrationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Give up after this many consecutive failures. Unset retries forever.
    pub max_attempts: Option<u32>,
    /// A link must stay up this long before the backoff starts over.
    pub stable_after_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { base_delay_ms: 250, max_delay_ms: 30_000, max_attempts: None, stable_after_ms: 5_000 }
    }
}

/// Per-slice HTTP routes used to fetch hydration snapshots, relative to the
/// backend URL. `{workspace_id}` and `{workflow_id}` are substituted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HydrationConfig {
    pub routes: BTreeMap<String, String>,
}

impl Default for HydrationConfig {
    fn default() -> Self {
        let routes = [
            (SliceKey::Workflows, "/api/v1/workspaces/{workspace_id}/workflows"),
            (SliceKey::Kanban, "/api/v1/workflows/{workflow_id}/board"),
            (SliceKey::Executors, "/api/v1/executors"),
            (SliceKey::Secrets, "/api/v1/secrets"),
            (SliceKey::Settings, "/api/v1/user/settings"),
        ];
        Self {
            routes: routes
                .into_iter()
                .map(|(key, route)| (key.as_str().to_string(), route.to_string()))
                .collect(),
        }
    }
}

impl HydrationConfig {
    pub fn route(&self, key: SliceKey) -> Option<&str> {
        self.routes.get(key.as_str()).map(String::as_str)
    }
}

impl ClientConfig {
    /// Load from `~/.taskdeck/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Effective backend base URL.
    pub fn backend_url(&self) -> String {
        resolve_backend_url(self.backend_url.as_deref(), std::env::var(BACKEND_URL_ENV).ok())
    }

    /// Validated backend base URL.
    pub fn backend(&self) -> Result<Url, ConfigError> {
        parse_backend_url(&self.backend_url())
    }

    /// WebSocket endpoint derived from the backend URL.
    pub fn ws_url(&self) -> Result<Url, ConfigError> {
        ws_url_for(&self.backend_url())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(self.heartbeat_interval_ms),
            timeout: Duration::from_millis(self.heartbeat_timeout_ms),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            max_attempts: self.reconnect.max_attempts.unwrap_or(u32::MAX),
            stable_after: Duration::from_millis(self.reconnect.stable_after_ms),
        }
    }
}

// ── URL resolution ─────────────────────────────────────────────────

/// Pick the backend URL: explicit override, then environment, then the
/// local default. Blank values are skipped.
pub fn resolve_backend_url(override_url: Option<&str>, env_url: Option<String>) -> String {
    override_url
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| env_url.map(|value| value.trim().to_string()).filter(|value| !value.is_empty()))
        .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string())
}

/// Parse an `http(s)` backend URL with a host.
pub fn parse_backend_url(value: &str) -> Result<Url, ConfigError> {
    let parsed = Url::parse(value)
        .map_err(|error| ConfigError::InvalidUrl { url: value.to_string(), reason: error.to_string() })?;
    if !matches!(parsed.scheme(), "http" | "https" | "ws" | "wss") {
        return Err(ConfigError::InvalidUrl {
            url: value.to_string(),
            reason: format!("unsupported scheme `{}`", parsed.scheme()),
        });
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidUrl { url: value.to_string(), reason: "missing host".into() });
    }
    Ok(parsed)
}

/// Derive the sync socket URL: `http → ws`, `https → wss`, then `/ws` is
/// appended to the base path. A URL already pointing at the socket is kept.
pub fn ws_url_for(backend: &str) -> Result<Url, ConfigError> {
    let mut url = parse_backend_url(backend)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        _ => "wss",
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(ConfigError::InvalidUrl {
            url: backend.to_string(),
            reason: format!("cannot switch scheme to `{scheme}`"),
        });
    }

    let base = url.path().trim_end_matches('/').to_string();
    if !base.ends_with(WS_PATH) {
        url.set_path(&format!("{base}{WS_PATH}"));
    }
    url.set_fragment(None);
    Ok(url)
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid backend url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn client_config_defaults() {
        let cfg = ClientConfig::default();
        assert!(cfg.backend_url.is_none());
        assert_eq!(cfg.request_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.heartbeat().interval, Duration::from_secs(15));
        assert_eq!(cfg.heartbeat().timeout, Duration::from_secs(10));
        let policy = cfg.reconnect_policy();
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.max_attempts, u32::MAX);
        assert_eq!(policy.stable_after, Duration::from_secs(5));
        assert_eq!(cfg.hydration.route(SliceKey::Executors), Some("/api/v1/executors"));
    }

    #[test]
    fn client_config_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut cfg = ClientConfig {
            backend_url: Some("https://deck.example.com".into()),
            workspace_id: Some("ws-1".into()),
            request_timeout_ms: 5_000,
            ..ClientConfig::default()
        };
        cfg.reconnect.max_attempts = Some(3);
        cfg.save_to(&path).unwrap();
        let loaded = ClientConfig::load_from(&path).unwrap();
        assert_eq!(cfg, loaded);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let toml_str = r#"
backend_url = "http://10.0.0.5:9000"

[reconnect]
max_delay_ms = 5000

[hydration.routes]
executors = "/custom/executors"
"#;
        let cfg: ClientConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.backend_url.as_deref(), Some("http://10.0.0.5:9000"));
        assert_eq!(cfg.reconnect.base_delay_ms, 250);
        assert_eq!(cfg.reconnect.max_delay_ms, 5_000);
        assert_eq!(cfg.request_timeout_ms, 15_000);
        assert_eq!(cfg.hydration.route(SliceKey::Executors), Some("/custom/executors"));
        assert_eq!(cfg.hydration.route(SliceKey::Secrets), None);
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = ClientConfig::load_from(&dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn backend_url_precedence() {
        assert_eq!(
            resolve_backend_url(Some("https://override.test"), Some("https://env.test".into())),
            "https://override.test"
        );
        assert_eq!(resolve_backend_url(None, Some("https://env.test".into())), "https://env.test");
        assert_eq!(resolve_backend_url(Some("  "), Some(String::new())), DEFAULT_BACKEND_URL);
        assert_eq!(resolve_backend_url(None, None), DEFAULT_BACKEND_URL);
    }

    #[test]
    fn ws_url_substitutes_scheme_and_appends_path() {
        assert_eq!(ws_url_for("http://localhost:8080").unwrap().as_str(), "ws://localhost:8080/ws");
        assert_eq!(
            ws_url_for("https://deck.example.com/base/").unwrap().as_str(),
            "wss://deck.example.com/base/ws"
        );
        assert_eq!(ws_url_for("wss://deck.example.com/ws").unwrap().as_str(), "wss://deck.example.com/ws");
    }

    #[test]
    fn malformed_backend_url_is_a_config_error() {
        for bad in ["not a url", "ftp://deck.example.com", "http://"] {
            let error = ws_url_for(bad).expect_err("url should be rejected");
            assert!(matches!(error, ConfigError::InvalidUrl { .. }), "{bad}: {error}");
        }
    }
}
