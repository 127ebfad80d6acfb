use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_HOST_OBJECT: &str = "NativeOverlayBridge";
const DEFAULT_RUNTIME_GLOBAL: &str = "__nativeOverlay";
const DEFAULT_PLATFORM: &str = "android";
const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
const DEFAULT_NAVIGATION_EVENTS: &[&str] = &[
    "yt-navigation-finish",
    "yt-navigate-finish",
    "yt-page-data-updated",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read bridge config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{field} must be a JavaScript identifier, got {value:?}")]
    InvalidIdentifier { field: &'static str, value: String },
    #[error("navigation event names must be non-empty")]
    EmptyEventName,
}

/// Settings shared by the host bridge and the scripts it injects.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Name of the host interface the page posts to (`window.<host_object>`).
    pub host_object: String,
    /// Global the injected runtime installs itself under.
    pub runtime_global: String,
    /// Value reported by `Capacitor.getPlatform()` inside the page.
    pub platform: String,
    /// Location polling fallback; `0` disables polling.
    pub poll_interval_ms: u64,
    /// Page events that signal single-page-app navigation.
    pub custom_navigation_events: Vec<String>,
    /// Forward bridge diagnostics to the host app as `OverlayEvent::Debug`.
    pub debug_events: bool,
    /// Per-request timeout enforced inside the page; unset means no timeout.
    pub request_timeout_ms: Option<u64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host_object: DEFAULT_HOST_OBJECT.into(),
            runtime_global: DEFAULT_RUNTIME_GLOBAL.into(),
            platform: DEFAULT_PLATFORM.into(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            custom_navigation_events: DEFAULT_NAVIGATION_EVENTS
                .iter()
                .map(|event| event.to_string())
                .collect(),
            debug_events: false,
            request_timeout_ms: None,
        }
    }
}

impl BridgeConfig {
    /// Load from `config_path`; a missing path or file yields the defaults.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = match config_path {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// `bridge.yaml` in the per-user configuration directory.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "Subtit", "OverlayBridge")
            .map(|dirs| dirs.config_dir().join("bridge.yaml"))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_identifier("host_object", &self.host_object)?;
        ensure_identifier("runtime_global", &self.runtime_global)?;
        if self
            .custom_navigation_events
            .iter()
            .any(|event| event.trim().is_empty())
        {
            return Err(ConfigError::EmptyEventName);
        }
        Ok(())
    }
}

// Both names are spliced into scripts as `window.<name>`.
fn ensure_identifier(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let mut chars = value.chars();
    let valid_start = chars
        .next()
        .map(|c| c == '_' || c == '$' || c.is_ascii_alphabetic())
        .unwrap_or(false);
    if valid_start && chars.all(|c| c == '_' || c == '$' || c.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier {
            field,
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_default() {
        let config = BridgeConfig::load(None).unwrap();
        assert_eq!(config.host_object, "NativeOverlayBridge");
        assert_eq!(config.poll_interval_ms, 2_000);
        assert_eq!(config.custom_navigation_events.len(), 3);
        assert!(config.request_timeout().is_none());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config =
            BridgeConfig::load(Some(PathBuf::from("/nonexistent/overlay/bridge.yaml"))).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn loads_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "platform: ios\npoll_interval_ms: 500\nrequest_timeout_ms: 1500\ncustom_navigation_events:\n  - turbo:load"
        )
        .unwrap();
        let config = BridgeConfig::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.platform, "ios");
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.custom_navigation_events, vec!["turbo:load"]);
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.runtime_global, "__nativeOverlay");
    }

    #[test]
    fn rejects_non_identifier_globals() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "runtime_global: \"bad-name\"").unwrap();
        let err = BridgeConfig::load(Some(file.path().to_path_buf())).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidIdentifier { field: "runtime_global", .. }
        ));
    }

    #[test]
    fn rejects_unknown_keys() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "relays: []").unwrap();
        assert!(matches!(
            BridgeConfig::load(Some(file.path().to_path_buf())),
            Err(ConfigError::Yaml(_))
        ));
    }
}
