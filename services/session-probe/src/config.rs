//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The credential sealing key is loaded from LYO_CREDENTIAL_KEY or key_file,
//! never stored in the TOML directly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use lyo_api::PipelineConfig;
use lyo_stream::{BackoffPolicy, StreamConfig};
use serde::Deserialize;

pub const CREDENTIAL_KEY_ENV: &str = "LYO_CREDENTIAL_KEY";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub credentials: CredentialSettings,
}

#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Full stream URL; derived from `api.base_url` when absent
    pub url: Option<String>,
    pub heartbeat_interval_secs: u64,
    pub missed_pong_threshold: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_delay_secs: u64,
    pub max_reconnect_attempts: u32,
    /// Endpoint polled once the stream has degraded
    pub poll_path: String,
    pub poll_interval_secs: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            url: None,
            heartbeat_interval_secs: 25,
            missed_pong_threshold: 3,
            reconnect_base_ms: 1000,
            reconnect_max_delay_secs: 30,
            max_reconnect_attempts: 5,
            poll_path: "feed".into(),
            poll_interval_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CredentialSettings {
    pub path: PathBuf,
    /// Path to a file containing the sealing key (alternative to LYO_CREDENTIAL_KEY)
    pub key_file: Option<PathBuf>,
    #[serde(skip)]
    pub key: Option<Secret<String>>,
    pub refresh_check_secs: u64,
    /// Refresh proactively when the access token expires within this window
    pub refresh_threshold_secs: u64,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("lyo-credentials.json"),
            key_file: None,
            key: None,
            refresh_check_secs: 60,
            refresh_threshold_secs: 300,
        }
    }
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    60
}

fn non_zero(value: u64, name: &str) -> common::Result<()> {
    if value == 0 {
        return Err(common::Error::Config(format!("{name} must be greater than 0")));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Credential key resolution order:
    /// 1. LYO_CREDENTIAL_KEY env var
    /// 2. key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(key) = std::env::var(CREDENTIAL_KEY_ENV) {
            config.credentials.key = Some(Secret::new(key));
        } else if let Some(ref key_file) = config.credentials.key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.credentials.key = Some(Secret::new(key));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }
        if let Some(url) = &self.stream.url {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(common::Error::Config(format!(
                    "stream url must start with ws:// or wss://, got: {url}"
                )));
            }
        }

        non_zero(self.api.connect_timeout_secs, "connect_timeout_secs")?;
        non_zero(self.api.request_timeout_secs, "request_timeout_secs")?;
        non_zero(self.stream.heartbeat_interval_secs, "heartbeat_interval_secs")?;
        non_zero(self.stream.missed_pong_threshold.into(), "missed_pong_threshold")?;
        non_zero(self.stream.reconnect_base_ms, "reconnect_base_ms")?;
        non_zero(self.stream.poll_interval_secs, "poll_interval_secs")?;
        non_zero(self.credentials.refresh_check_secs, "refresh_check_secs")?;
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("lyo-session-probe.toml")
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            base_url: self.api.base_url.clone(),
            connect_timeout: Duration::from_secs(self.api.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.api.request_timeout_secs),
        }
    }

    pub fn stream(&self) -> StreamConfig {
        StreamConfig {
            heartbeat_interval: Duration::from_secs(self.stream.heartbeat_interval_secs),
            missed_pong_threshold: self.stream.missed_pong_threshold,
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.stream.reconnect_base_ms),
                max_delay: Duration::from_secs(self.stream.reconnect_max_delay_secs),
                max_attempts: self.stream.max_reconnect_attempts,
            },
        }
    }

    pub fn stream_url(&self) -> String {
        self.stream
            .url
            .clone()
            .unwrap_or_else(|| lyo_auth::stream_url(&self.api.base_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("probe.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    const MINIMAL: &str = r#"
[api]
base_url = "https://api.lyo.app"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(CREDENTIAL_KEY_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&write_config(&dir, MINIMAL)).unwrap();

        assert_eq!(config.api.connect_timeout_secs, 30);
        assert_eq!(config.api.request_timeout_secs, 60);
        assert_eq!(config.stream.poll_path, "feed");
        assert!(config.credentials.key.is_none());
        assert_eq!(config.stream_url(), "wss://api.lyo.app/ws");

        let stream = config.stream();
        assert_eq!(stream.heartbeat_interval, Duration::from_secs(25));
        assert_eq!(stream.missed_pong_threshold, 3);
        assert_eq!(stream.backoff, BackoffPolicy::default());
    }

    #[test]
    fn explicit_sections_override_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(CREDENTIAL_KEY_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&write_config(
            &dir,
            r#"
[api]
base_url = "http://localhost:8000"
request_timeout_secs = 10

[stream]
url = "ws://localhost:8000/live"
heartbeat_interval_secs = 5
max_reconnect_attempts = 2
poll_path = "notifications"

[credentials]
path = "/tmp/creds.json"
refresh_threshold_secs = 120
"#,
        ))
        .unwrap();

        assert_eq!(config.pipeline().request_timeout, Duration::from_secs(10));
        assert_eq!(config.stream_url(), "ws://localhost:8000/live");
        assert_eq!(config.stream().backoff.max_attempts, 2);
        assert_eq!(config.stream.poll_path, "notifications");
        assert_eq!(config.credentials.path, PathBuf::from("/tmp/creds.json"));
        assert_eq!(config.credentials.refresh_threshold_secs, 120);
        assert_eq!(config.credentials.refresh_check_secs, 60);
    }

    #[test]
    fn missing_file_and_bad_toml_fail() {
        assert!(Config::load(Path::new("/nonexistent/probe.toml")).is_err());
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(&write_config(&dir, "not valid {{{{ toml")).is_err());
    }

    #[test]
    fn base_url_without_scheme_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&write_config(&dir, "[api]\nbase_url = \"api.lyo.app\"\n"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("base_url must start with http"), "got: {err}");
    }

    #[test]
    fn stream_url_must_be_websocket() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&write_config(
            &dir,
            "[api]\nbase_url = \"https://api.lyo.app\"\n[stream]\nurl = \"https://api.lyo.app/ws\"\n",
        ));
        assert!(result.is_err());
    }

    #[test]
    fn zero_durations_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for section in [
            "[api]\nbase_url = \"https://a.b\"\nrequest_timeout_secs = 0\n",
            "[api]\nbase_url = \"https://a.b\"\n[stream]\nheartbeat_interval_secs = 0\n",
            "[api]\nbase_url = \"https://a.b\"\n[stream]\nmissed_pong_threshold = 0\n",
            "[api]\nbase_url = \"https://a.b\"\n[stream]\npoll_interval_secs = 0\n",
        ] {
            let err = Config::load(&write_config(&dir, section)).unwrap_err().to_string();
            assert!(err.contains("must be greater than 0"), "got: {err}");
        }
    }

    #[test]
    fn key_from_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("key");
        std::fs::write(&key_path, "file-key\n").unwrap();
        let path = write_config(
            &dir,
            &format!(
                "[api]\nbase_url = \"https://api.lyo.app\"\n[credentials]\nkey_file = \"{}\"\n",
                key_path.display()
            ),
        );

        unsafe { remove_env(CREDENTIAL_KEY_ENV) };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.credentials.key.as_ref().unwrap().expose(), "file-key");

        unsafe { set_env(CREDENTIAL_KEY_ENV, "env-key") };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.credentials.key.as_ref().unwrap().expose(), "env-key");
        unsafe { remove_env(CREDENTIAL_KEY_ENV) };
    }

    #[test]
    fn whitespace_key_file_yields_none_and_missing_file_errors() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(CREDENTIAL_KEY_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("key");
        std::fs::write(&key_path, "  \n ").unwrap();
        let path = write_config(
            &dir,
            &format!(
                "[api]\nbase_url = \"https://api.lyo.app\"\n[credentials]\nkey_file = \"{}\"\n",
                key_path.display()
            ),
        );
        assert!(Config::load(&path).unwrap().credentials.key.is_none());

        let path = write_config(
            &dir,
            "[api]\nbase_url = \"https://api.lyo.app\"\n[credentials]\nkey_file = \"/nonexistent/key\"\n",
        );
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn resolve_path_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("lyo-session-probe.toml"));

        unsafe { set_env("CONFIG_PATH", "/env/probe.toml") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("/env/probe.toml"));
        assert_eq!(
            Config::resolve_path(Some("/cli/wins.toml")),
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }
}
