//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables, sections split by a double underscore:
//!    `APP_DISPATCH__MAX_CONCURRENCY=8`, `APP_BACKEND__KIND=remote`
//! 3. Configuration file (config.toml)
//! 4. Default values (the `Default` impl)
//!
//! ## Live values:
//! At runtime the config lives in one `SharedConfig`. The fetcher, the
//! normalizer, the correlator and the handlers read it per request, so a
//! successful `PUT /api/v1/config` takes effect for the next request.

use crate::audio::DownmixStrategy;
use crate::transcription::model::ModelSize;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// The configuration every component reads at request time.
pub type SharedConfig = Arc<RwLock<AppConfig>>;

/// Read a value from the live configuration without holding the lock.
pub fn read_live<T>(config: &SharedConfig, f: impl FnOnce(&AppConfig) -> T) -> T {
    f(&config.read().unwrap_or_else(PoisonError::into_inner))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub dispatch: DispatchConfig,
    pub cache: CacheConfig,
    pub audio: AudioConfig,
}

/// Where the HTTP API listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Which transcription backend to build, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process Whisper model behind the context boundary
    Isolated,
    /// Remote inference service over HTTP
    Remote,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Isolated => write!(f, "isolated"),
            BackendKind::Remote => write!(f, "remote"),
        }
    }
}

/// Backend settings.
///
/// ## Fields:
/// - `whisper_model` / `device`: only used by the isolated backend
/// - `remote_url` / `remote_api_name`: only used by the remote backend
/// - `host_backlog`: requests the model host queues behind the running one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub whisper_model: ModelSize,
    pub device: String,
    pub remote_url: Option<String>,
    pub remote_api_name: String,
    pub host_backlog: usize,
}

/// Queue and deadline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Workers per batch when the caller does not ask for a number
    pub default_concurrency: usize,
    /// Upper clamp for requested concurrency
    pub max_concurrency: usize,
    /// Per-request deadline for the correlator and the single-shot API
    pub request_timeout_secs: u64,
    pub ready_poll_interval_ms: u64,
    pub ready_max_cycles: u32,
}

impl DispatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    /// Clamp a requested worker count to `[1, max_concurrency]`.
    pub fn clamp_concurrency(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_concurrency)
            .clamp(1, self.max_concurrency.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Persist to disk; otherwise the cache lives only in memory
    pub enabled: bool,
    pub data_dir: PathBuf,
    /// File name (without extension) of the durable mapping
    pub storage_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub downmix: DownmixStrategy,
    pub fetch_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            backend: BackendConfig {
                kind: BackendKind::Isolated,
                whisper_model: ModelSize::Tiny,
                device: "auto".to_string(),
                remote_url: None,
                remote_api_name: "predict".to_string(),
                host_backlog: 16,
            },
            dispatch: DispatchConfig {
                default_concurrency: 3,
                max_concurrency: 5,
                request_timeout_secs: 300,
                ready_poll_interval_ms: 500,
                ready_max_cycles: 10,
            },
            cache: CacheConfig {
                enabled: true,
                data_dir: PathBuf::from("data"),
                storage_key: "transcriptions".to_string(),
            },
            audio: AudioConfig {
                downmix: DownmixStrategy::Average,
                fetch_timeout_secs: 60,
            },
        }
    }
}

impl AppConfig {
    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }

    /// Load configuration from defaults, config.toml and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_BACKEND__KIND=remote` plus `APP_BACKEND__REMOTE_URL=https://...`
    /// - `APP_AUDIO__DOWNMIX=scaled_sum`: Switch the down-mix strategy
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config: AppConfig = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Check that the values make sense together.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let dispatch = &self.dispatch;
        if dispatch.default_concurrency == 0 || dispatch.max_concurrency == 0 {
            return Err(anyhow::anyhow!("Concurrency must be at least 1"));
        }
        if dispatch.default_concurrency > dispatch.max_concurrency {
            return Err(anyhow::anyhow!(
                "Default concurrency {} exceeds max concurrency {}",
                dispatch.default_concurrency,
                dispatch.max_concurrency
            ));
        }
        if dispatch.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Request timeout must be greater than 0"));
        }
        if dispatch.ready_poll_interval_ms == 0 || dispatch.ready_max_cycles == 0 {
            return Err(anyhow::anyhow!("Readiness polling needs a non-zero interval and cycle count"));
        }

        if self.audio.fetch_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Audio fetch timeout must be greater than 0"));
        }

        if self.backend.kind == BackendKind::Remote
            && self.backend.remote_url.as_deref().map_or(true, |u| u.trim().is_empty())
        {
            return Err(anyhow::anyhow!("Remote backend requires backend.remote_url"));
        }

        if self.cache.storage_key.trim().is_empty() {
            return Err(anyhow::anyhow!("Cache storage key cannot be empty"));
        }

        Ok(())
    }

    /// Apply a partial update from JSON.
    ///
    /// Only the `dispatch` and `audio` sections can change at runtime; the
    /// server address, backend and cache location are fixed at startup and
    /// an update that touches them is rejected as a whole.
    /// For example `{"dispatch": {"default_concurrency": 4}}`.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        let fixed: Vec<&str> = ["server", "backend", "cache"]
            .into_iter()
            .filter(|section| partial_config.get(section).is_some())
            .collect();
        if !fixed.is_empty() {
            return Err(anyhow::anyhow!(
                "Sections {} are fixed at startup and cannot be updated at runtime",
                fixed.join(", ")
            ));
        }

        let mut updated = self.clone();

        if let Some(dispatch) = partial_config.get("dispatch") {
            if let Some(n) = dispatch.get("default_concurrency").and_then(|v| v.as_u64()) {
                updated.dispatch.default_concurrency = n as usize;
            }
            if let Some(n) = dispatch.get("max_concurrency").and_then(|v| v.as_u64()) {
                updated.dispatch.max_concurrency = n as usize;
            }
            if let Some(secs) = dispatch.get("request_timeout_secs").and_then(|v| v.as_u64()) {
                updated.dispatch.request_timeout_secs = secs;
            }
            if let Some(ms) = dispatch.get("ready_poll_interval_ms").and_then(|v| v.as_u64()) {
                updated.dispatch.ready_poll_interval_ms = ms;
            }
            if let Some(cycles) = dispatch.get("ready_max_cycles").and_then(|v| v.as_u64()) {
                updated.dispatch.ready_max_cycles = u32::try_from(cycles)?;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(strategy) = audio.get("downmix").and_then(|v| v.as_str()) {
                updated.audio.downmix = strategy.parse()?;
            }
            if let Some(secs) = audio.get("fetch_timeout_secs").and_then(|v| v.as_u64()) {
                updated.audio.fetch_timeout_secs = secs;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.backend.kind, BackendKind::Isolated);
        assert_eq!(config.backend.whisper_model, ModelSize::Tiny);
        assert_eq!(config.dispatch.default_concurrency, 3);
        assert_eq!(config.dispatch.max_concurrency, 5);
        assert_eq!(config.dispatch.request_timeout(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.dispatch.default_concurrency = 9;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.backend.kind = BackendKind::Remote;
        assert!(config.validate().is_err());
        config.backend.remote_url = Some("http://localhost:7860".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_concurrency_clamp() {
        let dispatch = AppConfig::default().dispatch;
        assert_eq!(dispatch.clamp_concurrency(None), 3);
        assert_eq!(dispatch.clamp_concurrency(Some(0)), 1);
        assert_eq!(dispatch.clamp_concurrency(Some(50)), 5);
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"dispatch": {"default_concurrency": 4}, "audio": {"downmix": "scaled_sum"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.dispatch.default_concurrency, 4);
        assert_eq!(config.audio.downmix, DownmixStrategy::ScaledSum);
        assert_eq!(config.dispatch.max_concurrency, 5);
    }

    #[test]
    fn test_invalid_update_leaves_config_untouched() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"dispatch": {"default_concurrency": 0}}"#).is_err());
        assert!(config.update_from_json(r#"{"audio": {"downmix": "loudest"}}"#).is_err());
        assert_eq!(config.dispatch.default_concurrency, 3);
        assert_eq!(config.audio.downmix, DownmixStrategy::Average);
    }

    #[test]
    fn test_startup_sections_are_rejected() {
        let mut config = AppConfig::default();
        let json = r#"{"dispatch": {"default_concurrency": 4}, "backend": {"kind": "remote"}}"#;
        let err = config.update_from_json(json).unwrap_err();
        assert!(err.to_string().contains("backend"));
        // Nothing applied, not even the valid part
        assert_eq!(config.dispatch.default_concurrency, 3);
    }

    #[test]
    fn test_shared_config_reads_latest() {
        let shared = AppConfig::default().into_shared();
        shared
            .write()
            .unwrap()
            .update_from_json(r#"{"dispatch": {"request_timeout_secs": 42}}"#)
            .unwrap();
        assert_eq!(read_live(&shared, |c| c.dispatch.request_timeout()), Duration::from_secs(42));
    }
}
