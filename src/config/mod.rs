//! Bridge configuration.
//!
//! Every field has a default so a partial JSON document (or `{}`) is a valid
//! configuration. Values are validated once, when the bridge is built.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::challenges::core::PollSettings;
use crate::challenges::engines::EngineKind;
use crate::modules::spoofing::FingerprintProvider;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Which challenge engine a bridge uses for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    #[default]
    Auto,
    DevTools,
    WebDriver,
}

impl EngineMode {
    /// `Auto` always resolves to the DevTools engine.
    pub fn resolve(self) -> EngineKind {
        match self {
            EngineMode::Auto | EngineMode::DevTools => EngineKind::DevTools,
            EngineMode::WebDriver => EngineKind::WebDriver,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudBridgeConfig {
    pub engine: EngineMode,
    pub headless: bool,
    pub fingerprint: Option<String>,
    pub proxy: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub session_ttl_secs: u64,
    pub settle_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub chrome_path: Option<PathBuf>,
    pub webdriver_url: Option<String>,
    pub debug: bool,
}

impl Default for CloudBridgeConfig {
    fn default() -> Self {
        Self {
            engine: EngineMode::Auto,
            headless: true,
            fingerprint: None,
            proxy: None,
            timeout_secs: 30,
            max_retries: 3,
            retry_backoff_ms: 2_000,
            session_ttl_secs: 3_600,
            settle_delay_ms: 2_000,
            poll_interval_ms: 1_000,
            chrome_path: None,
            webdriver_url: None,
            debug: false,
        }
    }
}

impl CloudBridgeConfig {
    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::invalid("timeout_secs", "must be greater than zero"));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::invalid("max_retries", "at least one attempt is required"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("poll_interval_ms", "must be greater than zero"));
        }
        if let Some(proxy) = &self.proxy {
            Url::parse(proxy).map_err(|err| ConfigError::invalid("proxy", err.to_string()))?;
        }
        if let Some(endpoint) = &self.webdriver_url {
            Url::parse(endpoint)
                .map_err(|err| ConfigError::invalid("webdriver_url", err.to_string()))?;
        }
        if let Some(identifier) = &self.fingerprint
            && !FingerprintProvider::new().is_known(identifier)
        {
            log::warn!("unknown fingerprint '{identifier}', a random profile will be used");
        }
        Ok(())
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.engine.resolve()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            interval: Duration::from_millis(self.poll_interval_ms),
            timeout: self.timeout(),
            post_clear_delay: Duration::from_millis(self.settle_delay_ms),
        }
    }
}
