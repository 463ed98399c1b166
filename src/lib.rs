//! SAP client - request lifecycle and audit ledger for the text-analysis front end
//!
//! This crate provides:
//! - A timed request executor with explicit cancellation
//! - Background keep-alive and on-demand connection probing
//! - The analysis submission pipeline with stale-response protection
//! - An append-only, in-memory audit ledger with JSON export
//! - A stand-in backend for local development and tests

pub mod executor;
pub mod export;
pub mod ledger;
pub mod pipeline;
pub mod probe;
pub mod session;
pub mod stub_backend;
pub mod upload;

pub use executor::{HttpTransport, TimedExecutor, Transport};
pub use ledger::{AuditEntry, AuditLedger, LedgerSnapshot};
pub use pipeline::{AnalysisInput, AnalysisPipeline, AnalysisResult, SubmitOutcome};
pub use probe::{ConnectionState, ConnectionStatus, HealthProber};
pub use session::AnalysisSession;

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable that overrides the configured backend URL
pub const BACKEND_URL_ENV: &str = "SAP_BACKEND_URL";

/// Errors loading a configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Configuration for the analysis client
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the analysis backend
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per call-site timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Background keep-alive loop
    #[serde(default)]
    pub keep_alive: KeepAliveConfig,

    /// Maximum characters of an error body shown to the user
    #[serde(default = "default_error_excerpt_chars")]
    pub error_excerpt_chars: usize,

    /// Shown when the backend has no readme to offer
    #[serde(default = "default_readme_fallback")]
    pub readme_fallback: String,
}

fn default_base_url() -> String { "http://localhost:8000".to_string() }
fn default_error_excerpt_chars() -> usize { 100 }
fn default_readme_fallback() -> String { "README content is not available.".to_string() }

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeouts: TimeoutConfig::default(),
            keep_alive: KeepAliveConfig::default(),
            error_excerpt_chars: default_error_excerpt_chars(),
            readme_fallback: default_readme_fallback(),
        }
    }
}

impl ClientConfig {
    /// Parse a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Read and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Apply `SAP_BACKEND_URL` if it is set
    pub fn with_env_overrides(self) -> Self {
        match std::env::var(BACKEND_URL_ENV) {
            Ok(url) if !url.trim().is_empty() => self.with_base_url(url),
            _ => self,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Join a path onto the backend base URL
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn analyze_url(&self) -> String {
        self.endpoint("/api/analyze")
    }

    pub fn health_url(&self) -> String {
        self.endpoint("/health")
    }

    pub fn readme_url(&self) -> String {
        self.endpoint("/api/readme")
    }
}

/// Timeouts in milliseconds
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_timeout_ms")]
    pub default_ms: u64,

    #[serde(default = "default_health_timeout_ms")]
    pub health_ms: u64,

    #[serde(default = "default_analyze_timeout_ms")]
    pub analyze_ms: u64,

    #[serde(default = "default_connection_test_timeout_ms")]
    pub connection_test_ms: u64,
}

fn default_timeout_ms() -> u64 { 12_000 }
fn default_health_timeout_ms() -> u64 { 6_000 }
fn default_analyze_timeout_ms() -> u64 { 30_000 }
fn default_connection_test_timeout_ms() -> u64 { 10_000 }

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_ms: default_timeout_ms(),
            health_ms: default_health_timeout_ms(),
            analyze_ms: default_analyze_timeout_ms(),
            connection_test_ms: default_connection_test_timeout_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_ms)
    }

    pub fn health(&self) -> Duration {
        Duration::from_millis(self.health_ms)
    }

    pub fn analyze(&self) -> Duration {
        Duration::from_millis(self.analyze_ms)
    }

    pub fn connection_test(&self) -> Duration {
        Duration::from_millis(self.connection_test_ms)
    }
}

/// Keep-alive loop timing in milliseconds
#[derive(Debug, Clone, Deserialize)]
pub struct KeepAliveConfig {
    /// Delay before the first probe
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Period between probes
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Quiet period after user activity before an extra probe
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_settle_ms() -> u64 { 2_000 }
fn default_interval_ms() -> u64 { 10 * 60 * 1_000 }
fn default_debounce_ms() -> u64 { 1_500 }

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
            interval_ms: default_interval_ms(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl KeepAliveConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
