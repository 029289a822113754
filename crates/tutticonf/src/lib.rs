//! Layered configuration loading for Tutti.
//!
//! Imported by every Tutti crate, so dependencies stay minimal.
//!
//! # Configuration Split
//!
//! - **Infrastructure** (`InfraConfig`): paths, bind addresses and telemetry
//!   endpoints. Fixed for the life of the process.
//!
//! - **Coordination** (`CoordinationConfig`): liveness timers, clock sync
//!   estimator tuning and session deadlines.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/tutti/config.toml` (system)
//! 2. `~/.config/tutti/config.toml` (user)
//! 3. `./tutti.toml` (local override, replaced by `--config` when given)
//! 4. Environment variables (`TUTTI_*`, plus `RUST_LOG` and
//!    `OTEL_EXPORTER_OTLP_ENDPOINT`)
//!
//! Files are merged as raw TOML tables, key by key, before being
//! deserialized, so a local file that sets only `[sync] window` keeps every
//! other value from the layers beneath it.
//!
//! # Example Config
//!
//! ```toml
//! [bind]
//! device_listen = "0.0.0.0:7470"
//! http_port = 7471
//!
//! [connection]
//! heartbeat_timeout_ms = 3000
//!
//! [sync]
//! correction = "continuous"
//!
//! [session]
//! required_loss_policy = "demote"
//! ```

pub mod coordination;
pub mod infra;
pub mod loader;

pub use coordination::{
    ClockCorrection, ConnectionConfig, CoordinationConfig, LossPolicy, SessionConfig, SyncConfig,
};
pub use infra::{BindConfig, InfraConfig, PathsConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete Tutti configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TuttiConfig {
    #[serde(flatten)]
    pub infra: InfraConfig,

    #[serde(flatten)]
    pub coordination: CoordinationConfig,
}

impl TuttiConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, with `config_path` replacing `./tutti.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report which files and env vars contributed.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let mut config = loader::from_table(merged, &origin)?;

        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Reject combinations the runtime can't honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let conn = &self.coordination.connection;
        let sync = &self.coordination.sync;

        if conn.heartbeat_timeout_ms <= conn.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "connection.heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                conn.heartbeat_timeout_ms, conn.heartbeat_interval_ms
            )));
        }
        if conn.disconnect_timeout_ms < conn.heartbeat_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "connection.disconnect_timeout_ms ({}) must be at least heartbeat_timeout_ms ({})",
                conn.disconnect_timeout_ms, conn.heartbeat_timeout_ms
            )));
        }
        if conn.outbound_capacity == 0 {
            return Err(ConfigError::Invalid(
                "connection.outbound_capacity must be positive".to_string(),
            ));
        }
        if sync.window < 2 {
            return Err(ConfigError::Invalid(format!(
                "sync.window ({}) must hold at least 2 samples",
                sync.window
            )));
        }
        if !(sync.ema_alpha > 0.0 && sync.ema_alpha <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "sync.ema_alpha ({}) must be in (0, 1]",
                sync.ema_alpha
            )));
        }
        if sync.mad_k <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "sync.mad_k ({}) must be positive",
                sync.mad_k
            )));
        }
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> String {
        let infra = &self.infra;
        let conn = &self.coordination.connection;
        let sync = &self.coordination.sync;
        let session = &self.coordination.session;
        let mut output = String::new();

        output.push_str("# Tutti Configuration\n\n");

        output.push_str("[paths]\n");
        output.push_str(&format!("state_dir = \"{}\"\n", infra.paths.state_dir.display()));
        output.push_str(&format!("report_dir = \"{}\"\n", infra.paths.report_dir.display()));

        output.push_str("\n[bind]\n");
        output.push_str(&format!("device_listen = \"{}\"\n", infra.bind.device_listen));
        output.push_str(&format!("http_port = {}\n", infra.bind.http_port));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!("otlp_endpoint = \"{}\"\n", infra.telemetry.otlp_endpoint));
        output.push_str(&format!("log_level = \"{}\"\n", infra.telemetry.log_level));

        output.push_str("\n[connection]\n");
        output.push_str(&format!("max_frame_bytes = {}\n", conn.max_frame_bytes));
        output.push_str(&format!("outbound_capacity = {}\n", conn.outbound_capacity));
        output.push_str(&format!("hello_timeout_ms = {}\n", conn.hello_timeout_ms));
        output.push_str(&format!("heartbeat_interval_ms = {}\n", conn.heartbeat_interval_ms));
        output.push_str(&format!("heartbeat_timeout_ms = {}\n", conn.heartbeat_timeout_ms));
        output.push_str(&format!("disconnect_timeout_ms = {}\n", conn.disconnect_timeout_ms));
        output.push_str(&format!("command_ttl_ms = {}\n", conn.command_ttl_ms));
        output.push_str(&format!(
            "stale_sweep_interval_ms = {}\n",
            conn.stale_sweep_interval_ms
        ));

        output.push_str("\n[sync]\n");
        output.push_str(&format!("window = {}\n", sync.window));
        output.push_str(&format!("mad_k = {:?}\n", sync.mad_k));
        output.push_str(&format!("min_mad_us = {}\n", sync.min_mad_us));
        output.push_str(&format!("warmup_samples = {}\n", sync.warmup_samples));
        output.push_str(&format!("ema_alpha = {:?}\n", sync.ema_alpha));
        output.push_str(&format!("rms_threshold_us = {}\n", sync.rms_threshold_us));
        output.push_str(&format!("max_failed_attempts = {}\n", sync.max_failed_attempts));
        output.push_str(&format!("interval_ms = {}\n", sync.interval_ms));
        output.push_str(&format!("degraded_interval_ms = {}\n", sync.degraded_interval_ms));
        output.push_str(&format!("reply_timeout_ms = {}\n", sync.reply_timeout_ms));
        output.push_str(&format!("step_threshold_us = {}\n", sync.step_threshold_us));
        output.push_str(&format!("correction = \"{}\"\n", sync.correction.as_str()));

        output.push_str("\n[session]\n");
        output.push_str(&format!("start_timeout_ms = {}\n", session.start_timeout_ms));
        output.push_str(&format!("stop_timeout_ms = {}\n", session.stop_timeout_ms));
        output.push_str(&format!("start_lead_ms = {}\n", session.start_lead_ms));
        output.push_str(&format!(
            "required_loss_policy = \"{}\"\n",
            session.required_loss_policy.as_str()
        ));
        output.push_str(&format!("history_limit = {}\n", session.history_limit));
        output.push_str(&format!("command_retries = {}\n", session.command_retries));
        output.push_str(&format!(
            "command_retry_base_ms = {}\n",
            session.command_retry_base_ms
        ));
        output.push_str(&format!(
            "command_retry_max_ms = {}\n",
            session.command_retry_max_ms
        ));

        output
    }
}
