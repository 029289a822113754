//! Config file discovery, table merging, and environment variable overlay.

use crate::{ClockCorrection, ConfigError, LossPolicy, TuttiConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli), existing files only.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/tutti/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("tutti/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("tutti.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file as an untyped table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Deep-merge `overlay` into `base`. Nested tables merge key by key; any
/// other value in `overlay` replaces the one in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Deserialize a merged table into typed config, expanding `~` and `$VAR`
/// in path values. `origin` is only used for error messages.
pub fn from_table(table: toml::Table, origin: &Path) -> Result<TuttiConfig, ConfigError> {
    let mut config: TuttiConfig =
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;

    let paths = &mut config.infra.paths;
    paths.state_dir = expand_path(&paths.state_dir.to_string_lossy());
    paths.report_dir = expand_path(&paths.report_dir.to_string_lossy());

    Ok(config)
}

/// Apply environment variable overrides from the process environment.
pub fn apply_env_overrides(config: &mut TuttiConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |key| env::var(key).ok());
}

/// Apply overrides from an arbitrary lookup. Values that fail to parse are
/// ignored and not recorded as overrides.
pub fn apply_overrides_from<F>(config: &mut TuttiConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let infra = &mut config.infra;
    let coord = &mut config.coordination;

    apply(&lookup, sources, "TUTTI_STATE_DIR", |v| {
        infra.paths.state_dir = expand_path(&v);
        true
    });
    apply(&lookup, sources, "TUTTI_REPORT_DIR", |v| {
        infra.paths.report_dir = expand_path(&v);
        true
    });

    apply(&lookup, sources, "TUTTI_DEVICE_LISTEN", |v| {
        infra.bind.device_listen = v;
        true
    });
    apply(&lookup, sources, "TUTTI_HTTP_PORT", |v| set_parsed(&mut infra.bind.http_port, &v));

    apply(&lookup, sources, "TUTTI_OTLP_ENDPOINT", |v| {
        infra.telemetry.otlp_endpoint = v;
        true
    });
    // Standard OTEL variable wins over ours
    apply(&lookup, sources, "OTEL_EXPORTER_OTLP_ENDPOINT", |v| {
        infra.telemetry.otlp_endpoint = v;
        true
    });
    apply(&lookup, sources, "TUTTI_LOG_LEVEL", |v| {
        infra.telemetry.log_level = v;
        true
    });
    apply(&lookup, sources, "RUST_LOG", |v| {
        infra.telemetry.log_level = v;
        true
    });

    apply(&lookup, sources, "TUTTI_MAX_FRAME_BYTES", |v| {
        set_parsed(&mut coord.connection.max_frame_bytes, &v)
    });
    apply(&lookup, sources, "TUTTI_HEARTBEAT_INTERVAL_MS", |v| {
        set_parsed(&mut coord.connection.heartbeat_interval_ms, &v)
    });
    apply(&lookup, sources, "TUTTI_HEARTBEAT_TIMEOUT_MS", |v| {
        set_parsed(&mut coord.connection.heartbeat_timeout_ms, &v)
    });
    apply(&lookup, sources, "TUTTI_DISCONNECT_TIMEOUT_MS", |v| {
        set_parsed(&mut coord.connection.disconnect_timeout_ms, &v)
    });

    apply(&lookup, sources, "TUTTI_SYNC_INTERVAL_MS", |v| {
        set_parsed(&mut coord.sync.interval_ms, &v)
    });
    apply(&lookup, sources, "TUTTI_SYNC_CORRECTION", |v| {
        match v.trim().to_ascii_lowercase().as_str() {
            "step" => coord.sync.correction = ClockCorrection::Step,
            "continuous" => coord.sync.correction = ClockCorrection::Continuous,
            _ => return false,
        }
        true
    });

    apply(&lookup, sources, "TUTTI_START_TIMEOUT_MS", |v| {
        set_parsed(&mut coord.session.start_timeout_ms, &v)
    });
    apply(&lookup, sources, "TUTTI_STOP_TIMEOUT_MS", |v| {
        set_parsed(&mut coord.session.stop_timeout_ms, &v)
    });
    apply(&lookup, sources, "TUTTI_REQUIRED_LOSS_POLICY", |v| {
        match v.trim().to_ascii_lowercase().as_str() {
            "abort" => coord.session.required_loss_policy = LossPolicy::Abort,
            "demote" => coord.session.required_loss_policy = LossPolicy::Demote,
            _ => return false,
        }
        true
    });
}

fn apply<F>(lookup: &F, sources: &mut ConfigSources, key: &str, set: impl FnOnce(String) -> bool)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(key) {
        if set(value) {
            sources.env_overrides.push(key.to_string());
        }
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, raw: &str) -> bool {
    match raw.trim().parse() {
        Ok(v) => {
            *slot = v;
            true
        }
        Err(_) => false,
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            match env::var(var_name) {
                Ok(var_value) => PathBuf::from(var_value).join(&stripped[slash_pos + 1..]),
                Err(_) => PathBuf::from(path),
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}
