//! Coordination tuning: connection liveness, clock sync and session timing.
//!
//! All durations are stored as integer milliseconds (microseconds for clock
//! thresholds) so they read naturally in TOML; accessors return `Duration`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-connection limits and liveness timers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Largest accepted frame body in bytes.
    /// Default: 1048576
    #[serde(default = "ConnectionConfig::default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Outbound queue depth per device before bulk traffic is shed.
    /// Default: 256
    #[serde(default = "ConnectionConfig::default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Time a new connection has to send its hello.
    /// Default: 5000
    #[serde(default = "ConnectionConfig::default_hello_timeout_ms")]
    pub hello_timeout_ms: u64,

    /// Heartbeat send interval.
    /// Default: 1000
    #[serde(default = "ConnectionConfig::default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a device is marked stale.
    /// Default: 3000
    #[serde(default = "ConnectionConfig::default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Silence after which the connection is torn down and the device
    /// marked disconnected.
    /// Default: 10000
    #[serde(default = "ConnectionConfig::default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,

    /// Unacknowledged commands older than this are discarded rather than
    /// replayed after a reconnect.
    /// Default: 5000
    #[serde(default = "ConnectionConfig::default_command_ttl_ms")]
    pub command_ttl_ms: u64,

    /// How often the controller sweeps the registry for stale devices.
    /// Default: 1000
    #[serde(default = "ConnectionConfig::default_stale_sweep_interval_ms")]
    pub stale_sweep_interval_ms: u64,
}

impl ConnectionConfig {
    fn default_max_frame_bytes() -> usize {
        1024 * 1024
    }
    fn default_outbound_capacity() -> usize {
        256
    }
    fn default_hello_timeout_ms() -> u64 {
        5000
    }
    fn default_heartbeat_interval_ms() -> u64 {
        1000
    }
    fn default_heartbeat_timeout_ms() -> u64 {
        3000
    }
    fn default_disconnect_timeout_ms() -> u64 {
        10_000
    }
    fn default_command_ttl_ms() -> u64 {
        5000
    }
    fn default_stale_sweep_interval_ms() -> u64 {
        1000
    }

    pub fn hello_timeout(&self) -> Duration {
        Duration::from_millis(self.hello_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn command_ttl(&self) -> Duration {
        Duration::from_millis(self.command_ttl_ms)
    }

    pub fn stale_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.stale_sweep_interval_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: Self::default_max_frame_bytes(),
            outbound_capacity: Self::default_outbound_capacity(),
            hello_timeout_ms: Self::default_hello_timeout_ms(),
            heartbeat_interval_ms: Self::default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: Self::default_heartbeat_timeout_ms(),
            disconnect_timeout_ms: Self::default_disconnect_timeout_ms(),
            command_ttl_ms: Self::default_command_ttl_ms(),
            stale_sweep_interval_ms: Self::default_stale_sweep_interval_ms(),
        }
    }
}

/// How a newly estimated offset is applied to the published mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockCorrection {
    /// Hold the applied offset until the smoothed estimate moves more than
    /// `step_threshold_us` away from it, then jump to the estimate.
    Step,
    /// Follow the fitted offset line on every accepted sample and
    /// extrapolate with the measured drift between rounds. Moves larger
    /// than `step_threshold_us` are applied as well, and logged.
    Continuous,
}

impl ClockCorrection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClockCorrection::Step => "step",
            ClockCorrection::Continuous => "continuous",
        }
    }
}

/// Clock synchronization estimator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Number of accepted samples kept for estimation.
    /// Default: 20
    #[serde(default = "SyncConfig::default_window")]
    pub window: usize,

    /// Outlier gate: reject samples whose delay exceeds median + k * MAD.
    /// Default: 3.0
    #[serde(default = "SyncConfig::default_mad_k")]
    pub mad_k: f64,

    /// Floor on the MAD used by the gate, in microseconds.
    /// Default: 200
    #[serde(default = "SyncConfig::default_min_mad_us")]
    pub min_mad_us: u64,

    /// Samples accepted unconditionally before the gate applies.
    /// Default: 5
    #[serde(default = "SyncConfig::default_warmup_samples")]
    pub warmup_samples: usize,

    /// Smoothing factor for the offset EMA.
    /// Default: 0.25
    #[serde(default = "SyncConfig::default_ema_alpha")]
    pub ema_alpha: f64,

    /// Residual RMS above which the estimate is considered degraded, in microseconds.
    /// Default: 5000
    #[serde(default = "SyncConfig::default_rms_threshold_us")]
    pub rms_threshold_us: u64,

    /// Consecutive failed exchanges before a device becomes unsynchronized.
    /// Default: 5
    #[serde(default = "SyncConfig::default_max_failed_attempts")]
    pub max_failed_attempts: u32,

    /// Exchange interval while synchronized.
    /// Default: 2000
    #[serde(default = "SyncConfig::default_interval_ms")]
    pub interval_ms: u64,

    /// Exchange interval while pending or degraded.
    /// Default: 500
    #[serde(default = "SyncConfig::default_degraded_interval_ms")]
    pub degraded_interval_ms: u64,

    /// A request with no reply after this long counts as a failed exchange.
    /// Default: 1000
    #[serde(default = "SyncConfig::default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    /// In step mode, how far the estimate must move before the applied
    /// offset jumps. In continuous mode, moves past this are only logged.
    /// Default: 1000
    #[serde(default = "SyncConfig::default_step_threshold_us")]
    pub step_threshold_us: u64,

    /// Default: step
    #[serde(default = "SyncConfig::default_correction")]
    pub correction: ClockCorrection,
}

impl SyncConfig {
    fn default_window() -> usize {
        20
    }
    fn default_mad_k() -> f64 {
        3.0
    }
    fn default_min_mad_us() -> u64 {
        200
    }
    fn default_warmup_samples() -> usize {
        5
    }
    fn default_ema_alpha() -> f64 {
        0.25
    }
    fn default_rms_threshold_us() -> u64 {
        5000
    }
    fn default_max_failed_attempts() -> u32 {
        5
    }
    fn default_interval_ms() -> u64 {
        2000
    }
    fn default_degraded_interval_ms() -> u64 {
        500
    }
    fn default_reply_timeout_ms() -> u64 {
        1000
    }
    fn default_step_threshold_us() -> u64 {
        1000
    }
    fn default_correction() -> ClockCorrection {
        ClockCorrection::Step
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn degraded_interval(&self) -> Duration {
        Duration::from_millis(self.degraded_interval_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            window: Self::default_window(),
            mad_k: Self::default_mad_k(),
            min_mad_us: Self::default_min_mad_us(),
            warmup_samples: Self::default_warmup_samples(),
            ema_alpha: Self::default_ema_alpha(),
            rms_threshold_us: Self::default_rms_threshold_us(),
            max_failed_attempts: Self::default_max_failed_attempts(),
            interval_ms: Self::default_interval_ms(),
            degraded_interval_ms: Self::default_degraded_interval_ms(),
            reply_timeout_ms: Self::default_reply_timeout_ms(),
            step_threshold_us: Self::default_step_threshold_us(),
            correction: Self::default_correction(),
        }
    }
}

/// What happens when a required device disconnects mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossPolicy {
    /// Abort the session.
    Abort,
    /// Demote the device to optional and mark the session partial.
    Demote,
}

impl LossPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LossPolicy::Abort => "abort",
            LossPolicy::Demote => "demote",
        }
    }
}

/// Session orchestration timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Deadline for all required devices to ack start.
    /// Default: 2000
    #[serde(default = "SessionConfig::default_start_timeout_ms")]
    pub start_timeout_ms: u64,

    /// Deadline for stop acks before finalizing as partial.
    /// Default: 3000
    #[serde(default = "SessionConfig::default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// How far in the future the common start instant is scheduled.
    /// Default: 500
    #[serde(default = "SessionConfig::default_start_lead_ms")]
    pub start_lead_ms: u64,

    /// Default: abort
    #[serde(default = "SessionConfig::default_required_loss_policy")]
    pub required_loss_policy: LossPolicy,

    /// Finished session reports kept in memory.
    /// Default: 64
    #[serde(default = "SessionConfig::default_history_limit")]
    pub history_limit: usize,

    /// Re-sends of an unacknowledged start or stop command before the
    /// device is recorded as unresponsive. 0 disables re-sending.
    /// Default: 2
    #[serde(default = "SessionConfig::default_command_retries")]
    pub command_retries: u32,

    /// Delay before the first re-send; doubles per attempt.
    /// Default: 300
    #[serde(default = "SessionConfig::default_command_retry_base_ms")]
    pub command_retry_base_ms: u64,

    /// Cap on the delay between re-sends.
    /// Default: 1000
    #[serde(default = "SessionConfig::default_command_retry_max_ms")]
    pub command_retry_max_ms: u64,
}

impl SessionConfig {
    fn default_start_timeout_ms() -> u64 {
        2000
    }
    fn default_stop_timeout_ms() -> u64 {
        3000
    }
    fn default_start_lead_ms() -> u64 {
        500
    }
    fn default_required_loss_policy() -> LossPolicy {
        LossPolicy::Abort
    }
    fn default_history_limit() -> usize {
        64
    }
    fn default_command_retries() -> u32 {
        2
    }
    fn default_command_retry_base_ms() -> u64 {
        300
    }
    fn default_command_retry_max_ms() -> u64 {
        1000
    }

    pub fn command_retry_base(&self) -> Duration {
        Duration::from_millis(self.command_retry_base_ms)
    }

    pub fn command_retry_max(&self) -> Duration {
        Duration::from_millis(self.command_retry_max_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn start_lead(&self) -> Duration {
        Duration::from_millis(self.start_lead_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: Self::default_start_timeout_ms(),
            stop_timeout_ms: Self::default_stop_timeout_ms(),
            start_lead_ms: Self::default_start_lead_ms(),
            required_loss_policy: Self::default_required_loss_policy(),
            history_limit: Self::default_history_limit(),
            command_retries: Self::default_command_retries(),
            command_retry_base_ms: Self::default_command_retry_base_ms(),
            command_retry_max_ms: Self::default_command_retry_max_ms(),
        }
    }
}

/// All coordination config combined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub session: SessionConfig,
}
