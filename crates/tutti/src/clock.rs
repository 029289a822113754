//! Per-device clock offset and drift estimation.
//!
//! Each exchange yields four timestamps: controller send (t0), device
//! receive (t1), device reply (t2), controller receive (t3).
//!
//! ```text
//! delay  = (t3 - t0) - (t2 - t1)
//! offset = ((t1 - t0) + (t2 - t3)) / 2      (device clock minus controller clock)
//! ```
//!
//! The error of a single offset is bounded by half the round trip and equals
//! half the one-way asymmetry. Samples whose delay is far above the recent
//! median are rejected as queueing outliers; accepted samples feed an EMA
//! offset and a least-squares line whose slope is the drift.
//!
//! One synchronizer per connection, owned by that connection's task.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};
use tutticonf::{ClockCorrection, SyncConfig};
use tuttiproto::timing::{nanos_to_micros_f64, nanos_to_millis_f64, NANOS_PER_MICRO};
use tuttiproto::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Not enough accepted samples yet
    Pending,
    Synchronized,
    /// Residual RMS above threshold; resync runs more often
    Degraded,
    /// Too many consecutive failed exchanges; excluded from session selection
    Unsynchronized,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synchronized => "synchronized",
            SyncStatus::Degraded => "degraded",
            SyncStatus::Unsynchronized => "unsynchronized",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SyncStatus::Synchronized => 3,
            SyncStatus::Pending => 2,
            SyncStatus::Degraded => 1,
            SyncStatus::Unsynchronized => 0,
        }
    }

    /// True if `self` is a worse timing state than `previous`.
    pub fn is_downgrade_from(&self, previous: SyncStatus) -> bool {
        self.rank() < previous.rank() && *self != SyncStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    /// Reply claims to have been processed for longer than the round trip
    NegativeDelay,
    /// Delay above median + k * MAD of the recent window
    Outlier { threshold_ns: i64 },
    /// Timestamps too far apart to difference in 64 bits
    InvalidTimestamps,
}

/// One four-timestamp exchange and what was derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockSample {
    pub t0: i64,
    pub t1: i64,
    pub t2: i64,
    pub t3: i64,
    pub delay_ns: i64,
    pub offset_ns: i64,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
}

impl ClockSample {
    /// `t1` and `t2` come off the wire, so the arithmetic is checked; a
    /// sample that cannot be derived carries `InvalidTimestamps`.
    pub fn from_timestamps(t0: i64, t1: i64, t2: i64, t3: i64) -> Self {
        let derived = derive(t0, t1, t2, t3);
        let (delay_ns, offset_ns) = derived.unwrap_or((0, 0));
        Self {
            t0,
            t1,
            t2,
            t3,
            delay_ns,
            offset_ns,
            accepted: false,
            rejection: derived.is_none().then_some(Rejection::InvalidTimestamps),
        }
    }

    /// Reference-clock instant the sample describes.
    pub fn midpoint(&self) -> i64 {
        self.t0 + (self.t3 - self.t0) / 2
    }
}

fn derive(t0: i64, t1: i64, t2: i64, t3: i64) -> Option<(i64, i64)> {
    let processing = t2.checked_sub(t1)?;
    let delay = t3.checked_sub(t0)?.checked_sub(processing)?;
    let offset = t1.checked_sub(t0)?.checked_add(t2.checked_sub(t3)?)? / 2;
    Some((delay, offset))
}

/// Rolling quality figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncQuality {
    /// RMS of accepted offsets against the fitted line
    pub rms_ns: f64,
    pub drift_ppm: f64,
    pub samples: usize,
}

/// Published clock mapping for one device.
///
/// `offset_ns` is the correction currently in effect (device minus
/// reference at `anchor_ns`). In step mode it changes only when the
/// estimate moves past the step threshold; in continuous mode it is
/// extrapolated with `drift_ppm`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub status: SyncStatus,
    pub offset_ns: i64,
    pub anchor_ns: i64,
    pub drift_ppm: f64,
    /// Current smoothed estimate, which may differ from the applied offset
    pub estimate_ns: i64,
    pub rms_us: f64,
    pub correction: ClockCorrection,
    pub accepted: u64,
    pub rejected: u64,
    pub timeouts: u64,
    pub consecutive_failures: u32,
    pub steps: u32,
}

impl SyncSnapshot {
    /// Snapshot for a device nothing is known about yet.
    pub fn pending(correction: ClockCorrection) -> Self {
        Self {
            status: SyncStatus::Pending,
            offset_ns: 0,
            anchor_ns: 0,
            drift_ppm: 0.0,
            estimate_ns: 0,
            rms_us: 0.0,
            correction,
            accepted: 0,
            rejected: 0,
            timeouts: 0,
            consecutive_failures: 0,
            steps: 0,
        }
    }

    fn offset_at(&self, reference_ns: i64) -> i64 {
        match self.correction {
            ClockCorrection::Step => self.offset_ns,
            ClockCorrection::Continuous => {
                let elapsed = reference_ns.saturating_sub(self.anchor_ns) as f64;
                self.offset_ns
                    .saturating_add((elapsed * self.drift_ppm / 1e6).round() as i64)
            }
        }
    }

    /// Map a reference (controller) timestamp onto the device's clock.
    pub fn to_device(&self, reference_ns: i64) -> i64 {
        reference_ns.saturating_add(self.offset_at(reference_ns))
    }

    /// Map a device timestamp onto the reference timeline.
    pub fn to_reference(&self, device_ns: i64) -> i64 {
        // offset_at depends on the reference time being solved for; two
        // fixed-point rounds are exact to the nanosecond at realistic drift.
        let first = device_ns.saturating_sub(self.offset_at(device_ns.saturating_sub(self.offset_ns)));
        device_ns.saturating_sub(self.offset_at(first))
    }

    pub fn offset_ms(&self) -> f64 {
        nanos_to_millis_f64(self.offset_ns)
    }
}

#[derive(Debug, Clone, Copy)]
struct LineFit {
    origin_ns: i64,
    intercept: f64,
    slope: f64,
}

impl LineFit {
    fn at(&self, reference_ns: i64) -> f64 {
        self.intercept + self.slope * (reference_ns - self.origin_ns) as f64
    }
}

#[derive(Debug)]
pub struct ClockSynchronizer {
    device_id: DeviceId,
    config: SyncConfig,
    /// Delays of recent valid exchanges, accepted or not; feeds the gate
    delays: VecDeque<i64>,
    /// Accepted samples; feeds the estimate
    accepted: VecDeque<ClockSample>,
    ema_ns: Option<f64>,
    fit: Option<LineFit>,
    rms_ns: f64,
    applied_ns: i64,
    anchor_ns: i64,
    has_applied: bool,
    consecutive_failures: u32,
    total_accepted: u64,
    total_rejected: u64,
    timeouts: u64,
    steps: u32,
    status: SyncStatus,
}

impl ClockSynchronizer {
    pub fn new(device_id: DeviceId, config: SyncConfig) -> Self {
        Self {
            device_id,
            delays: VecDeque::with_capacity(config.window),
            accepted: VecDeque::with_capacity(config.window),
            config,
            ema_ns: None,
            fit: None,
            rms_ns: 0.0,
            applied_ns: 0,
            anchor_ns: 0,
            has_applied: false,
            consecutive_failures: 0,
            total_accepted: 0,
            total_rejected: 0,
            timeouts: 0,
            steps: 0,
            status: SyncStatus::Pending,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    /// Feed one completed exchange.
    pub fn record_exchange(&mut self, t0: i64, t1: i64, t2: i64, t3: i64) -> ClockSample {
        let mut sample = ClockSample::from_timestamps(t0, t1, t2, t3);

        if sample.rejection.is_some() {
            warn!(device_id = %self.device_id, t1, t2, "sync reply timestamps out of range");
        } else if sample.delay_ns < 0 {
            sample.rejection = Some(Rejection::NegativeDelay);
        } else {
            if let Some(threshold_ns) = self.gate_threshold() {
                if sample.delay_ns > threshold_ns {
                    sample.rejection = Some(Rejection::Outlier { threshold_ns });
                }
            }
            push_bounded(&mut self.delays, sample.delay_ns, self.config.window);
        }

        if sample.rejection.is_none() {
            sample.accepted = true;
            self.accept(&sample);
        } else {
            self.total_rejected += 1;
            self.consecutive_failures += 1;
            debug!(
                device_id = %self.device_id,
                delay_us = nanos_to_micros_f64(sample.delay_ns),
                "sync sample rejected: {:?}",
                sample.rejection
            );
        }

        self.evaluate();
        sample
    }

    /// An exchange that got no reply in time.
    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
        self.consecutive_failures += 1;
        debug!(
            device_id = %self.device_id,
            failures = self.consecutive_failures,
            "sync exchange timed out"
        );
        self.evaluate();
    }

    /// `median + k * max(MAD, min_mad)` once warm, else no gate.
    fn gate_threshold(&self) -> Option<i64> {
        if self.delays.len() < self.config.warmup_samples.max(1) {
            return None;
        }
        let median = median(self.delays.iter().copied());
        let mad = median_f64(self.delays.iter().map(|d| (*d as f64 - median).abs()));
        let floor = (self.config.min_mad_us as i64 * NANOS_PER_MICRO) as f64;
        Some((median + self.config.mad_k * mad.max(floor)).round() as i64)
    }

    fn accept(&mut self, sample: &ClockSample) {
        self.total_accepted += 1;
        self.consecutive_failures = 0;
        push_bounded(&mut self.accepted, sample.clone(), self.config.window);

        let offset = sample.offset_ns as f64;
        self.ema_ns = Some(match self.ema_ns {
            None => offset,
            Some(ema) => ema + self.config.ema_alpha * (offset - ema),
        });

        self.refit();
        self.apply_correction(sample.midpoint());
    }

    /// Least-squares offset-vs-time over the accepted window.
    fn refit(&mut self) {
        let Some(first) = self.accepted.front() else {
            self.fit = None;
            return;
        };
        let origin_ns = first.midpoint();
        let n = self.accepted.len() as f64;

        let points: Vec<(f64, f64)> = self
            .accepted
            .iter()
            .map(|s| ((s.midpoint() - origin_ns) as f64, s.offset_ns as f64))
            .collect();

        let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
        let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
        let sxx: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
        let sxy: f64 = points
            .iter()
            .map(|(x, y)| (x - mean_x) * (y - mean_y))
            .sum();

        let slope = if points.len() >= 2 && sxx > 0.0 { sxy / sxx } else { 0.0 };
        let intercept = mean_y - slope * mean_x;
        let fit = LineFit {
            origin_ns,
            intercept,
            slope,
        };

        let sum_sq: f64 = self
            .accepted
            .iter()
            .map(|s| (s.offset_ns as f64 - fit.at(s.midpoint())).powi(2))
            .sum();
        self.rms_ns = (sum_sq / n).sqrt();
        self.fit = Some(fit);
    }

    fn apply_correction(&mut self, at_ns: i64) {
        let candidate = match self.config.correction {
            ClockCorrection::Step => self.ema_ns.unwrap_or(0.0).round() as i64,
            ClockCorrection::Continuous => match self.fit {
                Some(fit) if self.accepted.len() >= 2 => fit.at(at_ns).round() as i64,
                _ => self.ema_ns.unwrap_or(0.0).round() as i64,
            },
        };

        if !self.has_applied {
            self.has_applied = true;
            self.applied_ns = candidate;
            self.anchor_ns = at_ns;
            info!(
                device_id = %self.device_id,
                offset_ms = nanos_to_millis_f64(candidate),
                "⏱️ initial clock offset"
            );
            return;
        }

        let jump = candidate.saturating_sub(self.applied_ns);
        let threshold = self.config.step_threshold_us.saturating_mul(NANOS_PER_MICRO as u64);
        match self.config.correction {
            ClockCorrection::Step => {
                if jump.unsigned_abs() > threshold {
                    self.steps += 1;
                    info!(
                        device_id = %self.device_id,
                        step_us = nanos_to_micros_f64(jump),
                        offset_ms = nanos_to_millis_f64(candidate),
                        "clock step applied"
                    );
                    self.applied_ns = candidate;
                    self.anchor_ns = at_ns;
                }
            }
            ClockCorrection::Continuous => {
                if jump.unsigned_abs() > threshold {
                    self.steps += 1;
                    info!(
                        device_id = %self.device_id,
                        step_us = nanos_to_micros_f64(jump),
                        "clock estimate jumped"
                    );
                }
                self.applied_ns = candidate;
                self.anchor_ns = at_ns;
            }
        }
    }

    fn evaluate(&mut self) {
        let threshold_ns = (self.config.rms_threshold_us as i64 * NANOS_PER_MICRO) as f64;
        let next = if self.consecutive_failures >= self.config.max_failed_attempts {
            SyncStatus::Unsynchronized
        } else if self.accepted.len() < self.config.warmup_samples.clamp(1, self.config.window) {
            if self.status == SyncStatus::Unsynchronized && self.consecutive_failures > 0 {
                SyncStatus::Unsynchronized
            } else {
                SyncStatus::Pending
            }
        } else if self.rms_ns > threshold_ns {
            SyncStatus::Degraded
        } else {
            SyncStatus::Synchronized
        };

        if next != self.status {
            if next.is_downgrade_from(self.status) {
                warn!(
                    device_id = %self.device_id,
                    rms_us = nanos_to_micros_f64(self.rms_ns as i64),
                    failures = self.consecutive_failures,
                    "clock sync {} -> {}",
                    self.status.as_str(),
                    next.as_str()
                );
            } else {
                info!(
                    device_id = %self.device_id,
                    rms_us = nanos_to_micros_f64(self.rms_ns as i64),
                    "clock sync {} -> {}",
                    self.status.as_str(),
                    next.as_str()
                );
            }
            self.status = next;
        }
    }

    /// Delay before the next exchange should be sent.
    pub fn next_interval(&self) -> std::time::Duration {
        match self.status {
            SyncStatus::Synchronized => self.config.interval(),
            _ => self.config.degraded_interval(),
        }
    }

    /// Current smoothed offset estimate, if any sample was accepted.
    pub fn estimate_ns(&self) -> Option<i64> {
        self.ema_ns.map(|e| e.round() as i64)
    }

    pub fn quality(&self) -> SyncQuality {
        SyncQuality {
            rms_ns: self.rms_ns,
            drift_ppm: self.fit.map(|f| f.slope * 1e6).unwrap_or(0.0),
            samples: self.accepted.len(),
        }
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        let quality = self.quality();
        SyncSnapshot {
            status: self.status,
            offset_ns: self.applied_ns,
            anchor_ns: self.anchor_ns,
            drift_ppm: quality.drift_ppm,
            estimate_ns: self.estimate_ns().unwrap_or(0),
            rms_us: quality.rms_ns / NANOS_PER_MICRO as f64,
            correction: self.config.correction,
            accepted: self.total_accepted,
            rejected: self.total_rejected,
            timeouts: self.timeouts,
            consecutive_failures: self.consecutive_failures,
            steps: self.steps,
        }
    }
}

fn push_bounded<T>(window: &mut VecDeque<T>, item: T, cap: usize) {
    while window.len() >= cap.max(1) {
        window.pop_front();
    }
    window.push_back(item);
}

fn median(values: impl Iterator<Item = i64>) -> f64 {
    median_f64(values.map(|v| v as f64))
}

fn median_f64(values: impl Iterator<Item = f64>) -> f64 {
    let mut sorted: Vec<f64> = values.collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 1_000_000;
    const US: i64 = 1_000;

    /// Deterministic xorshift so runs are reproducible.
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }

        fn range(&mut self, lo: i64, hi: i64) -> i64 {
            lo + (self.next() % (hi - lo) as u64) as i64
        }

        fn chance(&mut self, percent: u64) -> bool {
            self.next() % 100 < percent
        }
    }

    /// A device whose clock runs `offset_ns` ahead of reference plus drift.
    struct SimDevice {
        offset_ns: i64,
        drift_ppm: f64,
        epoch: i64,
    }

    impl SimDevice {
        fn clock(&self, reference: i64) -> i64 {
            let drift = ((reference - self.epoch) as f64 * self.drift_ppm / 1e6) as i64;
            reference + self.offset_ns + drift
        }

        fn true_offset(&self, reference: i64) -> i64 {
            self.clock(reference) - reference
        }

        /// Simulate one exchange starting at reference time `t0`.
        fn exchange(&self, t0: i64, up: i64, down: i64, processing: i64) -> (i64, i64, i64, i64) {
            let t1 = self.clock(t0 + up);
            let t2 = self.clock(t0 + up + processing);
            let t3 = t0 + up + processing + down;
            (t0, t1, t2, t3)
        }
    }

    fn config() -> SyncConfig {
        SyncConfig::default()
    }

    fn sync(config: SyncConfig) -> ClockSynchronizer {
        ClockSynchronizer::new(DeviceId::from("dev"), config)
    }

    #[test]
    fn exchange_math() {
        // device 100ms ahead, 3ms each way, 1ms processing
        let t0 = 1_000 * MS;
        let sample = ClockSample::from_timestamps(t0, t0 + 103 * MS, t0 + 104 * MS, t0 + 7 * MS);
        assert_eq!(sample.delay_ns, 6 * MS);
        assert_eq!(sample.offset_ns, 100 * MS);
    }

    #[test]
    fn negative_delay_is_rejected() {
        let mut s = sync(config());
        let sample = s.record_exchange(0, 10 * MS, 30 * MS, 5 * MS);
        assert!(!sample.accepted);
        assert_eq!(sample.rejection, Some(Rejection::NegativeDelay));
        assert_eq!(s.snapshot().rejected, 1);
        assert!(s.estimate_ns().is_none());
    }

    #[test]
    fn out_of_range_timestamps_are_rejected() {
        let mut s = sync(config());
        let t0 = 1_700_000_000_000_000_000;
        let sample = s.record_exchange(t0, i64::MIN, 0, t0 + MS);
        assert!(!sample.accepted);
        assert_eq!(sample.rejection, Some(Rejection::InvalidTimestamps));

        let sample = s.record_exchange(t0, i64::MAX, i64::MIN, t0 + MS);
        assert_eq!(sample.rejection, Some(Rejection::InvalidTimestamps));

        let snap = s.snapshot();
        assert_eq!(snap.rejected, 2);
        assert_eq!(snap.consecutive_failures, 2);
        assert!(s.estimate_ns().is_none());

        // the estimator carries on with good samples afterwards
        assert!(s.record_exchange(t0, t0 + 2 * MS, t0 + 2 * MS, t0 + 4 * MS).accepted);
    }

    #[test]
    fn outlier_gate_only_after_warmup() {
        let mut s = sync(config());
        let dev = SimDevice { offset_ns: 0, drift_ppm: 0.0, epoch: 0 };

        // A large delay during warmup is accepted.
        let (a, b, c, d) = dev.exchange(0, 40 * MS, 40 * MS, 100 * US);
        assert!(s.record_exchange(a, b, c, d).accepted);

        for i in 1..10 {
            let (a, b, c, d) = dev.exchange(i * 100 * MS, 2 * MS, 2 * MS, 100 * US);
            assert!(s.record_exchange(a, b, c, d).accepted);
        }

        let (a, b, c, d) = dev.exchange(2_000 * MS, 40 * MS, 40 * MS, 100 * US);
        let sample = s.record_exchange(a, b, c, d);
        assert!(!sample.accepted);
        assert!(matches!(sample.rejection, Some(Rejection::Outlier { .. })));
    }

    #[test]
    fn converges_under_jitter_and_spikes() {
        let mut rng = Rng(0x5eed_1234_abcd_0001);
        let dev = SimDevice { offset_ns: 250 * MS, drift_ppm: 0.0, epoch: 0 };
        let mut s = sync(config());

        let mut t = 10_000 * MS;
        for _ in 0..200 {
            let mut up = 4 * MS + rng.range(-500 * US, 500 * US);
            let mut down = 4 * MS + rng.range(-500 * US, 500 * US);
            if rng.chance(15) {
                // queueing spike in one direction only
                if rng.chance(50) {
                    up += rng.range(30 * MS, 120 * MS);
                } else {
                    down += rng.range(30 * MS, 120 * MS);
                }
            }
            let (a, b, c, d) = dev.exchange(t, up, down, 200 * US);
            s.record_exchange(a, b, c, d);
            t += 500 * MS;
        }

        let err = (s.estimate_ns().unwrap() - dev.true_offset(t)).abs();
        assert!(err < MS, "estimate off by {}us", err / US);
        assert_eq!(s.status(), SyncStatus::Synchronized);
        assert!(s.snapshot().rejected > 0, "spikes should have been gated");
    }

    #[test]
    fn asymmetric_delay_bias_matches_error_model() {
        let dev = SimDevice { offset_ns: -80 * MS, drift_ppm: 0.0, epoch: 0 };
        let mut s = sync(config());

        let up = 55 * MS;
        let down = 5 * MS;
        let mut t = 0;
        for _ in 0..40 {
            let (a, b, c, d) = dev.exchange(t, up, down, 100 * US);
            s.record_exchange(a, b, c, d);
            t += 500 * MS;
        }

        let bias = s.estimate_ns().unwrap() - dev.true_offset(t);
        let predicted = (up - down) / 2;
        let rtt = up + down;
        assert!((bias - predicted).abs() < 100 * US, "bias {}us", bias / US);
        assert!(bias.abs() <= rtt / 2);
    }

    #[test]
    fn drift_is_recovered() {
        let dev = SimDevice { offset_ns: 5 * MS, drift_ppm: 50.0, epoch: 0 };
        let mut s = sync(config());

        let mut t = 0;
        for _ in 0..20 {
            let (a, b, c, d) = dev.exchange(t, 3 * MS, 3 * MS, 100 * US);
            s.record_exchange(a, b, c, d);
            t += 2_000 * MS;
        }

        let drift = s.quality().drift_ppm;
        assert!((drift - 50.0).abs() < 1.0, "drift {}ppm", drift);
    }

    #[test]
    fn unsynchronized_after_consecutive_failures_then_recovers() {
        let mut s = sync(config());
        let dev = SimDevice { offset_ns: MS, drift_ppm: 0.0, epoch: 0 };

        for _ in 0..config().max_failed_attempts {
            s.record_timeout();
        }
        assert_eq!(s.status(), SyncStatus::Unsynchronized);
        assert_eq!(s.snapshot().timeouts, 5);

        // one accepted sample clears the failure run
        let (a, b, c, d) = dev.exchange(0, 2 * MS, 2 * MS, 0);
        assert!(s.record_exchange(a, b, c, d).accepted);
        assert_ne!(s.status(), SyncStatus::Unsynchronized);
        assert_eq!(s.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn high_residual_marks_degraded_and_shortens_interval() {
        let mut s = sync(config());

        for i in 0..12 {
            let t0 = i * 500 * MS;
            let off = if i % 2 == 0 { 8 * MS } else { -8 * MS };
            // constant 4ms round trip, alternating offset
            let t1 = t0 + 2 * MS + off;
            let t2 = t1 + 100 * US;
            let t3 = t0 + 2 * MS + 100 * US + 2 * MS;
            assert!(s.record_exchange(t0, t1, t2, t3).accepted);
        }

        assert_eq!(s.status(), SyncStatus::Degraded);
        assert_eq!(s.next_interval(), config().degraded_interval());
        assert!(s.snapshot().rms_us > config().rms_threshold_us as f64);
    }

    #[test]
    fn step_correction_waits_for_threshold() {
        let mut s = sync(config());
        let mut dev = SimDevice { offset_ns: 10 * MS, drift_ppm: 0.0, epoch: 0 };

        let mut t = 0;
        for _ in 0..6 {
            let (a, b, c, d) = dev.exchange(t, 2 * MS, 2 * MS, 0);
            s.record_exchange(a, b, c, d);
            t += 500 * MS;
        }
        let applied = s.snapshot().offset_ns;
        assert_eq!(applied, 10 * MS);

        // 400us move is below the 1ms step threshold
        dev.offset_ns += 400 * US;
        for _ in 0..10 {
            let (a, b, c, d) = dev.exchange(t, 2 * MS, 2 * MS, 0);
            s.record_exchange(a, b, c, d);
            t += 500 * MS;
        }
        assert_eq!(s.snapshot().offset_ns, applied);
        assert_eq!(s.snapshot().steps, 0);

        dev.offset_ns += 5 * MS;
        for _ in 0..10 {
            let (a, b, c, d) = dev.exchange(t, 2 * MS, 2 * MS, 0);
            s.record_exchange(a, b, c, d);
            t += 500 * MS;
        }
        let snap = s.snapshot();
        assert!(snap.steps >= 1);
        assert!((snap.offset_ns - dev.offset_ns).abs() < 1_500 * US);
    }

    #[test]
    fn continuous_mapping_extrapolates_drift() {
        let mut cfg = config();
        cfg.correction = ClockCorrection::Continuous;
        let mut s = sync(cfg);
        let dev = SimDevice { offset_ns: 2 * MS, drift_ppm: 100.0, epoch: 0 };

        let mut t = 0;
        for _ in 0..10 {
            let (a, b, c, d) = dev.exchange(t, MS, MS, 0);
            s.record_exchange(a, b, c, d);
            t += 1_000 * MS;
        }

        let snap = s.snapshot();
        let future = t + 10_000 * MS;
        let mapped = snap.to_device(future);
        let err = (mapped - dev.clock(future)).abs();
        assert!(err < 50 * US, "mapping off by {}us", err / US);
    }

    #[test]
    fn mapping_round_trips() {
        let snap = SyncSnapshot {
            offset_ns: 123 * MS,
            drift_ppm: 20.0,
            anchor_ns: 1_000 * MS,
            ..SyncSnapshot::pending(ClockCorrection::Continuous)
        };
        let reference = 50_000 * MS;
        let device = snap.to_device(reference);
        assert!((snap.to_reference(device) - reference).abs() <= 1);

        let step = SyncSnapshot {
            offset_ns: -7 * MS,
            ..SyncSnapshot::pending(ClockCorrection::Step)
        };
        assert_eq!(step.to_device(100 * MS), 93 * MS);
        assert_eq!(step.to_reference(93 * MS), 100 * MS);
    }

    #[test]
    fn downgrade_ordering() {
        assert!(SyncStatus::Degraded.is_downgrade_from(SyncStatus::Synchronized));
        assert!(SyncStatus::Unsynchronized.is_downgrade_from(SyncStatus::Pending));
        assert!(!SyncStatus::Synchronized.is_downgrade_from(SyncStatus::Degraded));
        assert!(!SyncStatus::Pending.is_downgrade_from(SyncStatus::Synchronized));
    }
}
