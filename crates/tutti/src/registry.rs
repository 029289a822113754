//! Device registry: the single table of known devices.
//!
//! Backed by a `DashMap` so connection tasks can refresh liveness without
//! going through the controller. State transitions (stale, active,
//! disconnected) are driven by the controller.
//!
//! Records are never removed. A device that times out leaves the active view
//! but keeps its history for session reports.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tuttiproto::{Capability, DeviceId, StatusPayload};

use crate::clock::{SyncSnapshot, SyncStatus};

/// Connection state of a device as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unknown,
    /// Hello received, handshake not yet acknowledged
    Connecting,
    Active,
    /// Silent past the heartbeat timeout; connection still open
    Stale,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Unknown => "unknown",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::Stale => "stale",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

/// What `register` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First hello ever seen from this id
    New,
    /// Known device coming back after a disconnect or timeout
    Rejoined,
    /// Hello from a device that was already connected (superseding connection)
    Refreshed,
}

/// Everything the controller knows about one device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub capabilities: BTreeSet<Capability>,
    pub protocol_version: u32,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(skip)]
    pub last_seen_at: Instant,
    /// Number of accepted hellos
    pub connections: u32,
    /// Sessions this device participated in, oldest first
    pub sessions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    fn new(id: DeviceId, capabilities: BTreeSet<Capability>, protocol_version: u32) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: None,
            capabilities,
            protocol_version,
            state: ConnectionState::Connecting,
            peer: None,
            first_seen: now,
            last_seen: now,
            last_seen_at: Instant::now(),
            connections: 1,
            sessions: Vec::new(),
            status: None,
            sync: None,
            disconnected_at: None,
        }
    }

    pub fn has_capability(&self, cap: &Capability) -> bool {
        self.capabilities.contains(cap)
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.sync
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(SyncStatus::Pending)
    }
}

/// Counts by connection state, for `/health`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub connecting: usize,
    pub active: usize,
    pub stale: usize,
    pub disconnected: usize,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: DashMap<DeviceId, DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device from its hello. Idempotent: a repeat registration
    /// refreshes capabilities and puts the device back into `Connecting`.
    pub fn register(
        &self,
        id: &DeviceId,
        capabilities: impl IntoIterator<Item = Capability>,
        protocol_version: u32,
    ) -> Registration {
        let capabilities: BTreeSet<Capability> = capabilities.into_iter().collect();

        if let Some(mut record) = self.devices.get_mut(id) {
            let outcome = match record.state {
                ConnectionState::Active | ConnectionState::Connecting => Registration::Refreshed,
                _ => Registration::Rejoined,
            };
            if record.capabilities != capabilities {
                info!(device_id = %id, "capabilities changed: {:?}", capabilities);
            }
            record.capabilities = capabilities;
            record.protocol_version = protocol_version;
            record.state = ConnectionState::Connecting;
            record.connections += 1;
            record.last_seen = Utc::now();
            record.last_seen_at = Instant::now();
            record.disconnected_at = None;
            info!(device_id = %id, connections = record.connections, "device re-registered ({:?})", outcome);
            return outcome;
        }

        info!(device_id = %id, "📱 device registered with {:?}", capabilities);
        self.devices
            .insert(id.clone(), DeviceRecord::new(id.clone(), capabilities, protocol_version));
        Registration::New
    }

    /// Attach descriptive fields that don't affect coordination.
    pub fn describe(&self, id: &DeviceId, name: Option<String>, peer: Option<String>) {
        if let Some(mut record) = self.devices.get_mut(id) {
            if name.is_some() {
                record.name = name;
            }
            if peer.is_some() {
                record.peer = peer;
            }
        }
    }

    pub fn lookup(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.devices.get(id).map(|r| r.clone())
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    /// Active devices advertising `cap`, sorted by id.
    pub fn list_by_capability(&self, cap: &Capability) -> Vec<DeviceRecord> {
        let mut out: Vec<DeviceRecord> = self
            .devices
            .iter()
            .filter(|r| r.state == ConnectionState::Active && r.has_capability(cap))
            .map(|r| r.clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Returns true if the device moved from active to stale.
    pub fn mark_stale(&self, id: &DeviceId) -> bool {
        match self.devices.get_mut(id) {
            Some(mut record) if record.state == ConnectionState::Active => {
                record.state = ConnectionState::Stale;
                warn!(device_id = %id, "device is stale (no traffic since {})", record.last_seen);
                true
            }
            _ => false,
        }
    }

    /// Returns true if the state changed.
    pub fn mark_active(&self, id: &DeviceId) -> bool {
        match self.devices.get_mut(id) {
            Some(mut record) if record.state != ConnectionState::Active => {
                let was = record.state;
                record.state = ConnectionState::Active;
                record.last_seen = Utc::now();
                record.last_seen_at = Instant::now();
                if was == ConnectionState::Stale {
                    info!(device_id = %id, "device revived");
                } else {
                    debug!(device_id = %id, "device active");
                }
                true
            }
            _ => false,
        }
    }

    /// Returns true if the state changed.
    pub fn mark_disconnected(&self, id: &DeviceId) -> bool {
        match self.devices.get_mut(id) {
            Some(mut record) if record.state != ConnectionState::Disconnected => {
                record.state = ConnectionState::Disconnected;
                record.disconnected_at = Some(Utc::now());
                info!(device_id = %id, "device disconnected");
                true
            }
            _ => false,
        }
    }

    /// Refresh last-seen. Returns the device's current state.
    pub fn touch(&self, id: &DeviceId) -> Option<ConnectionState> {
        self.devices.get_mut(id).map(|mut record| {
            record.last_seen = Utc::now();
            record.last_seen_at = Instant::now();
            record.state
        })
    }

    /// Store the latest sync snapshot. Returns the previous sync status.
    pub fn record_sync(&self, id: &DeviceId, snapshot: SyncSnapshot) -> Option<SyncStatus> {
        self.devices.get_mut(id).map(|mut record| {
            let previous = record.sync_status();
            record.sync = Some(snapshot);
            previous
        })
    }

    pub fn record_status(&self, id: &DeviceId, status: StatusPayload) {
        if let Some(mut record) = self.devices.get_mut(id) {
            record.status = Some(status);
        }
    }

    /// Note a session in the device's history.
    pub fn note_session(&self, id: &DeviceId, session_id: &str) {
        if let Some(mut record) = self.devices.get_mut(id) {
            if record.sessions.last().map(String::as_str) != Some(session_id) {
                record.sessions.push(session_id.to_string());
            }
        }
    }

    /// Devices in the active view, sorted by id.
    pub fn active(&self) -> Vec<DeviceRecord> {
        let mut out: Vec<DeviceRecord> = self
            .devices
            .iter()
            .filter(|r| r.state == ConnectionState::Active)
            .map(|r| r.clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Every device ever seen, sorted by id.
    pub fn all(&self) -> Vec<DeviceRecord> {
        let mut out: Vec<DeviceRecord> = self.devices.iter().map(|r| r.clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Mark active devices silent for longer than `timeout` as stale.
    /// Returns the ids that changed.
    pub fn sweep(&self, now: Instant, timeout: Duration) -> Vec<DeviceId> {
        let mut changed = Vec::new();
        for mut record in self.devices.iter_mut() {
            if record.state == ConnectionState::Active
                && now.saturating_duration_since(record.last_seen_at) > timeout
            {
                record.state = ConnectionState::Stale;
                warn!(device_id = %record.id, "device swept to stale");
                changed.push(record.id.clone());
            }
        }
        changed.sort();
        changed
    }

    pub fn summary(&self) -> RegistrySummary {
        let mut summary = RegistrySummary::default();
        for record in self.devices.iter() {
            summary.total += 1;
            match record.state {
                ConnectionState::Connecting => summary.connecting += 1,
                ConnectionState::Active => summary.active += 1,
                ConnectionState::Stale => summary.stale += 1,
                ConnectionState::Disconnected => summary.disconnected += 1,
                ConnectionState::Unknown => {}
            }
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> DeviceId {
        DeviceId::from(s)
    }

    fn active(registry: &DeviceRegistry, name: &str, caps: &[Capability]) {
        registry.register(&id(name), caps.iter().cloned(), 1);
        registry.mark_active(&id(name));
    }

    #[test]
    fn register_is_idempotent() {
        let registry = DeviceRegistry::new();
        assert_eq!(registry.register(&id("a"), [Capability::Camera], 1), Registration::New);
        assert_eq!(
            registry.register(&id("a"), [Capability::Camera, Capability::Gsr], 1),
            Registration::Refreshed
        );
        assert_eq!(registry.len(), 1);

        let record = registry.lookup(&id("a")).unwrap();
        assert!(record.has_capability(&Capability::Gsr));
        assert_eq!(record.connections, 2);
        assert_eq!(record.state, ConnectionState::Connecting);
    }

    #[test]
    fn rejoin_after_disconnect_keeps_history() {
        let registry = DeviceRegistry::new();
        active(&registry, "a", &[Capability::Thermal]);
        registry.note_session(&id("a"), "session-1");
        assert!(registry.mark_disconnected(&id("a")));
        assert!(registry.active().is_empty());
        assert_eq!(registry.all().len(), 1);

        assert_eq!(registry.register(&id("a"), [Capability::Thermal], 1), Registration::Rejoined);
        let record = registry.lookup(&id("a")).unwrap();
        assert_eq!(record.sessions, vec!["session-1".to_string()]);
        assert!(record.disconnected_at.is_none());
    }

    #[test]
    fn list_by_capability_only_returns_active() {
        let registry = DeviceRegistry::new();
        active(&registry, "cam-2", &[Capability::Camera]);
        active(&registry, "cam-1", &[Capability::Camera, Capability::Gsr]);
        active(&registry, "thermal", &[Capability::Thermal]);
        registry.mark_stale(&id("cam-2"));

        let cams = registry.list_by_capability(&Capability::Camera);
        assert_eq!(cams.len(), 1);
        assert_eq!(cams[0].id, id("cam-1"));
    }

    #[test]
    fn stale_only_from_active_and_revives() {
        let registry = DeviceRegistry::new();
        registry.register(&id("a"), [Capability::Audio], 1);
        assert!(!registry.mark_stale(&id("a")), "connecting device can't go stale");

        registry.mark_active(&id("a"));
        assert!(registry.mark_stale(&id("a")));
        assert!(!registry.mark_stale(&id("a")));
        assert_eq!(registry.touch(&id("a")), Some(ConnectionState::Stale));
        assert!(registry.mark_active(&id("a")));
        assert!(!registry.mark_stale(&id("missing")));
    }

    #[test]
    fn sweep_marks_silent_devices() {
        let registry = DeviceRegistry::new();
        active(&registry, "a", &[Capability::Imu]);
        active(&registry, "b", &[Capability::Imu]);

        let later = Instant::now() + Duration::from_secs(10);
        let swept = registry.sweep(later, Duration::from_secs(3));
        assert_eq!(swept, vec![id("a"), id("b")]);
        assert!(registry.sweep(later, Duration::from_secs(3)).is_empty());

        let summary = registry.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.stale, 2);
        assert_eq!(summary.active, 0);
    }

    #[test]
    fn note_session_does_not_duplicate() {
        let registry = DeviceRegistry::new();
        active(&registry, "a", &[Capability::Camera]);
        registry.note_session(&id("a"), "s1");
        registry.note_session(&id("a"), "s1");
        registry.note_session(&id("a"), "s2");
        assert_eq!(registry.lookup(&id("a")).unwrap().sessions, vec!["s1", "s2"]);
    }
}
