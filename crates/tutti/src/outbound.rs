//! Per-device outbound queue with priority shedding and in-flight tracking.
//!
//! The queue outlives any single connection: commands queued while a device
//! is away are delivered when it reconnects, unless they have aged past the
//! command TTL. Commands written but not yet acknowledged sit in the
//! in-flight table and are replayed (once) on reconnect under the same rule.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, warn};
use tuttiproto::{Body, CommandId, CommandPayload, DeviceId, Priority};

#[derive(Debug, Clone)]
struct Queued {
    body: Body,
    priority: Priority,
    enqueued_at: Instant,
}

#[derive(Debug, Clone)]
struct InFlight {
    command: CommandPayload,
    enqueued_at: Instant,
    sent_at: Instant,
}

/// Result of offering a message to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting an older, lower-or-equal priority message
    QueuedAfterShedding { shed: String },
    /// Queue full of higher-priority traffic; the offered message was dropped
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct OutboundStats {
    pub queued: usize,
    pub in_flight: usize,
    pub shed: u64,
    pub discarded: u64,
}

/// Pure queue logic; time is passed in.
#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    queue: VecDeque<Queued>,
    in_flight: BTreeMap<CommandId, InFlight>,
    shed: u64,
    discarded: u64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queue: VecDeque::new(),
            in_flight: BTreeMap::new(),
            shed: 0,
            discarded: 0,
        }
    }

    /// Offer a message. `Critical` traffic is always accepted, even over
    /// capacity. Otherwise a full queue evicts its oldest lowest-priority
    /// non-critical entry if that entry ranks no higher than the newcomer.
    pub fn push(&mut self, body: Body, now: Instant) -> PushOutcome {
        let priority = body.priority();
        let item = Queued {
            body,
            priority,
            enqueued_at: now,
        };

        if self.queue.len() < self.capacity {
            self.queue.push_back(item);
            return PushOutcome::Queued;
        }

        if let Some(idx) = self.shed_candidate() {
            if self.queue[idx].priority <= priority {
                let victim = self.queue.remove(idx);
                self.queue.push_back(item);
                self.shed += 1;
                let shed = victim.map(|v| v.body.kind().to_string()).unwrap_or_default();
                return PushOutcome::QueuedAfterShedding { shed };
            }
        }

        if priority == Priority::Critical {
            self.queue.push_back(item);
            PushOutcome::Queued
        } else {
            self.shed += 1;
            PushOutcome::Dropped
        }
    }

    /// Oldest entry of the lowest non-critical priority present.
    fn shed_candidate(&self) -> Option<usize> {
        let lowest = self
            .queue
            .iter()
            .map(|q| q.priority)
            .filter(|p| *p != Priority::Critical)
            .min()?;
        self.queue.iter().position(|q| q.priority == lowest)
    }

    /// Next message to write, in FIFO order. Commands move to the in-flight
    /// table until acknowledged.
    pub fn pop(&mut self, now: Instant) -> Option<Body> {
        let item = self.queue.pop_front()?;
        if let Body::Command(cmd) = &item.body {
            self.in_flight.insert(
                cmd.command_id,
                InFlight {
                    command: cmd.clone(),
                    enqueued_at: item.enqueued_at,
                    sent_at: now,
                },
            );
        }
        Some(item.body)
    }

    /// Returns how long the command was in flight, if it was.
    pub fn acknowledge(&mut self, command_id: CommandId, now: Instant) -> Option<Duration> {
        self.in_flight
            .remove(&command_id)
            .map(|f| now.saturating_duration_since(f.sent_at))
    }

    /// Prepare for a fresh connection. Commands (queued or in flight) older
    /// than `ttl` are discarded and returned; surviving in-flight commands
    /// are put back at the head of the queue for a single replay.
    pub fn reconnected(&mut self, now: Instant, ttl: Duration) -> Vec<CommandId> {
        let expired = |enqueued_at: Instant| now.saturating_duration_since(enqueued_at) > ttl;
        let mut discarded = Vec::new();

        let in_flight = std::mem::take(&mut self.in_flight);
        let mut replay = Vec::new();
        for (id, flight) in in_flight {
            if expired(flight.enqueued_at) {
                discarded.push(id);
            } else {
                replay.push(Queued {
                    body: Body::Command(flight.command),
                    priority: Priority::Critical,
                    enqueued_at: flight.enqueued_at,
                });
            }
        }

        self.queue.retain(|q| match &q.body {
            Body::Command(cmd) if expired(q.enqueued_at) => {
                discarded.push(cmd.command_id);
                false
            }
            _ => true,
        });

        for item in replay.into_iter().rev() {
            self.queue.push_front(item);
        }

        discarded.sort_unstable();
        self.discarded += discarded.len() as u64;
        discarded
    }

    /// Remove every queued and in-flight command belonging to `session_id`.
    pub fn purge_session(&mut self, session_id: &str) -> usize {
        let belongs = |cmd: &CommandPayload| cmd.session_id.as_deref() == Some(session_id);
        let before = self.queue.len() + self.in_flight.len();
        self.queue.retain(|q| !matches!(&q.body, Body::Command(cmd) if belongs(cmd)));
        self.in_flight.retain(|_, f| !belongs(&f.command));
        before - (self.queue.len() + self.in_flight.len())
    }

    /// Drop in-flight commands of a finished session; their acks no longer
    /// matter and they must not be replayed.
    pub fn forget_in_flight(&mut self, session_id: &str) -> usize {
        let before = self.in_flight.len();
        self.in_flight
            .retain(|_, f| f.command.session_id.as_deref() != Some(session_id));
        before - self.in_flight.len()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn in_flight(&self) -> Vec<CommandId> {
        self.in_flight.keys().copied().collect()
    }

    pub fn stats(&self) -> OutboundStats {
        OutboundStats {
            queued: self.queue.len(),
            in_flight: self.in_flight.len(),
            shed: self.shed,
            discarded: self.discarded,
        }
    }
}

/// Shared outbox for one device: the queue plus a wakeup for the writer.
#[derive(Debug)]
pub struct DeviceOutbox {
    device_id: DeviceId,
    queue: Mutex<OutboundQueue>,
    notify: Notify,
}

impl DeviceOutbox {
    pub fn new(device_id: DeviceId, capacity: usize) -> Self {
        Self {
            device_id,
            queue: Mutex::new(OutboundQueue::new(capacity)),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutboundQueue> {
        // A panic while holding the lock can't leave the queue half-updated
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn push(&self, body: Body) -> PushOutcome {
        let kind = body.kind().to_string();
        let outcome = self.lock().push(body, Instant::now());
        match &outcome {
            PushOutcome::Queued => {}
            PushOutcome::QueuedAfterShedding { shed } => {
                debug!(device_id = %self.device_id, "outbound full, shed {} for {}", shed, kind);
            }
            PushOutcome::Dropped => {
                warn!(device_id = %self.device_id, "outbound full, dropped {}", kind);
            }
        }
        if outcome != PushOutcome::Dropped {
            self.notify.notify_one();
        }
        outcome
    }

    pub fn pop(&self) -> Option<Body> {
        self.lock().pop(Instant::now())
    }

    pub fn acknowledge(&self, command_id: CommandId) -> Option<Duration> {
        self.lock().acknowledge(command_id, Instant::now())
    }

    pub fn reconnected(&self, ttl: Duration) -> Vec<CommandId> {
        let discarded = self.lock().reconnected(Instant::now(), ttl);
        if !discarded.is_empty() {
            warn!(
                device_id = %self.device_id,
                "discarded {} expired command(s) on reconnect: {:?}",
                discarded.len(),
                discarded
            );
        }
        self.notify.notify_one();
        discarded
    }

    pub fn purge_session(&self, session_id: &str) -> usize {
        self.lock().purge_session(session_id)
    }

    pub fn forget_in_flight(&self, session_id: &str) -> usize {
        self.lock().forget_in_flight(session_id)
    }

    /// Resolves when something was pushed since the last wakeup.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    pub fn stats(&self) -> OutboundStats {
        self.lock().stats()
    }
}
