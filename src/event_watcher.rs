//! C6 — Event Watcher.
//!
//! Classifies `FailedScheduling` events by constraint kind, buffers them
//! with backpressure, applies a stabilization window, and tracks a
//! per-Pool cooldown so a just-scaled Pool isn't re-triggered immediately.
//! The buffer itself is a plain (non-async) data structure; the real
//! informer loop wraps one in a `tokio::sync::Mutex` and drives the 5s tick.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Hard cap on buffered events; pushing past this drops the oldest event.
pub const HARD_CAP: usize = 1000;
/// Soft target size — informational only, used for backpressure metrics.
pub const SOFT_TARGET: usize = 100;
pub const DEFAULT_STABILIZATION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Pods,
    Cpu,
    Memory,
    Taint,
    AntiAffinity,
    Affinity,
    Selector,
    Unknown,
}

/// Classifies a `FailedScheduling` message by the first matching pattern,
/// in the spec's fixed precedence order: pods > cpu > memory > taint >
/// anti-affinity > affinity > selector > unknown.
pub fn classify_message(message: &str) -> ConstraintKind {
    let m = message.to_lowercase();

    if m.contains("too many pods") || m.contains("max pods") {
        ConstraintKind::Pods
    } else if m.contains("insufficient cpu") {
        ConstraintKind::Cpu
    } else if m.contains("insufficient memory") {
        ConstraintKind::Memory
    } else if m.contains("taint") {
        ConstraintKind::Taint
    } else if m.contains("anti-affinity") {
        ConstraintKind::AntiAffinity
    } else if m.contains("affinity") {
        ConstraintKind::Affinity
    } else if m.contains("didn't match") || m.contains("node selector") || m.contains("selector") {
        ConstraintKind::Selector
    } else {
        ConstraintKind::Unknown
    }
}

#[derive(Debug, Clone)]
pub struct SchedulingEvent {
    pub pod_namespace: String,
    pub pod_name: String,
    pub ts: DateTime<Utc>,
    pub kind: ConstraintKind,
    pub raw_message: String,
}

#[derive(Debug, Default)]
pub struct EventBuffer {
    events: Vec<SchedulingEvent>,
    dropped_total: u64,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    /// Pushes an event, dropping the oldest if the hard cap is reached.
    /// Returns `true` if an existing event was dropped to make room.
    pub fn push(&mut self, event: SchedulingEvent) -> bool {
        let mut dropped = false;
        if self.events.len() >= HARD_CAP {
            self.events.remove(0);
            self.dropped_total += 1;
            dropped = true;
        }
        self.events.push(event);
        dropped
    }

    /// Atomically swaps the buffer out and returns events still within the
    /// stabilization window, discarding ones that have aged past it.
    pub fn drain_stable(&mut self, now: DateTime<Utc>, stabilization: Duration) -> Vec<SchedulingEvent> {
        let swapped = std::mem::take(&mut self.events);
        let window = chrono::Duration::from_std(stabilization).unwrap_or(chrono::Duration::seconds(60));
        swapped.into_iter().filter(|e| now - e.ts <= window).collect()
    }
}

/// Per-Pool cooldown tracking: a Pool that was just scaled is not
/// re-triggered until its stabilization window elapses.
#[derive(Debug, Default)]
pub struct CooldownMap(HashMap<String, DateTime<Utc>>);

impl CooldownMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cooling_down(&self, pool_name: &str, now: DateTime<Utc>, window: Duration) -> bool {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::seconds(60));
        self.0.get(pool_name).is_some_and(|triggered_at| now - *triggered_at < window)
    }

    pub fn mark_triggered(&mut self, pool_name: &str, now: DateTime<Utc>) {
        self.0.insert(pool_name.to_string(), now);
    }

    /// Drops entries older than `2 * window`, called periodically to bound
    /// map growth.
    pub fn sweep(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::seconds(60)) * 2;
        self.0.retain(|_, triggered_at| now - *triggered_at < cutoff);
    }
}
