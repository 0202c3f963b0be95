//! Process-wide counters, following the teacher's pattern of one
//! atomic per counter plus a `Default` that delegates to `new()`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

pub struct Metrics {
    pub connections_accepted: AtomicU64,
    pub messages_dispatched: AtomicU64,
    pub bad_responses: AtomicU64,
    pub sections_held: AtomicUsize,
    pub start_time: SystemTime,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            messages_dispatched: AtomicU64::new(0),
            bad_responses: AtomicU64::new(0),
            sections_held: AtomicUsize::new(0),
            start_time: SystemTime::now(),
        }
    }

    pub fn record_connection(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self, was_bad: bool) {
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
        if was_bad {
            self.bad_responses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_section_held(&self) {
        self.sections_held.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_section_released(&self) {
        self.sections_held.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    /// One-line summary logged on shutdown.
    pub fn summary(&self) -> String {
        format!(
            "uptime={}s connections={} messages={} bad_responses={} sections_held={}",
            self.uptime_secs(),
            self.connections_accepted.load(Ordering::Relaxed),
            self.messages_dispatched.load(Ordering::Relaxed),
            self.bad_responses.load(Ordering::Relaxed),
            self.sections_held.load(Ordering::Relaxed),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
