//! Process-local counters, exposed as plain text on the health listener.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub batches_applied: AtomicU64,
    pub hydrations_completed: AtomicU64,
    pub reconnects: AtomicU64,
    pub sink_items_rejected: AtomicU64,
    pub clients_connected: AtomicU64,
    pub slow_consumer_kills: AtomicU64,
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn decr(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Render in the conventional line-oriented exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, value) in [
            ("relay_batches_applied_total", &self.batches_applied),
            ("relay_hydrations_completed_total", &self.hydrations_completed),
            ("relay_reconnects_total", &self.reconnects),
            ("relay_sink_items_rejected_total", &self.sink_items_rejected),
            ("relay_clients_connected", &self.clients_connected),
            ("relay_slow_consumer_kills_total", &self.slow_consumer_kills),
        ] {
            out.push_str(name);
            out.push(' ');
            out.push_str(&Self::get(value).to_string());
            out.push('\n');
        }
        out
    }
}
