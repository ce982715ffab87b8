//! Rolling per connector statistics, updated from connection open/close and
//! per message by the dispatcher.

use core::{cell::Cell, time::Duration};

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

/// counter group of one connector. shared across every worker serving it.
#[derive(Default)]
pub struct ConnectorStats {
    connections_opened: AtomicU64,
    connections_open: AtomicU64,
    connections_peak: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    duration: Mutex<Welford>,
    messages_per_connection: Mutex<Welford>,
}

impl ConnectorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// record an accepted connection. the peak gauge follows the open count.
    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        let open = self.connections_open.fetch_add(1, Ordering::Relaxed) + 1;
        self.connections_peak.fetch_max(open, Ordering::Relaxed);
    }

    /// record a closed (or upgraded away) connection with its lifetime and
    /// the count of messages it served.
    pub fn connection_closed(&self, duration: Duration, messages: u64) {
        self.connections_open.fetch_sub(1, Ordering::Relaxed);
        self.duration.lock().unwrap().record(duration.as_secs_f64());
        self.messages_per_connection.lock().unwrap().record(messages as f64);
    }

    pub fn message_in(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_out(&self) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    /// consistent-enough view of the counters for reporting.
    pub fn snapshot(&self) -> StatsSnapshot {
        let duration = self.duration.lock().unwrap().clone();
        let messages = self.messages_per_connection.lock().unwrap().clone();
        StatsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_open: self.connections_open.load(Ordering::Relaxed),
            connections_peak: self.connections_peak.load(Ordering::Relaxed),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            duration_mean: duration.mean(),
            duration_stddev: duration.stddev(),
            messages_mean: messages.mean(),
            messages_stddev: messages.stddev(),
        }
    }

    /// zero the rolling section. open connection gauges are left alone.
    pub fn reset(&self) {
        self.connections_opened.store(0, Ordering::Relaxed);
        self.connections_peak
            .store(self.connections_open.load(Ordering::Relaxed), Ordering::Relaxed);
        self.messages_in.store(0, Ordering::Relaxed);
        self.messages_out.store(0, Ordering::Relaxed);
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
        *self.duration.lock().unwrap() = Welford::default();
        *self.messages_per_connection.lock().unwrap() = Welford::default();
    }
}

/// per connection view on the shared counters. opening is recorded on
/// construction, closing with lifetime and message count on drop.
pub struct ConnectionGuard {
    stats: Arc<ConnectorStats>,
    start: Instant,
    messages: Cell<u64>,
}

impl ConnectionGuard {
    pub fn new(stats: Arc<ConnectorStats>) -> Self {
        stats.connection_opened();
        Self {
            stats,
            start: Instant::now(),
            messages: Cell::new(0),
        }
    }

    pub fn message_in(&self) {
        self.messages.set(self.messages.get() + 1);
        self.stats.message_in();
    }

    pub fn message_out(&self) {
        self.stats.message_out();
    }

    pub fn add_bytes(&self, bytes_in: u64, bytes_out: u64) {
        self.stats.add_bytes_in(bytes_in);
        self.stats.add_bytes_out(bytes_out);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.connection_closed(self.start.elapsed(), self.messages.get());
    }
}

#[derive(Clone, Debug)]
pub struct StatsSnapshot {
    pub connections_opened: u64,
    pub connections_open: u64,
    pub connections_peak: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub duration_mean: f64,
    pub duration_stddev: f64,
    pub messages_mean: f64,
    pub messages_stddev: f64,
}

// single pass mean/variance accumulator.
#[derive(Clone, Default)]
struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    fn record(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn mean(&self) -> f64 {
        self.mean
    }

    fn stddev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn welford_mean_stddev() {
        let mut w = Welford::default();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            w.record(v);
        }
        assert!((w.mean() - 5.0).abs() < 1e-9);
        // sample stddev of the classic data set.
        assert!((w.stddev() - 2.138089935299395).abs() < 1e-9);
    }

    #[test]
    fn peak_follows_open() {
        let stats = ConnectorStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed(Duration::from_secs(1), 3);
        stats.connection_opened();

        let snap = stats.snapshot();
        assert_eq!(snap.connections_opened, 3);
        assert_eq!(snap.connections_open, 2);
        assert_eq!(snap.connections_peak, 2);
        assert_eq!(snap.messages_mean, 3.0);
    }
}
