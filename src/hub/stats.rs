//! Per-client traffic statistics
//!
//! Each client keeps a running record of message sizes and inter-message
//! intervals in both directions, plus a counter of messages the hub dropped
//! because the client's outbox was full.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Running count, mean, variance and range (Welford's method)
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        if self.count == 1 {
            self.min = x;
            self.max = x;
        } else {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }

        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance; zero until two values have been seen
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn report(&self) -> RunningReport {
        RunningReport {
            count: self.count,
            min: self.min,
            max: self.max,
            mean: self.mean,
            std_dev: self.std_dev(),
            variance: self.variance(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunningReport {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub variance: f64,
}

/// One direction of traffic
#[derive(Debug, Default)]
struct Direction {
    last: Option<Instant>,
    bytes_total: u64,
    /// Message size in bytes
    size: RunningStats,
    /// Seconds since the previous message
    dt: RunningStats,
}

impl Direction {
    fn record(&mut self, len: usize, now: Instant) {
        if let Some(last) = self.last {
            self.dt.push(now.saturating_duration_since(last).as_secs_f64());
        }
        self.last = Some(now);
        self.bytes_total += len as u64;
        self.size.push(len as f64);
    }

    fn report(&self, now: Instant) -> DirectionReport {
        DirectionReport {
            messages: self.size.count(),
            bytes: self.bytes_total,
            idle_secs: self
                .last
                .map(|last| now.saturating_duration_since(last).as_secs_f64()),
            size: self.size.report(),
            dt: self.dt.report(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectionReport {
    pub messages: u64,
    pub bytes: u64,
    /// Seconds since the last message, if any
    pub idle_secs: Option<f64>,
    pub size: RunningReport,
    pub dt: RunningReport,
}

#[derive(Debug, Default)]
struct Traffic {
    rx: Direction,
    tx: Direction,
}

/// Shared statistics for one client
///
/// Written by the client's owner (rx/tx) and by the hub (drops).
#[derive(Debug)]
pub struct ClientStats {
    connected: Instant,
    connected_unix_ms: u64,
    traffic: Mutex<Traffic>,
    dropped: AtomicU64,
}

impl Default for ClientStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientStats {
    pub fn new() -> Self {
        let connected_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        Self {
            connected: Instant::now(),
            connected_unix_ms,
            traffic: Mutex::new(Traffic::default()),
            dropped: AtomicU64::new(0),
        }
    }

    /// A message was taken off the outbox
    pub fn record_rx(&self, len: usize) {
        self.traffic.lock().rx.record(len, Instant::now());
    }

    /// A message was published by this client
    pub fn record_tx(&self, len: usize) {
        self.traffic.lock().tx.record(len, Instant::now());
    }

    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> StatsReport {
        let now = Instant::now();
        let traffic = self.traffic.lock();

        StatsReport {
            connected_unix_ms: self.connected_unix_ms,
            uptime_secs: now.saturating_duration_since(self.connected).as_secs_f64(),
            rx: traffic.rx.report(now),
            tx: traffic.tx.report(now),
            dropped: self.dropped(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    pub connected_unix_ms: u64,
    pub uptime_secs: f64,
    pub rx: DirectionReport,
    pub tx: DirectionReport,
    pub dropped: u64,
}
