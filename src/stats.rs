//! Relay telemetry: global counters plus per-endpoint byte accounting.
//!
//! Everything here is best-effort observability, never correctness-critical.
//! Each engine owns one `RelayStats`; flow tasks register an endpoint counter
//! at setup, bump it during the relay, and purge it at cleanup.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RelayStats {
    started: Instant,
    total_bytes: AtomicU64,
    total_requests: AtomicU64,
    active_requests: AtomicI64,
    per_addr: DashMap<SocketAddr, Arc<AtomicU64>>,
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total_bytes: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            active_requests: AtomicI64::new(0),
            per_addr: DashMap::new(),
        }
    }

    /// Register (or fetch) the cumulative byte counter for an endpoint.
    pub fn register(&self, addr: SocketAddr) -> Arc<AtomicU64> {
        self.per_addr
            .entry(addr)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    /// Drop an endpoint's counter. Called from flow cleanup.
    pub fn unregister(&self, addr: &SocketAddr) {
        self.per_addr.remove(addr);
    }

    pub fn bytes_for(&self, addr: &SocketAddr) -> u64 {
        self.per_addr
            .get(addr)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn is_tracked(&self, addr: &SocketAddr) -> bool {
        self.per_addr.contains_key(addr)
    }

    #[inline]
    pub fn add_bytes(&self, n: u64) {
        self.total_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn open_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn close_request(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn active_requests(&self) -> i64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Truncate to whole seconds so humantime renders "5m 12s" instead of a
/// nanosecond tail.
pub(crate) fn whole_secs(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs())
}

/// Render a byte count in binary units, one decimal place: "512 B",
/// "1.5 KiB", "2.0 MiB".
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    const UNITS: [&str; 6] = ["KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
