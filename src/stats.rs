//! Per-endpoint traffic and matcher counters.
//!
//! Counters are plain atomics so the reader/writer tasks update them
//! without locks and the operator console reads consistent-enough values
//! for its `statistics` and `errors` tables.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Read/write counts and byte totals for one endpoint.
#[derive(Debug, Default)]
pub struct EndpointStats {
    read_count: AtomicU64,
    read_bytes: AtomicU64,
    write_count: AtomicU64,
    write_bytes: AtomicU64,
    /// Writes dropped because the endpoint's queue was full.
    write_drops: AtomicU64,
}

impl EndpointStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_read(&self, bytes: usize) {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        self.read_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: usize) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.write_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.write_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    pub fn write_bytes(&self) -> u64 {
        self.write_bytes.load(Ordering::Relaxed)
    }

    pub fn write_drops(&self) -> u64 {
        self.write_drops.load(Ordering::Relaxed)
    }

    /// Mean read size, `None` before the first read.
    pub fn read_mean(&self) -> Option<u64> {
        let count = self.read_count();
        (count > 0).then(|| self.read_bytes() / count)
    }

    /// Mean write size, `None` before the first write.
    pub fn write_mean(&self) -> Option<u64> {
        let count = self.write_count();
        (count > 0).then(|| self.write_bytes() / count)
    }
}

/// Match/error totals for one endpoint's matcher.
///
/// Shared across matcher rebuilds (resolution matcher, full matcher) so the
/// operator sees one continuous series per endpoint.
#[derive(Debug, Default)]
pub struct MatcherCounters {
    matches: AtomicU64,
    errors: AtomicU64,
}

impl MatcherCounters {
    pub fn add_match(&self) {
        self.matches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn matches(&self) -> u64 {
        self.matches.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Errors as a percentage of matches, 0 before the first match.
    pub fn error_percent(&self) -> f64 {
        let matches = self.matches();
        if matches == 0 {
            return 0.0;
        }
        100.0 * self.errors() as f64 / matches as f64
    }
}

/// Milliseconds on a process-local monotonic clock, never 0.
///
/// Used for route freshness comparisons; 0 is reserved for "never".
pub fn monotonic_ms() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static BASE: OnceLock<Instant> = OnceLock::new();
    let base = BASE.get_or_init(Instant::now);
    base.elapsed().as_millis() as u64 + 1
}
