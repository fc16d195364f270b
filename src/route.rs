//! Sentence routes with backup/failover semantics.
//!
//! A route binds one prefix pattern to a set of target endpoints. Routes
//! flagged `backup` defer to their backup sources: the non-backup routes
//! carrying the same prefix. A backup stays silent while any of its sources
//! has written within the backup's own expire window, and starts forwarding
//! the moment all of them have been silent longer than that. The check runs
//! lazily on every delivery attempt; there is no background timer.

use crate::prefix::NmeaPrefix;
use crate::registry::Registry;
use crate::stats::monotonic_ms;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Default primary-staleness window in milliseconds.
pub const DEFAULT_EXPIRE_MS: u64 = 1500;

pub struct Route {
    prefix: NmeaPrefix,
    targets: Vec<String>,
    backup: bool,
    expire_ms: u64,
    /// Monotonic ms of the last full delivery, 0 = never.
    last_wrote: AtomicU64,
    /// Non-backup routes with the same prefix; set once when resolution
    /// completes. Empty (or unset) means deliver unconditionally.
    backup_sources: OnceLock<Vec<Arc<Route>>>,
    delivered: AtomicU64,
    suppressed: AtomicU64,
}

impl Route {
    pub fn new(prefix: &str, targets: Vec<String>, backup: bool, expire_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            prefix: NmeaPrefix::new(prefix),
            targets,
            backup,
            expire_ms,
            last_wrote: AtomicU64::new(0),
            backup_sources: OnceLock::new(),
            delivered: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        })
    }

    pub fn prefix(&self) -> &NmeaPrefix {
        &self.prefix
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn is_backup(&self) -> bool {
        self.backup
    }

    pub fn expire_ms(&self) -> u64 {
        self.expire_ms
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Wire this backup route to its primaries. Later calls are ignored.
    pub fn set_backup_sources(&self, sources: Vec<Arc<Route>>) {
        let _ = self.backup_sources.set(sources);
    }

    /// Monotonic ms of the last full delivery, 0 = never.
    pub fn last_wrote(&self) -> u64 {
        self.last_wrote.load(Ordering::Relaxed)
    }

    /// Whether this route has delivered within its own expire window.
    pub fn is_active(&self) -> bool {
        let last = self.last_wrote();
        last != 0 && monotonic_ms().saturating_sub(last) < self.expire_ms
    }

    /// The failover gate: true unless some backup source has written
    /// within this route's expire window. The silence threshold is the
    /// backup's own `expire_ms`, whatever the sources' windows are.
    pub fn can_write(&self) -> bool {
        match self.backup_sources.get() {
            None => true,
            Some(sources) => {
                let now = monotonic_ms();
                !sources.iter().any(|s| {
                    let last = s.last_wrote();
                    last != 0 && now.saturating_sub(last) < self.expire_ms
                })
            }
        }
    }

    /// Deliver a fully validated sentence.
    ///
    /// `frame` is the complete sentence; `tail` is the not-yet-forwarded
    /// remainder for targets that already received partial bytes (equal to
    /// `frame` when nothing was flushed early). Single-sink targets get the
    /// tail, everyone else the whole frame.
    pub fn write(&self, registry: &Registry, frame: &Bytes, tail: &Bytes) {
        if !self.can_write() {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.last_wrote.store(monotonic_ms(), Ordering::Relaxed);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        for target in &self.targets {
            if let Some(handle) = registry.target(target) {
                if handle.single_sink() {
                    handle.deliver(tail.clone());
                } else {
                    handle.deliver(frame.clone());
                }
            }
        }
    }

    /// Deliver bytes of a sentence that is still being validated.
    ///
    /// Only single-sink targets receive partial data; a lone downstream
    /// consumer tolerates an aborted fragment, shared targets must not.
    /// Returns true when at least one target accepted the chunk.
    pub fn write_partial(&self, registry: &Registry, chunk: &Bytes) -> bool {
        if !self.can_write() {
            return false;
        }
        let mut any = false;
        for target in &self.targets {
            if let Some(handle) = registry.target(target) {
                if handle.single_sink() {
                    handle.deliver(chunk.clone());
                    any = true;
                }
            }
        }
        any
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("prefix", &self.prefix)
            .field("targets", &self.targets)
            .field("backup", &self.backup)
            .field("expire_ms", &self.expire_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_non_backup_always_writes() {
        let registry = Registry::new();
        let route = Route::new("$GPRMC", vec![], false, DEFAULT_EXPIRE_MS);
        assert!(route.can_write());
        let frame = Bytes::from_static(b"$GPRMC,1*00\r\n");
        route.write(&registry, &frame, &frame);
        assert_eq!(route.delivered(), 1);
        assert!(route.is_active());
    }

    #[test]
    fn test_backup_defers_to_active_primary() {
        let registry = Registry::new();
        let primary = Route::new("$GPRMC", vec![], false, 100);
        let backup = Route::new("$GPRMC", vec![], true, 100);
        backup.set_backup_sources(vec![primary.clone()]);

        // primary never wrote: backup forwards
        assert!(backup.can_write());

        let frame = Bytes::from_static(b"$GPRMC,1*00\r\n");
        primary.write(&registry, &frame, &frame);
        assert!(!backup.can_write());

        backup.write(&registry, &frame, &frame);
        assert_eq!(backup.delivered(), 0);
        assert_eq!(backup.suppressed(), 1);

        // primary goes silent past its expire window
        std::thread::sleep(Duration::from_millis(120));
        assert!(backup.can_write());
        backup.write(&registry, &frame, &frame);
        assert_eq!(backup.delivered(), 1);
    }

    #[test]
    fn test_backup_stays_silent_while_primary_refreshes() {
        let registry = Registry::new();
        let primary = Route::new("$HCHDG", vec![], false, 150);
        let backup = Route::new("$HCHDG", vec![], true, 150);
        backup.set_backup_sources(vec![primary.clone()]);
        let frame = Bytes::from_static(b"$HCHDG,1*00\r\n");
        for _ in 0..5 {
            primary.write(&registry, &frame, &frame);
            std::thread::sleep(Duration::from_millis(20));
            assert!(!backup.can_write());
        }
    }

    #[test]
    fn test_gate_uses_backup_window_not_source_window() {
        let registry = Registry::new();
        // the primary expires almost immediately by its own measure; the
        // backup still waits out its own, much longer window
        let primary = Route::new("$GPRMC", vec![], false, 50);
        let backup = Route::new("$GPRMC", vec![], true, 10_000);
        backup.set_backup_sources(vec![primary.clone()]);
        let frame = Bytes::from_static(b"$GPRMC,1*00\r\n");

        primary.write(&registry, &frame, &frame);
        std::thread::sleep(Duration::from_millis(100));
        assert!(!primary.is_active());
        assert!(!backup.can_write());
    }

    #[test]
    fn test_partial_suppressed_for_silent_backup() {
        let registry = Registry::new();
        let primary = Route::new("$SDDBT", vec![], false, 10_000);
        let backup = Route::new("$SDDBT", vec![], true, 10_000);
        backup.set_backup_sources(vec![primary.clone()]);
        let frame = Bytes::from_static(b"$SDDBT,1");
        primary.write(&registry, &frame, &frame);
        assert!(!backup.write_partial(&registry, &frame));
    }
}
