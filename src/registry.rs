//! Shared endpoint and port registries.
//!
//! One coarse lock guards everything the main data path, the resolution
//! loop, the operator console and endpoint scripts all touch: the target
//! map, the target-to-sources map and the free-port pool. Mutations are
//! atomic with respect to each other; readers observe them at their next
//! access.

use crate::error::{Result, RouterError};
use crate::stats::{EndpointStats, MatcherCounters};
use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Capacity of the per-endpoint sentence tee used by scripts.
const WATCH_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Serial,
    Datagram,
    Broadcast,
    TcpListener,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EndpointKind::Serial => "serial",
            EndpointKind::Datagram => "datagram",
            EndpointKind::Broadcast => "broadcast",
            EndpointKind::TcpListener => "tcp-listener",
        };
        f.write_str(s)
    }
}

/// Shared face of one endpoint: the writer queue, counters, attach slot and
/// cancellation token. Cheap to clone; all state is behind `Arc`s.
#[derive(Clone)]
pub struct EndpointHandle {
    pub name: String,
    pub kind: EndpointKind,
    tx: mpsc::Sender<Bytes>,
    pub stats: Arc<EndpointStats>,
    pub counters: Arc<MatcherCounters>,
    /// True once the endpoint may carry traffic. Serial endpoints start
    /// false and flip on resolution; everything else is born matched.
    matched: Arc<AtomicBool>,
    single_sink: Arc<AtomicBool>,
    /// Console tee: while set, the endpoint's input bypasses matching and
    /// is forwarded verbatim to this sink.
    attach: Arc<Mutex<Option<mpsc::Sender<Bytes>>>>,
    /// Matched sentences, observed by the endpoint's script.
    pub watch: broadcast::Sender<Bytes>,
    pub cancel: CancellationToken,
    /// The physical port this endpoint resolved to, for display.
    pub port: Arc<Mutex<Option<String>>>,
}

impl EndpointHandle {
    pub fn new(name: impl Into<String>, kind: EndpointKind, tx: mpsc::Sender<Bytes>, cancel: CancellationToken) -> Self {
        let (watch, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            name: name.into(),
            kind,
            tx,
            stats: EndpointStats::new(),
            counters: Arc::new(MatcherCounters::default()),
            matched: Arc::new(AtomicBool::new(kind != EndpointKind::Serial)),
            single_sink: Arc::new(AtomicBool::new(false)),
            attach: Arc::new(Mutex::new(None)),
            watch,
            cancel,
            port: Arc::new(Mutex::new(None)),
        }
    }

    /// Queue bytes for the endpoint's writer. Unmatched endpoints drop
    /// silently, as do attached ones (the console owns the channel while
    /// the tee is in place); a full queue drops and counts.
    pub fn deliver(&self, bytes: Bytes) {
        if !self.is_matched() || self.is_attached() {
            return;
        }
        self.enqueue(bytes);
    }

    /// Queue bytes regardless of an attachment; the path for the console's
    /// own input while attached.
    pub fn deliver_direct(&self, bytes: Bytes) {
        if !self.is_matched() {
            return;
        }
        self.enqueue(bytes);
    }

    fn enqueue(&self, bytes: Bytes) {
        if self.tx.try_send(bytes).is_err() {
            self.stats.record_drop();
            trace!(endpoint = %self.name, "write queue full, dropping");
        }
    }

    pub fn is_matched(&self) -> bool {
        self.matched.load(Ordering::Relaxed)
    }

    pub fn set_matched(&self) {
        self.matched.store(true, Ordering::Relaxed);
    }

    pub fn single_sink(&self) -> bool {
        self.single_sink.load(Ordering::Relaxed)
    }

    pub(crate) fn set_single_sink(&self, v: bool) {
        self.single_sink.store(v, Ordering::Relaxed);
    }

    /// Install a console tee. At most one attachment per endpoint.
    pub fn attach_sink(&self, sink: mpsc::Sender<Bytes>) -> Result<()> {
        let mut slot = self.attach.lock();
        if slot.is_some() {
            return Err(RouterError::bad_input(format!(
                "{} is already attached",
                self.name
            )));
        }
        *slot = Some(sink);
        Ok(())
    }

    pub fn detach(&self) {
        *self.attach.lock() = None;
    }

    pub fn is_attached(&self) -> bool {
        self.attach.lock().is_some()
    }

    /// Current attachment, if any.
    pub fn attachment(&self) -> Option<mpsc::Sender<Bytes>> {
        self.attach.lock().clone()
    }
}

/// Outcome of a port claim attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum PortClaim {
    Claimed { port: String, from_last: bool },
    /// Free ports exist but this endpoint has tried them all; the caller
    /// should clear its tried set and retry from the full pool.
    Exhausted,
    /// Nothing to hand out right now.
    NoneFree,
}

#[derive(Default)]
struct Inner {
    targets: AHashMap<String, EndpointHandle>,
    /// target name -> endpoints whose routes feed it
    sources: AHashMap<String, AHashSet<String>>,
    port_pool: AHashSet<String>,
    port_count: usize,
    serial_total: usize,
    matched: AHashSet<String>,
    resolution_done: bool,
}

/// The lock-guarded registries shared by every task.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: EndpointHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.targets.contains_key(&handle.name) {
            return Err(RouterError::config(format!(
                "duplicate endpoint name '{}'",
                handle.name
            )));
        }
        inner.targets.insert(handle.name.clone(), handle);
        Ok(())
    }

    /// Remove an endpoint from every registry. Returns the removed handle.
    pub fn remove(&self, name: &str) -> Option<EndpointHandle> {
        let mut inner = self.inner.lock();
        let handle = inner.targets.remove(name);
        for set in inner.sources.values_mut() {
            set.remove(name);
        }
        inner.sources.remove(name);
        handle
    }

    pub fn target(&self, name: &str) -> Option<EndpointHandle> {
        self.inner.lock().targets.get(name).cloned()
    }

    /// All endpoints, sorted by name for stable console tables.
    pub fn all_targets(&self) -> Vec<EndpointHandle> {
        let inner = self.inner.lock();
        let mut v: Vec<_> = inner.targets.values().cloned().collect();
        v.sort_by(|a, b| a.name.cmp(&b.name));
        v
    }

    pub fn add_source(&self, target: &str, source: &str) {
        let mut inner = self.inner.lock();
        inner
            .sources
            .entry(target.to_string())
            .or_default()
            .insert(source.to_string());
    }

    /// Recompute which targets may receive partial sentences: exactly one
    /// endpoint feeds them and nothing downstream fans the bytes out.
    /// Datagram and broadcast targets are a shared medium, and a TCP
    /// listener repeats its stream to every connected client, so all of
    /// them only ever get complete, checksum-validated sentences.
    pub fn update_single_sinks(&self) {
        let inner = self.inner.lock();
        for (name, handle) in &inner.targets {
            let feeders = inner.sources.get(name).map_or(0, |s| s.len());
            let shared_medium = matches!(
                handle.kind,
                EndpointKind::Datagram | EndpointKind::Broadcast | EndpointKind::TcpListener
            );
            handle.set_single_sink(feeders == 1 && !shared_medium);
        }
    }

    pub fn seed_ports(&self, ports: impl IntoIterator<Item = String>) {
        let mut inner = self.inner.lock();
        inner.port_pool.extend(ports);
        inner.port_count = inner.port_pool.len();
    }

    pub fn set_serial_total(&self, n: usize) {
        self.inner.lock().serial_total = n;
    }

    pub fn free_ports(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut v: Vec<_> = inner.port_pool.iter().cloned().collect();
        v.sort();
        v
    }

    pub fn port_count(&self) -> usize {
        self.inner.lock().port_count
    }

    pub fn resolution_done(&self) -> bool {
        self.inner.lock().resolution_done
    }

    /// Hand out a free port for a resolution trial.
    ///
    /// The persisted last-known port is preferred when still free; otherwise
    /// any free port the endpoint has not tried yet. When every free port
    /// has been tried, the caller is told to start over.
    pub fn claim_port(&self, last: Option<&str>, tried: &AHashSet<String>) -> PortClaim {
        let mut inner = self.inner.lock();
        if inner.resolution_done {
            return PortClaim::NoneFree;
        }
        if let Some(last) = last {
            if inner.port_pool.remove(last) {
                return PortClaim::Claimed {
                    port: last.to_string(),
                    from_last: true,
                };
            }
        }
        if let Some(port) = inner
            .port_pool
            .iter()
            .find(|p| !tried.contains(*p))
            .cloned()
        {
            inner.port_pool.remove(&port);
            return PortClaim::Claimed {
                port,
                from_last: false,
            };
        }
        let reachable = inner.port_count.saturating_sub(inner.matched.len());
        if tried.len() >= reachable {
            PortClaim::Exhausted
        } else {
            PortClaim::NoneFree
        }
    }

    /// Return a port after a failed trial or a killed endpoint. A no-op
    /// once resolution has finished.
    pub fn release_port(&self, port: String) {
        let mut inner = self.inner.lock();
        if !inner.resolution_done {
            inner.port_pool.insert(port);
        }
    }

    /// Record a resolved serial endpoint. Returns true when this completed
    /// the set and resolution bookkeeping should be discarded.
    pub fn mark_matched(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.matched.insert(name.to_string());
        !inner.resolution_done && inner.matched.len() >= inner.serial_total
    }

    /// Forget a killed serial endpoint. Returns true when the remaining set
    /// is now fully matched and resolution should finish.
    pub fn kill_serial(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.matched.remove(name);
        inner.serial_total = inner.serial_total.saturating_sub(1);
        !inner.resolution_done && inner.matched.len() >= inner.serial_total
    }

    pub fn matched_count(&self) -> usize {
        self.inner.lock().matched.len()
    }

    pub fn serial_total(&self) -> usize {
        self.inner.lock().serial_total
    }

    /// Drop resolution bookkeeping; returns the never-claimed ports.
    pub fn finish_resolution(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        inner.resolution_done = true;
        inner.port_pool.drain().collect()
    }
}
