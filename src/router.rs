//! Router orchestration.
//!
//! [`Router::start`] enumerates the serial port pool, builds every endpoint
//! and its routes from configuration, and spawns the endpoint tasks. Serial
//! endpoints then resolve themselves against the pool; once the last one
//! matches, resolution bookkeeping is discarded and backup routes are wired
//! to their primaries. [`RouterHandle`] is the cloneable face the console
//! and endpoint scripts act through: `kill`, `send` and the termination
//! signals.

use crate::config::{Config, EndpointConfig};
use crate::console::{self, LogControl};
use crate::endpoint_core::EndpointCore;
use crate::endpoints::{serial, tcp, udp};
use crate::error::{Result, RouterError};
use crate::matcher_manager::{MatcherManager, SerialRoutes};
use crate::registry::{EndpointHandle, EndpointKind, Registry};
use crate::route::Route;
use crate::script;
use crate::state::{port_key, PortStore, CONFIG_DIGEST_KEY};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Controlled termination paths, distinct from fatal errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    Shutdown,
    Restart,
    /// A worker task panicked; routing correctness is no longer guaranteed.
    Fatal(String),
}

/// Cloneable handle through which the console, scripts and embedders drive
/// the router. All methods are safe to call concurrently with the data
/// path; registry mutations are atomic with respect to each other.
#[derive(Clone)]
pub struct RouterHandle {
    registry: Arc<Registry>,
    manager: Arc<MatcherManager>,
    store: Arc<dyn PortStore>,
    signal_tx: mpsc::Sender<ControlSignal>,
}

impl RouterHandle {
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Write a CRLF-terminated line to a named target.
    pub fn send(&self, to: &str, text: &str) -> Result<usize> {
        let handle = self
            .registry
            .target(to)
            .ok_or_else(|| RouterError::bad_input(format!("no such target: {to}")))?;
        let bytes = Bytes::from(format!("{text}\r\n"));
        let len = bytes.len();
        handle.deliver(bytes);
        Ok(len)
    }

    /// Remove an endpoint from every registry, cancel its tasks and script,
    /// and free its physical port for still-unresolved endpoints.
    pub fn kill(&self, target: &str) -> bool {
        let Some(handle) = self.registry.remove(target) else {
            debug!("kill target {} not found", target);
            return false;
        };
        info!("kill({})", target);
        handle.detach();
        handle.cancel.cancel();
        if handle.kind == EndpointKind::Serial {
            self.manager.on_killed(target);
            self.store.remove(&port_key(target));
            if self.registry.kill_serial(target) {
                self.finish_resolution();
            }
        }
        true
    }

    /// Persisted port binding from a previous run.
    pub fn last_port(&self, name: &str) -> Option<String> {
        self.store.get(&port_key(name))
    }

    /// Record a confirmed port binding and retire resolution once every
    /// serial endpoint is matched.
    pub fn mark_matched(&self, name: &str, port: &str) {
        self.store.put(&port_key(name), port);
        self.manager.on_matched(name);
        let all = self.registry.mark_matched(name);
        info!(
            "{}/{} serial endpoints matched",
            self.registry.matched_count(),
            self.registry.serial_total()
        );
        if all {
            self.finish_resolution();
        }
    }

    pub(crate) fn finish_resolution(&self) {
        let freed = self.registry.finish_resolution();
        self.manager.link_backups();
        info!("all ports matched");
        for port in freed {
            debug!("closing unused port {}", port);
        }
    }

    pub fn signal_shutdown(&self) {
        let _ = self.signal_tx.try_send(ControlSignal::Shutdown);
    }

    pub fn signal_restart(&self) {
        let _ = self.signal_tx.try_send(ControlSignal::Restart);
    }

    fn signal_fatal(&self, msg: String) {
        let _ = self.signal_tx.try_send(ControlSignal::Fatal(msg));
    }
}

/// A running router.
pub struct Router {
    handle: RouterHandle,
    cancel: CancellationToken,
    monitor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    /// Build and launch everything. Returns the router plus the receiver
    /// carrying `shutdown`/`restart`/fatal signals for the embedder's main
    /// loop.
    pub async fn start(
        config: Config,
        store: Arc<dyn PortStore>,
        log: LogControl,
        force_port_config: bool,
    ) -> Result<(Arc<Router>, mpsc::Receiver<ControlSignal>)> {
        let (signal_tx, signal_rx) = mpsc::channel(8);
        let registry = Arc::new(Registry::new());
        let cancel = CancellationToken::new();

        let serial_count = config.endpoint.iter().filter(|e| e.is_serial()).count();
        if serial_count > 0 {
            let ports = enumerate_ports()?;
            if ports.is_empty() {
                return Err(RouterError::resolve(
                    "no serial ports found, cannot resolve serial endpoints",
                ));
            }
            info!("free ports: {}", ports.join(", "));
            registry.seed_ports(ports);
        }
        registry.set_serial_total(serial_count);

        check_config_digest(&config, store.as_ref(), force_port_config);

        // Build handles, channels and routes before anything runs, so the
        // single-sink analysis and the ambiguity sets see the whole picture.
        struct Pending {
            config: EndpointConfig,
            handle: EndpointHandle,
            rx: mpsc::Receiver<Bytes>,
            routes: Vec<Arc<Route>>,
        }
        let mut pending = Vec::new();
        let mut serial_map = Vec::new();
        let mut all_routes = Vec::new();
        for ep in config.endpoint {
            let name = ep.name().to_string();
            let (tx, rx) = mpsc::channel(config.general.queue_capacity);
            let handle = EndpointHandle::new(&name, endpoint_kind(&ep), tx, cancel.child_token());
            registry.register(handle.clone())?;
            let routes: Vec<Arc<Route>> = ep
                .routes()
                .iter()
                .map(|rc| Route::new(&rc.prefix, rc.target.clone(), rc.backup, rc.expire_ms))
                .collect();
            for rc in ep.routes() {
                for target in &rc.target {
                    registry.add_source(target, &name);
                }
            }
            for route in &routes {
                all_routes.push((name.clone(), route.clone()));
            }
            if let Some(settings) = ep.serial_settings() {
                serial_map.push((
                    name.clone(),
                    SerialRoutes {
                        speed: settings.speed,
                        routes: routes.clone(),
                    },
                ));
            }
            pending.push(Pending {
                config: ep,
                handle,
                rx,
                routes,
            });
        }
        registry.update_single_sinks();

        let manager = Arc::new(MatcherManager::new(serial_map, all_routes));
        let handle = RouterHandle {
            registry: registry.clone(),
            manager: manager.clone(),
            store,
            signal_tx,
        };

        if serial_count == 0 {
            // nothing to resolve; backups can be wired right away
            registry.finish_resolution();
            manager.link_backups();
        }

        let resolv_timeout = Duration::from_millis(config.general.resolv_timeout_ms);
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        for p in pending {
            let core = EndpointCore {
                handle: p.handle.clone(),
                registry: registry.clone(),
            };
            let stmts = match p.config.script() {
                // validated at config load; a failure here is a bug
                Some(src) => Some(script::parse(src)?),
                None => None,
            };
            match &p.config {
                EndpointConfig::Serial { .. }
                | EndpointConfig::Nmea0183 { .. }
                | EndpointConfig::Nmea0183Hs { .. } => {
                    let settings = p
                        .config
                        .serial_settings()
                        .ok_or_else(|| RouterError::internal("serial endpoint without settings"))?;
                    tasks.spawn(serial::run(serial::SerialCtx {
                        core,
                        settings,
                        routes: p.routes,
                        script: stmts,
                        manager: manager.clone(),
                        router: handle.clone(),
                        rx: p.rx,
                        resolv_timeout,
                    }));
                }
                EndpointConfig::Datagram { address, port, .. } => {
                    spawn_script(&p.handle, stmts, &handle);
                    tasks.spawn(udp::run(udp::UdpCtx {
                        core,
                        address: Some(address.clone()),
                        port: *port,
                        routes: p.routes,
                        rx: p.rx,
                    }));
                }
                EndpointConfig::Broadcast { port, .. } => {
                    spawn_script(&p.handle, stmts, &handle);
                    tasks.spawn(udp::run(udp::UdpCtx {
                        core,
                        address: None,
                        port: *port,
                        routes: p.routes,
                        rx: p.rx,
                    }));
                }
                EndpointConfig::TcpListener { port, .. } => {
                    tasks.spawn(tcp::run(tcp::TcpCtx {
                        core,
                        port: *port,
                        routes: p.routes,
                        rx: p.rx,
                    }));
                }
            }
        }

        if let Some(port) = config.general.ctrl_port {
            tasks.spawn(console::run(
                port,
                handle.clone(),
                log.clone(),
                cancel.child_token(),
            ));
        }

        // Worker failures are contained per endpoint; a panic is the one
        // thing that escalates to process termination.
        let monitor = {
            let handle = handle.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                let mut tasks = tasks;
                while let Some(res) = tasks.join_next().await {
                    match res {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("endpoint task ended: {}", e),
                        Err(e) if e.is_panic() => {
                            error!("worker panicked: {}", e);
                            handle.signal_fatal(format!("worker panicked: {e}"));
                            token.cancel();
                        }
                        Err(_) => {}
                    }
                }
            })
        };

        Ok((
            Arc::new(Router {
                handle,
                cancel,
                monitor: tokio::sync::Mutex::new(Some(monitor)),
            }),
            signal_rx,
        ))
    }

    pub fn handle(&self) -> &RouterHandle {
        &self.handle
    }

    /// Graceful shutdown: cancel every task and wait for them to drain.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(monitor) = self.monitor.lock().await.take() {
            let _ = monitor.await;
        }
    }
}

fn spawn_script(handle: &EndpointHandle, stmts: Option<Vec<script::Stmt>>, router: &RouterHandle) {
    if let Some(stmts) = stmts {
        tokio::spawn(script::run_script(
            stmts,
            handle.name.clone(),
            router.clone(),
            handle.watch.subscribe(),
            handle.cancel.clone(),
        ));
    }
}

fn endpoint_kind(ep: &EndpointConfig) -> EndpointKind {
    match ep {
        EndpointConfig::Serial { .. }
        | EndpointConfig::Nmea0183 { .. }
        | EndpointConfig::Nmea0183Hs { .. } => EndpointKind::Serial,
        EndpointConfig::Datagram { .. } => EndpointKind::Datagram,
        EndpointConfig::Broadcast { .. } => EndpointKind::Broadcast,
        EndpointConfig::TcpListener { .. } => EndpointKind::TcpListener,
    }
}

fn enumerate_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| RouterError::serial("port enumeration", e))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Persisted port bindings are only trusted while the configuration is the
/// one they were learned under.
fn check_config_digest(config: &Config, store: &dyn PortStore, force_port_config: bool) {
    let stored = store.get(CONFIG_DIGEST_KEY);
    if stored.as_deref() != Some(config.digest.as_str()) {
        if stored.is_some() && !force_port_config {
            info!("configuration changed, dropping persisted port bindings");
            for ep in &config.endpoint {
                if ep.is_serial() {
                    store.remove(&port_key(ep.name()));
                }
            }
        }
        store.put(CONFIG_DIGEST_KEY, &config.digest);
    }
}
