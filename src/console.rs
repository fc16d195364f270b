//! Operator control channel.
//!
//! A line-oriented protocol over TCP, one session task per connection.
//! Commands are matched on their shortest unambiguous leading prefix, so
//! `st` is `statistics` and `er` is `errors`, but `kill` must be typed in
//! full. Bad input is reported on the connection, which stays open;
//! `shutdown` and `restart` raise controlled termination signals.
//!
//! `attach <target>` tees the target endpoint's raw input onto the session
//! until anything that is not an NMEA sentence is typed; sentences typed
//! while attached are written out through the attached endpoint.

use crate::error::{Result, RouterError};
use crate::registry::EndpointHandle;
use crate::router::RouterHandle;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{reload, EnvFilter};

/// Queue depth of the attach tee toward a console session.
const ATTACH_QUEUE: usize = 64;

const HELP: &str = "\
h[elp] - Prints help\r\n\
i[nfo] - Prints router info\r\n\
se[nd] <target> <text> - Send a string to target\r\n\
a[ttach] <target> - Attach target\r\n\
kill <target> - Kill target\r\n\
l[og] [target] [level] - Set log level\r\n\
sho[w logs] / logs - Show log targets\r\n\
st[atistics] - Print statistics\r\n\
er[rors] - Print matcher errors\r\n\
exit - Exit the session\r\n\
shutdown - Shut down the router\r\n\
restart - Restart the router\r\n";

type ReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::registry::Registry>;

/// Runtime control over the tracing filter, driven by the `log` command.
#[derive(Clone)]
pub struct LogControl {
    handle: Option<ReloadHandle>,
    base: Arc<Mutex<String>>,
    current: Arc<Mutex<String>>,
}

impl LogControl {
    pub fn new(handle: ReloadHandle, base: &str) -> Self {
        Self {
            handle: Some(handle),
            base: Arc::new(Mutex::new(base.to_string())),
            current: Arc::new(Mutex::new(base.to_string())),
        }
    }

    /// A no-op control for tests and embedded use.
    pub fn disabled() -> Self {
        Self {
            handle: None,
            base: Arc::new(Mutex::new("info".to_string())),
            current: Arc::new(Mutex::new("info".to_string())),
        }
    }

    pub fn current(&self) -> String {
        self.current.lock().clone()
    }

    pub fn set_global(&self, level: &str) -> Result<()> {
        self.apply(level)?;
        *self.base.lock() = level.to_string();
        Ok(())
    }

    pub fn set_target(&self, target: &str, level: &str) -> Result<()> {
        let directive = format!("{},{}={}", self.base.lock(), target, level);
        self.apply(&directive)
    }

    fn apply(&self, directive: &str) -> Result<()> {
        let filter = EnvFilter::try_new(directive)
            .map_err(|e| RouterError::bad_input(format!("bad log directive: {e}")))?;
        if let Some(handle) = &self.handle {
            handle
                .reload(filter)
                .map_err(|e| RouterError::internal(format!("cannot reload log filter: {e}")))?;
        }
        *self.current.lock() = directive.to_string();
        Ok(())
    }
}

pub fn is_level(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error" | "off"
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Info,
    Send { target: String, text: String },
    Attach(String),
    Kill(String),
    Log { target: Option<String>, level: Option<String> },
    Logs,
    Statistics,
    Errors,
    Exit,
    Shutdown,
    Restart,
}

/// Parse one console line. The first word selects the command by leading
/// prefix; `(minimal, full)` pairs below mirror the operator shorthand.
pub fn parse_command(line: &str) -> Result<Command> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(&word) = tokens.first() else {
        return Err(RouterError::bad_input("empty command"));
    };
    let w = word.to_ascii_lowercase();

    const TABLE: &[(&str, &str)] = &[
        ("kill", "kill"),
        ("exit", "exit"),
        ("shutdown", "shutdown"),
        ("restart", "restart"),
        ("sho", "show"),
        ("logs", "logs"),
        ("se", "send"),
        ("st", "statistics"),
        ("er", "errors"),
        ("h", "help"),
        ("i", "info"),
        ("a", "attach"),
        ("l", "log"),
    ];
    let Some((_, full)) = TABLE
        .iter()
        .find(|(min, full)| w.len() >= min.len() && full.starts_with(w.as_str()))
    else {
        return Err(RouterError::bad_input(format!("unknown command: {word}")));
    };

    match *full {
        "help" => Ok(Command::Help),
        "info" => Ok(Command::Info),
        "send" => {
            if tokens.len() < 3 {
                return Err(RouterError::bad_input("usage: send <target> <text>"));
            }
            Ok(Command::Send {
                target: tokens[1].to_string(),
                text: tokens[2..].join(" "),
            })
        }
        "attach" => match tokens.get(1) {
            Some(t) => Ok(Command::Attach(t.to_string())),
            None => Err(RouterError::bad_input("usage: attach <target>")),
        },
        "kill" => match tokens.get(1) {
            Some(t) => Ok(Command::Kill(t.to_string())),
            None => Err(RouterError::bad_input("usage: kill <target>")),
        },
        "log" => match tokens.len() {
            1 => Ok(Command::Log {
                target: None,
                level: None,
            }),
            2 if is_level(tokens[1]) => Ok(Command::Log {
                target: None,
                level: Some(tokens[1].to_ascii_lowercase()),
            }),
            3 if is_level(tokens[2]) => Ok(Command::Log {
                target: Some(tokens[1].to_string()),
                level: Some(tokens[2].to_ascii_lowercase()),
            }),
            _ => Err(RouterError::bad_input("usage: log [target] [level]")),
        },
        "show" | "logs" => Ok(Command::Logs),
        "statistics" => Ok(Command::Statistics),
        "errors" => Ok(Command::Errors),
        "exit" => Ok(Command::Exit),
        "shutdown" => Ok(Command::Shutdown),
        "restart" => Ok(Command::Restart),
        _ => Err(RouterError::bad_input(format!("unknown command: {word}"))),
    }
}

/// Accept loop for the control listener.
pub async fn run(
    port: u16,
    router: RouterHandle,
    log: LogControl,
    token: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| RouterError::network("console", e))?;
    info!("control listener at {}", port);

    let mut join_set = JoinSet::new();
    loop {
        tokio::select! {
            accept_res = listener.accept() => match accept_res {
                Ok((stream, addr)) => {
                    info!("console session from {}", addr);
                    let router = router.clone();
                    let log = log.clone();
                    let session_token = token.clone();
                    join_set.spawn(async move {
                        if let Err(e) = session(stream, router, log, session_token).await {
                            debug!("console session ended: {}", e);
                        }
                    });
                }
                Err(e) => error!("console accept error: {}", e),
            },
            _ = join_set.join_next(), if !join_set.is_empty() => {}
            _ = token.cancelled() => return Ok(()),
        }
    }
}

enum Step {
    Line(Option<String>),
    Teed(Option<Bytes>),
    Cancelled,
}

async fn session(
    stream: TcpStream,
    router: RouterHandle,
    log: LogControl,
    token: CancellationToken,
) -> Result<()> {
    let (read_half, mut w) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    reply(&mut w, &format!("nmea-router {}", env!("CARGO_PKG_VERSION"))).await?;

    let mut attached: Option<(EndpointHandle, mpsc::Receiver<Bytes>)> = None;

    loop {
        let step = if let Some((_, rx)) = attached.as_mut() {
            tokio::select! {
                _ = token.cancelled() => Step::Cancelled,
                data = rx.recv() => Step::Teed(data),
                line = lines.next_line() => Step::Line(line.map_err(|e| RouterError::network("console", e))?),
            }
        } else {
            tokio::select! {
                _ = token.cancelled() => Step::Cancelled,
                line = lines.next_line() => Step::Line(line.map_err(|e| RouterError::network("console", e))?),
            }
        };

        match step {
            Step::Cancelled => break,
            Step::Teed(Some(bytes)) => {
                w.write_all(&bytes)
                    .await
                    .map_err(|e| RouterError::network("console", e))?;
            }
            Step::Teed(None) => {
                // endpoint side went away
                if let Some((endpoint, _)) = attached.take() {
                    endpoint.detach();
                    reply(&mut w, &format!("{} detached", endpoint.name)).await?;
                }
            }
            Step::Line(None) => break,
            Step::Line(Some(line)) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if attached.is_some() {
                    if line.starts_with('$') || line.starts_with('!') {
                        if let Some((endpoint, _)) = attached.as_ref() {
                            endpoint.deliver_direct(Bytes::from(format!("{line}\r\n")));
                        }
                    } else if let Some((endpoint, _)) = attached.take() {
                        endpoint.detach();
                        reply(&mut w, &format!("{} detached", endpoint.name)).await?;
                    }
                    continue;
                }
                match parse_command(&line) {
                    Err(e) => reply(&mut w, &e.to_string()).await?,
                    Ok(cmd) => {
                        if !handle_command(cmd, &mut w, &mut attached, &router, &log).await? {
                            break;
                        }
                    }
                }
            }
        }
    }

    if let Some((endpoint, _)) = attached.take() {
        endpoint.detach();
    }
    Ok(())
}

async fn handle_command(
    cmd: Command,
    w: &mut OwnedWriteHalf,
    attached: &mut Option<(EndpointHandle, mpsc::Receiver<Bytes>)>,
    router: &RouterHandle,
    log: &LogControl,
) -> Result<bool> {
    match cmd {
        Command::Help => reply(w, HELP).await?,
        Command::Info => reply(w, &info_text(router)).await?,
        Command::Send { target, text } => match router.send(&target, &text) {
            Ok(_) => reply(w, &format!("sent: {text}")).await?,
            Err(e) => reply(w, &e.to_string()).await?,
        },
        Command::Attach(target) => {
            let Some(endpoint) = router.registry().target(&target) else {
                reply(w, &format!("no such target: {target}")).await?;
                return Ok(true);
            };
            let (tx, rx) = mpsc::channel(ATTACH_QUEUE);
            match endpoint.attach_sink(tx) {
                Ok(()) => {
                    reply(w, &format!("attached to {target}")).await?;
                    *attached = Some((endpoint, rx));
                }
                Err(e) => reply(w, &e.to_string()).await?,
            }
        }
        Command::Kill(target) => {
            if router.kill(&target) {
                reply(w, &format!("killed: {target}")).await?;
            } else {
                reply(w, &format!("kill failed: {target}")).await?;
            }
        }
        Command::Log { target, level } => {
            let res = match (&target, &level) {
                (None, None) => Ok(()),
                (None, Some(level)) => log.set_global(level),
                (Some(target), Some(level)) => log.set_target(target, level),
                (Some(_), None) => Err(RouterError::bad_input("usage: log [target] [level]")),
            };
            match res {
                Ok(()) => reply(w, &format!("log filter: {}", log.current())).await?,
                Err(e) => reply(w, &e.to_string()).await?,
            }
        }
        Command::Logs => reply(w, &logs_text()).await?,
        Command::Statistics => reply(w, &statistics_text(router)).await?,
        Command::Errors => reply(w, &errors_text(router)).await?,
        Command::Exit => return Ok(false),
        Command::Shutdown => {
            reply(w, "shutting down").await?;
            router.signal_shutdown();
            return Ok(false);
        }
        Command::Restart => {
            reply(w, "restarting").await?;
            router.signal_restart();
            return Ok(false);
        }
    }
    Ok(true)
}

async fn reply(w: &mut OwnedWriteHalf, text: &str) -> Result<()> {
    let mut out = text.to_string();
    if !out.ends_with('\n') {
        out.push_str("\r\n");
    }
    w.write_all(out.as_bytes())
        .await
        .map_err(|e| RouterError::network("console", e))
}

fn info_text(router: &RouterHandle) -> String {
    let registry = router.registry();
    let mut out = String::from("endpoints:\r\n");
    for endpoint in registry.all_targets() {
        let port = endpoint.port.lock().clone();
        let _ = write!(
            out,
            "{}\t{}\t{}{}{}{}\r\n",
            endpoint.name,
            endpoint.kind,
            if endpoint.is_matched() { "matched" } else { "resolving" },
            match port {
                Some(p) => format!(" on {p}"),
                None => String::new(),
            },
            if endpoint.is_attached() { " [attached]" } else { "" },
            match endpoint.stats.write_drops() {
                0 => String::new(),
                n => format!(" ({n} dropped writes)"),
            },
        );
    }
    if registry.resolution_done() {
        out.push_str("resolution: complete\r\n");
    } else {
        let _ = write!(
            out,
            "resolution: {}/{} matched, free ports: {:?}\r\n",
            registry.matched_count(),
            registry.serial_total(),
            registry.free_ports(),
        );
    }
    out
}

fn statistics_text(router: &RouterHandle) -> String {
    let mut out = String::from("Name\tReads\tBytes\tMean\tWrites\tBytes\tMean\r\n");
    for endpoint in router.registry().all_targets() {
        let stats = &endpoint.stats;
        let mean = |m: Option<u64>| m.map_or("N/A".to_string(), |v| v.to_string());
        let _ = write!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\r\n",
            endpoint.name,
            stats.read_count(),
            stats.read_bytes(),
            mean(stats.read_mean()),
            stats.write_count(),
            stats.write_bytes(),
            mean(stats.write_mean()),
        );
    }
    out
}

fn errors_text(router: &RouterHandle) -> String {
    let mut out = String::from("Name\tMatches\tErrors\t%\r\n");
    for endpoint in router.registry().all_targets() {
        let counters = &endpoint.counters;
        let _ = write!(
            out,
            "{}\t{}\t{}\t{:.1}\r\n",
            endpoint.name,
            counters.matches(),
            counters.errors(),
            counters.error_percent(),
        );
    }
    out
}

fn logs_text() -> String {
    let targets = [
        "nmearouter",
        "nmearouter::router",
        "nmearouter::endpoints::serial",
        "nmearouter::endpoints::udp",
        "nmearouter::endpoints::tcp",
        "nmearouter::console",
        "nmearouter::script",
    ];
    let mut out = String::new();
    for (i, t) in targets.iter().enumerate() {
        let _ = write!(out, "{}\t{}\r\n", i + 1, t);
    }
    out
}
