//! Serial endpoints and port resolution.
//!
//! A serial endpoint does not know which physical port its device is wired
//! to. It claims free ports from the pool one at a time, configures its
//! line parameters and listens with a resolution-only matcher (configured
//! prefixes minus the ones ambiguous at its speed). Only a checksum-valid
//! sentence counts as proof of a binding; garbage from a wrong port or
//! wrong baud never confirms anything and the trial times out. A confirmed
//! port is persisted so the next start skips the trial phase.

use crate::config::{FlowControlConfig, ParityConfig, SerialSettings};
use crate::endpoint_core::{run_stream_loop, EndpointCore, ExponentialBackoff, SentenceReader, READ_BUF_SIZE};
use crate::error::{Result, RouterError};
use crate::matcher_manager::{build_full_matcher, MatcherManager};
use crate::registry::PortClaim;
use crate::route::Route;
use crate::router::RouterHandle;
use crate::script::{run_script, Stmt};
use ahash::AHashSet;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often an endpoint with nothing to try polls the pool.
const CLAIM_POLL: Duration = Duration::from_millis(250);

pub struct SerialCtx {
    pub core: EndpointCore,
    pub settings: SerialSettings,
    pub routes: Vec<Arc<Route>>,
    pub script: Option<Vec<Stmt>>,
    pub manager: Arc<MatcherManager>,
    pub router: RouterHandle,
    pub rx: mpsc::Receiver<Bytes>,
    pub resolv_timeout: Duration,
}

enum TrialOutcome {
    Matched(SerialStream),
    TimedOut,
    Cancelled,
}

pub async fn run(mut ctx: SerialCtx) -> Result<()> {
    let token = ctx.core.handle.cancel.clone();
    let name = ctx.core.handle.name.clone();

    let Some((port, stream, mut sreader)) = resolve(&ctx, &token).await? else {
        return Ok(()); // cancelled during resolution
    };

    info!("{} resolved to {}", name, port);
    *ctx.core.handle.port.lock() = Some(port.clone());
    ctx.core.handle.set_matched();
    ctx.router.mark_matched(&name, &port);

    // the live matcher carries every prefix, ambiguity no longer matters
    if let Some(full) = build_full_matcher(&ctx.routes, ctx.core.handle.counters.clone()) {
        sreader.set_matcher(full);
    }

    if let Some(stmts) = ctx.script.take() {
        tokio::spawn(run_script(
            stmts,
            name.clone(),
            ctx.router.clone(),
            ctx.core.handle.watch.subscribe(),
            token.clone(),
        ));
    }

    live_loop(&mut ctx, &token, &port, stream, &mut sreader).await;

    // back to the pool so a still-unresolved endpoint can claim it
    ctx.core.registry.release_port(port);
    Ok(())
}

/// Claim-and-trial loop; returns the confirmed port and its open stream.
async fn resolve(
    ctx: &SerialCtx,
    token: &CancellationToken,
) -> Result<Option<(String, SerialStream, SentenceReader)>> {
    let name = &ctx.core.handle.name;
    let mut tried: AHashSet<String> = AHashSet::new();
    let mut last = ctx.router.last_port(name);
    loop {
        if token.is_cancelled() {
            return Ok(None);
        }
        let Some(matcher) = ctx
            .manager
            .resolve_matcher(name, ctx.core.handle.counters.clone())
        else {
            // matched already, killed, or every prefix is currently
            // ambiguous; wait for the contenders to sort themselves out
            if !sleep_or_cancel(token, CLAIM_POLL).await {
                return Ok(None);
            }
            continue;
        };
        match ctx.core.registry.claim_port(last.as_deref(), &tried) {
            PortClaim::Claimed { port, from_last } => {
                if from_last {
                    info!("{}: using last matched port {}", name, port);
                }
                last = None;
                tried.insert(port.clone());
                let stream = match open_port(&port, &ctx.settings) {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("{}: cannot open {}: {}", name, port, e);
                        ctx.core.registry.release_port(port);
                        if !sleep_or_cancel(token, CLAIM_POLL).await {
                            return Ok(None);
                        }
                        continue;
                    }
                };
                debug!("{}: trying {} at {} Bd", name, port, ctx.settings.speed);
                let mut sreader = SentenceReader::new(matcher);
                match trial(stream, &mut sreader, &ctx.core, token, ctx.resolv_timeout).await {
                    TrialOutcome::Matched(stream) => return Ok(Some((port, stream, sreader))),
                    TrialOutcome::TimedOut => {
                        debug!("{}: no valid traffic on {}", name, port);
                        ctx.core.registry.release_port(port);
                    }
                    TrialOutcome::Cancelled => {
                        ctx.core.registry.release_port(port);
                        return Ok(None);
                    }
                }
            }
            PortClaim::Exhausted => {
                debug!("{}: tried every free port, starting over", name);
                tried.clear();
                if !sleep_or_cancel(token, CLAIM_POLL).await {
                    return Ok(None);
                }
            }
            PortClaim::NoneFree => {
                if !sleep_or_cancel(token, CLAIM_POLL).await {
                    return Ok(None);
                }
            }
        }
    }
}

/// Listen on a claimed port until the resolution matcher confirms it or
/// the window expires.
async fn trial(
    mut stream: SerialStream,
    sreader: &mut SentenceReader,
    core: &EndpointCore,
    token: &CancellationToken,
    window: Duration,
) -> TrialOutcome {
    let deadline = tokio::time::Instant::now() + window;
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        tokio::select! {
            _ = token.cancelled() => return TrialOutcome::Cancelled,
            _ = tokio::time::sleep_until(deadline) => return TrialOutcome::TimedOut,
            res = stream.read(&mut buf) => match res {
                Ok(0) => return TrialOutcome::TimedOut,
                Ok(n) => {
                    core.handle.stats.record_read(n);
                    // the confirming sentence is routed, not just counted
                    if sreader.feed(core, &buf[..n]) > 0 {
                        return TrialOutcome::Matched(stream);
                    }
                }
                Err(e) => {
                    warn!("{}: read error during trial: {}", core.name(), e);
                    return TrialOutcome::TimedOut;
                }
            }
        }
    }
}

/// Matched operation: run the stream loop, reopening the confirmed port
/// with backoff if it drops.
async fn live_loop(
    ctx: &mut SerialCtx,
    token: &CancellationToken,
    port: &str,
    stream: SerialStream,
    sreader: &mut SentenceReader,
) {
    let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30), 2.0);
    let mut current = Some(stream);
    loop {
        if token.is_cancelled() {
            return;
        }
        let stream = match current.take() {
            Some(stream) => stream,
            None => match open_port(port, &ctx.settings) {
                Ok(stream) => {
                    backoff.reset();
                    stream
                }
                Err(e) => {
                    warn!("{}: cannot reopen {}: {}", ctx.core.name(), port, e);
                    if !sleep_or_cancel(token, backoff.next_backoff()).await {
                        return;
                    }
                    continue;
                }
            },
        };
        let (reader, writer) = tokio::io::split(stream);
        let res = run_stream_loop(reader, writer, &mut ctx.rx, sreader, &ctx.core, token).await;
        if token.is_cancelled() {
            return;
        }
        match res {
            Ok(()) => warn!("{}: {} closed, reopening", ctx.core.name(), port),
            Err(e) => warn!("{}: {}: {}, reopening", ctx.core.name(), port, e),
        }
        sreader.resync();
        if !sleep_or_cancel(token, backoff.next_backoff()).await {
            return;
        }
    }
}

/// Sleep unless cancelled; false means cancelled.
async fn sleep_or_cancel(token: &CancellationToken, wait: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

fn open_port(port: &str, settings: &SerialSettings) -> Result<SerialStream> {
    let builder = tokio_serial::new(port, settings.speed)
        .data_bits(data_bits(settings.bits)?)
        .parity(parity(settings.parity))
        .stop_bits(stop_bits(settings.stops)?)
        .flow_control(flow_control(settings.flow_control));
    #[allow(unused_mut)]
    let mut stream = builder
        .open_native_async()
        .map_err(|e| RouterError::serial(port, e))?;
    #[cfg(unix)]
    if let Err(e) = stream.set_exclusive(false) {
        warn!("cannot clear exclusive mode on {}: {}", port, e);
    }
    Ok(stream)
}

fn data_bits(bits: u8) -> Result<DataBits> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(RouterError::config(format!("unsupported data bits: {other}"))),
    }
}

fn stop_bits(stops: u8) -> Result<StopBits> {
    match stops {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => Err(RouterError::config(format!("unsupported stop bits: {other}"))),
    }
}

fn parity(parity: ParityConfig) -> Parity {
    match parity {
        ParityConfig::None => Parity::None,
        ParityConfig::Odd => Parity::Odd,
        ParityConfig::Even => Parity::Even,
    }
}

fn flow_control(flow: FlowControlConfig) -> FlowControl {
    match flow {
        FlowControlConfig::None => FlowControl::None,
        FlowControlConfig::Software => FlowControl::Software,
        FlowControlConfig::Hardware => FlowControl::Hardware,
    }
}
