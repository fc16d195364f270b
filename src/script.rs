//! Per-endpoint scripts.
//!
//! An endpoint may carry a small sequential script, started once the
//! endpoint is live: poll a device, wait for an answer, fall back to
//! killing a misbehaving endpoint. The language is deliberately tiny:
//!
//! ```text
//! # query the compass, give it two seconds to answer
//! loop(3) {
//!     send("$PSMDCN,0")
//!     waitfor(2000, "$HCHDG")
//! }
//! send(net, "$PINIT,done")
//! ```
//!
//! Statements: `send("msg")`, `send(target, "msg")`, `sleep(ms)`,
//! `waitfor(ms, "prefix")`, `kill(target)`, `restart()`, `loop(n) { ... }`.
//! `#` starts a comment to end of line. A `waitfor` that times out ends
//! the script; everything else runs on.

use crate::error::{Result, RouterError};
use crate::prefix::NmeaPrefix;
use crate::router::RouterHandle;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    Send { to: Option<String>, msg: String },
    Sleep(u64),
    WaitFor { ms: u64, prefix: String },
    Kill(String),
    Restart,
    Loop { times: u32, body: Vec<Stmt> },
}

pub fn parse(src: &str) -> Result<Vec<Stmt>> {
    let mut p = Parser {
        src: src.as_bytes(),
        pos: 0,
    };
    let stmts = p.statements(None)?;
    p.skip_ws();
    if p.pos < p.src.len() {
        return Err(p.err("trailing input"));
    }
    Ok(stmts)
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn err(&self, msg: &str) -> RouterError {
        RouterError::script(format!("{msg} at offset {}", self.pos))
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'\t' | b'\r' | b'\n' => self.pos += 1,
                b'#' => {
                    while let Some(b) = self.peek() {
                        self.pos += 1;
                        if b == b'\n' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn expect(&mut self, want: u8) -> Result<()> {
        self.skip_ws();
        if self.peek() == Some(want) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.err(&format!("expected '{}'", want as char)))
        }
    }

    fn ident(&mut self) -> Result<String> {
        self.skip_ws();
        let start = self.pos;
        if !matches!(self.peek(), Some(b) if b.is_ascii_alphabetic()) {
            return Err(self.err("expected identifier"));
        }
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'_') {
            self.pos += 1;
        }
        Ok(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
    }

    fn number(&mut self) -> Result<u64> {
        self.skip_ws();
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.err("expected number"));
        }
        std::str::from_utf8(&self.src[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.err("invalid number"))
    }

    fn string(&mut self) -> Result<String> {
        self.skip_ws();
        let quote = match self.peek() {
            Some(q @ (b'\'' | b'"')) => q,
            _ => return Err(self.err("expected string")),
        };
        self.pos += 1;
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == quote {
                let s = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
                self.pos += 1;
                return Ok(s);
            }
            self.pos += 1;
        }
        Err(self.err("unterminated string"))
    }

    fn statements(&mut self, end: Option<u8>) -> Result<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => break,
                Some(b) if Some(b) == end => break,
                _ => stmts.push(self.stmt()?),
            }
        }
        Ok(stmts)
    }

    fn stmt(&mut self) -> Result<Stmt> {
        let word = self.ident()?;
        match word.as_str() {
            "send" => {
                self.expect(b'(')?;
                self.skip_ws();
                let stmt = if matches!(self.peek(), Some(b'\'' | b'"')) {
                    Stmt::Send {
                        to: None,
                        msg: self.string()?,
                    }
                } else {
                    let to = self.ident()?;
                    self.expect(b',')?;
                    Stmt::Send {
                        to: Some(to),
                        msg: self.string()?,
                    }
                };
                self.expect(b')')?;
                Ok(stmt)
            }
            "sleep" => {
                self.expect(b'(')?;
                let ms = self.number()?;
                self.expect(b')')?;
                Ok(Stmt::Sleep(ms))
            }
            "waitfor" => {
                self.expect(b'(')?;
                let ms = self.number()?;
                self.expect(b',')?;
                let prefix = self.string()?;
                self.expect(b')')?;
                Ok(Stmt::WaitFor { ms, prefix })
            }
            "kill" => {
                self.expect(b'(')?;
                let target = self.ident()?;
                self.expect(b')')?;
                Ok(Stmt::Kill(target))
            }
            "restart" => {
                self.expect(b'(')?;
                self.expect(b')')?;
                Ok(Stmt::Restart)
            }
            "loop" => {
                self.expect(b'(')?;
                let times = self.number()?;
                self.expect(b')')?;
                self.expect(b'{')?;
                let body = self.statements(Some(b'}'))?;
                self.expect(b'}')?;
                Ok(Stmt::Loop {
                    times: times.min(u32::MAX as u64) as u32,
                    body,
                })
            }
            other => Err(self.err(&format!("unknown statement '{other}'"))),
        }
    }
}

/// Run a parsed script against the router. Returns when the script ends, a
/// `waitfor` times out, or the endpoint is cancelled.
pub async fn run_script(
    stmts: Vec<Stmt>,
    endpoint: String,
    router: RouterHandle,
    watch: broadcast::Receiver<Bytes>,
    token: CancellationToken,
) {
    let mut ctx = ScriptCtx {
        endpoint,
        router,
        watch,
        token,
    };
    info!(endpoint = %ctx.endpoint, "script started");
    match exec(&stmts, &mut ctx).await {
        Ok(()) => info!(endpoint = %ctx.endpoint, "script finished"),
        Err(e) => warn!(endpoint = %ctx.endpoint, "script stopped: {}", e),
    }
}

struct ScriptCtx {
    endpoint: String,
    router: RouterHandle,
    watch: broadcast::Receiver<Bytes>,
    token: CancellationToken,
}

fn exec<'a>(
    stmts: &'a [Stmt],
    ctx: &'a mut ScriptCtx,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        for stmt in stmts {
            if ctx.token.is_cancelled() {
                return Ok(());
            }
            match stmt {
                Stmt::Send { to, msg } => {
                    let to = to.as_deref().unwrap_or(&ctx.endpoint);
                    if let Err(e) = ctx.router.send(to, msg) {
                        warn!(endpoint = %ctx.endpoint, "send failed: {}", e);
                    }
                }
                Stmt::Sleep(ms) => {
                    tokio::select! {
                        _ = ctx.token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(Duration::from_millis(*ms)) => {}
                    }
                }
                Stmt::WaitFor { ms, prefix } => {
                    if !wait_for(ctx, *ms, prefix).await? {
                        return Err(RouterError::script(format!(
                            "waitfor '{prefix}' timed out after {ms} ms"
                        )));
                    }
                }
                Stmt::Kill(target) => {
                    if !ctx.router.kill(target) {
                        warn!(endpoint = %ctx.endpoint, "kill failed: {} not found", target);
                    }
                }
                Stmt::Restart => ctx.router.signal_restart(),
                Stmt::Loop { times, body } => {
                    for _ in 0..*times {
                        exec(body, ctx).await?;
                        if ctx.token.is_cancelled() {
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    })
}

/// Wait until the endpoint matches a sentence with the given prefix.
/// Ok(false) on timeout, Ok(true) on arrival.
async fn wait_for(ctx: &mut ScriptCtx, ms: u64, prefix: &str) -> Result<bool> {
    let pattern = NmeaPrefix::new(prefix);
    let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
    loop {
        let recv = tokio::time::timeout_at(deadline, ctx.watch.recv());
        tokio::select! {
            _ = ctx.token.cancelled() => return Ok(true),
            res = recv => match res {
                Err(_) => return Ok(false),
                Ok(Ok(sentence)) => {
                    if pattern.matches(&sentence) {
                        debug!(endpoint = %ctx.endpoint, "waitfor satisfied by {:?}", sentence);
                        return Ok(true);
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return Ok(false),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_sequence() {
        let stmts = parse(r#"send("$PQRY") sleep(100) waitfor(2000, "$GPRMC")"#)
            .expect("valid script");
        assert_eq!(
            stmts,
            vec![
                Stmt::Send {
                    to: None,
                    msg: "$PQRY".into()
                },
                Stmt::Sleep(100),
                Stmt::WaitFor {
                    ms: 2000,
                    prefix: "$GPRMC".into()
                },
            ]
        );
    }

    #[test]
    fn test_parse_send_with_target() {
        let stmts = parse(r#"send(net, '$PINIT')"#).expect("valid script");
        assert_eq!(
            stmts,
            vec![Stmt::Send {
                to: Some("net".into()),
                msg: "$PINIT".into()
            }]
        );
    }

    #[test]
    fn test_parse_loop_and_comments() {
        let stmts = parse(
            r#"
            # poll three times
            loop(3) {
                send("$PQRY")     # query
                waitfor(500, "$HC")
            }
            kill(compass)
            restart()
            "#,
        )
        .expect("valid script");
        assert_eq!(stmts.len(), 3);
        let Stmt::Loop { times, body } = &stmts[0] else {
            panic!("expected loop");
        };
        assert_eq!(*times, 3);
        assert_eq!(body.len(), 2);
        assert_eq!(stmts[1], Stmt::Kill("compass".into()));
        assert_eq!(stmts[2], Stmt::Restart);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("send(").is_err());
        assert!(parse("frobnicate()").is_err());
        assert!(parse(r#"waitfor("$GP", 100)"#).is_err());
        assert!(parse(r#"send("unterminated)"#).is_err());
        assert!(parse("loop(2) { sleep(1) ").is_err());
    }

    #[test]
    fn test_parse_empty_script() {
        assert_eq!(parse("  # nothing\n").expect("valid"), vec![]);
    }
}
