//! Shared endpoint machinery.
//!
//! Every endpoint runs the same two halves: a reader that feeds incoming
//! bytes through the sentence matcher and hands matches to their routes,
//! and a writer that drains the endpoint's queue onto the channel. Serial,
//! UDP and TCP endpoints only differ in how they obtain the two halves.

use crate::matcher::{MatchStatus, NmeaMatcher};
use crate::registry::{EndpointHandle, Registry};
use crate::route::Route;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Hard bound on one sentence; NMEA 0183 caps sentences at 82 characters,
/// anything near this size is line noise that never framed.
const MAX_SENTENCE: usize = 1024;

pub const READ_BUF_SIZE: usize = 4096;

/// Exponential backoff helper for reopen/reconnect loops.
#[derive(Debug)]
pub struct ExponentialBackoff {
    current: Duration,
    min: Duration,
    max: Duration,
    multiplier: f64,
}

impl ExponentialBackoff {
    pub fn new(min: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            current: min,
            min,
            max,
            multiplier,
        }
    }

    /// Delay to wait now; the internal state advances for the next call.
    pub fn next_backoff(&mut self) -> Duration {
        let wait = self.current;
        self.current = std::cmp::min(
            self.max,
            Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier),
        );
        wait
    }

    /// Back to the minimum after a healthy connection.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Shared context of one endpoint's data path.
#[derive(Clone)]
pub struct EndpointCore {
    pub handle: EndpointHandle,
    pub registry: Arc<Registry>,
}

impl EndpointCore {
    pub fn name(&self) -> &str {
        &self.handle.name
    }

    /// Process one read batch: either tee it verbatim to an attachment, or
    /// run it through the sentence matcher.
    pub fn process(&self, reader: &mut SentenceReader, batch: &[u8]) {
        if let Some(sink) = self.handle.attachment() {
            // While attached the matcher is out of the loop; drop any
            // half-assembled frame so we resync cleanly on detach.
            reader.resync();
            match sink.try_send(Bytes::copy_from_slice(batch)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(endpoint = %self.handle.name, "attachment gone, detaching");
                    self.handle.detach();
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(endpoint = %self.handle.name, "attachment backlogged, dropping batch");
                }
            }
            return;
        }
        reader.feed(self, batch);
    }
}

/// Streaming matcher driver: owns the compiled matcher, the bytes of the
/// sentence being assembled, and the partial-delivery watermark.
pub struct SentenceReader {
    matcher: NmeaMatcher<Arc<Route>>,
    frame: BytesMut,
    partial_sent: usize,
}

impl SentenceReader {
    pub fn new(matcher: NmeaMatcher<Arc<Route>>) -> Self {
        Self {
            matcher,
            frame: BytesMut::with_capacity(256),
            partial_sent: 0,
        }
    }

    /// Swap in a different compiled matcher (resolution -> live) and start
    /// clean at the next frame boundary.
    pub fn set_matcher(&mut self, matcher: NmeaMatcher<Arc<Route>>) {
        self.matcher = matcher;
        self.resync();
    }

    /// Drop buffered bytes and matcher state, back to hunting for a frame
    /// start.
    pub fn resync(&mut self) {
        self.matcher.reset();
        self.frame.clear();
        self.partial_sent = 0;
    }

    /// Feed a read batch byte by byte. Returns the number of complete
    /// sentences matched in this batch.
    ///
    /// On a match the sentence is delivered through its route and offered
    /// to the endpoint's script tee. If the batch ends inside a sentence
    /// whose prefix has matched, the unforwarded bytes are flushed to
    /// single-sink targets so a lone consumer sees minimal latency.
    pub fn feed(&mut self, core: &EndpointCore, batch: &[u8]) -> usize {
        let mut matched = 0;
        let mut last = MatchStatus::Ok;
        for &b in batch {
            if self.frame.len() >= MAX_SENTENCE {
                warn!(endpoint = %core.handle.name, "oversized frame, resynchronizing");
                self.resync();
            }
            last = self.matcher.match_byte(b);
            match last {
                MatchStatus::Error => {
                    self.frame.clear();
                    self.partial_sent = 0;
                }
                MatchStatus::Ok | MatchStatus::WillMatch => self.frame.put_u8(b),
                MatchStatus::Match => {
                    self.frame.put_u8(b);
                    let frame = self.frame.split().freeze();
                    let tail = frame.slice(self.partial_sent..);
                    if let Some(route) = self.matcher.matched() {
                        route.write(&core.registry, &frame, &tail);
                    }
                    let _ = core.handle.watch.send(frame);
                    self.partial_sent = 0;
                    matched += 1;
                }
            }
        }
        if last == MatchStatus::WillMatch && self.frame.len() > self.partial_sent {
            if let Some(route) = self.matcher.matched() {
                let chunk = Bytes::copy_from_slice(&self.frame[self.partial_sent..]);
                if route.write_partial(&core.registry, &chunk) {
                    self.partial_sent = self.frame.len();
                }
            }
        }
        matched
    }
}

/// Reader half: pull bytes off the channel until EOF, error or cancel.
pub async fn run_reader<R>(
    mut reader: R,
    sreader: &mut SentenceReader,
    core: &EndpointCore,
    token: &CancellationToken,
) -> crate::error::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            res = reader.read(&mut buf) => match res {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    core.handle.stats.record_read(n);
                    core.process(sreader, &buf[..n]);
                }
                Err(e) => {
                    return Err(crate::error::RouterError::network(core.name(), e));
                }
            }
        }
    }
}

/// Writer half: drain the endpoint queue onto the channel, flushing once
/// the queue runs dry to keep syscalls off the per-sentence path.
pub async fn run_writer<W>(
    writer: W,
    rx: &mut mpsc::Receiver<Bytes>,
    core: &EndpointCore,
    token: &CancellationToken,
) -> crate::error::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            msg = rx.recv() => match msg {
                None => return Ok(()),
                Some(bytes) => {
                    write_one(&mut writer, &bytes, core).await?;
                    while let Ok(more) = rx.try_recv() {
                        write_one(&mut writer, &more, core).await?;
                    }
                    writer
                        .flush()
                        .await
                        .map_err(|e| crate::error::RouterError::network(core.name(), e))?;
                }
            }
        }
    }
}

async fn write_one<W>(
    writer: &mut BufWriter<W>,
    bytes: &Bytes,
    core: &EndpointCore,
) -> crate::error::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(bytes)
        .await
        .map_err(|e| crate::error::RouterError::network(core.name(), e))?;
    core.handle.stats.record_write(bytes.len());
    Ok(())
}

/// Run both halves of a duplex stream endpoint until either side stops.
pub async fn run_stream_loop<R, W>(
    reader: R,
    writer: W,
    rx: &mut mpsc::Receiver<Bytes>,
    sreader: &mut SentenceReader,
    core: &EndpointCore,
    token: &CancellationToken,
) -> crate::error::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        res = run_reader(reader, sreader, core, token) => res,
        res = run_writer(writer, rx, core, token) => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EndpointKind;

    fn core_with_target(
        source_single_sink: bool,
    ) -> (EndpointCore, EndpointCore, mpsc::Receiver<Bytes>) {
        let registry = Arc::new(Registry::new());
        let (tx_src, _rx_src) = mpsc::channel(8);
        let src = EndpointHandle::new("gps", EndpointKind::Serial, tx_src, CancellationToken::new());
        src.set_matched();
        let (tx_dst, rx_dst) = mpsc::channel(8);
        let dst = EndpointHandle::new("nav", EndpointKind::Serial, tx_dst, CancellationToken::new());
        dst.set_matched();
        dst.set_single_sink(source_single_sink);
        registry.register(src.clone()).expect("register src");
        registry.register(dst.clone()).expect("register dst");
        (
            EndpointCore {
                handle: src,
                registry: registry.clone(),
            },
            EndpointCore {
                handle: dst,
                registry,
            },
            rx_dst,
        )
    }

    fn sentence(body: &str) -> String {
        let cs = body.bytes().fold(0u8, |a, b| a ^ b);
        format!("${}*{:02X}\r\n", body, cs)
    }

    fn reader_for(route: Arc<Route>) -> SentenceReader {
        let mut m = NmeaMatcher::new();
        let prefix = route.prefix().to_string();
        m.add(prefix.as_str(), route);
        m.compile();
        SentenceReader::new(m)
    }

    #[test]
    fn test_full_sentence_delivered_whole() {
        let (src, _dst, mut rx) = core_with_target(false);
        let route = Route::new("$GPRMC", vec!["nav".into()], false, 1500);
        let mut sr = reader_for(route);
        let s = sentence("GPRMC,120000,A");
        assert_eq!(sr.feed(&src, s.as_bytes()), 1);
        let got = rx.try_recv().expect("delivered");
        assert_eq!(&got[..], s.as_bytes());
    }

    #[test]
    fn test_partial_then_remainder_for_single_sink() {
        let (src, _dst, mut rx) = core_with_target(true);
        let route = Route::new("$GPRMC", vec!["nav".into()], false, 1500);
        let mut sr = reader_for(route);
        let s = sentence("GPRMC,120000,A");
        let (head, rest) = s.split_at(9);

        sr.feed(&src, head.as_bytes());
        let chunk = rx.try_recv().expect("partial chunk");
        assert_eq!(&chunk[..], head.as_bytes());

        sr.feed(&src, rest.as_bytes());
        let tail = rx.try_recv().expect("remainder");
        assert_eq!(&tail[..], rest.as_bytes());
        // exactly the sentence, nothing duplicated
        assert_eq!(chunk.len() + tail.len(), s.len());
    }

    #[test]
    fn test_no_partial_for_shared_target() {
        let (src, _dst, mut rx) = core_with_target(false);
        let route = Route::new("$GPRMC", vec!["nav".into()], false, 1500);
        let mut sr = reader_for(route);
        let s = sentence("GPRMC,120000,A");
        let (head, rest) = s.split_at(9);

        sr.feed(&src, head.as_bytes());
        assert!(rx.try_recv().is_err());

        sr.feed(&src, rest.as_bytes());
        let got = rx.try_recv().expect("full frame");
        assert_eq!(&got[..], s.as_bytes());
    }

    #[test]
    fn test_garbage_between_sentences_discarded() {
        let (src, _dst, mut rx) = core_with_target(false);
        let route = Route::new("$GPRMC", vec!["nav".into()], false, 1500);
        let mut sr = reader_for(route);
        let s = sentence("GPRMC,1");
        let stream = format!("@@garbage@@{}junk{}", s, s);
        assert_eq!(sr.feed(&src, stream.as_bytes()), 2);
        assert_eq!(&rx.try_recv().expect("first")[..], s.as_bytes());
        assert_eq!(&rx.try_recv().expect("second")[..], s.as_bytes());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_attachment_bypasses_matching() {
        let (src, _dst, mut rx) = core_with_target(false);
        let route = Route::new("$GPRMC", vec!["nav".into()], false, 1500);
        let mut sr = reader_for(route);

        let (attach_tx, mut attach_rx) = mpsc::channel(8);
        src.handle.attach_sink(attach_tx).expect("attach");

        let s = sentence("GPRMC,1");
        src.process(&mut sr, s.as_bytes());
        // verbatim to the attachment, nothing routed
        assert_eq!(&attach_rx.try_recv().expect("teed")[..], s.as_bytes());
        assert!(rx.try_recv().is_err());

        src.handle.detach();
        src.process(&mut sr, s.as_bytes());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(4), 2.0);
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
        backoff.reset();
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
    }
}
