//! Streaming NMEA 0183 sentence validation.
//!
//! [`NmeaMatcher`] is a byte-at-a-time state machine that validates sentence
//! framing and checksum against a compiled set of prefix patterns. Each
//! registered prefix carries an associated value (typically a route) that is
//! retrievable after a match. The matcher is fed every byte an endpoint
//! reads; it never buffers, the caller owns the frame bytes.
//!
//! Framing rules: a sentence starts with `$` or `!`, the running XOR
//! checksum covers the bytes after the framing byte up to (not including)
//! `*`, followed by two hex digits and `\r\n`.

use crate::stats::MatcherCounters;
use std::sync::Arc;

/// Outcome of feeding one byte to the matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    /// The byte may start or continue a prefix; no commitment yet.
    Ok,
    /// The byte belongs to a sentence whose prefix has matched (or just
    /// completed); a full match is still possible.
    WillMatch,
    /// The byte completed a checksum-valid, `\r\n`-terminated sentence.
    Match,
    /// Framing or checksum failure; the matcher has reset.
    Error,
}

/// Running XOR checksum with NMEA framing rules baked in.
///
/// Zeroed whenever a framing byte (`$` or `!`) is seen, stops accumulating
/// at `*`, so it can simply be fed every byte of the stream.
#[derive(Debug, Default)]
struct NmeaChecksum {
    value: u8,
    accumulating: bool,
}

impl NmeaChecksum {
    fn update(&mut self, b: u8) {
        match b {
            b'$' | b'!' => {
                self.value = 0;
                self.accumulating = true;
            }
            b'*' => self.accumulating = false,
            _ if self.accumulating => self.value ^= b,
            _ => {}
        }
    }

    fn value(&self) -> u8 {
        self.value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Prefix,
    Data,
    Checksum1,
    Checksum2,
    Cr,
    Lf,
}

/// Compiled multi-prefix sentence matcher.
///
/// Register `(prefix, value)` pairs with [`add`](Self::add), then call
/// [`compile`](Self::compile) once. `?` in a prefix matches any single
/// byte. When two prefixes could match the same input, the one completing
/// earliest wins; among prefixes completing on the same byte, the first
/// registered wins.
pub struct NmeaMatcher<T> {
    patterns: Vec<(Vec<u8>, T)>,
    compiled: bool,
    state: State,
    /// Per-pattern liveness during prefix matching.
    alive: Vec<bool>,
    pos: usize,
    checksum: NmeaChecksum,
    captured: u8,
    /// Index of the prefix that matched the current (or last) sentence.
    pending: Option<usize>,
    /// True once a prefix has completed; errors before that are noise and
    /// are not counted.
    parsing: bool,
    counters: Arc<MatcherCounters>,
}

impl<T> NmeaMatcher<T> {
    pub fn new() -> Self {
        Self::with_counters(Arc::new(MatcherCounters::default()))
    }

    /// Create a matcher that reports into shared counters, so that the
    /// operator `errors` command sees totals across matcher rebuilds.
    pub fn with_counters(counters: Arc<MatcherCounters>) -> Self {
        Self {
            patterns: Vec::new(),
            compiled: false,
            state: State::Prefix,
            alive: Vec::new(),
            pos: 0,
            checksum: NmeaChecksum::default(),
            captured: 0,
            pending: None,
            parsing: false,
            counters,
        }
    }

    /// Register a prefix pattern. Must be called before [`compile`](Self::compile).
    pub fn add(&mut self, prefix: &str, value: T) {
        debug_assert!(!self.compiled, "add after compile");
        debug_assert!(!prefix.is_empty(), "empty prefix");
        self.patterns.push((prefix.as_bytes().to_vec(), value));
    }

    /// Finish registration. No further [`add`](Self::add) calls are allowed.
    pub fn compile(&mut self) {
        self.compiled = true;
        self.alive = vec![true; self.patterns.len()];
        self.reset();
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Value associated with the prefix of the current (possibly still
    /// incomplete) sentence. Available from the moment the prefix completes.
    pub fn matched(&self) -> Option<&T> {
        self.pending.map(|i| &self.patterns[i].1)
    }

    /// True while inside a sentence whose prefix has already matched.
    pub fn in_sentence(&self) -> bool {
        self.state != State::Prefix
    }

    pub fn counters(&self) -> &Arc<MatcherCounters> {
        &self.counters
    }

    /// Discard all in-progress state, back to hunting for a prefix.
    pub fn reset(&mut self) {
        self.state = State::Prefix;
        self.pos = 0;
        self.alive.iter_mut().for_each(|a| *a = true);
        self.parsing = false;
        self.pending = None;
    }

    /// Feed one byte; see [`MatchStatus`] for the contract.
    pub fn match_byte(&mut self, b: u8) -> MatchStatus {
        debug_assert!(self.compiled, "match_byte before compile");
        self.checksum.update(b);
        match self.state {
            State::Prefix => self.match_prefix(b),
            State::Data => match b {
                b'*' => {
                    self.captured = self.checksum.value();
                    self.state = State::Checksum1;
                    MatchStatus::WillMatch
                }
                b'\r' | b'\n' => self.error(),
                _ => MatchStatus::WillMatch,
            },
            State::Checksum1 => {
                if parse_hex(b) == Some(self.captured >> 4) {
                    self.state = State::Checksum2;
                    MatchStatus::WillMatch
                } else {
                    self.error()
                }
            }
            State::Checksum2 => {
                if parse_hex(b) == Some(self.captured & 0xf) {
                    self.state = State::Cr;
                    MatchStatus::WillMatch
                } else {
                    self.error()
                }
            }
            State::Cr => {
                if b == b'\r' {
                    self.state = State::Lf;
                    MatchStatus::WillMatch
                } else {
                    self.error()
                }
            }
            State::Lf => {
                if b == b'\n' {
                    let pending = self.pending;
                    self.reset();
                    self.pending = pending;
                    self.counters.add_match();
                    MatchStatus::Match
                } else {
                    self.error()
                }
            }
        }
    }

    fn match_prefix(&mut self, b: u8) -> MatchStatus {
        let mut any_alive = false;
        let mut complete = None;
        for (i, (pat, _)) in self.patterns.iter().enumerate() {
            if !self.alive[i] {
                continue;
            }
            let pc = pat[self.pos];
            if pc == b'?' || pc == b {
                if self.pos + 1 == pat.len() && complete.is_none() {
                    complete = Some(i);
                }
                any_alive = true;
            } else {
                self.alive[i] = false;
            }
        }
        match complete {
            Some(i) => {
                self.state = State::Data;
                self.parsing = true;
                self.pending = Some(i);
                MatchStatus::WillMatch
            }
            None if any_alive => {
                self.pos += 1;
                MatchStatus::Ok
            }
            None => self.error(),
        }
    }

    fn error(&mut self) -> MatchStatus {
        if self.parsing {
            self.counters.add_error();
        }
        self.reset();
        MatchStatus::Error
    }
}

impl<T> Default for NmeaMatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
