#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

//! Sentence matcher contract tests.
//!
//! Covers:
//! - Exactly one Match per valid sentence, Ok/WillMatch in between
//! - Checksum corruption detected at the offending hex digit
//! - Resynchronization after noise and framing errors
//! - Wildcard prefixes and AIS `!` framing

use nmearouter::matcher::{MatchStatus, NmeaMatcher};

fn sentence(body: &str) -> String {
    let cs = body.bytes().fold(0u8, |a, b| a ^ b);
    format!("${}*{:02X}\r\n", body, cs)
}

fn feed<T>(m: &mut NmeaMatcher<T>, input: &[u8]) -> Vec<MatchStatus> {
    input.iter().map(|&b| m.match_byte(b)).collect()
}

// ============================================================================
// Valid sentences
// ============================================================================

#[test]
fn test_valid_sentence_yields_exactly_one_match() {
    let mut m = NmeaMatcher::new();
    m.add("$GPRMC", "rmc");
    m.compile();

    let s = sentence("GPRMC,120034,A,6009.1234,N,02458.7654,E,5.2,123.4");
    let statuses = feed(&mut m, s.as_bytes());

    let match_count = statuses
        .iter()
        .filter(|s| **s == MatchStatus::Match)
        .count();
    assert_eq!(match_count, 1, "exactly one Match per sentence");
    assert_eq!(*statuses.last().unwrap(), MatchStatus::Match);
    assert!(
        statuses[..statuses.len() - 1]
            .iter()
            .all(|s| matches!(s, MatchStatus::Ok | MatchStatus::WillMatch)),
        "intermediate calls are Ok/WillMatch"
    );
    assert_eq!(m.matched(), Some(&"rmc"));
}

#[test]
fn test_byte_by_byte_across_arbitrary_splits() {
    // the matcher is stateful; splitting input anywhere must not matter
    let s = sentence("GPGGA,120034,6009.1234,N,02458.7654,E,1,08,0.9,5.4,M");
    for split in 1..s.len() - 1 {
        let mut m = NmeaMatcher::new();
        m.add("$GPGGA", ());
        m.compile();
        let (a, b) = s.as_bytes().split_at(split);
        let mut statuses = Vec::new();
        statuses.extend(a.iter().map(|&x| m.match_byte(x)));
        statuses.extend(b.iter().map(|&x| m.match_byte(x)));
        assert_eq!(*statuses.last().unwrap(), MatchStatus::Match, "split at {split}");
    }
}

// ============================================================================
// Checksum validation
// ============================================================================

#[test]
fn test_each_corrupted_checksum_digit_is_caught() {
    let good = sentence("GPRMC,120034,A");
    let star = good.find('*').unwrap();

    for digit in 0..2 {
        let mut bad = good.clone().into_bytes();
        let idx = star + 1 + digit;
        bad[idx] = if bad[idx] == b'0' { b'1' } else { b'0' };

        let mut m = NmeaMatcher::new();
        m.add("$GPRMC", ());
        m.compile();

        let mut saw_match = false;
        let mut error_at = None;
        for (i, &b) in bad.iter().enumerate() {
            match m.match_byte(b) {
                MatchStatus::Match => saw_match = true,
                // later bytes of the ruined sentence error too; the
                // first error is the interesting one
                MatchStatus::Error if error_at.is_none() => error_at = Some(i),
                _ => {}
            }
        }
        assert!(!saw_match, "corrupt digit {digit} must never match");
        assert_eq!(
            error_at,
            Some(star + 1 + digit),
            "error surfaces at the corrupted nibble"
        );
        assert_eq!(m.counters().errors(), 1);
    }
}

#[test]
fn test_body_corruption_fails_at_checksum() {
    let mut s = sentence("SDDBT,8.1,f,2.4,M,1.3,F").into_bytes();
    s[8] ^= 0x01; // flip one payload bit
    let mut m = NmeaMatcher::new();
    m.add("$SDDBT", ());
    m.compile();
    let mut saw_match = false;
    for &b in &s {
        if m.match_byte(b) == MatchStatus::Match {
            saw_match = true;
        }
    }
    assert!(!saw_match);
}

// ============================================================================
// Resynchronization
// ============================================================================

#[test]
fn test_recovers_after_truncated_sentence() {
    let mut m = NmeaMatcher::new();
    m.add("$GPRMC", ());
    m.compile();

    // a sentence cut off by a new frame start
    feed(&mut m, b"$GPRMC,120034,A\r");
    assert_eq!(m.counters().errors(), 1);

    let s = sentence("GPRMC,120035,A");
    let statuses = feed(&mut m, s.as_bytes());
    assert_eq!(*statuses.last().unwrap(), MatchStatus::Match);
    assert_eq!(m.counters().matches(), 1);
}

#[test]
fn test_noise_between_sentences_not_counted_as_errors() {
    let mut m = NmeaMatcher::new();
    m.add("$GPRMC", ());
    m.compile();

    let s = sentence("GPRMC,1");
    let mut stream = Vec::new();
    stream.extend_from_slice(b"\x00\xff binary junk \x7f");
    stream.extend_from_slice(s.as_bytes());
    stream.extend_from_slice(b"more junk");
    stream.extend_from_slice(s.as_bytes());

    let matches = stream
        .iter()
        .filter(|&&b| m.match_byte(b) == MatchStatus::Match)
        .count();
    assert_eq!(matches, 2);
    assert_eq!(m.counters().errors(), 0, "noise is not an error");
}

// ============================================================================
// Prefix behavior
// ============================================================================

#[test]
fn test_wildcards_select_the_right_route() {
    let mut m = NmeaMatcher::new();
    m.add("$??RMC", "rmc");
    m.add("$??GGA", "gga");
    m.compile();

    let s = sentence("IIGGA,1");
    feed(&mut m, s.as_bytes());
    assert_eq!(m.matched(), Some(&"gga"));

    let s = sentence("GPRMC,1");
    feed(&mut m, s.as_bytes());
    assert_eq!(m.matched(), Some(&"rmc"));
}

#[test]
fn test_ais_bang_framing() {
    let mut m = NmeaMatcher::new();
    m.add("!AIVDM", "ais");
    m.compile();
    let body = "AIVDM,1,1,,B,177KQJ5000G?tO`K>RA1wUbN0TKH,0";
    let cs = body.bytes().fold(0u8, |a, b| a ^ b);
    let s = format!("!{}*{:02X}\r\n", body, cs);
    let statuses: Vec<_> = s.bytes().map(|b| m.match_byte(b)).collect();
    assert_eq!(*statuses.last().unwrap(), MatchStatus::Match);
    assert_eq!(m.matched(), Some(&"ais"));
}

#[test]
fn test_unrelated_talker_ignored() {
    let mut m = NmeaMatcher::new();
    m.add("$GPRMC", ());
    m.compile();
    let s = sentence("HCHDG,245.1,,,6.1,W");
    let statuses = feed(&mut m, s.as_bytes());
    assert!(statuses.iter().all(|s| *s != MatchStatus::Match));
    assert_eq!(m.counters().errors(), 0);
}
