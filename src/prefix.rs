//! Sentence prefix patterns.
//!
//! Routes classify sentences by a literal prefix in which `?` matches any
//! single character, e.g. `$??RMC` matches `$GPRMC` and `$IIRMC`. Patterns
//! never look past the prefix: the sentence body is opaque to routing.

/// A literal-with-wildcards sentence prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NmeaPrefix {
    pattern: String,
}

impl NmeaPrefix {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// A strict prefix contains no wildcards.
    pub fn is_strict(&self) -> bool {
        !self.pattern.contains('?')
    }

    /// Whether `bytes` starts with this pattern.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        let pat = self.pattern.as_bytes();
        if bytes.len() < pat.len() {
            return false;
        }
        pat.iter()
            .zip(bytes)
            .all(|(&p, &b)| p == b'?' || p == b)
    }

    /// Whether two patterns can match the same sentence.
    ///
    /// Compared position by position over the shorter length; a wildcard on
    /// either side matches anything, so `$GP???` and `$GPRMC` collide while
    /// `$GP???` and `$II???` do not. Used to detect prefixes that cannot
    /// tell two unresolved endpoints apart.
    pub fn matches_same(p1: &str, p2: &str) -> bool {
        p1.bytes()
            .zip(p2.bytes())
            .all(|(c1, c2)| c1 == b'?' || c2 == b'?' || c1 == c2)
    }
}

impl std::fmt::Display for NmeaPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict() {
        assert!(NmeaPrefix::new("$GPRMC").is_strict());
        assert!(!NmeaPrefix::new("$GP???").is_strict());
    }

    #[test]
    fn test_matches() {
        let p = NmeaPrefix::new("$??RMC");
        assert!(p.matches(b"$GPRMC,120000,A"));
        assert!(p.matches(b"$IIRMC,120000,A"));
        assert!(!p.matches(b"$GPGGA,120000"));
        assert!(!p.matches(b"$GP"));
    }

    #[test]
    fn test_matches_same() {
        assert!(NmeaPrefix::matches_same("$GP???", "$GPRMC"));
        assert!(NmeaPrefix::matches_same("$GPRMC", "$GPRMC"));
        assert!(NmeaPrefix::matches_same("$??RMC", "$IIRMC"));
        assert!(!NmeaPrefix::matches_same("$GP???", "$II???"));
        assert!(!NmeaPrefix::matches_same("$GPRMC", "$GPGGA"));
        // compared over the shorter length
        assert!(NmeaPrefix::matches_same("$GP", "$GPRMC"));
    }
}
