//! Ambiguous-prefix bookkeeping for port resolution.
//!
//! A prefix is ambiguous at a given serial speed when a different
//! not-yet-resolved endpoint at the same speed declares a prefix that could
//! match the same traffic. Ambiguous prefixes must not decide a port
//! binding, so resolution matchers are built without them; the full matcher
//! installed after resolution carries every prefix again. The sets shrink
//! as endpoints match or are killed, and are recomputed on each such event.

use crate::matcher::NmeaMatcher;
use crate::prefix::NmeaPrefix;
use crate::route::Route;
use crate::stats::MatcherCounters;
use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Routes and speed of one serial endpoint awaiting resolution.
pub struct SerialRoutes {
    pub speed: u32,
    pub routes: Vec<Arc<Route>>,
}

#[derive(Default)]
struct Inner {
    /// Serial endpoints not yet matched.
    unmatched: AHashMap<String, SerialRoutes>,
    /// speed -> prefixes excluded from resolution matchers
    ambiguous: AHashMap<u32, AHashSet<String>>,
    /// Every route of every live endpoint, for backup linking.
    all_routes: Vec<(String, Arc<Route>)>,
}

pub struct MatcherManager {
    inner: Mutex<Inner>,
}

impl MatcherManager {
    pub fn new(
        serial: impl IntoIterator<Item = (String, SerialRoutes)>,
        all_routes: Vec<(String, Arc<Route>)>,
    ) -> Self {
        let mut inner = Inner {
            unmatched: serial.into_iter().collect(),
            ambiguous: AHashMap::new(),
            all_routes,
        };
        let speeds: AHashSet<u32> = inner.unmatched.values().map(|r| r.speed).collect();
        for speed in speeds {
            recompute(&mut inner, speed);
        }
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Build the resolution-only matcher for an unresolved endpoint: its
    /// prefixes minus the currently ambiguous ones at its speed. `None`
    /// when nothing unambiguous remains, in which case the endpoint should
    /// not claim a port yet.
    pub fn resolve_matcher(
        &self,
        name: &str,
        counters: Arc<MatcherCounters>,
    ) -> Option<NmeaMatcher<Arc<Route>>> {
        let inner = self.inner.lock();
        let entry = inner.unmatched.get(name)?;
        let excluded = inner.ambiguous.get(&entry.speed);
        let mut matcher = NmeaMatcher::with_counters(counters);
        for route in &entry.routes {
            let prefix = route.prefix().as_str();
            if excluded.is_some_and(|set| set.contains(prefix)) {
                continue;
            }
            matcher.add(prefix, route.clone());
        }
        if matcher.is_empty() {
            return None;
        }
        matcher.compile();
        Some(matcher)
    }

    /// An endpoint resolved: stop considering it for ambiguity.
    pub fn on_matched(&self, name: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.unmatched.remove(name) {
            recompute(&mut inner, entry.speed);
        }
    }

    /// An endpoint was killed: forget it and its routes entirely.
    pub fn on_killed(&self, name: &str) {
        let mut inner = self.inner.lock();
        inner.all_routes.retain(|(owner, _)| owner != name);
        if let Some(entry) = inner.unmatched.remove(name) {
            recompute(&mut inner, entry.speed);
        }
    }

    pub fn is_ambiguous(&self, speed: u32, prefix: &str) -> bool {
        self.inner
            .lock()
            .ambiguous
            .get(&speed)
            .is_some_and(|set| set.contains(prefix))
    }

    /// Wire every backup route to the non-backup routes carrying the same
    /// prefix pattern. Called once, when resolution completes.
    pub fn link_backups(&self) {
        let inner = self.inner.lock();
        let mut primaries: AHashMap<&str, Vec<Arc<Route>>> = AHashMap::new();
        for (_, route) in &inner.all_routes {
            if !route.is_backup() {
                primaries
                    .entry(route.prefix().as_str())
                    .or_default()
                    .push(route.clone());
            }
        }
        for (owner, route) in &inner.all_routes {
            if route.is_backup() {
                let sources = primaries
                    .get(route.prefix().as_str())
                    .cloned()
                    .unwrap_or_default();
                debug!(
                    endpoint = %owner,
                    prefix = %route.prefix(),
                    sources = sources.len(),
                    "linked backup route"
                );
                route.set_backup_sources(sources);
            }
        }
    }
}

/// Build an endpoint's full matcher from all of its routes, ambiguity
/// ignored. `None` when the endpoint declares no routes (it is then a pure
/// sink, not a source).
pub fn build_full_matcher(
    routes: &[Arc<Route>],
    counters: Arc<MatcherCounters>,
) -> Option<NmeaMatcher<Arc<Route>>> {
    if routes.is_empty() {
        return None;
    }
    let mut matcher = NmeaMatcher::with_counters(counters);
    for route in routes {
        matcher.add(route.prefix().as_str(), route.clone());
    }
    matcher.compile();
    Some(matcher)
}

fn recompute(inner: &mut Inner, speed: u32) {
    let mut set = AHashSet::new();
    let group: Vec<(&String, &SerialRoutes)> = inner
        .unmatched
        .iter()
        .filter(|(_, r)| r.speed == speed)
        .collect();
    for (i, (_, r1)) in group.iter().enumerate() {
        for (_, r2) in group.iter().skip(i + 1) {
            for route1 in &r1.routes {
                for route2 in &r2.routes {
                    let p1 = route1.prefix().as_str();
                    let p2 = route2.prefix().as_str();
                    if NmeaPrefix::matches_same(p1, p2) {
                        set.insert(p1.to_string());
                        set.insert(p2.to_string());
                    }
                }
            }
        }
    }
    if set.is_empty() {
        inner.ambiguous.remove(&speed);
    } else {
        debug!(speed, prefixes = ?set, "ambiguous prefixes");
        inner.ambiguous.insert(speed, set);
    }
}
