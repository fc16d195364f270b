#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

//! Port resolution logic tests.
//!
//! Drives the claim/trial/match cycle against the registry and matcher
//! manager without real serial hardware: each simulated port carries a
//! fixed traffic stream, and a "tick" lets every unresolved endpoint claim
//! a port and listen to it through its resolution matcher.

use ahash::{AHashMap, AHashSet};
use nmearouter::matcher::MatchStatus;
use nmearouter::matcher_manager::{MatcherManager, SerialRoutes};
use nmearouter::registry::{PortClaim, Registry};
use nmearouter::route::Route;
use nmearouter::stats::MatcherCounters;
use std::sync::Arc;

fn sentence(body: &str) -> String {
    let cs = body.bytes().fold(0u8, |a, b| a ^ b);
    format!("${}*{:02X}\r\n", body, cs)
}

struct Endpoint {
    name: String,
    tried: AHashSet<String>,
    matched_port: Option<String>,
}

impl Endpoint {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tried: AHashSet::new(),
            matched_port: None,
        }
    }
}

fn serial_routes(speed: u32, prefixes: &[&str]) -> SerialRoutes {
    SerialRoutes {
        speed,
        routes: prefixes
            .iter()
            .map(|p| Route::new(p, vec![], false, 1500))
            .collect(),
    }
}

/// One resolution attempt for one endpoint: claim a port, feed that port's
/// traffic through the resolution matcher, succeed or give the port back.
fn tick(
    endpoint: &mut Endpoint,
    registry: &Registry,
    manager: &MatcherManager,
    wire: &AHashMap<String, String>,
) {
    if endpoint.matched_port.is_some() {
        return;
    }
    let Some(mut matcher) =
        manager.resolve_matcher(&endpoint.name, Arc::new(MatcherCounters::default()))
    else {
        return; // everything ambiguous right now
    };
    match registry.claim_port(None, &endpoint.tried) {
        PortClaim::Claimed { port, .. } => {
            endpoint.tried.insert(port.clone());
            let traffic = wire.get(&port).map(String::as_str).unwrap_or("");
            let matched = traffic
                .bytes()
                .any(|b| matcher.match_byte(b) == MatchStatus::Match);
            if matched {
                endpoint.matched_port = Some(port.clone());
                manager.on_matched(&endpoint.name);
                registry.mark_matched(&endpoint.name);
            } else {
                registry.release_port(port);
            }
        }
        PortClaim::Exhausted => endpoint.tried.clear(),
        PortClaim::NoneFree => {}
    }
}

// ============================================================================
// Deterministic binding
// ============================================================================

#[test]
fn test_two_endpoints_find_their_ports() {
    // whatever order the pool enumerates, traffic decides the binding
    for seed_order in [
        vec!["/dev/ttyUSB0", "/dev/ttyUSB1"],
        vec!["/dev/ttyUSB1", "/dev/ttyUSB0"],
    ] {
        let registry = Registry::new();
        registry.seed_ports(seed_order.iter().map(|s| s.to_string()));
        registry.set_serial_total(2);
        let manager = MatcherManager::new(
            [
                ("gps".to_string(), serial_routes(4800, &["$GP???"])),
                ("compass".to_string(), serial_routes(4800, &["$II???"])),
            ],
            vec![],
        );

        let mut wire = AHashMap::new();
        wire.insert("/dev/ttyUSB0".to_string(), sentence("IIHDG,245.1"));
        wire.insert("/dev/ttyUSB1".to_string(), sentence("GPRMC,120034,A"));

        let mut gps = Endpoint::new("gps");
        let mut compass = Endpoint::new("compass");
        for _ in 0..10 {
            tick(&mut gps, &registry, &manager, &wire);
            tick(&mut compass, &registry, &manager, &wire);
            if gps.matched_port.is_some() && compass.matched_port.is_some() {
                break;
            }
        }

        assert_eq!(gps.matched_port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(compass.matched_port.as_deref(), Some("/dev/ttyUSB0"));
    }
}

#[test]
fn test_garbage_port_never_confirms() {
    let registry = Registry::new();
    registry.seed_ports(["/dev/ttyUSB0".to_string(), "/dev/ttyUSB1".to_string()]);
    registry.set_serial_total(1);
    let manager = MatcherManager::new(
        [("gps".to_string(), serial_routes(4800, &["$GPRMC"]))],
        vec![],
    );

    let mut wire = AHashMap::new();
    // wrong-baud garbage on one port, real traffic on the other
    wire.insert(
        "/dev/ttyUSB0".to_string(),
        "\u{fffd}x\u{0}\u{7f}$GPRMC,no,checksum\r\n".to_string(),
    );
    wire.insert("/dev/ttyUSB1".to_string(), sentence("GPRMC,120034,A"));

    let mut gps = Endpoint::new("gps");
    for _ in 0..10 {
        tick(&mut gps, &registry, &manager, &wire);
        if gps.matched_port.is_some() {
            break;
        }
    }
    assert_eq!(gps.matched_port.as_deref(), Some("/dev/ttyUSB1"));
}

// ============================================================================
// Ambiguity
// ============================================================================

#[test]
fn test_ambiguous_pair_resolves_via_distinct_prefix() {
    let registry = Registry::new();
    registry.seed_ports(["p0".to_string(), "p1".to_string()]);
    registry.set_serial_total(2);
    // "all" could match anything the gps sends; it must wait until the
    // gps has been pinned down elsewhere
    let manager = MatcherManager::new(
        [
            ("gps".to_string(), serial_routes(4800, &["$GPRMC"])),
            ("all".to_string(), serial_routes(4800, &["$?????"])),
        ],
        vec![],
    );
    assert!(manager.is_ambiguous(4800, "$?????"));
    assert!(manager.is_ambiguous(4800, "$GPRMC"));

    let mut wire = AHashMap::new();
    wire.insert("p0".to_string(), sentence("IIHDG,1"));
    wire.insert("p1".to_string(), sentence("GPRMC,1"));

    let mut gps = Endpoint::new("gps");
    let mut all = Endpoint::new("all");
    for _ in 0..20 {
        tick(&mut gps, &registry, &manager, &wire);
        tick(&mut all, &registry, &manager, &wire);
        if gps.matched_port.is_some() && all.matched_port.is_some() {
            break;
        }
    }

    // with both prefixes ambiguous, nothing can resolve until...
    // nothing: the pair is fully ambiguous and neither binds
    assert_eq!(gps.matched_port, None);
    assert_eq!(all.matched_port, None);
}

#[test]
fn test_ambiguity_lifts_once_contender_is_matched() {
    let registry = Registry::new();
    registry.seed_ports(["p0".to_string(), "p1".to_string()]);
    registry.set_serial_total(2);
    // gps has a second, unambiguous prefix to resolve with
    let manager = MatcherManager::new(
        [
            ("gps".to_string(), serial_routes(4800, &["$GPRMC", "$GPGGA"])),
            ("nav".to_string(), serial_routes(4800, &["$GPRMC"])),
        ],
        vec![],
    );
    assert!(manager.is_ambiguous(4800, "$GPRMC"));
    assert!(!manager.is_ambiguous(4800, "$GPGGA"));

    let mut wire = AHashMap::new();
    wire.insert("p0".to_string(), sentence("GPGGA,fix"));
    wire.insert("p1".to_string(), sentence("GPRMC,pos"));

    let mut gps = Endpoint::new("gps");
    let mut nav = Endpoint::new("nav");
    for _ in 0..20 {
        tick(&mut gps, &registry, &manager, &wire);
        tick(&mut nav, &registry, &manager, &wire);
        if gps.matched_port.is_some() && nav.matched_port.is_some() {
            break;
        }
    }

    assert_eq!(gps.matched_port.as_deref(), Some("p0"));
    // once gps is matched, $GPRMC stops being ambiguous and nav binds
    assert_eq!(nav.matched_port.as_deref(), Some("p1"));
    assert!(!manager.is_ambiguous(4800, "$GPRMC"));
}

// ============================================================================
// Exhaustion and termination
// ============================================================================

#[test]
fn test_more_endpoints_than_ports_terminates() {
    let registry = Registry::new();
    registry.seed_ports(["p0".to_string(), "p1".to_string()]);
    registry.set_serial_total(3);
    let manager = MatcherManager::new(
        [
            ("a".to_string(), serial_routes(4800, &["$AA???"])),
            ("b".to_string(), serial_routes(4800, &["$BB???"])),
            ("c".to_string(), serial_routes(4800, &["$CC???"])),
        ],
        vec![],
    );

    let mut wire = AHashMap::new();
    wire.insert("p0".to_string(), sentence("AAXYZ,1"));
    wire.insert("p1".to_string(), sentence("BBXYZ,1"));

    let mut endpoints = vec![Endpoint::new("a"), Endpoint::new("b"), Endpoint::new("c")];
    for _ in 0..50 {
        for ep in &mut endpoints {
            tick(ep, &registry, &manager, &wire);
        }
    }

    let matched: Vec<_> = endpoints
        .iter()
        .filter_map(|e| e.matched_port.as_deref())
        .collect();
    assert_eq!(matched.len(), 2, "at most as many bindings as ports");
    // no double assignment
    let unique: AHashSet<_> = matched.iter().collect();
    assert_eq!(unique.len(), matched.len());
    // the unlucky endpoint keeps retrying without crashing
    assert_eq!(endpoints[2].matched_port, None);
}

#[test]
fn test_resolution_bookkeeping_discarded_once_complete() {
    let registry = Registry::new();
    registry.seed_ports(["p0".to_string(), "p1".to_string()]);
    registry.set_serial_total(1);
    let manager = MatcherManager::new(
        [("gps".to_string(), serial_routes(4800, &["$GP???"]))],
        vec![],
    );

    let mut wire = AHashMap::new();
    wire.insert("p0".to_string(), sentence("GPRMC,1"));
    wire.insert("p1".to_string(), String::new());

    let mut gps = Endpoint::new("gps");
    for _ in 0..10 {
        tick(&mut gps, &registry, &manager, &wire);
        if gps.matched_port.is_some() {
            break;
        }
    }
    assert!(gps.matched_port.is_some());

    // the last match completes the set; pool is drained and closed
    let freed = registry.finish_resolution();
    assert!(!freed.is_empty());
    assert!(registry.resolution_done());
    assert_eq!(
        registry.claim_port(None, &AHashSet::new()),
        PortClaim::NoneFree,
        "matched ports are never reopened or reassigned"
    );
}

#[test]
fn test_kill_frees_port_for_other_endpoint() {
    let registry = Registry::new();
    registry.seed_ports(["p0".to_string()]);
    registry.set_serial_total(2);
    let manager = MatcherManager::new(
        [
            ("a".to_string(), serial_routes(4800, &["$AA???"])),
            ("b".to_string(), serial_routes(4800, &["$AA???"])),
        ],
        vec![],
    );

    // both endpoints declare the same prefix at the same speed: fully
    // ambiguous, neither can bind
    let wire = {
        let mut w = AHashMap::new();
        w.insert("p0".to_string(), sentence("AAXYZ,1"));
        w
    };
    let mut a = Endpoint::new("a");
    let mut b = Endpoint::new("b");
    tick(&mut a, &registry, &manager, &wire);
    tick(&mut b, &registry, &manager, &wire);
    assert_eq!(a.matched_port, None);
    assert_eq!(b.matched_port, None);

    // killing one contender lifts the ambiguity and frees the field
    manager.on_killed("b");
    registry.kill_serial("b");
    for _ in 0..10 {
        tick(&mut a, &registry, &manager, &wire);
        if a.matched_port.is_some() {
            break;
        }
    }
    assert_eq!(a.matched_port.as_deref(), Some("p0"));
}
