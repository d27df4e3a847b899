//! Taint tagging, propagation and the standalone trust guard.

use chrono::{TimeZone, Utc};
use trustflow::ifc::taint::{EXTERNAL, PLUGIN, UNKNOWN};
use trustflow::ifc::{
    add_taint, assert_trusted, is_tainted, merge_taint_metadata, propagate_taint, strip_taint,
    Labeled, TaintSourceRegistry, TrustLattice,
};
use trustflow::types::UntrustedReason;

fn setup() -> (TrustLattice, TaintSourceRegistry) {
    (
        TrustLattice::linear(&["UNTRUSTED", "VERIFIED", "TRUSTED"]).expect("lattice"),
        TaintSourceRegistry::standard().expect("sources"),
    )
}

#[test]
fn tainting_twice_keeps_first_metadata() {
    let (lattice, sources) = setup();
    let first = add_taint(
        Labeled::clean(serde_json::json!({"id": 1})),
        sources.require(EXTERNAL).expect("source"),
        lattice.require("VERIFIED").expect("level"),
        None,
    );
    let second = add_taint(
        first.clone(),
        sources.require(PLUGIN).expect("source"),
        lattice.require("TRUSTED").expect("level"),
        Some(Utc::now()),
    );
    assert_eq!(first, second);
}

#[test]
fn strip_removes_taint() {
    let (lattice, sources) = setup();
    let tainted = add_taint(
        Labeled::clean(vec![1, 2, 3]),
        sources.require(EXTERNAL).expect("source"),
        lattice.bottom(),
        None,
    );
    assert!(is_tainted(&tainted));
    let stripped = strip_taint(tainted);
    assert!(!is_tainted(&stripped));
    assert_eq!(stripped, Labeled::clean(vec![1, 2, 3]));
}

#[test]
fn propagation_copies_identical_metadata() {
    let (lattice, sources) = setup();
    let source = add_taint(
        Labeled::clean("input"),
        sources.require(EXTERNAL).expect("source"),
        lattice.require("VERIFIED").expect("level"),
        None,
    );
    let derived = propagate_taint(&source, Labeled::clean(42));
    assert_eq!(derived.metadata(), source.metadata());
}

#[test]
fn propagation_from_clean_source_changes_nothing() {
    let clean = Labeled::clean("input");
    let target = Labeled::clean(42);
    assert_eq!(propagate_taint(&clean, target.clone()), target);
}

#[test]
fn merge_is_fail_closed() {
    let (lattice, sources) = setup();
    let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("ts");
    let late = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).single().expect("ts");

    let a = add_taint(
        Labeled::clean(()),
        sources.require(EXTERNAL).expect("source"),
        lattice.require("TRUSTED").expect("level"),
        Some(late),
    );
    let b = add_taint(
        Labeled::clean(()),
        sources.require(UNKNOWN).expect("source"),
        lattice.require("VERIFIED").expect("level"),
        Some(early),
    );
    let merged = merge_taint_metadata(
        a.metadata().expect("tainted"),
        b.metadata().expect("tainted"),
        &lattice,
        &sources,
    );
    assert_eq!(lattice.name(merged.trust), Some("VERIFIED"));
    assert_eq!(sources.name(merged.source), Some(UNKNOWN));
    assert_eq!(merged.timestamp, early);
}

#[test]
fn assert_trusted_accepts_clean_and_dominating_values() {
    let (lattice, sources) = setup();
    let verified = lattice.require("VERIFIED").expect("level");
    assert!(assert_trusted(&Labeled::clean(1), verified, &lattice).is_ok());

    let trusted = add_taint(
        Labeled::clean(1),
        sources.require(EXTERNAL).expect("source"),
        lattice.require("TRUSTED").expect("level"),
        None,
    );
    assert!(assert_trusted(&trusted, verified, &lattice).is_ok());
}

#[test]
fn assert_trusted_rejects_low_trust_without_leaking_value() {
    let (lattice, sources) = setup();
    let low = add_taint(
        Labeled::clean("secret-payload"),
        sources.require(EXTERNAL).expect("source"),
        lattice.require("UNTRUSTED").expect("level"),
        None,
    );
    let err = assert_trusted(&low, lattice.require("VERIFIED").expect("level"), &lattice)
        .expect_err("must reject");
    assert_eq!(err.reason, UntrustedReason::InsufficientTrust);
    assert_eq!(err.required, "VERIFIED");
    assert!(!err.to_string().contains("secret-payload"));
    assert!(!format!("{err:?}").contains("secret-payload"));
}

#[test]
fn map_keeps_metadata() {
    let (lattice, sources) = setup();
    let tainted = add_taint(
        Labeled::clean(2),
        sources.require(EXTERNAL).expect("source"),
        lattice.bottom(),
        None,
    );
    let metadata = tainted.metadata().copied();
    let rendered = tainted.map(|n: i32| n.to_string());
    assert_eq!(rendered.value(), "2");
    assert_eq!(rendered.metadata().copied(), metadata);
}
