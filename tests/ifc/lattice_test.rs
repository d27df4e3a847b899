//! Lattice law checks over linear and partial orders.

use trustflow::ifc::{TrustLattice, TrustLevel};

fn linear() -> TrustLattice {
    TrustLattice::linear(&["UNTRUSTED", "VERIFIED", "TRUSTED"]).expect("linear lattice")
}

/// NONE < {READ, WRITE} < {ADMIN}; AUDIT sits above READ only.
fn partial() -> TrustLattice {
    TrustLattice::builder()
        .level("NONE")
        .level("READ")
        .level("WRITE")
        .level("AUDIT")
        .level("ADMIN")
        .order("READ", "NONE")
        .order("WRITE", "NONE")
        .order("AUDIT", "READ")
        .order("ADMIN", "AUDIT")
        .order("ADMIN", "WRITE")
        .build()
        .expect("partial lattice")
}

fn all(lattice: &TrustLattice) -> Vec<TrustLevel> {
    lattice.levels().collect()
}

fn check_laws(lattice: &TrustLattice) {
    let levels = all(lattice);
    for &a in &levels {
        assert_eq!(lattice.meet(a, a), a, "idempotent");
        for &b in &levels {
            let m = lattice.meet(a, b);
            assert_eq!(m, lattice.meet(b, a), "commutative");
            assert!(lattice.dominates(a, m), "meet below a");
            assert!(lattice.dominates(b, m), "meet below b");
            for &c in &levels {
                assert_eq!(
                    lattice.meet(lattice.meet(a, b), c),
                    lattice.meet(a, lattice.meet(b, c)),
                    "associative"
                );
                if lattice.dominates(a, c) && lattice.dominates(b, c) {
                    assert!(lattice.dominates(m, c), "meet is the greatest lower bound");
                }
            }
        }
    }
}

#[test]
fn linear_lattice_obeys_laws() {
    check_laws(&linear());
}

#[test]
fn partial_lattice_obeys_laws() {
    check_laws(&partial());
}

#[test]
fn incomparable_levels_do_not_dominate_each_other() {
    let lattice = partial();
    let audit = lattice.require("AUDIT").expect("level");
    let write = lattice.require("WRITE").expect("level");
    assert!(!lattice.dominates(audit, write));
    assert!(!lattice.dominates(write, audit));
    assert_eq!(lattice.name(lattice.meet(audit, write)), Some("NONE"));
}

#[test]
fn top_and_bottom() {
    let lattice = partial();
    assert_eq!(lattice.name(lattice.bottom()), Some("NONE"));
    assert_eq!(lattice.top().and_then(|t| lattice.name(t)), Some("ADMIN"));
}

#[test]
fn meet_all_folds() {
    let lattice = partial();
    let audit = lattice.require("AUDIT").expect("level");
    let admin = lattice.require("ADMIN").expect("level");
    let read = lattice.require("READ").expect("level");
    assert_eq!(lattice.meet_all([admin, audit, read]), Some(read));
    assert_eq!(lattice.meet_all([]), None);
}

#[test]
fn unknown_level_lookup_is_an_error() {
    let lattice = linear();
    assert!(lattice.level("ROOT").is_none());
    assert!(lattice.require("ROOT").is_err());
}
