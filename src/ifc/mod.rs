//! Information-flow control: the trusted core of the plugin boundary.
//!
//! All trust decisions happen here: lattice comparisons, taint tagging,
//! rule evaluation, capability issue and revocation.

pub mod audit;
pub mod boundary;
pub mod lattice;
pub mod taint;

pub use boundary::{
    BoundaryContext, BoundaryDenial, BoundaryEnforcer, DecisionSnapshot, Granted, Rule,
    RuleError, RuleInput, RuleRegistry, TrustedCapability,
};
pub use lattice::{LatticeError, TrustLattice, TrustLevel};
pub use taint::{
    add_taint, assert_trusted, is_tainted, merge_taint_metadata, propagate_taint, strip_taint,
    Labeled, SourceError, TaintMetadata, TaintSource, TaintSourceRegistry, TrustViolation,
};
