//! Boundary enforcer: decides whether tainted data may enter plugin code.
//!
//! A check runs the mandatory invariants, then the additive policies, all
//! against one [`DecisionSnapshot`]. Data that passes is stripped of taint
//! and handed out inside a [`TrustedCapability`]; the source trust level
//! goes back to the calling boundary code only, so plugin code cannot learn
//! its own trust level. Plugin output is re-tagged as plugin-sourced at a
//! level clamped to the input's.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ifc::audit::AuditLogger;
use crate::ifc::lattice::{TrustLattice, TrustLevel};
use crate::ifc::taint::{
    add_taint, Labeled, SourceError, TaintMetadata, TaintSource, TaintSourceRegistry, PLUGIN,
};
use crate::types::{CheckResult, UntrustedReason};

static NEXT_ENFORCER_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Decision snapshot
// ---------------------------------------------------------------------------

/// Point-in-time view shared by every rule of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionSnapshot {
    decision_id: Uuid,
    trace_id: String,
    now: DateTime<Utc>,
    capabilities: BTreeSet<String>,
}

impl DecisionSnapshot {
    /// Capture a snapshot. The decision id is freshly generated.
    pub fn new(
        trace_id: impl Into<String>,
        now: DateTime<Utc>,
        capabilities: BTreeSet<String>,
    ) -> Self {
        Self {
            decision_id: Uuid::new_v4(),
            trace_id: trace_id.into(),
            now,
            capabilities,
        }
    }

    /// Unique id of this decision.
    pub fn decision_id(&self) -> Uuid {
        self.decision_id
    }

    /// Trace id of the request being decided.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Clock reading taken once for the whole evaluation.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Whether the caller holds the named capability grant.
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains(name)
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Everything a rule may look at. Never includes the value itself.
#[derive(Debug, Clone, Copy)]
pub struct RuleInput<'a> {
    /// Metadata of the value under check, if any.
    pub metadata: Option<&'a TaintMetadata>,
    /// Level the value must reach.
    pub required: TrustLevel,
    /// Lattice used for comparisons.
    pub lattice: &'a TrustLattice,
    /// Source registry the metadata was drawn from.
    pub sources: &'a TaintSourceRegistry,
    /// Snapshot shared by the evaluation.
    pub snapshot: &'a DecisionSnapshot,
}

type RuleFn = dyn Fn(&RuleInput<'_>) -> CheckResult + Send + Sync;

/// A named, pure decision function.
#[derive(Clone)]
pub struct Rule {
    name: String,
    check: Arc<RuleFn>,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule").field("name", &self.name).finish()
    }
}

impl Rule {
    /// Create a rule from a name and a decision function.
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&RuleInput<'_>) -> CheckResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// Rule name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluate the rule.
    pub fn evaluate(&self, input: &RuleInput<'_>) -> CheckResult {
        (self.check)(input)
    }
}

/// Default invariant: metadata must exist and dominate the required level.
pub fn metadata_dominates_required() -> Rule {
    Rule::new("metadata_dominates_required", |input| {
        let Some(metadata) = input.metadata else {
            return CheckResult::untrusted(UntrustedReason::NoMetadata);
        };
        if input.lattice.dominates(metadata.trust, input.required) {
            CheckResult::Trusted
        } else {
            CheckResult::untrusted(UntrustedReason::InsufficientTrust)
        }
    })
}

/// Refuse any value tainted by one of `denied`.
pub fn deny_sources(denied: Vec<TaintSource>) -> Rule {
    Rule::new("deny_sources", move |input| match input.metadata {
        Some(metadata) if denied.contains(&metadata.source) => {
            CheckResult::untrusted(UntrustedReason::Tainted)
        }
        _ => CheckResult::Trusted,
    })
}

/// Require the caller to hold the named capability grant.
pub fn require_capability(capability: impl Into<String>) -> Rule {
    let capability = capability.into();
    Rule::new(format!("require_capability:{capability}"), move |input| {
        if input.snapshot.has_capability(&capability) {
            CheckResult::Trusted
        } else {
            CheckResult::untrusted(UntrustedReason::PolicyDeny)
        }
    })
}

/// Refuse metadata older than `max` relative to the snapshot clock.
///
/// Timestamps in the future are refused as well.
pub fn max_age(max: Duration) -> Rule {
    Rule::new("max_age", move |input| {
        let Some(metadata) = input.metadata else {
            return CheckResult::Trusted;
        };
        let age = input.snapshot.now().signed_duration_since(metadata.timestamp);
        if age < Duration::zero() || age > max {
            CheckResult::untrusted(UntrustedReason::PolicyDeny)
        } else {
            CheckResult::Trusted
        }
    })
}

/// Configuration error raised while building a [`RuleRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    /// A rule had an empty name.
    #[error("rule name must be non-empty")]
    EmptyName,
    /// Two rules share a name.
    #[error("duplicate rule '{name}'")]
    DuplicateRule {
        /// The repeated name.
        name: String,
    },
}

/// Immutable invariants-then-policies rule set.
#[derive(Debug, Clone)]
pub struct RuleRegistry {
    invariants: Vec<Rule>,
    policies: Vec<Rule>,
}

impl RuleRegistry {
    /// Start building a registry.
    pub fn builder() -> RuleRegistryBuilder {
        RuleRegistryBuilder::default()
    }

    /// The default registry: [`metadata_dominates_required`] and no policies.
    pub fn with_defaults() -> Self {
        Self {
            invariants: vec![metadata_dominates_required()],
            policies: Vec::new(),
        }
    }

    /// Mandatory rules, evaluated first.
    pub fn invariants(&self) -> &[Rule] {
        &self.invariants
    }

    /// Additive rules, evaluated after every invariant passed.
    pub fn policies(&self) -> &[Rule] {
        &self.policies
    }

    /// Run the full evaluation: invariants, then policies.
    ///
    /// An empty invariant list fails closed; an empty policy list allows.
    pub fn evaluate(&self, input: &RuleInput<'_>) -> CheckResult {
        if self.invariants.is_empty() {
            return CheckResult::untrusted(UntrustedReason::PolicyDeny);
        }
        if let Some(denied) = first_denial(&self.invariants, input) {
            return denied;
        }
        first_denial(&self.policies, input).unwrap_or(CheckResult::Trusted)
    }
}

fn first_denial(rules: &[Rule], input: &RuleInput<'_>) -> Option<CheckResult> {
    rules.iter().find_map(|rule| {
        let result = rule.evaluate(input);
        if result.is_trusted() {
            None
        } else {
            debug!(rule = rule.name(), ?result, "rule denied crossing");
            Some(result)
        }
    })
}

/// Builder for a [`RuleRegistry`].
#[derive(Debug, Default)]
pub struct RuleRegistryBuilder {
    invariants: Vec<Rule>,
    policies: Vec<Rule>,
}

impl RuleRegistryBuilder {
    /// Append a mandatory rule.
    #[must_use]
    pub fn invariant(mut self, rule: Rule) -> Self {
        self.invariants.push(rule);
        self
    }

    /// Append an additive policy.
    #[must_use]
    pub fn policy(mut self, rule: Rule) -> Self {
        self.policies.push(rule);
        self
    }

    /// Validate names and freeze the registry.
    ///
    /// # Errors
    ///
    /// Returns a [`RuleError`] for empty or duplicate rule names.
    pub fn build(self) -> Result<RuleRegistry, RuleError> {
        let mut seen = BTreeSet::new();
        for rule in self.invariants.iter().chain(&self.policies) {
            if rule.name.is_empty() {
                return Err(RuleError::EmptyName);
            }
            if !seen.insert(rule.name.as_str()) {
                return Err(RuleError::DuplicateRule {
                    name: rule.name.clone(),
                });
            }
        }
        Ok(RuleRegistry {
            invariants: self.invariants,
            policies: self.policies,
        })
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CapabilityMarker {
    serial: u64,
}

/// Un-tainted value handed to plugin code after a successful check.
///
/// Only a [`BoundaryEnforcer`] can construct one. It carries no provenance
/// and exposes nothing about how many capabilities were issued before it.
pub struct TrustedCapability<T> {
    value: T,
    marker: Arc<CapabilityMarker>,
    issuer: u64,
}

impl<T> fmt::Debug for TrustedCapability<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustedCapability").finish_non_exhaustive()
    }
}

impl<T> TrustedCapability<T> {
    /// Borrow the granted value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Take the granted value.
    pub fn into_value(self) -> T {
        self.value
    }

    /// Issue serial, unique per enforcer. Kept from plugin code.
    pub(crate) fn serial(&self) -> u64 {
        self.marker.serial
    }
}

/// Identity table of live capabilities. Holds weak references only.
#[derive(Debug, Default)]
struct CapabilityTable {
    live: Mutex<Vec<Weak<CapabilityMarker>>>,
}

impl CapabilityTable {
    fn register(&self, marker: &Arc<CapabilityMarker>) {
        match self.live.lock() {
            Ok(mut live) => {
                live.retain(|entry| entry.strong_count() > 0);
                live.push(Arc::downgrade(marker));
            }
            Err(e) => warn!(error = %e, "capability table poisoned; capability will not verify"),
        }
    }

    fn contains(&self, marker: &Arc<CapabilityMarker>) -> bool {
        let Ok(live) = self.live.lock() else {
            return false;
        };
        live.iter()
            .any(|entry| std::ptr::eq(entry.as_ptr(), Arc::as_ptr(marker)))
    }

    fn remove(&self, marker: &Arc<CapabilityMarker>) {
        if let Ok(mut live) = self.live.lock() {
            live.retain(|entry| !std::ptr::eq(entry.as_ptr(), Arc::as_ptr(marker)));
        }
    }
}

// ---------------------------------------------------------------------------
// Boundary enforcer
// ---------------------------------------------------------------------------

/// Caller-supplied description of one boundary crossing.
#[derive(Debug, Clone)]
pub struct BoundaryContext {
    required: TrustLevel,
    trace_id: Option<String>,
    capabilities: BTreeSet<String>,
}

impl BoundaryContext {
    /// A crossing requiring `required`.
    pub fn new(required: TrustLevel) -> Self {
        Self {
            required,
            trace_id: None,
            capabilities: BTreeSet::new(),
        }
    }

    /// Attach the request's trace id. A fresh UUID is used otherwise.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Add a capability grant visible to policies.
    #[must_use]
    pub fn grant(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Required trust level.
    pub fn required(&self) -> TrustLevel {
        self.required
    }
}

/// Refusal returned by a boundary check. Never carries the value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("boundary denied ({reason}); requires {required}")]
pub struct BoundaryDenial {
    /// Structured reason.
    pub reason: UntrustedReason,
    /// Name of the level the value had to reach.
    pub required: String,
    /// Decision id, matching the audit trail.
    pub decision_id: Uuid,
}

/// Successful check: the capability plus the source trust level.
///
/// `source_trust` is for boundary code; it must not be forwarded to plugins.
#[derive(Debug)]
pub struct Granted<T> {
    /// Capability holding the un-tainted value.
    pub capability: TrustedCapability<T>,
    /// Trust level the value carried before stripping.
    pub source_trust: TrustLevel,
    /// Decision id, matching the audit trail.
    pub decision_id: Uuid,
    /// Trace id the decision was recorded under.
    pub trace_id: String,
}

/// Rule engine guarding the plugin boundary.
pub struct BoundaryEnforcer {
    id: u64,
    lattice: Arc<TrustLattice>,
    sources: Arc<TaintSourceRegistry>,
    rules: Arc<RuleRegistry>,
    plugin_source: TaintSource,
    clock: fn() -> DateTime<Utc>,
    capabilities: CapabilityTable,
    serials: AtomicU64,
    audit: Option<Arc<AuditLogger>>,
}

impl fmt::Debug for BoundaryEnforcer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundaryEnforcer")
            .field("id", &self.id)
            .field("lattice", &self.lattice)
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl BoundaryEnforcer {
    /// Create an enforcer tagging plugin output with the `PLUGIN` source.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Unknown`] if `sources` has no `PLUGIN` entry.
    pub fn new(
        lattice: Arc<TrustLattice>,
        sources: Arc<TaintSourceRegistry>,
        rules: Arc<RuleRegistry>,
    ) -> Result<Self, SourceError> {
        let plugin_source = sources.require(PLUGIN)?;
        Ok(Self {
            id: NEXT_ENFORCER_ID.fetch_add(1, Ordering::Relaxed),
            lattice,
            sources,
            rules,
            plugin_source,
            clock: Utc::now,
            capabilities: CapabilityTable::default(),
            serials: AtomicU64::new(1),
            audit: None,
        })
    }

    /// Tag plugin output with a different source.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Unknown`] if `source` is not from this
    /// enforcer's registry.
    pub fn with_plugin_source(mut self, source: TaintSource) -> Result<Self, SourceError> {
        if !self.sources.contains(source) {
            return Err(SourceError::Unknown {
                name: "<foreign>".to_owned(),
            });
        }
        self.plugin_source = source;
        Ok(self)
    }

    /// Replace the snapshot clock.
    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Write every decision to `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// The lattice decisions are made against.
    pub fn lattice(&self) -> &TrustLattice {
        &self.lattice
    }

    /// The source registry metadata is drawn from.
    pub fn sources(&self) -> &TaintSourceRegistry {
        &self.sources
    }

    /// Capture the snapshot for one evaluation.
    pub fn snapshot(&self, ctx: &BoundaryContext) -> DecisionSnapshot {
        let trace_id = ctx
            .trace_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        DecisionSnapshot::new(trace_id, (self.clock)(), ctx.capabilities.clone())
    }

    /// Evaluate the rule registry against metadata alone.
    pub fn evaluate(
        &self,
        metadata: Option<&TaintMetadata>,
        required: TrustLevel,
        snapshot: &DecisionSnapshot,
    ) -> CheckResult {
        let input = RuleInput {
            metadata,
            required,
            lattice: &self.lattice,
            sources: &self.sources,
            snapshot,
        };
        self.rules.evaluate(&input)
    }

    /// Check `value` and, on success, issue a capability holding it.
    ///
    /// # Errors
    ///
    /// Returns [`BoundaryDenial`] when any invariant or policy refuses the
    /// crossing, or when the value carries no metadata.
    pub fn check<T>(
        &self,
        value: Labeled<T>,
        ctx: &BoundaryContext,
    ) -> Result<Granted<T>, BoundaryDenial> {
        let snapshot = self.snapshot(ctx);
        let metadata = value.metadata().copied();

        let result = self.evaluate(metadata.as_ref(), ctx.required, &snapshot);
        let source_trust = match (result, metadata) {
            (CheckResult::Trusted, Some(metadata)) => metadata.trust,
            (CheckResult::Trusted, None) => {
                return Err(self.deny(&snapshot, UntrustedReason::NoMetadata, ctx.required));
            }
            (CheckResult::Untrusted { reason }, _) => {
                return Err(self.deny(&snapshot, reason, ctx.required));
            }
        };

        let capability = self.issue(value.into_value());
        debug!(
            decision_id = %snapshot.decision_id(),
            trace_id = snapshot.trace_id(),
            serial = capability.serial(),
            "boundary check granted"
        );
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log_granted(
                snapshot.decision_id(),
                snapshot.trace_id(),
                self.level_name(ctx.required),
                self.level_name(source_trust),
            ) {
                warn!(error = %e, "failed to audit log boundary grant");
            }
        }

        Ok(Granted {
            capability,
            source_trust,
            decision_id: snapshot.decision_id(),
            trace_id: snapshot.trace_id().to_owned(),
        })
    }

    /// Check `value`, run `plugin` on the capability, and re-tag its output.
    ///
    /// The output is tagged with the plugin source at
    /// `meet(result_trust, input_trust)`, so it never exceeds the input's
    /// trust. The capability is revoked once the plugin returns.
    ///
    /// # Errors
    ///
    /// Returns [`BoundaryDenial`] when the check fails; the plugin is not run.
    pub fn execute_with_boundary<T, R>(
        &self,
        value: Labeled<T>,
        plugin: impl FnOnce(&TrustedCapability<T>) -> R,
        ctx: &BoundaryContext,
        result_trust: TrustLevel,
    ) -> Result<Labeled<R>, BoundaryDenial> {
        let granted = self.check(value, ctx)?;
        let output = plugin(&granted.capability);
        self.revoke(&granted.capability);

        let assigned = self.lattice.meet(result_trust, granted.source_trust);
        info!(
            decision_id = %granted.decision_id,
            requested = self.level_name(result_trust),
            assigned = self.level_name(assigned),
            "plugin output re-tagged"
        );
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log_plugin_output(
                granted.decision_id,
                &granted.trace_id,
                self.level_name(result_trust),
                self.level_name(assigned),
            ) {
                warn!(error = %e, "failed to audit log plugin output");
            }
        }

        Ok(add_taint(
            Labeled::clean(output),
            self.plugin_source,
            assigned,
            Some((self.clock)()),
        ))
    }

    /// Whether `capability` was issued by this enforcer and is still live.
    pub fn verify<T>(&self, capability: &TrustedCapability<T>) -> bool {
        capability.issuer == self.id && self.capabilities.contains(&capability.marker)
    }

    /// Revoke a capability so it no longer verifies.
    pub fn revoke<T>(&self, capability: &TrustedCapability<T>) {
        if capability.issuer == self.id {
            self.capabilities.remove(&capability.marker);
        }
    }

    fn issue<T>(&self, value: T) -> TrustedCapability<T> {
        let marker = Arc::new(CapabilityMarker {
            serial: self.serials.fetch_add(1, Ordering::Relaxed),
        });
        self.capabilities.register(&marker);
        TrustedCapability {
            value,
            marker,
            issuer: self.id,
        }
    }

    fn deny(
        &self,
        snapshot: &DecisionSnapshot,
        reason: UntrustedReason,
        required: TrustLevel,
    ) -> BoundaryDenial {
        let required_name = self.level_name(required);
        warn!(
            decision_id = %snapshot.decision_id(),
            trace_id = snapshot.trace_id(),
            %reason,
            required = required_name,
            "boundary check denied"
        );
        if let Some(audit) = &self.audit {
            if let Err(e) =
                audit.log_denied(snapshot.decision_id(), snapshot.trace_id(), reason, required_name)
            {
                warn!(error = %e, "failed to audit log boundary denial");
            }
        }
        BoundaryDenial {
            reason,
            required: required_name.to_owned(),
            decision_id: snapshot.decision_id(),
        }
    }

    fn level_name(&self, level: TrustLevel) -> &str {
        self.lattice.name(level).unwrap_or("<foreign>")
    }
}
