//! Enrichment engine: runs an [`EnricherRegistry`] over a request context.
//!
//! Execution plans are fixed when the engine is built. A run threads one
//! accumulator through the invariant group and then the policy group; every
//! problem becomes an [`EnrichmentError`] in the result and nothing is
//! thrown mid-run.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use super::equality::signals_equal;
use super::graph::{plan, GroupPlan};
use super::{
    Enricher, EnricherRegistry, EnrichmentError, EnrichmentGroup, EnrichmentObserver,
    EnrichmentResult,
};
use crate::types::SignalMap;

/// Signals and errors gathered so far in one run.
#[derive(Debug, Default)]
struct Accumulator {
    signals: SignalMap,
    writers: BTreeMap<String, String>,
    errors: Vec<EnrichmentError>,
}

/// Dependency-ordered enricher executor.
pub struct EnrichmentEngine<C> {
    registry: Arc<EnricherRegistry<C>>,
    invariant_plan: GroupPlan,
    policy_plan: GroupPlan,
    observer: Option<Arc<dyn EnrichmentObserver>>,
}

impl<C> std::fmt::Debug for EnrichmentEngine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentEngine")
            .field("invariant_plan", &self.invariant_plan)
            .field("policy_plan", &self.policy_plan)
            .finish_non_exhaustive()
    }
}

impl<C> EnrichmentEngine<C> {
    /// Build an engine, planning both groups up front.
    pub fn new(registry: Arc<EnricherRegistry<C>>) -> Self {
        let invariant_plan = plan(registry.invariants());
        let policy_plan = plan(registry.policies());
        Self {
            registry,
            invariant_plan,
            policy_plan,
            observer: None,
        }
    }

    /// Report every recorded error to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn EnrichmentObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Plan for one group.
    pub fn plan(&self, group: EnrichmentGroup) -> &GroupPlan {
        match group {
            EnrichmentGroup::Invariants => &self.invariant_plan,
            EnrichmentGroup::Policies => &self.policy_plan,
        }
    }

    /// Run both groups over `context` starting from an empty signal map.
    pub fn run(&self, context: &C) -> EnrichmentResult {
        self.run_with_signals(context, SignalMap::new())
    }

    /// Run both groups over `context` starting from `seed`.
    ///
    /// Seeded signals satisfy dependencies and take part in conflict
    /// detection like any other signal.
    pub fn run_with_signals(&self, context: &C, seed: SignalMap) -> EnrichmentResult {
        let mut acc = Accumulator {
            signals: seed,
            ..Accumulator::default()
        };

        self.run_group(
            EnrichmentGroup::Invariants,
            self.registry.invariants(),
            &self.invariant_plan,
            context,
            &mut acc,
        );
        self.run_group(
            EnrichmentGroup::Policies,
            self.registry.policies(),
            &self.policy_plan,
            context,
            &mut acc,
        );

        debug!(
            signals = acc.signals.len(),
            errors = acc.errors.len(),
            "enrichment run complete"
        );
        EnrichmentResult {
            signals: acc.signals,
            errors: acc.errors,
        }
    }

    fn run_group(
        &self,
        group: EnrichmentGroup,
        enrichers: &[Enricher<C>],
        plan: &GroupPlan,
        context: &C,
        acc: &mut Accumulator,
    ) {
        match plan {
            GroupPlan::Cyclic(path) => {
                self.record(
                    acc,
                    EnrichmentError::CircularDependency {
                        group,
                        path: path.clone(),
                    },
                );
            }
            GroupPlan::Ordered(order) => {
                for enricher in order.iter().filter_map(|&i| enrichers.get(i)) {
                    self.run_enricher(enricher, context, acc);
                }
            }
        }
    }

    fn run_enricher(&self, enricher: &Enricher<C>, context: &C, acc: &mut Accumulator) {
        let missing: Vec<String> = enricher
            .dependencies()
            .iter()
            .filter(|signal| !acc.signals.contains_key(signal.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            for signal in &missing {
                self.record(
                    acc,
                    EnrichmentError::MissingDependency {
                        enricher: enricher.name().to_owned(),
                        signal: signal.clone(),
                    },
                );
            }
            self.record(
                acc,
                EnrichmentError::SkippedEnricher {
                    enricher: enricher.name().to_owned(),
                    missing,
                },
            );
            return;
        }

        let output = match catch_unwind(AssertUnwindSafe(|| enricher.enrich(context, &acc.signals)))
        {
            Ok(output) => output,
            Err(_) => {
                self.record(
                    acc,
                    EnrichmentError::EnricherError {
                        enricher: enricher.name().to_owned(),
                        message: "enricher panicked".to_owned(),
                    },
                );
                return;
            }
        };

        for message in output.errors {
            self.record(
                acc,
                EnrichmentError::EnricherError {
                    enricher: enricher.name().to_owned(),
                    message,
                },
            );
        }

        for (signal, value) in output.signals {
            self.merge(enricher, signal, value, acc);
        }
    }

    /// First writer wins; a differing second value is reported and dropped.
    fn merge(
        &self,
        enricher: &Enricher<C>,
        signal: String,
        value: serde_json::Value,
        acc: &mut Accumulator,
    ) {
        if let Some(existing) = acc.signals.get(&signal) {
            if signals_equal(existing, &value) {
                return;
            }
            let first_writer = acc.writers.get(&signal).cloned();
            self.record(
                acc,
                EnrichmentError::ConflictingSignals {
                    signal,
                    enricher: enricher.name().to_owned(),
                    first_writer,
                },
            );
            return;
        }

        if !enricher.provided().contains(&signal) {
            debug!(enricher = enricher.name(), %signal, "enricher produced undeclared signal");
        }
        acc.writers.insert(signal.clone(), enricher.name().to_owned());
        acc.signals.insert(signal, value);
    }

    fn record(&self, acc: &mut Accumulator, error: EnrichmentError) {
        match &error {
            EnrichmentError::MissingDependency { enricher, signal } => {
                debug!(%enricher, %signal, "missing dependency");
            }
            EnrichmentError::SkippedEnricher { enricher, missing } => {
                debug!(%enricher, ?missing, "skipped enricher");
            }
            EnrichmentError::ConflictingSignals {
                signal, enricher, ..
            } => {
                warn!(%signal, %enricher, "conflicting signal value discarded");
            }
            EnrichmentError::CircularDependency { group, path } => {
                warn!(%group, ?path, "circular dependency; group skipped");
            }
            EnrichmentError::EnricherError { enricher, message } => {
                warn!(%enricher, %message, "enricher reported error");
            }
        }

        if let Some(observer) = &self.observer {
            match &error {
                EnrichmentError::MissingDependency { .. } => observer.on_missing_dependency(&error),
                EnrichmentError::SkippedEnricher { .. } => observer.on_skipped_enricher(&error),
                EnrichmentError::ConflictingSignals { .. } => {
                    observer.on_conflicting_signals(&error);
                }
                EnrichmentError::CircularDependency { .. } => {
                    observer.on_circular_dependency(&error);
                }
                EnrichmentError::EnricherError { .. } => observer.on_enricher_error(&error),
            }
        }

        acc.errors.push(error);
    }
}
