//! Declarative signal enrichment.
//!
//! Enrichers are small pure units that derive named signals from an opaque
//! request context. The engine orders them by signal dependency, runs the
//! invariant group before the policy group, and collects every error it
//! meets instead of stopping at the first one.

pub mod engine;
pub mod equality;
pub mod graph;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::SignalMap;

pub use engine::EnrichmentEngine;
pub use equality::signals_equal;
pub use registry::{EnricherRegistry, EnricherRegistryBuilder, RegistryError};

// ---------------------------------------------------------------------------
// Enricher
// ---------------------------------------------------------------------------

/// What one enricher returns: new signals plus any errors it wants to report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnricherOutput {
    /// Derived signals.
    pub signals: SignalMap,
    /// Error messages reported by the enricher itself.
    pub errors: Vec<String>,
}

impl EnricherOutput {
    /// Add a signal.
    #[must_use]
    pub fn signal(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.signals.insert(name.into(), value);
        self
    }

    /// Add an error message.
    #[must_use]
    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.errors.push(message.into());
        self
    }
}

type EnrichFn<C> = dyn Fn(&C, &SignalMap) -> EnricherOutput + Send + Sync;

/// A named unit deriving signals from context `C`.
pub struct Enricher<C> {
    name: String,
    provides: Vec<String>,
    depends_on: Vec<String>,
    enrich: Arc<EnrichFn<C>>,
}

impl<C> Clone for Enricher<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            provides: self.provides.clone(),
            depends_on: self.depends_on.clone(),
            enrich: Arc::clone(&self.enrich),
        }
    }
}

impl<C> fmt::Debug for Enricher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enricher")
            .field("name", &self.name)
            .field("provides", &self.provides)
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

impl<C> Enricher<C> {
    /// Create an enricher with no declared signals or dependencies.
    pub fn new(
        name: impl Into<String>,
        enrich: impl Fn(&C, &SignalMap) -> EnricherOutput + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            provides: Vec::new(),
            depends_on: Vec::new(),
            enrich: Arc::new(enrich),
        }
    }

    /// Declare the signals this enricher produces.
    #[must_use]
    pub fn provides<I, S>(mut self, signals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.provides.extend(signals.into_iter().map(Into::into));
        self
    }

    /// Declare the signals this enricher needs before it can run.
    #[must_use]
    pub fn depends_on<I, S>(mut self, signals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(signals.into_iter().map(Into::into));
        self
    }

    /// Enricher name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared output signals.
    pub fn provided(&self) -> &[String] {
        &self.provides
    }

    /// Declared input signals.
    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    /// Run the enricher.
    pub fn enrich(&self, context: &C, signals: &SignalMap) -> EnricherOutput {
        (self.enrich)(context, signals)
    }
}

// ---------------------------------------------------------------------------
// Errors and results
// ---------------------------------------------------------------------------

/// Which of the two sequential groups an enricher belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentGroup {
    /// Mandatory enrichers, run first.
    Invariants,
    /// Additive enrichers, run second with invariant signals visible.
    Policies,
}

impl fmt::Display for EnrichmentGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invariants => f.write_str("invariants"),
            Self::Policies => f.write_str("policies"),
        }
    }
}

/// Error category, for filtering and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrichmentErrorKind {
    /// A declared dependency was absent.
    MissingDependency,
    /// An enricher was not run.
    SkippedEnricher,
    /// Two writers disagreed on a signal value.
    ConflictingSignals,
    /// The group's dependency graph has a cycle.
    CircularDependency,
    /// The enricher reported an error or panicked.
    EnricherError,
}

/// One accumulated enrichment error. Signal values are never included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrichmentError {
    /// `enricher` depends on `signal`, which was not available.
    MissingDependency {
        /// Enricher that was gated.
        enricher: String,
        /// Absent signal.
        signal: String,
    },
    /// `enricher` was skipped because of `missing` dependencies.
    SkippedEnricher {
        /// Enricher that was skipped.
        enricher: String,
        /// Every absent dependency.
        missing: Vec<String>,
    },
    /// `enricher` produced a value for `signal` that differs from the existing one.
    ConflictingSignals {
        /// Contested signal.
        signal: String,
        /// Enricher whose value was discarded.
        enricher: String,
        /// Enricher that wrote first, or `None` for a seeded signal.
        first_writer: Option<String>,
    },
    /// The dependency graph of `group` contains a cycle along `path`.
    CircularDependency {
        /// Aborted group.
        group: EnrichmentGroup,
        /// Enricher names along the cycle, first name repeated at the end.
        path: Vec<String>,
    },
    /// `enricher` reported `message`.
    EnricherError {
        /// Reporting enricher.
        enricher: String,
        /// Reported message.
        message: String,
    },
}

impl EnrichmentError {
    /// Category of this error.
    pub fn kind(&self) -> EnrichmentErrorKind {
        match self {
            Self::MissingDependency { .. } => EnrichmentErrorKind::MissingDependency,
            Self::SkippedEnricher { .. } => EnrichmentErrorKind::SkippedEnricher,
            Self::ConflictingSignals { .. } => EnrichmentErrorKind::ConflictingSignals,
            Self::CircularDependency { .. } => EnrichmentErrorKind::CircularDependency,
            Self::EnricherError { .. } => EnrichmentErrorKind::EnricherError,
        }
    }
}

/// Full result of one engine run, returned even when errors occurred.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichmentResult {
    /// Every signal that was materialized.
    pub signals: SignalMap,
    /// Every error that was recorded, in execution order.
    pub errors: Vec<EnrichmentError>,
}

impl EnrichmentResult {
    /// Whether any error was recorded.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Errors of one category.
    pub fn errors_of(&self, kind: EnrichmentErrorKind) -> impl Iterator<Item = &EnrichmentError> {
        self.errors.iter().filter(move |e| e.kind() == kind)
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Telemetry hook receiving one callback per recorded error.
///
/// Each category method forwards to [`on_error`](Self::on_error) by
/// default, so implementors can override either level.
pub trait EnrichmentObserver: Send + Sync {
    /// A dependency was missing.
    fn on_missing_dependency(&self, error: &EnrichmentError) {
        self.on_error(error);
    }

    /// An enricher was skipped.
    fn on_skipped_enricher(&self, error: &EnrichmentError) {
        self.on_error(error);
    }

    /// Two writers disagreed on a signal.
    fn on_conflicting_signals(&self, error: &EnrichmentError) {
        self.on_error(error);
    }

    /// A group was aborted because of a cycle.
    fn on_circular_dependency(&self, error: &EnrichmentError) {
        self.on_error(error);
    }

    /// An enricher reported an error.
    fn on_enricher_error(&self, error: &EnrichmentError) {
        self.on_error(error);
    }

    /// Catch-all for every category.
    fn on_error(&self, _error: &EnrichmentError) {}
}
