//! Taint tracker: provenance metadata attached to values.
//!
//! Pure tagging: nothing here decides whether a value may be used. A
//! [`Labeled`] value is either clean or tainted with a [`TaintMetadata`]
//! record, and the distinction is visible at runtime by matching on it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ifc::lattice::{TrustLattice, TrustLevel};
use crate::types::UntrustedReason;

/// Source name for data whose origin could not be established.
pub const UNKNOWN: &str = "UNKNOWN";
/// Source name for values returned from plugin code.
pub const PLUGIN: &str = "PLUGIN";
/// Source name for data arriving from outside the process.
pub const EXTERNAL: &str = "EXTERNAL";

static NEXT_REGISTRY_ID: AtomicU32 = AtomicU32::new(1);

/// Configuration error raised while building a [`TaintSourceRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// No sources were declared.
    #[error("taint source registry must define at least one source")]
    Empty,
    /// A source name was empty.
    #[error("taint source name must be non-empty")]
    EmptyName,
    /// A source was declared twice.
    #[error("duplicate taint source '{name}'")]
    Duplicate {
        /// The repeated name.
        name: String,
    },
    /// A lookup named an undeclared source.
    #[error("unknown taint source '{name}'")]
    Unknown {
        /// The undeclared name.
        name: String,
    },
}

/// Opaque taint source issued by a [`TaintSourceRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaintSource {
    registry: u32,
    index: usize,
}

/// Closed, ordered set of taint sources.
///
/// Declaration order is strictness order: the first source is the
/// strictest. Merging two metadata records keeps the stricter source.
#[derive(Debug)]
pub struct TaintSourceRegistry {
    id: u32,
    names: Vec<String>,
    by_name: HashMap<String, usize>,
}

impl TaintSourceRegistry {
    /// Build a registry from names listed strictest first.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceError`] for an empty list, an empty name or a
    /// duplicate.
    pub fn new<S: AsRef<str>>(names: &[S]) -> Result<Self, SourceError> {
        if names.is_empty() {
            return Err(SourceError::Empty);
        }
        let mut by_name = HashMap::with_capacity(names.len());
        let mut owned = Vec::with_capacity(names.len());
        for (index, name) in names.iter().enumerate() {
            let name = name.as_ref();
            if name.is_empty() {
                return Err(SourceError::EmptyName);
            }
            if by_name.insert(name.to_owned(), index).is_some() {
                return Err(SourceError::Duplicate {
                    name: name.to_owned(),
                });
            }
            owned.push(name.to_owned());
        }
        Ok(Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            names: owned,
            by_name,
        })
    }

    /// The built-in registry: `UNKNOWN`, `PLUGIN`, `EXTERNAL`, strictest first.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches [`new`](Self::new).
    pub fn standard() -> Result<Self, SourceError> {
        Self::new(&[UNKNOWN, PLUGIN, EXTERNAL])
    }

    /// Look up a source by name.
    pub fn get(&self, name: &str) -> Option<TaintSource> {
        self.by_name.get(name).map(|&index| TaintSource {
            registry: self.id,
            index,
        })
    }

    /// Look up a source by name, failing on unknown names.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Unknown`] when `name` was never declared.
    pub fn require(&self, name: &str) -> Result<TaintSource, SourceError> {
        self.get(name).ok_or_else(|| SourceError::Unknown {
            name: name.to_owned(),
        })
    }

    /// Whether `source` was issued by this registry.
    pub fn contains(&self, source: TaintSource) -> bool {
        source.registry == self.id && source.index < self.names.len()
    }

    /// Name of `source`, or `None` for a foreign source.
    pub fn name(&self, source: TaintSource) -> Option<&str> {
        if !self.contains(source) {
            return None;
        }
        self.names.get(source.index).map(String::as_str)
    }

    /// The strictest declared source.
    pub fn strictest(&self) -> TaintSource {
        TaintSource {
            registry: self.id,
            index: 0,
        }
    }

    /// The stricter of two sources. A foreign source yields [`strictest`](Self::strictest).
    pub fn stricter(&self, a: TaintSource, b: TaintSource) -> TaintSource {
        if !self.contains(a) || !self.contains(b) {
            return self.strictest();
        }
        if a.index <= b.index {
            a
        } else {
            b
        }
    }
}

/// Provenance attached to a tainted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaintMetadata {
    /// Where the value came from.
    pub source: TaintSource,
    /// How far the value is trusted.
    pub trust: TrustLevel,
    /// When the value was first tainted.
    pub timestamp: DateTime<Utc>,
}

/// A value that is either clean or carries taint metadata.
#[derive(Debug, Clone, PartialEq)]
pub enum Labeled<T> {
    /// No provenance recorded.
    Clean(T),
    /// Provenance recorded.
    Tainted {
        /// The underlying value.
        value: T,
        /// Its provenance.
        metadata: TaintMetadata,
    },
}

impl<T> Labeled<T> {
    /// Wrap a value with no provenance.
    pub fn clean(value: T) -> Self {
        Self::Clean(value)
    }

    /// Metadata, if the value is tainted.
    pub fn metadata(&self) -> Option<&TaintMetadata> {
        match self {
            Self::Clean(_) => None,
            Self::Tainted { metadata, .. } => Some(metadata),
        }
    }

    /// Borrow the underlying value regardless of taint.
    pub fn value(&self) -> &T {
        match self {
            Self::Clean(value) | Self::Tainted { value, .. } => value,
        }
    }

    /// Consume the wrapper, discarding provenance.
    pub fn into_value(self) -> T {
        match self {
            Self::Clean(value) | Self::Tainted { value, .. } => value,
        }
    }

    /// Transform the value, keeping its metadata.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Labeled<U> {
        match self {
            Self::Clean(value) => Labeled::Clean(f(value)),
            Self::Tainted { value, metadata } => Labeled::Tainted {
                value: f(value),
                metadata,
            },
        }
    }
}

/// Refusal returned by [`assert_trusted`].
///
/// Carries the reason and the required level's name, never the value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("value is not trusted ({reason}); requires {required}")]
pub struct TrustViolation {
    /// Structured reason.
    pub reason: UntrustedReason,
    /// Name of the level the value had to dominate.
    pub required: String,
}

/// Taint `value`. Already-tainted values are returned unchanged.
///
/// A missing timestamp defaults to the current time.
pub fn add_taint<T>(
    value: Labeled<T>,
    source: TaintSource,
    trust: TrustLevel,
    timestamp: Option<DateTime<Utc>>,
) -> Labeled<T> {
    match value {
        Labeled::Clean(value) => Labeled::Tainted {
            value,
            metadata: TaintMetadata {
                source,
                trust,
                timestamp: timestamp.unwrap_or_else(Utc::now),
            },
        },
        tainted @ Labeled::Tainted { .. } => tainted,
    }
}

/// Whether `value` carries taint metadata.
pub fn is_tainted<T>(value: &Labeled<T>) -> bool {
    matches!(value, Labeled::Tainted { .. })
}

/// Remove taint metadata. Clean values pass through unchanged.
pub fn strip_taint<T>(value: Labeled<T>) -> Labeled<T> {
    match value {
        clean @ Labeled::Clean(_) => clean,
        Labeled::Tainted { value, .. } => Labeled::Clean(value),
    }
}

/// Copy `source`'s metadata onto a clean `target`.
///
/// A clean source leaves the target untouched, so taint never accumulates
/// through clean stages. An already-tainted target keeps its own metadata.
pub fn propagate_taint<S, T>(source: &Labeled<S>, target: Labeled<T>) -> Labeled<T> {
    match source.metadata() {
        Some(metadata) => add_taint(
            target,
            metadata.source,
            metadata.trust,
            Some(metadata.timestamp),
        ),
        None => target,
    }
}

/// Combine two metadata records fail-closed.
///
/// Trust is the lattice meet, the source is the stricter one and the
/// timestamp is the earlier one.
pub fn merge_taint_metadata(
    a: &TaintMetadata,
    b: &TaintMetadata,
    lattice: &TrustLattice,
    sources: &TaintSourceRegistry,
) -> TaintMetadata {
    TaintMetadata {
        source: sources.stricter(a.source, b.source),
        trust: lattice.meet(a.trust, b.trust),
        timestamp: a.timestamp.min(b.timestamp),
    }
}

/// Guard usable without the full rule engine.
///
/// Clean values pass. Tainted values pass only when their trust level
/// dominates `required`.
///
/// # Errors
///
/// Returns [`TrustViolation`] with [`UntrustedReason::InsufficientTrust`]
/// when the value's level does not dominate `required`.
pub fn assert_trusted<T>(
    value: &Labeled<T>,
    required: TrustLevel,
    lattice: &TrustLattice,
) -> Result<(), TrustViolation> {
    let Some(metadata) = value.metadata() else {
        return Ok(());
    };
    if lattice.dominates(metadata.trust, required) {
        return Ok(());
    }
    Err(TrustViolation {
        reason: UntrustedReason::InsufficientTrust,
        required: lattice.name(required).unwrap_or("<foreign>").to_owned(),
    })
}
