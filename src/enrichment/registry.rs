//! Enricher registry: the immutable set of enrichers, split into groups.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use super::Enricher;

/// Configuration error raised while building an [`EnricherRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// An enricher had an empty name.
    #[error("enricher name must be non-empty")]
    EmptyName,
    /// Two enrichers share a name.
    #[error("duplicate enricher '{name}'")]
    DuplicateEnricher {
        /// The repeated name.
        name: String,
    },
    /// A signal is declared by more than one enricher.
    #[error("signal '{signal}' is provided by both '{first}' and '{second}'")]
    ConflictingProvider {
        /// The contested signal.
        signal: String,
        /// Enricher registered first.
        first: String,
        /// Enricher registered second.
        second: String,
    },
}

/// Immutable enricher set. Every signal has at most one declared provider.
#[derive(Debug)]
pub struct EnricherRegistry<C> {
    invariants: Vec<Enricher<C>>,
    policies: Vec<Enricher<C>>,
}

impl<C> EnricherRegistry<C> {
    /// Start building a registry.
    pub fn builder() -> EnricherRegistryBuilder<C> {
        EnricherRegistryBuilder {
            invariants: Vec::new(),
            policies: Vec::new(),
        }
    }

    /// Enrichers in the invariant group, in registration order.
    pub fn invariants(&self) -> &[Enricher<C>] {
        &self.invariants
    }

    /// Enrichers in the policy group, in registration order.
    pub fn policies(&self) -> &[Enricher<C>] {
        &self.policies
    }

    /// Name of the enricher declaring `signal`, if any.
    pub fn provider_of(&self, signal: &str) -> Option<&str> {
        self.invariants
            .iter()
            .chain(&self.policies)
            .find(|e| e.provided().iter().any(|s| s == signal))
            .map(Enricher::name)
    }
}

/// Builder for an [`EnricherRegistry`].
#[derive(Debug)]
pub struct EnricherRegistryBuilder<C> {
    invariants: Vec<Enricher<C>>,
    policies: Vec<Enricher<C>>,
}

impl<C> EnricherRegistryBuilder<C> {
    /// Register a mandatory enricher.
    #[must_use]
    pub fn invariant(mut self, enricher: Enricher<C>) -> Self {
        self.invariants.push(enricher);
        self
    }

    /// Register an additive enricher.
    #[must_use]
    pub fn policy(mut self, enricher: Enricher<C>) -> Self {
        self.policies.push(enricher);
        self
    }

    /// Validate names and providers and freeze the registry.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] for empty or duplicate enricher names, or
    /// when one signal is declared by two enrichers (or twice by one).
    pub fn build(self) -> Result<EnricherRegistry<C>, RegistryError> {
        let mut names = BTreeSet::new();
        let mut providers: BTreeMap<&str, &str> = BTreeMap::new();

        for enricher in self.invariants.iter().chain(&self.policies) {
            if enricher.name().is_empty() {
                return Err(RegistryError::EmptyName);
            }
            if !names.insert(enricher.name()) {
                return Err(RegistryError::DuplicateEnricher {
                    name: enricher.name().to_owned(),
                });
            }
            for signal in enricher.provided() {
                if let Some(first) = providers.insert(signal, enricher.name()) {
                    return Err(RegistryError::ConflictingProvider {
                        signal: signal.clone(),
                        first: first.to_owned(),
                        second: enricher.name().to_owned(),
                    });
                }
            }
        }

        Ok(EnricherRegistry {
            invariants: self.invariants,
            policies: self.policies,
        })
    }
}
