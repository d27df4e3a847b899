//! Configuration loading and validation.
//!
//! Registries are described in one TOML file read at startup:
//! - `[lattice]`: trust levels and their order
//! - `[taint]`: taint sources, strictest first
//! - `[boundary]`: plugin source and the rules layered on the default invariant
//! - `[logging]`: subscriber defaults

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;

use crate::ifc::boundary::{
    deny_sources, max_age, metadata_dominates_required, require_capability, BoundaryEnforcer,
    RuleRegistry,
};
use crate::ifc::lattice::{LatticeError, TrustLattice};
use crate::ifc::taint::{SourceError, TaintSourceRegistry, EXTERNAL, PLUGIN, UNKNOWN};

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Trust lattice definition.
    #[serde(default)]
    pub lattice: LatticeConfig,

    /// Taint source registry.
    #[serde(default)]
    pub taint: TaintConfig,

    /// Boundary enforcer settings.
    #[serde(default)]
    pub boundary: BoundaryConfig,

    /// Logging defaults.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Trust levels and their order.
#[derive(Debug, Deserialize)]
pub struct LatticeConfig {
    /// Level names. Without `order`, listed lowest first and totally ordered.
    #[serde(default = "default_levels")]
    pub levels: Vec<String>,

    /// Explicit covering pairs for a partial order.
    #[serde(default)]
    pub order: Vec<OrderPair>,
}

impl Default for LatticeConfig {
    fn default() -> Self {
        Self {
            levels: default_levels(),
            order: Vec::new(),
        }
    }
}

/// One `higher` dominates `lower` declaration.
#[derive(Debug, Deserialize)]
pub struct OrderPair {
    /// The more trusted level.
    pub higher: String,
    /// The less trusted level.
    pub lower: String,
}

/// Taint source registry configuration.
#[derive(Debug, Deserialize)]
pub struct TaintConfig {
    /// Source names, strictest first.
    #[serde(default = "default_sources")]
    pub sources: Vec<String>,
}

impl Default for TaintConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
        }
    }
}

/// Boundary enforcer configuration.
#[derive(Debug, Deserialize)]
pub struct BoundaryConfig {
    /// Source assigned to plugin output.
    #[serde(default = "default_plugin_source")]
    pub plugin_source: String,

    /// Sources refused outright, as an extra invariant.
    #[serde(default)]
    pub denied_sources: Vec<String>,

    /// Capability grants every crossing must hold, one policy each.
    #[serde(default)]
    pub required_capabilities: Vec<String>,

    /// Maximum age of taint metadata, as a policy.
    #[serde(default)]
    pub max_taint_age_secs: Option<u64>,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            plugin_source: default_plugin_source(),
            denied_sources: Vec::new(),
            required_capabilities: Vec::new(),
            max_taint_age_secs: None,
        }
    }
}

/// Logging defaults, overridden by `RUST_LOG`.
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON instead of human-readable lines.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value functions for serde

fn default_levels() -> Vec<String> {
    vec![
        "UNTRUSTED".to_owned(),
        "VERIFIED".to_owned(),
        "TRUSTED".to_owned(),
    ]
}
fn default_sources() -> Vec<String> {
    vec![UNKNOWN.to_owned(), PLUGIN.to_owned(), EXTERNAL.to_owned()]
}
fn default_plugin_source() -> String {
    PLUGIN.to_owned()
}
fn default_log_level() -> String {
    "info".to_owned()
}

impl Config {
    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML for this schema.
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).context("failed to parse config")
    }

    /// Build the trust lattice.
    ///
    /// # Errors
    ///
    /// Returns a [`LatticeError`] for an invalid level set or order.
    pub fn build_lattice(&self) -> Result<TrustLattice, LatticeError> {
        if self.lattice.order.is_empty() {
            return TrustLattice::linear(&self.lattice.levels);
        }
        let mut builder = TrustLattice::builder();
        for level in &self.lattice.levels {
            builder = builder.level(level.as_str());
        }
        for pair in &self.lattice.order {
            builder = builder.order(pair.higher.as_str(), pair.lower.as_str());
        }
        builder.build()
    }

    /// Build the taint source registry.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceError`] for an empty or duplicated source list.
    pub fn build_sources(&self) -> Result<TaintSourceRegistry, SourceError> {
        TaintSourceRegistry::new(&self.taint.sources)
    }

    /// Build the rule registry: the default invariant plus configured rules.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown denied sources or an out-of-range age.
    pub fn build_rules(&self, sources: &TaintSourceRegistry) -> anyhow::Result<RuleRegistry> {
        let mut builder = RuleRegistry::builder().invariant(metadata_dominates_required());

        if !self.boundary.denied_sources.is_empty() {
            let denied = self
                .boundary
                .denied_sources
                .iter()
                .map(|name| sources.require(name))
                .collect::<Result<Vec<_>, _>>()
                .context("invalid boundary.denied_sources")?;
            builder = builder.invariant(deny_sources(denied));
        }

        for capability in &self.boundary.required_capabilities {
            builder = builder.policy(require_capability(capability.as_str()));
        }

        if let Some(secs) = self.boundary.max_taint_age_secs {
            let secs = i64::try_from(secs).context("boundary.max_taint_age_secs out of range")?;
            let age = chrono::Duration::try_seconds(secs)
                .context("boundary.max_taint_age_secs out of range")?;
            builder = builder.policy(max_age(age));
        }

        builder.build().context("invalid boundary rules")
    }

    /// Build every registry and wire them into a boundary enforcer.
    ///
    /// # Errors
    ///
    /// Returns an error if any registry fails to build or the plugin source
    /// is not a declared source.
    pub fn build_enforcer(&self) -> anyhow::Result<BoundaryEnforcer> {
        let lattice = self.build_lattice().context("invalid [lattice]")?;
        let sources = self.build_sources().context("invalid [taint]")?;
        let rules = self.build_rules(&sources)?;
        let plugin_source = sources
            .require(&self.boundary.plugin_source)
            .context("invalid boundary.plugin_source")?;

        let enforcer =
            BoundaryEnforcer::new(Arc::new(lattice), Arc::new(sources), Arc::new(rules))
                .context("taint sources must include PLUGIN")?;
        enforcer
            .with_plugin_source(plugin_source)
            .context("invalid boundary.plugin_source")
    }
}

/// Load configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    Ok(config)
}
