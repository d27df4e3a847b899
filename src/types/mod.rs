//! Core types shared by the boundary enforcer and the enrichment engine.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a value was refused at a trust boundary.
///
/// Reasons are value-free: they describe the decision, never the data
/// that was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UntrustedReason {
    /// The value carries taint from a source a rule refuses outright.
    Tainted,
    /// The value's trust level does not dominate the required level.
    InsufficientTrust,
    /// The value carries no taint metadata at all (fail-closed).
    NoMetadata,
    /// An extensible policy rule denied the crossing.
    PolicyDeny,
}

impl UntrustedReason {
    /// Stable upper-case code used in logs and audit entries.
    pub fn code(self) -> &'static str {
        match self {
            Self::Tainted => "TAINTED",
            Self::InsufficientTrust => "INSUFFICIENT_TRUST",
            Self::NoMetadata => "NO_METADATA",
            Self::PolicyDeny => "POLICY_DENY",
        }
    }
}

impl fmt::Display for UntrustedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Outcome of evaluating one rule, or a full rule registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckResult {
    /// The crossing is permitted.
    Trusted,
    /// The crossing is refused.
    Untrusted {
        /// Structured refusal reason.
        reason: UntrustedReason,
    },
}

impl CheckResult {
    /// Shorthand for an `Untrusted` result.
    pub fn untrusted(reason: UntrustedReason) -> Self {
        Self::Untrusted { reason }
    }

    /// Whether this result permits the crossing.
    pub fn is_trusted(&self) -> bool {
        matches!(self, Self::Trusted)
    }
}

/// Name → value map of derived request signals.
///
/// Ordered so that iteration and serialization are deterministic.
pub type SignalMap = BTreeMap<String, serde_json::Value>;
