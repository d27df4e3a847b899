//! Audit logger for boundary decisions and enrichment errors.
//!
//! Writes structured JSON entries, one per line, to an append-only sink.
//! Entries describe decisions only: tainted values and signal values are
//! never written.

use std::io::Write;
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::enrichment::{EnrichmentError, EnrichmentObserver};
use crate::types::UntrustedReason;

/// Audit event type discriminator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A value crossed the boundary and a capability was issued.
    BoundaryGranted,
    /// A value was refused at the boundary.
    BoundaryDenied,
    /// Plugin output was re-tagged on its way back.
    PluginOutputTagged,
    /// The enrichment engine reported an error.
    EnrichmentError,
}

/// A single structured audit log entry.
#[derive(Debug, Serialize)]
struct AuditEntry {
    timestamp: String,
    trace_id: String,
    event_type: AuditEventType,
    details: serde_json::Value,
}

/// Audit logger writing structured JSON to an append-only sink.
pub struct AuditLogger {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger").finish_non_exhaustive()
    }
}

impl AuditLogger {
    /// Create an audit logger over an arbitrary writer.
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Log a granted boundary crossing.
    pub fn log_granted(
        &self,
        decision_id: Uuid,
        trace_id: &str,
        required: &str,
        source_trust: &str,
    ) -> anyhow::Result<()> {
        self.write_entry(
            AuditEventType::BoundaryGranted,
            trace_id,
            serde_json::json!({
                "decision_id": decision_id,
                "required": required,
                "source_trust": source_trust,
            }),
        )
    }

    /// Log a refused boundary crossing.
    pub fn log_denied(
        &self,
        decision_id: Uuid,
        trace_id: &str,
        reason: UntrustedReason,
        required: &str,
    ) -> anyhow::Result<()> {
        self.write_entry(
            AuditEventType::BoundaryDenied,
            trace_id,
            serde_json::json!({
                "decision_id": decision_id,
                "reason": reason,
                "required": required,
            }),
        )
    }

    /// Log the trust level assigned to plugin output.
    pub fn log_plugin_output(
        &self,
        decision_id: Uuid,
        trace_id: &str,
        requested: &str,
        assigned: &str,
    ) -> anyhow::Result<()> {
        self.write_entry(
            AuditEventType::PluginOutputTagged,
            trace_id,
            serde_json::json!({
                "decision_id": decision_id,
                "requested": requested,
                "assigned": assigned,
            }),
        )
    }

    /// Log an enrichment error.
    pub fn log_enrichment_error(&self, error: &EnrichmentError) -> anyhow::Result<()> {
        self.write_entry(
            AuditEventType::EnrichmentError,
            "",
            serde_json::json!({
                "kind": error.kind(),
                "error": error,
            }),
        )
    }

    /// Write a single JSON line to the audit log.
    fn write_entry(
        &self,
        event_type: AuditEventType,
        trace_id: &str,
        details: serde_json::Value,
    ) -> anyhow::Result<()> {
        let entry = AuditEntry {
            timestamp: Utc::now().to_rfc3339(),
            trace_id: trace_id.to_owned(),
            event_type,
            details,
        };
        let line = serde_json::to_string(&entry)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| anyhow::anyhow!("audit lock poisoned: {e}"))?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

/// Every enrichment error category lands in the audit log.
impl EnrichmentObserver for AuditLogger {
    fn on_error(&self, error: &EnrichmentError) {
        if let Err(e) = self.log_enrichment_error(error) {
            warn!(error = %e, "failed to audit log enrichment error");
        }
    }
}
