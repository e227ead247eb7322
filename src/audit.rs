/// Audit logging for privileged operations
///
/// Every convergence run that may touch the firewall appends one JSON line
/// to `$XDG_STATE_HOME/iptsync/audit.log`. Failing to write the log never
/// fails the run.
use crate::core::converge::ConvergeReport;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Types of auditable events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A convergence run changed the live rules
    ConvergeRules,
    /// A convergence run found the live rules already in place
    ConvergeUnchanged,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Type of event
    pub event_type: EventType,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    /// Creates a new audit event
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }

    /// Event describing a finished run.
    pub fn from_report(run_id: Uuid, report: &ConvergeReport) -> Self {
        let event_type = if report.changed {
            EventType::ConvergeRules
        } else {
            EventType::ConvergeUnchanged
        };
        Self::new(
            event_type,
            true,
            serde_json::json!({
                "run_id": run_id,
                "declared": report.declared,
                "rejected": report.rejected.len(),
                "pruned": report.pruned,
                "added": report.added,
                "deleted": report.deleted,
                "persisted": report.persisted,
                "checksum": report.checksum,
            }),
            None,
        )
    }

    /// Event describing a run aborted by `error`.
    pub fn failed(run_id: Uuid, checksum: &str, error: String) -> Self {
        Self::new(
            EventType::ConvergeRules,
            false,
            serde_json::json!({
                "run_id": run_id,
                "checksum": checksum,
            }),
            Some(error),
        )
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Creates a new audit log instance in the state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    /// Audit log at an explicit path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// Events are written as JSON-lines format (one JSON object per line)
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the most recent events from the log, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

/// Logs the outcome of a convergence run
///
/// Dry runs are not audited.
pub async fn log_converge(run_id: Uuid, checksum: &str, outcome: &crate::Result<ConvergeReport>) {
    let event = match outcome {
        Ok(report) if report.dry_run => return,
        Ok(report) => AuditEvent::from_report(run_id, report),
        Err(e) => AuditEvent::failed(run_id, checksum, e.to_string()),
    };

    match AuditLog::new() {
        Ok(audit) => {
            if let Err(e) = audit.log(event).await {
                tracing::warn!("Failed to write audit log: {}", e);
            }
        }
        Err(e) => tracing::warn!("Audit log unavailable: {}", e),
    }
}
