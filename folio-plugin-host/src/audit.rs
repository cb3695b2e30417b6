//! Audit trail for plugin lifecycle and administrative actions
//!
//! Provides a trait-based audit system so the host can route lifecycle,
//! approval and circuit-breaker events to its preferred destination.

use folio_plugin_api::HookEvent;
use serde::Serialize;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use thiserror::Error;

/// Timestamp type (RFC 3339 string)
pub type Timestamp = String;

fn now_rfc3339() -> Timestamp {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Audit event
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Timestamp of the event
    pub timestamp: Timestamp,
    /// Type of event
    pub event_type: AuditEventType,
    /// Plugin name
    pub plugin: String,
    /// Identity that performed the action (admin actions only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Additional details
    pub details: AuditDetails,
}

impl AuditEvent {
    /// Create a new audit event
    pub fn new(
        event_type: AuditEventType,
        plugin: impl Into<String>,
        details: AuditDetails,
    ) -> Self {
        Self {
            timestamp: now_rfc3339(),
            event_type,
            plugin: plugin.into(),
            actor: None,
            details,
        }
    }

    /// Attach the acting identity
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

/// Type of audit event
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Plugin reached Running
    PluginLoaded,
    /// Plugin failed to provision
    PluginFailed,
    /// Plugin was stopped at shutdown
    PluginStopped,
    /// Hook approved by an administrator
    HookApproved,
    /// Hook approval revoked by an administrator
    HookRevoked,
    /// Circuit breaker forced closed by an administrator
    BreakerReset,
    /// Circuit breaker opened
    BreakerTripped,
}

/// Details about the audit event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AuditDetails {
    /// Plugin lifecycle
    Lifecycle {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Hook approval change
    Hook { event: HookEvent, table: String },
    /// Circuit breaker transition
    Breaker {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        consecutive_errors: u32,
    },
}

/// Error type for audit operations
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Failed to write audit log: {0}")]
    WriteError(#[from] std::io::Error),

    #[error("Failed to serialize audit event: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Trait for audit event sinks
///
/// # Example
///
/// ```rust
/// use folio_plugin_host::audit::{AuditSink, AuditEvent, AuditError};
///
/// struct StderrAuditSink;
///
/// impl AuditSink for StderrAuditSink {
///     fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
///         eprintln!("{}", serde_json::to_string(&event)?);
///         Ok(())
///     }
///
///     fn flush(&self) -> Result<(), AuditError> {
///         Ok(())
///     }
/// }
/// ```
pub trait AuditSink: Send + Sync {
    /// Record an audit event
    fn record(&self, event: AuditEvent) -> Result<(), AuditError>;

    /// Flush any buffered events
    fn flush(&self) -> Result<(), AuditError>;
}

/// Record an event, logging instead of failing when the sink errors
pub(crate) fn emit(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = sink.record(event) {
        tracing::warn!(error = %e, "Failed to record audit event");
    }
}

// ============================================================================
// Default Implementations
// ============================================================================

/// File-based audit sink (JSONL format)
pub struct FileAuditSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileAuditSink {
    /// Create a new file audit sink, appending to an existing log
    pub fn new(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Get the log file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let json = serde_json::to_string(&event)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{}", json)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.flush()?;
        Ok(())
    }
}

impl fmt::Debug for FileAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileAuditSink")
            .field("path", &self.path)
            .finish()
    }
}

/// In-memory audit sink for testing
pub struct MemoryAuditSink {
    events: RwLock<Vec<AuditEvent>>,
    max_events: usize,
}

impl MemoryAuditSink {
    /// Create a new memory sink with default capacity (1000 events)
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Create a new memory sink with specified capacity
    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            events: RwLock::new(Vec::with_capacity(max_events.min(1000))),
            max_events,
        }
    }

    /// Get all recorded events
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Get event count
    pub fn count(&self) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Find events by type
    pub fn find_by_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Find events by plugin
    pub fn find_by_plugin(&self, plugin: &str) -> Vec<AuditEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.plugin == plugin)
            .cloned()
            .collect()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        if events.len() >= self.max_events {
            events.remove(0); // FIFO eviction
        }
        events.push(event);
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

impl fmt::Debug for MemoryAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAuditSink")
            .field("count", &self.count())
            .field("max_events", &self.max_events)
            .finish()
    }
}

/// Null audit sink (discards all events)
#[derive(Debug, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Plugin reached Running
pub fn plugin_loaded(plugin: &str, path: &Path, version: &str) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::PluginLoaded,
        plugin,
        AuditDetails::Lifecycle {
            path: Some(path.to_path_buf()),
            version: Some(version.to_string()),
            reason: None,
        },
    )
}

/// Plugin failed to provision
pub fn plugin_failed(plugin: &str, reason: &str) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::PluginFailed,
        plugin,
        AuditDetails::Lifecycle {
            path: None,
            version: None,
            reason: Some(reason.to_string()),
        },
    )
}

/// Plugin stopped at shutdown
pub fn plugin_stopped(plugin: &str) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::PluginStopped,
        plugin,
        AuditDetails::Lifecycle {
            path: None,
            version: None,
            reason: None,
        },
    )
}

/// Hook approval changed
pub fn hook_approval(
    plugin: &str,
    event: HookEvent,
    table: &str,
    approved: bool,
    actor: &str,
) -> AuditEvent {
    let event_type = if approved {
        AuditEventType::HookApproved
    } else {
        AuditEventType::HookRevoked
    };
    AuditEvent::new(
        event_type,
        plugin,
        AuditDetails::Hook {
            event,
            table: table.to_string(),
        },
    )
    .with_actor(actor)
}

/// Circuit breaker forced closed
pub fn breaker_reset(plugin: &str, actor: &str, consecutive_errors: u32) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::BreakerReset,
        plugin,
        AuditDetails::Breaker {
            reason: None,
            consecutive_errors,
        },
    )
    .with_actor(actor)
}

/// Circuit breaker opened
pub fn breaker_tripped(plugin: &str, reason: &str, consecutive_errors: u32) -> AuditEvent {
    AuditEvent::new(
        AuditEventType::BreakerTripped,
        plugin,
        AuditDetails::Breaker {
            reason: Some(reason.to_string()),
            consecutive_errors,
        },
    )
}
