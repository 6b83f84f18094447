//! Error handling for the wmsnotes core.
//!
//! This module provides:
//! - A single error type with machine-readable codes and context chaining
//! - The closed set of domain failures (revision conflicts, invalid commands,
//!   log integrity violations, unresolved merges)
//! - Severity-aware logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use wmsnotes_core::error::{ErrorCode, ErrorContext, Result};
//!
//! fn read_snapshot(path: &Path) -> Result<Vec<u8>> {
//!     std::fs::read(path).with_error_code(ErrorCode::StorageError)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for wmsnotes operations.
pub type Result<T> = std::result::Result<T, NotesError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable; command results and sync reports expose them to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Command Errors (1000-1099)
    RevisionConflict,
    InvalidCommand,

    // Event Log Errors (1100-1199)
    DuplicateEventId,
    DuplicateRevision,
    InvalidEvent,
    NotFound,

    // Replay Errors (1200-1299)
    ReplayFailed,

    // Synchronization Errors (1300-1399)
    MergeUnresolved,

    // Storage Errors (2000-2099)
    StorageError,

    // Serialization Errors (2200-2299)
    SerializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,

    // Internal Errors (9000-9099)
    Timeout,
    ChannelClosed,
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::RevisionConflict => 1000,
            Self::InvalidCommand => 1001,

            Self::DuplicateEventId => 1100,
            Self::DuplicateRevision => 1101,
            Self::InvalidEvent => 1102,
            Self::NotFound => 1103,

            Self::ReplayFailed => 1200,

            Self::MergeUnresolved => 1300,

            Self::StorageError => 2000,

            Self::SerializationError => 2200,

            Self::ConfigurationError => 5000,

            Self::Timeout => 9000,
            Self::ChannelClosed => 9001,
            Self::InternalError => 9099,
        }
    }

    /// Check if this error is retryable.
    ///
    /// A revision conflict is recoverable by reloading and retrying; log integrity
    /// violations and replay failures are not.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RevisionConflict | Self::StorageError | Self::Timeout | Self::ChannelClosed
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "command",
            1100..=1199 => "event_log",
            1200..=1299 => "replay",
            1300..=1399 => "synchronization",
            2000..=2099 => "storage",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected outcomes of concurrent use (stale revisions, rejected commands)
    Low,
    /// Operational issues (timeouts, unresolved merges)
    Medium,
    /// Storage or serialization failures
    High,
    /// Log integrity violations; the affected aggregate cannot be trusted
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::RevisionConflict
            | ErrorCode::InvalidCommand
            | ErrorCode::NotFound
            | ErrorCode::InvalidEvent => Self::Low,

            ErrorCode::MergeUnresolved | ErrorCode::Timeout | ErrorCode::ChannelClosed => {
                Self::Medium
            }

            ErrorCode::StorageError
            | ErrorCode::SerializationError
            | ErrorCode::ConfigurationError => Self::High,

            ErrorCode::DuplicateEventId
            | ErrorCode::DuplicateRevision
            | ErrorCode::ReplayFailed
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (aggregate, event)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the wmsnotes core.
#[derive(Error, Debug)]
pub struct NotesError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Human-readable message
    message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for NotesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl NotesError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both a message and an internal message.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::NotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StorageError, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "Critical error"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "wmsnotes_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| NotesError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| NotesError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| NotesError::new(ErrorCode::NotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| NotesError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<std::io::Error> for NotesError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::NotFound, "File or directory not found"),
            ErrorKind::TimedOut => (ErrorCode::Timeout, "Operation timed out"),
            _ => (ErrorCode::StorageError, "An I/O error occurred"),
        };

        Self::with_internal(code, msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for NotesError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to process JSON data",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<config::ConfigError> for NotesError {
    fn from(error: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Configuration error occurred",
            error.to_string(),
        )
        .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl NotesError {
    // ─────────────────────────────────────────────────────────────────────────
    // Command Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a revision conflict error.
    pub fn revision_conflict(agg_id: &str, expected: u64, actual: u64) -> Self {
        Self::new(
            ErrorCode::RevisionConflict,
            format!(
                "Revision conflict on {}: command expected revision {}, aggregate is at {}",
                agg_id, expected, actual
            ),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("aggregate", agg_id)
                .with_context("expected", expected)
                .with_context("actual", actual),
        )
    }

    /// Create an invalid command error.
    pub fn invalid_command(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidCommand, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Event Log Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a duplicate event id error.
    pub fn duplicate_event_id(event_id: u64) -> Self {
        Self::new(
            ErrorCode::DuplicateEventId,
            format!("Event id {} has already been assigned", event_id),
        )
        .with_details(ErrorDetails::new().with_entity("event", event_id.to_string()))
    }

    /// Create a duplicate revision error.
    pub fn duplicate_revision(agg_id: &str, revision: u64) -> Self {
        Self::new(
            ErrorCode::DuplicateRevision,
            format!("Aggregate {} already has an event at revision {}", agg_id, revision),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("aggregate", agg_id)
                .with_context("revision", revision),
        )
    }

    /// Create an invalid event error.
    pub fn invalid_event(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidEvent, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Replay and Synchronization Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a replay failure naming the offending event.
    pub fn replay_failed(agg_id: &str, event_id: u64, revision: u64, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            ErrorCode::ReplayFailed,
            format!(
                "Replaying event {} (revision {}) of {} failed: {}",
                event_id, revision, agg_id, reason
            ),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("aggregate", agg_id)
                .with_context("event_id", event_id)
                .with_context("revision", revision),
        )
    }

    /// Create a merge unresolved error.
    pub fn merge_unresolved(agg_id: &str, reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::MergeUnresolved,
            format!("Could not merge {}: {}", agg_id, reason.into()),
        )
        .with_details(ErrorDetails::new().with_entity("aggregate", agg_id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::RevisionConflict.is_retryable());
        assert!(ErrorCode::StorageError.is_retryable());
        assert!(!ErrorCode::InvalidCommand.is_retryable());
        assert!(!ErrorCode::DuplicateRevision.is_retryable());
        assert!(!ErrorCode::MergeUnresolved.is_retryable());
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::RevisionConflict.category(), "command");
        assert_eq!(ErrorCode::DuplicateEventId.category(), "event_log");
        assert_eq!(ErrorCode::MergeUnresolved.category(), "synchronization");
        assert_eq!(ErrorCode::InternalError.category(), "internal");
    }

    #[test]
    fn test_revision_conflict_details() {
        let error = NotesError::revision_conflict("n-1", 3, 4);
        assert_eq!(error.code(), ErrorCode::RevisionConflict);
        assert_eq!(error.details().entity_id.as_deref(), Some("n-1"));
        assert_eq!(error.details().context["expected"], serde_json::json!(3));
        assert_eq!(error.details().context["actual"], serde_json::json!(4));
        assert!(error.message().contains("expected revision 3"));
    }

    #[test]
    fn test_replay_failed_names_event() {
        let error = NotesError::replay_failed("n-1", 17, 5, "expected revision 4, got 5");
        let display = error.to_string();
        assert!(display.contains("event 17"));
        assert!(display.contains("expected revision 4, got 5"));
        assert_eq!(error.severity(), ErrorSeverity::Critical);
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::RevisionConflict),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::MergeUnresolved),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::StorageError),
            ErrorSeverity::High
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::DuplicateEventId),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let error: NotesError = io.into();
        assert_eq!(error.code(), ErrorCode::NotFound);

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let error: NotesError = io.into();
        assert_eq!(error.code(), ErrorCode::StorageError);
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let error = missing.context("snapshot missing").unwrap_err();
        assert_eq!(error.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_error_display() {
        let error = NotesError::with_internal(
            ErrorCode::StorageError,
            "Could not write event",
            "No space left on device",
        );

        let display = format!("{}", error);
        assert!(display.contains("StorageError"));
        assert!(display.contains("Could not write event"));
        assert!(display.contains("No space left"));
    }
}
