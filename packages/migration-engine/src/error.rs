//! Structured error types for the pipeline.
//!
//! The taxonomy separates three scopes, and each scope is a distinct
//! type so that propagation is enforced by signatures rather than by
//! catching and re-classifying:
//!
//! - per-row: `WriteError::Validation` — counted, never escapes the
//!   executor.
//! - migration-scoped: `SourceError`, `WriteError::Fatal` — fold into
//!   a `Failed` terminal status, never escape the coordinator.
//! - run-scoped: `RegistryError`, `RunError` — abort before any
//!   migration executes and propagate to the caller.

use thiserror::Error;

use crate::types::MigrationId;

/// Errors raised by a source row provider.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source connection could not be reached or timed out.
    /// Retryable on a later run; this migration is marked failed.
    #[error("source unavailable: {message}")]
    Unavailable { message: String },

    /// Malformed or incompatible query against the source schema.
    #[error("source query error: {message}")]
    Query { message: String },
}

impl SourceError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    /// Whether a later run may succeed without configuration changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Errors returned by a destination writer for one row.
#[derive(Debug, Error)]
pub enum WriteError {
    /// One row failed destination validation. Counted and logged;
    /// the migration continues with the next row.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// The destination store is rejecting writes systemically.
    /// Aborts the remaining rows of this migration.
    #[error("fatal write error: {message}")]
    Fatal { message: String },
}

impl WriteError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }
}

/// Configuration errors detected at registry load or ordering time.
///
/// All variants are run-scoped: they surface before any migration
/// executes and abort the whole run.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate migration id {id}")]
    DuplicateId { id: MigrationId },

    #[error("migration {id} depends on unknown migration {dependency}")]
    UnknownDependency {
        id: MigrationId,
        dependency: MigrationId,
    },

    #[error("dependency cycle among migrations: {}", members.iter().map(|m| m.as_str()).collect::<Vec<_>>().join(", "))]
    DependencyCycle { members: Vec<MigrationId> },

    #[error("unknown migration id {id}")]
    UnknownId { id: MigrationId },
}

/// Run-scoped errors surfaced to the invoking caller.
#[derive(Debug, Error)]
pub enum RunError {
    /// The definition set is unusable; nothing was executed.
    #[error(transparent)]
    Configuration(#[from] RegistryError),

    /// Persisted run state could not be decoded.
    #[error("invalid run state: {0}")]
    InvalidState(String),

    /// A bounded tick ended without processing a single row; the time
    /// budget is too small to ever finish the run.
    #[error("run made no progress within the time budget")]
    Stalled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_retryable_query_is_not() {
        assert!(SourceError::unavailable("timeout").is_retryable());
        assert!(!SourceError::query("no such table").is_retryable());
    }

    #[test]
    fn cycle_error_names_members() {
        let err = RegistryError::DependencyCycle {
            members: vec![MigrationId::from("a"), MigrationId::from("b")],
        };
        let msg = err.to_string();
        assert!(msg.contains("a, b"));
        assert!(msg.contains("cycle"));
    }

    #[test]
    fn run_error_wraps_registry_error() {
        let err: RunError = RegistryError::UnknownId {
            id: MigrationId::from("users"),
        }
        .into();
        assert!(matches!(err, RunError::Configuration(_)));
    }
}
