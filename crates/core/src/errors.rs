//! Error types for the treemerge core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Substrate errors
// ---------------------------------------------------------------------------

/// Errors from the ordered key-value substrate underneath the node store.
///
/// These are never masked by the merge core: they propagate unchanged.
#[derive(Debug, Error)]
pub enum SubstrateError {
    /// The backend could not be reached; a later retry may succeed.
    #[error("substrate unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected the request.
    #[error("substrate backend error: {0}")]
    Backend(String),

    /// Underlying rusqlite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored node record could not be encoded or decoded.
    #[error("node record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A document exists but its contents are inconsistent.
    #[error("corrupt document '{id}': {detail}")]
    Corrupt { id: String, detail: String },

    /// A schema migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },
}

impl SubstrateError {
    /// Whether the failure is a transient I/O condition that a caller may
    /// retry at a higher level.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tree errors
// ---------------------------------------------------------------------------

/// Errors raised while reading or mutating snapshot trees through a builder.
#[derive(Debug, Error)]
pub enum TreeError {
    /// A property or child name is empty or contains a path separator.
    #[error("invalid name '{0}'")]
    InvalidName(String),

    /// Reading a lazily materialized child failed.
    #[error("tree read failed: {0}")]
    Substrate(#[from] SubstrateError),
}

// ---------------------------------------------------------------------------
// Commit errors
// ---------------------------------------------------------------------------

/// Structured rejection raised by the commit-time validation pipeline.
#[derive(Debug, Error)]
pub enum CommitError {
    /// The candidate tree still carries an unresolved conflict marker.
    ///
    /// Carries the path only: conflicting values never cross this boundary.
    #[error("unresolved conflicts in {path}")]
    UnresolvedConflict { path: String },

    /// Another validator in the pipeline rejected the commit.
    #[error("commit rejected by {validator} at {path}: {message}")]
    Rejected {
        validator: String,
        path: String,
        message: String,
    },

    /// Walking the candidate tree failed.
    #[error("commit validation read failed: {0}")]
    Substrate(#[from] SubstrateError),
}

// ---------------------------------------------------------------------------
// Merge errors
// ---------------------------------------------------------------------------

/// Errors from the optimistic merge coordinator.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The head kept moving until the retry budget ran out. The caller must
    /// restart from a fresh base.
    #[error("merge could not converge after {attempts} attempts")]
    NotConverged { attempts: u32 },

    /// The commit gate (or another validator) rejected the merged tree.
    #[error(transparent)]
    Commit(#[from] CommitError),

    /// The substrate failed while reading or publishing.
    #[error("merge substrate error: {0}")]
    Substrate(#[from] SubstrateError),

    /// Building the merged tree failed.
    #[error("merge tree error: {0}")]
    Tree(#[from] TreeError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = CommitError::UnresolvedConflict {
            path: "/content/a".into(),
        };
        assert_eq!(err.to_string(), "unresolved conflicts in /content/a");

        let err = MergeError::NotConverged { attempts: 5 };
        assert_eq!(err.to_string(), "merge could not converge after 5 attempts");

        let err = TreeError::InvalidName("a/b".into());
        assert_eq!(err.to_string(), "invalid name 'a/b'");

        let err = ConfigError::InvalidValue {
            field: "store.page_limit".into(),
            detail: "must be > 0".into(),
        };
        assert!(err.to_string().contains("store.page_limit"));
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let err: CoreError = SubstrateError::Backend("down".into()).into();
        assert!(matches!(err, CoreError::Substrate(_)));

        let merge: MergeError = CommitError::UnresolvedConflict { path: "/".into() }.into();
        let err: CoreError = merge.into();
        assert!(matches!(
            err,
            CoreError::Merge(MergeError::Commit(CommitError::UnresolvedConflict { .. }))
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(SubstrateError::Unavailable("timeout".into()).is_transient());
        assert!(!SubstrateError::Backend("bad request".into()).is_transient());
        assert!(!SubstrateError::Corrupt {
            id: "1:/a".into(),
            detail: "empty".into()
        }
        .is_transient());
    }
}
