//! Error hierarchy for the cohort crates.
//!
//! One variant per failure kind the core can produce. All failures are
//! local and synchronous; nothing here is retried internally — the
//! boundary layer decides what a caller sees.

use thiserror::Error;

/// Convenience alias used across the cohort crates.
pub type Result<T> = std::result::Result<T, CohortError>;

/// Failures produced by the study/run/session/code lifecycle.
#[derive(Debug, Error)]
pub enum CohortError {
    /// A run was started on a study that already has an active run.
    #[error("study '{study}' already has an active run")]
    AlreadyActive {
        /// Study id.
        study: String,
    },

    /// A session operation was attempted on a study with no active run.
    #[error("study '{study}' is not active")]
    NotActive {
        /// Study id.
        study: String,
    },

    /// An unknown study, run, session, or participant code.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// What kind of thing was looked up ("study", "session", "code", …).
        kind: &'static str,
        /// The id that missed.
        id: String,
    },

    /// A participant code past its expiry, detected lazily at access time.
    #[error("code '{code}' has expired")]
    Expired {
        /// The expired code.
        code: String,
    },

    /// A bad size or access-type value at run start.
    #[error("invalid run configuration: {message}")]
    InvalidConfig {
        /// Human-readable description of the bad field.
        message: String,
    },

    /// A study or user with this name already exists.
    #[error("'{name}' already exists")]
    DuplicateName {
        /// The colliding name.
        name: String,
    },

    /// Filesystem failure while persisting data or metadata.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed persisted metadata.
    #[error("metadata error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CohortError {
    /// Shorthand for a [`CohortError::NotFound`] with the given kind.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_identifiers() {
        let e = CohortError::not_found("study", "stroop");
        assert_eq!(e.to_string(), "study 'stroop' not found");

        let e = CohortError::NotActive {
            study: "stroop".into(),
        };
        assert_eq!(e.to_string(), "study 'stroop' is not active");
    }
}
