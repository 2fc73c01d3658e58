/// Error types shared by the progress, snapshot and clock modules.
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Required identifiers or preconditions missing; the request is rejected.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Network or transport failure. The event or project stays pending.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether a later attempt at the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn only_io_failures_are_retryable() {
        assert!(Error::Transient("offline".into()).is_retryable());
        assert!(Error::Storage(rusqlite::Error::InvalidQuery).is_retryable());
        assert!(!Error::Validation("missing worker".into()).is_retryable());
        assert!(!Error::not_found("project", 4).is_retryable());
    }

    #[test]
    fn not_found_names_kind_and_id() {
        assert_eq!(
            Error::not_found("milestone", 12).to_string(),
            "milestone 12 not found"
        );
    }
}
