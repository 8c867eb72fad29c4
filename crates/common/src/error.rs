//! Error types for the dagforge execution core

use thiserror::Error;

/// Main error type for the execution core
#[derive(Error, Debug)]
pub enum Error {
    /// Structural violations detected at DAG build time
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing required fields, unresolved executor types
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Template expansion or command substitution failure
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// A precondition returned false or errored
    #[error("precondition not met: {0}")]
    Precondition(String),

    /// An executor returned a non-zero exit; carries the exit code
    #[error("execution failed with exit code {code}: {message}")]
    Execution { code: i32, message: String },

    /// Sentinel wrapped around an error to defeat retry
    #[error("permanent: {0}")]
    Permanent(#[source] Box<Error>),

    /// Context cancellation or deadline exceeded
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Log file open/write failures
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Coordinator unreachable or rejected a status push
    #[error("coordinator error: {0}")]
    Coordinator(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invariant violations
    #[error("internal error: {0}")]
    Internal(String),

    /// Unclassified errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an error in the permanent sentinel so retry loops give up on it.
    #[must_use]
    pub fn permanent(err: Error) -> Self {
        Error::Permanent(Box::new(err))
    }

    /// Whether this error is wrapped in the permanent sentinel.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::Permanent(_))
    }

    /// Whether a generic retry loop may try again after this error.
    ///
    /// Build-time and policy errors are final; cancellation is never
    /// retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Validation(_)
                | Error::Configuration(_)
                | Error::Precondition(_)
                | Error::Permanent(_)
                | Error::Cancelled(_)
        )
    }

    /// Exit code carried by an execution error, if any.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::Execution { code, .. } => Some(*code),
            Error::Permanent(inner) => inner.exit_code(),
            _ => None,
        }
    }

    /// Stable label for metrics and logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Configuration(_) => "configuration",
            Error::Evaluation(_) => "evaluation",
            Error::Precondition(_) => "precondition",
            Error::Execution { .. } => "execution",
            Error::Permanent(_) => "permanent",
            Error::Cancelled(_) => "cancelled",
            Error::Io(_) => "io",
            Error::Coordinator(_) => "coordinator",
            Error::Serialization(_) => "serialization",
            Error::Internal(_) => "internal",
            Error::Other(_) => "other",
        }
    }
}

/// Collects every violation found during a validation pass instead of
/// short-circuiting on the first one.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<Error>);

impl ErrorList {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, err: Error) {
        self.0.push(err);
    }

    pub fn add(&mut self, result: Result<()>) {
        if let Err(err) = result {
            self.0.push(err);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn errors(&self) -> &[Error] {
        &self.0
    }

    /// Empty list becomes `Ok(())`, otherwise the list itself is the error.
    pub fn into_result(self) -> std::result::Result<(), ErrorList> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl std::fmt::Display for ErrorList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let joined = self
            .0
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "{joined}")
    }
}

impl std::error::Error for ErrorList {}

impl From<ErrorList> for Error {
    fn from(list: ErrorList) -> Self {
        Error::Validation(list.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_wraps_and_reports() {
        let err = Error::permanent(Error::Execution {
            code: 3,
            message: "boom".to_string(),
        });
        assert!(err.is_permanent());
        assert!(!err.is_retryable());
        assert_eq!(err.exit_code(), Some(3));
    }

    #[test]
    fn retryable_classification() {
        assert!(Error::Execution {
            code: 1,
            message: String::new()
        }
        .is_retryable());
        assert!(Error::Coordinator("down".into()).is_retryable());
        assert!(!Error::Validation("bad".into()).is_retryable());
        assert!(!Error::Cancelled("stop".into()).is_retryable());
    }

    #[test]
    fn error_list_collects_all() {
        let mut list = ErrorList::new();
        list.push(Error::Validation("first".into()));
        list.push(Error::Validation("second".into()));
        assert_eq!(list.len(), 2);
        let err = list.into_result().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("first"));
        assert!(text.contains("second"));
    }

    #[test]
    fn empty_error_list_is_ok() {
        assert!(ErrorList::new().into_result().is_ok());
    }
}
