use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error("Precondition failed on operation {index} ({key})")]
    PreconditionFailed { index: usize, key: String },

    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("Transient store error: {0}")]
    Transient(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("Quota exceeded for owner '{owner_id}': {effective} of {quota_max} in use")]
    QuotaExceeded {
        owner_id: String,
        effective: i64,
        quota_max: i64,
    },

    #[error("Malformed change record: {0}")]
    MalformedRecord(String),

    #[error("Invalid lifecycle transition: {0}")]
    InvalidTransition(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),
}

pub type Result<T> = std::result::Result<T, QuotaError>;

impl<T> From<std::sync::PoisonError<T>> for QuotaError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

/// How a failure should be handled by whoever observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A store-side condition rejected the write: the change was already applied
    /// (asynchronous path) or the caller lost an optimistic race (synchronous path).
    IdempotenceBoundary,
    /// Contention or a transient store failure. Safe to retry.
    Retryable,
    /// Retrying will never succeed (bad input, malformed record, invariant breach).
    Permanent,
    /// A definite business outcome for the caller (not found, quota exceeded).
    Domain,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::IdempotenceBoundary => "idempotence_boundary",
            Self::Retryable => "retryable",
            Self::Permanent => "permanent",
            Self::Domain => "domain",
        };
        write!(f, "{label}")
    }
}

impl QuotaError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::PreconditionFailed { .. } => ErrorClass::IdempotenceBoundary,
            Self::TransactionConflict(_) | Self::Transient(_) | Self::LockError(_) => {
                ErrorClass::Retryable
            }
            Self::NotFound { .. } | Self::AlreadyExists { .. } | Self::QuotaExceeded { .. } => {
                ErrorClass::Domain
            }
            Self::MalformedRecord(_)
            | Self::InvalidTransition(_)
            | Self::Validation(_)
            | Self::Config(_)
            | Self::ExecutionError(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    pub fn is_precondition_failed(&self) -> bool {
        self.class() == ErrorClass::IdempotenceBoundary
    }

    /// Index of the transaction operation whose condition failed, if any.
    pub fn failed_operation(&self) -> Option<usize> {
        match self {
            Self::PreconditionFailed { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// Failure reported back to the change-feed runtime.
///
/// `Retryable` leaves the shard checkpoint where it is so the record is delivered
/// again; `Permanent` routes the record to the dead-letter sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error("retryable: {0}")]
    Retryable(QuotaError),

    #[error("permanent: {0}")]
    Permanent(QuotaError),
}

impl ProcessError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn inner(&self) -> &QuotaError {
        match self {
            Self::Retryable(err) | Self::Permanent(err) => err,
        }
    }
}

impl From<QuotaError> for ProcessError {
    fn from(err: QuotaError) -> Self {
        if err.is_retryable() {
            Self::Retryable(err)
        } else {
            Self::Permanent(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let precondition = QuotaError::PreconditionFailed {
            index: 0,
            key: "OWNER#a|ENTITY#b".to_string(),
        };
        assert_eq!(precondition.class(), ErrorClass::IdempotenceBoundary);
        assert_eq!(precondition.failed_operation(), Some(0));

        assert!(QuotaError::TransactionConflict("busy".into()).is_retryable());
        assert!(QuotaError::Transient("timeout".into()).is_retryable());
        assert_eq!(
            QuotaError::not_found("Owner", "a").class(),
            ErrorClass::Domain
        );
        assert_eq!(
            QuotaError::MalformedRecord("bad key".into()).class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_process_error_from_quota_error() {
        let retryable: ProcessError = QuotaError::Transient("x".into()).into();
        assert!(retryable.is_retryable());

        let permanent: ProcessError = QuotaError::MalformedRecord("x".into()).into();
        assert!(!permanent.is_retryable());
        assert_eq!(permanent.inner(), &QuotaError::MalformedRecord("x".into()));
    }

    #[test]
    fn test_poison_error_maps_to_lock_error() {
        let lock = std::sync::Arc::new(std::sync::Mutex::new(0));
        let cloned = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("poison");
        })
        .join();

        let err: QuotaError = lock.lock().unwrap_err().into();
        assert!(matches!(err, QuotaError::LockError(_)));
    }
}
