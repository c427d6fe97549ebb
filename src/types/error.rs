use rusqlite::ErrorCode;
use thiserror::Error;

/// Result type used throughout the bucket engine.
pub type Result<T> = std::result::Result<T, BucketError>;

/// Errors surfaced by the bucket engine.
///
/// Every variant carries enough context (offending value, bucket, column) to
/// diagnose the failure without going back to the logs.
#[derive(Debug, Error)]
pub enum BucketError {
    /// A stored identifier cannot be represented losslessly by callers.
    #[error("invalid identifier {value} in bucket '{bucket}' (column {column})")]
    InvalidIdentifier {
        /// Bucket holding the row.
        bucket: String,
        /// Physical column the value was read from.
        column: &'static str,
        /// Offending value, rendered verbatim.
        value: String,
    },
    /// The sequence produced a value the target column cannot hold.
    #[error(
        "identifier {value} exceeds capacity of column {column} (max {max}) in bucket '{bucket}'"
    )]
    CapacityExceeded {
        /// Bucket being written.
        bucket: String,
        /// Column the value was destined for.
        column: &'static str,
        /// Consumed sequence value that was rejected.
        value: i64,
        /// Largest value the column accepts.
        max: i64,
    },
    /// A DDL step collides with existing state.
    #[error("schema conflict on bucket '{bucket}': {detail}")]
    SchemaConflict {
        /// Bucket whose schema conflicts.
        bucket: String,
        /// Description of the conflicting state.
        detail: String,
    },
    /// The named bucket does not exist.
    #[error("bucket '{0}' not found")]
    BucketNotFound(String),
    /// No object with the given key exists in the bucket.
    #[error("object '{key}' not found in bucket '{bucket}'")]
    ObjectNotFound {
        /// Bucket that was searched.
        bucket: String,
        /// Key that had no match.
        key: String,
    },
    /// A write violated a unique indexed property.
    #[error("unique attribute violation in bucket '{bucket}': {detail}")]
    UniqueViolation {
        /// Bucket being written.
        bucket: String,
        /// Substrate message naming the constraint.
        detail: String,
    },
    /// Transport, timeout or substrate-internal failure.
    #[error("storage failure: {message}")]
    StorageFailure {
        /// Rendered substrate error.
        message: String,
        /// Whether the substrate reported a transient condition.
        retryable: bool,
    },
    /// The filter failed to parse or compile.
    #[error("invalid filter '{filter}': {reason}")]
    PredicateError {
        /// Filter text (or rendered filter) that failed.
        filter: String,
        /// Why compilation failed.
        reason: String,
    },
    /// Malformed argument such as a bad bucket name or document.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl BucketError {
    /// Builds an [`BucketError::InvalidIdentifier`] for the given column.
    pub fn invalid_identifier(
        bucket: impl Into<String>,
        column: &'static str,
        value: impl ToString,
    ) -> Self {
        BucketError::InvalidIdentifier {
            bucket: bucket.into(),
            column,
            value: value.to_string(),
        }
    }

    /// Builds a [`BucketError::SchemaConflict`].
    pub fn schema_conflict(bucket: impl Into<String>, detail: impl Into<String>) -> Self {
        BucketError::SchemaConflict {
            bucket: bucket.into(),
            detail: detail.into(),
        }
    }

    /// Builds a [`BucketError::PredicateError`].
    pub fn predicate(filter: impl Into<String>, reason: impl Into<String>) -> Self {
        BucketError::PredicateError {
            filter: filter.into(),
            reason: reason.into(),
        }
    }

    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            BucketError::InvalidIdentifier { .. } => "InvalidIdentifier",
            BucketError::CapacityExceeded { .. } => "CapacityExceeded",
            BucketError::SchemaConflict { .. } => "SchemaConflict",
            BucketError::BucketNotFound(_) => "NotFound",
            BucketError::ObjectNotFound { .. } => "NotFound",
            BucketError::UniqueViolation { .. } => "UniqueAttributeError",
            BucketError::StorageFailure { .. } => "StorageFailure",
            BucketError::PredicateError { .. } => "PredicateError",
            BucketError::InvalidArgument(_) => "InvalidArgument",
        }
    }

    /// Whether the caller may reasonably retry the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BucketError::StorageFailure { retryable: true, .. })
    }

    /// Whether the error reports a missing bucket or object.
    pub fn is_not_found(&self) -> bool {
        self.code() == "NotFound"
    }
}

impl From<rusqlite::Error> for BucketError {
    fn from(err: rusqlite::Error) -> Self {
        let retryable = matches!(
            err.sqlite_error_code(),
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::SystemIoFailure)
        );
        BucketError::StorageFailure {
            message: err.to_string(),
            retryable,
        }
    }
}

impl From<serde_json::Error> for BucketError {
    fn from(err: serde_json::Error) -> Self {
        BucketError::InvalidArgument(format!("document is not valid JSON: {err}"))
    }
}

impl From<tokio::task::JoinError> for BucketError {
    fn from(err: tokio::task::JoinError) -> Self {
        BucketError::StorageFailure {
            message: format!("blocking task failed: {err}"),
            retryable: false,
        }
    }
}
