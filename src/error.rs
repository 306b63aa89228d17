//! Error types for pgdbs.

use thiserror::Error;

/// SQLSTATE for `unique_violation`.
pub const UNIQUE_VIOLATION: &str = "23505";

/// SQLSTATE for `foreign_key_violation`.
pub const FOREIGN_KEY_VIOLATION: &str = "23503";

/// SQLSTATE for `invalid_text_representation`.
pub const INVALID_TEXT_REPRESENTATION: &str = "22P02";

/// SQLSTATE for `numeric_value_out_of_range`.
pub const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";

/// SQLSTATE for `protocol_violation`.
pub const PROTOCOL_VIOLATION: &str = "08P01";

/// The main error type for pgdbs operations.
#[derive(Debug, Error)]
pub enum DbsError {
    /// Malformed filter or statement input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operator tag the filter compiler does not know.
    #[error("Operator not implemented: '{0}'")]
    UnsupportedOperator(String),

    /// Field type the schema mapper cannot convert.
    #[error("Type not found: {0}")]
    UnknownType(String),

    /// Unique constraint violated on insert or update.
    #[error("Tried to {action}, not unique")]
    DuplicateKey { action: &'static str },

    /// Foreign key violated on insert.
    #[error("Tried to insert, constraints not met")]
    ConstraintViolation,

    /// Foreign key violated on delete: the row is still referenced.
    #[error("Tried to remove item that is still a reference")]
    ReferentialIntegrity,

    /// Unclassified backend failure, passed through unchanged.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbsError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Numeric code of a classified backend failure.
    ///
    /// `1` duplicate key, `2` row still referenced, `3` constraint not met.
    pub fn code(&self) -> Option<u8> {
        match self {
            Self::DuplicateKey { .. } => Some(1),
            Self::ReferentialIntegrity => Some(2),
            Self::ConstraintViolation => Some(3),
            _ => None,
        }
    }

    /// The backend error, if this is an unclassified passthrough.
    pub fn as_backend(&self) -> Option<&BackendError> {
        match self {
            Self::Backend(e) => Some(e),
            _ => None,
        }
    }
}

/// A failure reported by the connection gateway.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BackendError {
    code: Option<String>,
    message: String,
    #[source]
    source: Option<sqlx::Error>,
}

impl BackendError {
    /// Create a backend error from a SQLSTATE code and message.
    pub fn new(code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code: code.map(str::to_string),
            message: message.into(),
            source: None,
        }
    }

    /// SQLSTATE code reported by the backend, if any.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the failure happened before a connection was handed out.
    pub fn is_acquire_failure(&self) -> bool {
        matches!(
            self.source,
            Some(
                sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Configuration(_)
                    | sqlx::Error::WorkerCrashed
            )
        )
    }
}

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        let code = err
            .as_database_error()
            .and_then(|db| db.code())
            .map(|c| c.into_owned());
        Self {
            code,
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Result type alias for pgdbs operations.
pub type DbsResult<T> = Result<T, DbsError>;
