//! Error types for relmap operations.

use std::fmt;
use std::sync::Arc;

/// The primary error type for all relmap operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, close)
    Connection(ConnectionError),
    /// Query execution errors reported by the driver
    Query(QueryError),
    /// Row-to-entity conversion errors
    Type(TypeError),
    /// Programmer misuse of the unit of work
    Usage(UsageError),
    /// Optimistic-concurrency conflict: a versioned write matched no row
    Conflict(ConflictError),
    /// A row that must exist is missing
    NotFound(NotFoundError),
    /// Invalid entity metadata
    Metadata(MetadataError),
    /// Rollback itself failed
    Transaction(TransactionError),
    /// Configuration errors
    Config(ConfigError),
    /// A load this caller waited on was cancelled
    Cancelled,
    /// One failure observed by several callers of the same load
    Shared(Arc<Error>),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection could not be closed cleanly
    Close,
    /// Provider has no connection to hand out
    Exhausted,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct UsageError {
    pub kind: UsageErrorKind,
    /// Rust type name of the entity involved, if any
    pub entity: Option<&'static str>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageErrorKind {
    /// Entity has no identity key where one is required
    MissingKey,
    /// Entity is already queued in an incompatible state
    ConflictingRegistration,
    /// Unit of work already committed or rolled back
    Finished,
    /// Commit or rollback re-entered while one is running
    Busy,
}

#[derive(Debug, Clone)]
pub struct ConflictError {
    pub table: String,
    /// Rendered identity key of the row
    pub key: String,
    /// Version the write expected to find, if the entity is versioned
    pub expected_version: Option<i64>,
    pub sql: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NotFoundError {
    pub entity: &'static str,
    pub table: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct MetadataError {
    pub entity: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
    pub source: Option<Box<Error>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Connection-level commit failed
    CommitFailed,
    /// Connection-level rollback failed; identity map cleanup was skipped
    RollbackFailed,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a usage error.
    pub fn usage(kind: UsageErrorKind, entity: Option<&'static str>, message: impl Into<String>) -> Self {
        Error::Usage(UsageError {
            kind,
            entity,
            message: message.into(),
        })
    }

    /// Build a metadata error for `entity`.
    pub fn metadata(entity: &'static str, message: impl Into<String>) -> Self {
        Error::Metadata(MetadataError {
            entity,
            message: message.into(),
        })
    }

    /// The underlying error, looking through [`Error::Shared`].
    pub fn root(&self) -> &Error {
        match self {
            Error::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// Is this an optimistic-concurrency conflict?
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::Conflict(_))
    }

    /// Is this a missing-row consistency error?
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound(_))
    }

    /// Is this a programmer-misuse error?
    pub fn is_usage(&self) -> bool {
        matches!(self.root(), Error::Usage(_))
    }

    /// Can the caller reasonably retry the unit of work with fresh data?
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization
            ),
            Error::Conflict(_) => true,
            Error::Connection(c) => matches!(c.kind, ConnectionErrorKind::Exhausted),
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        match self.root() {
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Connect | ConnectionErrorKind::Disconnected
            ),
            _ => false,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self.root() {
            Error::Query(q) => q.sql.as_deref(),
            Error::Conflict(c) => c.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => write!(f, "Type error: {e}"),
            Error::Usage(e) => write!(f, "Usage error: {e}"),
            Error::Conflict(e) => write!(f, "Concurrency conflict: {e}"),
            Error::NotFound(e) => write!(f, "Not found: {e}"),
            Error::Metadata(e) => write!(f, "Metadata error for {}: {}", e.entity, e.message),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Shared(inner) => write!(f, "{inner}"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Transaction(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Shared(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entity {
            Some(entity) => write!(f, "{} ({})", self.message, entity),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for ConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.expected_version {
            Some(v) => write!(
                f,
                "row {} in '{}' no longer has version {}",
                self.key, self.table, v
            ),
            None => write!(f, "row {} in '{}' no longer exists", self.key, self.table),
        }
    }
}

impl fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} with key {} missing from '{}'",
            self.entity, self.key, self.table
        )
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<UsageError> for Error {
    fn from(err: UsageError) -> Self {
        Error::Usage(err)
    }
}

impl From<ConflictError> for Error {
    fn from(err: ConflictError) -> Self {
        Error::Conflict(err)
    }
}

impl From<NotFoundError> for Error {
    fn from(err: NotFoundError) -> Self {
        Error::NotFound(err)
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        Error::Metadata(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<Arc<Error>> for Error {
    fn from(err: Arc<Error>) -> Self {
        Error::Shared(err)
    }
}

/// Result type alias for relmap operations.
pub type Result<T> = std::result::Result<T, Error>;
