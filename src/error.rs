// Error taxonomy for the tenant isolation core
// Every failure carries an ErrorKind tag so callers can branch on category
// (config vs. security vs. schema vs. query) without parsing messages

use thiserror::Error;

/// Coarse failure category, matched by equality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Connection,
    TenantId,
    TenantNotFound,
    TenantType,
    Schema,
    SecurityViolation,
    Query,
}

impl ErrorKind {
    /// Short label used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Connection => "connection",
            ErrorKind::TenantId => "tenant_id",
            ErrorKind::TenantNotFound => "tenant_not_found",
            ErrorKind::TenantType => "tenant_type",
            ErrorKind::Schema => "schema",
            ErrorKind::SecurityViolation => "security_violation",
            ErrorKind::Query => "query",
        }
    }
}

/// Why a tenant identifier was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TenantIdError {
    #[error("tenant id is blank")]
    Blank,

    #[error("tenant id must be {expected} characters, got {actual}")]
    WrongLength { expected: usize, actual: usize },

    #[error("tenant id is malformed: {0}")]
    Malformed(String),
}

/// Provisioning-time failures, surfaced to the operator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("schema name is blank")]
    BlankName,

    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("failed to create schema {schema}: {message}")]
    CreateFailed { schema: String, message: String },

    #[error("template schema not found: {0}")]
    TemplateNotFound(String),

    #[error("failed to copy table {table} into {schema}: {message}")]
    TableCopyFailed {
        schema: String,
        table: String,
        message: String,
    },

    #[error("catalog query failed: {0}")]
    Catalog(String),

    #[error("failed to drop schema {schema}: {message}")]
    DropFailed { schema: String, message: String },
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection failed after {attempts} attempt(s): {message}")]
    Connection { attempts: u32, message: String },

    #[error("Invalid tenant id: {0}")]
    TenantId(#[from] TenantIdError),

    #[error("No tenant in context")]
    TenantNotFound,

    #[error("Tenant value in context has an unexpected type")]
    TenantType,

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Security violation: {0}")]
    SecurityViolation(String),

    #[error("Query error during {operation}: {message}")]
    Query {
        operation: &'static str,
        message: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Pool is closed")]
    PoolClosed,
}

impl DatabaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DatabaseError::Config(_) => ErrorKind::Config,
            DatabaseError::Connection { .. } | DatabaseError::PoolClosed => ErrorKind::Connection,
            DatabaseError::TenantId(_) => ErrorKind::TenantId,
            DatabaseError::TenantNotFound => ErrorKind::TenantNotFound,
            DatabaseError::TenantType => ErrorKind::TenantType,
            DatabaseError::Schema(_) => ErrorKind::Schema,
            DatabaseError::SecurityViolation(_) => ErrorKind::SecurityViolation,
            DatabaseError::Query { .. }
            | DatabaseError::Cancelled
            | DatabaseError::DeadlineExceeded => ErrorKind::Query,
        }
    }

    pub fn is_security_violation(&self) -> bool {
        self.kind() == ErrorKind::SecurityViolation
    }

    /// True for failures that must reject the request as "no valid tenant"
    pub fn is_tenant_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TenantId
                | ErrorKind::TenantNotFound
                | ErrorKind::TenantType
                | ErrorKind::SecurityViolation
        )
    }

    /// Wrap a driver failure with the name of the operation that hit it
    pub fn query(operation: &'static str, err: impl std::fmt::Display) -> Self {
        DatabaseError::Query {
            operation,
            message: err.to_string(),
        }
    }
}

impl From<tokio_postgres::Error> for DatabaseError {
    fn from(err: tokio_postgres::Error) -> Self {
        DatabaseError::query("statement", err)
    }
}

impl From<bb8::RunError<tokio_postgres::Error>> for DatabaseError {
    fn from(err: bb8::RunError<tokio_postgres::Error>) -> Self {
        DatabaseError::query("acquire", err)
    }
}

pub type Result<T> = std::result::Result<T, DatabaseError>;
