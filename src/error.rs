//! Error types for the dispatch router.

/// Top-level error type for the router process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Reasons the auth gate rejects a bearer token.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing auth token")]
    MissingToken,

    #[error("Invalid auth token")]
    InvalidToken,

    #[error("Auth token for user {user_id} expired")]
    Expired { user_id: i64 },

    #[error("Token lookup failed: {0}")]
    Database(#[from] DatabaseError),
}

/// Reasons the registry refuses a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmitError {
    #[error("Worker {0} already has a live session")]
    Duplicate(i64),

    #[error("Worker {0} declares no threads")]
    NoThreads(i64),
}

/// Wire frames that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Empty frame")]
    Empty,

    #[error("Frame is not valid UTF-8")]
    NotUtf8,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("{kind} expects {expected} argument(s), got {got}")]
    MissingArgs {
        kind: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Invalid {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("Function id {0:?} cannot be sent as one argument")]
    InvalidFunctionId(String),
}

/// Result type alias for the router.
pub type Result<T> = std::result::Result<T, Error>;
