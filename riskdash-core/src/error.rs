/// Top-level riskdash error type.
///
/// All fallible operations in `riskdash-core` return [`Result<T, DashError>`](Result).
/// The first three variants are the caller-facing outcomes of a resolve;
/// the rest wrap a domain-specific error enum so callers can match on the
/// error source without losing type information.
#[derive(thiserror::Error, Debug)]
pub enum DashError {
    /// Unknown dataset or function name, or an otherwise malformed request.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The referenced record does not exist in the dataset's raw table.
    #[error("ID '{id}' not found in {dataset}")]
    NotFound {
        /// Dataset that was searched.
        dataset: String,
        /// Record identifier that was requested.
        id: String,
    },

    /// The compute function failed; nothing was written to the cache.
    #[error("Failed to compute {function} for {id}: {source}")]
    Compute {
        /// AI function name.
        function: String,
        /// Record identifier.
        id: String,
        /// Underlying failure reported by the compute function.
        #[source]
        source: ComputeError,
    },

    /// Error from the storage layer (adapter or backend).
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Error in configuration parsing or validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Error from bulk processing bookkeeping (resume side-files).
    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    /// Reading an ingest file or writing an export failed.
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Coarse classification of a [`DashError`], matching the public taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    ComputeFailure,
    StorageFailure,
    Configuration,
    Batch,
    Io,
}

impl DashError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Compute { .. } => ErrorKind::ComputeFailure,
            Self::Store(_) => ErrorKind::StorageFailure,
            Self::Config(_) => ErrorKind::Configuration,
            Self::Batch(_) => ErrorKind::Batch,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Errors from the storage layer: SQL adaptation and both backends.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Underlying `SQLite` operation failed.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Underlying Postgres operation failed.
    #[error("Postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Could not establish a backend connection. Never carries credentials.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Statement shape outside what the dialect adapter can rewrite.
    #[error("Unsupported statement: {0}")]
    Unsupported(String),

    /// Upsert target table has no registered key column.
    #[error("No conflict key registered for table '{table}'")]
    UnknownConflictTarget {
        /// Table named by the insert.
        table: String,
    },

    /// Placeholder positions and supplied parameters disagree.
    #[error("Statement expects {expected} parameters, got {got}")]
    ParameterCount {
        /// Highest placeholder position in the statement.
        expected: usize,
        /// Number of parameters supplied.
        got: usize,
    },

    /// A stored timestamp could not be parsed.
    #[error("Invalid timestamp '{0}'")]
    Timestamp(String),

    /// A column value had a type the caller did not expect.
    #[error("Decode error: {0}")]
    Decode(String),

    /// JSON serialization/deserialization of a payload failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A failure annotated with the operation and table it happened on.
    #[error("{operation} on {table} failed: {source}")]
    Context {
        /// Logical operation, e.g. `cache upsert`.
        operation: &'static str,
        /// Table the operation targeted.
        table: String,
        /// Original error.
        #[source]
        source: Box<StoreError>,
    },
}

impl StoreError {
    /// Attach operation and table context to an error.
    #[must_use]
    pub fn during(self, operation: &'static str, table: &str) -> Self {
        Self::Context {
            operation,
            table: table.to_string(),
            source: Box::new(self),
        }
    }
}

/// Errors reported by compute functions.
#[derive(thiserror::Error, Debug)]
pub enum ComputeError {
    /// The computation ran and failed.
    #[error("{0}")]
    Failed(String),

    /// The record context lacked something the computation needs.
    #[error("Invalid context: {0}")]
    Context(String),

    /// The computation produced something that is not valid JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors in riskdash configuration parsing and validation.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The configuration file does not exist at the expected path.
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Configuration values are present but semantically invalid.
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Configuration file syntax could not be parsed (TOML error).
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Errors from bulk-run bookkeeping.
#[derive(thiserror::Error, Debug)]
pub enum BatchError {
    /// Filesystem I/O error on the resume side-file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Resume side-file could not be encoded.
    #[error("Resume state error: {0}")]
    StateFile(#[from] serde_json::Error),
}

/// Convenience alias for `Result<T, DashError>`.
pub type Result<T> = std::result::Result<T, DashError>;
