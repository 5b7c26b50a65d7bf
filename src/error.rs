use thiserror::Error;

/// Errors raised while scheduling or executing jobs.
///
/// `Config`, `Repository` and `Os` abort a single execution; the owning
/// workload retries them with a backoff and disables the job once the
/// retry cap is reached.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing playbook, inventory, cron expression, timezone or credentials.
    #[error("config error: {0}")]
    Config(String),

    /// A repository command (git or user override) exited non-zero.
    #[error("repository error: {0}")]
    Repository(String),

    /// Directory or file handling failed.
    #[error("os error: {0}")]
    Os(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("illegal status transition of {record}: {from} -> {to}")]
    Transition {
        record: String,
        from: String,
        to: String,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn repository(msg: impl Into<String>) -> Self {
        Self::Repository(msg.into())
    }

    pub fn os(msg: impl Into<String>) -> Self {
        Self::Os(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// True for the errors caused by job configuration or the host environment.
    pub fn is_config_class(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Repository(_) | Self::Os(_))
    }

    /// Short tag used as prefix of the persisted error message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Repository(_) => "RepositoryError",
            Self::Os(_) => "OSError",
            Self::Database(_) => "DatabaseError",
            Self::Transition { .. } => "TransitionError",
            Self::NotFound { .. } => "NotFoundError",
            Self::Internal(_) => "InternalError",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Os(error.to_string())
    }
}

impl From<surrealdb::Error> for Error {
    fn from(error: surrealdb::Error) -> Self {
        Self::Database(error.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Internal(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
