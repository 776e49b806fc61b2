use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// An error reported by the database driver, reduced to what the runner
/// needs to report it: the message and, when the backend has one, the
/// SQLSTATE code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
    pub code: Option<String>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// The migration source is malformed: duplicate, non-lowercase or empty
    /// identifiers, or nested groups. Raised before touching the database.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// A caller handed the library something it should never have. Never
    /// expected at runtime; surfaces during startup and in tests.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("application id mismatch: expected \"{expected}\", database has \"{found}\"")]
    ApplicationIdentity { expected: String, found: String },

    #[error("\"{id}\" is recorded as applied but no longer exists in the migration source")]
    Consistency { id: String },

    #[error("\"{id}\" has a different hash in the database (computed {computed_hash}, stored {stored_hash})")]
    Drift {
        id: String,
        computed_hash: String,
        stored_hash: String,
    },

    #[error("\"{id}\" manages its own transaction: {message}")]
    NestedTransaction { id: String, message: String },

    #[error("\"{id}\" failed: {source}")]
    Execution {
        id: String,
        #[source]
        source: DriverError,
    },

    #[error("connection error: {0}")]
    Connection(#[source] DriverError),

    #[error("metadata error: {0}")]
    Metadata(#[source] DriverError),

    #[error("cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short, stable label for the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Discovery(_) => "discovery",
            Error::InvalidConfig(_) => "invalid_config",
            Error::ApplicationIdentity { .. } => "application_identity",
            Error::Consistency { .. } => "consistency",
            Error::Drift { .. } => "drift",
            Error::NestedTransaction { .. } => "nested_transaction",
            Error::Execution { .. } => "execution",
            Error::Connection(_) => "connection",
            Error::Metadata(_) => "metadata",
            Error::Cancelled => "cancelled",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }

    /// The migration entry the error is attributed to, if any.
    pub fn entry_id(&self) -> Option<&str> {
        match self {
            Error::Consistency { id }
            | Error::Drift { id, .. }
            | Error::NestedTransaction { id, .. }
            | Error::Execution { id, .. } => Some(id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DriverError, Error};

    #[test]
    fn error_display_includes_context() {
        let e = Error::Discovery("duplicate id \"0001.sql\"".into());
        assert_eq!(e.to_string(), "discovery error: duplicate id \"0001.sql\"");

        let e = Error::Consistency {
            id: "0003_gone.sql".into(),
        };
        assert_eq!(
            e.to_string(),
            "\"0003_gone.sql\" is recorded as applied but no longer exists in the migration source"
        );

        let e = Error::Execution {
            id: "0002_b.sql".into(),
            source: DriverError::with_code("syntax error at or near \"tabel\"", "42601"),
        };
        assert_eq!(
            e.to_string(),
            "\"0002_b.sql\" failed: syntax error at or near \"tabel\""
        );

        assert_eq!(Error::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn drift_names_entry_and_both_hashes() {
        let e = Error::Drift {
            id: "0001_a.sql".into(),
            computed_hash: "aaa".into(),
            stored_hash: "bbb".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("0001_a.sql"));
        assert!(msg.contains("aaa"));
        assert!(msg.contains("bbb"));
        assert_eq!(e.kind(), "drift");
        assert_eq!(e.entry_id(), Some("0001_a.sql"));
    }

    #[test]
    fn only_entry_errors_carry_an_id() {
        assert_eq!(Error::Cancelled.entry_id(), None);
        assert_eq!(
            Error::Connection(DriverError::new("refused")).entry_id(),
            None
        );
        let e = Error::NestedTransaction {
            id: "0004.sql".into(),
            message: "there is already a transaction in progress".into(),
        };
        assert_eq!(e.entry_id(), Some("0004.sql"));
        assert_eq!(e.kind(), "nested_transaction");
    }
}
