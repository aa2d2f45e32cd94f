//! Errors.

use std::fmt;
use std::io;

use crate::messages::ErrorFields;

/// Which deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `Timeout` expired while opening a physical connection.
    Open,
    /// `Timeout` expired while waiting for a pooled connector.
    Rent,
    /// `CommandTimeout` expired while executing a command.
    Command,
    /// `CancellationTimeout` expired while waiting for the server to
    /// acknowledge a cancellation.
    Cancel,
    /// `InternalCommandTimeout` expired on a reset/keepalive/probe query.
    Internal,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "connect",
            Self::Rent => "pool wait",
            Self::Command => "command",
            Self::Cancel => "cancellation",
            Self::Internal => "internal command",
        })
    }
}

/// Errors surfaced by the driver. Every failure mode carries a stable,
/// machine-readable kind; the server's sqlstate rides along when there is one.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection to {identifier} failed: {reason}")]
    ConnectionFailed {
        identifier: ServerIdentifier,
        reason: String,
    },
    #[error("authentication failed for {identifier}: {reason}")]
    AuthenticationFailed {
        identifier: ServerIdentifier,
        reason: String,
    },
    #[error("{0} timeout expired")]
    Timeout(TimeoutKind),
    #[error("operation was canceled")]
    Canceled,
    // boxed: the field bag is large and errors travel through hot paths
    #[error(transparent)]
    Server(#[from] Box<ServerError>),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("an operation is already in progress (connector is {0})")]
    OperationInProgress(String),
    #[error("the connection is broken: {0}")]
    Broken(String),
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error("pool has been closed")]
    PoolClosed,
}

impl Error {
    pub(crate) fn broken_io(context: &str, err: io::Error) -> Error {
        Error::Broken(format!("{context}: {err}"))
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Error {
        Error::ProtocolViolation(reason.into())
    }

    /// The server-reported sqlstate, when this error carries one.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(e) => Some(&e.fields.code),
            _ => None,
        }
    }

    /// True for failure classes where re-opening a connection is worth one
    /// retry. Commands are never retried on this basis because they may have
    /// executed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::ConnectionFailed { .. } => true,
            Error::Server(e) => {
                let code = e.fields.code.as_str();
                code.starts_with("08")
                    || code.starts_with("57")
                    || code.starts_with("53")
                    || code == "40001"
                    || code == "40P01"
            }
            _ => false,
        }
    }
}

/// An ErrorResponse from the server, kept with its full field bag.
/// `include_detail` controls whether server-side `Detail`/`Hint` are rendered;
/// they may quote data from the failing statement.
#[derive(Debug)]
pub struct ServerError {
    pub fields: ErrorFields,
    pub include_detail: bool,
}

impl ServerError {
    pub fn new(fields: ErrorFields, include_detail: bool) -> Box<ServerError> {
        Box::new(ServerError {
            fields,
            include_detail,
        })
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {}",
            self.fields.severity, self.fields.code, self.fields.message
        )?;
        if self.include_detail {
            if let Some(detail) = &self.fields.detail {
                write!(f, " detail: {detail}")?;
            }
            if let Some(hint) = &self.fields.hint {
                write!(f, " hint: {hint}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}

/// Bad connection string or incompatible option combination.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown connection string key {0:?}")]
    UnknownKey(String),
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("Host is required")]
    MissingHost,
    #[error("Multiplexing requires Pooling")]
    MultiplexingRequiresPooling,
    #[error("SslMode=Require needs TrustServerCertificate=true; use VerifyCA or VerifyFull to validate the server certificate")]
    RequireWithoutTrust,
    #[error("TrustServerCertificate=true is incompatible with SslMode={0}")]
    TrustIncompatible(String),
    #[error("MinPoolSize ({min}) must not exceed MaxPoolSize ({max})")]
    PoolSizeOrder { min: usize, max: usize },
    #[error("malformed connection string near {0:?}")]
    Malformed(String),
}

/// Host, port, database and user of the server a connector talks to.
/// Used to keep error and log lines identifiable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentifier {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
}

impl ServerIdentifier {
    pub fn new(host: &str, port: u16, database: &str, username: &str) -> ServerIdentifier {
        ServerIdentifier {
            host: host.into(),
            port,
            database: database.into(),
            username: username.into(),
        }
    }
}

impl fmt::Display for ServerIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Self {
            host,
            port,
            database,
            username,
        } = self;
        write!(f, "{{ {username}@{host}:{port}/{database} }}")
    }
}
