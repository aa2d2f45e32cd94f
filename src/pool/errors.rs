use std::fmt;

use crate::errors::Error;

/// Which step of a rent timed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutType {
    /// Waiting for a slot to become available.
    Wait,
    /// Opening a new physical connection.
    Create,
}

/// Errors returned by `Pool::rent`.
#[derive(Debug)]
pub enum PoolError {
    Timeout(TimeoutType),
    Backend(Error),
    Canceled,
    Closed,
}

impl From<Error> for PoolError {
    fn from(e: Error) -> Self {
        match e {
            Error::Canceled => Self::Canceled,
            other => Self::Backend(other),
        }
    }
}

impl From<PoolError> for Error {
    fn from(e: PoolError) -> Error {
        match e {
            PoolError::Timeout(_) => Error::Timeout(crate::errors::TimeoutKind::Rent),
            PoolError::Backend(err) => err,
            PoolError::Canceled => Error::Canceled,
            PoolError::Closed => Error::PoolClosed,
        }
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(TimeoutType::Wait) => {
                write!(f, "timeout occurred while waiting for a free connection")
            }
            Self::Timeout(TimeoutType::Create) => {
                write!(f, "timeout occurred while opening a new connection")
            }
            Self::Backend(e) => write!(f, "could not open a new connection: {e}"),
            Self::Canceled => write!(f, "rent was canceled"),
            Self::Closed => write!(f, "pool has been closed"),
        }
    }
}

impl std::error::Error for PoolError {}
