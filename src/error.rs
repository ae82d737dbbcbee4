//! Typed failures surfaced to the application. Transient I/O ("nothing to read this tick") and
//!  dropped protocol violations never show up here, they are encoded as `Ok(None)` or simply
//!  absorbed and counted in [crate::stats::NetStats].

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum PoolError {
    #[error("no free connection slot")]
    NoCapacity,
    #[error("connection is not active")]
    NotActive,
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum SendError {
    /// a reliable message is still waiting for acknowledgement
    #[error("a reliable message is still in flight")]
    Busy,
    #[error("payload of {len} bytes exceeds the maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("empty messages can not be sent")]
    EmptyMessage,
    #[error("connection is dead")]
    ConnectionDead,
}

#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReceiveError {
    #[error("connection is dead")]
    ConnectionDead,
}

/// Terminal outcome of a connect attempt. The `Display` text is meant for the user interface.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ConnectFailure {
    #[error("found {found} servers, need exactly one to connect without a name")]
    NoUniqueServer { found: usize },
    #[error("unable to resolve {0}")]
    Unresolvable(String),
    #[error("no free connection slot")]
    NoCapacity,
    #[error("{0}")]
    Rejected(String),
    #[error("No Response")]
    NoResponse,
    #[error("Network Error")]
    NetworkError,
    #[error("Bad Response")]
    BadResponse,
    #[error("Connect to Game failed")]
    ConnectToGameFailed,
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum QueryError {
    #[error("a query of this kind is already in progress")]
    InProgress,
    #[error("unable to resolve {0}")]
    Unresolvable(String),
    #[error("unable to open a socket for the query")]
    Socket,
}

#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
#[error("host cache is full")]
pub struct HostCacheFull;
