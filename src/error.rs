//! Error types, one enum per subsystem, wired together for the SSH `Handler` impl.

use thiserror::Error;

/// Failures from loading or generating the server's host key (§4.2).
#[derive(Debug, Error)]
pub enum HostKeyError {
    #[error("host key path is a directory")]
    IsDirectory,

    #[error("host key I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("host key parse error: {0}")]
    Parse(String),
}

/// Failures from the forward registry (§4.3). These are predicates, not
/// crashes, and are always recovered by the caller.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("forward already bound")]
    AlreadyBound,

    #[error("forward not found")]
    NotFound,
}

/// Failures from invoking a channel-opener (§4.7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OpenerError {
    #[error("invalid origin address")]
    InvalidOrigin,

    #[error("ssh peer refused the channel")]
    ChannelRefused,

    #[error("ssh connection is gone")]
    ConnectionGone,
}

/// Failures the HTTP edge (§4.8) turns directly into a response status.
#[derive(Debug, Error)]
pub enum HttpEdgeError {
    #[error("subdomain required")]
    MalformedHost,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Opener(#[from] OpenerError),

    #[error("upstream error: {0}")]
    Upstream(String),
}

/// The `russh::server::Handler::Error` associated type: every failure that
/// can surface out of per-connection SSH handling.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("auth not allowed")]
    AuthNotAllowed,

    #[error("unknown request type")]
    UnknownRequestType,

    #[error("port not allowed")]
    PortNotAllowed,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Opener(#[from] OpenerError),

    #[error(transparent)]
    HostKey(#[from] HostKeyError),

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
