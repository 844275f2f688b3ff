use std::io;
use thiserror::Error;

/// Errors that can terminate a single connection.
///
/// These propagate out of the connection engine; the worker event loop reacts
/// by tearing the offending connection down and moving on to the next one.
#[derive(Debug, Error)]
pub enum Error {
    #[error("the connection socket was closed unexpectedly")]
    UnexpectedSocketClose(#[source] io::Error),

    #[error("unsupported FastCGI version: '{0}'")]
    UnsupportedVersion(u8),

    #[error("unsupported FastCGI role: '{0}'")]
    UnsupportedRole(u16),

    #[error("received malformed FastCGI record for type '{0}'")]
    MalformedRecordPayload(&'static str),

    #[error("unsupported FastCGI protocol status: '{0}'")]
    UnsupportedProtocolStatus(u8),

    #[error("web server sent a malformed record stream")]
    MalformedRecordStream,

    #[error("reused connection never declared FCGI_KEEP_CONN on its prior request")]
    KeepConnViolation,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors that abort the whole process: sandboxing, privilege drop, or
/// catalog setup failures that happen before any request can be served.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("need root privileges")]
    NotRoot,

    #[error("user '{0}' not found")]
    UnknownUser(String),

    #[error("cannot run as '{0}': must not be the superuser", .0)]
    SuperuserService(String),

    #[error("socket path too long")]
    SocketPathTooLong,

    #[error("failed to bind socket: {0}")]
    Bind(#[source] io::Error),

    #[error("failed to fork worker: {0}")]
    Fork(#[source] nix::Error),

    #[error("failed to re-exec worker: {0}")]
    Exec(#[source] nix::Error),

    #[error("failed to chroot: {0}")]
    Chroot(#[source] nix::Error),

    #[error("failed to drop privileges: {0}")]
    PrivilegeDrop(#[source] nix::Error),

    #[error("failed to open catalog database: {0}")]
    Catalog(#[source] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
