//! Error types shared across every component of the engine.
//!
//! A single enum is used everywhere rather than per-module error types, so
//! callers across the connection, pool, shell, exec, SFTP, and transfer
//! layers all propagate the same `Result<T, ConnectError>`.

use thiserror::Error;
use tokio::sync::mpsc::error::SendError;

/// Errors that can occur anywhere in the connection/transfer engine.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Authentication was rejected by the remote host.
    #[error("authentication failed")]
    AuthFailed,

    /// The remote host could not be reached at the transport layer.
    #[error("host unreachable: {0}")]
    Unreachable(String),

    /// An operation exceeded its allotted time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A pool's acquire-timeout elapsed before a connection became available.
    #[error("pool exhausted for session {0}")]
    PoolExhausted(String),

    /// The referenced session is not registered with the engine.
    #[error("session not connected: {0}")]
    NotConnected(String),

    /// A remote path does not exist.
    #[error("no such path: {0}")]
    NoSuchPath(String),

    /// A remote operation was denied by filesystem permissions.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A remote shell command exited non-zero.
    #[error("server command failed (exit {exit_code}): {stderr}")]
    ServerCommandFailed { exit_code: i32, stderr: String },

    /// Post-transfer size verification did not match the announced size.
    #[error("size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The operation was cancelled by the caller. Never surfaced to the UI
    /// as an `error` event; callers map this to a `cancelled` event instead.
    #[error("cancelled")]
    Cancelled,

    /// The SSH channel disconnected while a request was in flight.
    #[error("channel disconnected")]
    ChannelDisconnectError,

    /// An invariant the engine itself is responsible for was violated.
    #[error("internal error: {0}")]
    Internal(String),

    /// A low-level protocol violation was observed on the wire.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Replayed data did not match the expected command/mode flow.
    #[error("replay mismatch: {0}")]
    ReplayMismatchError(String),

    /// Propagated from the underlying SSH client library.
    #[error("ssh error: {0}")]
    Ssh(#[from] async_ssh2_tokio::Error),

    /// Propagated from `russh` directly (PTY/channel/keepalive operations).
    #[error("russh error: {0}")]
    Russh(#[from] russh::Error),

    /// Propagated from the SFTP subsystem.
    #[error("sftp error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),

    /// Propagated from local filesystem I/O during staging/compression.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to forward a text line through an internal channel.
    #[error("failed to send data: {0}")]
    SendDataError(#[from] SendError<String>),

    /// Failed to forward raw bytes through an internal channel.
    #[error("failed to send bytes: {0}")]
    SendBytesError(#[from] SendError<Vec<u8>>),
}

impl ConnectError {
    /// True for errors a chunk worker should retry rather than fail fast on.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectError::Timeout(_)
                | ConnectError::Unreachable(_)
                | ConnectError::ChannelDisconnectError
                | ConnectError::Ssh(_)
                | ConnectError::Russh(_)
                | ConnectError::Sftp(_)
                | ConnectError::Io(_)
        )
    }
}
