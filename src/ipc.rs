//! C9 — Event/IPC Surface: typed request/response commands plus a
//! broadcast event channel, per distilled §4.9 and §6.
//!
//! Grounded on the teacher's wire-type discipline: every payload type
//! (`Command`, `TxBlock`, `SessionEvent`) derives
//! `Serialize + Deserialize + JsonSchema` so a front-end in any language
//! can generate a client from the JSON Schema without depending on this
//! crate's Rust types directly (`SPEC_FULL.md` §4.9/§6).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::connection::{Credential, Session};
use crate::transfer::{CompressionMethod, TransferConfig};

/// Newtype identifiers. Each wraps a `String` so the command/event enums
/// below can't accidentally mix up a shellId and a taskId at the type
/// level — every channel in distilled §6 keys its payload by exactly one
/// of these.
macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(SessionId);
string_id!(ShellId);
string_id!(TaskId);
string_id!(ConnectionId);

/// The `sftp-<sessionId>` naming convention from distilled §6.
pub fn sftp_connection_id(session_id: &SessionId) -> ConnectionId {
    ConnectionId(format!("sftp-{}", session_id.0))
}

/// Wire-facing session description, decoded from the front-end and turned
/// into a `connection::Session` at the command-dispatch boundary.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key_path: Option<String>,
    pub passphrase: Option<String>,
    pub default_cwd: Option<String>,
}

impl SessionInfo {
    pub fn into_session(self, security: crate::security::ConnectionSecurityOptions) -> Session {
        let credential = match self.private_key_path {
            Some(key_path) => Credential::PrivateKey {
                key_path,
                passphrase: self.passphrase,
            },
            None => Credential::Password(self.password.unwrap_or_default()),
        };
        Session {
            id: self.id,
            host: self.host,
            port: self.port,
            username: self.username,
            credential,
            default_cwd: self.default_cwd,
            security,
        }
    }
}

/// Terminal dimensions for `ssh:create-shell` / `ssh:resize`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
pub struct TermSize {
    pub rows: u32,
    pub cols: u32,
}

/// One entry of an upload/download request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransferFile {
    pub name: String,
    pub remote_path: String,
    pub local_path: String,
    pub size: u64,
}

/// Per-request transfer tuning, mirrors distilled §3 `TransferTask.configuration`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransferRequestConfig {
    pub compression: Option<CompressionMethod>,
    pub parallel: bool,
    pub max_parallel_chunks: usize,
    pub overwrite: bool,
}

impl Default for TransferRequestConfig {
    fn default() -> Self {
        Self {
            compression: None,
            parallel: true,
            max_parallel_chunks: TransferConfig::default().max_chunks,
            overwrite: false,
        }
    }
}

/// Every request/response channel named in distilled §6.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "channel", content = "payload", rename_all = "kebab-case")]
pub enum Command {
    #[serde(rename = "ssh:connect")]
    SshConnect { session: SessionInfo },
    #[serde(rename = "ssh:disconnect")]
    SshDisconnect { session_id: SessionId },
    #[serde(rename = "ssh:is-connected")]
    SshIsConnected { session_id: SessionId },
    #[serde(rename = "ssh:execute-command")]
    SshExecuteCommand { session_id: SessionId, command: String },
    #[serde(rename = "ssh:create-shell")]
    SshCreateShell {
        session_id: SessionId,
        shell_id: ShellId,
        size: Option<TermSize>,
    },
    #[serde(rename = "ssh:write")]
    SshWrite { shell_id: ShellId, data: Vec<u8> },
    #[serde(rename = "ssh:resize")]
    SshResize { shell_id: ShellId, size: TermSize },
    #[serde(rename = "sftp:create-client")]
    SftpCreateClient {
        connection_id: ConnectionId,
        session_id: SessionId,
    },
    #[serde(rename = "sftp:read-directory")]
    SftpReadDirectory {
        connection_id: ConnectionId,
        path: String,
        use_cache: bool,
    },
    #[serde(rename = "sftp:read-file")]
    SftpReadFile {
        connection_id: ConnectionId,
        path: String,
        start: u64,
        length: i64,
    },
    #[serde(rename = "sftp:write-file")]
    SftpWriteFile {
        connection_id: ConnectionId,
        path: String,
        content: Vec<u8>,
    },
    #[serde(rename = "sftp:stat")]
    SftpStat { connection_id: ConnectionId, path: String },
    #[serde(rename = "sftp:close-client")]
    SftpCloseClient { connection_id: ConnectionId },
    #[serde(rename = "download:start")]
    DownloadStart {
        task_id: TaskId,
        session_id: SessionId,
        file: TransferFile,
        config: TransferRequestConfig,
    },
    #[serde(rename = "download:pause")]
    DownloadPause { task_id: TaskId },
    #[serde(rename = "download:resume")]
    DownloadResume { task_id: TaskId },
    #[serde(rename = "download:cancel")]
    DownloadCancel { task_id: TaskId },
    #[serde(rename = "upload:start")]
    UploadStart {
        task_id: TaskId,
        session_id: SessionId,
        files: Vec<TransferFile>,
        config: TransferRequestConfig,
    },
    #[serde(rename = "upload:pause")]
    UploadPause { task_id: TaskId },
    #[serde(rename = "upload:resume")]
    UploadResume { task_id: TaskId },
    #[serde(rename = "upload:cancel")]
    UploadCancel { task_id: TaskId },
}

/// Uniform response envelope used by every request/response channel.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ok { data: Option<serde_json::Value> },
    Err { error: String },
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok { data: None }
    }

    pub fn ok_with(data: impl Serialize) -> Self {
        Response::Ok {
            data: serde_json::to_value(data).ok(),
        }
    }

    pub fn from_result<T: Serialize>(result: Result<T, crate::error::ConnectError>) -> Self {
        match result {
            Ok(value) => Response::ok_with(value),
            Err(err) => Response::Err {
                error: err.to_string(),
            },
        }
    }
}

/// Transfer phase, used by `progress` events (distilled §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    Compressing,
    Transferring,
    Extracting,
}

/// Broadcast events named in distilled §6.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ShellData { shell_id: ShellId, data: Vec<u8> },
    ShellClose { shell_id: ShellId },
    Progress {
        task_id: TaskId,
        transferred: u64,
        total: u64,
        percentage: f64,
        speed_bytes_per_sec: f64,
        remaining_seconds: Option<f64>,
        phase: TransferPhase,
        current_file: String,
        files_completed: usize,
    },
    Completed { task_id: TaskId, artifact_path: String },
    Error { task_id: TaskId, error: String },
    Cancelled { task_id: TaskId },
    Paused { task_id: TaskId },
}

/// Sink the rest of the engine publishes events through. Kept as a trait
/// (rather than a concrete channel type) so the core never knows which
/// transport the external UI uses, per distilled §4.9 "adding or removing
/// consumers must not change core logic".
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);

    fn shell_data(&self, shell_id: &ShellId, data: Vec<u8>) {
        self.publish(Event::ShellData {
            shell_id: shell_id.clone(),
            data,
        });
    }

    fn shell_close(&self, shell_id: &ShellId) {
        self.publish(Event::ShellClose {
            shell_id: shell_id.clone(),
        });
    }
}

/// A broadcast-channel-backed `EventSink` suitable for a single UI consumer.
/// The surface is responsible for serializing sends to that consumer
/// (distilled §5 "IPC callbacks may be invoked from any worker").
pub struct BroadcastEventSink {
    tx: tokio::sync::broadcast::Sender<Arc<Event>>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Arc<Event>> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: Event) {
        // A lagging/absent receiver must never block a worker publishing
        // progress; `send` on a broadcast channel never awaits.
        let _ = self.tx.send(Arc::new(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sftp_connection_id_follows_convention() {
        let id = sftp_connection_id(&SessionId("abc123".into()));
        assert_eq!(id.0, "sftp-abc123");
    }

    #[test]
    fn response_ok_roundtrips_through_json() {
        let resp = Response::ok_with(vec![1u32, 2, 3]);
        let json = serde_json::to_string(&resp).unwrap();
        let back: Response = serde_json::from_str(&json).unwrap();
        match back {
            Response::Ok { data: Some(v) } => assert_eq!(v, serde_json::json!([1, 2, 3])),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn broadcast_sink_never_blocks_without_subscribers() {
        let sink = BroadcastEventSink::new(8);
        sink.publish(Event::Cancelled {
            task_id: TaskId("t1".into()),
        });
    }
}
