//! Top-level `Engine`: the single value an embedder constructs and holds.
//!
//! Per `SPEC_FULL.md` §9's Open Question decision, the teacher's global
//! `Lazy`/`static` maps (`dedicatedConnections`, `pools`, `streamTasks`)
//! collapse into fields of one `Engine`, wired together at construction
//! time. `dispatch` is the single entry point a front-end integration
//! drives with decoded [`Command`] values, returning the matching
//! [`Response`] — the wire-level counterpart to the typed methods below,
//! which an embedder linking against this crate directly can call instead.

use std::sync::Arc;

use crate::connection::SharedConnection;
use crate::error::ConnectError;
use crate::exec::{CommandExecutor, CommandOutput};
use crate::ipc::{
    sftp_connection_id, Command, ConnectionId, EventSink, Response, SessionId, SessionInfo,
    ShellId, TaskId, TermSize, TransferFile, TransferRequestConfig,
};
use crate::pool::{PoolManager, Role};
use crate::recording::{SessionEvent, SessionRecordLevel, SessionRecorder};
use crate::registry::TaskRegistry;
use crate::security::ConnectionSecurityOptions;
use crate::sftp::{FileEntry, SftpClientCache, Stat};
use crate::shell::ShellManager;
use crate::transfer::TransferEngine;

/// Owns every live component of the engine: connection pools, open shells,
/// the one-shot command executor, the SFTP handle cache, the transfer
/// engine, and the task registry they share. Constructed once by the
/// embedder and held behind an `Arc` for the lifetime of the process.
pub struct Engine {
    pools: Arc<PoolManager>,
    shells: ShellManager,
    sftp: Arc<SftpClientCache>,
    executor: CommandExecutor,
    transfer: Arc<TransferEngine>,
    registry: Arc<TaskRegistry>,
    events: Arc<dyn EventSink>,
    recorder: SessionRecorder,
}

impl Engine {
    pub fn new(events: Arc<dyn EventSink>) -> Arc<Self> {
        Self::with_record_level(events, SessionRecordLevel::default())
    }

    pub fn with_record_level(events: Arc<dyn EventSink>, record_level: SessionRecordLevel) -> Arc<Self> {
        let pools = Arc::new(PoolManager::new());
        let sftp = Arc::new(SftpClientCache::new());
        let registry = Arc::new(TaskRegistry::new());
        let executor = CommandExecutor::new(pools.clone());
        let transfer = Arc::new(TransferEngine::new(
            pools.clone(),
            sftp.clone(),
            events.clone(),
            registry.clone(),
        ));
        let shells = ShellManager::new(events.clone());
        Arc::new(Self {
            pools,
            shells,
            sftp,
            executor,
            transfer,
            registry,
            events,
            recorder: SessionRecorder::new(record_level),
        })
    }

    pub fn recorder(&self) -> &SessionRecorder {
        &self.recorder
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Periodic maintenance hook: an embedder is expected to call this on a
    /// timer (e.g. every 30s) to evict dead pooled connections.
    pub async fn health_check(&self) {
        self.pools.health_check().await;
    }

    // --- ssh:* -----------------------------------------------------------

    pub async fn connect(&self, session: SessionInfo, security: ConnectionSecurityOptions) -> Result<(), ConnectError> {
        let session_id = session.id.clone();
        let host = session.host.clone();
        let port = session.port;
        let session = session.into_session(security);
        session.validate()?;
        self.pools.register_session(session).await?;
        let _ = self.recorder.record_event(SessionEvent::ConnectionEstablished { session_id, host, port });
        Ok(())
    }

    pub async fn disconnect(&self, session_id: &SessionId) -> Result<(), ConnectError> {
        self.pools.disconnect_session(&session_id.0).await?;
        let _ = self.recorder.record_event(SessionEvent::ConnectionClosed {
            session_id: session_id.0.clone(),
            reason: "disconnect".to_string(),
        });
        Ok(())
    }

    pub async fn is_connected(&self, session_id: &SessionId) -> bool {
        self.pools.has_session(&session_id.0).await
    }

    pub async fn execute_command(&self, session_id: &SessionId, command: &str) -> Result<CommandOutput, ConnectError> {
        let output = self.executor.exec(&session_id.0, command).await?;
        let _ = self.recorder.record_event(SessionEvent::CommandExecuted {
            session_id: session_id.0.clone(),
            command: command.to_string(),
            exit_code: output.exit_code,
            success: output.exit_code == 0,
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
        });
        Ok(output)
    }

    pub async fn create_shell(
        &self,
        session_id: &SessionId,
        shell_id: ShellId,
        size: Option<TermSize>,
    ) -> Result<(), ConnectError> {
        let handle = self.pools.get_connection(&session_id.0, Role::Terminal).await?;
        let (rows, cols) = size.map(|s| (s.rows, s.cols)).unwrap_or((24, 80));
        let conn: SharedConnection = handle.connection().clone();
        self.shells.open_shell(shell_id.clone(), conn, rows, cols).await?;
        let _ = self.recorder.record_event(SessionEvent::ShellOpened {
            session_id: session_id.0.clone(),
            shell_id: shell_id.0.clone(),
        });
        Ok(())
    }

    pub async fn write_shell(&self, shell_id: &ShellId, data: Vec<u8>) -> Result<(), ConnectError> {
        self.shells.write(shell_id, data).await
    }

    pub async fn resize_shell(&self, shell_id: &ShellId, size: TermSize) -> Result<(), ConnectError> {
        self.shells.resize(shell_id, size.rows, size.cols).await
    }

    pub async fn close_shell(&self, shell_id: &ShellId) -> Result<(), ConnectError> {
        self.shells.close(shell_id).await?;
        let _ = self.recorder.record_event(SessionEvent::ShellClosed { shell_id: shell_id.0.clone() });
        Ok(())
    }

    // --- sftp:* ------------------------------------------------------------

    pub async fn sftp_create_client(&self, connection_id: &ConnectionId, session_id: &SessionId) -> Result<(), ConnectError> {
        let handle = self.pools.get_connection(&session_id.0, Role::Transfer).await?;
        self.sftp.create_client(&connection_id.0, handle.connection()).await
    }

    pub async fn sftp_read_directory(
        &self,
        connection_id: &ConnectionId,
        path: &str,
        use_cache: bool,
    ) -> Result<Vec<FileEntry>, ConnectError> {
        self.sftp.read_dir(&connection_id.0, path, use_cache).await
    }

    pub async fn sftp_read_file(
        &self,
        connection_id: &ConnectionId,
        path: &str,
        start: u64,
        length: i64,
    ) -> Result<Vec<u8>, ConnectError> {
        self.sftp.read_range(&connection_id.0, path, start, length).await
    }

    pub async fn sftp_write_file(&self, connection_id: &ConnectionId, path: &str, content: &[u8]) -> Result<(), ConnectError> {
        self.sftp.write_text(&connection_id.0, path, content).await
    }

    pub async fn sftp_stat(&self, connection_id: &ConnectionId, path: &str) -> Result<Stat, ConnectError> {
        self.sftp.stat(&connection_id.0, path).await
    }

    pub async fn sftp_close_client(&self, connection_id: &ConnectionId) -> Result<(), ConnectError> {
        self.sftp.close(&connection_id.0).await
    }

    /// Convenience wrapper following the `sftp-<sessionId>` convention
    /// (distilled §6) used by the transfer engine itself.
    pub fn sftp_connection_id_for(&self, session_id: &SessionId) -> ConnectionId {
        sftp_connection_id(session_id)
    }

    // --- download:*/upload:* ------------------------------------------------

    pub fn start_download(
        self: &Arc<Self>,
        task_id: TaskId,
        session_id: SessionId,
        file: TransferFile,
        config: TransferRequestConfig,
    ) {
        let _ = self.recorder.record_event(SessionEvent::TransferStarted {
            task_id: task_id.0.clone(),
            direction: "download".to_string(),
            file_name: file.name.clone(),
            size: file.size,
        });
        self.transfer.start_download(task_id, session_id, file, config);
    }

    pub fn start_upload(
        self: &Arc<Self>,
        task_id: TaskId,
        session_id: SessionId,
        files: Vec<TransferFile>,
        config: TransferRequestConfig,
    ) {
        for file in &files {
            let _ = self.recorder.record_event(SessionEvent::TransferStarted {
                task_id: task_id.0.clone(),
                direction: "upload".to_string(),
                file_name: file.name.clone(),
                size: file.size,
            });
        }
        self.transfer.start_upload(task_id, session_id, files, config);
    }

    pub fn pause_transfer(&self, task_id: &TaskId) -> Result<(), ConnectError> {
        self.transfer.pause(task_id)
    }

    pub fn resume_transfer(self: &Arc<Self>, task_id: &TaskId) -> Result<(), ConnectError> {
        self.transfer.resume(task_id)
    }

    pub fn cancel_transfer(&self, task_id: &TaskId) -> Result<(), ConnectError> {
        self.transfer.cancel(task_id)
    }

    /// Single decode point for a wire-level [`Command`], returning the
    /// matching [`Response`]. An embedder that talks to this crate only
    /// through serialized IPC (rather than linking the typed methods above
    /// directly) drives everything through this one function.
    pub async fn dispatch(self: &Arc<Self>, command: Command) -> Response {
        match command {
            Command::SshConnect { session } => {
                Response::from_result(self.connect(session, ConnectionSecurityOptions::default()).await)
            }
            Command::SshDisconnect { session_id } => Response::from_result(self.disconnect(&session_id).await),
            Command::SshIsConnected { session_id } => Response::ok_with(self.is_connected(&session_id).await),
            Command::SshExecuteCommand { session_id, command } => {
                match self.execute_command(&session_id, &command).await {
                    Ok(output) => Response::ok_with(serde_json::json!({
                        "stdout": output.stdout,
                        "stderr": output.stderr,
                        "exitCode": output.exit_code,
                    })),
                    Err(err) => Response::Err { error: err.to_string() },
                }
            }
            Command::SshCreateShell { session_id, shell_id, size } => {
                Response::from_result(self.create_shell(&session_id, shell_id, size).await)
            }
            Command::SshWrite { shell_id, data } => Response::from_result(self.write_shell(&shell_id, data).await),
            Command::SshResize { shell_id, size } => Response::from_result(self.resize_shell(&shell_id, size).await),
            Command::SftpCreateClient { connection_id, session_id } => {
                Response::from_result(self.sftp_create_client(&connection_id, &session_id).await)
            }
            Command::SftpReadDirectory { connection_id, path, use_cache } => {
                Response::from_result(self.sftp_read_directory(&connection_id, &path, use_cache).await)
            }
            Command::SftpReadFile { connection_id, path, start, length } => {
                Response::from_result(self.sftp_read_file(&connection_id, &path, start, length).await)
            }
            Command::SftpWriteFile { connection_id, path, content } => {
                Response::from_result(self.sftp_write_file(&connection_id, &path, &content).await)
            }
            Command::SftpStat { connection_id, path } => {
                Response::from_result(self.sftp_stat(&connection_id, &path).await)
            }
            Command::SftpCloseClient { connection_id } => {
                Response::from_result(self.sftp_close_client(&connection_id).await)
            }
            Command::DownloadStart { task_id, session_id, file, config } => {
                self.start_download(task_id, session_id, file, config);
                Response::ok()
            }
            Command::DownloadPause { task_id } => Response::from_result(self.pause_transfer(&task_id)),
            Command::DownloadResume { task_id } => Response::from_result(self.resume_transfer(&task_id)),
            Command::DownloadCancel { task_id } => Response::from_result(self.cancel_transfer(&task_id)),
            Command::UploadStart { task_id, session_id, files, config } => {
                self.start_upload(task_id, session_id, files, config);
                Response::ok()
            }
            Command::UploadPause { task_id } => Response::from_result(self.pause_transfer(&task_id)),
            Command::UploadResume { task_id } => Response::from_result(self.resume_transfer(&task_id)),
            Command::UploadCancel { task_id } => Response::from_result(self.cancel_transfer(&task_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::BroadcastEventSink;

    #[tokio::test]
    async fn is_connected_is_false_for_unknown_session() {
        let events: Arc<dyn EventSink> = Arc::new(BroadcastEventSink::new(8));
        let engine = Engine::new(events);
        assert!(!engine.is_connected(&SessionId::from("missing")).await);
    }

    #[tokio::test]
    async fn disconnect_unknown_session_is_not_connected_error() {
        let events: Arc<dyn EventSink> = Arc::new(BroadcastEventSink::new(8));
        let engine = Engine::new(events);
        let err = engine.disconnect(&SessionId::from("missing")).await.unwrap_err();
        assert!(matches!(err, ConnectError::NotConnected(_)));
    }

    #[test]
    fn recorder_defaults_to_full_level() {
        let events: Arc<dyn EventSink> = Arc::new(BroadcastEventSink::new(8));
        let engine = Engine::new(events);
        assert_eq!(engine.recorder().level(), SessionRecordLevel::Full);
    }
}
