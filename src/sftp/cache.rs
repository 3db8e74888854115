use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::debug;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;

use super::{FileEntry, Stat, PATH_HISTORY_CAP};
use crate::connection::SharedConnection;
use crate::error::ConnectError;

/// One logical SFTP handle, keyed by the `sftp-<sessionId>` convention
/// (distilled §6). Wraps a single `SftpSession` plus the directory cache
/// and path history named in distilled §3/§4.5.
struct SftpHandle {
    session: SftpSession,
    dir_cache: RwLock<HashMap<String, Vec<FileEntry>>>,
    path_history: RwLock<VecDeque<String>>,
}

/// Owns every open SFTP handle for the engine. One entry per connection id.
pub struct SftpClientCache {
    handles: RwLock<HashMap<String, Arc<SftpHandle>>>,
}

impl SftpClientCache {
    pub fn new() -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Opens the SFTP subsystem on `connection` and registers it under
    /// `connection_id` (conventionally `sftp-<sessionId>`).
    pub async fn create_client(
        &self,
        connection_id: &str,
        connection: &SharedConnection,
    ) -> Result<(), ConnectError> {
        let channel = connection.client.get_channel().await?;
        channel.request_subsystem(true, "sftp").await?;
        let session = SftpSession::new(channel.into_stream()).await?;

        let handle = Arc::new(SftpHandle {
            session,
            dir_cache: RwLock::new(HashMap::new()),
            path_history: RwLock::new(VecDeque::new()),
        });
        self.handles
            .write()
            .await
            .insert(connection_id.to_string(), handle);
        debug!("sftp client created for {connection_id}");
        Ok(())
    }

    pub async fn close(&self, connection_id: &str) -> Result<(), ConnectError> {
        if let Some(handle) = self.handles.write().await.remove(connection_id) {
            handle.session.close().await?;
        }
        Ok(())
    }

    /// Lists a directory, serving from cache unless `use_cache` is false or
    /// the path has not been seen before.
    pub async fn read_dir(
        &self,
        connection_id: &str,
        path: &str,
        use_cache: bool,
    ) -> Result<Vec<FileEntry>, ConnectError> {
        let handle = self.handle(connection_id).await?;
        self.record_path(&handle, path).await;

        if use_cache {
            if let Some(entries) = handle.dir_cache.read().await.get(path) {
                return Ok(entries.clone());
            }
        }

        let raw = handle
            .session
            .read_dir(path)
            .await
            .map_err(map_sftp_err)?;

        let mut entries = Vec::new();
        for entry in raw {
            let meta = entry.metadata();
            let name = entry.file_name();
            let full_path = join_path(path, &name);
            entries.push(FileEntry {
                name,
                path: full_path,
                size: meta.size.unwrap_or(0),
                modify_time: meta.mtime.unwrap_or(0) as i64,
                permissions: meta.permissions.unwrap_or(0),
                is_directory: meta.is_dir(),
                owner: meta.uid.map(|u| u.to_string()),
                group: meta.gid.map(|g| g.to_string()),
            });
        }

        handle
            .dir_cache
            .write()
            .await
            .insert(path.to_string(), entries.clone());
        Ok(entries)
    }

    pub async fn stat(&self, connection_id: &str, path: &str) -> Result<Stat, ConnectError> {
        let handle = self.handle(connection_id).await?;
        let meta = handle.session.metadata(path).await.map_err(map_sftp_err)?;
        Ok(Stat {
            size: meta.size.unwrap_or(0),
            modify_time: meta.mtime.unwrap_or(0) as i64,
            is_directory: meta.is_dir(),
            permissions: meta.permissions.unwrap_or(0),
        })
    }

    /// Reads `length` bytes at `offset`. `length < 0` means "read to EOF".
    pub async fn read_range(
        &self,
        connection_id: &str,
        path: &str,
        offset: u64,
        length: i64,
    ) -> Result<Vec<u8>, ConnectError> {
        let handle = self.handle(connection_id).await?;
        let mut file = handle.session.open(path).await.map_err(map_sftp_err)?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut buf = Vec::new();
        if length < 0 {
            file.read_to_end(&mut buf).await?;
        } else {
            buf.resize(length as usize, 0);
            let mut filled = 0usize;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    buf.truncate(filled);
                    break;
                }
                filled += n;
            }
        }
        Ok(buf)
    }

    /// Overwrites `path` with `content` in full, then invalidates any
    /// cached directory listing for its parent (distilled §4.5 "implicit
    /// invalidation on write/rename success under a cached path").
    pub async fn write_text(
        &self,
        connection_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), ConnectError> {
        let handle = self.handle(connection_id).await?;
        let mut file = handle
            .session
            .open_with_flags(
                path,
                OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::TRUNCATE,
            )
            .await
            .map_err(map_sftp_err)?;
        file.write_all(content).await?;
        file.flush().await?;

        if let Some(parent) = parent_dir(path) {
            handle.dir_cache.write().await.remove(&parent);
        }
        Ok(())
    }

    /// Creates (or truncates) an empty remote file, used by the transfer
    /// engine to stage a destination before parallel chunk workers write
    /// into it at disjoint offsets.
    pub async fn create_empty(&self, connection_id: &str, path: &str) -> Result<(), ConnectError> {
        let handle = self.handle(connection_id).await?;
        let mut file = handle
            .session
            .open_with_flags(
                path,
                OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::TRUNCATE,
            )
            .await
            .map_err(map_sftp_err)?;
        file.flush().await?;
        if let Some(parent) = parent_dir(path) {
            handle.dir_cache.write().await.remove(&parent);
        }
        Ok(())
    }

    /// Writes `bytes` at `offset` into an already-created remote file,
    /// without truncating — the counterpart to [`Self::read_range`] used by
    /// parallel upload chunk workers.
    pub async fn write_at(
        &self,
        connection_id: &str,
        path: &str,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), ConnectError> {
        let handle = self.handle(connection_id).await?;
        let mut file = handle
            .session
            .open_with_flags(path, OpenFlags::WRITE)
            .await
            .map_err(map_sftp_err)?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }

    /// Removes a remote file outright, used to clean up intermediate
    /// upload/compression artifacts on cancel per distilled §4.10/§7.
    pub async fn remove_file(&self, connection_id: &str, path: &str) -> Result<(), ConnectError> {
        let handle = self.handle(connection_id).await?;
        handle.session.remove_file(path).await.map_err(map_sftp_err)?;
        if let Some(parent) = parent_dir(path) {
            handle.dir_cache.write().await.remove(&parent);
        }
        Ok(())
    }

    /// Whether an SFTP client has already been created for `connection_id`.
    pub async fn contains(&self, connection_id: &str) -> bool {
        self.handles.read().await.contains_key(connection_id)
    }

    /// Explicit cache invalidation. `None` clears every cached directory.
    pub async fn clear_cache(&self, connection_id: &str, path: Option<&str>) -> Result<(), ConnectError> {
        let handle = self.handle(connection_id).await?;
        let mut cache = handle.dir_cache.write().await;
        match path {
            Some(p) => {
                cache.remove(p);
            }
            None => cache.clear(),
        }
        Ok(())
    }

    pub async fn path_history(&self, connection_id: &str) -> Result<Vec<String>, ConnectError> {
        let handle = self.handle(connection_id).await?;
        Ok(handle.path_history.read().await.iter().cloned().collect())
    }

    async fn record_path(&self, handle: &Arc<SftpHandle>, path: &str) {
        let mut history = handle.path_history.write().await;
        if let Some(pos) = history.iter().position(|p| p == path) {
            history.remove(pos);
        }
        history.push_back(path.to_string());
        while history.len() > PATH_HISTORY_CAP {
            history.pop_front();
        }
    }

    async fn handle(&self, connection_id: &str) -> Result<Arc<SftpHandle>, ConnectError> {
        self.handles
            .read()
            .await
            .get(connection_id)
            .cloned()
            .ok_or_else(|| ConnectError::NotConnected(connection_id.to_string()))
    }
}

impl Default for SftpClientCache {
    fn default() -> Self {
        Self::new()
    }
}

/// `russh_sftp` reports "no such file" / "permission denied" as part of its
/// status-error `Display` text rather than as distinct error variants across
/// crate versions, so classification matches on the rendered message the
/// same way the teacher's error mapping does for SSH-layer errors.
fn map_sftp_err(err: russh_sftp::client::error::Error) -> ConnectError {
    let message = err.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("no such file") || lowered.contains("not found") {
        ConnectError::NoSuchPath(message)
    } else if lowered.contains("permission denied") {
        ConnectError::PermissionDenied(message)
    } else {
        ConnectError::Sftp(err)
    }
}

fn join_path(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

fn parent_dir(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(trimmed[..idx].to_string()),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_path_handles_trailing_slash() {
        assert_eq!(join_path("/home", "file.txt"), "/home/file.txt");
        assert_eq!(join_path("/home/", "file.txt"), "/home/file.txt");
    }

    #[test]
    fn parent_dir_of_root_child() {
        assert_eq!(parent_dir("/etc").as_deref(), Some("/"));
        assert_eq!(parent_dir("/etc/ssh").as_deref(), Some("/etc"));
        assert_eq!(parent_dir("relative"), None);
    }
}
