//! C7 — Parallel Range Writer/Reader.
//!
//! Local side grounded on `other_examples/1b0a864a`
//! (`multi_channel.rs`)'s per-worker SFTP channel pinned for a transfer's
//! lifetime; positional writes use `tokio::fs::File` + `seek`/`write_all`
//! rather than a platform `pwrite` syscall, since std/tokio don't expose
//! one portably and the teacher's own local-disk code never needed one.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::ConnectError;
use crate::sftp::SftpClientCache;

/// Pre-sizes (creates/truncates) a local file to exactly `size` bytes, then
/// opens it for random-access writes shared across chunk workers.
///
/// Invariant (distilled §4.7): the file size after all workers join equals
/// the announced size — guaranteed here by truncating up front rather than
/// growing the file as writes land.
pub async fn allocate(path: &Path, size: u64) -> Result<Arc<Mutex<File>>, ConnectError> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    file.set_len(size).await?;
    Ok(Arc::new(Mutex::new(file)))
}

/// Thread-safe positional write. No two workers hold the lock
/// simultaneously, so writes at disjoint offsets never interleave partially
/// (distilled §4.7 "no two workers write overlapping ranges").
pub async fn write_at(file: &Arc<Mutex<File>>, offset: u64, bytes: &[u8]) -> Result<(), ConnectError> {
    let mut guard = file.lock().await;
    guard.seek(SeekFrom::Start(offset)).await?;
    guard.write_all(bytes).await?;
    Ok(())
}

/// Reads `length` bytes starting at `offset` from the remote file, retrying
/// sub-reads until either `length` bytes are delivered or the SFTP layer
/// reports a short read at EOF.
pub async fn read_range(
    sftp: &SftpClientCache,
    connection_id: &str,
    path: &str,
    offset: u64,
    length: u64,
) -> Result<Vec<u8>, ConnectError> {
    let mut collected = Vec::with_capacity(length as usize);
    let mut pos = offset;
    let end = offset + length;

    while pos < end {
        let want = (end - pos).min(super::SUB_READ_SIZE as u64);
        let chunk = sftp
            .read_range(connection_id, path, pos, want as i64)
            .await?;
        if chunk.is_empty() {
            break; // short read at EOF
        }
        pos += chunk.len() as u64;
        collected.extend_from_slice(&chunk);
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn allocate_presizes_file_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presized.bin");
        let _file = allocate(&path, 4096).await.unwrap();
        let meta = tokio::fs::metadata(&path).await.unwrap();
        assert_eq!(meta.len(), 4096);
    }

    #[tokio::test]
    async fn write_at_lands_bytes_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ranged.bin");
        let file = allocate(&path, 16).await.unwrap();
        write_at(&file, 8, b"hello!!!").await.unwrap();

        let mut f = File::open(&path).await.unwrap();
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).await.unwrap();
        assert_eq!(&buf[8..16], b"hello!!!");
        assert_eq!(&buf[0..8], &[0u8; 8]);
    }
}
