//! C5 — SFTP Client Cache: per-connection SFTP handle, directory listing
//! cache, and stat/read/write primitives.
//!
//! Grounded on `other_examples/2c7db84c` (`sftp-pool.rs`)'s
//! `request_subsystem(true, "sftp")` + `SftpSession::new` bring-up, and
//! `other_examples/922bce30` (`sftp2.rs`) for the russh + russh_sftp
//! combination. The directory cache and path history are new state per
//! `SPEC_FULL.md` C5, built the way the teacher wraps shared state behind
//! `RwLock` with small accessor methods (`SessionRecorder`-style).

mod cache;

pub use cache::SftpClientCache;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single remote directory entry, per distilled §3.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub modify_time: i64,
    pub permissions: u32,
    pub is_directory: bool,
    pub owner: Option<String>,
    pub group: Option<String>,
}

/// Result of a `stat` call, per distilled §6 `sftp:stat`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Stat {
    pub size: u64,
    pub modify_time: i64,
    pub is_directory: bool,
    pub permissions: u32,
}

/// Maximum number of distinct paths kept in a handle's path history,
/// per distilled §4.5.
pub const PATH_HISTORY_CAP: usize = 50;
