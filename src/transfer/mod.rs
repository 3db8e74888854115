//! C6 — Transfer Engine: task lifecycle, chunk planning, adaptive
//! buffering, progress/speed stats, and resume.
//!
//! Submodules:
//! - [`planning`] — chunk-planning and strategy-selection pure functions.
//! - [`speed`] — the speed-sample ring and ETA/adaptive-buffer math.
//! - [`range`] — C7, the parallel range writer/reader.
//! - [`compression`] — C8, the compression pipeline helpers.
//! - [`engine`] — ties the above together behind `TransferEngine`'s public
//!   `startUpload`/`startDownload`/`pause`/`resume`/`cancel` surface.

pub mod compression;
pub mod engine;
pub mod planning;
pub mod range;
pub mod speed;

pub use compression::CompressionMethod;
pub use engine::TransferEngine;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Direction of a [`TransferTask`], per distilled §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

/// Terminal/non-terminal task status, per distilled §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Errored,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Errored | TaskStatus::Cancelled
        )
    }
}

/// Per-file transfer tuning, per distilled §3 `TransferTask.configuration`
/// and the numeric defaults in distilled §4.6.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub compression: Option<CompressionMethod>,
    pub parallel: bool,
    pub max_chunks: usize,
    pub overwrite: bool,
    pub remote_path: String,
    pub save_path: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            compression: None,
            parallel: true,
            max_chunks: 8,
            overwrite: false,
            remote_path: String::new(),
            save_path: String::new(),
        }
    }
}

/// Thresholds distilled §4.6 "Strategy selection" is built from.
pub const PARALLEL_DOWNLOAD_MIN_SIZE: u64 = 10 * 1024 * 1024;
pub const PARALLEL_UPLOAD_MIN_SIZE: u64 = 50 * 1024 * 1024;

/// Adaptive buffering defaults, per distilled §4.6.
pub const ADAPTIVE_BUFFER_INITIAL: usize = 1024 * 1024;
pub const ADAPTIVE_BUFFER_MIN: usize = 256 * 1024;
pub const ADAPTIVE_BUFFER_MAX: usize = 8 * 1024 * 1024;
pub const ADAPTIVE_BUFFER_THRESHOLD_BYTES_PER_SEC: f64 = 1024.0 * 1024.0;
pub const ADAPTIVE_BUFFER_FACTOR: f64 = 1.5;

/// Sub-read size used by parallel download chunk workers, per distilled §4.6.
pub const SUB_READ_SIZE: usize = 64 * 1024;

/// Chunk worker retry policy, per distilled §4.6/§7.
pub const CHUNK_MAX_RETRIES: u32 = 3;
pub const CHUNK_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// A contiguous byte range of one file, owned by one worker, per distilled §3.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: usize,
    pub start: u64,
    pub end: u64,
    pub status: ChunkStatus,
    pub transferred: u64,
    pub retry_count: u32,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    Running,
    Completed,
    Errored,
}

/// Strategy chosen for a single file, per distilled §4.6 "Strategy
/// selection (per file)".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Basic,
    Parallel,
    Compressed,
    CompressedParallel,
}
