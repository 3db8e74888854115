//! C6 core — `TransferEngine`: task lifecycle, strategy dispatch, and the
//! basic/parallel/compressed transfer pipelines.
//!
//! Grounded on `other_examples/900509d2` (`parallel_sync.rs`, chunk
//! planning/`TransferOp`/throughput calc) and `other_examples/030f9b08` /
//! `1b0a864a` (`transfer.rs` / `multi_channel.rs`, multi-channel SFTP
//! worker pools with retry-with-backoff). Task spawning and the
//! `self: Arc<Self>` method shape follow `session/client.rs`'s
//! spawn-a-background-task-per-connection pattern, generalized to
//! spawn-a-background-task-per-transfer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::ConnectError;
use crate::exec::CommandExecutor;
use crate::ipc::{
    sftp_connection_id, ConnectionId, Event, EventSink, SessionId, TaskId, TransferFile,
    TransferPhase, TransferRequestConfig,
};
use crate::pool::{PoolManager, Role};
use crate::registry::TaskRegistry;
use crate::sftp::SftpClientCache;

use super::compression::{self, CompressionMethod};
use super::planning;
use super::range;
use super::speed::{AdaptiveBuffer, SpeedRing};
use super::{
    Chunk, ChunkStatus, Direction, Strategy, TaskStatus, ADAPTIVE_BUFFER_INITIAL,
    CHUNK_MAX_RETRIES, CHUNK_RETRY_BASE_DELAY, SUB_READ_SIZE,
};

type LocalFile = Arc<AsyncMutex<tokio::fs::File>>;

/// Shared progress counters for one in-flight [`TransferFile`], polled by
/// [`TransferEngine::spawn_progress_poller`] every 100ms per distilled §4.6.
struct Progress {
    transferred: AtomicU64,
    max_uploaded_position: AtomicU64,
    total: u64,
    files_completed: AtomicUsize,
    speed: AsyncMutex<SpeedRing>,
    started: Instant,
    direction: Direction,
}

impl Progress {
    fn new(total: u64, direction: Direction) -> Arc<Self> {
        Arc::new(Self {
            transferred: AtomicU64::new(0),
            max_uploaded_position: AtomicU64::new(0),
            total,
            files_completed: AtomicUsize::new(0),
            speed: AsyncMutex::new(SpeedRing::new()),
            started: Instant::now(),
            direction,
        })
    }

    /// The byte count reported to the UI. Downloads report the literal sum
    /// of bytes written; uploads report `maxUploadedPosition` so that
    /// out-of-order chunk completion during a parallel upload never makes
    /// the reported count exceed the true prefix-complete size (distilled
    /// §4.6 "Parallel upload").
    fn reported_bytes(&self) -> u64 {
        match self.direction {
            Direction::Upload => self.max_uploaded_position.load(Ordering::Relaxed),
            Direction::Download => self.transferred.load(Ordering::Relaxed),
        }
    }

    async fn sample(&self) {
        let bytes = self.reported_bytes();
        self.speed.lock().await.record(self.started.elapsed(), bytes);
    }
}

/// How a chunked transfer body ended, decided at the first cancellation
/// checkpoint a worker (or the orchestrating loop) observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkOutcome {
    Completed,
    Paused,
    Cancelled,
}

/// How one file's transfer ended.
enum Outcome {
    Completed(String),
    Paused,
    Cancelled,
}

/// Resumable state for a paused download, kept only for the direction
/// distilled §4.6 supports resume for. Upload resume is out of scope; an
/// upload `pause` tears everything down exactly like `cancel`.
#[derive(Clone)]
struct ResumeState {
    session_id: SessionId,
    file: TransferFile,
    config: TransferRequestConfig,
    temp_path: PathBuf,
    resume_position: u64,
    /// Set only when the paused task was mid compressed-download; lets
    /// `resume` skip phase 1 if the remote compressed artifact is still
    /// there, per distilled §4.6 "Resume semantics".
    compressed: Option<CompressedResume>,
}

#[derive(Clone)]
struct CompressedResume {
    remote_tmp: String,
    method: CompressionMethod,
    parallel: bool,
    artifact_name: String,
    artifact_local_path: String,
}

/// Public transfer surface, mirroring the IPC channels named in distilled
/// §6: `startUpload`/`startDownload`/`pause`/`resume`/`cancel`.
pub struct TransferEngine {
    pools: Arc<PoolManager>,
    sftp: Arc<SftpClientCache>,
    events: Arc<dyn EventSink>,
    registry: Arc<TaskRegistry>,
    executor: CommandExecutor,
    availability: compression::AvailabilityCache,
    paused_downloads: RwLock<HashMap<TaskId, ResumeState>>,
}

impl TransferEngine {
    pub fn new(
        pools: Arc<PoolManager>,
        sftp: Arc<SftpClientCache>,
        events: Arc<dyn EventSink>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        let executor = CommandExecutor::new(pools.clone());
        Self {
            pools,
            sftp,
            events,
            registry,
            executor,
            availability: compression::AvailabilityCache::new(),
            paused_downloads: RwLock::new(HashMap::new()),
        }
    }

    /// `startDownload(taskId, file, config) -> ack`. Spawns the pipeline in
    /// the background and returns as soon as it is registered.
    pub fn start_download(
        self: &Arc<Self>,
        task_id: TaskId,
        session_id: SessionId,
        file: TransferFile,
        config: TransferRequestConfig,
    ) {
        let token = self.registry.register(task_id.clone());
        self.registry.set_status(&task_id, TaskStatus::Running);
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_download(task_id, session_id, file, config, token, 0).await;
        });
    }

    /// `startUpload(taskId, files, config) -> ack`.
    pub fn start_upload(
        self: &Arc<Self>,
        task_id: TaskId,
        session_id: SessionId,
        files: Vec<TransferFile>,
        config: TransferRequestConfig,
    ) {
        let token = self.registry.register(task_id.clone());
        self.registry.set_status(&task_id, TaskStatus::Running);
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_upload(task_id, session_id, files, config, token).await;
        });
    }

    /// Pauses a task. For downloads this preserves on-disk intermediate
    /// state for a later `resume`; for uploads it behaves exactly like
    /// `cancel` except the reported terminal status is `Paused`, per
    /// distilled §4.6 "Upload resume is explicitly out of scope".
    pub fn pause(&self, task_id: &TaskId) -> Result<(), ConnectError> {
        if self.registry.pause(task_id) {
            Ok(())
        } else {
            Err(ConnectError::NotConnected(format!("no active task {task_id}")))
        }
    }

    /// Resumes a previously paused download from its persisted intermediate
    /// state. A plain/parallel download resumes directly from
    /// `resume_position`; a compressed download that was paused mid-transfer
    /// skips phase 1 (compress) if the remote artifact is still present,
    /// continuing the download phase from its local partial file, per
    /// distilled §4.6 "Resume semantics".
    pub fn resume(self: &Arc<Self>, task_id: &TaskId) -> Result<(), ConnectError> {
        let Some(state) = self.try_take_resume_state(task_id) else {
            return Err(ConnectError::NotConnected(format!(
                "task {task_id} has no resumable state"
            )));
        };
        let token = self.registry.register(task_id.clone());
        self.registry.set_status(task_id, TaskStatus::Running);
        let engine = self.clone();
        let task_id = task_id.clone();
        tokio::spawn(async move {
            match state.compressed {
                Some(compressed) => {
                    engine
                        .resume_compressed_download(task_id, state.session_id, state.file, state.config, compressed, state.temp_path, state.resume_position, token)
                        .await;
                }
                None => {
                    engine
                        .run_download(
                            task_id,
                            state.session_id,
                            state.file,
                            state.config,
                            token,
                            state.resume_position,
                        )
                        .await;
                }
            }
        });
        Ok(())
    }

    /// Resumes a paused compressed download. Re-stats the remote compressed
    /// artifact: if it is still there, phase 1 is skipped and the download
    /// phase continues from the existing local offset; otherwise the whole
    /// pipeline restarts from phase 1 (distilled §4.6).
    #[allow(clippy::too_many_arguments)]
    async fn resume_compressed_download(
        self: Arc<Self>,
        task_id: TaskId,
        session_id: SessionId,
        file: TransferFile,
        config: TransferRequestConfig,
        compressed: CompressedResume,
        temp_path: PathBuf,
        resume_position: u64,
        token: CancellationToken,
    ) {
        let result = self
            .clone()
            .execute_resume_compressed_download(&task_id, &session_id, &file, &config, &compressed, &temp_path, resume_position, &token)
            .await;
        self.finish(&task_id, result).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_resume_compressed_download(
        self: Arc<Self>,
        task_id: &TaskId,
        session_id: &SessionId,
        file: &TransferFile,
        config: &TransferRequestConfig,
        compressed: &CompressedResume,
        temp_path: &Path,
        resume_position: u64,
        token: &CancellationToken,
    ) -> Result<Outcome, ConnectError> {
        let connection_id = self.ensure_sftp(session_id).await?;

        let Ok(remote_stat) = self.sftp.stat(&connection_id.0, &compressed.remote_tmp).await else {
            debug!("task {task_id} remote compressed artifact gone, restarting compressed pipeline from phase 1");
            return self
                .execute_download(task_id, session_id, file, config, token, 0)
                .await;
        };

        self.publish_progress_at(task_id, &file.name, TransferPhase::Compressing, 10.0);
        let remote_size = remote_stat.size;
        let artifact_file = TransferFile {
            name: compressed.artifact_name.clone(),
            remote_path: compressed.remote_tmp.clone(),
            local_path: compressed.artifact_local_path.clone(),
            size: remote_size,
        };

        let final_path = PathBuf::from(&artifact_file.local_path);
        let local_file = range::allocate(temp_path, artifact_file.size).await?;
        let progress = Progress::new(artifact_file.size, Direction::Download);
        if !compressed.parallel {
            // The basic path tracks an absolute `pos` counter starting at
            // `resume_position`, so the progress baseline must be seeded
            // here. The parallel path seeds its own baseline from the
            // resumed chunk list in `run_parallel_download_chunks` — seeding
            // both would double-count the already-durable prefix.
            progress.transferred.store(resume_position, Ordering::Relaxed);
        }
        let poller = self.clone().spawn_progress_poller(
            task_id.clone(),
            progress.clone(),
            TransferPhase::Transferring,
            file.name.clone(),
            (10.0, 90.0),
        );

        let chunk_outcome = if compressed.parallel {
            let chunk_count = planning::optimal_download_chunk_count(artifact_file.size, config.max_parallel_chunks);
            let chunks = planning::resume_chunks(planning::plan_chunks(artifact_file.size, chunk_count), resume_position);
            self.run_parallel_download_chunks(task_id, &connection_id, &artifact_file.remote_path, &local_file, chunks, &progress, token)
                .await?
        } else {
            self.run_basic_download(task_id, &connection_id, &artifact_file.remote_path, &local_file, artifact_file.size, resume_position, &progress, token)
                .await?
        };
        poller.abort();

        match chunk_outcome {
            ChunkOutcome::Completed => {
                let actual = tokio::fs::metadata(temp_path).await?.len();
                if actual != artifact_file.size {
                    let _ = tokio::fs::remove_file(temp_path).await;
                    return Err(ConnectError::SizeMismatch { expected: artifact_file.size, actual });
                }
                tokio::fs::rename(temp_path, &final_path).await?;

                self.publish_progress_at(task_id, &file.name, TransferPhase::Extracting, 90.0);
                let extract_result = self.extract_local(compressed.method, &final_path.display().to_string(), &file.local_path).await;
                let _ = tokio::fs::remove_file(&final_path).await;
                self.cleanup_remote(&session_id.0, &compressed.remote_tmp).await;
                extract_result?;
                Ok(Outcome::Completed(file.local_path.clone()))
            }
            ChunkOutcome::Paused => {
                self.paused_downloads.write().await.insert(
                    task_id.clone(),
                    ResumeState {
                        session_id: session_id.clone(),
                        file: file.clone(),
                        config: config.clone(),
                        temp_path: temp_path.to_path_buf(),
                        resume_position: progress.transferred.load(Ordering::Relaxed),
                        compressed: Some(compressed.clone()),
                    },
                );
                Ok(Outcome::Paused)
            }
            ChunkOutcome::Cancelled => {
                let _ = tokio::fs::remove_file(temp_path).await;
                self.cleanup_remote(&session_id.0, &compressed.remote_tmp).await;
                Ok(Outcome::Cancelled)
            }
        }
    }

    fn try_take_resume_state(&self, task_id: &TaskId) -> Option<ResumeState> {
        // `paused_downloads` is only ever touched from async task bodies;
        // `try_write` is sufficient since resume is a user-initiated,
        // low-frequency call and blocking briefly here would be harmless
        // anyway.
        self.paused_downloads.try_write().ok()?.remove(task_id)
    }

    /// `cancel(taskId)`. Idempotent — a second call on an already-terminal
    /// task is a no-op, per distilled §4.10.
    pub fn cancel(&self, task_id: &TaskId) -> Result<(), ConnectError> {
        if self.registry.cancel(task_id) {
            Ok(())
        } else {
            Err(ConnectError::NotConnected(format!("no active task {task_id}")))
        }
    }

    // ---- download ---------------------------------------------------

    async fn run_download(
        self: Arc<Self>,
        task_id: TaskId,
        session_id: SessionId,
        file: TransferFile,
        config: TransferRequestConfig,
        token: CancellationToken,
        resume_position: u64,
    ) {
        let result = self
            .clone()
            .execute_download(&task_id, &session_id, &file, &config, &token, resume_position)
            .await;
        self.finish(&task_id, result).await;
    }

    async fn execute_download(
        self: Arc<Self>,
        task_id: &TaskId,
        session_id: &SessionId,
        file: &TransferFile,
        config: &TransferRequestConfig,
        token: &CancellationToken,
        resume_position: u64,
    ) -> Result<Outcome, ConnectError> {
        let connection_id = self.ensure_sftp(session_id).await?;
        let strategy = planning::select_strategy(
            file.size,
            config.compression.is_some(),
            config.parallel,
            Direction::Download,
        );
        debug!("task {task_id} download strategy={strategy:?}");

        match strategy {
            Strategy::Basic | Strategy::Parallel => {
                let parallel = matches!(strategy, Strategy::Parallel);
                self.transfer_plain_download(
                    task_id,
                    session_id,
                    &connection_id,
                    file,
                    config,
                    token,
                    resume_position,
                    parallel,
                    (0.0, 100.0),
                )
                .await
            }
            Strategy::Compressed | Strategy::CompressedParallel => {
                let parallel = matches!(strategy, Strategy::CompressedParallel);
                self.transfer_compressed_download(task_id, session_id, &connection_id, file, config, token, parallel)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn transfer_plain_download(
        self: &Arc<Self>,
        task_id: &TaskId,
        session_id: &SessionId,
        connection_id: &ConnectionId,
        file: &TransferFile,
        config: &TransferRequestConfig,
        token: &CancellationToken,
        resume_position: u64,
        parallel: bool,
        progress_range: (f64, f64),
    ) -> Result<Outcome, ConnectError> {
        let final_path = PathBuf::from(&file.local_path);
        let temp_path = local_temp_path(&final_path);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let local_file = range::allocate(&temp_path, file.size).await?;

        let progress = Progress::new(file.size, Direction::Download);
        if !parallel {
            // See the matching comment in `execute_resume_compressed_download`:
            // the parallel path seeds its own baseline from the resumed
            // chunk list, so storing `resume_position` here too would
            // double-count the already-durable prefix.
            progress.transferred.store(resume_position, Ordering::Relaxed);
        }

        let poller = self.clone().spawn_progress_poller(
            task_id.clone(),
            progress.clone(),
            TransferPhase::Transferring,
            file.name.clone(),
            progress_range,
        );

        let outcome = if parallel {
            let chunk_count = planning::optimal_download_chunk_count(file.size, config.max_parallel_chunks);
            let chunks = planning::resume_chunks(planning::plan_chunks(file.size, chunk_count), resume_position);
            self.run_parallel_download_chunks(task_id, connection_id, &file.remote_path, &local_file, chunks, &progress, token)
                .await?
        } else {
            self.run_basic_download(
                task_id,
                connection_id,
                &file.remote_path,
                &local_file,
                file.size,
                resume_position,
                &progress,
                token,
            )
            .await?
        };

        poller.abort();

        match outcome {
            ChunkOutcome::Completed => {
                let actual = tokio::fs::metadata(&temp_path).await?.len();
                if actual != file.size {
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    return Err(ConnectError::SizeMismatch {
                        expected: file.size,
                        actual,
                    });
                }
                tokio::fs::rename(&temp_path, &final_path).await?;
                Ok(Outcome::Completed(final_path.display().to_string()))
            }
            ChunkOutcome::Paused => {
                self.paused_downloads.write().await.insert(
                    task_id.clone(),
                    ResumeState {
                        session_id: session_id.clone(),
                        file: file.clone(),
                        config: config.clone(),
                        temp_path,
                        resume_position: progress.transferred.load(Ordering::Relaxed),
                        compressed: None,
                    },
                );
                Ok(Outcome::Paused)
            }
            ChunkOutcome::Cancelled => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                Ok(Outcome::Cancelled)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_basic_download(
        &self,
        task_id: &TaskId,
        connection_id: &ConnectionId,
        remote_path: &str,
        local_file: &LocalFile,
        total: u64,
        resume_position: u64,
        progress: &Arc<Progress>,
        token: &CancellationToken,
    ) -> Result<ChunkOutcome, ConnectError> {
        let mut pos = resume_position;
        let mut buffer = AdaptiveBuffer::new(ADAPTIVE_BUFFER_INITIAL);
        let mut last_sample = Instant::now();
        let mut bytes_since_sample = 0u64;

        while pos < total {
            if token.is_cancelled() {
                return Ok(self.classify_cancellation(task_id));
            }
            let want = (total - pos).min(buffer.current() as u64);
            let bytes = self
                .sftp
                .read_range(&connection_id.0, remote_path, pos, want as i64)
                .await?;
            if bytes.is_empty() {
                break;
            }
            range::write_at(local_file, pos, &bytes).await?;
            pos += bytes.len() as u64;
            bytes_since_sample += bytes.len() as u64;
            progress.transferred.store(pos, Ordering::Relaxed);
            progress.sample().await;

            let elapsed = last_sample.elapsed();
            if elapsed >= Duration::from_secs(1) {
                buffer.adjust(bytes_since_sample, elapsed);
                bytes_since_sample = 0;
                last_sample = Instant::now();
            }
        }
        Ok(ChunkOutcome::Completed)
    }

    async fn run_parallel_download_chunks(
        &self,
        task_id: &TaskId,
        connection_id: &ConnectionId,
        remote_path: &str,
        local_file: &LocalFile,
        chunks: Vec<Chunk>,
        progress: &Arc<Progress>,
        token: &CancellationToken,
    ) -> Result<ChunkOutcome, ConnectError> {
        // Seed the baseline from the resumed chunk list; the caller must
        // not separately pre-store `resumePosition` into
        // `progress.transferred` or this double-counts.
        progress.transferred.fetch_add(resumed_chunk_baseline(&chunks), Ordering::Relaxed);

        let mut set = JoinSet::new();
        for chunk in chunks.into_iter().filter(|c| c.status != ChunkStatus::Completed) {
            let sftp = self.sftp.clone();
            let local_file = local_file.clone();
            let progress = progress.clone();
            let token = token.clone();
            let connection_id = connection_id.clone();
            let remote_path = remote_path.to_string();
            set.spawn(async move {
                download_chunk_with_retry(sftp, connection_id, remote_path, local_file, chunk, progress, token).await
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    set.abort_all();
                    return Err(err);
                }
                Err(join_err) => {
                    set.abort_all();
                    return Err(ConnectError::Internal(format!("download chunk worker panicked: {join_err}")));
                }
            }
        }

        if token.is_cancelled() {
            return Ok(self.classify_cancellation(task_id));
        }
        Ok(ChunkOutcome::Completed)
    }

    #[allow(clippy::too_many_arguments)]
    async fn transfer_compressed_download(
        self: &Arc<Self>,
        task_id: &TaskId,
        session_id: &SessionId,
        connection_id: &ConnectionId,
        file: &TransferFile,
        config: &TransferRequestConfig,
        token: &CancellationToken,
        parallel: bool,
    ) -> Result<Outcome, ConnectError> {
        let method = config.compression.unwrap_or(CompressionMethod::Gzip);
        if !self
            .availability
            .is_available(&self.executor, &session_id.0, method)
            .await?
        {
            warn!("compression method {method:?} unavailable on session {session_id}, attempting anyway");
        }

        self.publish_progress_at(task_id, &file.name, TransferPhase::Compressing, 0.0);

        let remote_tmp = format!("/tmp/{}{}", random_suffix(), method.extension());
        let compress_cmd = compression::remote_compress_command(method, &file.remote_path, &remote_tmp);
        self.executor.exec_checked(&session_id.0, &compress_cmd).await?;

        if token.is_cancelled() {
            self.cleanup_remote(&session_id.0, &remote_tmp).await;
            return Ok(self.classify_cancellation(task_id));
        }
        self.publish_progress_at(task_id, &file.name, TransferPhase::Compressing, 10.0);

        let remote_size = self.sftp.stat(&connection_id.0, &remote_tmp).await?.size;
        let artifact_file = TransferFile {
            name: format!("{}{}", file.name, method.extension()),
            remote_path: remote_tmp.clone(),
            local_path: format!("{}{}", file.local_path, method.extension()),
            size: remote_size,
        };

        let download_outcome = self
            .transfer_plain_download(
                task_id,
                session_id,
                connection_id,
                &artifact_file,
                config,
                token,
                0,
                parallel,
                (10.0, 90.0),
            )
            .await?;

        if let Outcome::Paused = download_outcome {
            // `transfer_plain_download` already persisted a `ResumeState`
            // keyed off `artifact_file`; enrich it with the compressed
            // pipeline's own state so `resume` can skip phase 1 if the
            // remote artifact is still there, per distilled §4.6.
            let mut paused = self.paused_downloads.write().await;
            if let Some(inner) = paused.get(task_id).cloned() {
                paused.insert(
                    task_id.clone(),
                    ResumeState {
                        session_id: session_id.clone(),
                        file: file.clone(),
                        config: config.clone(),
                        temp_path: inner.temp_path,
                        resume_position: inner.resume_position,
                        compressed: Some(CompressedResume {
                            remote_tmp: remote_tmp.clone(),
                            method,
                            parallel,
                            artifact_name: artifact_file.name.clone(),
                            artifact_local_path: artifact_file.local_path.clone(),
                        }),
                    },
                );
            }
            return Ok(Outcome::Paused);
        }

        let artifact_path = match download_outcome {
            Outcome::Completed(path) => path,
            other => {
                self.cleanup_remote(&session_id.0, &remote_tmp).await;
                return Ok(other);
            }
        };

        self.publish_progress_at(task_id, &file.name, TransferPhase::Extracting, 90.0);
        let extract_result = self.extract_local(method, &artifact_path, &file.local_path).await;
        let _ = tokio::fs::remove_file(&artifact_path).await;
        self.cleanup_remote(&session_id.0, &remote_tmp).await;
        extract_result?;

        Ok(Outcome::Completed(file.local_path.clone()))
    }

    async fn extract_local(&self, method: CompressionMethod, artifact_path: &str, dest_path: &str) -> Result<(), ConnectError> {
        match method {
            CompressionMethod::Gzip => {
                let data = tokio::fs::read(artifact_path).await?;
                let dest = dest_path.to_string();
                tokio::task::spawn_blocking(move || {
                    use flate2::read::GzDecoder;
                    use std::io::Read;
                    let mut decoder = GzDecoder::new(&data[..]);
                    let mut out = Vec::new();
                    decoder.read_to_end(&mut out)?;
                    std::fs::write(&dest, out)
                })
                .await
                .map_err(|err| ConnectError::Internal(err.to_string()))??;
                Ok(())
            }
            CompressionMethod::Bzip2 => self.run_local_tar(artifact_path, dest_path, "-xjf").await,
            CompressionMethod::Xz => self.run_local_tar(artifact_path, dest_path, "-xJf").await,
        }
    }

    async fn run_local_tar(&self, artifact_path: &str, dest_dir: &str, flag: &str) -> Result<(), ConnectError> {
        tokio::fs::create_dir_all(dest_dir).await.ok();
        let status = tokio::process::Command::new("tar")
            .arg(flag)
            .arg(artifact_path)
            .arg("-C")
            .arg(dest_dir)
            .status()
            .await?;
        if !status.success() {
            return Err(ConnectError::Internal(format!(
                "local tar extraction exited with {status}"
            )));
        }
        Ok(())
    }

    // ---- upload -------------------------------------------------------

    async fn run_upload(
        self: Arc<Self>,
        task_id: TaskId,
        session_id: SessionId,
        files: Vec<TransferFile>,
        config: TransferRequestConfig,
        token: CancellationToken,
    ) {
        let result = self.clone().execute_upload(&task_id, &session_id, &files, &config, &token).await;
        self.finish(&task_id, result).await;
    }

    async fn execute_upload(
        self: Arc<Self>,
        task_id: &TaskId,
        session_id: &SessionId,
        files: &[TransferFile],
        config: &TransferRequestConfig,
        token: &CancellationToken,
    ) -> Result<Outcome, ConnectError> {
        let connection_id = self.ensure_sftp(session_id).await?;
        let files_completed = AtomicUsize::new(0);
        let mut last_artifact = String::new();

        for file in files {
            if token.is_cancelled() {
                return Ok(self.classify_cancellation(task_id));
            }
            let strategy = planning::select_strategy(
                file.size,
                config.compression.is_some(),
                config.parallel,
                Direction::Upload,
            );
            debug!("task {task_id} upload strategy={strategy:?} file={}", file.name);

            let outcome = match strategy {
                Strategy::Basic | Strategy::Parallel => {
                    let parallel = matches!(strategy, Strategy::Parallel);
                    self.transfer_plain_upload(task_id, &connection_id, file, config, token, parallel, (0.0, 100.0))
                        .await?
                }
                Strategy::Compressed | Strategy::CompressedParallel => {
                    let parallel = matches!(strategy, Strategy::CompressedParallel);
                    self.transfer_compressed_upload(task_id, session_id, &connection_id, file, config, token, parallel)
                        .await?
                }
            };

            match outcome {
                Outcome::Completed(path) => {
                    last_artifact = path;
                    files_completed.fetch_add(1, Ordering::Relaxed);
                }
                other => return Ok(other),
            }
        }

        Ok(Outcome::Completed(last_artifact))
    }

    #[allow(clippy::too_many_arguments)]
    async fn transfer_plain_upload(
        self: &Arc<Self>,
        task_id: &TaskId,
        connection_id: &ConnectionId,
        file: &TransferFile,
        config: &TransferRequestConfig,
        token: &CancellationToken,
        parallel: bool,
        progress_range: (f64, f64),
    ) -> Result<Outcome, ConnectError> {
        self.sftp.create_empty(&connection_id.0, &file.remote_path).await?;
        let local_file: LocalFile = Arc::new(AsyncMutex::new(tokio::fs::File::open(&file.local_path).await?));

        let progress = Progress::new(file.size, Direction::Upload);
        let poller = self.clone().spawn_progress_poller(
            task_id.clone(),
            progress.clone(),
            TransferPhase::Transferring,
            file.name.clone(),
            progress_range,
        );

        let outcome = if parallel {
            let chunks = planning::plan_chunks(file.size, config.max_parallel_chunks.max(1));
            self.run_parallel_upload_chunks(task_id, connection_id, &file.remote_path, &local_file, chunks, &progress, token)
                .await?
        } else {
            self.run_basic_upload(task_id, connection_id, &file.remote_path, &local_file, file.size, &progress, token)
                .await?
        };
        poller.abort();

        match outcome {
            ChunkOutcome::Completed => Ok(Outcome::Completed(file.remote_path.clone())),
            ChunkOutcome::Paused | ChunkOutcome::Cancelled => {
                self.cleanup_remote_via_sftp(&connection_id.0, &file.remote_path).await;
                Ok(if outcome == ChunkOutcome::Paused {
                    Outcome::Paused
                } else {
                    Outcome::Cancelled
                })
            }
        }
    }

    async fn run_basic_upload(
        &self,
        task_id: &TaskId,
        connection_id: &ConnectionId,
        remote_path: &str,
        local_file: &LocalFile,
        total: u64,
        progress: &Arc<Progress>,
        token: &CancellationToken,
    ) -> Result<ChunkOutcome, ConnectError> {
        let mut pos = 0u64;
        let mut buf = vec![0u8; SUB_READ_SIZE];
        while pos < total {
            if token.is_cancelled() {
                return Ok(self.classify_cancellation(task_id));
            }
            let want = ((total - pos) as usize).min(buf.len());
            let n = {
                let mut guard = local_file.lock().await;
                guard.seek(std::io::SeekFrom::Start(pos)).await?;
                guard.read(&mut buf[..want]).await?
            };
            if n == 0 {
                break;
            }
            self.sftp.write_at(&connection_id.0, remote_path, pos, &buf[..n]).await?;
            pos += n as u64;
            progress.max_uploaded_position.fetch_max(pos, Ordering::Relaxed);
            progress.sample().await;
        }
        Ok(ChunkOutcome::Completed)
    }

    async fn run_parallel_upload_chunks(
        &self,
        task_id: &TaskId,
        connection_id: &ConnectionId,
        remote_path: &str,
        local_file: &LocalFile,
        chunks: Vec<Chunk>,
        progress: &Arc<Progress>,
        token: &CancellationToken,
    ) -> Result<ChunkOutcome, ConnectError> {
        let mut set = JoinSet::new();
        for chunk in chunks {
            let sftp = self.sftp.clone();
            let local_file = local_file.clone();
            let progress = progress.clone();
            let token = token.clone();
            let connection_id = connection_id.clone();
            let remote_path = remote_path.to_string();
            set.spawn(async move {
                upload_chunk_with_retry(sftp, connection_id, remote_path, local_file, chunk, progress, token).await
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    set.abort_all();
                    return Err(err);
                }
                Err(join_err) => {
                    set.abort_all();
                    return Err(ConnectError::Internal(format!("upload chunk worker panicked: {join_err}")));
                }
            }
        }

        if token.is_cancelled() {
            return Ok(self.classify_cancellation(task_id));
        }
        Ok(ChunkOutcome::Completed)
    }

    #[allow(clippy::too_many_arguments)]
    async fn transfer_compressed_upload(
        self: &Arc<Self>,
        task_id: &TaskId,
        session_id: &SessionId,
        connection_id: &ConnectionId,
        file: &TransferFile,
        config: &TransferRequestConfig,
        token: &CancellationToken,
        parallel: bool,
    ) -> Result<Outcome, ConnectError> {
        let requested = config.compression.unwrap_or(CompressionMethod::Gzip);
        let method = compression::effective_local_method(requested);

        self.publish_progress_at(task_id, &file.name, TransferPhase::Compressing, 0.0);

        let local_tmp = local_temp_dir().join(format!("{}{}", random_suffix(), method.extension()));
        let data = tokio::fs::read(&file.local_path).await?;
        let local_tmp_clone = local_tmp.clone();
        tokio::task::spawn_blocking(move || {
            use flate2::write::GzEncoder;
            use flate2::Compression;
            use std::io::Write;
            let out = std::fs::File::create(&local_tmp_clone)?;
            let mut encoder = GzEncoder::new(out, Compression::default());
            encoder.write_all(&data)?;
            encoder.finish()?;
            Ok::<(), std::io::Error>(())
        })
        .await
        .map_err(|err| ConnectError::Internal(err.to_string()))??;

        if token.is_cancelled() {
            let _ = tokio::fs::remove_file(&local_tmp).await;
            return Ok(self.classify_cancellation(task_id));
        }
        self.publish_progress_at(task_id, &file.name, TransferPhase::Compressing, 10.0);

        let artifact_size = tokio::fs::metadata(&local_tmp).await?.len();
        let remote_tmp = format!("/tmp/{}{}", random_suffix(), method.extension());
        let artifact_file = TransferFile {
            name: format!("{}{}", file.name, method.extension()),
            remote_path: remote_tmp.clone(),
            local_path: local_tmp.display().to_string(),
            size: artifact_size,
        };

        let upload_outcome = self
            .transfer_plain_upload(task_id, connection_id, &artifact_file, config, token, parallel, (10.0, 90.0))
            .await?;
        let _ = tokio::fs::remove_file(&local_tmp).await;

        match upload_outcome {
            Outcome::Completed(_) => {}
            other => return Ok(other),
        }

        self.publish_progress_at(task_id, &file.name, TransferPhase::Extracting, 90.0);
        let extract_cmd = compression::remote_extract_command(method, &remote_tmp, &file.remote_path);
        let extract_result = self.executor.exec_checked(&session_id.0, &extract_cmd).await;
        self.cleanup_remote(&session_id.0, &remote_tmp).await;
        extract_result?;

        Ok(Outcome::Completed(file.remote_path.clone()))
    }

    // ---- shared plumbing ----------------------------------------------

    async fn finish(&self, task_id: &TaskId, result: Result<Outcome, ConnectError>) {
        match result {
            Ok(Outcome::Completed(artifact_path)) => {
                self.registry.set_status(task_id, TaskStatus::Completed);
                self.events.publish(Event::Completed {
                    task_id: task_id.clone(),
                    artifact_path,
                });
                self.registry.remove(task_id);
            }
            Ok(Outcome::Paused) => {
                self.events.publish(Event::Paused { task_id: task_id.clone() });
            }
            Ok(Outcome::Cancelled) => {
                self.events.publish(Event::Cancelled { task_id: task_id.clone() });
                self.registry.remove(task_id);
            }
            Err(err) => {
                error!("task {task_id} failed: {err}");
                self.registry.set_status(task_id, TaskStatus::Errored);
                self.events.publish(Event::Error {
                    task_id: task_id.clone(),
                    error: err.to_string(),
                });
                self.registry.remove(task_id);
            }
        }
    }

    fn classify_cancellation(&self, task_id: &TaskId) -> ChunkOutcome {
        match self.registry.status(task_id) {
            Some(TaskStatus::Paused) => ChunkOutcome::Paused,
            _ => ChunkOutcome::Cancelled,
        }
    }

    async fn ensure_sftp(&self, session_id: &SessionId) -> Result<ConnectionId, ConnectError> {
        let connection_id = sftp_connection_id(session_id);
        if !self.sftp.contains(&connection_id.0).await {
            let handle = self.pools.get_connection(&session_id.0, Role::Transfer).await?;
            self.sftp.create_client(&connection_id.0, handle.connection()).await?;
            handle.release();
        }
        Ok(connection_id)
    }

    async fn cleanup_remote(&self, session_id: &str, remote_path: &str) {
        let cmd = format!("rm -f {}", compression::shell_quote(remote_path));
        if let Err(err) = self.executor.exec(session_id, &cmd).await {
            warn!("failed to clean up remote artifact {remote_path}: {err}");
        }
    }

    async fn cleanup_remote_via_sftp(&self, connection_id: &str, path: &str) {
        // Best-effort: a cancelled/paused upload leaves no intermediate
        // artifact behind, per distilled §4.10 "no temp file belonging to T
        // remains ... after the cancelled event".
        if let Err(err) = self.sftp.remove_file(connection_id, path).await {
            debug!("cleanup of partial remote upload {path} failed (already gone?): {err}");
        }
    }

    fn publish_progress_at(&self, task_id: &TaskId, current_file: &str, phase: TransferPhase, percentage: f64) {
        self.events.publish(Event::Progress {
            task_id: task_id.clone(),
            transferred: 0,
            total: 0,
            percentage,
            speed_bytes_per_sec: 0.0,
            remaining_seconds: None,
            phase,
            current_file: current_file.to_string(),
            files_completed: 0,
        });
    }

    fn spawn_progress_poller(
        self: Arc<Self>,
        task_id: TaskId,
        progress: Arc<Progress>,
        phase: TransferPhase,
        current_file: String,
        progress_range: (f64, f64),
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(100));
            loop {
                interval.tick().await;
                let transferred = progress.reported_bytes();
                let total = progress.total;
                let fraction = if total == 0 { 1.0 } else { (transferred as f64 / total as f64).clamp(0.0, 1.0) };
                let (lo, hi) = progress_range;
                let percentage = lo + fraction * (hi - lo);
                let (speed, eta) = {
                    let ring = progress.speed.lock().await;
                    (ring.speed_bytes_per_sec(), ring.eta_seconds(total.saturating_sub(transferred)))
                };
                self.events.publish(Event::Progress {
                    task_id: task_id.clone(),
                    transferred,
                    total,
                    percentage,
                    speed_bytes_per_sec: speed,
                    remaining_seconds: eta,
                    phase,
                    current_file: current_file.clone(),
                    files_completed: progress.files_completed.load(Ordering::Relaxed),
                });
            }
        })
    }
}

async fn download_chunk_with_retry(
    sftp: Arc<SftpClientCache>,
    connection_id: ConnectionId,
    remote_path: String,
    local_file: LocalFile,
    chunk: Chunk,
    progress: Arc<Progress>,
    token: CancellationToken,
) -> Result<(), ConnectError> {
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Ok(());
        }
        let start = chunk.start + chunk.transferred;
        match download_chunk_once(&sftp, &connection_id, &remote_path, &local_file, start, chunk.end, &progress, &token).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < CHUNK_MAX_RETRIES => {
                attempt += 1;
                warn!("download chunk {} retry {attempt}/{CHUNK_MAX_RETRIES}: {err}", chunk.id);
                tokio::time::sleep(CHUNK_RETRY_BASE_DELAY * attempt).await;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn download_chunk_once(
    sftp: &Arc<SftpClientCache>,
    connection_id: &ConnectionId,
    remote_path: &str,
    local_file: &LocalFile,
    start: u64,
    end: u64,
    progress: &Arc<Progress>,
    token: &CancellationToken,
) -> Result<(), ConnectError> {
    let mut pos = start;
    while pos < end {
        if token.is_cancelled() {
            return Ok(());
        }
        let want = (end - pos).min(SUB_READ_SIZE as u64);
        let bytes = sftp.read_range(&connection_id.0, remote_path, pos, want as i64).await?;
        if bytes.is_empty() {
            break;
        }
        range::write_at(local_file, pos, &bytes).await?;
        pos += bytes.len() as u64;
        progress.transferred.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        progress.sample().await;
    }
    Ok(())
}

async fn upload_chunk_with_retry(
    sftp: Arc<SftpClientCache>,
    connection_id: ConnectionId,
    remote_path: String,
    local_file: LocalFile,
    chunk: Chunk,
    progress: Arc<Progress>,
    token: CancellationToken,
) -> Result<(), ConnectError> {
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Ok(());
        }
        match upload_chunk_once(&sftp, &connection_id, &remote_path, &local_file, &chunk, &progress, &token).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < CHUNK_MAX_RETRIES => {
                attempt += 1;
                warn!("upload chunk {} retry {attempt}/{CHUNK_MAX_RETRIES}: {err}", chunk.id);
                tokio::time::sleep(CHUNK_RETRY_BASE_DELAY * attempt).await;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn upload_chunk_once(
    sftp: &Arc<SftpClientCache>,
    connection_id: &ConnectionId,
    remote_path: &str,
    local_file: &LocalFile,
    chunk: &Chunk,
    progress: &Arc<Progress>,
    token: &CancellationToken,
) -> Result<(), ConnectError> {
    if token.is_cancelled() {
        return Ok(());
    }
    let mut buf = vec![0u8; chunk.len() as usize];
    {
        let mut guard = local_file.lock().await;
        guard.seek(std::io::SeekFrom::Start(chunk.start)).await?;
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = guard.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
    }
    sftp.write_at(&connection_id.0, remote_path, chunk.start, &buf).await?;
    progress.max_uploaded_position.fetch_max(chunk.end, Ordering::Relaxed);
    progress.sample().await;
    Ok(())
}

/// OS temp directory subfolder for this engine's own local intermediate
/// artifacts (compressed-upload staging), generalized from the source
/// system's `electerm-*` convention to this crate's own prefix, per
/// distilled §6 "File-system conventions".
fn local_temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join("ssh-broker");
    let _ = std::fs::create_dir_all(&dir);
    dir
}

/// Sum of bytes already durable on disk across a resumed chunk list:
/// fully-completed chunks contribute their whole length, and the one chunk
/// straddling `resumePosition` contributes its already-durable prefix
/// (`chunk.transferred`, set by `planning::resume_chunks`). On a fresh
/// (non-resumed) plan every chunk is `Pending` with `transferred == 0`, so
/// this is 0; on a resumed plan it sums to exactly `resumePosition`.
fn resumed_chunk_baseline(chunks: &[Chunk]) -> u64 {
    chunks
        .iter()
        .map(|c| if c.status == ChunkStatus::Completed { c.len() } else { c.transferred })
        .sum()
}

fn local_temp_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    final_path.with_file_name(name)
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..10)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_temp_path_appends_part_suffix() {
        let path = local_temp_path(Path::new("/home/user/downloads/file.bin"));
        assert_eq!(path, Path::new("/home/user/downloads/file.bin.part"));
    }

    #[test]
    fn local_temp_dir_is_a_named_subfolder_of_the_os_temp_dir() {
        let dir = local_temp_dir();
        assert_eq!(dir, std::env::temp_dir().join("ssh-broker"));
        assert!(dir.is_dir());
    }

    #[test]
    fn resumed_chunk_baseline_is_zero_for_a_fresh_plan() {
        let chunks = planning::plan_chunks(1000, 4);
        assert_eq!(resumed_chunk_baseline(&chunks), 0);
    }

    #[test]
    fn resumed_chunk_baseline_matches_resume_position_exactly() {
        // chunk_size=250: chunk 0 wholly below 300, chunk 1 straddles it.
        let chunks = planning::resume_chunks(planning::plan_chunks(1000, 4), 300);
        assert_eq!(resumed_chunk_baseline(&chunks), 300);
    }

    #[test]
    fn resumed_chunk_baseline_handles_resume_position_on_a_chunk_boundary() {
        let chunks = planning::resume_chunks(planning::plan_chunks(1000, 4), 250);
        assert_eq!(resumed_chunk_baseline(&chunks), 250);
    }

    #[test]
    fn random_suffix_is_alphanumeric_and_fixed_length() {
        let suffix = random_suffix();
        assert_eq!(suffix.len(), 10);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn progress_reports_max_uploaded_position_for_uploads() {
        let progress = Progress::new(100, Direction::Upload);
        progress.transferred.store(40, Ordering::Relaxed);
        progress.max_uploaded_position.store(25, Ordering::Relaxed);
        assert_eq!(progress.reported_bytes(), 25);
    }

    #[test]
    fn progress_reports_transferred_for_downloads() {
        let progress = Progress::new(100, Direction::Download);
        progress.transferred.store(40, Ordering::Relaxed);
        progress.max_uploaded_position.store(99, Ordering::Relaxed);
        assert_eq!(progress.reported_bytes(), 40);
    }
}
