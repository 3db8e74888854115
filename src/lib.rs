//! # ssh_broker - connection-pooled SSH/SFTP engine for a desktop client
//!
//! `ssh_broker` is a library for a desktop SSH/SFTP client's backend: it
//! dials and pools SSH connections per remote session, multiplexes
//! interactive shells and one-shot command execution over those
//! connections, and runs resumable, optionally-compressed, optionally
//! parallel-chunked file transfers — all driven through a single typed
//! [`Engine`] value and observed through one [`ipc::EventSink`].
//!
//! ## Features
//!
//! - **Tiered connection pooling**: one dedicated connection per session for
//!   interactive shells, plus separate bounded pools for one-shot command
//!   execution and file transfers, so a long `tar` or `show tech` never
//!   blocks a terminal keystroke.
//! - **Shell multiplexing**: any number of concurrently open PTYs per
//!   session, each with byte-stream events and best-effort cwd tracking.
//! - **Resumable transfers**: chunked parallel upload/download with
//!   adaptive buffering, speed/ETA estimation, and pause/resume for
//!   downloads.
//! - **Compression pipelines**: gzip/bzip2/xz, chosen per file size and
//!   remote tool availability, compressed remotely before download and
//!   locally before upload.
//! - **Deterministic test harness**: a session recorder/replayer records a
//!   live run as JSONL and replays it without a live SSH server.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ssh_broker::engine::Engine;
//! use ssh_broker::ipc::{BroadcastEventSink, EventSink, SessionId, SessionInfo};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let events: Arc<dyn EventSink> = Arc::new(BroadcastEventSink::new(1024));
//!     let engine = Engine::new(events);
//!     let session_id = SessionId::from("prod-1");
//!
//!     let session = SessionInfo {
//!         id: session_id.0.clone(),
//!         host: "192.168.1.1".to_string(),
//!         port: 22,
//!         username: "admin".to_string(),
//!         password: Some("hunter2".to_string()),
//!         private_key_path: None,
//!         passphrase: None,
//!         default_cwd: None,
//!     };
//!     engine.connect(session, Default::default()).await?;
//!
//!     let output = engine.execute_command(&session_id, "uname -a").await?;
//!     println!("{}", output.stdout);
//!
//!     engine.disconnect(&session_id).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`engine::Engine`] - the single entry point wiring every component
//!   together; construct one per process.
//! - [`pool::PoolManager`] - per-session dedicated/shared/transfer
//!   connection pools.
//! - [`shell::ShellManager`] - PTY allocation, resize, and byte streaming.
//! - [`exec::CommandExecutor`] - buffered one-shot command execution.
//! - [`sftp::SftpClientCache`] - SFTP handles, directory cache, path
//!   history.
//! - [`transfer::TransferEngine`] - chunked transfer task lifecycle,
//!   compression, and resume.
//! - [`registry::TaskRegistry`] - cancellation tokens and status for every
//!   in-flight transfer task.
//! - [`recording`] - deterministic session recorder/replayer.
//! - [`security`] / [`config`] - SSH algorithm security profiles.
//! - [`error::ConnectError`] - the single error type propagated from every
//!   layer.

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod exec;
pub mod ipc;
pub mod pool;
pub mod recording;
pub mod registry;
pub mod security;
pub mod sftp;
pub mod shell;
pub mod transfer;
