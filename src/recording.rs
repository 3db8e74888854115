//! C14 — Session Recorder / Replayer: deterministic event capture and
//! replay, used as this crate's own test harness in place of a live SSH
//! server.
//!
//! Directly grounded on `session/recording.rs`: same `SessionRecordLevel`
//! tiers, same `SessionRecordEntry { ts_ms, event }` envelope, same JSONL
//! export/import/`normalize_jsonl` shape. `SessionEvent`'s variants are
//! rebuilt for this engine's own lifecycle — connection, shell, exec, and
//! transfer events — in place of the teacher's CLI-prompt/mode events.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ConnectError;

/// Recording granularity, per distilled §4.14.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub enum SessionRecordLevel {
    /// Disable recording.
    Off,
    /// Record lifecycle events only (connect/disconnect/shell/exec/transfer
    /// terminal events). Skips raw shell bytes and per-tick progress.
    KeyEventsOnly,
    /// Record everything, including raw shell chunks and progress ticks.
    #[default]
    Full,
}

/// One recorded event plus its capture timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionRecordEntry {
    pub ts_ms: u128,
    pub event: SessionEvent,
}

/// Options for turning a live JSONL capture into a stable test fixture.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeOptions {
    /// Keep raw shell data chunks.
    pub keep_raw_chunks: bool,
    /// Keep per-tick transfer progress events.
    pub keep_transfer_progress: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            keep_raw_chunks: false,
            keep_transfer_progress: false,
        }
    }
}

/// Recorded event types, covering the connection/shell/exec/transfer
/// lifecycle named across distilled §4.1-§4.10.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    ConnectionEstablished {
        session_id: String,
        host: String,
        port: u16,
    },
    ConnectionClosed {
        session_id: String,
        reason: String,
    },
    ShellOpened {
        session_id: String,
        shell_id: String,
    },
    ShellClosed {
        shell_id: String,
    },
    CommandExecuted {
        session_id: String,
        command: String,
        exit_code: i32,
        success: bool,
        stdout: String,
        stderr: String,
    },
    TransferStarted {
        task_id: String,
        direction: String,
        file_name: String,
        size: u64,
    },
    TransferProgress {
        task_id: String,
        transferred: u64,
        total: u64,
        percentage: f64,
    },
    TransferCompleted {
        task_id: String,
        artifact_path: String,
    },
    TransferPaused {
        task_id: String,
    },
    TransferCancelled {
        task_id: String,
    },
    TransferFailed {
        task_id: String,
        error: String,
    },
    RawChunk {
        shell_id: String,
        data: String,
    },
}

/// In-memory session recorder, safe to clone and share across tasks.
#[derive(Debug, Clone)]
pub struct SessionRecorder {
    level: SessionRecordLevel,
    entries: Arc<Mutex<Vec<SessionRecordEntry>>>,
}

impl SessionRecorder {
    pub fn new(level: SessionRecordLevel) -> Self {
        Self {
            level,
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn level(&self) -> SessionRecordLevel {
        self.level
    }

    /// Records a lifecycle event, subject to the recorder's level: `Off`
    /// drops everything, `KeyEventsOnly` still records every variant here
    /// except `RawChunk`/`TransferProgress` (those go through the
    /// dedicated methods below, which check the level themselves).
    pub fn record_event(&self, event: SessionEvent) -> Result<(), ConnectError> {
        if self.level == SessionRecordLevel::Off {
            return Ok(());
        }
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| ConnectError::Internal(format!("record lock error: {e}")))?;
        guard.push(SessionRecordEntry {
            ts_ms: now_ms(),
            event,
        });
        Ok(())
    }

    /// Records a raw shell data chunk, only at `Full` level.
    pub fn record_raw_chunk(&self, shell_id: String, data: String) -> Result<(), ConnectError> {
        if self.level != SessionRecordLevel::Full {
            return Ok(());
        }
        self.record_event(SessionEvent::RawChunk { shell_id, data })
    }

    /// Records one progress tick, only at `Full` level — `KeyEventsOnly`
    /// still captures the transfer's start/terminal events.
    pub fn record_transfer_progress(
        &self,
        task_id: String,
        transferred: u64,
        total: u64,
        percentage: f64,
    ) -> Result<(), ConnectError> {
        if self.level != SessionRecordLevel::Full {
            return Ok(());
        }
        self.record_event(SessionEvent::TransferProgress {
            task_id,
            transferred,
            total,
            percentage,
        })
    }

    pub fn entries(&self) -> Result<Vec<SessionRecordEntry>, ConnectError> {
        let guard = self
            .entries
            .lock()
            .map_err(|e| ConnectError::Internal(format!("record lock error: {e}")))?;
        Ok(guard.clone())
    }

    pub fn clear(&self) -> Result<(), ConnectError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| ConnectError::Internal(format!("record lock error: {e}")))?;
        guard.clear();
        Ok(())
    }

    pub fn to_jsonl(&self) -> Result<String, ConnectError> {
        let entries = self.entries()?;
        let mut lines = Vec::with_capacity(entries.len());
        for entry in entries {
            let line = serde_json::to_string(&entry)
                .map_err(|e| ConnectError::Internal(format!("record encode error: {e}")))?;
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }

    pub fn from_jsonl(jsonl: &str) -> Result<Self, ConnectError> {
        let recorder = Self::new(SessionRecordLevel::Full);
        if jsonl.trim().is_empty() {
            return Ok(recorder);
        }

        let mut parsed = Vec::new();
        for line in jsonl.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: SessionRecordEntry = serde_json::from_str(line)
                .map_err(|e| ConnectError::Internal(format!("record decode error: {e}")))?;
            parsed.push(entry);
        }

        let mut guard = recorder
            .entries
            .lock()
            .map_err(|e| ConnectError::Internal(format!("record lock error: {e}")))?;
        *guard = parsed;
        drop(guard);

        Ok(recorder)
    }

    /// Turns a live JSONL capture into a stable fixture: sorts by
    /// timestamp and drops noisy event kinds per `options`.
    pub fn normalize_jsonl(jsonl: &str, options: NormalizeOptions) -> Result<String, ConnectError> {
        let recorder = Self::from_jsonl(jsonl)?;
        let mut indexed = recorder
            .entries()?
            .into_iter()
            .enumerate()
            .collect::<Vec<(usize, SessionRecordEntry)>>();

        indexed.sort_by(|(idx_a, a), (idx_b, b)| a.ts_ms.cmp(&b.ts_ms).then_with(|| idx_a.cmp(idx_b)));

        let filtered = indexed
            .into_iter()
            .filter_map(|(_, entry)| match &entry.event {
                SessionEvent::RawChunk { .. } if !options.keep_raw_chunks => None,
                SessionEvent::TransferProgress { .. } if !options.keep_transfer_progress => None,
                _ => Some(entry),
            })
            .collect::<Vec<_>>();

        let normalized = SessionRecorder {
            level: SessionRecordLevel::Full,
            entries: Arc::new(Mutex::new(filtered)),
        };
        normalized.to_jsonl()
    }
}

impl Default for SessionRecorder {
    fn default() -> Self {
        Self::new(SessionRecordLevel::Full)
    }
}

/// Initial connection context recovered from a recording, used to seed an
/// offline test without dialing a real host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayContext {
    pub session_id: String,
    pub host: String,
    pub port: u16,
}

/// One replayed command result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedCommand {
    pub exit_code: i32,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Offline replayer backed by a recording, answering `exec`/transfer
/// queries without a live connection — this crate's test harness (distilled
/// §4.14/§8).
#[derive(Debug, Clone)]
pub struct SessionReplayer {
    entries: Vec<SessionRecordEntry>,
    cursor: usize,
}

impl SessionReplayer {
    pub fn from_recorder(recorder: &SessionRecorder) -> Self {
        let entries = recorder.entries().unwrap_or_default();
        Self { entries, cursor: 0 }
    }

    pub fn from_jsonl(jsonl: &str) -> Result<Self, ConnectError> {
        let recorder = SessionRecorder::from_jsonl(jsonl)?;
        Ok(Self::from_recorder(&recorder))
    }

    /// Returns the first `ConnectionEstablished` event in the recording, if
    /// any.
    pub fn initial_context(&self) -> Option<ReplayContext> {
        for entry in &self.entries {
            if let SessionEvent::ConnectionEstablished { session_id, host, port } = &entry.event {
                return Some(ReplayContext {
                    session_id: session_id.clone(),
                    host: host.clone(),
                    port: *port,
                });
            }
        }
        None
    }

    /// Replays the next recorded `CommandExecuted` event matching `command`,
    /// advancing the cursor past it.
    pub fn replay_next(&mut self, command: &str) -> Result<ReplayedCommand, ConnectError> {
        while self.cursor < self.entries.len() {
            let entry = &self.entries[self.cursor];
            self.cursor += 1;

            if let SessionEvent::CommandExecuted {
                command: recorded_command,
                exit_code,
                success,
                stdout,
                stderr,
                ..
            } = &entry.event
            {
                if recorded_command != command {
                    continue;
                }
                return Ok(ReplayedCommand {
                    exit_code: *exit_code,
                    success: *success,
                    stdout: stdout.clone(),
                    stderr: stderr.clone(),
                });
            }
        }
        Err(ConnectError::ReplayMismatchError(format!(
            "no replayable output found for command '{command}'"
        )))
    }

    /// Replays a whole script of commands in order, useful for asserting an
    /// end-to-end flow without a live server.
    pub fn replay_script(&mut self, commands: &[&str]) -> Result<Vec<ReplayedCommand>, ConnectError> {
        commands.iter().map(|command| self.replay_next(command)).collect()
    }

    /// Replays the terminal event of a recorded transfer task, used by
    /// tests exercising the progress->completion path end to end.
    pub fn replay_transfer_terminal(&mut self, task_id: &str) -> Result<SessionEvent, ConnectError> {
        while self.cursor < self.entries.len() {
            let entry = &self.entries[self.cursor];
            self.cursor += 1;
            let matches_task = match &entry.event {
                SessionEvent::TransferCompleted { task_id: t, .. }
                | SessionEvent::TransferPaused { task_id: t }
                | SessionEvent::TransferCancelled { task_id: t }
                | SessionEvent::TransferFailed { task_id: t, .. } => t == task_id,
                _ => false,
            };
            if matches_task {
                return Ok(entry.event.clone());
            }
        }
        Err(ConnectError::ReplayMismatchError(format!(
            "no terminal transfer event found for task '{task_id}'"
        )))
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOISY_FIXTURE: &str = r#"{"ts_ms":3,"event":{"kind":"raw_chunk","shell_id":"sh1","data":"chunk-2"}}
{"ts_ms":1,"event":{"kind":"connection_established","session_id":"s1","host":"10.0.0.1","port":22}}
{"ts_ms":4,"event":{"kind":"transfer_progress","task_id":"t1","transferred":10,"total":100,"percentage":10.0}}
{"ts_ms":5,"event":{"kind":"command_executed","session_id":"s1","command":"ls","exit_code":0,"success":true,"stdout":"a\nb","stderr":""}}
"#;

    #[test]
    fn recorder_jsonl_roundtrip() {
        let recorder = SessionRecorder::new(SessionRecordLevel::Full);
        recorder
            .record_event(SessionEvent::ShellClosed {
                shell_id: "sh1".to_string(),
            })
            .expect("record shell closed");

        let jsonl = recorder.to_jsonl().expect("encode jsonl");
        let restored = SessionRecorder::from_jsonl(&jsonl).expect("decode jsonl");
        let entries = restored.entries().expect("entries");

        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].event, SessionEvent::ShellClosed { .. }));
    }

    #[test]
    fn replayer_returns_matching_command_output() {
        let recorder = SessionRecorder::new(SessionRecordLevel::Full);
        recorder
            .record_event(SessionEvent::CommandExecuted {
                session_id: "s1".to_string(),
                command: "uptime".to_string(),
                exit_code: 0,
                success: true,
                stdout: "up 3 days".to_string(),
                stderr: String::new(),
            })
            .expect("record command");

        let mut replayer = SessionReplayer::from_recorder(&recorder);
        let out = replayer.replay_next("uptime").expect("replay");
        assert!(out.success);
        assert_eq!(out.stdout, "up 3 days");
    }

    #[test]
    fn replayer_supports_initial_context_for_offline_connection_tests() {
        let recorder = SessionRecorder::new(SessionRecordLevel::Full);
        recorder
            .record_event(SessionEvent::ConnectionEstablished {
                session_id: "s1".to_string(),
                host: "192.168.1.1".to_string(),
                port: 22,
            })
            .expect("record connect");

        let replayer = SessionReplayer::from_recorder(&recorder);
        let ctx = replayer.initial_context().expect("context");
        assert_eq!(ctx.host, "192.168.1.1");
        assert_eq!(ctx.port, 22);
    }

    #[test]
    fn replay_script_can_test_command_flow_without_ssh() {
        let recorder = SessionRecorder::new(SessionRecordLevel::Full);
        recorder
            .record_event(SessionEvent::CommandExecuted {
                session_id: "s1".to_string(),
                command: "terminal length 0".to_string(),
                exit_code: 0,
                success: true,
                stdout: String::new(),
                stderr: String::new(),
            })
            .expect("record output 1");
        recorder
            .record_event(SessionEvent::CommandExecuted {
                session_id: "s1".to_string(),
                command: "show version".to_string(),
                exit_code: 0,
                success: true,
                stdout: "Version 1.0".to_string(),
                stderr: String::new(),
            })
            .expect("record output 2");

        let mut replayer = SessionReplayer::from_recorder(&recorder);
        let outputs = replayer
            .replay_script(&["terminal length 0", "show version"])
            .expect("replay script");
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[1].stdout, "Version 1.0");
    }

    #[test]
    fn replay_next_detects_missing_command() {
        let recorder = SessionRecorder::new(SessionRecordLevel::Full);
        recorder
            .record_event(SessionEvent::CommandExecuted {
                session_id: "s1".to_string(),
                command: "show clock".to_string(),
                exit_code: 0,
                success: true,
                stdout: "12:00:00".to_string(),
                stderr: String::new(),
            })
            .expect("record command output");

        let mut replayer = SessionReplayer::from_recorder(&recorder);
        let err = replayer.replay_next("show version").unwrap_err();
        assert!(matches!(err, ConnectError::ReplayMismatchError(_)));
    }

    #[test]
    fn replay_transfer_terminal_finds_completed_event() {
        let recorder = SessionRecorder::new(SessionRecordLevel::Full);
        recorder
            .record_event(SessionEvent::TransferStarted {
                task_id: "t1".to_string(),
                direction: "download".to_string(),
                file_name: "a.bin".to_string(),
                size: 1024,
            })
            .expect("record start");
        recorder
            .record_event(SessionEvent::TransferCompleted {
                task_id: "t1".to_string(),
                artifact_path: "/tmp/a.bin".to_string(),
            })
            .expect("record completed");

        let mut replayer = SessionReplayer::from_recorder(&recorder);
        let terminal = replayer.replay_transfer_terminal("t1").expect("terminal event");
        assert!(matches!(terminal, SessionEvent::TransferCompleted { .. }));
    }

    #[test]
    fn from_jsonl_accepts_empty_input() {
        let restored = SessionRecorder::from_jsonl("").expect("decode empty jsonl");
        assert!(restored.entries().expect("entries").is_empty());
    }

    #[test]
    fn recorder_clear_removes_all_entries() {
        let recorder = SessionRecorder::new(SessionRecordLevel::Full);
        recorder
            .record_event(SessionEvent::ShellClosed {
                shell_id: "sh1".to_string(),
            })
            .expect("record shell closed");
        recorder.clear().expect("clear");
        assert!(recorder.entries().expect("entries").is_empty());
    }

    #[test]
    fn key_events_only_skips_raw_chunks_and_progress() {
        let recorder = SessionRecorder::new(SessionRecordLevel::KeyEventsOnly);
        recorder
            .record_raw_chunk("sh1".to_string(), "raw-shell-data".to_string())
            .expect("record raw");
        recorder
            .record_transfer_progress("t1".to_string(), 10, 100, 10.0)
            .expect("record progress");
        recorder
            .record_event(SessionEvent::ShellClosed {
                shell_id: "sh1".to_string(),
            })
            .expect("record shell closed");

        let entries = recorder.entries().expect("entries");
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].event, SessionEvent::ShellClosed { .. }));
    }

    #[test]
    fn off_level_records_nothing() {
        let recorder = SessionRecorder::new(SessionRecordLevel::Off);
        recorder
            .record_event(SessionEvent::ShellClosed {
                shell_id: "sh1".to_string(),
            })
            .expect("record shell closed");
        recorder
            .record_raw_chunk("sh1".to_string(), "raw-shell-data".to_string())
            .expect("record raw");

        assert!(recorder.entries().expect("entries").is_empty());
    }

    #[test]
    fn normalize_jsonl_filters_noise_and_sorts_by_timestamp() {
        let normalized =
            SessionRecorder::normalize_jsonl(NOISY_FIXTURE, NormalizeOptions::default()).expect("normalize");
        let restored = SessionRecorder::from_jsonl(&normalized).expect("restore normalized");
        let entries = restored.entries().expect("entries");

        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0].event, SessionEvent::ConnectionEstablished { .. }));
        assert!(matches!(entries[1].event, SessionEvent::CommandExecuted { .. }));
        assert!(entries[0].ts_ms <= entries[1].ts_ms);
    }

    #[test]
    fn normalize_jsonl_can_keep_all_event_types() {
        let options = NormalizeOptions {
            keep_raw_chunks: true,
            keep_transfer_progress: true,
        };
        let normalized = SessionRecorder::normalize_jsonl(NOISY_FIXTURE, options).expect("normalize");
        let restored = SessionRecorder::from_jsonl(&normalized).expect("restore normalized");
        assert_eq!(restored.entries().expect("entries").len(), 4);
    }
}
