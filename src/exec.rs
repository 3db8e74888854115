//! C4 — Command Executor: one-shot `exec` over a pooled connection.
//!
//! Grounded on `async-ssh2-tokio`'s `Client::execute` one-shot primitive
//! (used directly rather than the teacher's interactive-shell channel loop,
//! since distilled §4.4 wants buffered stdout/stderr/exit rather than a
//! streamed PTY) and on the teacher's timeout-wrapper discipline
//! (`write_with_timeout`) for the default/command timeout.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::error::ConnectError;
use crate::pool::{PoolManager, Role};

/// Default cap on captured stdout+stderr, per distilled §4.4 (configurable).
pub const DEFAULT_OUTPUT_CAP_BYTES: usize = 8 * 1024 * 1024;
/// Default command timeout, per distilled §4.4.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Buffered result of a one-shot command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

pub struct CommandExecutor {
    pools: Arc<PoolManager>,
    output_cap: usize,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self {
            pools,
            output_cap: DEFAULT_OUTPUT_CAP_BYTES,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_limits(pools: Arc<PoolManager>, output_cap: usize, timeout: Duration) -> Self {
        Self {
            pools,
            output_cap,
            timeout,
        }
    }

    /// `exec(sessionId, command) -> {stdout, stderr, exitCode}`.
    ///
    /// Acquires a shared-pool connection (priority 1). On `PoolExhausted`,
    /// falls back to the dedicated connection — accepting that the user's
    /// interactive shell may briefly contend for bandwidth, per distilled
    /// §4.4.
    pub async fn exec(
        &self,
        session_id: &str,
        command: &str,
    ) -> Result<CommandOutput, ConnectError> {
        let handle = match self.pools.get_connection(session_id, Role::Command).await {
            Ok(handle) => handle,
            Err(ConnectError::PoolExhausted(_)) => {
                warn!(
                    "shared pool exhausted for session {session_id}, falling back to dedicated connection"
                );
                self.pools.get_connection(session_id, Role::Terminal).await?
            }
            Err(err) => return Err(err),
        };

        let conn = handle.connection().clone();
        let run = conn.client.execute(command);
        let result = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| ConnectError::Timeout(format!("exec: {command}")))?
            .map_err(ConnectError::Ssh)?;

        debug!(
            "session {session_id} exec exit={} command={command:?}",
            result.exit_status
        );

        let mut stdout = result.stdout;
        let mut stderr = result.stderr;
        truncate_to_cap(&mut stdout, self.output_cap);
        truncate_to_cap(&mut stderr, self.output_cap / 4);

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code: result.exit_status as i32,
        })
    }

    /// Like [`exec`](Self::exec), but for internal orchestration commands
    /// (compress/extract/cleanup steps of the compression pipeline) whose
    /// caller has no separate place to inspect `exit_code` — unlike
    /// `ssh:execute-command`, which reports the exit code verbatim to the
    /// UI per distilled §4.4, these are plumbing steps where a non-zero
    /// exit is this crate's own failure to propagate, not data to hand
    /// back. Returns `ServerCommandFailed` on a non-zero exit.
    pub async fn exec_checked(
        &self,
        session_id: &str,
        command: &str,
    ) -> Result<CommandOutput, ConnectError> {
        let output = self.exec(session_id, command).await?;
        if output.exit_code != 0 {
            return Err(ConnectError::ServerCommandFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }
}

/// Truncates `s` to at most `cap` bytes, backing off to the nearest
/// preceding UTF-8 char boundary so multi-byte output is never split mid
/// character (`String::truncate` panics on a non-boundary index).
fn truncate_to_cap(s: &mut String, cap: usize) {
    if s.len() > cap {
        let mut boundary = cap;
        while boundary > 0 && !s.is_char_boundary(boundary) {
            boundary -= 1;
        }
        s.truncate(boundary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_preserves_short_strings() {
        let mut s = "hi\nthere\n".to_string();
        truncate_to_cap(&mut s, 1024);
        assert_eq!(s, "hi\nthere\n");
    }

    #[test]
    fn truncate_caps_long_strings() {
        let mut s = "x".repeat(100);
        truncate_to_cap(&mut s, 10);
        assert_eq!(s.len(), 10);
    }

    #[test]
    fn truncate_backs_off_to_char_boundary() {
        // Each "é" is 2 bytes; a cap landing mid-character must not panic
        // and must back off to the preceding boundary.
        let mut s = "é".repeat(5);
        truncate_to_cap(&mut s, 7);
        assert!(s.is_char_boundary(s.len()));
        assert!(s.len() <= 7);
    }
}
