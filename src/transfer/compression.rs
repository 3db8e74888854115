//! C8 — Compression Pipeline: stateless helpers used by the transfer
//! engine to build remote shell commands and map staged progress.
//!
//! Grounded on the teacher's shell-command construction discipline
//! (`device.rs`/`templates.rs` build exact command strings with explicit
//! escaping), generalized here to gzip/bzip2/xz compress/extract commands
//! with single-quote escaping, per distilled §4.8.

use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::exec::CommandExecutor;
use crate::error::ConnectError;

/// Supported compression methods, per distilled §3 `CompressionStrategy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMethod {
    Gzip,
    Bzip2,
    Xz,
}

impl CompressionMethod {
    pub fn extension(self) -> &'static str {
        match self {
            CompressionMethod::Gzip => ".gz",
            CompressionMethod::Bzip2 => ".tar.bz2",
            CompressionMethod::Xz => ".tar.xz",
        }
    }

    fn required_binaries(self) -> &'static [&'static str] {
        match self {
            CompressionMethod::Gzip => &["gzip", "gunzip"],
            CompressionMethod::Bzip2 => &["tar", "bzip2", "bunzip2"],
            CompressionMethod::Xz => &["tar", "xz", "unxz"],
        }
    }
}

/// Single-quote-escapes a path for interpolation into a remote shell
/// command: `'` -> `'"'"'`, the whole thing wrapped in single quotes.
/// Distilled §4.8/§9: "no shell metacharacters are otherwise interpolated".
pub fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', "'\"'\"'"))
}

/// Builds the remote compress command for phase 1 of a compressed
/// download, per distilled §4.6. Single-file gzip uses `gzip -c`; other
/// methods use `tar` with a `cd` prefix so archive members are relative.
pub fn remote_compress_command(
    method: CompressionMethod,
    remote_src: &str,
    remote_tmp: &str,
) -> String {
    match method {
        CompressionMethod::Gzip => {
            format!("gzip -c {} > {}", shell_quote(remote_src), shell_quote(remote_tmp))
        }
        CompressionMethod::Bzip2 => tar_compress_command(remote_src, remote_tmp, "cjf"),
        CompressionMethod::Xz => tar_compress_command(remote_src, remote_tmp, "cJf"),
    }
}

fn tar_compress_command(remote_src: &str, remote_tmp: &str, tar_flags: &str) -> String {
    let (parent, name) = split_parent_name(remote_src);
    format!(
        "cd {} && tar -{} {} {}",
        shell_quote(&parent),
        tar_flags,
        shell_quote(remote_tmp),
        shell_quote(&name)
    )
}

/// Builds the remote extract command for phase 3 of a compressed upload,
/// per distilled §4.6 mirror description.
pub fn remote_extract_command(method: CompressionMethod, remote_tmp: &str, remote_dst: &str) -> String {
    match method {
        CompressionMethod::Gzip => {
            format!("gunzip -c {} > {}", shell_quote(remote_tmp), shell_quote(remote_dst))
        }
        CompressionMethod::Bzip2 => format!(
            "cd {} && tar -xjf {}",
            shell_quote(remote_dst),
            shell_quote(remote_tmp)
        ),
        CompressionMethod::Xz => format!(
            "cd {} && tar -xJf {}",
            shell_quote(remote_dst),
            shell_quote(remote_tmp)
        ),
    }
}

fn split_parent_name(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/".to_string(), trimmed[1..].to_string()),
        Some(idx) => (trimmed[..idx].to_string(), trimmed[idx + 1..].to_string()),
        None => (".".to_string(), trimmed.to_string()),
    }
}

/// Maps a phase-local fraction (0.0-1.0) into the overall task percentage
/// for the three-phase compressed pipeline, per distilled §4.6: phases are
/// mapped 0->10%, 10->90%, 90->100%.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionPhase {
    Compressing,
    Transferring,
    Extracting,
}

impl CompressionPhase {
    fn range(self) -> (f64, f64) {
        match self {
            CompressionPhase::Compressing => (0.0, 10.0),
            CompressionPhase::Transferring => (10.0, 90.0),
            CompressionPhase::Extracting => (90.0, 100.0),
        }
    }

    pub fn map_progress(self, fraction: f64) -> f64 {
        let fraction = fraction.clamp(0.0, 1.0);
        let (lo, hi) = self.range();
        lo + fraction * (hi - lo)
    }
}

/// Per-session availability cache, keyed by (method) -> available. Probed
/// once via `which <binary>` the first time a method is attempted, per
/// distilled §4.8.
#[derive(Default)]
pub struct AvailabilityCache {
    cache: Mutex<HashMap<CompressionMethod, bool>>,
}

impl AvailabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_available(
        &self,
        executor: &CommandExecutor,
        session_id: &str,
        method: CompressionMethod,
    ) -> Result<bool, ConnectError> {
        if let Some(known) = self.cache.lock().await.get(&method).copied() {
            return Ok(known);
        }

        let mut available = true;
        for binary in method.required_binaries() {
            let check = format!("which {binary}");
            match executor.exec(session_id, &check).await {
                Ok(output) if output.exit_code == 0 => {}
                _ => {
                    available = false;
                    break;
                }
            }
        }
        self.cache.lock().await.insert(method, available);
        Ok(available)
    }
}

/// Global (lazily constructed) probe cache usable by engines that don't
/// thread an `AvailabilityCache` through their own state. Transfer engines
/// hold their own per-instance cache; this exists only for standalone
/// compression-helper callers/tests.
pub static DEFAULT_AVAILABILITY: Lazy<AvailabilityCache> = Lazy::new(AvailabilityCache::new);

/// Only gzip is guaranteed locally (in-process, via `flate2`); other
/// methods fall back to gzip with a logged notice, per distilled §4.6
/// "Compressed upload (mirror)".
pub fn effective_local_method(requested: CompressionMethod) -> CompressionMethod {
    match requested {
        CompressionMethod::Gzip => CompressionMethod::Gzip,
        other => {
            log::info!("{other:?} compression is not guaranteed locally, falling back to gzip");
            CompressionMethod::Gzip
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_embedded_single_quotes() {
        assert_eq!(shell_quote("it's/a/path"), "'it'\"'\"'s/a/path'");
    }

    #[test]
    fn shell_quote_wraps_plain_paths() {
        assert_eq!(shell_quote("/tmp/file"), "'/tmp/file'");
    }

    #[test]
    fn remote_compress_command_for_gzip_is_single_file() {
        let cmd = remote_compress_command(CompressionMethod::Gzip, "/var/log/a.log", "/tmp/x.gz");
        assert_eq!(cmd, "gzip -c '/var/log/a.log' > '/tmp/x.gz'");
    }

    #[test]
    fn remote_compress_command_for_tar_methods_cds_first() {
        let cmd = remote_compress_command(CompressionMethod::Bzip2, "/srv/data", "/tmp/x.tar.bz2");
        assert_eq!(cmd, "cd '/srv' && tar -cjf '/tmp/x.tar.bz2' 'data'");
    }

    #[test]
    fn phase_progress_mapping_respects_disjoint_ranges() {
        assert_eq!(CompressionPhase::Compressing.map_progress(0.0), 0.0);
        assert_eq!(CompressionPhase::Compressing.map_progress(1.0), 10.0);
        assert_eq!(CompressionPhase::Transferring.map_progress(0.5), 50.0);
        assert_eq!(CompressionPhase::Extracting.map_progress(1.0), 100.0);
    }

    #[test]
    fn effective_local_method_falls_back_to_gzip() {
        assert_eq!(
            effective_local_method(CompressionMethod::Xz),
            CompressionMethod::Gzip
        );
        assert_eq!(
            effective_local_method(CompressionMethod::Gzip),
            CompressionMethod::Gzip
        );
    }
}
