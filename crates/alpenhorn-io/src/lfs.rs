//! A wrapper around invoking the `lfs(1)` command to drive Lustre HSM
//! state and read group quota, used by the [`crate::node::LustreHsm`] and
//! [`crate::node::LustreQuota`] node backends.
//!
//! Grounded directly on `alpenhorn/io/lfs.py`'s `LFS` class: only three
//! subcommands are ever invoked (`quota`, `hsm_state`, `hsm_restore`,
//! `hsm_release`), and their text output is parsed rather than using any
//! structured Lustre API, because that's all the original wrapper does
//! too — there is no machine-readable `lfs` output format to bind to.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HsmState {
    /// Not present on disk or in external storage.
    Missing,
    /// On disk, not yet archived to external storage.
    Unarchived,
    /// In external storage and on disk.
    Restored,
    /// In external storage only.
    Released,
}

#[derive(Debug, thiserror::Error)]
pub enum LfsError {
    #[error("lfs(1) command not found on PATH")]
    CommandNotFound,
    #[error("lfs command timed out")]
    TimedOut,
    #[error("lfs command failed with status {0:?}")]
    CommandFailed(Option<i32>),
    #[error("error parsing lfs output: {0:?}")]
    ParseError(String),
    #[error("group is using the default block quota setting and no fixed quota was configured")]
    DefaultQuotaUnavailable,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct Lfs {
    lfs_path: std::path::PathBuf,
    quota_group: String,
    fixed_quota_kib: Option<i64>,
}

impl Lfs {
    pub fn new(quota_group: impl Into<String>, fixed_quota_kib: Option<i64>, lfs_cmd: &str) -> Result<Self, LfsError> {
        let lfs_path = which::which(lfs_cmd).map_err(|_| LfsError::CommandNotFound)?;
        Ok(Self { lfs_path, quota_group: quota_group.into(), fixed_quota_kib })
    }

    async fn run(&self, args: &[&str], timeout: Option<Duration>) -> Result<String, LfsError> {
        let mut cmd = Command::new(&self.lfs_path);
        cmd.args(args);
        let run = cmd.output();

        let output = match timeout {
            Some(t) => tokio::time::timeout(t, run).await.map_err(|_| LfsError::TimedOut)??,
            None => run.await?,
        };

        if !output.status.success() {
            tracing::warn!(args = ?args, status = ?output.status, "lfs command failed");
            return Err(LfsError::CommandFailed(output.status.code()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// The remaining block quota (in bytes) for `path`'s owning group.
    pub async fn quota_remaining(&self, path: &Path) -> Result<i64, LfsError> {
        let path_str = path.to_string_lossy().to_string();
        let stdout = self.run(&["quota", "-q", "-g", &self.quota_group, &path_str], None).await?;

        let mut lines: Vec<&str> = stdout.lines().collect();
        if lines.is_empty() {
            return Err(LfsError::ParseError(stdout));
        }

        if lines[0] == path_str {
            lines.remove(0);
            if lines.is_empty() {
                return Err(LfsError::ParseError(stdout));
            }
        } else if let Some(rest) = stdout.strip_prefix(&path_str) {
            lines[0] = rest.lines().next().unwrap_or("");
        } else {
            return Err(LfsError::ParseError(stdout));
        }

        let fields: Vec<&str> = lines[0].split_whitespace().collect();
        if fields.len() != 8 {
            return Err(LfsError::ParseError(stdout));
        }

        for line in &lines[1..] {
            if line.contains("using default block quota setting") && self.fixed_quota_kib.is_none() {
                return Err(LfsError::DefaultQuotaUnavailable);
            }
        }

        let quota_limit = match self.fixed_quota_kib {
            Some(fixed) => fixed,
            None => fields[1].parse().map_err(|_| LfsError::ParseError(stdout.clone()))?,
        };

        // Over-quota usage is suffixed with '*'.
        let used: i64 = fields[0].trim_end_matches('*').parse().map_err(|_| LfsError::ParseError(stdout.clone()))?;

        Ok((quota_limit - used) * 1024)
    }

    /// The HSM state of `path`. Files that don't exist on disk are
    /// reported `Missing` without invoking `lfs` at all.
    pub async fn hsm_state(&self, path: &Path) -> Result<HsmState, LfsError> {
        if !path.exists() {
            return Ok(HsmState::Missing);
        }

        let path_str = path.to_string_lossy().to_string();
        let stdout = self.run(&["hsm_state", &path_str], None).await?;

        let rest = stdout
            .strip_prefix(&format!("{path_str}:"))
            .ok_or_else(|| LfsError::ParseError(stdout.clone()))?;

        if !rest.contains("archived") {
            Ok(HsmState::Unarchived)
        } else if rest.contains("released") {
            Ok(HsmState::Released)
        } else {
            Ok(HsmState::Restored)
        }
    }

    pub async fn hsm_archived(&self, path: &Path) -> Result<bool, LfsError> {
        let state = self.hsm_state(path).await?;
        Ok(matches!(state, HsmState::Restored | HsmState::Released))
    }

    /// Request the state change `Released -> Restored`. A no-op (success)
    /// if the file is already restored; fails if the file is missing.
    pub async fn hsm_restore(&self, path: &Path) -> Result<bool, LfsError> {
        let state = self.hsm_state(path).await?;
        if state == HsmState::Missing {
            return Ok(false);
        }
        if state != HsmState::Released {
            return Ok(true);
        }
        let path_str = path.to_string_lossy().to_string();
        self.run(&["hsm_restore", &path_str], Some(Duration::from_secs(60))).await?;
        Ok(true)
    }

    /// Request the state change `Restored -> Released`, to reclaim disk
    /// space. A no-op (success) if already released; fails if the file is
    /// unarchived or missing (nothing to release to).
    pub async fn hsm_release(&self, path: &Path) -> Result<bool, LfsError> {
        let state = self.hsm_state(path).await?;
        if state == HsmState::Released {
            return Ok(true);
        }
        if state != HsmState::Restored {
            return Ok(false);
        }
        let path_str = path.to_string_lossy().to_string();
        Ok(self.run(&["hsm_release", &path_str], None).await.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_line_parses_over_quota_marker() {
        let fields: Vec<&str> = "1048580* 1048576 1048576 - 10 0 0 -".split_whitespace().collect();
        assert_eq!(fields.len(), 8);
        let used: i64 = fields[0].trim_end_matches('*').parse().unwrap();
        assert_eq!(used, 1048580);
    }
}
