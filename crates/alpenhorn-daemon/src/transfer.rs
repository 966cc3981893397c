//! `rsync`(1) invocation for pull transfers.
//!
//! Grounded on `alpenhorn/daemon/update.py`'s pull dispatch and the
//! subprocess-timeout policy of §5: `pull_timeout_base + size_b /
//! pull_bytes_per_second`.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;

use crate::pullutil::{Md5Check, TransferOutcome};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("rsync(1) not found on PATH")]
    CommandNotFound,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Run `rsync` from `source` (a `host:path` address, or a bare path for a
/// same-host copy) to `dest_path`, timing out per §5's policy.
pub async fn rsync_pull<'a>(
    source: &str,
    dest_path: &Path,
    size_b: i64,
    pull_timeout_base: u64,
    pull_bytes_per_second: u64,
) -> Result<TransferOutcome<'a>, TransferError> {
    let rsync_path = which::which("rsync").map_err(|_| TransferError::CommandNotFound)?;

    let timeout_secs = pull_timeout_base + (size_b as u64).checked_div(pull_bytes_per_second.max(1)).unwrap_or(0);

    if let Some(parent) = dest_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let mut cmd = Command::new(rsync_path);
    cmd.arg("-t").arg("--chmod=u+rw,go+r").arg(source).arg(dest_path);

    let run = cmd.output();
    let outcome = match tokio::time::timeout(Duration::from_secs(timeout_secs), run).await {
        Ok(Ok(output)) if output.status.success() => TransferOutcome {
            succeeded: true,
            check_src: false,
            md5_check: Md5Check::Verdict(true),
            actual_size: Box::new(move || size_b),
        },
        Ok(Ok(output)) => {
            tracing::warn!(status = ?output.status, "rsync failed");
            TransferOutcome {
                succeeded: false,
                check_src: true,
                md5_check: Md5Check::Verdict(false),
                actual_size: Box::new(move || 0),
            }
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            tracing::warn!(timeout_secs, "rsync timed out");
            TransferOutcome {
                succeeded: false,
                check_src: false,
                md5_check: Md5Check::Verdict(false),
                actual_size: Box::new(move || 0),
            }
        }
    };

    Ok(outcome)
}
