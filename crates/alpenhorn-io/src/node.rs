//! Node I/O: the capability set through which the update loop and auto-import
//! touch bytes on a specific [`StorageNode`](alpenhorn_db::models::StorageNode).
//!
//! Grounded on `alpenhorn/io/default.py`, `alpenhorn/io/polling.py`,
//! `alpenhorn/io/lustrequota.py` and `alpenhorn/io/lustrehsm.py` (the
//! built-in I/O classes of the original), generalised behind one
//! [`NodeIo`] trait so the update loop doesn't need to match on node flavour
//! itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use alpenhorn_db::models::{FileCopy, FileCopyRequest, StorageNode};

use crate::lfs::{HsmState, Lfs, LfsError};

#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Lfs(#[from] LfsError),
    #[error("node is not yet initialised (no ALPENHORN_NODE marker)")]
    Uninitialized,
}

pub type Result<T> = std::result::Result<T, IoError>;

/// The outcome of re-verifying a copy against its recorded MD5, grounded on
/// `DefaultNodeIO.check`'s three-way result: a copy whose bytes are simply
/// gone is `has_file=N` again, not corrupt, whereas one that's present but
/// wrong (bad MD5, wrong size, unreadable) is `has_file=X`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    Good,
    Corrupt,
    Missing,
}

/// The remote-facing view of a node, used by *other* hosts' daemons when a
/// pull names this node as the source. Grounded on `RemoteNode` in the
/// original: a much smaller capability set than the local [`NodeIo`].
#[async_trait]
pub trait RemoteNode: Send + Sync {
    /// A human-readable `host:path`-style address for this node, used in
    /// logs and in constructing a pull's source argument.
    fn file_addr(&self, acq_name: &str, file_name: &str) -> String;

    /// The absolute path to the file on this node's filesystem.
    fn file_path(&self, acq_name: &str, file_name: &str) -> PathBuf;

    /// Is this node ready to serve `file` as a pull source right now? (For
    /// HSM-backed nodes, this means the file has been restored to disk.)
    async fn pull_ready(&self, acq_name: &str, file_name: &str) -> Result<bool>;
}

/// The local capability set for a node this daemon's host manages directly.
#[async_trait]
pub trait NodeIo: Send + Sync {
    /// Has this node been initialised (does its root contain the
    /// `ALPENHORN_NODE` marker)?
    async fn check_init(&self) -> Result<bool>;

    /// Initialise the node's root (write the `ALPENHORN_NODE` marker).
    async fn init(&self) -> Result<()>;

    /// Available space on the node, in bytes, if it can be determined.
    async fn bytes_avail(&self, fast: bool) -> Result<Option<u64>>;

    /// The size, in bytes, of `path` relative to the node's root.
    /// `actual` requests allocated-on-disk size rather than nominal size.
    async fn filesize(&self, path: &Path, actual: bool) -> Result<u64>;

    /// The MD5 hex digest of `acq_name/file_name` on this node.
    async fn md5(&self, acq_name: &str, file_name: &str) -> Result<String>;

    /// Is `path` ready to be read (fully materialised, not mid-transfer)?
    async fn ready_path(&self, path: &Path) -> Result<bool>;

    /// Is `path` currently locked by a concurrent writer?
    async fn locked(&self, path: &Path) -> Result<bool>;

    /// Re-verify a copy: compare on-disk bytes against the stored MD5.
    async fn check(&self, copy: &FileCopy, acq_name: &str, file_name: &str, expected_md5: &str) -> Result<CheckResult>;

    /// Delete a batch of copies from this node's storage.
    async fn delete(&self, copies: &[(FileCopy, PathBuf)]) -> Result<()>;

    /// Prepare `request`'s file to be pulled from this node (e.g. restore
    /// from HSM), returning whether it's now ready.
    async fn ready_pull(&self, request: &FileCopyRequest, acq_name: &str, file_name: &str) -> Result<bool>;

    /// Run once per update pass when this node's queue was empty at the
    /// start of the pass and remains so; `first` is true on the very first
    /// idle pass after a busy one.
    async fn idle_update(&self, first: bool) -> Result<()>;

    /// Run once before each update pass. Returns whether the node was idle
    /// (used to gate `idle_update`/group idle-dispatch).
    async fn before_update(&self, was_idle: bool) -> Result<bool>;

    /// Run once after each update pass.
    async fn after_update(&self) -> Result<()>;

    /// Headroom, in bytes, this node's idle pass tries to keep free by
    /// releasing archived copies back to external storage. Zero (the
    /// default, for backends with no release concept) disables the
    /// release pass entirely.
    fn release_headroom_bytes(&self) -> u64 {
        0
    }

    /// Release `copies` (already chosen by the caller, oldest-accessed
    /// first, from rows this node reports as on-disk) to reclaim space.
    /// A no-op for backends that never overrode `release_headroom_bytes`.
    async fn release(&self, copies: &[(FileCopy, PathBuf)]) -> Result<()> {
        let _ = copies;
        Ok(())
    }

    /// The FIFO key used for tasks dispatched against this node.
    fn fifo(&self) -> String;

    fn remote(&self) -> Arc<dyn RemoteNode>;
}

fn node_root(node: &StorageNode) -> PathBuf {
    PathBuf::from(&node.root)
}

fn acq_file_path(node: &StorageNode, acq_name: &str, file_name: &str) -> PathBuf {
    node_root(node).join(acq_name).join(file_name)
}

const NODE_MARKER: &str = "ALPENHORN_NODE";

/// Free space on the filesystem backing `path`, in bytes, via `statvfs(2)`.
/// Runs on a blocking thread since `statvfs` has no async equivalent.
/// Returns `None` (rather than erroring) if the syscall fails, since a
/// node with unreadable free space should just be treated as unbounded by
/// callers, matching `DefaultNode`'s prior "unknown" behaviour.
async fn statvfs_avail(path: std::path::PathBuf) -> Option<u64> {
    tokio::task::spawn_blocking(move || {
        use std::os::unix::ffi::OsStrExt;
        let cpath = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
        if rc != 0 {
            return None;
        }
        Some(stat.f_bavail as u64 * stat.f_frsize as u64)
    })
    .await
    .unwrap_or(None)
}

async fn md5_of(path: &Path) -> Result<String> {
    use md5::{Digest, Md5};
    let bytes = tokio::fs::read(path).await?;
    let digest = Md5::digest(&bytes);
    Ok(format!("{digest:x}"))
}

/// Plain local-filesystem node: the default backend, used for ordinary
/// (non-Lustre) archive and transport nodes.
pub struct DefaultNode {
    pub node: StorageNode,
}

struct DefaultRemote {
    root: PathBuf,
    host: String,
}

#[async_trait]
impl RemoteNode for DefaultRemote {
    fn file_addr(&self, acq_name: &str, file_name: &str) -> String {
        format!("{}:{}", self.host, self.root.join(acq_name).join(file_name).display())
    }

    fn file_path(&self, acq_name: &str, file_name: &str) -> PathBuf {
        self.root.join(acq_name).join(file_name)
    }

    async fn pull_ready(&self, acq_name: &str, file_name: &str) -> Result<bool> {
        Ok(tokio::fs::metadata(self.file_path(acq_name, file_name)).await.is_ok())
    }
}

#[async_trait]
impl NodeIo for DefaultNode {
    async fn check_init(&self) -> Result<bool> {
        Ok(tokio::fs::metadata(node_root(&self.node).join(NODE_MARKER)).await.is_ok())
    }

    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(node_root(&self.node)).await?;
        tokio::fs::write(node_root(&self.node).join(NODE_MARKER), b"").await?;
        Ok(())
    }

    async fn bytes_avail(&self, _fast: bool) -> Result<Option<u64>> {
        Ok(statvfs_avail(node_root(&self.node)).await)
    }

    async fn filesize(&self, path: &Path, _actual: bool) -> Result<u64> {
        let meta = tokio::fs::metadata(node_root(&self.node).join(path)).await?;
        Ok(meta.len())
    }

    async fn md5(&self, acq_name: &str, file_name: &str) -> Result<String> {
        md5_of(&acq_file_path(&self.node, acq_name, file_name)).await
    }

    async fn ready_path(&self, path: &Path) -> Result<bool> {
        Ok(tokio::fs::metadata(node_root(&self.node).join(path)).await.is_ok())
    }

    async fn locked(&self, path: &Path) -> Result<bool> {
        let lockfile = node_root(&self.node).join(format!(".{}.lock", path.display()));
        Ok(tokio::fs::metadata(lockfile).await.is_ok())
    }

    async fn check(&self, _copy: &FileCopy, acq_name: &str, file_name: &str, expected_md5: &str) -> Result<CheckResult> {
        let path = acq_file_path(&self.node, acq_name, file_name);
        match md5_of(&path).await {
            Ok(actual) if actual == expected_md5 => Ok(CheckResult::Good),
            Ok(_) => Ok(CheckResult::Corrupt),
            Err(IoError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(CheckResult::Missing),
            // Any other read failure (permission denied, etc.) means we
            // found *something* there that we can't trust: corrupt, not
            // missing, matching `test_check_md5sum_perm`.
            Err(_) => Ok(CheckResult::Corrupt),
        }
    }

    async fn delete(&self, copies: &[(FileCopy, PathBuf)]) -> Result<()> {
        for (_, path) in copies {
            let full = node_root(&self.node).join(path);
            match tokio::fs::remove_file(&full).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn ready_pull(&self, _request: &FileCopyRequest, acq_name: &str, file_name: &str) -> Result<bool> {
        Ok(tokio::fs::metadata(acq_file_path(&self.node, acq_name, file_name)).await.is_ok())
    }

    async fn idle_update(&self, _first: bool) -> Result<()> {
        Ok(())
    }

    async fn before_update(&self, was_idle: bool) -> Result<bool> {
        Ok(was_idle)
    }

    async fn after_update(&self) -> Result<()> {
        Ok(())
    }

    fn fifo(&self) -> String {
        format!("node/{}", self.node.name)
    }

    fn remote(&self) -> Arc<dyn RemoteNode> {
        Arc::new(DefaultRemote { root: node_root(&self.node), host: self.node.host.clone() })
    }
}

/// A node reachable only through a polling helper (e.g. a remote host with
/// no local filesystem access), grounded on `alpenhorn/io/polling.py`: all
/// operations delegate to [`DefaultNode`] except that presence is learned
/// from an externally-maintained listing rather than `stat`-ing directly.
pub struct PollingNode {
    pub inner: DefaultNode,
    pub known_present: Arc<parking_lot::Mutex<std::collections::HashSet<PathBuf>>>,
}

#[async_trait]
impl NodeIo for PollingNode {
    async fn check_init(&self) -> Result<bool> {
        self.inner.check_init().await
    }
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }
    async fn bytes_avail(&self, fast: bool) -> Result<Option<u64>> {
        self.inner.bytes_avail(fast).await
    }
    async fn filesize(&self, path: &Path, actual: bool) -> Result<u64> {
        self.inner.filesize(path, actual).await
    }
    async fn md5(&self, acq_name: &str, file_name: &str) -> Result<String> {
        self.inner.md5(acq_name, file_name).await
    }
    async fn ready_path(&self, path: &Path) -> Result<bool> {
        Ok(self.known_present.lock().contains(path))
    }
    async fn locked(&self, path: &Path) -> Result<bool> {
        self.inner.locked(path).await
    }
    async fn check(&self, copy: &FileCopy, acq_name: &str, file_name: &str, expected_md5: &str) -> Result<CheckResult> {
        self.inner.check(copy, acq_name, file_name, expected_md5).await
    }
    async fn delete(&self, copies: &[(FileCopy, PathBuf)]) -> Result<()> {
        self.inner.delete(copies).await
    }
    async fn ready_pull(&self, request: &FileCopyRequest, acq_name: &str, file_name: &str) -> Result<bool> {
        self.inner.ready_pull(request, acq_name, file_name).await
    }
    async fn idle_update(&self, first: bool) -> Result<()> {
        self.inner.idle_update(first).await
    }
    async fn before_update(&self, was_idle: bool) -> Result<bool> {
        self.inner.before_update(was_idle).await
    }
    async fn after_update(&self) -> Result<()> {
        self.inner.after_update().await
    }
    fn fifo(&self) -> String {
        self.inner.fifo()
    }
    fn remote(&self) -> Arc<dyn RemoteNode> {
        self.inner.remote()
    }
}

/// A Lustre node with quota awareness layered over [`DefaultNode`], grounded
/// on `alpenhorn/io/lustrequota.py`.
pub struct LustreQuotaNode {
    pub inner: DefaultNode,
    pub lfs: Arc<Lfs>,
}

#[async_trait]
impl NodeIo for LustreQuotaNode {
    async fn check_init(&self) -> Result<bool> {
        self.inner.check_init().await
    }
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }
    async fn bytes_avail(&self, _fast: bool) -> Result<Option<u64>> {
        let remaining = self.lfs.quota_remaining(&node_root(&self.inner.node)).await?;
        Ok(Some(remaining.max(0) as u64))
    }
    async fn filesize(&self, path: &Path, actual: bool) -> Result<u64> {
        self.inner.filesize(path, actual).await
    }
    async fn md5(&self, acq_name: &str, file_name: &str) -> Result<String> {
        self.inner.md5(acq_name, file_name).await
    }
    async fn ready_path(&self, path: &Path) -> Result<bool> {
        self.inner.ready_path(path).await
    }
    async fn locked(&self, path: &Path) -> Result<bool> {
        self.inner.locked(path).await
    }
    async fn check(&self, copy: &FileCopy, acq_name: &str, file_name: &str, expected_md5: &str) -> Result<CheckResult> {
        self.inner.check(copy, acq_name, file_name, expected_md5).await
    }
    async fn delete(&self, copies: &[(FileCopy, PathBuf)]) -> Result<()> {
        self.inner.delete(copies).await
    }
    async fn ready_pull(&self, request: &FileCopyRequest, acq_name: &str, file_name: &str) -> Result<bool> {
        self.inner.ready_pull(request, acq_name, file_name).await
    }
    async fn idle_update(&self, first: bool) -> Result<()> {
        self.inner.idle_update(first).await
    }
    async fn before_update(&self, was_idle: bool) -> Result<bool> {
        self.inner.before_update(was_idle).await
    }
    async fn after_update(&self) -> Result<()> {
        self.inner.after_update().await
    }
    fn fifo(&self) -> String {
        self.inner.fifo()
    }
    fn remote(&self) -> Arc<dyn RemoteNode> {
        self.inner.remote()
    }
}

/// A Lustre node with HSM-backed external storage, grounded on
/// `alpenhorn/io/lustrehsm.py`. Presence on disk alone doesn't mean the
/// copy is usable as a pull source: a `Released` file must be restored
/// first, and disk space can be reclaimed by releasing `Restored` files
/// that are safely archived.
pub struct LustreHsmNode {
    pub inner: DefaultNode,
    pub lfs: Arc<Lfs>,
    /// Headroom, in bytes, to try to keep free by releasing restored files.
    pub release_headroom_bytes: u64,
}

impl LustreHsmNode {
    fn path_of(&self, acq_name: &str, file_name: &str) -> PathBuf {
        acq_file_path(&self.inner.node, acq_name, file_name)
    }
}

#[async_trait]
impl NodeIo for LustreHsmNode {
    async fn check_init(&self) -> Result<bool> {
        self.inner.check_init().await
    }
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }
    async fn bytes_avail(&self, _fast: bool) -> Result<Option<u64>> {
        let remaining = self.lfs.quota_remaining(&node_root(&self.inner.node)).await?;
        Ok(Some(remaining.max(0) as u64))
    }
    async fn filesize(&self, path: &Path, actual: bool) -> Result<u64> {
        self.inner.filesize(path, actual).await
    }
    async fn md5(&self, acq_name: &str, file_name: &str) -> Result<String> {
        self.inner.md5(acq_name, file_name).await
    }
    async fn ready_path(&self, path: &Path) -> Result<bool> {
        self.inner.ready_path(path).await
    }
    async fn locked(&self, path: &Path) -> Result<bool> {
        self.inner.locked(path).await
    }
    async fn check(&self, copy: &FileCopy, acq_name: &str, file_name: &str, expected_md5: &str) -> Result<CheckResult> {
        let path = self.path_of(acq_name, file_name);
        match self.lfs.hsm_state(&path).await? {
            HsmState::Released => Ok(CheckResult::Good), // can't verify bytes we don't have on disk
            _ => self.inner.check(copy, acq_name, file_name, expected_md5).await,
        }
    }
    async fn delete(&self, copies: &[(FileCopy, PathBuf)]) -> Result<()> {
        self.inner.delete(copies).await
    }
    async fn ready_pull(&self, request: &FileCopyRequest, acq_name: &str, file_name: &str) -> Result<bool> {
        let path = self.path_of(acq_name, file_name);
        match self.lfs.hsm_state(&path).await? {
            HsmState::Released => {
                self.lfs.hsm_restore(&path).await?;
                Ok(false)
            }
            HsmState::Restored => Ok(true),
            _ => self.inner.ready_pull(request, acq_name, file_name).await,
        }
    }
    async fn idle_update(&self, _first: bool) -> Result<()> {
        Ok(())
    }
    async fn before_update(&self, was_idle: bool) -> Result<bool> {
        self.inner.before_update(was_idle).await
    }
    async fn after_update(&self) -> Result<()> {
        self.inner.after_update().await
    }
    fn release_headroom_bytes(&self) -> u64 {
        self.release_headroom_bytes
    }
    async fn release(&self, copies: &[(FileCopy, PathBuf)]) -> Result<()> {
        for (_, path) in copies {
            let full = node_root(&self.inner.node).join(path);
            self.lfs.hsm_release(&full).await?;
        }
        Ok(())
    }
    fn fifo(&self) -> String {
        self.inner.fifo()
    }
    fn remote(&self) -> Arc<dyn RemoteNode> {
        self.inner.remote()
    }
}

/// Which [`NodeIo`] variant a node's `io_class` column selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeIoClass {
    Default,
    Polling,
    LustreQuota,
    LustreHsm,
}

impl NodeIoClass {
    pub fn from_db(class: Option<&str>) -> Self {
        match class {
            Some("Polling") => NodeIoClass::Polling,
            Some("LustreQuota") => NodeIoClass::LustreQuota,
            Some("LustreHSM") => NodeIoClass::LustreHsm,
            _ => NodeIoClass::Default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_class_defaults_on_unknown() {
        assert_eq!(NodeIoClass::from_db(Some("bogus")), NodeIoClass::Default);
        assert_eq!(NodeIoClass::from_db(None), NodeIoClass::Default);
        assert_eq!(NodeIoClass::from_db(Some("LustreHSM")), NodeIoClass::LustreHsm);
    }
}
