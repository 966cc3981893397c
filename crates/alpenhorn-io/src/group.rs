//! Group I/O: the capability set the update loop uses to decide how a
//! [`StorageGroup`](alpenhorn_db::models::StorageGroup) of nodes should pull
//! files in from elsewhere.
//!
//! Grounded on `alpenhorn/io/default.py::DefaultGroupIO`,
//! `alpenhorn/io/transport.py` and `alpenhorn/io/lustrehsm.py`'s group side.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use alpenhorn_db::models::{FileCopyRequest, StorageGroup, StorageNode};

use crate::node::{NodeIo, RemoteNode};

#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Node(#[from] crate::node::IoError),
    #[error("group has no member nodes able to accept a pull")]
    NoEligibleNode,
}

pub type Result<T> = std::result::Result<T, IoError>;

/// The outcome of attempting to service a pull request against a group.
pub enum PullOutcome {
    /// The file already exists in the group (on some member node); the
    /// request can be marked complete without moving any bytes.
    AlreadyPresent,
    /// The pull was dispatched to `node_name` and is now in flight; the
    /// caller is responsible for following up via `pullutil::copy_request_done`.
    Dispatched { node_name: String },
    /// No member node could currently accept the pull (e.g. everyone's over
    /// quota); try again on the next pass.
    Deferred,
}

#[async_trait]
pub trait GroupIo: Send + Sync {
    /// Replace this group's view of its member nodes for the coming update
    /// pass (nodes may have gone active/inactive since the last pass).
    async fn set_nodes(&mut self, nodes: Vec<(StorageNode, Arc<dyn NodeIo>)>);

    /// Does any member node already have `acq_name/file_name`?
    async fn exists(&self, acq_name: &str, file_name: &str) -> Result<bool>;

    /// Service a pull request under normal free-space accounting.
    async fn pull(&self, request: &FileCopyRequest, acq_name: &str, file_name: &str, size_b: i64) -> Result<PullOutcome>;

    /// Service a pull request ignoring free-space accounting (used when an
    /// operator has forced the request).
    async fn pull_force(&self, request: &FileCopyRequest, acq_name: &str, file_name: &str) -> Result<PullOutcome>;

    /// Run once before each update pass; `was_idle` reports whether the
    /// group's dispatch queue was empty at the end of the previous pass.
    async fn before_update(&self, was_idle: bool) -> Result<()>;

    /// Run once per pass when the group had nothing to do.
    async fn idle_update(&self) -> Result<()>;

    /// Run once after each update pass.
    async fn after_update(&self) -> Result<()>;

    /// The FIFO key used for tasks dispatched against this group.
    fn fifo(&self) -> String;
}

fn acq_file_rel(acq_name: &str, file_name: &str) -> PathBuf {
    PathBuf::from(acq_name).join(file_name)
}

async fn first_node_with_space(
    nodes: &[(StorageNode, Arc<dyn NodeIo>)],
    size_b: i64,
) -> Option<usize> {
    for (i, (node, io)) in nodes.iter().enumerate() {
        if !node.active {
            continue;
        }
        match io.bytes_avail(false).await {
            Ok(Some(avail)) if avail >= size_b as u64 => return Some(i),
            Ok(None) => return Some(i), // unknown free space: assume OK, matches DefaultGroupIO
            _ => continue,
        }
    }
    None
}

/// The default group backend: pulls always land on the group's first
/// active node with enough declared free space (or unknown free space,
/// treated optimistically), grounded on `DefaultGroupIO.pull`.
pub struct DefaultGroup {
    pub group: StorageGroup,
    pub nodes: Vec<(StorageNode, Arc<dyn NodeIo>)>,
}

#[async_trait]
impl GroupIo for DefaultGroup {
    async fn set_nodes(&mut self, nodes: Vec<(StorageNode, Arc<dyn NodeIo>)>) {
        self.nodes = nodes;
    }

    async fn exists(&self, acq_name: &str, file_name: &str) -> Result<bool> {
        for (_, io) in &self.nodes {
            if io.ready_path(&acq_file_rel(acq_name, file_name)).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn pull(&self, _request: &FileCopyRequest, acq_name: &str, file_name: &str, size_b: i64) -> Result<PullOutcome> {
        if self.exists(acq_name, file_name).await? {
            return Ok(PullOutcome::AlreadyPresent);
        }
        match first_node_with_space(&self.nodes, size_b).await {
            Some(i) => Ok(PullOutcome::Dispatched { node_name: self.nodes[i].0.name.clone() }),
            None => Ok(PullOutcome::Deferred),
        }
    }

    async fn pull_force(&self, _request: &FileCopyRequest, acq_name: &str, file_name: &str) -> Result<PullOutcome> {
        if self.exists(acq_name, file_name).await? {
            return Ok(PullOutcome::AlreadyPresent);
        }
        match self.nodes.iter().find(|(n, _)| n.active) {
            Some((node, _)) => Ok(PullOutcome::Dispatched { node_name: node.name.clone() }),
            None => Err(IoError::NoEligibleNode),
        }
    }

    async fn before_update(&self, _was_idle: bool) -> Result<()> {
        Ok(())
    }

    async fn idle_update(&self) -> Result<()> {
        Ok(())
    }

    async fn after_update(&self) -> Result<()> {
        Ok(())
    }

    fn fifo(&self) -> String {
        format!("group/{}", self.group.name)
    }
}

/// A "transport" group, grounded on `alpenhorn/io/transport.py`: pulls are
/// spread across member nodes by free space rather than always favouring
/// the first node, so a rotating pool of small-capacity transport disks
/// fills up evenly.
pub struct TransportGroup {
    pub group: StorageGroup,
    pub nodes: Vec<(StorageNode, Arc<dyn NodeIo>)>,
}

#[async_trait]
impl GroupIo for TransportGroup {
    async fn set_nodes(&mut self, nodes: Vec<(StorageNode, Arc<dyn NodeIo>)>) {
        self.nodes = nodes;
    }

    async fn exists(&self, acq_name: &str, file_name: &str) -> Result<bool> {
        for (_, io) in &self.nodes {
            if io.ready_path(&acq_file_rel(acq_name, file_name)).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn pull(&self, _request: &FileCopyRequest, acq_name: &str, file_name: &str, size_b: i64) -> Result<PullOutcome> {
        if self.exists(acq_name, file_name).await? {
            return Ok(PullOutcome::AlreadyPresent);
        }

        let mut best: Option<(usize, u64)> = None;
        for (i, (node, io)) in self.nodes.iter().enumerate() {
            if !node.active {
                continue;
            }
            if let Ok(Some(avail)) = io.bytes_avail(false).await {
                if avail >= size_b as u64 && best.map(|(_, b)| avail > b).unwrap_or(true) {
                    best = Some((i, avail));
                }
            }
        }

        match best {
            Some((i, _)) => Ok(PullOutcome::Dispatched { node_name: self.nodes[i].0.name.clone() }),
            None => Ok(PullOutcome::Deferred),
        }
    }

    async fn pull_force(&self, _request: &FileCopyRequest, acq_name: &str, file_name: &str) -> Result<PullOutcome> {
        // Forced pulls still prefer the emptiest node, but ignore
        // free-space thresholds entirely.
        if self.exists(acq_name, file_name).await? {
            return Ok(PullOutcome::AlreadyPresent);
        }
        let mut best: Option<(usize, u64)> = None;
        for (i, (node, io)) in self.nodes.iter().enumerate() {
            if !node.active {
                continue;
            }
            if let Ok(Some(avail)) = io.bytes_avail(false).await {
                if best.map(|(_, b)| avail > b).unwrap_or(true) {
                    best = Some((i, avail));
                }
            }
        }
        match best.map(|(i, _)| i).or_else(|| self.nodes.iter().position(|(n, _)| n.active)) {
            Some(i) => Ok(PullOutcome::Dispatched { node_name: self.nodes[i].0.name.clone() }),
            None => Err(IoError::NoEligibleNode),
        }
    }

    async fn before_update(&self, _was_idle: bool) -> Result<()> {
        Ok(())
    }

    async fn idle_update(&self) -> Result<()> {
        Ok(())
    }

    async fn after_update(&self) -> Result<()> {
        Ok(())
    }

    fn fifo(&self) -> String {
        format!("group/{}", self.group.name)
    }
}

/// A group whose member nodes are Lustre-HSM-backed, grounded on the group
/// side of `alpenhorn/io/lustrehsm.py`: pull acceptance behaves like
/// [`DefaultGroup`], but `after_update` is where released files across the
/// group's nodes get a chance to be restored ahead of anticipated pulls —
/// left to the per-node `idle_update` since that's where DB access for
/// candidate selection lives (in `alpenhorn-daemon`).
pub struct LustreHsmGroup {
    pub inner: DefaultGroup,
}

#[async_trait]
impl GroupIo for LustreHsmGroup {
    async fn set_nodes(&mut self, nodes: Vec<(StorageNode, Arc<dyn NodeIo>)>) {
        self.inner.set_nodes(nodes).await
    }
    async fn exists(&self, acq_name: &str, file_name: &str) -> Result<bool> {
        self.inner.exists(acq_name, file_name).await
    }
    async fn pull(&self, request: &FileCopyRequest, acq_name: &str, file_name: &str, size_b: i64) -> Result<PullOutcome> {
        self.inner.pull(request, acq_name, file_name, size_b).await
    }
    async fn pull_force(&self, request: &FileCopyRequest, acq_name: &str, file_name: &str) -> Result<PullOutcome> {
        self.inner.pull_force(request, acq_name, file_name).await
    }
    async fn before_update(&self, was_idle: bool) -> Result<()> {
        self.inner.before_update(was_idle).await
    }
    async fn idle_update(&self) -> Result<()> {
        self.inner.idle_update().await
    }
    async fn after_update(&self) -> Result<()> {
        self.inner.after_update().await
    }
    fn fifo(&self) -> String {
        self.inner.fifo()
    }
}

/// Which [`GroupIo`] variant a group's `io_class` column selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupIoClass {
    Default,
    Transport,
    LustreHsm,
}

impl GroupIoClass {
    pub fn from_db(class: Option<&str>) -> Self {
        match class {
            Some("Transport") => GroupIoClass::Transport,
            Some("LustreHSM") => GroupIoClass::LustreHsm,
            _ => GroupIoClass::Default,
        }
    }
}

/// A handle to some other host's node, used by a pull's destination side
/// to address its source. Thin wrapper around [`RemoteNode`] plus the
/// DB row it came from, kept here (rather than in `alpenhorn-db`) since
/// addressing is an I/O concern.
pub struct PullSource {
    pub node: StorageNode,
    pub remote: Arc<dyn RemoteNode>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_class_defaults_on_unknown() {
        assert_eq!(GroupIoClass::from_db(Some("bogus")), GroupIoClass::Default);
        assert_eq!(GroupIoClass::from_db(Some("Transport")), GroupIoClass::Transport);
    }
}
