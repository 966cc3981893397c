//! The per-host update loop.
//!
//! Grounded on `alpenhorn/daemon/update.py`'s `UpdateableNode` /
//! `UpdateableGroup` and the top-level `update_loop` function; §4.E.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use tokio::sync::mpsc;

use alpenhorn_common::config::DaemonConfig;
use alpenhorn_common::metrics::Metric;
use alpenhorn_db::models::{FileCopy, FileCopyRequest, FileImportRequest, StorageGroup, StorageNode};
use alpenhorn_db::query_walker::{filecopy_walk::NodeFileCopyWalk, QueryWalker};
use alpenhorn_db::schema::{file, filecopy, filecopyrequest, fileimportrequest, storagegroup, storagenode};
use alpenhorn_db::{Error, Result};
use alpenhorn_io::group::GroupIo;
use alpenhorn_io::node::NodeIo;
use alpenhorn_scheduler::{FairMultiFifoQueue, Task};

use crate::auto_import::{self, ImportDetector};
use crate::dispatch::{self, Dispatcher, Job};
use crate::watcher::NodeWatcher;

type DbPool = Pool<AsyncPgConnection>;

/// A name-indexed reconciled wrapper for a node: the `StorageNode` row as
/// of the last refresh, plus its live I/O object and idleness bookkeeping.
pub struct NodeEntry {
    pub row: StorageNode,
    pub io: Arc<dyn NodeIo>,
    pub was_idle: bool,
    pub first_idle: bool,
    /// Live filesystem watch for this node, if `auto_import` is set and a
    /// watch could be established. Dropped (and so torn down) whenever the
    /// node's I/O wrapper is rebuilt or the node disappears from the host.
    watcher: Option<NodeWatcher>,
    /// Rolling auto-verify cursor, carried across update passes so
    /// successive passes continue the same sweep instead of re-sampling a
    /// new random starting point every time. Recreated only once it's
    /// exhausted (`Error::NoResults`) or the node's I/O wrapper is rebuilt.
    auto_verify_walker: Option<QueryWalker<NodeFileCopyWalk>>,
}

pub struct GroupEntry {
    pub row: StorageGroup,
    /// Shared with the per-pass [`Dispatcher`] snapshot so a worker running
    /// a `Job::Pull` can lock it independently of this loop's own refresh
    /// cycle; only `set_nodes` needs the lock held mutably.
    pub io: Arc<tokio::sync::Mutex<Box<dyn GroupIo>>>,
    pub was_idle: bool,
}

/// Build (or rebuild) a node's I/O wrapper from its current row. Exposed so
/// `alpenhornd` can plug in the concrete backend-selection logic (which
/// needs the daemon's LFS/config context that this crate doesn't own).
pub trait NodeIoFactory: Send + Sync {
    fn build(&self, row: &StorageNode) -> Arc<dyn NodeIo>;
}

pub trait GroupIoFactory: Send + Sync {
    fn build(&self, row: &StorageGroup, nodes: Vec<(StorageNode, Arc<dyn NodeIo>)>) -> Box<dyn GroupIo>;
}

pub struct HostUpdateLoop {
    pub pool: DbPool,
    pub host: String,
    pub config: DaemonConfig,
    pub node_factory: Box<dyn NodeIoFactory>,
    pub group_factory: Box<dyn GroupIoFactory>,
    pub detectors: Vec<Arc<dyn ImportDetector>>,
    pub nodes: HashMap<String, NodeEntry>,
    pub groups: HashMap<String, GroupEntry>,
    /// Shared with the worker pool `alpenhornd` builds around this loop;
    /// `run_once` only ever puts work on it, never takes it back off.
    pub queue: Arc<FairMultiFifoQueue<String, Arc<Task>>>,
    watch_tx: mpsc::UnboundedSender<(String, PathBuf)>,
    watch_rx: mpsc::UnboundedReceiver<(String, PathBuf)>,
    metric_node_update: Metric,
    metric_group_update: Metric,
    metric_node_available: Metric,
    metric_main_loops: Metric,
    metric_main_loop_time: Metric,
}

impl HostUpdateLoop {
    pub fn new(
        pool: DbPool,
        host: String,
        config: DaemonConfig,
        node_factory: Box<dyn NodeIoFactory>,
        group_factory: Box<dyn GroupIoFactory>,
        detectors: Vec<Arc<dyn ImportDetector>>,
    ) -> Self {
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        Self {
            pool,
            host,
            config,
            node_factory,
            group_factory,
            detectors,
            nodes: HashMap::new(),
            groups: HashMap::new(),
            queue: Arc::new(FairMultiFifoQueue::new()),
            watch_tx,
            watch_rx,
            metric_node_update: Metric::new("node_update", "Node update pass ran", true, &["name"], &[]).expect("metric"),
            metric_group_update: Metric::new("group_update", "Group update pass ran", true, &["name"], &[]).expect("metric"),
            metric_node_available: Metric::new("node_available", "Node available bytes", false, &["name"], &[]).expect("metric"),
            metric_main_loops: Metric::new("main_loops", "Number of completed main loop iterations", true, &[], &[]).expect("metric"),
            metric_main_loop_time: Metric::new("main_loop_time_seconds", "Wall time of the last main loop iteration", false, &[], &[]).expect("metric"),
        }
    }

    /// Run one full update pass (§4.E steps 1-7, minus housekeeping, which
    /// is the caller's (`alpenhornd`'s) responsibility since it involves
    /// the worker pool).
    pub async fn run_once(&mut self) -> Result<()> {
        let started = Instant::now();
        let mut conn = self.pool.get().await?;

        self.refresh_nodes(&mut conn).await?;
        self.refresh_groups(&mut conn).await?;
        self.drain_watch_imports(&mut conn).await?;
        self.update_free_space(&mut conn).await?;

        let dispatcher = self.build_dispatcher();

        let node_names: Vec<String> = self.nodes.keys().cloned().collect();
        for name in node_names {
            self.update_node(&mut conn, &name, &dispatcher).await?;
        }

        let group_names: Vec<String> = self.groups.keys().cloned().collect();
        for name in group_names {
            self.update_group(&mut conn, &name, &dispatcher).await?;
        }

        self.metric_main_loops.inc(&[]).ok();
        self.metric_main_loop_time.set(started.elapsed().as_secs_f64(), &[]).ok();
        Ok(())
    }

    /// Snapshot this pass's node/group I/O handles for the worker pool.
    /// Independent of any earlier pass's snapshot, so a slow `Job` left
    /// over from a previous pass can't be handed a stale connection pool
    /// or a node/group that's since been dropped from `self.nodes`.
    fn build_dispatcher(&self) -> Arc<Dispatcher> {
        let nodes = self.nodes.iter().map(|(name, e)| (name.clone(), (e.row.clone(), e.io.clone()))).collect();
        let groups = self.groups.iter().map(|(name, e)| (name.clone(), (e.row.clone(), e.io.clone()))).collect();
        Arc::new(Dispatcher {
            pool: self.pool.clone(),
            config: self.config.clone(),
            nodes,
            groups,
            detectors: self.detectors.clone(),
            rt: tokio::runtime::Handle::current(),
        })
    }

    /// §4.E step 1.
    async fn refresh_nodes(&mut self, conn: &mut AsyncPgConnection) -> Result<()> {
        let rows: Vec<StorageNode> = storagenode::table
            .filter(storagenode::active.eq(true).and(storagenode::host.eq(&self.host)))
            .load(conn)
            .await?;

        let seen: HashSet<String> = rows.iter().map(|r| r.name.clone()).collect();
        self.nodes.retain(|name, _| seen.contains(name));

        for row in rows {
            let needs_new_io = match self.nodes.get(&row.name) {
                None => true,
                Some(existing) => {
                    existing.row.id != row.id || existing.row.io_class != row.io_class || existing.row.io_config != row.io_config
                }
            };

            if needs_new_io {
                let io = self.node_factory.build(&row);
                let watcher = self.start_watcher_for(&row);
                self.nodes.insert(
                    row.name.clone(),
                    NodeEntry { row, io, was_idle: true, first_idle: true, watcher, auto_verify_walker: None },
                );
            } else if let Some(entry) = self.nodes.get_mut(&row.name) {
                entry.row = row;
            }
        }

        for (name, entry) in self.nodes.iter_mut() {
            let initialised = entry.io.check_init().await.map_err(|e| Error::Io(e.to_string()))?;
            if initialised {
                continue;
            }

            let pending: Option<FileImportRequest> = fileimportrequest::table
                .filter(
                    fileimportrequest::node_id
                        .eq(entry.row.id)
                        .and(fileimportrequest::path.eq(alpenhorn_db::models::ALPENHORN_NODE))
                        .and(fileimportrequest::completed.eq(false)),
                )
                .first(conn)
                .await
                .optional()?;

            if let Some(req) = pending {
                entry.io.init().await.map_err(|e| Error::Io(e.to_string()))?;
                diesel::update(fileimportrequest::table.find(req.id))
                    .set(fileimportrequest::completed.eq(true))
                    .execute(conn)
                    .await?;
            } else {
                tracing::debug!(node = %name, "skipping uninitialised node with no pending init request");
            }
        }

        Ok(())
    }

    /// Start a filesystem watch on `row`'s root if it has `auto_import`
    /// set, reporting observed paths back through `self.watch_tx`. A
    /// failure to establish the watch (e.g. the root doesn't exist yet)
    /// is logged and treated as "no watch", not a hard error: the node
    /// will still be covered by request-driven imports.
    fn start_watcher_for(&self, row: &StorageNode) -> Option<NodeWatcher> {
        if !row.auto_import {
            return None;
        }
        match NodeWatcher::start(row.name.clone(), PathBuf::from(&row.root), self.watch_tx.clone()) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                tracing::warn!(node = %row.name, error = %err, "failed to start filesystem watch");
                None
            }
        }
    }

    /// Drain paths reported by nodes' filesystem watchers since the last
    /// pass, attempting an import for each (§4.F's watcher entry point:
    /// no `FileImportRequest` row backs these).
    async fn drain_watch_imports(&mut self, conn: &mut AsyncPgConnection) -> Result<()> {
        let mut seen = Vec::new();
        while let Ok(item) = self.watch_rx.try_recv() {
            seen.push(item);
        }

        for (name, rel_path) in seen {
            let Some(entry) = self.nodes.get(&name) else { continue };
            match auto_import::import_path(conn, entry.io.as_ref(), &entry.row, &rel_path, &self.detectors).await {
                Ok(_) => {}
                Err(err) => tracing::warn!(node = %name, path = %rel_path.display(), error = %err, "watcher-triggered import failed"),
            }
        }
        Ok(())
    }

    /// §4.E step 2.
    async fn refresh_groups(&mut self, conn: &mut AsyncPgConnection) -> Result<()> {
        let group_ids: HashSet<i32> = self.nodes.values().map(|n| n.row.group_id).collect();
        let rows: Vec<StorageGroup> = storagegroup::table.filter(storagegroup::id.eq_any(group_ids)).load(conn).await?;

        let seen: HashSet<String> = rows.iter().map(|r| r.name.clone()).collect();
        self.groups.retain(|name, _| seen.contains(name));

        for row in rows {
            let member_nodes: Vec<(StorageNode, Arc<dyn NodeIo>)> = self
                .nodes
                .values()
                .filter(|n| n.row.group_id == row.id)
                .map(|n| (n.row.clone(), n.io.clone()))
                .collect();

            let was_idle = member_nodes.iter().all(|(n, _)| self.nodes.get(&n.name).map(|e| e.was_idle).unwrap_or(true));

            let needs_new_io = match self.groups.get(&row.name) {
                None => true,
                Some(existing) => existing.row.io_class != row.io_class || existing.row.io_config != row.io_config,
            };

            if needs_new_io {
                let io = self.group_factory.build(&row, member_nodes);
                self.groups.insert(row.name.clone(), GroupEntry { row, io: Arc::new(tokio::sync::Mutex::new(io)), was_idle });
            } else if let Some(entry) = self.groups.get_mut(&row.name) {
                entry.io.lock().await.set_nodes(member_nodes).await;
                entry.row = row;
                entry.was_idle = was_idle;
            }
        }
        Ok(())
    }

    /// §4.E step 3.
    async fn update_free_space(&mut self, conn: &mut AsyncPgConnection) -> Result<()> {
        for entry in self.nodes.values() {
            if let Ok(Some(avail)) = entry.io.bytes_avail(false).await {
                let avail_gb = avail as f64 / 2f64.powi(30);
                diesel::update(storagenode::table.find(entry.row.id))
                    .set((storagenode::avail_gb.eq(Some(avail_gb)), storagenode::avail_gb_last_checked.eq(Some(Utc::now()))))
                    .execute(conn)
                    .await?;
                self.metric_node_available.set(avail as f64, &[("name", entry.row.name.as_str())]).ok();
            }
        }
        Ok(())
    }

    /// §4.E step 4 (node update) plus the idle post-pass of step 6 for
    /// nodes. The integrity-check, deletion and import work (4a-4c) is
    /// handed to the worker pool as [`Job`]s rather than awaited here;
    /// this loop only decides what needs doing each pass.
    async fn update_node(&mut self, conn: &mut AsyncPgConnection, name: &str, dispatcher: &Arc<Dispatcher>) -> Result<()> {
        let was_idle = self.nodes.get(name).map(|e| e.was_idle).unwrap_or(false);
        if !was_idle {
            return Ok(());
        }

        let proceed = {
            let entry = self.nodes.get(name).expect("just checked");
            entry.io.before_update(true).await.map_err(|e| Error::Io(e.to_string()))?
        };
        if !proceed {
            return Ok(());
        }

        self.metric_node_update.inc(&[("name", name)]).ok();

        let node_id = self.nodes[name].row.id;

        // 4a. Integrity checks: FileCopy has_file=M, wants_file != N.
        let suspect: Vec<FileCopy> = filecopy::table
            .filter(filecopy::node_id.eq(node_id).and(filecopy::has_file.eq("M")).and(filecopy::wants_file.ne("N")))
            .load(conn)
            .await?;
        for copy in &suspect {
            dispatch::spawn_job(self.queue.clone(), dispatcher.clone(), Job::Check { node: name.to_string(), copy_id: copy.id });
        }

        // 4b. Deletion.
        self.run_deletions(conn, name, dispatcher).await?;

        // 4c. Imports.
        let requests: Vec<FileImportRequest> = fileimportrequest::table
            .filter(fileimportrequest::node_id.eq(node_id).and(fileimportrequest::completed.eq(false)))
            .load(conn)
            .await?;
        for request in &requests {
            dispatch::spawn_job(self.queue.clone(), dispatcher.clone(), Job::Import { node: name.to_string(), request_id: request.id });
        }

        // 4d. Pull readiness out of this node.
        let outbound: Vec<FileCopyRequest> = filecopyrequest::table
            .filter(
                filecopyrequest::node_from_id
                    .eq(node_id)
                    .and(filecopyrequest::completed.eq(false))
                    .and(filecopyrequest::cancelled.eq(false)),
            )
            .load(conn)
            .await?;
        for request in &outbound {
            let entry = &self.nodes[name];
            let (acq_name, file_name) = self.acq_file_names(conn, request.file_id).await?;
            entry
                .io
                .ready_pull(request, &acq_name, &file_name)
                .await
                .map_err(|e| Error::Io(e.to_string()))?;
        }

        // Idle post-pass + auto-verify (§4.E step 6, node half).
        let first_idle = self.nodes[name].first_idle;
        self.nodes
            .get(name)
            .expect("present")
            .io
            .idle_update(first_idle)
            .await
            .map_err(|e| Error::Io(e.to_string()))?;
        self.auto_release(conn, name).await?;
        self.auto_verify(conn, name).await?;
        self.nodes.get(name).expect("present").io.after_update().await.map_err(|e| Error::Io(e.to_string()))?;

        if let Some(entry) = self.nodes.get_mut(name) {
            entry.first_idle = false;
        }
        Ok(())
    }

    async fn acq_file_names(&self, conn: &mut AsyncPgConnection, file_id: i32) -> Result<(String, String)> {
        let (acq_id, file_name): (i32, String) = file::table.find(file_id).select((file::acq_id, file::name)).first(conn).await?;
        let acq_name: String = alpenhorn_db::schema::acq::table.find(acq_id).select(alpenhorn_db::schema::acq::name).first(conn).await?;
        Ok((acq_name, file_name))
    }

    /// §4.E step 4.b. Deletion batches of 10, skipping any copy that's the
    /// source of an open FileCopyRequest. Each batch becomes one `Job::Delete`
    /// so a single worker handles it as one I/O operation, as the original
    /// batches deletes per node.
    async fn run_deletions(&self, conn: &mut AsyncPgConnection, name: &str, dispatcher: &Arc<Dispatcher>) -> Result<()> {
        let (node_id, under_min, is_archive) = {
            let row = &self.nodes[name].row;
            (row.id, row.under_min(), row.is_archive())
        };

        if !under_min || is_archive {
            // Even when not under_min, plain wants_file=N copies are still
            // candidates for cleanup regardless of free-space pressure.
            self.delete_wants_no(conn, name, dispatcher).await?;
            return Ok(());
        }

        let candidates: Vec<FileCopy> = filecopy::table
            .filter(filecopy::node_id.eq(node_id).and(filecopy::wants_file.ne("Y")))
            .order(filecopy::id.asc())
            .load(conn)
            .await?;

        let mut batch = Vec::new();
        for copy in candidates {
            if !alpenhorn_db::invariants::copy_is_delete_safe(conn, copy.file_id, node_id).await? {
                continue;
            }
            batch.push(copy.id);
            if batch.len() == 10 {
                dispatch::spawn_job(self.queue.clone(), dispatcher.clone(), Job::Delete { node: name.to_string(), copy_ids: std::mem::take(&mut batch) });
            }
        }
        if !batch.is_empty() {
            dispatch::spawn_job(self.queue.clone(), dispatcher.clone(), Job::Delete { node: name.to_string(), copy_ids: batch });
        }
        Ok(())
    }

    async fn delete_wants_no(&self, conn: &mut AsyncPgConnection, name: &str, dispatcher: &Arc<Dispatcher>) -> Result<()> {
        let node_id = self.nodes[name].row.id;
        let candidates: Vec<FileCopy> = filecopy::table
            .filter(filecopy::node_id.eq(node_id).and(filecopy::wants_file.eq("N")))
            .order(filecopy::id.asc())
            .load(conn)
            .await?;

        let mut batch = Vec::new();
        for copy in candidates {
            if !alpenhorn_db::invariants::copy_is_delete_safe(conn, copy.file_id, node_id).await? {
                continue;
            }
            batch.push(copy.id);
            if batch.len() == 10 {
                dispatch::spawn_job(self.queue.clone(), dispatcher.clone(), Job::Delete { node: name.to_string(), copy_ids: std::mem::take(&mut batch) });
            }
        }
        if !batch.is_empty() {
            dispatch::spawn_job(self.queue.clone(), dispatcher.clone(), Job::Delete { node: name.to_string(), copy_ids: batch });
        }
        Ok(())
    }

    /// Idle-pass space reclaim (§4.H): release least-recently-used restored
    /// copies until the node's free space clears its configured headroom.
    /// A no-op for any backend that doesn't override `release_headroom_bytes`.
    async fn auto_release(&self, conn: &mut AsyncPgConnection, name: &str) -> Result<()> {
        let entry = &self.nodes[name];
        let headroom = entry.io.release_headroom_bytes();
        if headroom == 0 {
            return Ok(());
        }

        let avail = entry.io.bytes_avail(true).await.map_err(|e| Error::Io(e.to_string()))?.unwrap_or(u64::MAX);
        if avail >= headroom {
            return Ok(());
        }
        let mut need = headroom - avail;

        let node_id = entry.row.id;
        let candidates: Vec<FileCopy> = filecopy::table
            .filter(filecopy::node_id.eq(node_id).and(filecopy::has_file.eq("Y")))
            .order(filecopy::last_update.asc())
            .load(conn)
            .await?;

        let mut batch = Vec::new();
        for copy in candidates {
            if need == 0 {
                break;
            }
            let (acq_name, file_name) = self.acq_file_names(conn, copy.file_id).await?;
            let size = copy.size_b.unwrap_or(0).max(0) as u64;
            need = need.saturating_sub(size);
            batch.push((copy, PathBuf::from(acq_name).join(file_name)));
        }
        if !batch.is_empty() {
            self.nodes[name].io.release(&batch).await.map_err(|e| Error::Io(e.to_string()))?;
        }
        Ok(())
    }

    /// Auto-verify (§4.E, "Auto-verify" paragraph). The walker is kept on
    /// the node's entry across passes so each pass continues the same
    /// rolling sweep instead of re-sampling a new random start; it's only
    /// torn down and rebuilt once its underlying query comes up empty.
    async fn auto_verify(&mut self, conn: &mut AsyncPgConnection, name: &str) -> Result<()> {
        let (node_id, k) = {
            let row = &self.nodes[name].row;
            (row.id, row.auto_verify)
        };
        if k <= 0 {
            return Ok(());
        }

        if self.nodes.get(name).map(|e| e.auto_verify_walker.is_none()).unwrap_or(true) {
            match QueryWalker::new(conn, NodeFileCopyWalk { node_id }).await {
                Ok(walker) => {
                    if let Some(entry) = self.nodes.get_mut(name) {
                        entry.auto_verify_walker = Some(walker);
                    }
                }
                Err(Error::NoResults) => return Ok(()),
                Err(e) => return Err(e),
            }
        }

        let rows = {
            let Some(entry) = self.nodes.get_mut(name) else { return Ok(()) };
            let Some(walker) = entry.auto_verify_walker.as_mut() else { return Ok(()) };
            match walker.get(conn, k as i64).await {
                Ok(rows) => rows,
                Err(Error::NoResults) => {
                    entry.auto_verify_walker = None;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        };

        let min_days = chrono::Duration::days(self.config.auto_verify_min_days as i64);

        for copy in rows {
            if Utc::now() - copy.last_update >= min_days {
                diesel::update(filecopy::table.find(copy.id))
                    .set((filecopy::has_file.eq("M"), filecopy::last_update.eq(Utc::now())))
                    .execute(conn)
                    .await?;
            }
        }
        Ok(())
    }

    /// §4.E step 5 (group update) plus idle post-pass (step 6, group
    /// half). As with node updates, each open pull request becomes one
    /// `Job::Pull` handed to the worker pool instead of being serviced
    /// inline; this loop only picks the one request per file that's worth
    /// acting on this pass.
    async fn update_group(&mut self, conn: &mut AsyncPgConnection, name: &str, dispatcher: &Arc<Dispatcher>) -> Result<()> {
        let was_idle = self.groups.get(name).map(|g| g.was_idle).unwrap_or(false);
        if !was_idle {
            return Ok(());
        }

        self.metric_group_update.inc(&[("name", name)]).ok();

        let group_id = self.groups[name].row.id;
        let requests: Vec<FileCopyRequest> = filecopyrequest::table
            .filter(filecopyrequest::group_to_id.eq(group_id).and(filecopyrequest::completed.eq(false)).and(filecopyrequest::cancelled.eq(false)))
            .order(filecopyrequest::id.asc())
            .load(conn)
            .await?;

        let mut seen_files: HashSet<i32> = HashSet::new();

        for request in requests {
            if !seen_files.insert(request.file_id) {
                continue; // another request for the same file is already in flight this pass
            }
            dispatch::spawn_job(self.queue.clone(), dispatcher.clone(), Job::Pull { group: name.to_string(), request_id: request.id });
        }

        let io = self.groups[name].io.clone();
        let guard = io.lock().await;
        guard.idle_update().await.map_err(|e| Error::Io(e.to_string()))?;
        guard.after_update().await.map_err(|e| Error::Io(e.to_string()))?;
        Ok(())
    }
}

/// The update-skew guard (§5): tracks, per node, how many consecutive
/// loops observed `avail_gb_last_checked` advance without this daemon
/// having written it.
pub struct UpdateSkewGuard {
    threshold: u32,
    strikes: HashMap<i32, u32>,
    last_seen: HashMap<i32, chrono::DateTime<Utc>>,
}

impl UpdateSkewGuard {
    pub fn new(threshold: u32) -> Self {
        Self { threshold, strikes: HashMap::new(), last_seen: HashMap::new() }
    }

    /// Record this pass's observed timestamp for `node_id`, comparing
    /// against what this daemon itself wrote. Returns `true` if the guard
    /// has tripped (the caller should exit).
    pub fn observe(&mut self, node_id: i32, observed: chrono::DateTime<Utc>, written_by_us: bool) -> bool {
        if self.threshold == 0 {
            return false;
        }
        if written_by_us {
            self.strikes.insert(node_id, 0);
            self.last_seen.insert(node_id, observed);
            return false;
        }
        let prior = self.last_seen.insert(node_id, observed);
        if prior.map(|p| p != observed).unwrap_or(false) {
            let strikes = self.strikes.entry(node_id).or_insert(0);
            *strikes += 1;
            *strikes >= self.threshold
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skew_guard_trips_after_threshold_strikes() {
        let mut guard = UpdateSkewGuard::new(2);
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);
        let t2 = t1 + chrono::Duration::seconds(1);

        assert!(!guard.observe(1, t0, false));
        assert!(!guard.observe(1, t1, false));
        assert!(guard.observe(1, t2, false));
    }

    #[test]
    fn skew_guard_disabled_at_zero() {
        let mut guard = UpdateSkewGuard::new(0);
        let t0 = Utc::now();
        assert!(!guard.observe(1, t0, false));
        assert!(!guard.observe(1, t0 + chrono::Duration::seconds(1), false));
    }
}
