//! The actual I/O work behind a pass's check/delete/import/pull steps,
//! packaged as [`alpenhorn_scheduler::Task`] bodies so it runs on the
//! worker pool (§5) instead of inline on the update loop's own task.
//!
//! [`HostUpdateLoop`](crate::update::HostUpdateLoop) only decides *what*
//! needs doing each pass (which copies are suspect, which requests are
//! open); a [`Dispatcher`] snapshot of that pass's node/group I/O handles
//! is attached to each [`Job`] so a worker thread can actually perform it
//! against a connection of its own, independent of the pass that queued it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use tokio::sync::Mutex as AsyncMutex;

use alpenhorn_common::config::DaemonConfig;
use alpenhorn_db::models::{FileCopy, FileCopyRequest, FileImportRequest, HasFile, StorageGroup, StorageNode};
use alpenhorn_db::schema::{file, filecopy, filecopyrequest, fileimportrequest, storagenode};
use alpenhorn_db::{Error, Result};
use alpenhorn_io::group::{GroupIo, PullOutcome};
use alpenhorn_io::node::NodeIo;
use alpenhorn_scheduler::{Task, TaskBody, TaskStep};

use crate::auto_import::{self, ImportDetector};
use crate::pullutil;
use crate::transfer;

type DbPool = Pool<AsyncPgConnection>;

/// One unit of check/delete/import/pull work, cheap to clone so a task
/// can be handed a fresh copy of itself when requeued after a transient
/// DB error.
#[derive(Clone)]
pub enum Job {
    /// §4.E step 4a: re-verify one suspect copy.
    Check { node: String, copy_id: i32 },
    /// §4.E step 4b: delete a batch of copies already confirmed safe to
    /// remove (the update loop builds the batch; the worker just acts on it).
    Delete { node: String, copy_ids: Vec<i32> },
    /// §4.E step 4c: act on one pending import request.
    Import { node: String, request_id: i32 },
    /// §4.E step 5: try to service one open pull request into a group.
    Pull { group: String, request_id: i32 },
}

impl Job {
    /// The FIFO key this job's task is enqueued under.
    pub fn fifo(&self) -> String {
        match self {
            Job::Check { node, .. } | Job::Delete { node, .. } | Job::Import { node, .. } => format!("node/{node}"),
            Job::Pull { group, .. } => format!("group/{group}"),
        }
    }

    fn name(&self) -> String {
        match self {
            Job::Check { node, copy_id } => format!("check({node}, copy {copy_id})"),
            Job::Delete { node, copy_ids } => format!("delete({node}, {} copies)", copy_ids.len()),
            Job::Import { node, request_id } => format!("import({node}, request {request_id})"),
            Job::Pull { group, request_id } => format!("pull({group}, request {request_id})"),
        }
    }
}

/// A pass's read-only snapshot of node/group I/O handles, shared by every
/// [`Job`] spawned during that pass. Rebuilt each pass by
/// [`crate::update::HostUpdateLoop`]; independent of any later pass's
/// snapshot, so a slow task from an old pass can't clobber a newer one.
pub struct Dispatcher {
    pub pool: DbPool,
    pub config: DaemonConfig,
    pub nodes: HashMap<String, (StorageNode, Arc<dyn NodeIo>)>,
    pub groups: HashMap<String, (StorageGroup, Arc<AsyncMutex<Box<dyn GroupIo>>>)>,
    pub detectors: Vec<Arc<dyn ImportDetector>>,
    pub rt: tokio::runtime::Handle,
}

impl Dispatcher {
    async fn acq_file_names(&self, conn: &mut AsyncPgConnection, file_id: i32) -> Result<(String, String)> {
        let (acq_id, file_name): (i32, String) = file::table.find(file_id).select((file::acq_id, file::name)).first(conn).await?;
        let acq_name: String = alpenhorn_db::schema::acq::table.find(acq_id).select(alpenhorn_db::schema::acq::name).first(conn).await?;
        Ok((acq_name, file_name))
    }

    pub async fn run_job(&self, job: &Job) -> Result<()> {
        let mut conn = self.pool.get().await?;
        match job {
            Job::Check { node, copy_id } => self.run_check(&mut conn, node, *copy_id).await,
            Job::Delete { node, copy_ids } => self.run_delete(&mut conn, node, copy_ids).await,
            Job::Import { node, request_id } => self.run_import(&mut conn, node, *request_id).await,
            Job::Pull { group, request_id } => self.run_pull(&mut conn, group, *request_id).await,
        }
    }

    async fn run_check(&self, conn: &mut AsyncPgConnection, node: &str, copy_id: i32) -> Result<()> {
        let Some((_, io)) = self.nodes.get(node) else { return Ok(()) };
        let copy: Option<FileCopy> = filecopy::table.find(copy_id).first(conn).await.optional()?;
        let Some(copy) = copy else { return Ok(()) };

        let (acq_name, file_name) = self.acq_file_names(conn, copy.file_id).await?;
        let expected_md5: String = file::table.find(copy.file_id).select(file::md5sum).first(conn).await?;

        let result = io.check(&copy, &acq_name, &file_name, &expected_md5).await.map_err(|e| Error::Io(e.to_string()))?;
        let new_state = match result {
            alpenhorn_io::node::CheckResult::Good => "Y",
            alpenhorn_io::node::CheckResult::Corrupt => "X",
            alpenhorn_io::node::CheckResult::Missing => "N",
        };
        diesel::update(filecopy::table.find(copy.id))
            .set((filecopy::has_file.eq(new_state), filecopy::last_update.eq(Utc::now())))
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn run_delete(&self, conn: &mut AsyncPgConnection, node: &str, copy_ids: &[i32]) -> Result<()> {
        let Some((_, io)) = self.nodes.get(node) else { return Ok(()) };
        let batch: Vec<FileCopy> = filecopy::table.filter(filecopy::id.eq_any(copy_ids)).load(conn).await?;
        if batch.is_empty() {
            return Ok(());
        }

        let mut paths = Vec::with_capacity(batch.len());
        for copy in &batch {
            let (acq_name, file_name) = self.acq_file_names(conn, copy.file_id).await?;
            paths.push((copy.clone(), std::path::PathBuf::from(acq_name).join(file_name)));
        }
        io.delete(&paths).await.map_err(|e| Error::Io(e.to_string()))?;
        for copy in &batch {
            diesel::update(filecopy::table.find(copy.id))
                .set((filecopy::has_file.eq("N"), filecopy::last_update.eq(Utc::now())))
                .execute(conn)
                .await?;
        }
        Ok(())
    }

    async fn run_import(&self, conn: &mut AsyncPgConnection, node: &str, request_id: i32) -> Result<()> {
        use alpenhorn_common::util::invalid_import_path;

        let Some((row, io)) = self.nodes.get(node) else { return Ok(()) };
        let request: Option<FileImportRequest> = fileimportrequest::table.find(request_id).first(conn).await.optional()?;
        let Some(request) = request else { return Ok(()) };

        if request.path.starts_with('/') || request.path == alpenhorn_db::models::ALPENHORN_NODE {
            diesel::update(fileimportrequest::table.find(request.id))
                .set(fileimportrequest::completed.eq(true))
                .execute(conn)
                .await?;
            return Ok(());
        }
        if invalid_import_path(&request.path).is_some() {
            diesel::update(fileimportrequest::table.find(request.id))
                .set(fileimportrequest::completed.eq(true))
                .execute(conn)
                .await?;
            return Ok(());
        }

        let rel = std::path::PathBuf::from(&request.path);
        match auto_import::import_path(conn, io.as_ref(), row, &rel, &self.detectors).await? {
            auto_import::ImportResult::Deferred | auto_import::ImportResult::Locked => {}
            _ => {
                diesel::update(fileimportrequest::table.find(request.id))
                    .set(fileimportrequest::completed.eq(true))
                    .execute(conn)
                    .await?;
            }
        }
        Ok(())
    }

    async fn run_pull(&self, conn: &mut AsyncPgConnection, group: &str, request_id: i32) -> Result<()> {
        let Some((group_row, group_io)) = self.groups.get(group) else { return Ok(()) };
        let request: Option<FileCopyRequest> = filecopyrequest::table.find(request_id).first(conn).await.optional()?;
        let Some(request) = request else { return Ok(()) };
        if request.completed || request.cancelled {
            return Ok(());
        }

        let (acq_name, file_name) = self.acq_file_names(conn, request.file_id).await?;

        let member_states: Vec<HasFile> = filecopy::table
            .inner_join(storagenode::table.on(storagenode::id.eq(filecopy::node_id)))
            .filter(filecopy::file_id.eq(request.file_id).and(storagenode::group_id.eq(group_row.id)))
            .select(filecopy::has_file)
            .load::<String>(conn)
            .await?
            .into_iter()
            .map(|s| HasFile::from_db(&s))
            .collect();

        let force = match alpenhorn_db::invariants::group_has_priority(member_states.iter().copied()) {
            Some(HasFile::Yes) => {
                diesel::update(filecopyrequest::table.find(request.id)).set(filecopyrequest::cancelled.eq(true)).execute(conn).await?;
                return Ok(());
            }
            Some(HasFile::Maybe) => return Ok(()),
            Some(HasFile::Corrupt) => true,
            Some(HasFile::No) | None => false,
        };

        let source_node: Option<StorageNode> = storagenode::table.find(request.node_from_id).first(conn).await.optional()?;
        let Some(source_node) = source_node else {
            diesel::update(filecopyrequest::table.find(request.id)).set(filecopyrequest::cancelled.eq(true)).execute(conn).await?;
            return Ok(());
        };
        if !source_node.active {
            diesel::update(filecopyrequest::table.find(request.id)).set(filecopyrequest::cancelled.eq(true)).execute(conn).await?;
            return Ok(());
        }

        let source_copy: Option<FileCopy> = filecopy::table
            .filter(filecopy::file_id.eq(request.file_id).and(filecopy::node_id.eq(source_node.id)))
            .first(conn)
            .await
            .optional()?;
        let Some(source_copy) = source_copy else { return Ok(()) };
        match source_copy.has_file() {
            HasFile::No | HasFile::Corrupt => {
                diesel::update(filecopyrequest::table.find(request.id)).set(filecopyrequest::cancelled.eq(true)).execute(conn).await?;
                return Ok(());
            }
            HasFile::Maybe => return Ok(()),
            _ => {}
        }

        let Some((_, source_io)) = self.nodes.get(&source_node.name) else { return Ok(()) };
        let ready = source_io.remote().pull_ready(&acq_name, &file_name).await.unwrap_or(false);
        if !ready {
            return Ok(());
        }

        let size_b: i64 = file::table.find(request.file_id).select(file::size_b).first(conn).await?;
        let outcome = {
            let guard = group_io.lock().await;
            if force {
                guard.pull_force(&request, &acq_name, &file_name).await
            } else {
                guard.pull(&request, &acq_name, &file_name, size_b).await
            }
        };

        match outcome {
            Ok(PullOutcome::AlreadyPresent) => {
                diesel::update(filecopyrequest::table.find(request.id)).set(filecopyrequest::completed.eq(true)).execute(conn).await?;
            }
            Ok(PullOutcome::Dispatched { node_name }) => {
                self.run_transfer(conn, group, &node_name, &source_node, &request, &acq_name, &file_name, size_b).await?;
            }
            Ok(PullOutcome::Deferred) | Err(_) => {}
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_transfer(
        &self,
        conn: &mut AsyncPgConnection,
        group_name: &str,
        dest_node_name: &str,
        source_node: &StorageNode,
        request: &FileCopyRequest,
        acq_name: &str,
        file_name: &str,
        size_b: i64,
    ) -> Result<()> {
        let dest_node_id = self.nodes.get(dest_node_name).map(|(row, _)| row.id).unwrap_or(request.node_from_id);
        let Some((_, source_io)) = self.nodes.get(&source_node.name) else { return Ok(()) };
        let source_addr = source_io.remote().file_addr(acq_name, file_name);
        let dest_path = std::path::PathBuf::from(acq_name).join(file_name);

        diesel::update(filecopyrequest::table.find(request.id))
            .set(filecopyrequest::transfer_started.eq(Some(Utc::now())))
            .execute(conn)
            .await?;

        let outcome = transfer::rsync_pull(&source_addr, &dest_path, size_b, self.config.pull_timeout_base, self.config.pull_bytes_per_second)
            .await
            .map_err(|e| Error::Io(e.to_string()))?;

        pullutil::copy_request_done(conn, request, &source_node.name, group_name, dest_node_id, outcome).await?;
        Ok(())
    }
}

/// A [`Job`] wrapped as a one-shot, non-yielding task body: it runs the
/// whole job in a single `step`, blocking the worker thread on the
/// dispatcher's async work via its captured runtime handle.
pub struct JobBody {
    job: Job,
    dispatcher: Arc<Dispatcher>,
}

impl JobBody {
    pub fn new(job: Job, dispatcher: Arc<Dispatcher>) -> Self {
        Self { job, dispatcher }
    }
}

impl TaskBody for JobBody {
    fn step(&mut self, task: &Task) -> TaskStep {
        let result = self.dispatcher.rt.block_on(self.dispatcher.run_job(&self.job));
        if let Err(e) = result {
            tracing::warn!(job = %self.job.name(), error = %e, "dispatch job failed");
            task.report_error(alpenhorn_db::error::is_transient(&e));
        }
        TaskStep::Done
    }

    fn restart(&self) -> Box<dyn TaskBody> {
        Box::new(JobBody { job: self.job.clone(), dispatcher: self.dispatcher.clone() })
    }
}

/// Enqueue `job` onto `queue` under its FIFO key, exclusive so only one
/// job per node/group is ever in flight at once (the fairness/exclusion
/// properties this scheduler is built to guarantee).
pub fn spawn_job(queue: Arc<alpenhorn_scheduler::FairMultiFifoQueue<String, Arc<Task>>>, dispatcher: Arc<Dispatcher>, job: Job) -> Arc<Task> {
    let fifo = job.fifo();
    let name = job.name();
    let body = Box::new(JobBody::new(job, dispatcher));
    Task::spawn(queue, fifo, body, name, true, true)
}
