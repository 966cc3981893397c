//! The worker thread pool.
//!
//! Grounded on `alpenhorn/scheduler/pool.py`. Each worker is an OS thread
//! looping on `queue.get()`. A transient database error unwinds the
//! current task, runs its cleanup stack, requeues it if requested, and
//! exits the thread cleanly so [`WorkerPool::check`] can respawn it with a
//! fresh connection. Any other error is treated as unrecoverable and trips
//! the process-wide [`global_abort`] flag, after which every worker exits
//! at its next opportunity.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use alpenhorn_common::metrics::Metric;

use crate::queue::FairMultiFifoQueue;
use crate::task::Task;

/// Set by any worker that hits an uncaught, non-transient error. Once set,
/// all workers exit as soon as possible; no guarantee is made about queue
/// or pool consistency during a global abort.
pub static GLOBAL_ABORT: AtomicBool = AtomicBool::new(false);

pub fn global_abort() -> bool {
    GLOBAL_ABORT.load(Ordering::SeqCst)
}

pub fn trigger_global_abort() {
    GLOBAL_ABORT.store(true, Ordering::SeqCst);
}

/// The outcome of running a single task inside a worker, used to decide
/// whether the worker thread should keep looping or exit.
pub enum TaskOutcome {
    /// Ran normally (whether finished or re-yielded).
    Ok,
    /// A transient (e.g. database-connectivity) error occurred; the task
    /// has been cleaned up and possibly requeued, and the worker thread
    /// handling it should now exit to be respawned with a fresh connection.
    TransientError,
    /// A non-recoverable error occurred; `GLOBAL_ABORT` has been set.
    FatalError,
}

/// Runs `task` to one step, catching the distinction between transient
/// (DB-connectivity) and fatal errors via `is_transient`. `run_step` is the
/// caller-supplied function that actually invokes `task.run()`, wrapping
/// whatever fallible I/O the concrete task body performs; it returns `Err`
/// for any error raised while stepping the task.
pub fn execute<E>(
    task: &Arc<Task>,
    run_step: impl FnOnce(&Arc<Task>) -> Result<bool, E>,
    is_transient: impl FnOnce(&E) -> bool,
) -> TaskOutcome {
    match run_step(task) {
        Ok(_finished) => TaskOutcome::Ok,
        Err(err) => {
            if is_transient(&err) {
                task.do_cleanup();
                task.requeue_after_db_error();
                tracing::error!(task = %task.name(), "exiting worker due to transient db error");
                TaskOutcome::TransientError
            } else {
                trigger_global_abort();
                tracing::error!(task = %task.name(), "aborting due to uncaught error in task");
                TaskOutcome::FatalError
            }
        }
    }
}

struct WorkerHandle {
    stop: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

/// A pool of worker threads pulling tasks from a shared queue.
///
/// Generic over `step`, the per-task runner function (supplied once, at
/// pool-construction time) so that workers can thread a database
/// connection pool and other daemon-wide state through to each task
/// without this crate needing to know about them.
pub struct WorkerPool {
    queue: Arc<FairMultiFifoQueue<String, Arc<Task>>>,
    /// Workers currently counted as part of the pool (drives `len()` and
    /// what `check()` monitors for unexpected death).
    workers: Mutex<Vec<WorkerHandle>>,
    /// Workers removed from `workers` by `del_worker` that may still be
    /// finishing their current task. Only `shutdown` joins these.
    retired: Mutex<Vec<WorkerHandle>>,
    next_index: AtomicUsize,
    metric_worker_count: Metric,
    step: Arc<dyn Fn(&Arc<Task>) -> TaskOutcome + Send + Sync>,
}

impl WorkerPool {
    pub fn new(
        num_workers: usize,
        queue: Arc<FairMultiFifoQueue<String, Arc<Task>>>,
        step: impl Fn(&Arc<Task>) -> TaskOutcome + Send + Sync + 'static,
    ) -> Arc<Self> {
        let metric_worker_count = Metric::new(
            "worker_count",
            "Number of worker threads",
            false,
            &[],
            &[("pool_type", "WorkerPool")],
        )
        .expect("static metric registration");

        let pool = Arc::new(Self {
            queue,
            workers: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
            next_index: AtomicUsize::new(0),
            metric_worker_count,
            step: Arc::new(step),
        });

        for _ in 0..num_workers {
            pool.spawn_worker(None);
        }
        pool
    }

    fn spawn_worker(self: &Arc<Self>, replace_index: Option<usize>) {
        let index = replace_index.unwrap_or_else(|| self.next_index.fetch_add(1, Ordering::SeqCst));
        let worker_id = index + 1;
        let stop = Arc::new(AtomicBool::new(false));
        let queue = self.queue.clone();
        let step = self.step.clone();
        let stop_for_thread = stop.clone();

        let join = std::thread::Builder::new()
            .name(format!("Worker#{worker_id}"))
            .spawn(move || worker_main(worker_id, queue, step, stop_for_thread))
            .expect("failed to spawn worker thread");

        let handle = WorkerHandle { stop, join: Some(join) };
        let mut workers = self.workers.lock();
        match replace_index {
            Some(i) => workers[i] = handle,
            None => workers.push(handle),
        }
        self.metric_worker_count.inc(&[]).ok();
    }

    /// Increment the number of workers. Returns `false` (without blocking)
    /// if `blocking` is false and the pool is mid-resize.
    pub fn add_worker(self: &Arc<Self>, blocking: bool) -> bool {
        if blocking {
            self.spawn_worker(None);
            true
        } else {
            match self.workers.try_lock() {
                Some(_) => {
                    self.spawn_worker(None);
                    true
                }
                None => {
                    tracing::warn!("WorkerPool ignoring increment request: pool not clean");
                    false
                }
            }
        }
    }

    /// Decrement the number of workers: always stops the highest-indexed
    /// worker (even if others are idle), which finishes its current task
    /// before exiting.
    pub fn del_worker(self: &Arc<Self>, blocking: bool) -> bool {
        let mut workers = if blocking {
            self.workers.lock()
        } else {
            match self.workers.try_lock() {
                Some(w) => w,
                None => {
                    tracing::warn!("WorkerPool ignoring decrement request: pool not clean");
                    return false;
                }
            }
        };
        match workers.pop() {
            Some(handle) => {
                handle.stop.store(true, Ordering::SeqCst);
                self.retired.lock().push(handle);
                self.metric_worker_count.dec(&[]).ok();
                true
            }
            None => {
                tracing::warn!("WorkerPool ignoring decrement request: no workers");
                false
            }
        }
    }

    /// Find workers whose thread has died and respawn them. A no-op
    /// during a global abort.
    pub fn check(self: &Arc<Self>) {
        if global_abort() {
            return;
        }
        let dead: Vec<usize> = {
            let workers = self.workers.lock();
            workers
                .iter()
                .enumerate()
                .filter(|(_, w)| w.join.as_ref().map(|j| j.is_finished()).unwrap_or(false))
                .map(|(i, _)| i)
                .collect()
        };
        for index in dead {
            tracing::warn!(worker = index + 1, "respawning dead worker");
            self.spawn_worker(Some(index));
        }
    }

    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop all workers (including retired ones still finishing their
    /// last task) and wait for them all to terminate.
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock();
        let mut retired = self.retired.lock();

        for w in workers.iter().chain(retired.iter()) {
            w.stop.store(true, Ordering::SeqCst);
        }
        for w in workers.iter_mut().chain(retired.iter_mut()) {
            if let Some(join) = w.join.take() {
                let _ = join.join();
            }
        }
        workers.clear();
        retired.clear();
        self.metric_worker_count.set(0.0, &[]).ok();
    }
}

fn worker_main(
    worker_id: usize,
    queue: Arc<FairMultiFifoQueue<String, Arc<Task>>>,
    step: Arc<dyn Fn(&Arc<Task>) -> TaskOutcome + Send + Sync>,
    stop: Arc<AtomicBool>,
) {
    tracing::info!(worker_id, "started");
    let metric_running = Metric::new("worker_running", "worker is running", false, &[], &[("id", &worker_id.to_string())])
        .expect("static metric registration");
    let metric_idle = Metric::new("worker_idle", "worker is idle (waiting for a task)", false, &[], &[("id", &worker_id.to_string())])
        .expect("static metric registration");
    metric_running.set(1.0, &[]).ok();

    loop {
        metric_idle.set(1.0, &[]).ok();
        if global_abort() || stop.load(Ordering::SeqCst) {
            tracing::info!(worker_id, "stopped");
            metric_running.set(0.0, &[]).ok();
            return;
        }

        let Some((task, key)) = queue.get(Some(Duration::from_secs(5))) else {
            continue;
        };
        metric_idle.set(0.0, &[]).ok();

        if global_abort() {
            queue.task_done(&key);
            tracing::info!(worker_id, "stopped due to global abort");
            metric_running.set(0.0, &[]).ok();
            return;
        }

        tracing::info!(worker_id, task = %task, "beginning task");
        match step(&task) {
            TaskOutcome::Ok => {
                queue.task_done(&key);
            }
            TaskOutcome::TransientError => {
                queue.task_done(&key);
                metric_running.set(0.0, &[]).ok();
                return;
            }
            TaskOutcome::FatalError => {
                metric_running.set(0.0, &[]).ok();
                return;
            }
        }
    }
}

/// Stand-in for [`WorkerPool`] used when the daemon is configured to run
/// with serial (non-threaded) I/O. All operations are no-ops except
/// `add_worker`, which logs and declines.
pub struct EmptyPool;

impl EmptyPool {
    pub fn new() -> Self {
        Metric::new("worker_count", "Number of worker threads", false, &[], &[("pool_type", "EmptyPool")])
            .expect("static metric registration");
        Self
    }

    pub fn len(&self) -> usize {
        0
    }

    pub fn is_empty(&self) -> bool {
        true
    }

    pub fn shutdown(&self) {}
    pub fn del_worker(&self, _blocking: bool) {}
    pub fn check(&self) {}

    pub fn add_worker(&self, _blocking: bool) {
        tracing::info!("ignoring request to add worker: serial I/O only");
    }
}

impl Default for EmptyPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs `SIGUSR1`/`SIGUSR2` handlers that call [`WorkerPool::add_worker`]
/// / [`WorkerPool::del_worker`] (non-blocking) on `pool`.
pub fn install_resize_signals(pool: Arc<WorkerPool>) -> Result<(), std::io::Error> {
    let inc_pool = pool.clone();
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGUSR1, move || {
            inc_pool.add_worker(false);
        })?;
    }
    let dec_pool = pool;
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGUSR2, move || {
            dec_pool.del_worker(false);
        })?;
    }
    Ok(())
}
