//! Resumable, self-requeueing tasks.
//!
//! Grounded on `alpenhorn/scheduler/task.py`. The original represents a
//! suspendable task as a Python generator: calling the task function may
//! return a generator (if the function body contains a `yield`), and the
//! worker iterates it one step at a time, putting the task back on the
//! queue with a delay equal to the yielded value between steps.
//!
//! Rust has no generators a worker can drive from the outside like that,
//! so a task's body here is an explicit, restartable state machine: each
//! call to [`TaskBody::step`] either runs to completion ([`TaskStep::Done`])
//! or asks to be resumed after a delay ([`TaskStep::Yield`]), and the body
//! itself is responsible for remembering which step it's on.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::queue::FairMultiFifoQueue;

/// The result of running one step of a task's body.
pub enum TaskStep {
    /// Suspend the task; resume after at least this long.
    Yield(Duration),
    /// The task is finished.
    Done,
}

/// The body of a task. Implementors hold whatever state they need to
/// resume where they left off; a fresh instance (via [`TaskBody::restart`])
/// is used when a task is requeued after a worker crash, since Rust values
/// can't be "rewound" to their start the way a generator object can't
/// either (the original's `requeue()` has the same restart-from-scratch
/// behaviour).
pub trait TaskBody: Send {
    fn step(&mut self, task: &Task) -> TaskStep;

    /// Produce a fresh copy of this body's initial state, for requeueing.
    fn restart(&self) -> Box<dyn TaskBody>;
}

type CleanupFn = Box<dyn FnOnce() + Send>;

/// An asynchronous I/O task handled by a worker thread.
pub struct Task {
    name: String,
    key: String,
    exclusive: bool,
    requeue_on_db_error: bool,
    queue: Arc<FairMultiFifoQueue<String, Arc<Task>>>,
    body: Mutex<Box<dyn TaskBody>>,
    cleanup: Mutex<VecDeque<CleanupFn>>,
    /// Set by a [`TaskBody::step`] that hit a fallible error it can't
    /// report through [`TaskStep`] (which only distinguishes yield/done).
    /// `true` means the error looked transient (worth a fresh connection
    /// and a retry), `false` means it's unrecoverable.
    error: Mutex<Option<bool>>,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl Task {
    /// Create a new task and enqueue it onto `queue` under FIFO `key`.
    pub fn spawn(
        queue: Arc<FairMultiFifoQueue<String, Arc<Task>>>,
        key: impl Into<String>,
        body: Box<dyn TaskBody>,
        name: impl Into<String>,
        exclusive: bool,
        requeue_on_db_error: bool,
    ) -> Arc<Task> {
        let key = key.into();
        let task = Arc::new(Task {
            name: name.into(),
            key: key.clone(),
            exclusive,
            requeue_on_db_error,
            queue: queue.clone(),
            body: Mutex::new(body),
            cleanup: Mutex::new(VecDeque::new()),
            error: Mutex::new(None),
        });
        queue.put(task.clone(), key, exclusive, None);
        task
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Record that this step's body hit an error, for the worker pool's
    /// `step` closure to pick up once [`Task::run`] returns. Called from
    /// within [`TaskBody::step`], which only gets `&Task`.
    pub fn report_error(&self, transient: bool) {
        *self.error.lock() = Some(transient);
    }

    /// Take the error (if any) reported by the most recent `run()`.
    pub fn take_error(&self) -> Option<bool> {
        self.error.lock().take()
    }

    /// Run one step of this task. Returns `true` if the task is finished
    /// (and cleanup has run), `false` if it yielded and was requeued with
    /// a delay.
    pub fn run(self: &Arc<Self>) -> bool {
        match self.body.lock().step(self) {
            TaskStep::Yield(delay) => {
                tracing::debug!(task = %self.name, fifo = %self.key, delay = ?delay, "requeueing yielded task");
                self.queue.put(self.clone(), self.key.clone(), false, Some(delay));
                false
            }
            TaskStep::Done => {
                self.do_cleanup();
                true
            }
        }
    }

    /// Run the cleanup stack. Pops as it goes, so a cleanup function that
    /// itself fails (e.g. due to a DB error causing the worker to abandon
    /// the task) doesn't cause already-run cleanups to repeat.
    pub fn do_cleanup(&self) {
        loop {
            let next = self.cleanup.lock().pop_front();
            match next {
                Some(func) => func(),
                None => break,
            }
        }
    }

    /// Register a cleanup function. If `first` is true, it runs before
    /// all currently registered cleanups (stack order); otherwise after
    /// them (FIFO order). The two styles may be freely mixed.
    pub fn on_cleanup(&self, first: bool, func: impl FnOnce() + Send + 'static) {
        let mut cleanup = self.cleanup.lock();
        if first {
            cleanup.push_front(Box::new(func));
        } else {
            cleanup.push_back(Box::new(func));
        }
    }

    /// If this task was created with `requeue_on_db_error`, push a fresh
    /// copy of it back onto the queue. Called by the worker pool after a
    /// transient DB error aborts the task mid-run.
    pub fn requeue_after_db_error(self: &Arc<Self>) {
        if !self.requeue_on_db_error {
            return;
        }
        tracing::info!(task = %self.name, fifo = %self.key, "requeueing task after db error");
        let fresh_body = self.body.lock().restart();
        Task::spawn(
            self.queue.clone(),
            self.key.clone(),
            fresh_body,
            self.name.clone(),
            self.exclusive,
            self.requeue_on_db_error,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountToThree(u32);
    impl TaskBody for CountToThree {
        fn step(&mut self, _task: &Task) -> TaskStep {
            self.0 += 1;
            if self.0 >= 3 {
                TaskStep::Done
            } else {
                TaskStep::Yield(Duration::from_millis(1))
            }
        }
        fn restart(&self) -> Box<dyn TaskBody> {
            Box::new(CountToThree(0))
        }
    }

    #[test]
    fn task_yields_then_completes_and_runs_cleanup() {
        let queue = Arc::new(FairMultiFifoQueue::new());
        let task = Task::spawn(queue.clone(), "node-a", Box::new(CountToThree(0)), "count", false, false);

        let ran_cleanup = Arc::new(Mutex::new(false));
        let flag = ran_cleanup.clone();
        task.on_cleanup(true, move || *flag.lock() = true);

        let (t, key) = queue.get(Some(Duration::from_secs(1))).unwrap();
        assert!(!t.run());
        queue.task_done(&key);

        std::thread::sleep(Duration::from_millis(5));
        let (t, key) = queue.get(Some(Duration::from_secs(1))).unwrap();
        assert!(!t.run());
        queue.task_done(&key);

        std::thread::sleep(Duration::from_millis(5));
        let (t, key) = queue.get(Some(Duration::from_secs(1))).unwrap();
        assert!(t.run());
        queue.task_done(&key);

        assert!(*ran_cleanup.lock());
    }
}
