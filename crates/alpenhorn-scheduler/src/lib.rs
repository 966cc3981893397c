pub mod pool;
pub mod queue;
pub mod task;

pub use pool::{global_abort, trigger_global_abort, EmptyPool, TaskOutcome, WorkerPool};
pub use queue::FairMultiFifoQueue;
pub use task::{Task, TaskBody, TaskStep};
