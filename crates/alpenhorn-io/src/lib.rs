pub mod group;
pub mod lfs;
pub mod node;

pub use group::{GroupIo, GroupIoClass, PullOutcome};
pub use node::{CheckResult, NodeIo, NodeIoClass, RemoteNode};
