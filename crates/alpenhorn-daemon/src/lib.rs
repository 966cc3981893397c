pub mod auto_import;
pub mod dispatch;
pub mod pullutil;
pub mod transfer;
pub mod update;
pub mod watcher;

pub use dispatch::{Dispatcher, Job};
pub use update::{GroupIoFactory, HostUpdateLoop, NodeIoFactory, UpdateSkewGuard};
