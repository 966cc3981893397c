//! Filesystem-watch entry point for auto-import (§4.F's "watcher callback,
//! path observed on disk, no request row").
//!
//! Grounded on `alpenhorn/daemon/auto_import.py`'s use of `watchdog` to
//! observe a node's root and feed newly-seen paths into the same
//! `import_file` body the `FileImportRequest` handler uses. `watchdog` has
//! no direct Rust port; `notify` is the idiomatic equivalent (not part of
//! the teacher's own stack, noted in DESIGN.md).

use std::path::PathBuf;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// A live filesystem watch on one node's root. Paths reported by the
/// watcher are relativised against `node_root` and sent down `tx` as
/// `(node_name, relative_path)` pairs for the update loop to pick up on
/// its next pass. Dropping this value stops the watch: `notify`'s watcher
/// tears down its OS-level handle on `Drop`, and the relay task is
/// aborted, matching "force-stop their filesystem watchers" in the
/// node-refresh step.
pub struct NodeWatcher {
    _watcher: RecommendedWatcher,
    relay: tokio::task::JoinHandle<()>,
}

impl NodeWatcher {
    pub fn start(node_name: String, node_root: PathBuf, tx: mpsc::UnboundedSender<(String, PathBuf)>) -> notify::Result<Self> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if is_interesting(&event.kind) {
                    for path in event.paths {
                        let _ = raw_tx.send(path);
                    }
                }
            }
        })?;
        watcher.watch(&node_root, RecursiveMode::Recursive)?;

        let relay = tokio::spawn(async move {
            while let Some(abs_path) = raw_rx.recv().await {
                let Ok(rel) = abs_path.strip_prefix(&node_root) else { continue };
                if tx.send((node_name.clone(), rel.to_path_buf())).is_err() {
                    break;
                }
            }
        });

        Ok(Self { _watcher: watcher, relay })
    }
}

impl Drop for NodeWatcher {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

fn is_interesting(kind: &notify::EventKind) -> bool {
    use notify::EventKind;
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn reports_relative_path_of_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = NodeWatcher::start("dft".to_string(), dir.path().to_path_buf(), tx).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::create_dir_all(dir.path().join("acq1")).unwrap();
        std::fs::write(dir.path().join("acq1").join("find.me"), b"hello").unwrap();

        let (name, path) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher should report an event")
            .expect("channel open");
        assert_eq!(name, "dft");
        assert!(path.ends_with("find.me") || path == std::path::Path::new("acq1"));
    }
}
