//! Selects a concrete [`NodeIo`]/[`GroupIo`] backend from a storage row's
//! `io_class`/`io_config` columns, per §4.D's invariant that I/O objects
//! are re-instantiated whenever `{id, io_class, io_config}` changes.

use std::sync::Arc;

use alpenhorn_daemon::{GroupIoFactory, NodeIoFactory};
use alpenhorn_db::models::{StorageGroup, StorageNode};
use alpenhorn_io::group::{DefaultGroup, GroupIo, GroupIoClass, LustreHsmGroup, TransportGroup};
use alpenhorn_io::lfs::Lfs;
use alpenhorn_io::node::{DefaultNode, LustreHsmNode, LustreQuotaNode, NodeIo, NodeIoClass};

pub struct BuiltinNodeFactory;

fn lfs_from_config(row_io_config: &Option<serde_json::Value>) -> Option<Arc<Lfs>> {
    let cfg = row_io_config.as_ref()?;
    let group = cfg.get("quota_group")?.as_str()?.to_string();
    let fixed_quota_kib = cfg.get("fixed_quota_kib").and_then(|v| v.as_i64());
    let lfs_cmd = cfg.get("lfs_cmd").and_then(|v| v.as_str()).unwrap_or("lfs");
    Lfs::new(group, fixed_quota_kib, lfs_cmd).ok().map(Arc::new)
}

/// `release_headroom` is a byte-size string like `"100G"`, matching the
/// convention used for `FileLogConfig::max_bytes` elsewhere. Missing or
/// unparseable values leave the release pass disabled (headroom 0).
fn release_headroom_from_config(row_io_config: &Option<serde_json::Value>) -> u64 {
    row_io_config
        .as_ref()
        .and_then(|cfg| cfg.get("release_headroom"))
        .and_then(|v| v.as_str())
        .and_then(|s| alpenhorn_common::util::parse_bytesize(s).ok())
        .map(|n| n.max(0) as u64)
        .unwrap_or(0)
}

impl NodeIoFactory for BuiltinNodeFactory {
    fn build(&self, row: &StorageNode) -> Arc<dyn NodeIo> {
        let default = DefaultNode { node: row.clone() };
        match NodeIoClass::from_db(row.io_class.as_deref()) {
            NodeIoClass::Default | NodeIoClass::Polling => Arc::new(default),
            NodeIoClass::LustreQuota => match lfs_from_config(&row.io_config) {
                Some(lfs) => Arc::new(LustreQuotaNode { inner: default, lfs }),
                None => {
                    tracing::warn!(node = %row.name, "LustreQuota node missing quota_group in io_config, falling back to Default");
                    Arc::new(default)
                }
            },
            NodeIoClass::LustreHsm => match lfs_from_config(&row.io_config) {
                Some(lfs) => {
                    let release_headroom_bytes = release_headroom_from_config(&row.io_config);
                    Arc::new(LustreHsmNode { inner: default, lfs, release_headroom_bytes })
                }
                None => {
                    tracing::warn!(node = %row.name, "LustreHSM node missing quota_group in io_config, falling back to Default");
                    Arc::new(default)
                }
            },
        }
    }
}

pub struct BuiltinGroupFactory;

impl GroupIoFactory for BuiltinGroupFactory {
    fn build(&self, row: &StorageGroup, nodes: Vec<(StorageNode, Arc<dyn NodeIo>)>) -> Box<dyn GroupIo> {
        match GroupIoClass::from_db(row.io_class.as_deref()) {
            GroupIoClass::Default => Box::new(DefaultGroup { group: row.clone(), nodes }),
            GroupIoClass::Transport => Box::new(TransportGroup { group: row.clone(), nodes }),
            GroupIoClass::LustreHsm => Box::new(LustreHsmGroup { inner: DefaultGroup { group: row.clone(), nodes } }),
        }
    }
}
