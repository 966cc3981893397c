//! Row types for the data index, grounded on `alpenhorn.db` (the peewee
//! models in the original implementation) and on the field list in the
//! data-model section of this crate's specification.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::*;

/// `has_file`: whether the bytes are actually present on the node, and
/// believed good.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HasFile {
    /// Present and known good.
    Yes,
    /// Absent.
    No,
    /// Present, but needs re-verification.
    Maybe,
    /// Present, verified corrupt.
    Corrupt,
}

impl HasFile {
    pub fn as_db(self) -> &'static str {
        match self {
            HasFile::Yes => "Y",
            HasFile::No => "N",
            HasFile::Maybe => "M",
            HasFile::Corrupt => "X",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "Y" => HasFile::Yes,
            "M" => HasFile::Maybe,
            "X" => HasFile::Corrupt,
            _ => HasFile::No,
        }
    }

    /// Priority order for deriving a group's aggregate has-state:
    /// Y beats M beats X beats N.
    pub fn priority(self) -> u8 {
        match self {
            HasFile::Yes => 3,
            HasFile::Maybe => 2,
            HasFile::Corrupt => 1,
            HasFile::No => 0,
        }
    }
}

/// `wants_file`: the daemon's intent for this copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WantsFile {
    /// Keep permanently.
    Yes,
    /// Discretionary: deletable under space pressure.
    Maybe,
    /// Slated for deletion.
    No,
}

impl WantsFile {
    pub fn as_db(self) -> &'static str {
        match self {
            WantsFile::Yes => "Y",
            WantsFile::Maybe => "M",
            WantsFile::No => "N",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "Y" => WantsFile::Yes,
            "N" => WantsFile::No,
            _ => WantsFile::Maybe,
        }
    }

    /// Priority order for deriving a group's aggregate want-state:
    /// Y beats M beats X(treated as N) beats N.
    pub fn priority(self) -> u8 {
        match self {
            WantsFile::Yes => 3,
            WantsFile::Maybe => 2,
            WantsFile::No => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    Archive,
    Transport,
    Field,
}

impl StorageType {
    pub fn as_db(self) -> &'static str {
        match self {
            StorageType::Archive => "A",
            StorageType::Transport => "T",
            StorageType::Field => "F",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "T" => StorageType::Transport,
            "F" => StorageType::Field,
            _ => StorageType::Archive,
        }
    }
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = acq)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Acq {
    pub id: i32,
    pub name: String,
    pub comment: Option<String>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = acq)]
pub struct NewAcq<'a> {
    pub name: &'a str,
    pub comment: Option<&'a str>,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = file)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct File {
    pub id: i32,
    pub acq_id: i32,
    pub name: String,
    pub size_b: i64,
    pub md5sum: String,
    pub registered: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = file)]
pub struct NewFile<'a> {
    pub acq_id: i32,
    pub name: &'a str,
    pub size_b: i64,
    pub md5sum: &'a str,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq)]
#[diesel(table_name = storagegroup)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StorageGroup {
    pub id: i32,
    pub name: String,
    pub notes: Option<String>,
    pub io_class: Option<String>,
    pub io_config: Option<serde_json::Value>,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq)]
#[diesel(table_name = storagenode)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StorageNode {
    pub id: i32,
    pub name: String,
    pub group_id: i32,
    pub host: String,
    pub root: String,
    pub username: Option<String>,
    pub address: Option<String>,
    pub active: bool,
    pub auto_import: bool,
    pub auto_verify: i32,
    pub storage_type: String,
    pub max_total_gb: Option<f64>,
    pub min_avail_gb: Option<f64>,
    pub avail_gb: Option<f64>,
    pub avail_gb_last_checked: Option<DateTime<Utc>>,
    pub io_class: Option<String>,
    pub io_config: Option<serde_json::Value>,
    pub notes: Option<String>,
}

impl StorageNode {
    pub fn storage_type(&self) -> StorageType {
        StorageType::from_db(&self.storage_type)
    }

    pub fn is_local(&self, this_host: &str) -> bool {
        self.host == this_host
    }

    pub fn is_archive(&self) -> bool {
        self.storage_type() == StorageType::Archive
    }

    /// True when `avail_gb` is known and below `min_avail_gb`.
    pub fn under_min(&self) -> bool {
        match (self.avail_gb, self.min_avail_gb) {
            (Some(avail), Some(min)) => avail < min,
            _ => false,
        }
    }
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = filecopy)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct FileCopy {
    pub id: i32,
    pub file_id: i32,
    pub node_id: i32,
    pub has_file: String,
    pub wants_file: String,
    pub ready: bool,
    pub size_b: Option<i64>,
    pub last_update: DateTime<Utc>,
}

impl FileCopy {
    pub fn has_file(&self) -> HasFile {
        HasFile::from_db(&self.has_file)
    }

    pub fn wants_file(&self) -> WantsFile {
        WantsFile::from_db(&self.wants_file)
    }
}

#[derive(Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = filecopy)]
pub struct NewFileCopy {
    pub file_id: i32,
    pub node_id: i32,
    pub has_file: String,
    pub wants_file: String,
    pub ready: bool,
    pub size_b: Option<i64>,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = filecopyrequest)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct FileCopyRequest {
    pub id: i32,
    pub file_id: i32,
    pub node_from_id: i32,
    pub group_to_id: i32,
    pub completed: bool,
    pub cancelled: bool,
    pub timestamp: DateTime<Utc>,
    pub transfer_started: Option<DateTime<Utc>>,
    pub transfer_completed: Option<DateTime<Utc>>,
}

impl FileCopyRequest {
    pub fn is_open(&self) -> bool {
        !self.completed && !self.cancelled
    }
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = fileimportrequest)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct FileImportRequest {
    pub id: i32,
    pub node_id: i32,
    pub path: String,
    pub recurse: bool,
    pub register: bool,
    pub completed: bool,
    pub timestamp: DateTime<Utc>,
}

/// Sentinel `path` value meaning "initialise this node", rather than
/// importing a file at a real path.
pub const ALPENHORN_NODE: &str = "ALPENHORN_NODE";

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = storagetransferaction)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StorageTransferAction {
    pub id: i32,
    pub node_from_id: i32,
    pub group_to_id: i32,
    pub autosync: bool,
    pub autoclean: bool,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = dataindexversion, primary_key(component))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DataIndexVersion {
    pub component: String,
    pub version: i32,
}
