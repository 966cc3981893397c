//! Auto-import: turning a path on disk into tracked data-index rows.
//!
//! Grounded on `alpenhorn/daemon/auto_import.py`. Two entry points share
//! this logic: the filesystem-watcher callback (a path observed directly,
//! no request row) and the `FileImportRequest` handler (§4.E step 4.c).
//! §4.F of the design.

use std::path::{Path, PathBuf};

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use alpenhorn_common::util::invalid_import_path;
use alpenhorn_db::models::{Acq, FileCopy, NewAcq, NewFile, NewFileCopy, StorageNode, ALPENHORN_NODE};
use alpenhorn_db::schema::{acq, file, filecopy, storagetransferaction};
use alpenhorn_db::{Error, Result};
use alpenhorn_io::NodeIo;

/// What an import detector decided about a candidate path.
pub enum Detection {
    /// This detector doesn't recognise the path; try the next one.
    NotMine,
    /// This detector claims the path: it belongs to acquisition `acq_name`,
    /// with file name `file_name` relative to that acquisition, and an
    /// optional callback to run once the FileCopy row exists.
    Mine {
        acq_name: String,
        file_name: String,
        on_add: Option<Box<dyn FnOnce(&FileCopy, bool, bool) + Send>>,
    },
}

/// A chain of import detectors, consulted in order; the first to claim a
/// path wins. Configured via the `extensions` list (the `import-detect`
/// capability key), matching the original's plugin registry.
pub trait ImportDetector: Send + Sync {
    fn detect(&self, rel_path: &Path, node: &StorageNode) -> Detection;
}

/// Outcome of attempting to import one path, for logging/testing.
#[derive(Debug, PartialEq, Eq)]
pub enum ImportResult {
    Imported,
    AlreadyDuplicate,
    NotRecognised,
    Deferred,
    Locked,
    InvalidPath(&'static str),
}

/// Suspend the task for this long when the node isn't ready to serve the
/// path yet (§4.F step 2).
pub const NOT_READY_DEFER_SECONDS: u64 = 600;

/// Try to import `rel_path` (already relative to `node`'s root) using
/// `detectors`. Returns `Ok(Deferred)` rather than erroring when the node
/// reports not-ready; the caller (a `Task`) is responsible for re-yielding.
pub async fn import_path(
    conn: &mut AsyncPgConnection,
    io: &dyn NodeIo,
    node: &StorageNode,
    rel_path: &Path,
    detectors: &[std::sync::Arc<dyn ImportDetector>],
) -> Result<ImportResult> {
    let path_str = rel_path.to_string_lossy();
    if path_str.is_empty() || path_str == ALPENHORN_NODE {
        return Ok(ImportResult::NotRecognised);
    }

    if !io.ready_path(rel_path).await.map_err(|e| Error::Io(e.to_string()))? {
        return Ok(ImportResult::Deferred);
    }

    if io.locked(rel_path).await.map_err(|e| Error::Io(e.to_string()))? {
        return Ok(ImportResult::Locked);
    }

    let mut detection = None;
    for detector in detectors {
        match detector.detect(rel_path, node) {
            Detection::NotMine => continue,
            hit @ Detection::Mine { .. } => {
                detection = Some(hit);
                break;
            }
        }
    }

    let Some(Detection::Mine { acq_name, file_name, on_add }) = detection else {
        return Ok(ImportResult::NotRecognised);
    };

    if let Some(reason) = invalid_import_path(&acq_name) {
        return Ok(ImportResult::InvalidPath(reason));
    }
    if let Some(reason) = invalid_import_path(&file_name) {
        return Ok(ImportResult::InvalidPath(reason));
    }

    let acq_row = get_or_create_acq(conn, &acq_name).await?;

    if let Some(existing) = find_tracked_copy(conn, acq_row.id, &file_name, node.id).await? {
        if existing.has_file() != alpenhorn_db::models::HasFile::No {
            return Ok(ImportResult::AlreadyDuplicate);
        }
    }

    let (file_row, file_created) = get_or_create_file(conn, io, node, acq_row.id, &acq_name, &file_name).await?;
    let (copy, copy_created) = get_or_create_copy(conn, file_row.id, node.id).await?;

    if let Some(cb) = on_add {
        cb(&copy, file_created, copy_created);
    }

    run_auto_actions(conn, node.id, file_row.id).await?;

    Ok(ImportResult::Imported)
}

async fn find_tracked_copy(
    conn: &mut AsyncPgConnection,
    acq_id: i32,
    file_name: &str,
    node_id: i32,
) -> Result<Option<FileCopy>> {
    let file_row: Option<alpenhorn_db::models::File> = file::table
        .filter(file::acq_id.eq(acq_id).and(file::name.eq(file_name)))
        .first(conn)
        .await
        .optional()?;

    let Some(file_row) = file_row else { return Ok(None) };

    filecopy::table
        .filter(filecopy::file_id.eq(file_row.id).and(filecopy::node_id.eq(node_id)))
        .first(conn)
        .await
        .optional()
        .map_err(Error::from)
}

async fn get_or_create_acq(conn: &mut AsyncPgConnection, name: &str) -> Result<Acq> {
    if let Some(existing) = acq::table.filter(acq::name.eq(name)).first(conn).await.optional()? {
        return Ok(existing);
    }

    let insert = diesel::insert_into(acq::table)
        .values(NewAcq { name, comment: None })
        .get_result::<Acq>(conn)
        .await;

    match insert {
        Ok(row) => Ok(row),
        // Lost a concurrent-create race: another worker's insert committed
        // first. Re-fetch rather than propagate the uniqueness violation.
        Err(_) => acq::table
            .filter(acq::name.eq(name))
            .first(conn)
            .await
            .map_err(Error::from),
    }
}

async fn get_or_create_file(
    conn: &mut AsyncPgConnection,
    io: &dyn NodeIo,
    _node: &StorageNode,
    acq_id: i32,
    acq_name: &str,
    file_name: &str,
) -> Result<(alpenhorn_db::models::File, bool)> {
    if let Some(existing) = file::table
        .filter(file::acq_id.eq(acq_id).and(file::name.eq(file_name)))
        .first(conn)
        .await
        .optional()?
    {
        return Ok((existing, false));
    }

    let md5sum = io.md5(acq_name, file_name).await.map_err(|e| Error::Io(e.to_string()))?;
    let size_b = io
        .filesize(&PathBuf::from(acq_name).join(file_name), true)
        .await
        .map_err(|e| Error::Io(e.to_string()))? as i64;

    let insert = diesel::insert_into(file::table)
        .values(NewFile { acq_id, name: file_name, size_b, md5sum: &md5sum })
        .get_result::<alpenhorn_db::models::File>(conn)
        .await;

    match insert {
        Ok(row) => Ok((row, true)),
        Err(_) => {
            let row = file::table
                .filter(file::acq_id.eq(acq_id).and(file::name.eq(file_name)))
                .first(conn)
                .await?;
            Ok((row, false))
        }
    }
}

async fn get_or_create_copy(conn: &mut AsyncPgConnection, file_id: i32, node_id: i32) -> Result<(FileCopy, bool)> {
    let existing: Option<FileCopy> = filecopy::table
        .filter(filecopy::file_id.eq(file_id).and(filecopy::node_id.eq(node_id)))
        .first(conn)
        .await
        .optional()?;

    match existing {
        Some(copy) if copy.wants_file().as_db() == "Y" && copy.has_file().as_db() == "N" => {
            diesel::update(filecopy::table.find(copy.id))
                .set((filecopy::has_file.eq("M"), filecopy::last_update.eq(Utc::now())))
                .get_result::<FileCopy>(conn)
                .await
                .map(|c| (c, false))
                .map_err(Error::from)
        }
        Some(copy) => Ok((copy, false)),
        None => {
            let row = NewFileCopy {
                file_id,
                node_id,
                has_file: "Y".to_string(),
                wants_file: "Y".to_string(),
                ready: true,
                size_b: None,
            };
            let inserted = diesel::insert_into(filecopy::table)
                .values(&row)
                .get_result::<FileCopy>(conn)
                .await?;
            Ok((inserted, true))
        }
    }
}

/// Autosync/autoclean (§4.F step 10): for every `StorageTransferAction`
/// edge outbound from `node_id`, create a pull request to the target
/// group if it has no good copy of `file_id` yet (autosync); for every
/// inbound edge with `autoclean=true`, mark the corresponding source copy
/// `wants_file=N` (autoclean). Self-loops (a group whose only node is the
/// source) are ignored by virtue of `group_to` and `node_from` never
/// referring to the same storage object.
pub async fn run_auto_actions(conn: &mut AsyncPgConnection, node_id: i32, file_id: i32) -> Result<()> {
    use alpenhorn_db::schema::filecopyrequest;
    use alpenhorn_db::schema::storagenode;

    let outbound: Vec<(i32, bool, bool)> = storagetransferaction::table
        .filter(storagetransferaction::node_from_id.eq(node_id))
        .select((
            storagetransferaction::group_to_id,
            storagetransferaction::autosync,
            storagetransferaction::autoclean,
        ))
        .load(conn)
        .await?;

    for (group_to_id, autosync, _autoclean) in &outbound {
        if !autosync {
            continue;
        }
        let has_good_copy: i64 = filecopy::table
            .inner_join(storagenode::table.on(storagenode::id.eq(filecopy::node_id)))
            .filter(
                filecopy::file_id
                    .eq(file_id)
                    .and(storagenode::group_id.eq(*group_to_id))
                    .and(filecopy::has_file.eq("Y")),
            )
            .count()
            .get_result(conn)
            .await?;

        if has_good_copy == 0 {
            diesel::insert_into(filecopyrequest::table)
                .values((
                    filecopyrequest::file_id.eq(file_id),
                    filecopyrequest::node_from_id.eq(node_id),
                    filecopyrequest::group_to_id.eq(*group_to_id),
                    filecopyrequest::completed.eq(false),
                    filecopyrequest::cancelled.eq(false),
                    filecopyrequest::timestamp.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;
        }
    }

    let inbound: Vec<(i32, bool)> = storagetransferaction::table
        .inner_join(storagenode::table.on(storagenode::group_id.eq(storagetransferaction::group_to_id)))
        .filter(storagenode::id.eq(node_id))
        .select((storagetransferaction::node_from_id, storagetransferaction::autoclean))
        .load(conn)
        .await?;

    for (source_node_id, autoclean) in &inbound {
        if !autoclean || *source_node_id == node_id {
            continue;
        }
        diesel::update(filecopy::table.filter(filecopy::file_id.eq(file_id).and(filecopy::node_id.eq(*source_node_id))))
            .set(filecopy::wants_file.eq("N"))
            .execute(conn)
            .await?;
    }

    Ok(())
}
