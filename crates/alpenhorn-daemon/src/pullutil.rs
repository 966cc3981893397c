//! Pull finalisation: deciding what a completed (or failed) transfer
//! attempt means for the data index.
//!
//! Grounded on `alpenhorn/daemon/update.py`'s `copy_request_done` and the
//! Prometheus counters it updates; §4.G of the design.

use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use alpenhorn_common::metrics::Metric;
use alpenhorn_db::models::{FileCopy, FileCopyRequest, NewFileCopy};
use alpenhorn_db::schema::{filecopy, filecopyrequest};
use alpenhorn_db::{Error, Result};

use crate::auto_import;

/// Either a known boolean verdict or a string MD5 to compare against the
/// destination file's recorded checksum, matching the original's
/// `md5sum: bool | str` parameter.
pub enum Md5Check {
    Verdict(bool),
    Digest(String),
}

/// The actual allocated size on the destination, possibly expensive to
/// compute; deferred behind a closure so finalisation on failure paths
/// never pays for it.
pub type SizeFn<'a> = dyn FnOnce() -> i64 + Send + 'a;

pub struct TransferOutcome<'a> {
    pub succeeded: bool,
    pub check_src: bool,
    pub md5_check: Md5Check,
    pub actual_size: Box<SizeFn<'a>>,
}

fn metric(result: &str, node_from: &str, group_to: &str) -> Metric {
    Metric::new(
        "transfers",
        "Transfer attempts by source node, destination group and outcome",
        true,
        &[],
        &[("result", result), ("node_from", node_from), ("group_to", group_to)],
    )
    .expect("static metric registration")
}

/// Finalise a single pull attempt. Returns the (possibly still-open)
/// request row after any updates.
pub async fn copy_request_done<'a>(
    conn: &mut AsyncPgConnection,
    request: &FileCopyRequest,
    node_from_name: &str,
    group_to_name: &str,
    dest_node_id: i32,
    outcome: TransferOutcome<'a>,
) -> Result<bool> {
    if !outcome.succeeded {
        if outcome.check_src {
            mark_source_suspect(conn, request).await?;
            metric("transfer_failed_checked", node_from_name, group_to_name).inc(&[]).ok();
        } else {
            metric("transfer_failed", node_from_name, group_to_name).inc(&[]).ok();
        }
        return Ok(false);
    }

    let md5_ok = match outcome.md5_check {
        Md5Check::Verdict(v) => v,
        Md5Check::Digest(got) => {
            let file_md5: String = alpenhorn_db::schema::file::table
                .find(request.file_id)
                .select(alpenhorn_db::schema::file::md5sum)
                .first(conn)
                .await?;
            got == file_md5
        }
    };

    if !md5_ok {
        mark_source_suspect(conn, request).await?;
        metric("md5_mismatch", node_from_name, group_to_name).inc(&[]).ok();
        return Ok(false);
    }

    let size_b = (outcome.actual_size)();

    upsert_good_copy(conn, request.file_id, dest_node_id, size_b).await?;

    // The destination now holds a good copy; run autosync/autoclean again
    // treating it as the new origin (§4.F step 10), so e.g. an autoclean
    // edge back to the original source can fire.
    auto_import::run_auto_actions(conn, dest_node_id, request.file_id).await?;

    diesel::update(filecopyrequest::table.find(request.id))
        .set((
            filecopyrequest::completed.eq(true),
            filecopyrequest::transfer_completed.eq(Some(Utc::now())),
        ))
        .execute(conn)
        .await?;

    metric("success", node_from_name, group_to_name).inc(&[]).ok();
    Ok(true)
}

async fn mark_source_suspect(conn: &mut AsyncPgConnection, request: &FileCopyRequest) -> Result<()> {
    diesel::update(
        filecopy::table.filter(
            filecopy::file_id
                .eq(request.file_id)
                .and(filecopy::node_id.eq(request.node_from_id)),
        ),
    )
    .set((filecopy::has_file.eq("M"), filecopy::last_update.eq(Utc::now())))
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_good_copy(conn: &mut AsyncPgConnection, file_id: i32, node_id: i32, size_b: i64) -> Result<()> {
    let existing: Option<FileCopy> = filecopy::table
        .filter(filecopy::file_id.eq(file_id).and(filecopy::node_id.eq(node_id)))
        .first(conn)
        .await
        .optional()?;

    match existing {
        Some(copy) => {
            diesel::update(filecopy::table.find(copy.id))
                .set((
                    filecopy::has_file.eq("Y"),
                    filecopy::wants_file.eq("Y"),
                    filecopy::ready.eq(true),
                    filecopy::size_b.eq(Some(size_b)),
                    filecopy::last_update.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;
        }
        None => {
            let row = NewFileCopy {
                file_id,
                node_id,
                has_file: "Y".to_string(),
                wants_file: "Y".to_string(),
                ready: true,
                size_b: Some(size_b),
            };
            diesel::insert_into(filecopy::table).values(&row).execute(conn).await?;
        }
    }
    Ok(())
}

/// Errors surfaced from `copy_request_done` that a worker should treat as
/// transient (DB connectivity) versus fatal, reusing the classification in
/// `alpenhorn_db::error::is_transient`.
pub fn is_transient(err: &Error) -> bool {
    alpenhorn_db::error::is_transient(err)
}
