//! Query helpers that enforce the data model's cross-row invariants.
//!
//! These are plain queries, not database constraints, because the
//! invariants they encode ("don't delete a copy some other request still
//! needs as a source") depend on transient request state that changes
//! far more often than the schema does.

use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::error::Result;
use crate::schema::filecopyrequest;

/// Delete-safety check: a FileCopy on `node_id` for `file_id` must not be
/// deleted while any non-completed, non-cancelled [`FileCopyRequest`]
/// names it as the copy source.
///
/// [`FileCopyRequest`]: crate::models::FileCopyRequest
pub async fn copy_is_delete_safe(
    conn: &mut AsyncPgConnection,
    file_id: i32,
    node_id: i32,
) -> Result<bool> {
    let blocking: i64 = filecopyrequest::table
        .filter(filecopyrequest::file_id.eq(file_id))
        .filter(filecopyrequest::node_from_id.eq(node_id))
        .filter(filecopyrequest::completed.eq(false))
        .filter(filecopyrequest::cancelled.eq(false))
        .count()
        .get_result(conn)
        .await?;
    Ok(blocking == 0)
}

/// Derive a storage group's aggregate `has_file` state for one file from
/// the individual `has_file` values of its member nodes' copies, using the
/// priority order Y > M > X > N (no copies at all is treated as absent).
///
/// This is the group-state invariant a pull request's member-state check
/// has to respect: a `Yes` anywhere in the group satisfies the request, a
/// `Maybe` anywhere means "wait and see", and only once neither is present
/// does a `Corrupt` copy force a re-pull.
pub fn group_has_priority(member_states: impl IntoIterator<Item = crate::models::HasFile>) -> Option<crate::models::HasFile> {
    member_states.into_iter().max_by_key(|s| s.priority())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HasFile;

    #[test]
    fn priority_prefers_yes_over_maybe_over_corrupt_over_no() {
        let states = vec![HasFile::No, HasFile::Corrupt, HasFile::Maybe, HasFile::Yes];
        assert_eq!(group_has_priority(states), Some(HasFile::Yes));
    }

    #[test]
    fn priority_prefers_maybe_over_corrupt() {
        let states = vec![HasFile::Corrupt, HasFile::Maybe];
        assert_eq!(group_has_priority(states), Some(HasFile::Maybe));
    }

    #[test]
    fn priority_of_empty_is_none() {
        let states: Vec<HasFile> = vec![];
        assert_eq!(group_has_priority(states), None);
    }
}
