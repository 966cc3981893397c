//! A randomised, wrapping cursor over a table's rows.
//!
//! Grounded on `alpenhorn/daemon/querywalker.py`: pick a random starting
//! primary key, then return successive rows in primary-key order forever,
//! wrapping from the last row back to the first. The random start means
//! that a daemon which only ever runs for short periods doesn't always
//! perform its (usually low-priority, maintenance) work on the same
//! handful of rows at the start of the table.
//!
//! Unlike the original, which chose between `RANDOM()` and `RAND()` based
//! on the backend in use, this crate only targets Postgres, so only
//! `RANDOM()` is used; see the design ledger for that scope decision.

use async_trait::async_trait;
use diesel_async::AsyncPgConnection;

use crate::error::{Error, Result};

/// Per-table glue the [`QueryWalker`] needs: how to pick a random starting
/// row, how to page forward from a given id, and how to page from the
/// beginning once the cursor wraps around.
#[async_trait]
pub trait Walk: Send {
    type Row: Send;

    async fn pick_start(&self, conn: &mut AsyncPgConnection) -> Result<Option<i32>>;

    async fn load_from(
        &self,
        conn: &mut AsyncPgConnection,
        start_id: i32,
        n: i64,
    ) -> Result<Vec<Self::Row>>;

    async fn load_from_beginning(
        &self,
        conn: &mut AsyncPgConnection,
        n: i64,
    ) -> Result<Vec<Self::Row>>;

    fn row_id(&self, row: &Self::Row) -> i32;
}

pub struct QueryWalker<W: Walk> {
    walk: W,
    cursor: i32,
}

impl<W: Walk> QueryWalker<W> {
    /// Create a new walker, choosing a random starting row.
    ///
    /// Returns [`Error::NoResults`] if the underlying query matches no rows.
    pub async fn new(conn: &mut AsyncPgConnection, walk: W) -> Result<Self> {
        let id = walk.pick_start(conn).await?.ok_or(Error::NoResults)?;
        Ok(Self { walk, cursor: id })
    }

    /// Retrieve `n` rows starting from the current cursor, wrapping around
    /// to the beginning of the table as needed. Always returns exactly `n`
    /// rows (possibly with duplicates) unless the query now matches nothing,
    /// in which case [`Error::NoResults`] is returned.
    pub async fn get(&mut self, conn: &mut AsyncPgConnection, n: i64) -> Result<Vec<W::Row>> {
        if n < 1 {
            return Err(Error::NonPositiveN(n));
        }

        let mut items = self.walk.load_from(conn, self.cursor, n).await?;
        let mut remaining = n - items.len() as i64;

        while remaining > 0 {
            let more = self.walk.load_from_beginning(conn, remaining).await?;
            if more.is_empty() {
                return Err(Error::NoResults);
            }
            remaining -= more.len() as i64;
            items.extend(more);
        }

        self.cursor = 1 + self.walk.row_id(items.last().expect("n >= 1"));
        Ok(items)
    }
}

pub mod filecopy_walk {
    //! A concrete [`Walk`] over `FileCopy` rows on a single node, used by
    //! the update loop's auto-verify pass.

    use diesel::prelude::*;
    use diesel_async::RunQueryDsl;

    use super::*;
    use crate::models::FileCopy;
    use crate::schema::filecopy;

    pub struct NodeFileCopyWalk {
        pub node_id: i32,
    }

    #[async_trait]
    impl Walk for NodeFileCopyWalk {
        type Row = FileCopy;

        async fn pick_start(&self, conn: &mut AsyncPgConnection) -> Result<Option<i32>> {
            let id = filecopy::table
                .filter(filecopy::node_id.eq(self.node_id))
                .filter(filecopy::has_file.ne("N"))
                .select(filecopy::id)
                .order(diesel::dsl::sql::<diesel::sql_types::Integer>("RANDOM()"))
                .first::<i32>(conn)
                .await
                .optional()?;
            Ok(id)
        }

        async fn load_from(
            &self,
            conn: &mut AsyncPgConnection,
            start_id: i32,
            n: i64,
        ) -> Result<Vec<FileCopy>> {
            let rows = filecopy::table
                .filter(filecopy::node_id.eq(self.node_id))
                .filter(filecopy::has_file.ne("N"))
                .filter(filecopy::id.ge(start_id))
                .order(filecopy::id.asc())
                .limit(n)
                .select(FileCopy::as_select())
                .load(conn)
                .await?;
            Ok(rows)
        }

        async fn load_from_beginning(
            &self,
            conn: &mut AsyncPgConnection,
            n: i64,
        ) -> Result<Vec<FileCopy>> {
            let rows = filecopy::table
                .filter(filecopy::node_id.eq(self.node_id))
                .filter(filecopy::has_file.ne("N"))
                .order(filecopy::id.asc())
                .limit(n)
                .select(FileCopy::as_select())
                .load(conn)
                .await?;
            Ok(rows)
        }

        fn row_id(&self, row: &FileCopy) -> i32 {
            row.id
        }
    }
}
