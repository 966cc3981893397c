//! Connection pool setup and schema-version gating.
//!
//! Grounded on `spk-config`'s use of a process-wide handle to shared
//! config/state (here, a pool), and on the data model's requirement that
//! the daemon refuse to run against a data index whose schema is either
//! newer than it understands or missing a required component.

use std::collections::HashMap;

use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::error::{Error, Result};
use crate::schema::dataindexversion;

pub type DbPool = Pool<AsyncPgConnection>;

/// The schema components this daemon build understands, and the highest
/// version of each it supports.
pub const SUPPORTED_COMPONENTS: &[(&str, i32)] = &[("alpenhorn", 3)];

pub async fn connect(database_url: &str) -> Result<DbPool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder().build(manager).await?;
    Ok(pool)
}

/// Compare the data index's recorded component versions against what this
/// build supports. A missing required component or a too-new version are
/// both hard errors; an older-but-known version is fine (the daemon need
/// not understand schema migrations, only refuse to run ahead of them).
pub async fn check_schema_version(conn: &mut AsyncPgConnection) -> Result<()> {
    let rows = dataindexversion::table
        .load::<crate::models::DataIndexVersion>(conn)
        .await?;
    let found: HashMap<&str, i32> = rows.iter().map(|r| (r.component.as_str(), r.version)).collect();

    for (component, max_supported) in SUPPORTED_COMPONENTS {
        match found.get(component) {
            None => return Err(Error::SchemaMissing((*component).to_string())),
            Some(version) if *version > *max_supported => {
                return Err(Error::SchemaTooNew {
                    component: (*component).to_string(),
                    found: *version,
                    max_supported: *max_supported,
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Is the data index reachable but not yet initialised (i.e. the
/// `dataindexversion` table itself doesn't exist)? Used by `alpenhornd db
/// init` to decide whether it's bootstrapping a fresh database.
pub async fn schema_is_uninitialized(conn: &mut AsyncPgConnection) -> bool {
    dataindexversion::table
        .select(dataindexversion::component)
        .limit(1)
        .load::<String>(conn)
        .await
        .is_err()
}
