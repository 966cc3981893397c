pub mod error;
pub mod invariants;
pub mod models;
pub mod pool;
pub mod query_walker;
pub mod schema;

pub use error::{Error, Result};

/// The compiled-in set of migrations, used by `alpenhornd db init` to
/// bootstrap an empty database.
pub const MIGRATIONS: diesel_migrations::EmbeddedMigrations =
    diesel_migrations::embed_migrations!("../../migrations");
