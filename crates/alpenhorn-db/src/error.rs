use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Diesel(#[from] diesel::result::Error),

    #[error(transparent)]
    Pool(#[from] diesel_async::pooled_connection::bb8::RunError),

    #[error(transparent)]
    Connection(#[from] diesel::ConnectionError),

    #[error("node or group I/O error: {0}")]
    Io(String),

    #[error("the data index schema is newer than this daemon supports (component {component:?}: have {found}, support up to {max_supported})")]
    SchemaTooNew {
        component: String,
        found: i32,
        max_supported: i32,
    },

    #[error("the data index schema is missing required component {0:?}; run `alpenhornd db init`")]
    SchemaMissing(String),

    #[error("query produced no matching rows")]
    NoResults,

    #[error("n must be positive, got {0}")]
    NonPositiveN(i64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Is this a transient connection-level error (as opposed to a query/logic
/// error)? Workers use this to decide whether to exit and be respawned
/// (see the worker pool's reconnect-resilience behaviour) rather than
/// treating the error as a task failure.
pub fn is_transient(err: &Error) -> bool {
    matches!(err, Error::Pool(_) | Error::Connection(_))
        || matches!(
            err,
            Error::Diesel(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::ClosedConnection,
                _
            ))
        )
}
