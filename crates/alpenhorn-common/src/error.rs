use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid byte-size string: {0:?}")]
    InvalidByteSize(String),

    #[error("no config file found in any of the standard search locations")]
    NoConfigFound,

    #[error("invalid database.url {0:?}")]
    InvalidDatabaseUrl(String),

    #[error("unknown extension: {0:?}")]
    UnknownExtension(String),

    #[error("extension {0:?} tried to register a second database capability")]
    DuplicateDatabaseCapability(String),

    #[error("duplicate capability key {key:?} registered by extension {extension:?}")]
    DuplicateCapability { key: String, extension: String },
}

pub type Result<T> = std::result::Result<T, Error>;
