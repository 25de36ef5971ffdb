use crate::key::Key;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VitrineError {
    #[error("database is not opened")]
    NotOpened,

    #[error("table \"{0}\" is not registered")]
    UnregisteredTable(String),

    #[error("duplicate primary key {key} in store \"{store}\"")]
    DuplicateKey { store: String, key: Key },

    #[error("schema error: {0}")]
    Schema(String),

    #[error("invalid row: {0}")]
    InvalidRow(String),

    #[error("write attempted in a read-only transaction")]
    ReadOnly,

    #[error("store \"{0}\" is not covered by this transaction")]
    OutOfScope(String),

    #[error("requested version {requested} is older than the stored version {current}")]
    VersionConflict { requested: u32, current: u32 },

    #[error("storage engine error: {0}")]
    Engine(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, VitrineError>;
