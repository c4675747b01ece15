use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("bad xid file")]
    BadXidFile,
    #[error("bad log file")]
    BadLogFile,
    #[error("bad page file")]
    BadPageFile,
    #[error("cache is full")]
    CacheFull,
    #[error("release of unreferenced key: {0}")]
    UnreferencedKey(u64),
    #[error("database is busy")]
    Busy,
    #[error("data too large: {0} bytes")]
    DataTooLarge(usize),
    #[error("page not found: {0}")]
    PageNotFound(u32),
    #[error("invalid record id: {0}")]
    InvalidRecordId(u64),
    #[error("update size mismatch: expected {expected}, got {actual}")]
    UpdateSizeMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
