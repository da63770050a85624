use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Vector not found at index {0}")]
    VectorNotFound(u64),

    #[error("Transaction {0} is not active")]
    TransactionNotActive(u64),

    #[error("Write-write conflict on vector {0}")]
    WriteConflict(u64),

    #[error("Alias not found: {0}")]
    AliasNotFound(String),

    #[error("Alias already exists: {0}")]
    AliasExists(String),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Tenant already exists: {0}")]
    TenantExists(String),

    #[error("Session not found: {0}")]
    SessionNotFound(u64),

    #[error("Subscriber not found: {0}")]
    SubscriberNotFound(usize),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(u64),

    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("Codebook is not trained")]
    NotTrained,

    #[error("Corrupt file: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
