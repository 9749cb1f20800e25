use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccrualError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Malformed accrual response: {0}")]
    MalformedResponse(#[from] serde_json::Error),
    #[error("Accrual service contract violation: {0}")]
    Contract(String),
    #[error("Storage error: {0}")]
    Storage(Box<dyn std::error::Error + Send + Sync>),
    #[error("Queue entry for order {0} is gone or not leased")]
    LeaseLost(String),
    #[error("Invalid order number: {0:?}")]
    InvalidOrderNumber(String),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Engine task failed: {0}")]
    Task(String),
}

impl AccrualError {
    pub fn storage<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage(Box::new(err))
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for AccrualError {
    fn from(err: rocksdb::Error) -> Self {
        Self::storage(err)
    }
}

#[cfg(feature = "storage-postgres")]
impl From<sqlx::Error> for AccrualError {
    fn from(err: sqlx::Error) -> Self {
        Self::storage(err)
    }
}

pub type Result<T> = std::result::Result<T, AccrualError>;
