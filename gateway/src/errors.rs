use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Timed out waiting for device acknowledgement")]
    AckTimeout,

    #[error("Device {0} is not reachable")]
    DeviceUnavailable(String),

    #[error("Push queue for device {0} is full")]
    PushQueueFull(String),

    #[error("Config store is not connected yet")]
    StoreUnavailable,

    #[error("Change feed closed")]
    FeedClosed,
}

impl Error {
    /// Whether the connection that produced this error can keep being used.
    pub fn is_fatal_for_connection(&self) -> bool {
        !matches!(self, Error::AckTimeout)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
