use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatlineError {
    #[error("Remote write failed: {0}")]
    RemoteWriteFailed(String),

    #[error("Persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("Subscription lost: {0}")]
    SubscriptionLost(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChatlineError>;
