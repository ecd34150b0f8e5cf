#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Runtime error: {message}")]
    Runtime { message: String },
}

impl QueueError {
    pub fn runtime(message: impl Into<String>) -> Self {
        QueueError::Runtime {
            message: message.into(),
        }
    }
}
