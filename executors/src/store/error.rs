use serde::{Deserialize, Serialize};

use crate::store::phase::TransactionStatus;

#[derive(Debug, thiserror::Error, Serialize, Deserialize, Clone)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum TransactionStoreError {
    #[error("Redis error: {message}")]
    RedisError { message: String },

    #[error("Serialization error: {message}")]
    SerializationError { message: String },

    #[error("Transaction not found: {queue_id}")]
    TransactionNotFound { queue_id: String },

    #[error("Transition {patch} is not legal from status {from}")]
    IllegalTransition {
        queue_id: String,
        from: TransactionStatus,
        patch: String,
    },

    #[error("Exceeded retries for atomic operation: {operation}")]
    WatchRetriesExhausted { operation: String },

    #[error("Queue error: {message}")]
    QueueError { message: String },
}

impl From<relayq::redis::RedisError> for TransactionStoreError {
    fn from(error: relayq::redis::RedisError) -> Self {
        TransactionStoreError::RedisError {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for TransactionStoreError {
    fn from(error: serde_json::Error) -> Self {
        TransactionStoreError::SerializationError {
            message: error.to_string(),
        }
    }
}

impl From<relayq::QueueError> for TransactionStoreError {
    fn from(error: relayq::QueueError) -> Self {
        TransactionStoreError::QueueError {
            message: error.to_string(),
        }
    }
}
