use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, Serialize, Deserialize, Clone)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum NonceStoreError {
    #[error("Redis error: {message}")]
    RedisError { message: String },

    #[error(
        "Nonce state for {sender} on chain {chain_id} is not seeded; sync against the chain first"
    )]
    SyncRequired { chain_id: u64, sender: Address },

    #[error("Corrupt nonce state: {message}")]
    CorruptState { message: String },
}

impl From<relayq::redis::RedisError> for NonceStoreError {
    fn from(error: relayq::redis::RedisError) -> Self {
        NonceStoreError::RedisError {
            message: error.to_string(),
        }
    }
}
