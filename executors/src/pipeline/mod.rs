pub mod build;
pub mod confirm;
pub mod error;
pub mod send;

pub use build::{TransactionAssembler, fees_from_overrides, fees_of_typed};
pub use confirm::{ConfirmJobData, ConfirmJobHandler, ConfirmJobOutput, ConfirmPolicy};
pub use error::{
    BroadcastContext, BroadcastErrorClass, RelayWorkerError, classify_broadcast_error,
    classify_error_response, is_retryable_preparation_error,
};
pub use send::{SendJobData, SendJobHandler, SendJobOutput, SendPolicy};
