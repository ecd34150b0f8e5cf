use std::time::Duration;

use alloy::transports::{RpcError, TransportErrorKind};
use relayq::job::{JobError, RequeuePosition};
use serde::{Deserialize, Serialize};

use relay_core::error::{RelayError, RpcErrorKind};

use crate::maintenance::{CancellationReport, ResyncReport};
use crate::nonce::NonceStoreError;
use crate::store::TransactionStoreError;

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum RelayWorkerError {
    #[error("Chain service error for chain {chain_id}: {message}")]
    ChainServiceError { chain_id: u64, message: String },

    #[error("Store error: {message}")]
    StoreError {
        message: String,
        inner: TransactionStoreError,
    },

    #[error("Nonce store error: {message}")]
    NonceError {
        message: String,
        inner: NonceStoreError,
    },

    #[error("Transaction not found: {queue_id}")]
    TransactionNotFound { queue_id: String },

    #[error("Transaction simulation failed: {message}")]
    SimulationFailed { message: String, inner: RelayError },

    #[error("Transaction build failed: {message}")]
    BuildFailed { message: String },

    #[error("RPC error: {message}")]
    RpcError { message: String, inner: RelayError },

    #[error("Broadcast rejected: {message}")]
    BroadcastRejected { message: String, inner: RelayError },

    #[error("Broadcast outcome unknown: {message}")]
    BroadcastOutcomeUnknown { message: String, inner: RelayError },

    #[error("Signing failed: {message}")]
    SigningError { message: String, inner: RelayError },

    #[error("No receipt yet for {queue_id}, still watching")]
    ReceiptPending { queue_id: String },

    #[error("Resend budget exhausted for {queue_id} at nonce {nonce}")]
    ResendsExhausted { queue_id: String, nonce: u64 },

    #[error("Nonce {nonce} consumed but no receipt located for {queue_id}; resync will resolve")]
    ReceiptUnavailable { queue_id: String, nonce: u64 },

    #[error("Resync cycle complete, rescheduled")]
    ResyncCycleComplete { report: ResyncReport },

    #[error("Cancellation sweep complete, rescheduled")]
    CancellationCycleComplete { report: CancellationReport },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl From<TransactionStoreError> for RelayWorkerError {
    fn from(error: TransactionStoreError) -> Self {
        RelayWorkerError::StoreError {
            message: error.to_string(),
            inner: error,
        }
    }
}

impl From<NonceStoreError> for RelayWorkerError {
    fn from(error: NonceStoreError) -> Self {
        RelayWorkerError::NonceError {
            message: error.to_string(),
            inner: error,
        }
    }
}

impl From<relayq::QueueError> for RelayWorkerError {
    fn from(error: relayq::QueueError) -> Self {
        RelayWorkerError::InternalError {
            message: format!("queue error: {error}"),
        }
    }
}

impl RelayWorkerError {
    /// Default disposition: transient conditions nack with a delay,
    /// deterministic ones fail the job.
    pub fn handle(self) -> JobError<RelayWorkerError> {
        let retryable = matches!(
            self,
            RelayWorkerError::ChainServiceError { .. }
                | RelayWorkerError::StoreError { .. }
                | RelayWorkerError::NonceError { .. }
        ) || is_retryable_preparation_error(&self);

        if retryable {
            JobError::Nack {
                error: self,
                delay: Some(Duration::from_secs(10)),
                position: RequeuePosition::Last,
            }
        } else {
            JobError::Fail(self)
        }
    }
}

/// What a failed `sendRawTransaction` tells us about the nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastErrorClass {
    /// The payload may already be in the mempool ("nonce too low",
    /// "already known", …). Treat like an accepted broadcast.
    PossiblySent,
    /// The node deterministically refused the payload before it entered the
    /// mempool; the nonce was never offered to the network.
    Rejected,
    /// The failure happened below the JSON-RPC layer; whether the node saw
    /// the payload is unknowable from here.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastContext {
    Initial,
    Rebroadcast,
}

/// Classify an error *response* from the node. Transport failures never get
/// here; the caller maps those to [`BroadcastErrorClass::Unknown`].
pub fn classify_error_response(message: &str, context: BroadcastContext) -> BroadcastErrorClass {
    let message = message.to_lowercase();

    // The payload (or one with this nonce) is already in the pool.
    if message.contains("nonce too low")
        || message.contains("already known")
        || message.contains("already imported")
        || message.contains("replacement transaction underpriced")
        || message.contains("duplicate transaction")
    {
        return BroadcastErrorClass::PossiblySent;
    }

    // Deterministic refusals that cannot have consumed the nonce.
    // "insufficient funds" is only deterministic on the first offer; during a
    // rebroadcast the original may already sit in the pool.
    if message.contains("invalid signature")
        || message.contains("malformed")
        || message.contains("invalid transaction format")
        || message.contains("nonce too high")
        || message.contains("intrinsic gas too low")
        || message.contains("exceeds block gas limit")
        || message.contains("oversized")
        || (context == BroadcastContext::Initial && message.contains("insufficient funds"))
    {
        return BroadcastErrorClass::Rejected;
    }

    tracing::warn!(
        error = %message,
        "unrecognized broadcast error response, assuming possibly sent"
    );

    // An unrecognized refusal must not recycle the nonce: if the payload did
    // enter the pool, reusing its nonce would double-spend the slot.
    BroadcastErrorClass::PossiblySent
}

pub fn classify_broadcast_error(
    error: &RpcError<TransportErrorKind>,
    context: BroadcastContext,
) -> BroadcastErrorClass {
    if !error.is_error_resp() {
        return BroadcastErrorClass::Unknown;
    }
    classify_error_response(&error.to_string(), context)
}

pub fn is_retryable_rpc_error(kind: &RpcErrorKind) -> bool {
    match kind {
        RpcErrorKind::TransportHttpError { status, .. } if *status >= 400 && *status < 500 => false,
        RpcErrorKind::UnsupportedFeature { .. } => false,
        RpcErrorKind::ErrorResp(resp) => {
            let message = resp.message.to_lowercase();
            !(message.contains("invalid chain") || message.contains("invalid opcode"))
        }
        _ => true,
    }
}

/// Whether a failure during gas resolution, build or signing is worth another
/// attempt, or the intent is deterministically broken.
pub fn is_retryable_preparation_error(error: &RelayWorkerError) -> bool {
    match error {
        RelayWorkerError::RpcError { inner, .. } => match inner {
            RelayError::RpcError { kind, .. } | RelayError::BundlerError { kind, .. } => {
                is_retryable_rpc_error(kind)
            }
            _ => false,
        },
        RelayWorkerError::SimulationFailed { .. } => false,
        RelayWorkerError::BuildFailed { .. } => false,
        RelayWorkerError::SigningError { .. } => false,
        _ => false,
    }
}

pub fn is_unsupported_eip1559_error(error: &RpcError<TransportErrorKind>) -> bool {
    if let RpcError::UnsupportedFeature(_) = error {
        return true;
    }

    if let RpcError::ErrorResp(resp) = error {
        let message = resp.message.to_lowercase();
        return message.contains("method not found");
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mempool_presence_markers_classify_as_possibly_sent() {
        for message in [
            "nonce too low",
            "ALREADY KNOWN",
            "replacement transaction underpriced",
            "transaction already imported",
        ] {
            assert_eq!(
                classify_error_response(message, BroadcastContext::Initial),
                BroadcastErrorClass::PossiblySent,
                "{message}"
            );
        }
    }

    #[test]
    fn deterministic_refusals_classify_as_rejected() {
        for message in [
            "invalid signature",
            "malformed transaction",
            "nonce too high",
            "intrinsic gas too low",
            "oversized data",
        ] {
            assert_eq!(
                classify_error_response(message, BroadcastContext::Initial),
                BroadcastErrorClass::Rejected,
                "{message}"
            );
        }
    }

    #[test]
    fn insufficient_funds_is_only_deterministic_on_first_offer() {
        assert_eq!(
            classify_error_response(
                "insufficient funds for gas * price + value",
                BroadcastContext::Initial
            ),
            BroadcastErrorClass::Rejected
        );
        // On a rebroadcast the first offer may already be pooled; recycling
        // the nonce here could double-assign it.
        assert_eq!(
            classify_error_response(
                "insufficient funds for gas * price + value",
                BroadcastContext::Rebroadcast
            ),
            BroadcastErrorClass::PossiblySent
        );
    }

    #[test]
    fn unrecognized_responses_default_to_possibly_sent() {
        assert_eq!(
            classify_error_response("some new geth error", BroadcastContext::Initial),
            BroadcastErrorClass::PossiblySent
        );
    }

    #[test]
    fn client_errors_and_unsupported_features_are_not_retryable() {
        assert!(!is_retryable_rpc_error(
            &RpcErrorKind::TransportHttpError {
                status: 401,
                body: "unauthorized".to_string(),
            }
        ));
        assert!(!is_retryable_rpc_error(&RpcErrorKind::UnsupportedFeature {
            message: "eth_feeHistory".to_string(),
        }));
        assert!(is_retryable_rpc_error(&RpcErrorKind::TransportHttpError {
            status: 503,
            body: "overloaded".to_string(),
        }));
        assert!(is_retryable_rpc_error(&RpcErrorKind::OtherTransportError {
            message: "connection reset".to_string(),
        }));
    }
}
