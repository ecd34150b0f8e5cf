use alloy::transports::{RpcError as AlloyRpcError, TransportErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::Chain;

/// Serializable mirror of the JSON-RPC error payload returned by a node.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RpcErrorResponse {
    pub code: i64,
    pub message: String,
    pub data: Option<String>,
}

impl RpcErrorResponse {
    pub fn as_display(&self) -> String {
        format!(
            "code {}: {}{}",
            self.code,
            self.message,
            self.data
                .as_ref()
                .map(|data| format!(", data: {data}"))
                .unwrap_or_default()
        )
    }
}

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorKind {
    /// Server returned an error response.
    #[error("server returned an error response: code {}", .0.code)]
    ErrorResp(RpcErrorResponse),

    /// Server returned a null response when a non-null response was expected.
    #[error("server returned a null response when a non-null response was expected")]
    NullResp,

    #[error("unsupported feature: {message}")]
    UnsupportedFeature { message: String },

    /// Local pre-processing failed before the request left the process.
    #[error("local usage error: {message}")]
    InternalError { message: String },

    #[error("serialization error: {message}")]
    SerError { message: String },

    #[error("deserialization error: {message}, text: {text}")]
    DeserError { message: String, text: String },

    #[error("HTTP error {status}")]
    TransportHttpError { status: u16, body: String },

    #[error("other transport error: {message}")]
    OtherTransportError { message: String },
}

impl RpcErrorKind {
    /// True when the failure happened below the JSON-RPC layer, i.e. the node
    /// may or may not have seen the request.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcErrorKind::TransportHttpError { .. } | RpcErrorKind::OtherTransportError { .. }
        )
    }
}

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayError {
    #[error("RPC error on chain {chain_id} at {rpc_url}: {message}")]
    RpcError {
        chain_id: u64,
        rpc_url: String,
        message: String,
        kind: RpcErrorKind,
    },

    #[error("Bundler error on chain {chain_id} at {rpc_url}: {message}")]
    BundlerError {
        chain_id: u64,
        rpc_url: String,
        message: String,
        kind: RpcErrorKind,
    },

    #[error("Signing error for {address}: {message}")]
    SigningError { address: String, message: String },

    #[error("Bad RPC configuration: {message}")]
    RpcConfigError { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

fn to_relay_rpc_error_kind(err: &AlloyRpcError<TransportErrorKind>) -> RpcErrorKind {
    match err {
        AlloyRpcError::ErrorResp(err) => RpcErrorKind::ErrorResp(RpcErrorResponse {
            code: err.code,
            message: err.message.to_string(),
            data: err.data.as_ref().map(|data| data.to_string()),
        }),
        AlloyRpcError::NullResp => RpcErrorKind::NullResp,
        AlloyRpcError::UnsupportedFeature(feature) => RpcErrorKind::UnsupportedFeature {
            message: feature.to_string(),
        },
        AlloyRpcError::LocalUsageError(err) => RpcErrorKind::InternalError {
            message: err.to_string(),
        },
        AlloyRpcError::SerError(err) => RpcErrorKind::SerError {
            message: err.to_string(),
        },
        AlloyRpcError::DeserError { err, text } => RpcErrorKind::DeserError {
            message: err.to_string(),
            text: text.to_string(),
        },
        AlloyRpcError::Transport(err) => match err {
            TransportErrorKind::HttpError(err) => RpcErrorKind::TransportHttpError {
                status: err.status,
                body: err.body.to_string(),
            },
            TransportErrorKind::Custom(err) => RpcErrorKind::OtherTransportError {
                message: err.to_string(),
            },
            _ => RpcErrorKind::OtherTransportError {
                message: err.to_string(),
            },
        },
    }
}

/// Attach chain context when lowering an alloy RPC error into a [`RelayError`].
pub trait AlloyRpcErrorToRelayError {
    fn to_relay_error(&self, chain: &impl Chain) -> RelayError;
    fn to_relay_bundler_error(&self, chain: &impl Chain) -> RelayError;
}

impl AlloyRpcErrorToRelayError for AlloyRpcError<TransportErrorKind> {
    fn to_relay_error(&self, chain: &impl Chain) -> RelayError {
        RelayError::RpcError {
            chain_id: chain.chain_id(),
            rpc_url: chain.rpc_url().to_string(),
            message: self.to_string(),
            kind: to_relay_rpc_error_kind(self),
        }
    }

    fn to_relay_bundler_error(&self, chain: &impl Chain) -> RelayError {
        RelayError::BundlerError {
            chain_id: chain.chain_id(),
            rpc_url: chain.bundler_url().to_string(),
            message: self.to_string(),
            kind: to_relay_rpc_error_kind(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_display_includes_data_when_present() {
        let resp = RpcErrorResponse {
            code: -32000,
            message: "nonce too low".to_string(),
            data: None,
        };
        assert_eq!(resp.as_display(), "code -32000: nonce too low");

        let resp = RpcErrorResponse {
            data: Some("0x08c379a0".to_string()),
            ..resp
        };
        assert_eq!(
            resp.as_display(),
            "code -32000: nonce too low, data: 0x08c379a0"
        );
    }

    #[test]
    fn transport_kinds_are_flagged() {
        assert!(
            RpcErrorKind::TransportHttpError {
                status: 502,
                body: "bad gateway".to_string()
            }
            .is_transport()
        );
        assert!(
            !RpcErrorKind::ErrorResp(RpcErrorResponse {
                code: -32000,
                message: "execution reverted".to_string(),
                data: None
            })
            .is_transport()
        );
    }
}
