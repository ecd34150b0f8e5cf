use alloy::primitives::{Address, Bytes};
use alloy::rpc::client::RpcClient;
use alloy::transports::TransportResult;
use alloy::transports::http::reqwest::Url;

/// JSON-RPC client for an ERC-4337 bundler endpoint.
///
/// The relay treats user operations as opaque payloads: it submits them and
/// tracks the returned userop hash. Building and gas-pricing a user operation
/// is the caller's concern.
#[derive(Debug, Clone)]
pub struct BundlerClient {
    inner: RpcClient,
}

impl BundlerClient {
    pub fn new(url: Url) -> Self {
        Self {
            inner: RpcClient::builder().http(url),
        }
    }

    /// Submit a user operation; returns the userop hash assigned by the bundler.
    pub async fn send_user_op(
        &self,
        user_op: &serde_json::Value,
        entrypoint: Address,
    ) -> TransportResult<Bytes> {
        self.inner
            .request("eth_sendUserOperation", (user_op, entrypoint))
            .await
    }

    /// Fetch the receipt for a previously submitted user operation, if mined.
    pub async fn get_user_op_receipt(
        &self,
        user_op_hash: Bytes,
    ) -> TransportResult<Option<serde_json::Value>> {
        self.inner
            .request("eth_getUserOperationReceipt", [user_op_hash])
            .await
    }
}
