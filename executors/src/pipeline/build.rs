use alloy::consensus::{SignableTransaction, Signed, TypedTransaction};
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, TxKind, U256};
use alloy::providers::Provider;
use alloy::rpc::types::TransactionRequest as AlloyTransactionRequest;
use alloy::transports::RpcError;

use relay_core::chain::Chain;
use relay_core::constants::{GAS_LIMIT_HEADROOM_PERCENT, NOOP_GAS_LIMIT};
use relay_core::error::AlloyRpcErrorToRelayError;
use relay_core::signer::{SigningOptions, WalletSigner};
use relay_core::transaction::{TransactionIntent, TransactionTypeData};

use crate::pipeline::error::{RelayWorkerError, is_unsupported_eip1559_error};
use crate::store::GasFees;

/// Builds and signs raw transactions for one sender on one chain. Shared by
/// the send worker (first broadcast), the confirmation watcher (gas-bumped
/// resends) and maintenance (cancellation no-ops).
pub struct TransactionAssembler<'a, C: Chain, S: WalletSigner> {
    pub chain: &'a C,
    pub signer: &'a S,
    pub sender: Address,
}

/// Fees of a signed payload, for bookkeeping when the original resolution is
/// no longer at hand (e.g. replaying a persisted pending broadcast).
pub fn fees_of_typed(tx: &TypedTransaction) -> GasFees {
    use alloy::consensus::Transaction as _;
    match tx.gas_price() {
        Some(gas_price) => GasFees::Legacy { gas_price },
        None => GasFees::Eip1559 {
            max_fee_per_gas: tx.max_fee_per_gas(),
            max_priority_fee_per_gas: tx.max_priority_fee_per_gas().unwrap_or_default(),
        },
    }
}

/// Explicit overrides become fees directly only when complete; partial
/// overrides go through estimation with the given pieces pinned.
pub fn fees_from_overrides(overrides: Option<&TransactionTypeData>) -> Option<GasFees> {
    match overrides {
        Some(TransactionTypeData::Legacy(data)) => {
            data.gas_price.map(|gas_price| GasFees::Legacy { gas_price })
        }
        Some(TransactionTypeData::Eip1559(data)) => {
            match (data.max_fee_per_gas, data.max_priority_fee_per_gas) {
                (Some(max_fee_per_gas), Some(max_priority_fee_per_gas)) => {
                    Some(GasFees::Eip1559 {
                        max_fee_per_gas,
                        max_priority_fee_per_gas,
                    })
                }
                _ => None,
            }
        }
        None => None,
    }
}

fn apply_fees(request: AlloyTransactionRequest, fees: GasFees) -> AlloyTransactionRequest {
    match fees {
        GasFees::Legacy { gas_price } => request.with_gas_price(gas_price),
        GasFees::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => request
            .with_max_fee_per_gas(max_fee_per_gas)
            .with_max_priority_fee_per_gas(max_priority_fee_per_gas),
    }
}

impl<C: Chain, S: WalletSigner> TransactionAssembler<'_, C, S> {
    /// Resolve the fees for an attempt: explicit overrides, else the current
    /// network estimate, then raised above `fee_floor` when resending.
    pub async fn resolve_fees(
        &self,
        overrides: Option<&TransactionTypeData>,
        fee_floor: Option<GasFees>,
        bump_percent: u32,
    ) -> Result<GasFees, RelayWorkerError> {
        let fees = match fees_from_overrides(overrides) {
            Some(fees) => fees,
            None => self.estimate_fees(overrides).await?,
        };

        Ok(match fee_floor {
            Some(previous) => previous.escalated(fees, bump_percent),
            None => fees,
        })
    }

    async fn estimate_fees(
        &self,
        overrides: Option<&TransactionTypeData>,
    ) -> Result<GasFees, RelayWorkerError> {
        match self.chain.provider().estimate_eip1559_fees().await {
            Ok(estimate) => {
                let (pinned_max, pinned_priority) = match overrides {
                    Some(TransactionTypeData::Eip1559(data)) => {
                        (data.max_fee_per_gas, data.max_priority_fee_per_gas)
                    }
                    _ => (None, None),
                };
                Ok(GasFees::Eip1559 {
                    max_fee_per_gas: pinned_max.unwrap_or(estimate.max_fee_per_gas),
                    max_priority_fee_per_gas: pinned_priority
                        .unwrap_or(estimate.max_priority_fee_per_gas),
                })
            }
            Err(e) if is_unsupported_eip1559_error(&e) => {
                tracing::debug!("EIP-1559 not supported, falling back to legacy gas price");
                let gas_price = self.chain.provider().get_gas_price().await.map_err(|e| {
                    let inner = e.to_relay_error(self.chain);
                    RelayWorkerError::RpcError {
                        message: format!("failed to get legacy gas price: {inner}"),
                        inner,
                    }
                })?;
                Ok(GasFees::Legacy { gas_price })
            }
            Err(e) => {
                let inner = e.to_relay_error(self.chain);
                Err(RelayWorkerError::RpcError {
                    message: format!("failed to estimate EIP-1559 fees: {inner}"),
                    inner,
                })
            }
        }
    }

    async fn estimate_gas_limit(
        &self,
        request: AlloyTransactionRequest,
    ) -> Result<u64, RelayWorkerError> {
        match self.chain.provider().estimate_gas(request).await {
            Ok(limit) => Ok(limit * GAS_LIMIT_HEADROOM_PERCENT / 100),
            Err(e) => {
                if let RpcError::ErrorResp(payload) = &e {
                    if let Some(revert_data) = payload.as_revert_data() {
                        return Err(RelayWorkerError::SimulationFailed {
                            message: format!(
                                "transaction reverted during gas estimation: {} (revert: {})",
                                payload.message,
                                hex::encode(&revert_data)
                            ),
                            inner: e.to_relay_error(self.chain),
                        });
                    }
                    // Some providers report reverts without revert data.
                    if payload.message.to_lowercase().contains("revert") {
                        return Err(RelayWorkerError::SimulationFailed {
                            message: format!(
                                "transaction reverted during gas estimation: {}",
                                payload.message
                            ),
                            inner: e.to_relay_error(self.chain),
                        });
                    }
                }

                let inner = e.to_relay_error(self.chain);
                Err(RelayWorkerError::RpcError {
                    message: format!("gas estimation failed: {inner}"),
                    inner,
                })
            }
        }
    }

    pub async fn build_typed(
        &self,
        intent: &TransactionIntent,
        nonce: u64,
        fee_floor: Option<GasFees>,
        bump_percent: u32,
    ) -> Result<(TypedTransaction, GasFees), RelayWorkerError> {
        let mut request = AlloyTransactionRequest::default()
            .with_from(self.sender)
            .with_value(intent.value)
            .with_input(intent.data.clone())
            .with_chain_id(self.chain.chain_id())
            .with_nonce(nonce);

        request = match intent.to {
            Some(to) => request.with_to(to),
            None => request.with_kind(TxKind::Create),
        };

        let fees = self
            .resolve_fees(intent.transaction_type_data.as_ref(), fee_floor, bump_percent)
            .await?;
        request = apply_fees(request, fees);

        request = match intent.gas_limit {
            Some(gas_limit) => request.with_gas_limit(gas_limit),
            None => {
                let gas_limit = self.estimate_gas_limit(request.clone()).await?;
                request.with_gas_limit(gas_limit)
            }
        };

        let typed = request
            .build_typed_tx()
            .map_err(|e| RelayWorkerError::BuildFailed {
                message: format!("failed to build typed transaction: {e:?}"),
            })?;

        Ok((typed, fees))
    }

    pub async fn sign(
        &self,
        typed: TypedTransaction,
    ) -> Result<Signed<TypedTransaction>, RelayWorkerError> {
        let options = SigningOptions {
            from: self.sender,
            chain_id: Some(self.chain.chain_id()),
        };

        let signature = self
            .signer
            .sign_transaction(options, &typed)
            .await
            .map_err(|e| RelayWorkerError::SigningError {
                message: format!("failed to sign transaction: {e}"),
                inner: e,
            })?;

        Ok(typed.into_signed(signature))
    }

    pub async fn build_and_sign(
        &self,
        intent: &TransactionIntent,
        nonce: u64,
        fee_floor: Option<GasFees>,
        bump_percent: u32,
    ) -> Result<(Signed<TypedTransaction>, GasFees), RelayWorkerError> {
        let (typed, fees) = self
            .build_typed(intent, nonce, fee_floor, bump_percent)
            .await?;
        let signed = self.sign(typed).await?;
        Ok((signed, fees))
    }

    /// A zero-value self-transfer whose only purpose is to consume a nonce.
    /// Fees are estimated fresh and bumped by `bump_percent` so the
    /// cancellation outbids whatever may be stuck in the pool at this slot.
    pub async fn build_noop(
        &self,
        nonce: u64,
        bump_percent: u32,
    ) -> Result<(Signed<TypedTransaction>, GasFees), RelayWorkerError> {
        let fees = self.estimate_fees(None).await?.bumped(bump_percent);

        let request = apply_fees(
            AlloyTransactionRequest::default()
                .with_from(self.sender)
                .with_to(self.sender)
                .with_value(U256::ZERO)
                .with_input(Bytes::new())
                .with_chain_id(self.chain.chain_id())
                .with_nonce(nonce)
                .with_gas_limit(NOOP_GAS_LIMIT),
            fees,
        );

        let typed = request
            .build_typed_tx()
            .map_err(|e| RelayWorkerError::BuildFailed {
                message: format!("failed to build cancellation transaction: {e:?}"),
            })?;

        let signed = self.sign(typed).await?;
        Ok((signed, fees))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::consensus::{TxEip1559, TxLegacy};
    use relay_core::transaction::{Transaction1559Data, TransactionLegacyData};

    #[test]
    fn complete_overrides_bypass_estimation() {
        let legacy = TransactionTypeData::Legacy(TransactionLegacyData {
            gas_price: Some(42),
        });
        assert_eq!(
            fees_from_overrides(Some(&legacy)),
            Some(GasFees::Legacy { gas_price: 42 })
        );

        let eip1559 = TransactionTypeData::Eip1559(Transaction1559Data {
            max_fee_per_gas: Some(100),
            max_priority_fee_per_gas: Some(2),
        });
        assert_eq!(
            fees_from_overrides(Some(&eip1559)),
            Some(GasFees::Eip1559 {
                max_fee_per_gas: 100,
                max_priority_fee_per_gas: 2
            })
        );
    }

    #[test]
    fn partial_overrides_require_estimation() {
        let partial = TransactionTypeData::Eip1559(Transaction1559Data {
            max_fee_per_gas: Some(100),
            max_priority_fee_per_gas: None,
        });
        assert_eq!(fees_from_overrides(Some(&partial)), None);

        let empty_legacy = TransactionTypeData::Legacy(TransactionLegacyData { gas_price: None });
        assert_eq!(fees_from_overrides(Some(&empty_legacy)), None);
        assert_eq!(fees_from_overrides(None), None);
    }

    #[test]
    fn fees_are_read_back_from_signed_payloads() {
        let legacy = TypedTransaction::Legacy(TxLegacy {
            gas_price: 42,
            ..Default::default()
        });
        assert_eq!(fees_of_typed(&legacy), GasFees::Legacy { gas_price: 42 });

        let eip1559 = TypedTransaction::Eip1559(TxEip1559 {
            max_fee_per_gas: 100,
            max_priority_fee_per_gas: 2,
            ..Default::default()
        });
        assert_eq!(
            fees_of_typed(&eip1559),
            GasFees::Eip1559 {
                max_fee_per_gas: 100,
                max_priority_fee_per_gas: 2
            }
        );
    }

    #[test]
    fn fee_application_sets_the_matching_request_fields() {
        let request = apply_fees(
            AlloyTransactionRequest::default(),
            GasFees::Legacy { gas_price: 7 },
        );
        assert_eq!(request.gas_price, Some(7));
        assert_eq!(request.max_fee_per_gas, None);

        let request = apply_fees(
            AlloyTransactionRequest::default(),
            GasFees::Eip1559 {
                max_fee_per_gas: 100,
                max_priority_fee_per_gas: 2,
            },
        );
        assert_eq!(request.max_fee_per_gas, Some(100));
        assert_eq!(request.max_priority_fee_per_gas, Some(2));
        assert_eq!(request.gas_price, None);
    }
}
