use std::sync::Arc;
use std::time::Duration;

use alloy::eips::BlockNumberOrTag;
use alloy::network::{ReceiptResponse, TransactionResponse};
use alloy::primitives::{Address, B256};
use alloy::providers::Provider;
use alloy::rpc::types::TransactionReceipt;
use relayq::job::{JobResult, RequeuePosition, ToJobError};
use relayq::{BorrowedJob, DurableExecution};
use serde::{Deserialize, Serialize};

use relay_core::chain::{Chain, ChainService};
use relay_core::constants::DEFAULT_CONFIRMATION_TIMEOUT_SECONDS;
use relay_core::error::AlloyRpcErrorToRelayError;
use relay_core::signer::WalletSigner;
use relay_core::transaction::ExecutionMode;

use crate::nonce::NonceAllocator;
use crate::pipeline::build::TransactionAssembler;
use crate::pipeline::error::{
    BroadcastContext, BroadcastErrorClass, RelayWorkerError, classify_broadcast_error,
    is_retryable_preparation_error,
};
use crate::store::{
    MinedReceipt, PhasePatch, QueuedTransaction, SentPhase, TransactionPhase, TransactionStatus,
    TransactionStore, TransitionOutcome,
};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmJobData {
    pub queue_id: String,
    pub chain_id: u64,
    pub from: Address,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ConfirmJobOutput {
    Mined {
        nonce: u64,
        hash: String,
        onchain_success: bool,
    },
    /// Resend budget spent; the record stays `sent` and stuck-nonce
    /// cancellation takes it from here.
    LeftForMaintenance { nonce: u64, resend_count: u32 },
    AlreadyResolved { status: TransactionStatus },
}

#[derive(Debug, Clone)]
pub struct ConfirmPolicy {
    pub poll_delay: Duration,
    pub default_timeout_seconds: u64,
    pub max_resends: u32,
    /// Fee multiplier for a resend, in percent. 120 = +20%.
    pub bump_percent: u32,
    /// How many recent blocks to scan when the nonce is consumed but no
    /// tracked hash has a receipt.
    pub receipt_scan_depth: u64,
    /// Scan rounds before deferring an unlocatable receipt to resync.
    pub max_receipt_scans: u32,
}

impl Default for ConfirmPolicy {
    fn default() -> Self {
        Self {
            poll_delay: Duration::from_secs(5),
            default_timeout_seconds: DEFAULT_CONFIRMATION_TIMEOUT_SECONDS,
            max_resends: 3,
            bump_percent: 120,
            receipt_scan_depth: 12,
            max_receipt_scans: 3,
        }
    }
}

/// Polls for receipts of broadcast transactions; escalates fees at the same
/// nonce when a receipt does not appear within the record's timeout.
pub struct ConfirmJobHandler<CS, S>
where
    CS: ChainService + 'static,
    S: WalletSigner,
{
    pub store: Arc<TransactionStore>,
    pub nonces: Arc<NonceAllocator>,
    pub chains: Arc<CS>,
    pub signer: Arc<S>,
    pub policy: ConfirmPolicy,
}

impl<CS, S> DurableExecution for ConfirmJobHandler<CS, S>
where
    CS: ChainService + 'static,
    S: WalletSigner,
{
    type Output = ConfirmJobOutput;
    type ErrorData = RelayWorkerError;
    type JobData = ConfirmJobData;

    #[tracing::instrument(
        name = "confirm_worker",
        skip_all,
        fields(
            queue_id = %job.job.data.queue_id,
            chain_id = job.job.data.chain_id,
            sender = %job.job.data.from,
        )
    )]
    async fn process(
        &self,
        job: &BorrowedJob<ConfirmJobData>,
    ) -> JobResult<ConfirmJobOutput, RelayWorkerError> {
        let data = &job.job.data;

        let record = match self.store.get(&data.queue_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(RelayWorkerError::TransactionNotFound {
                    queue_id: data.queue_id.clone(),
                }
                .fail());
            }
            Err(e) => return Err(Into::<RelayWorkerError>::into(e).handle()),
        };

        let sent = match &record.phase {
            TransactionPhase::Sent(sent) => sent.clone(),
            _ => {
                return Ok(ConfirmJobOutput::AlreadyResolved {
                    status: record.status(),
                });
            }
        };

        let chain = self.chains.get_chain(data.chain_id).map_err(|e| {
            RelayWorkerError::ChainServiceError {
                chain_id: data.chain_id,
                message: format!("failed to get chain: {e}"),
            }
            .nack(Some(Duration::from_secs(10)), RequeuePosition::Last)
        })?;

        // 1. Look for a receipt on any hash ever broadcast for this record,
        // newest attempt first: a resend superseding the original is the
        // common case after a fee bump.
        if record.execution_mode == ExecutionMode::Eoa {
            if let Some((hash, receipt)) = self
                .find_tracked_receipt(&chain, &sent)
                .await
                .map_err(|e| e.handle())?
            {
                return self
                    .finalize_mined(data, sent.nonce, hash, mined_receipt(&receipt))
                    .await;
            }
        } else if let Some(output) = self
            .try_user_op_receipt(&chain, data, &sent)
            .await
            .map_err(|e| e.handle())?
        {
            return Ok(output);
        }

        // 2. No tracked hash has a receipt. If the chain's account nonce has
        // moved past ours, the slot was consumed; find out by whom.
        let chain_count = chain
            .provider()
            .get_transaction_count(data.from)
            .latest()
            .await
            .map_err(|e| {
                let inner = e.to_relay_error(&chain);
                RelayWorkerError::RpcError {
                    message: format!("failed to fetch transaction count: {inner}"),
                    inner,
                }
                .nack(Some(self.policy.poll_delay), RequeuePosition::Last)
            })?;

        if chain_count > sent.nonce {
            // Consumed, but not by any hash we know. Re-query recent blocks
            // for the sender's transaction at this nonce rather than trusting
            // only local bookkeeping: a resend may have lost the race in a
            // way that still mined our payload under an unindexed hash.
            if record.execution_mode == ExecutionMode::Eoa {
                if let Some((hash, receipt)) = self
                    .scan_recent_blocks(&chain, data.from, sent.nonce)
                    .await
                    .map_err(|e| e.handle())?
                {
                    return self
                        .finalize_mined(data, sent.nonce, hash, mined_receipt(&receipt))
                        .await;
                }
            }

            if job.job.attempts > self.policy.max_receipt_scans {
                // Resync owns this record now; it will error it out if no
                // receipt ever surfaces.
                return Err(RelayWorkerError::ReceiptUnavailable {
                    queue_id: data.queue_id.clone(),
                    nonce: sent.nonce,
                }
                .fail());
            }

            return Err(RelayWorkerError::ReceiptPending {
                queue_id: data.queue_id.clone(),
            }
            .nack(Some(self.policy.poll_delay), RequeuePosition::Last));
        }

        // 3. Still waiting for inclusion.
        let timeout_ms = record
            .timeout_seconds
            .unwrap_or(self.policy.default_timeout_seconds)
            * 1000;
        let waited_ms = TransactionStore::now_ms().saturating_sub(sent.last_attempt_at);

        if waited_ms < timeout_ms {
            return Err(RelayWorkerError::ReceiptPending {
                queue_id: data.queue_id.clone(),
            }
            .nack(Some(self.policy.poll_delay), RequeuePosition::Last));
        }

        if sent.resend_count >= self.policy.max_resends {
            tracing::warn!(
                nonce = sent.nonce,
                resend_count = sent.resend_count,
                "resend budget exhausted, leaving record for maintenance"
            );
            return Ok(ConfirmJobOutput::LeftForMaintenance {
                nonce: sent.nonce,
                resend_count: sent.resend_count,
            });
        }

        // Bundler-managed submissions have no replace-by-fee lever to pull.
        if record.execution_mode != ExecutionMode::Eoa {
            return Err(RelayWorkerError::ReceiptPending {
                queue_id: data.queue_id.clone(),
            }
            .nack(Some(self.policy.poll_delay), RequeuePosition::Last));
        }

        self.resend_with_higher_fee(&chain, data, &record, &sent).await
    }
}

impl<CS, S> ConfirmJobHandler<CS, S>
where
    CS: ChainService + 'static,
    S: WalletSigner,
{
    async fn find_tracked_receipt(
        &self,
        chain: &CS::Chain,
        sent: &SentPhase,
    ) -> Result<Option<(String, TransactionReceipt)>, RelayWorkerError> {
        let lookups: Vec<_> = sent
            .sent_hashes
            .iter()
            .rev()
            .filter_map(|hash| match hash.parse::<B256>() {
                Ok(parsed) => Some(async move {
                    let receipt = chain.provider().get_transaction_receipt(parsed).await;
                    (hash.clone(), receipt)
                }),
                Err(_) => {
                    tracing::warn!(hash = %hash, "skipping malformed tracked hash");
                    None
                }
            })
            .collect();

        for (hash, result) in futures::future::join_all(lookups).await {
            match result {
                Ok(Some(receipt)) => return Ok(Some((hash, receipt))),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(hash = %hash, error = %e, "receipt lookup failed");
                }
            }
        }

        Ok(None)
    }

    /// Walk recent blocks looking for the sender's transaction at `nonce`.
    async fn scan_recent_blocks(
        &self,
        chain: &CS::Chain,
        sender: Address,
        nonce: u64,
    ) -> Result<Option<(String, TransactionReceipt)>, RelayWorkerError> {
        use alloy::consensus::Transaction as _;

        let latest = chain.provider().get_block_number().await.map_err(|e| {
            let inner = e.to_relay_error(chain);
            RelayWorkerError::RpcError {
                message: format!("failed to fetch block number: {inner}"),
                inner,
            }
        })?;

        for offset in 0..self.policy.receipt_scan_depth {
            let Some(number) = latest.checked_sub(offset) else {
                break;
            };

            let block = match chain
                .provider()
                .get_block_by_number(BlockNumberOrTag::Number(number))
                .full()
                .await
            {
                Ok(Some(block)) => block,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(block = number, error = %e, "block fetch failed during scan");
                    continue;
                }
            };

            for tx in block.transactions.txns() {
                if tx.from() == sender && tx.nonce() == nonce {
                    let hash = tx.tx_hash();
                    match chain.provider().get_transaction_receipt(hash).await {
                        Ok(Some(receipt)) => {
                            tracing::info!(
                                nonce = nonce,
                                hash = %hash,
                                block = number,
                                "located consuming transaction via block scan"
                            );
                            return Ok(Some((hash.to_string(), receipt)));
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::debug!(hash = %hash, error = %e, "receipt fetch failed");
                        }
                    }
                }
            }
        }

        Ok(None)
    }

    async fn try_user_op_receipt(
        &self,
        chain: &CS::Chain,
        data: &ConfirmJobData,
        sent: &SentPhase,
    ) -> Result<Option<ConfirmJobOutput>, RelayWorkerError> {
        let Some(hash) = sent.sent_hashes.last() else {
            return Ok(None);
        };
        let hash_bytes: alloy::primitives::Bytes =
            hash.parse().map_err(|_| RelayWorkerError::InternalError {
                message: format!("malformed user operation hash '{hash}'"),
            })?;

        let receipt = chain
            .bundler_client()
            .get_user_op_receipt(hash_bytes)
            .await
            .map_err(|e| {
                let inner = e.to_relay_bundler_error(chain);
                RelayWorkerError::RpcError {
                    message: format!("failed to fetch user operation receipt: {inner}"),
                    inner,
                }
            })?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };

        let mined = user_op_mined_receipt(&receipt);

        self.finalize_mined(data, sent.nonce, hash.clone(), mined)
            .await
            .map(Some)
            .map_err(|e| match e {
                relayq::job::JobError::Nack { error, .. }
                | relayq::job::JobError::Fail(error) => error,
            })
    }

    async fn finalize_mined(
        &self,
        data: &ConfirmJobData,
        nonce: u64,
        hash: String,
        receipt: MinedReceipt,
    ) -> JobResult<ConfirmJobOutput, RelayWorkerError> {
        let onchain_success = receipt.onchain_success;

        self.nonces
            .mark_consumed(data.chain_id, data.from, nonce)
            .await
            .map_err(|e| Into::<RelayWorkerError>::into(e).handle())?;

        let patch = PhasePatch::MarkMined {
            hash: hash.clone(),
            receipt,
            at: TransactionStore::now_ms(),
        };

        match self.store.transition(&data.queue_id, patch).await {
            Ok(TransitionOutcome::Applied(_)) => {
                tracing::info!(
                    nonce = nonce,
                    hash = %hash,
                    onchain_success = onchain_success,
                    "transaction mined"
                );
                Ok(ConfirmJobOutput::Mined {
                    nonce,
                    hash,
                    onchain_success,
                })
            }
            Ok(TransitionOutcome::Stale { actual }) => {
                Ok(ConfirmJobOutput::AlreadyResolved { status: actual })
            }
            Err(e) => Err(Into::<RelayWorkerError>::into(e).handle()),
        }
    }

    /// Re-sign the intent at the same nonce with strictly higher fees and
    /// broadcast the replacement.
    async fn resend_with_higher_fee(
        &self,
        chain: &CS::Chain,
        data: &ConfirmJobData,
        record: &QueuedTransaction,
        sent: &SentPhase,
    ) -> JobResult<ConfirmJobOutput, RelayWorkerError> {
        let assembler = TransactionAssembler {
            chain,
            signer: self.signer.as_ref(),
            sender: data.from,
        };

        let built = assembler
            .build_and_sign(
                &record.intent,
                sent.nonce,
                Some(sent.last_fees),
                self.policy.bump_percent,
            )
            .await;

        let (signed, fees) = match built {
            Ok(built) => built,
            Err(e) if is_retryable_preparation_error(&e) => {
                return Err(e.nack(Some(self.policy.poll_delay), RequeuePosition::Last));
            }
            Err(e) => {
                // The intent no longer builds (e.g. simulation now reverts).
                // The nonce still has a payload in flight; keep watching and
                // let cancellation consume the slot if nothing lands.
                tracing::warn!(
                    nonce = sent.nonce,
                    error = %e,
                    "cannot build replacement, leaving record for maintenance"
                );
                return Ok(ConfirmJobOutput::LeftForMaintenance {
                    nonce: sent.nonce,
                    resend_count: sent.resend_count,
                });
            }
        };

        let hash = signed.hash().to_string();

        let broadcast = chain.provider().send_tx_envelope(signed.into()).await;
        match broadcast {
            Ok(_) => {}
            Err(e) => match classify_broadcast_error(&e, BroadcastContext::Rebroadcast) {
                // "already known" or "underpriced" both mean some payload for
                // this nonce is pooled; the original is still the candidate.
                BroadcastErrorClass::PossiblySent => {
                    tracing::debug!(error = %e, "replacement not accepted, original still pooled");
                    return Err(RelayWorkerError::ReceiptPending {
                        queue_id: data.queue_id.clone(),
                    }
                    .nack(Some(self.policy.poll_delay), RequeuePosition::Last));
                }
                BroadcastErrorClass::Rejected | BroadcastErrorClass::Unknown => {
                    let inner = e.to_relay_error(chain);
                    tracing::warn!(error = %inner, "replacement broadcast failed");
                    return Err(RelayWorkerError::ReceiptPending {
                        queue_id: data.queue_id.clone(),
                    }
                    .nack(Some(self.policy.poll_delay), RequeuePosition::Last));
                }
            },
        }

        let patch = PhasePatch::AppendResend {
            hash: hash.clone(),
            fees,
            at: TransactionStore::now_ms(),
        };

        match self.store.transition(&data.queue_id, patch).await {
            Ok(TransitionOutcome::Applied(_)) => {
                tracing::info!(
                    nonce = sent.nonce,
                    hash = %hash,
                    resend_count = sent.resend_count + 1,
                    "gas-bumped replacement broadcast"
                );
                Err(RelayWorkerError::ReceiptPending {
                    queue_id: data.queue_id.clone(),
                }
                .nack(Some(self.policy.poll_delay), RequeuePosition::Last))
            }
            Ok(TransitionOutcome::Stale { actual }) => {
                Ok(ConfirmJobOutput::AlreadyResolved { status: actual })
            }
            Err(e) => Err(Into::<RelayWorkerError>::into(e).handle()),
        }
    }
}

fn parse_hex_u64(value: &str) -> Option<u64> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16).ok()
}

/// Bundler receipts are loosely specified JSON; only inclusion and outcome
/// are extracted.
pub(crate) fn user_op_mined_receipt(receipt: &serde_json::Value) -> MinedReceipt {
    MinedReceipt {
        block_number: receipt["receipt"]["blockNumber"]
            .as_str()
            .and_then(parse_hex_u64)
            .unwrap_or_default(),
        effective_gas_price: 0,
        cumulative_gas_used: 0,
        onchain_success: receipt["success"].as_bool().unwrap_or(true),
    }
}

pub(crate) fn mined_receipt(receipt: &TransactionReceipt) -> MinedReceipt {
    use alloy::consensus::TxReceipt as _;

    MinedReceipt {
        block_number: receipt.block_number.unwrap_or_default(),
        effective_gas_price: receipt.effective_gas_price,
        cumulative_gas_used: receipt.inner.cumulative_gas_used(),
        onchain_success: receipt.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_block_numbers_parse() {
        assert_eq!(parse_hex_u64("0x10"), Some(16));
        assert_eq!(parse_hex_u64("10"), Some(16));
        assert_eq!(parse_hex_u64("0xzz"), None);
    }
}
