use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use alloy::providers::Provider;
use relayq::job::{JobResult, RequeuePosition, ToJobError};
use relayq::{BorrowedJob, DurableExecution};
use serde::{Deserialize, Serialize};

use relay_core::chain::{Chain, ChainService};
use relay_core::error::AlloyRpcErrorToRelayError;
use relay_core::transaction::ExecutionMode;

use crate::maintenance::MaintenancePolicy;
use crate::nonce::{NonceAllocator, SentNonce};
use crate::pipeline::confirm::{mined_receipt, user_op_mined_receipt};
use crate::pipeline::error::RelayWorkerError;
use crate::store::{MinedReceipt, PhasePatch, TransactionPhase, TransactionStore};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ResyncJobData {
    pub chain_id: u64,
    pub from: Address,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResyncReport {
    pub chain_transaction_count: u64,
    /// Records whose receipt was found and applied during reconciliation.
    pub applied_receipts: u32,
    /// Records errored because their nonce was consumed by means outside
    /// this system and no receipt could be located.
    pub externally_consumed: u32,
    /// Cancellation no-ops observed as landed and dropped from bookkeeping.
    pub finalized_cancellations: u32,
    /// Recycled nonces purged because the chain consumed them.
    pub dropped_recycled: u64,
}

/// Periodic reconciliation of local nonce bookkeeping against the chain.
///
/// Every in-flight nonce strictly below the chain's transaction count has
/// been consumed one way or another; this job finds out how and settles the
/// record, trusting the chain over local state in every conflict.
pub struct ResyncJobHandler<CS>
where
    CS: ChainService + 'static,
{
    pub store: Arc<TransactionStore>,
    pub nonces: Arc<NonceAllocator>,
    pub chains: Arc<CS>,
    pub policy: MaintenancePolicy,
}

impl<CS> DurableExecution for ResyncJobHandler<CS>
where
    CS: ChainService + 'static,
{
    type Output = ResyncReport;
    type ErrorData = RelayWorkerError;
    type JobData = ResyncJobData;

    #[tracing::instrument(
        name = "nonce_resync_worker",
        skip_all,
        fields(chain_id = job.job.data.chain_id, sender = %job.job.data.from)
    )]
    async fn process(
        &self,
        job: &BorrowedJob<ResyncJobData>,
    ) -> JobResult<ResyncReport, RelayWorkerError> {
        let data = &job.job.data;

        let chain = self.chains.get_chain(data.chain_id).map_err(|e| {
            RelayWorkerError::ChainServiceError {
                chain_id: data.chain_id,
                message: format!("failed to get chain: {e}"),
            }
            .nack(Some(Duration::from_secs(10)), RequeuePosition::Last)
        })?;

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
                .nack(Some(Duration::from_secs(10)), RequeuePosition::Last)
            })?;

        let consumed = self
            .nonces
            .sent_below(data.chain_id, data.from, chain_count)
            .await
            .map_err(|e| Into::<RelayWorkerError>::into(e).handle())?;

        let mut report = ResyncReport {
            chain_transaction_count: chain_count,
            ..ResyncReport::default()
        };

        for entry in consumed {
            self.reconcile_consumed_nonce(&chain, data, &entry, &mut report)
                .await
                .map_err(|e| e.handle())?;
        }

        report.dropped_recycled = self
            .nonces
            .advance_confirmed_count(data.chain_id, data.from, chain_count)
            .await
            .map_err(|e| Into::<RelayWorkerError>::into(e).handle())?;

        tracing::info!(
            chain_transaction_count = chain_count,
            applied_receipts = report.applied_receipts,
            externally_consumed = report.externally_consumed,
            finalized_cancellations = report.finalized_cancellations,
            dropped_recycled = report.dropped_recycled,
            "resync cycle complete"
        );

        // Periodic job: park in the delayed zset until the next cycle.
        Err(RelayWorkerError::ResyncCycleComplete { report }.nack(
            Some(self.policy.resync_interval),
            RequeuePosition::Last,
        ))
    }
}

impl<CS> ResyncJobHandler<CS>
where
    CS: ChainService + 'static,
{
    async fn reconcile_consumed_nonce(
        &self,
        chain: &CS::Chain,
        data: &ResyncJobData,
        entry: &SentNonce,
        report: &mut ResyncReport,
    ) -> Result<(), RelayWorkerError> {
        if entry.is_cancellation() {
            self.nonces
                .mark_consumed(data.chain_id, data.from, entry.nonce)
                .await?;
            report.finalized_cancellations += 1;
            tracing::debug!(nonce = entry.nonce, "cancellation no-op landed");
            return Ok(());
        }

        let record = self.store.get(&entry.queue_id).await?;

        let Some(record) = record else {
            self.nonces
                .mark_consumed(data.chain_id, data.from, entry.nonce)
                .await?;
            return Ok(());
        };

        match &record.phase {
            TransactionPhase::Sent(sent) => {
                let located = match record.execution_mode {
                    ExecutionMode::Eoa => self.locate_receipt(chain, &sent.sent_hashes).await,
                    ExecutionMode::Erc4337 { .. } => {
                        self.locate_user_op_receipt(chain, &sent.sent_hashes).await
                    }
                };

                match located {
                    Some((hash, receipt)) => {
                        let patch = PhasePatch::MarkMined {
                            hash,
                            receipt,
                            at: TransactionStore::now_ms(),
                        };
                        // A concurrent watcher may settle the record first;
                        // stale is fine, the chain already has one truth.
                        self.store.transition(&entry.queue_id, patch).await?;
                        report.applied_receipts += 1;
                    }
                    None => {
                        let patch = PhasePatch::MarkErrored {
                            error_message: format!(
                                "nonce {} consumed outside the relay; outcome unknown",
                                entry.nonce
                            ),
                            at: TransactionStore::now_ms(),
                        };
                        self.store.transition(&entry.queue_id, patch).await?;
                        report.externally_consumed += 1;
                        tracing::warn!(
                            queue_id = %entry.queue_id,
                            nonce = entry.nonce,
                            "nonce consumed outside the relay, record errored"
                        );
                    }
                }
            }
            _ => {
                // Already settled locally; only the bookkeeping was behind.
            }
        }

        self.nonces
            .mark_consumed(data.chain_id, data.from, entry.nonce)
            .await?;

        Ok(())
    }

    async fn locate_receipt(
        &self,
        chain: &CS::Chain,
        hashes: &[String],
    ) -> Option<(String, MinedReceipt)> {
        for hash in hashes.iter().rev() {
            let Ok(parsed) = hash.parse::<B256>() else {
                continue;
            };
            match chain.provider().get_transaction_receipt(parsed).await {
                Ok(Some(receipt)) => {
                    return Some((hash.clone(), mined_receipt(&receipt)));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(hash = %hash, error = %e, "receipt lookup failed in resync");
                }
            }
        }
        None
    }

    async fn locate_user_op_receipt(
        &self,
        chain: &CS::Chain,
        hashes: &[String],
    ) -> Option<(String, MinedReceipt)> {
        for hash in hashes.iter().rev() {
            let Ok(parsed) = hash.parse::<alloy::primitives::Bytes>() else {
                continue;
            };
            match chain.bundler_client().get_user_op_receipt(parsed).await {
                Ok(Some(receipt)) => {
                    return Some((hash.clone(), user_op_mined_receipt(&receipt)));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(hash = %hash, error = %e, "userop receipt lookup failed");
                }
            }
        }
        None
    }
}
