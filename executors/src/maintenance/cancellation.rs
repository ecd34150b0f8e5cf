use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::providers::Provider;
use relayq::job::{JobResult, RequeuePosition, ToJobError};
use relayq::{BorrowedJob, DurableExecution};
use serde::{Deserialize, Serialize};

use relay_core::chain::{Chain, ChainService};
use relay_core::signer::WalletSigner;

use crate::maintenance::MaintenancePolicy;
use crate::nonce::{CANCELLATION_ID_PREFIX, NonceAllocator, RecycledNonce};
use crate::pipeline::build::TransactionAssembler;
use crate::pipeline::error::{
    BroadcastContext, BroadcastErrorClass, RelayWorkerError, classify_broadcast_error,
};
use crate::store::{PhasePatch, TransactionPhase, TransactionStore};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CancellationJobData {
    pub chain_id: u64,
    pub from: Address,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct CancellationReport {
    pub cancelled_nonces: Vec<u64>,
    pub abandoned_recycled: u32,
    pub stuck_sent: u32,
}

#[derive(Debug, Clone)]
pub enum CancelDisposition {
    /// A no-op now occupies the nonce; resync finalizes once it lands.
    Submitted { hash: String },
    Skipped { reason: String },
}

/// True when a recycled nonce has sat unused long enough to count as
/// abandoned.
pub fn is_abandoned(recycled: &RecycledNonce, now_ms: u64, abandoned_after_ms: u64) -> bool {
    now_ms.saturating_sub(recycled.recycled_at) >= abandoned_after_ms
}

/// Consumes dead nonces with minimal self-transfers so later nonces become
/// mineable. Shared by the periodic sweep and the synchronous admin unblock.
pub struct NonceCanceller<CS, S>
where
    CS: ChainService + 'static,
    S: WalletSigner,
{
    pub store: Arc<TransactionStore>,
    pub nonces: Arc<NonceAllocator>,
    pub chains: Arc<CS>,
    pub signer: Arc<S>,
    pub policy: MaintenancePolicy,
}

impl<CS, S> Clone for NonceCanceller<CS, S>
where
    CS: ChainService + 'static,
    S: WalletSigner,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            nonces: self.nonces.clone(),
            chains: self.chains.clone(),
            signer: self.signer.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<CS, S> NonceCanceller<CS, S>
where
    CS: ChainService + 'static,
    S: WalletSigner,
{
    /// Submit a high-fee no-op at exactly `nonce`.
    pub async fn cancel_nonce(
        &self,
        chain: &CS::Chain,
        chain_id: u64,
        from: Address,
        nonce: u64,
    ) -> Result<CancelDisposition, RelayWorkerError> {
        let assembler = TransactionAssembler {
            chain,
            signer: self.signer.as_ref(),
            sender: from,
        };

        let (signed, _fees) = assembler
            .build_noop(nonce, self.policy.cancellation_bump_percent)
            .await?;
        let hash = signed.hash().to_string();

        let result = chain.provider().send_tx_envelope(signed.into()).await;
        match result {
            Ok(_) => {}
            Err(e) => match classify_broadcast_error(&e, BroadcastContext::Rebroadcast) {
                // "nonce too low" here means the slot resolved itself while
                // we were sweeping; either way it is no longer blocking.
                BroadcastErrorClass::PossiblySent => {}
                BroadcastErrorClass::Rejected | BroadcastErrorClass::Unknown => {
                    tracing::warn!(nonce, error = %e, "cancellation broadcast failed");
                    return Ok(CancelDisposition::Skipped {
                        reason: e.to_string(),
                    });
                }
            },
        }

        self.nonces
            .mark_sent(
                chain_id,
                from,
                nonce,
                &format!("{CANCELLATION_ID_PREFIX}{hash}"),
            )
            .await?;

        tracing::info!(nonce, hash = %hash, "cancellation no-op submitted");
        Ok(CancelDisposition::Submitted { hash })
    }

    /// Administrative unblock: consume every unconfirmed nonce up to and
    /// including `to_nonce`. Sent records at those nonces move to
    /// `cancelled`. Returns the nonces a no-op was submitted for.
    pub async fn cancel_nonces_up_to(
        &self,
        chain_id: u64,
        from: Address,
        to_nonce: u64,
    ) -> Result<Vec<u64>, RelayWorkerError> {
        let chain =
            self.chains
                .get_chain(chain_id)
                .map_err(|e| RelayWorkerError::ChainServiceError {
                    chain_id,
                    message: format!("failed to get chain: {e}"),
                })?;

        let snapshot = self.nonces.snapshot(chain_id, from).await?;
        let confirmed = snapshot.confirmed_count.unwrap_or(0);
        let mut cancelled = Vec::new();

        for recycled in &snapshot.recycled {
            if recycled.nonce > to_nonce || recycled.nonce < confirmed {
                continue;
            }
            if let CancelDisposition::Submitted { .. } = self
                .cancel_nonce(&chain, chain_id, from, recycled.nonce)
                .await?
            {
                cancelled.push(recycled.nonce);
            }
        }

        for entry in &snapshot.sent {
            if entry.nonce > to_nonce || entry.nonce < confirmed || entry.is_cancellation() {
                continue;
            }
            if let CancelDisposition::Submitted { .. } = self
                .cancel_nonce(&chain, chain_id, from, entry.nonce)
                .await?
            {
                let patch = PhasePatch::MarkCancelled {
                    at: TransactionStore::now_ms(),
                };
                self.store.transition(&entry.queue_id, patch).await?;
                cancelled.push(entry.nonce);
            }
        }

        cancelled.sort_unstable();
        Ok(cancelled)
    }
}

/// Periodic sweep for nonces blocking forward progress: recycled slots past
/// their abandonment expiry and sent records whose resend budget ran out.
pub struct StuckNonceJobHandler<CS, S>
where
    CS: ChainService + 'static,
    S: WalletSigner,
{
    pub canceller: NonceCanceller<CS, S>,
}

impl<CS, S> DurableExecution for StuckNonceJobHandler<CS, S>
where
    CS: ChainService + 'static,
    S: WalletSigner,
{
    type Output = CancellationReport;
    type ErrorData = RelayWorkerError;
    type JobData = CancellationJobData;

    #[tracing::instrument(
        name = "stuck_nonce_worker",
        skip_all,
        fields(chain_id = job.job.data.chain_id, sender = %job.job.data.from)
    )]
    async fn process(
        &self,
        job: &BorrowedJob<CancellationJobData>,
    ) -> JobResult<CancellationReport, RelayWorkerError> {
        let data = &job.job.data;
        let canceller = &self.canceller;

        let chain = canceller.chains.get_chain(data.chain_id).map_err(|e| {
            RelayWorkerError::ChainServiceError {
                chain_id: data.chain_id,
                message: format!("failed to get chain: {e}"),
            }
            .nack(Some(Duration::from_secs(10)), RequeuePosition::Last)
        })?;

        let snapshot = canceller
            .nonces
            .snapshot(data.chain_id, data.from)
            .await
            .map_err(|e| Into::<RelayWorkerError>::into(e).handle())?;

        let confirmed = snapshot.confirmed_count.unwrap_or(0);
        let now = TransactionStore::now_ms();
        let mut report = CancellationReport::default();

        for recycled in &snapshot.recycled {
            if recycled.nonce < confirmed {
                continue;
            }
            if !is_abandoned(recycled, now, canceller.policy.abandoned_after_ms) {
                continue;
            }

            if let CancelDisposition::Submitted { .. } = canceller
                .cancel_nonce(&chain, data.chain_id, data.from, recycled.nonce)
                .await
                .map_err(|e| e.handle())?
            {
                report.cancelled_nonces.push(recycled.nonce);
                report.abandoned_recycled += 1;
            }
        }

        for entry in &snapshot.sent {
            if entry.nonce < confirmed || entry.is_cancellation() {
                continue;
            }

            let record = canceller
                .store
                .get(&entry.queue_id)
                .await
                .map_err(|e| Into::<RelayWorkerError>::into(e).handle())?;

            let stuck = matches!(
                record.as_ref().map(|r| &r.phase),
                Some(TransactionPhase::Sent(sent))
                    if sent.resend_count >= canceller.policy.max_resends
            );
            if !stuck {
                continue;
            }

            if let CancelDisposition::Submitted { .. } = canceller
                .cancel_nonce(&chain, data.chain_id, data.from, entry.nonce)
                .await
                .map_err(|e| e.handle())?
            {
                // The record stays `sent`; once the no-op lands, resync will
                // error it as consumed-by-other-hash.
                report.cancelled_nonces.push(entry.nonce);
                report.stuck_sent += 1;
            }
        }

        if !report.cancelled_nonces.is_empty() {
            tracing::info!(
                cancelled = ?report.cancelled_nonces,
                abandoned_recycled = report.abandoned_recycled,
                stuck_sent = report.stuck_sent,
                "stuck-nonce sweep submitted cancellations"
            );
        }

        // Periodic job: park until the next sweep.
        Err(RelayWorkerError::CancellationCycleComplete { report }.nack(
            Some(canceller.policy.cancellation_interval),
            RequeuePosition::Last,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abandonment_is_measured_from_recycle_time() {
        let recycled = RecycledNonce {
            nonce: 5,
            recycled_at: 1_000,
        };
        assert!(!is_abandoned(&recycled, 1_500, 1_000));
        assert!(is_abandoned(&recycled, 2_000, 1_000));
        assert!(is_abandoned(&recycled, 5_000, 1_000));
    }
}
