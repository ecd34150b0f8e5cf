use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::providers::Provider;
use relayq::job::{JobError, JobResult, RequeuePosition, ToJobError};
use relayq::{BorrowedJob, DelayOptions, DurableExecution, Queue};
use serde::{Deserialize, Serialize};

use relay_core::chain::{Chain, ChainService};
use relay_core::error::AlloyRpcErrorToRelayError;
use relay_core::signer::WalletSigner;
use relay_core::transaction::ExecutionMode;

use crate::nonce::{AllocatedNonce, NonceAllocator, NonceStoreError, RecycleOutcome};
use crate::pipeline::build::{TransactionAssembler, fees_of_typed};
use crate::pipeline::confirm::{ConfirmJobData, ConfirmJobHandler};
use crate::pipeline::error::{
    BroadcastContext, BroadcastErrorClass, RelayWorkerError, classify_broadcast_error,
    is_retryable_preparation_error,
};
use crate::store::{
    BroadcastPayload, GasFees, PendingBroadcast, PhasePatch, QueuedTransaction, TransactionPhase,
    TransactionStatus, TransactionStore, TransitionOutcome,
};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SendJobData {
    pub queue_id: String,
    pub chain_id: u64,
    pub from: Address,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum SendJobOutput {
    Broadcast {
        nonce: u64,
        hash: String,
        recycled_nonce: bool,
    },
    /// A previous attempt of this job already got the payload out; nothing
    /// further to broadcast.
    AlreadyBroadcast { nonce: u64, hash: String },
    AlreadyResolved { status: TransactionStatus },
}

#[derive(Debug, Clone)]
pub struct SendPolicy {
    /// Re-offers of the same signed payload after an unknown-outcome
    /// broadcast, before handing the record to confirmation/resync as-is.
    pub max_broadcast_attempts: u32,
    pub broadcast_retry_delay: Duration,
    /// Delay before the first confirmation poll after a broadcast.
    pub confirm_poll_delay: Duration,
}

impl Default for SendPolicy {
    fn default() -> Self {
        Self {
            max_broadcast_attempts: 5,
            broadcast_retry_delay: Duration::from_secs(5),
            confirm_poll_delay: Duration::from_secs(5),
        }
    }
}

/// Dequeues accepted intents, allocates a nonce, signs and broadcasts.
///
/// Nonce disposition per outcome: accepted (or possibly-sent) keeps the nonce
/// in flight; a deterministic pre-broadcast rejection recycles it; an unknown
/// outcome keeps it in flight provisionally and replays the identical signed
/// payload until the chain answers one way or the other.
pub struct SendJobHandler<CS, S>
where
    CS: ChainService + 'static,
    S: WalletSigner,
{
    pub store: Arc<TransactionStore>,
    pub nonces: Arc<NonceAllocator>,
    pub chains: Arc<CS>,
    pub signer: Arc<S>,
    pub confirm_queue: Arc<Queue<ConfirmJobHandler<CS, S>>>,
    pub policy: SendPolicy,
}

impl<CS, S> DurableExecution for SendJobHandler<CS, S>
where
    CS: ChainService + 'static,
    S: WalletSigner,
{
    type Output = SendJobOutput;
    type ErrorData = RelayWorkerError;
    type JobData = SendJobData;

    #[tracing::instrument(
        name = "send_worker",
        skip_all,
        fields(
            queue_id = %job.job.data.queue_id,
            chain_id = job.job.data.chain_id,
            sender = %job.job.data.from,
        )
    )]
    async fn process(
        &self,
        job: &BorrowedJob<SendJobData>,
    ) -> JobResult<SendJobOutput, RelayWorkerError> {
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

        match record.status() {
            TransactionStatus::Queued => {}
            TransactionStatus::Sent => {
                // A prior attempt broadcast and then lost its lease. Once a
                // broadcast succeeded it must never be re-offered from here.
                self.ensure_confirm_scheduled(data)
                    .await
                    .map_err(|e| e.handle())?;
                if let TransactionPhase::Sent(sent) = &record.phase {
                    return Ok(SendJobOutput::AlreadyBroadcast {
                        nonce: sent.nonce,
                        hash: sent.sent_hashes.last().cloned().unwrap_or_default(),
                    });
                }
                return Ok(SendJobOutput::AlreadyResolved {
                    status: record.status(),
                });
            }
            status => return Ok(SendJobOutput::AlreadyResolved { status }),
        }

        let chain = self.chains.get_chain(data.chain_id).map_err(|e| {
            RelayWorkerError::ChainServiceError {
                chain_id: data.chain_id,
                message: format!("failed to get chain: {e}"),
            }
            .nack(Some(Duration::from_secs(10)), RequeuePosition::Last)
        })?;

        // An interrupted unknown-outcome broadcast replays the exact payload
        // before anything else; allocating a second nonce here would fork the
        // record.
        match self.store.get_pending_broadcast(&data.queue_id).await {
            Ok(Some(pending)) => {
                return self.resume_pending_broadcast(&chain, data, pending).await;
            }
            Ok(None) => {}
            Err(e) => return Err(Into::<RelayWorkerError>::into(e).handle()),
        }

        let allocated = self
            .allocate_nonce(&chain, data)
            .await
            .map_err(|e| e.handle())?;
        let nonce = allocated.value();

        tracing::debug!(
            nonce = nonce,
            recycled = allocated.is_recycled(),
            "nonce allocated"
        );

        match &record.execution_mode {
            ExecutionMode::Eoa => {
                let assembler = TransactionAssembler {
                    chain: &chain,
                    signer: self.signer.as_ref(),
                    sender: data.from,
                };

                let (signed, fees) = match assembler
                    .build_and_sign(&record.intent, nonce, None, 0)
                    .await
                {
                    Ok(built) => built,
                    Err(e) => return self.dispose_preparation_failure(data, nonce, e).await,
                };

                let hash = signed.hash().to_string();

                match chain
                    .provider()
                    .send_tx_envelope(signed.clone().into())
                    .await
                {
                    Ok(_) => {
                        self.finalize_broadcast(data, allocated, hash, fees).await
                    }
                    Err(e) => match classify_broadcast_error(&e, BroadcastContext::Initial) {
                        BroadcastErrorClass::PossiblySent => {
                            tracing::debug!(
                                error = %e,
                                "broadcast error indicates payload is pooled, treating as sent"
                            );
                            self.finalize_broadcast(data, allocated, hash, fees).await
                        }
                        BroadcastErrorClass::Rejected => {
                            let inner = e.to_relay_error(&chain);
                            self.dispose_broadcast_rejection(
                                data,
                                nonce,
                                RelayWorkerError::BroadcastRejected {
                                    message: format!("node refused transaction: {inner}"),
                                    inner,
                                },
                            )
                            .await
                        }
                        BroadcastErrorClass::Unknown => {
                            let inner = e.to_relay_error(&chain);
                            self.park_unknown_broadcast(
                                data,
                                PendingBroadcast {
                                    queue_id: data.queue_id.clone(),
                                    nonce,
                                    hash,
                                    payload: BroadcastPayload::Eoa {
                                        signed_transaction: signed,
                                    },
                                    attempts: 1,
                                    first_attempt_at: TransactionStore::now_ms(),
                                },
                                inner,
                            )
                            .await
                        }
                    },
                }
            }
            ExecutionMode::Erc4337 { entrypoint } => {
                let entrypoint = *entrypoint;
                let user_op = build_user_op(&record, nonce);

                match chain.bundler_client().send_user_op(&user_op, entrypoint).await {
                    Ok(user_op_hash) => {
                        self.finalize_broadcast(
                            data,
                            allocated,
                            user_op_hash.to_string(),
                            GasFees::Eip1559 {
                                max_fee_per_gas: 0,
                                max_priority_fee_per_gas: 0,
                            },
                        )
                        .await
                    }
                    Err(e) => match classify_broadcast_error(&e, BroadcastContext::Initial) {
                        BroadcastErrorClass::PossiblySent => {
                            // Without the bundler's hash there is nothing to
                            // watch; replay the submission instead.
                            let inner = e.to_relay_bundler_error(&chain);
                            self.park_unknown_broadcast(
                                data,
                                PendingBroadcast {
                                    queue_id: data.queue_id.clone(),
                                    nonce,
                                    hash: String::new(),
                                    payload: BroadcastPayload::UserOp { user_op, entrypoint },
                                    attempts: 1,
                                    first_attempt_at: TransactionStore::now_ms(),
                                },
                                inner,
                            )
                            .await
                        }
                        BroadcastErrorClass::Rejected => {
                            let inner = e.to_relay_bundler_error(&chain);
                            self.dispose_broadcast_rejection(
                                data,
                                nonce,
                                RelayWorkerError::BroadcastRejected {
                                    message: format!("bundler refused user operation: {inner}"),
                                    inner,
                                },
                            )
                            .await
                        }
                        BroadcastErrorClass::Unknown => {
                            let inner = e.to_relay_bundler_error(&chain);
                            self.park_unknown_broadcast(
                                data,
                                PendingBroadcast {
                                    queue_id: data.queue_id.clone(),
                                    nonce,
                                    hash: String::new(),
                                    payload: BroadcastPayload::UserOp { user_op, entrypoint },
                                    attempts: 1,
                                    first_attempt_at: TransactionStore::now_ms(),
                                },
                                inner,
                            )
                            .await
                        }
                    },
                }
            }
        }
    }
}

impl<CS, S> SendJobHandler<CS, S>
where
    CS: ChainService + 'static,
    S: WalletSigner,
{
    async fn allocate_nonce(
        &self,
        chain: &CS::Chain,
        data: &SendJobData,
    ) -> Result<AllocatedNonce, RelayWorkerError> {
        match self.nonces.allocate(data.chain_id, data.from).await {
            Ok(allocated) => Ok(allocated),
            Err(NonceStoreError::SyncRequired { .. }) => {
                let count = chain
                    .provider()
                    .get_transaction_count(data.from)
                    .latest()
                    .await
                    .map_err(|e| {
                        let inner = e.to_relay_error(chain);
                        RelayWorkerError::RpcError {
                            message: format!("failed to fetch transaction count: {inner}"),
                            inner,
                        }
                    })?;

                self.nonces
                    .initialize_if_absent(data.chain_id, data.from, count)
                    .await?;
                Ok(self.nonces.allocate(data.chain_id, data.from).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The nonce was allocated but never offered to the network: return it
    /// to the pool, then either retry the job or error the record.
    async fn dispose_preparation_failure(
        &self,
        data: &SendJobData,
        nonce: u64,
        error: RelayWorkerError,
    ) -> JobResult<SendJobOutput, RelayWorkerError> {
        match self.nonces.recycle(data.chain_id, data.from, nonce).await {
            Ok(RecycleOutcome::Recycled) => {}
            Ok(RecycleOutcome::AlreadyConsumed) => {
                tracing::warn!(nonce, "nonce consumed on chain while preparation failed");
            }
            Err(e) => {
                tracing::error!(nonce, error = %e, "failed to recycle nonce");
            }
        }

        if is_retryable_preparation_error(&error) {
            return Err(error.nack(Some(Duration::from_secs(10)), RequeuePosition::Last));
        }

        self.error_record(data, error).await
    }

    async fn dispose_broadcast_rejection(
        &self,
        data: &SendJobData,
        nonce: u64,
        error: RelayWorkerError,
    ) -> JobResult<SendJobOutput, RelayWorkerError> {
        match self.nonces.recycle(data.chain_id, data.from, nonce).await {
            Ok(RecycleOutcome::AlreadyConsumed) => {
                tracing::warn!(nonce, "nonce consumed on chain despite rejected broadcast");
            }
            Ok(RecycleOutcome::Recycled) => {}
            Err(e) => {
                tracing::error!(nonce, error = %e, "failed to recycle nonce");
            }
        }

        self.error_record(data, error).await
    }

    async fn error_record(
        &self,
        data: &SendJobData,
        error: RelayWorkerError,
    ) -> JobResult<SendJobOutput, RelayWorkerError> {
        let patch = PhasePatch::MarkErrored {
            error_message: error.to_string(),
            at: TransactionStore::now_ms(),
        };

        match self.store.transition(&data.queue_id, patch).await {
            Ok(_) => Err(JobError::Fail(error)),
            // The record is still queued; a nack retries both the work and
            // the transition.
            Err(e) => Err(Into::<RelayWorkerError>::into(e).handle()),
        }
    }

    async fn park_unknown_broadcast(
        &self,
        data: &SendJobData,
        pending: PendingBroadcast,
        inner: relay_core::error::RelayError,
    ) -> JobResult<SendJobOutput, RelayWorkerError> {
        // The nonce's disposition is uncertain; it stays in flight under this
        // queue ID so no one else can take the slot while we replay.
        self.nonces
            .mark_sent(data.chain_id, data.from, pending.nonce, &data.queue_id)
            .await
            .map_err(|e| Into::<RelayWorkerError>::into(e).handle())?;
        self.store
            .put_pending_broadcast(&pending)
            .await
            .map_err(|e| Into::<RelayWorkerError>::into(e).handle())?;

        tracing::warn!(
            nonce = pending.nonce,
            attempts = pending.attempts,
            "broadcast outcome unknown, will replay the same signed payload"
        );

        Err(RelayWorkerError::BroadcastOutcomeUnknown {
            message: format!("broadcast outcome unknown: {inner}"),
            inner,
        }
        .nack(
            Some(self.policy.broadcast_retry_delay),
            RequeuePosition::Last,
        ))
    }

    async fn resume_pending_broadcast(
        &self,
        chain: &CS::Chain,
        data: &SendJobData,
        mut pending: PendingBroadcast,
    ) -> JobResult<SendJobOutput, RelayWorkerError> {
        if pending.attempts >= self.policy.max_broadcast_attempts {
            // Every attempt came back unknown. The payload may well be in the
            // pool; record it as sent at face value and let the watcher and
            // resync settle it against the chain instead of guessing.
            tracing::warn!(
                nonce = pending.nonce,
                attempts = pending.attempts,
                "broadcast attempts exhausted with unknown outcome, deferring to resync"
            );
            self.store
                .clear_pending_broadcast(&data.queue_id)
                .await
                .map_err(|e| Into::<RelayWorkerError>::into(e).handle())?;
            let fees = pending_fees(&pending);
            return self
                .finalize_broadcast(
                    data,
                    AllocatedNonce::Fresh(pending.nonce),
                    pending.hash,
                    fees,
                )
                .await;
        }

        let result = match &pending.payload {
            BroadcastPayload::Eoa { signed_transaction } => chain
                .provider()
                .send_tx_envelope(signed_transaction.clone().into())
                .await
                .map(|_| ()),
            BroadcastPayload::UserOp { user_op, entrypoint } => chain
                .bundler_client()
                .send_user_op(user_op, *entrypoint)
                .await
                .map(|hash| {
                    // First answer from the bundler names the userop.
                    if pending.hash.is_empty() {
                        pending.hash = hash.to_string();
                    }
                }),
        };

        match result {
            Ok(()) => {
                self.store
                    .clear_pending_broadcast(&data.queue_id)
                    .await
                    .map_err(|e| Into::<RelayWorkerError>::into(e).handle())?;
                let fees = pending_fees(&pending);
                self.finalize_broadcast(
                    data,
                    AllocatedNonce::Fresh(pending.nonce),
                    pending.hash,
                    fees,
                )
                .await
            }
            Err(e) => match classify_broadcast_error(&e, BroadcastContext::Rebroadcast) {
                BroadcastErrorClass::PossiblySent => {
                    self.store
                        .clear_pending_broadcast(&data.queue_id)
                        .await
                        .map_err(|err| Into::<RelayWorkerError>::into(err).handle())?;
                    let fees = pending_fees(&pending);
                    self.finalize_broadcast(
                        data,
                        AllocatedNonce::Fresh(pending.nonce),
                        pending.hash,
                        fees,
                    )
                    .await
                }
                BroadcastErrorClass::Rejected => {
                    self.store
                        .clear_pending_broadcast(&data.queue_id)
                        .await
                        .map_err(|err| Into::<RelayWorkerError>::into(err).handle())?;
                    let inner = e.to_relay_error(chain);
                    self.dispose_broadcast_rejection(
                        data,
                        pending.nonce,
                        RelayWorkerError::BroadcastRejected {
                            message: format!("node refused transaction on replay: {inner}"),
                            inner,
                        },
                    )
                    .await
                }
                BroadcastErrorClass::Unknown => {
                    pending.attempts += 1;
                    let attempts = pending.attempts;
                    self.store
                        .put_pending_broadcast(&pending)
                        .await
                        .map_err(|err| Into::<RelayWorkerError>::into(err).handle())?;

                    let inner = e.to_relay_error(chain);
                    Err(RelayWorkerError::BroadcastOutcomeUnknown {
                        message: format!("broadcast outcome unknown after {attempts} attempts"),
                        inner,
                    }
                    .nack(
                        Some(self.policy.broadcast_retry_delay * attempts),
                        RequeuePosition::Last,
                    ))
                }
            },
        }
    }

    async fn finalize_broadcast(
        &self,
        data: &SendJobData,
        allocated: AllocatedNonce,
        hash: String,
        fees: GasFees,
    ) -> JobResult<SendJobOutput, RelayWorkerError> {
        let nonce = allocated.value();

        self.nonces
            .mark_sent(data.chain_id, data.from, nonce, &data.queue_id)
            .await
            .map_err(|e| Into::<RelayWorkerError>::into(e).handle())?;

        let patch = PhasePatch::MarkSent {
            nonce,
            hash: hash.clone(),
            fees,
            at: TransactionStore::now_ms(),
        };

        match self.store.transition(&data.queue_id, patch).await {
            Ok(TransitionOutcome::Applied(_)) => {}
            Ok(TransitionOutcome::Stale { actual }) => {
                tracing::warn!(
                    actual = %actual,
                    "record advanced concurrently while finalizing broadcast"
                );
            }
            Err(e) => return Err(Into::<RelayWorkerError>::into(e).handle()),
        }

        self.ensure_confirm_scheduled(data)
            .await
            .map_err(|e| e.handle())?;

        tracing::info!(nonce = nonce, hash = %hash, "transaction broadcast");

        Ok(SendJobOutput::Broadcast {
            nonce,
            hash,
            recycled_nonce: allocated.is_recycled(),
        })
    }

    async fn ensure_confirm_scheduled(&self, data: &SendJobData) -> Result<(), RelayWorkerError> {
        self.confirm_queue
            .clone()
            .job(ConfirmJobData {
                queue_id: data.queue_id.clone(),
                chain_id: data.chain_id,
                from: data.from,
            })
            .with_id(format!("confirm:{}", data.queue_id))
            .with_delay(DelayOptions {
                delay: self.policy.confirm_poll_delay,
                position: RequeuePosition::Last,
            })
            .push()
            .await?;
        Ok(())
    }
}

fn pending_fees(pending: &PendingBroadcast) -> GasFees {
    match &pending.payload {
        BroadcastPayload::Eoa { signed_transaction } => fees_of_typed(signed_transaction.tx()),
        BroadcastPayload::UserOp { .. } => GasFees::Eip1559 {
            max_fee_per_gas: 0,
            max_priority_fee_per_gas: 0,
        },
    }
}

/// Minimal user-operation envelope for a bundler submission. Gas fields are
/// left to the bundler's estimation; the relay only pins sender, nonce and
/// call data.
fn build_user_op(record: &QueuedTransaction, nonce: u64) -> serde_json::Value {
    serde_json::json!({
        "sender": record.from,
        "nonce": format!("0x{nonce:x}"),
        "callData": record.intent.data,
        "callValue": record.intent.value,
        "callTarget": record.intent.to,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::consensus::{SignableTransaction, Signed, TxEip1559, TypedTransaction};
    use alloy::primitives::{Signature, U256};

    fn signed_1559(max_fee: u128, priority: u128) -> Signed<TypedTransaction> {
        let tx = TypedTransaction::Eip1559(TxEip1559 {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: priority,
            ..Default::default()
        });
        let signature = Signature::new(U256::from(1), U256::from(1), false);
        tx.into_signed(signature)
    }

    #[test]
    fn pending_fees_recover_the_signed_payload_fees() {
        let pending = PendingBroadcast {
            queue_id: "q1".to_string(),
            nonce: 5,
            hash: "0xaa".to_string(),
            payload: BroadcastPayload::Eoa {
                signed_transaction: signed_1559(100, 2),
            },
            attempts: 1,
            first_attempt_at: 0,
        };
        assert_eq!(
            pending_fees(&pending),
            GasFees::Eip1559 {
                max_fee_per_gas: 100,
                max_priority_fee_per_gas: 2
            }
        );
    }

    #[test]
    fn user_op_envelope_pins_sender_and_nonce() {
        let record = QueuedTransaction {
            queue_id: "q1".to_string(),
            chain_id: 137,
            from: Address::ZERO,
            intent: serde_json::from_str(r#"{"to":null}"#).unwrap(),
            timeout_seconds: None,
            execution_mode: ExecutionMode::Eoa,
            queued_at: 0,
            phase: TransactionPhase::Queued,
        };
        let user_op = build_user_op(&record, 11);
        assert_eq!(user_op["nonce"], "0xb");
        assert_eq!(
            user_op["sender"],
            serde_json::to_value(Address::ZERO).unwrap()
        );
    }
}
