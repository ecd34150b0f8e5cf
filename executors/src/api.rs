use std::sync::Arc;

use alloy::primitives::Address;
use relayq::Queue;

use relay_core::chain::ChainService;
use relay_core::signer::WalletSigner;

use crate::maintenance::NonceCanceller;
use crate::nonce::NonceAllocator;
use crate::pipeline::error::RelayWorkerError;
use crate::pipeline::send::{SendJobData, SendJobHandler};
use crate::store::{EnqueueRequest, QueuedTransaction, TransactionStore, TransactionStoreError};

/// The surface the HTTP layer talks to. Callers get a queue ID back
/// synchronously and observe everything else through `get_status` or status
/// events; nothing here waits on the chain.
pub struct Relayer<CS, S>
where
    CS: ChainService + 'static,
    S: WalletSigner,
{
    pub store: Arc<TransactionStore>,
    pub nonces: Arc<NonceAllocator>,
    pub send_queue: Arc<Queue<SendJobHandler<CS, S>>>,
    pub canceller: NonceCanceller<CS, S>,
}

impl<CS, S> Relayer<CS, S>
where
    CS: ChainService + 'static,
    S: WalletSigner,
{
    /// Accept an intent and schedule its send job. With an idempotency key,
    /// a duplicate call returns the original queue ID and schedules nothing.
    pub async fn enqueue(
        &self,
        request: EnqueueRequest,
        idempotency_key: Option<&str>,
    ) -> Result<String, TransactionStoreError> {
        let chain_id = request.chain_id;
        let from = request.from;

        let outcome = self.store.enqueue(request, idempotency_key).await?;
        let queue_id = outcome.queue_id().to_string();

        if outcome.is_created() {
            self.send_queue
                .clone()
                .job(SendJobData {
                    queue_id: queue_id.clone(),
                    chain_id,
                    from,
                })
                .with_id(format!("send:{queue_id}"))
                .push()
                .await?;
        }

        Ok(queue_id)
    }

    pub async fn get_status(
        &self,
        queue_id: &str,
    ) -> Result<Option<QueuedTransaction>, TransactionStoreError> {
        self.store.get(queue_id).await
    }

    /// Synchronous administrative unblock built on the stuck-nonce
    /// cancellation primitive.
    pub async fn cancel_nonces_up_to(
        &self,
        chain_id: u64,
        from: Address,
        to_nonce: u64,
    ) -> Result<Vec<u64>, RelayWorkerError> {
        self.canceller
            .cancel_nonces_up_to(chain_id, from, to_nonce)
            .await
    }
}
