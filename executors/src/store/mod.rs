use std::sync::Arc;

use alloy::consensus::TypedTransaction;
use alloy::consensus::Signed;
use alloy::primitives::Address;
use relayq::redis::{AsyncCommands, Pipeline, aio::ConnectionManager};
use relayq::{Queue, job::JobOptions};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use relay_core::transaction::{ExecutionMode, TransactionIntent};

use crate::events::{StatusEvent, StatusEventHandler};

mod error;
mod phase;
mod transition;

pub use error::TransactionStoreError;
pub use phase::{
    CancelledPhase, ErroredPhase, GasFees, MinedPhase, MinedReceipt, SentPhase, TransactionPhase,
    TransactionStatus,
};
pub use transition::{
    AtomicRedisOp, PhasePatch, TransitionOutcome, Validation, execute_with_watch_and_retry,
};

use transition::Validation as V;

/// One write intent as accepted at intake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub chain_id: u64,
    pub from: Address,
    pub intent: TransactionIntent,
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
}

/// The durable record for one queue ID: immutable intake fields plus the
/// lifecycle phase. This is also the snapshot shape carried on status events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTransaction {
    pub queue_id: String,
    pub chain_id: u64,
    pub from: Address,
    pub intent: TransactionIntent,
    pub timeout_seconds: Option<u64>,
    pub execution_mode: ExecutionMode,
    pub queued_at: u64,
    #[serde(flatten)]
    pub phase: TransactionPhase,
}

impl QueuedTransaction {
    pub fn status(&self) -> TransactionStatus {
        self.phase.status()
    }
}

#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    Created { queue_id: String },
    /// The idempotency key matched an existing live record; no second record
    /// was written.
    Deduplicated { queue_id: String },
}

impl EnqueueOutcome {
    pub fn queue_id(&self) -> &str {
        match self {
            EnqueueOutcome::Created { queue_id } => queue_id,
            EnqueueOutcome::Deduplicated { queue_id } => queue_id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueOutcome::Created { .. })
    }
}

/// A broadcast whose outcome the RPC never reported. The signed payload is
/// kept verbatim so retries re-offer exactly the same bytes at the same
/// nonce, never a new signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingBroadcast {
    pub queue_id: String,
    pub nonce: u64,
    pub hash: String,
    pub payload: BroadcastPayload,
    pub attempts: u32,
    pub first_attempt_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BroadcastPayload {
    Eoa {
        signed_transaction: Signed<TypedTransaction>,
    },
    UserOp {
        user_op: serde_json::Value,
        entrypoint: Address,
    },
}

pub struct TransactionStoreKeys {
    pub namespace: Option<String>,
}

impl TransactionStoreKeys {
    pub fn new(namespace: Option<String>) -> Self {
        Self { namespace }
    }

    fn scoped(&self, suffix: String) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:{suffix}"),
            None => suffix,
        }
    }

    pub fn transaction_key(&self, queue_id: &str) -> String {
        self.scoped(format!("relay:tx:{queue_id}"))
    }

    pub fn idempotency_key_name(&self, key: &str) -> String {
        self.scoped(format!("relay:idempotency:{key}"))
    }

    /// Per-status index: queue_id scored by last transition timestamp.
    pub fn status_index_key(&self, status: TransactionStatus) -> String {
        self.scoped(format!("relay:tx_status:{status}"))
    }

    pub fn pending_broadcast_key(&self, queue_id: &str) -> String {
        self.scoped(format!("relay:tx_broadcast:{queue_id}"))
    }
}

/// Durable record of every transaction intent plus the idempotency index.
/// Status transitions are CAS-guarded and emit a status event onto the event
/// queue atomically with the write.
pub struct TransactionStore {
    pub redis: ConnectionManager,
    pub keys: TransactionStoreKeys,
    pub events: Arc<Queue<StatusEventHandler>>,
}

impl TransactionStore {
    pub fn new(
        redis: ConnectionManager,
        namespace: Option<String>,
        events: Arc<Queue<StatusEventHandler>>,
    ) -> Self {
        Self {
            redis,
            keys: TransactionStoreKeys::new(namespace),
            events,
        }
    }

    pub fn now_ms() -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }

    /// Accept an intent. With an idempotency key, a second call while the
    /// original record is live returns the original queue ID and writes
    /// nothing.
    pub async fn enqueue(
        &self,
        request: EnqueueRequest,
        idempotency_key: Option<&str>,
    ) -> Result<EnqueueOutcome, TransactionStoreError> {
        let now = Self::now_ms();
        let record = QueuedTransaction {
            queue_id: Uuid::new_v4().to_string(),
            chain_id: request.chain_id,
            from: request.from,
            intent: request.intent,
            timeout_seconds: request.timeout_seconds,
            execution_mode: request.execution_mode,
            queued_at: now,
            phase: TransactionPhase::Queued,
        };
        let record_json = serde_json::to_string(&record)?;

        let script = relayq::redis::Script::new(
            r#"
            local queue_id = ARGV[1]
            local record = ARGV[2]
            local now = tonumber(ARGV[3])
            local has_idempotency_key = ARGV[4]

            local record_key = KEYS[1]
            local queued_index = KEYS[2]
            local idempotency_key = KEYS[3]

            if has_idempotency_key == '1' then
                local existing = redis.call('GET', idempotency_key)
                if existing then
                    return { 0, existing }
                end
                redis.call('SET', idempotency_key, queue_id)
            end

            redis.call('SET', record_key, record)
            redis.call('ZADD', queued_index, now, queue_id)
            return { 1, queue_id }
            "#,
        );

        let idempotency_key_name = match idempotency_key {
            Some(key) => self.keys.idempotency_key_name(key),
            // Unused by the script when the flag is off; any syntactically
            // valid key slot will do.
            None => self.keys.transaction_key(&record.queue_id),
        };

        let (created, queue_id): (i32, String) = script
            .key(self.keys.transaction_key(&record.queue_id))
            .key(self.keys.status_index_key(TransactionStatus::Queued))
            .key(idempotency_key_name)
            .arg(&record.queue_id)
            .arg(&record_json)
            .arg(now)
            .arg(if idempotency_key.is_some() { "1" } else { "0" })
            .invoke_async(&mut self.redis.clone())
            .await?;

        if created == 1 {
            tracing::debug!(
                queue_id = %queue_id,
                chain_id = record.chain_id,
                sender = %record.from,
                "transaction accepted"
            );
            Ok(EnqueueOutcome::Created { queue_id })
        } else {
            tracing::debug!(
                queue_id = %queue_id,
                "idempotency key matched existing record, intake deduplicated"
            );
            Ok(EnqueueOutcome::Deduplicated { queue_id })
        }
    }

    pub async fn get(
        &self,
        queue_id: &str,
    ) -> Result<Option<QueuedTransaction>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let record_json: Option<String> =
            conn.get(self.keys.transaction_key(queue_id)).await?;

        match record_json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Like `get`, but a missing record is an error.
    pub async fn get_required(
        &self,
        queue_id: &str,
    ) -> Result<QueuedTransaction, TransactionStoreError> {
        self.get(queue_id)
            .await?
            .ok_or_else(|| TransactionStoreError::TransactionNotFound {
                queue_id: queue_id.to_string(),
            })
    }

    /// Queue IDs currently in `status`, oldest transition first.
    pub async fn list_by_status(
        &self,
        status: TransactionStatus,
        limit: u64,
    ) -> Result<Vec<String>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrange(
                self.keys.status_index_key(status),
                0,
                (limit as isize) - 1,
            )
            .await?;
        Ok(ids)
    }

    /// Apply a lifecycle patch under CAS. On success the status index moves
    /// and a status event lands on the event queue in the same MULTI/EXEC.
    pub async fn transition(
        &self,
        queue_id: &str,
        patch: PhasePatch,
    ) -> Result<TransitionOutcome, TransactionStoreError> {
        let op = TransitionOp {
            store: self,
            queue_id,
            patch,
        };
        let outcome = execute_with_watch_and_retry(&self.redis, &op).await?;

        match &outcome {
            TransitionOutcome::Applied(snapshot) => {
                tracing::info!(
                    queue_id = %queue_id,
                    status = %snapshot.status(),
                    nonce = ?snapshot.phase.nonce(),
                    "transaction transitioned"
                );
            }
            TransitionOutcome::Stale { actual } => {
                tracing::debug!(
                    queue_id = %queue_id,
                    actual = %actual,
                    "transition skipped, record already advanced"
                );
            }
        }

        Ok(outcome)
    }

    pub async fn put_pending_broadcast(
        &self,
        pending: &PendingBroadcast,
    ) -> Result<(), TransactionStoreError> {
        let mut conn = self.redis.clone();
        let json = serde_json::to_string(pending)?;
        let _: () = conn
            .set(self.keys.pending_broadcast_key(&pending.queue_id), json)
            .await?;
        Ok(())
    }

    pub async fn get_pending_broadcast(
        &self,
        queue_id: &str,
    ) -> Result<Option<PendingBroadcast>, TransactionStoreError> {
        let mut conn = self.redis.clone();
        let json: Option<String> = conn
            .get(self.keys.pending_broadcast_key(queue_id))
            .await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn clear_pending_broadcast(
        &self,
        queue_id: &str,
    ) -> Result<(), TransactionStoreError> {
        let mut conn = self.redis.clone();
        let _: () = conn.del(self.keys.pending_broadcast_key(queue_id)).await?;
        Ok(())
    }
}

struct TransitionOp<'a> {
    store: &'a TransactionStore,
    queue_id: &'a str,
    patch: PhasePatch,
}

struct StagedTransition {
    previous_status: TransactionStatus,
    record_json: String,
    snapshot: QueuedTransaction,
    event: StatusEvent,
}

impl AtomicRedisOp for TransitionOp<'_> {
    type Staged = StagedTransition;
    type Outcome = TransitionOutcome;

    fn name(&self) -> &str {
        "transaction status transition"
    }

    fn watch_keys(&self) -> Vec<String> {
        vec![self.store.keys.transaction_key(self.queue_id)]
    }

    async fn validate(
        &self,
        conn: &mut ConnectionManager,
    ) -> Result<Validation<StagedTransition, TransitionOutcome>, TransactionStoreError> {
        let record_json: Option<String> = conn
            .get(self.store.keys.transaction_key(self.queue_id))
            .await?;
        let Some(record_json) = record_json else {
            return Err(TransactionStoreError::TransactionNotFound {
                queue_id: self.queue_id.to_string(),
            });
        };

        let record: QueuedTransaction = serde_json::from_str(&record_json)?;
        let from = record.status();

        if !self.patch.allowed_from().contains(&from) {
            return Ok(V::Abort(TransitionOutcome::Stale { actual: from }));
        }

        let new_phase = self.patch.clone().apply(&record.phase).map_err(|e| {
            TransactionStoreError::IllegalTransition {
                queue_id: self.queue_id.to_string(),
                from: e.from,
                patch: e.patch,
            }
        })?;

        let mut updated = record;
        updated.phase = new_phase;

        let event = StatusEvent {
            queue_id: updated.queue_id.clone(),
            previous_status: Some(from),
            new_status: updated.status(),
            snapshot: updated.clone(),
            timestamp: TransactionStore::now_ms(),
        };

        Ok(V::Proceed(StagedTransition {
            previous_status: from,
            record_json: serde_json::to_string(&updated)?,
            snapshot: updated,
            event,
        }))
    }

    fn stage(
        &self,
        pipeline: &mut Pipeline,
        staged: StagedTransition,
    ) -> Result<TransitionOutcome, TransactionStoreError> {
        pipeline
            .set(
                self.store.keys.transaction_key(self.queue_id),
                &staged.record_json,
            )
            .zrem(
                self.store.keys.status_index_key(staged.previous_status),
                self.queue_id,
            )
            .zadd(
                self.store.keys.status_index_key(staged.event.new_status),
                self.queue_id,
                staged.event.timestamp,
            );

        let event_job =
            JobOptions::new(staged.event).with_id(format!("evt:{}", Uuid::new_v4()));
        self.store.events.add_job_to_pipeline(event_job, pipeline)?;

        Ok(TransitionOutcome::Applied(Box::new(staged.snapshot)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_names_carry_the_namespace_prefix() {
        let keys = TransactionStoreKeys::new(None);
        assert_eq!(keys.transaction_key("abc"), "relay:tx:abc");
        assert_eq!(
            keys.status_index_key(TransactionStatus::Sent),
            "relay:tx_status:sent"
        );

        let keys = TransactionStoreKeys::new(Some("staging".to_string()));
        assert_eq!(keys.transaction_key("abc"), "staging:relay:tx:abc");
        assert_eq!(
            keys.idempotency_key_name("req-1"),
            "staging:relay:idempotency:req-1"
        );
        assert_eq!(
            keys.pending_broadcast_key("abc"),
            "staging:relay:tx_broadcast:abc"
        );
    }

    #[test]
    fn enqueue_outcome_exposes_the_queue_id_either_way() {
        let created = EnqueueOutcome::Created {
            queue_id: "a".to_string(),
        };
        let deduplicated = EnqueueOutcome::Deduplicated {
            queue_id: "a".to_string(),
        };
        assert!(created.is_created());
        assert!(!deduplicated.is_created());
        assert_eq!(created.queue_id(), deduplicated.queue_id());
    }

    #[test]
    fn record_snapshot_serializes_status_at_top_level() {
        let record = QueuedTransaction {
            queue_id: "q1".to_string(),
            chain_id: 137,
            from: Address::ZERO,
            intent: serde_json::from_str(r#"{"to":null}"#).unwrap(),
            timeout_seconds: None,
            execution_mode: ExecutionMode::Eoa,
            queued_at: 1,
            phase: TransactionPhase::Queued,
        };
        let value: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "queued");
        assert_eq!(value["queueId"], "q1");
    }
}
