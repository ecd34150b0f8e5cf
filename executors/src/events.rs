use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use relayq::job::{JobResult, RequeuePosition, ToJobResult};
use relayq::{BorrowedJob, DurableExecution};
use serde::{Deserialize, Serialize};

use crate::store::{QueuedTransaction, TransactionStatus};

const MAX_DELIVERY_ATTEMPTS: u32 = 10;

/// Emitted on every successful store transition, atomically with the write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub queue_id: String,
    pub previous_status: Option<TransactionStatus>,
    pub new_status: TransactionStatus,
    pub snapshot: QueuedTransaction,
    pub timestamp: u64,
}

#[derive(Debug, thiserror::Error, Serialize, Deserialize, Clone)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "errorCode")]
pub enum EventDeliveryError {
    #[error("Event delivery failed: {message}")]
    DeliveryFailed { message: String },
}

/// Downstream consumer of status events (webhook dispatcher, audit log, …).
/// Delivery guarantees past this seam are the sink's responsibility; the
/// relay only retries handing the event over.
pub trait EventSink: Send + Sync + 'static {
    fn publish<'a>(
        &'a self,
        event: &'a StatusEvent,
    ) -> BoxFuture<'a, Result<(), EventDeliveryError>>;
}

/// Sink that only logs. Useful default wherever no webhook collaborator is
/// wired in.
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish<'a>(
        &'a self,
        event: &'a StatusEvent,
    ) -> BoxFuture<'a, Result<(), EventDeliveryError>> {
        Box::pin(async move {
            tracing::info!(
                queue_id = %event.queue_id,
                previous_status = ?event.previous_status,
                new_status = %event.new_status,
                "transaction status event"
            );
            Ok(())
        })
    }
}

/// Queue handler draining status events into the configured sink.
pub struct StatusEventHandler {
    pub sink: Arc<dyn EventSink>,
}

impl StatusEventHandler {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }
}

impl DurableExecution for StatusEventHandler {
    type Output = ();
    type ErrorData = EventDeliveryError;
    type JobData = StatusEvent;

    #[tracing::instrument(
        name = "status_event_worker",
        skip_all,
        fields(queue_id = %job.job.data.queue_id)
    )]
    async fn process(&self, job: &BorrowedJob<StatusEvent>) -> JobResult<(), EventDeliveryError> {
        let result = self.sink.publish(&job.job.data).await;

        if job.job.attempts >= MAX_DELIVERY_ATTEMPTS {
            result.map_err_fail()
        } else {
            result.map_err_nack(Some(Duration::from_secs(10)), RequeuePosition::Last)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TransactionPhase;
    use alloy::primitives::Address;
    use relay_core::transaction::ExecutionMode;

    #[test]
    fn events_serialize_with_camel_case_fields() {
        let event = StatusEvent {
            queue_id: "q1".to_string(),
            previous_status: Some(TransactionStatus::Queued),
            new_status: TransactionStatus::Sent,
            snapshot: QueuedTransaction {
                queue_id: "q1".to_string(),
                chain_id: 137,
                from: Address::ZERO,
                intent: serde_json::from_str(r#"{"to":null}"#).unwrap(),
                timeout_seconds: None,
                execution_mode: ExecutionMode::Eoa,
                queued_at: 1,
                phase: TransactionPhase::Queued,
            },
            timestamp: 2,
        };

        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["queueId"], "q1");
        assert_eq!(value["previousStatus"], "queued");
        assert_eq!(value["newStatus"], "sent");
        assert_eq!(value["snapshot"]["queueId"], "q1");
    }
}
