use std::sync::Arc;

use tokio::{sync::oneshot, task::JoinHandle};

use crate::error::QueueError;

/// Handle for a running worker loop. Dropping it does not stop the worker;
/// call `shutdown` to stop polling and wait for in-flight jobs to finish.
pub struct WorkerHandle<Q> {
    pub join_handle: JoinHandle<Result<(), QueueError>>,
    pub shutdown_tx: oneshot::Sender<()>,
    pub queue: Arc<Q>,
}

impl<Q> WorkerHandle<Q> {
    pub async fn shutdown(self) -> Result<(), QueueError> {
        let _ = self.shutdown_tx.send(());
        self.join_handle
            .await
            .map_err(|e| QueueError::runtime(format!("worker task join failed: {e}")))?
    }
}
