use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use relayq::Queue;

use relay_core::chain::ChainService;
use relay_core::signer::WalletSigner;

mod cancellation;
mod resync;

pub use cancellation::{
    CancelDisposition, CancellationJobData, CancellationReport, NonceCanceller,
    StuckNonceJobHandler,
};
pub use resync::{ResyncJobData, ResyncJobHandler, ResyncReport};

#[derive(Debug, Clone)]
pub struct MaintenancePolicy {
    pub resync_interval: Duration,
    pub cancellation_interval: Duration,
    /// A recycled nonce unused for this long counts as abandoned and gets
    /// consumed by a cancellation no-op.
    pub abandoned_after_ms: u64,
    /// Fee multiplier for cancellation no-ops, in percent. Aggressive on
    /// purpose: the whole point is to win the slot.
    pub cancellation_bump_percent: u32,
    /// Mirror of the watcher's resend bound; a sent record at or past it is
    /// a cancellation candidate.
    pub max_resends: u32,
}

impl Default for MaintenancePolicy {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(30),
            cancellation_interval: Duration::from_secs(60),
            abandoned_after_ms: 5 * 60 * 1000,
            cancellation_bump_percent: 150,
            max_resends: 3,
        }
    }
}

/// Seed both periodic jobs for one (chain, sender). The jobs reschedule
/// themselves; job-ID deduplication makes repeated seeding harmless.
pub async fn schedule_maintenance<CS, S>(
    resync_queue: &Arc<Queue<ResyncJobHandler<CS>>>,
    cancellation_queue: &Arc<Queue<StuckNonceJobHandler<CS, S>>>,
    chain_id: u64,
    from: Address,
) -> Result<(), relayq::QueueError>
where
    CS: ChainService + 'static,
    S: WalletSigner,
{
    resync_queue
        .clone()
        .job(ResyncJobData { chain_id, from })
        .with_id(format!("resync:{chain_id}:{from}"))
        .push()
        .await?;

    cancellation_queue
        .clone()
        .job(CancellationJobData { chain_id, from })
        .with_id(format!("cancel-sweep:{chain_id}:{from}"))
        .push()
        .await?;

    Ok(())
}
