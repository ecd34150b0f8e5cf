use std::time::Duration;

#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Maximum number of jobs processed concurrently by one worker instance.
    pub local_concurrency: usize,
    pub polling_interval: Duration,
    /// How long a popped job stays leased before another worker may reclaim it.
    pub lease_duration: Duration,
    /// Bounded history: finished jobs beyond these counts are pruned along
    /// with their data, results and error records.
    pub max_success: usize,
    pub max_failed: usize,
    /// Poll even when all permits are taken. Off by default.
    pub always_poll: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            local_concurrency: 10,
            polling_interval: Duration::from_millis(250),
            lease_duration: Duration::from_secs(30),
            max_success: 1000,
            max_failed: 10_000,
            always_poll: false,
        }
    }
}
