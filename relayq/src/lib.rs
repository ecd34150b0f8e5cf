//! Durable Redis-backed job queue with delayed re-entry.
//!
//! Every retry is persisted: a nacked job lands in a delayed zset with its
//! `process_at` timestamp and is promoted back to pending by whichever worker
//! polls next, so retry schedules survive process restarts. Popped jobs carry
//! a lease; if the worker dies, the lease expires and the job is reclaimed.

pub mod error;
pub mod hooks;
pub mod job;
pub mod queue;
pub mod shutdown;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redis::{AsyncCommands, Pipeline, aio::ConnectionManager};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::Instrument;

pub use error::QueueError;
pub use hooks::TransactionContext;
pub use job::{
    BorrowedJob, DelayOptions, Job, JobError, JobErrorRecord, JobErrorType, JobOptions, JobResult,
    JobStatus, PushableJob, RequeuePosition, ToJobError, ToJobResult,
};
pub use queue::QueueOptions;
pub use shutdown::WorkerHandle;

// Re-export so dependents don't juggle a second redis version.
pub use redis;

pub struct SuccessHookData<'a, O> {
    pub result: &'a O,
}

pub struct NackHookData<'a, E> {
    pub error: &'a E,
    pub delay: Option<Duration>,
    pub position: RequeuePosition,
}

pub struct FailHookData<'a, E> {
    pub error: &'a E,
}

/// A handler for one queue. `process` does the work; the hooks run inside the
/// completion MULTI/EXEC and may append follow-up commands (including pushing
/// jobs onto other queues) atomically with the state movement.
pub trait DurableExecution: Sized + Send + Sync + 'static {
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;
    type ErrorData: Serialize + DeserializeOwned + Send + Sync + 'static;
    type JobData: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    fn process(
        &self,
        job: &BorrowedJob<Self::JobData>,
    ) -> impl Future<Output = JobResult<Self::Output, Self::ErrorData>> + Send;

    fn on_success(
        &self,
        _job: &BorrowedJob<Self::JobData>,
        _d: SuccessHookData<'_, Self::Output>,
        _tx: &mut TransactionContext<'_>,
    ) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }

    fn on_nack(
        &self,
        _job: &BorrowedJob<Self::JobData>,
        _d: NackHookData<'_, Self::ErrorData>,
        _tx: &mut TransactionContext<'_>,
    ) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }

    fn on_fail(
        &self,
        _job: &BorrowedJob<Self::JobData>,
        _d: FailHookData<'_, Self::ErrorData>,
        _tx: &mut TransactionContext<'_>,
    ) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }
}

pub struct Queue<H>
where
    H: DurableExecution,
{
    pub redis: ConnectionManager,
    handler: Arc<H>,
    options: QueueOptions,
    name: String,
}

fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl<H: DurableExecution> Queue<H> {
    pub async fn new(
        redis_url: &str,
        name: &str,
        options: Option<QueueOptions>,
        handler: H,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let redis = client.get_connection_manager().await?;

        Ok(Self::with_connection(redis, name, options, handler))
    }

    pub fn with_connection(
        redis: ConnectionManager,
        name: &str,
        options: Option<QueueOptions>,
        handler: H,
    ) -> Self {
        Self {
            redis,
            name: name.to_string(),
            options: options.unwrap_or_default(),
            handler: Arc::new(handler),
        }
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn job(self: Arc<Self>, data: H::JobData) -> PushableJob<H> {
        PushableJob {
            options: JobOptions::new(data),
            queue: self,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pending_list_name(&self) -> String {
        format!("relayq:{}:pending", self.name)
    }

    pub fn active_hash_name(&self) -> String {
        format!("relayq:{}:active", self.name)
    }

    pub fn delayed_zset_name(&self) -> String {
        format!("relayq:{}:delayed", self.name)
    }

    pub fn success_list_name(&self) -> String {
        format!("relayq:{}:success", self.name)
    }

    pub fn failed_list_name(&self) -> String {
        format!("relayq:{}:failed", self.name)
    }

    pub fn job_data_hash_name(&self) -> String {
        format!("relayq:{}:jobs:data", self.name)
    }

    pub fn job_result_hash_name(&self) -> String {
        format!("relayq:{}:jobs:result", self.name)
    }

    pub fn job_meta_hash_name(&self, job_id: &str) -> String {
        format!("relayq:{}:job:{}:meta", self.name, job_id)
    }

    pub fn job_errors_list_name(&self, job_id: &str) -> String {
        format!("relayq:{}:job:{}:errors", self.name, job_id)
    }

    pub fn dedupe_set_name(&self) -> String {
        format!("relayq:{}:dedup", self.name)
    }

    pub fn lease_key_name(&self, job_id: &str, lease_token: &str) -> String {
        format!("relayq:{}:job:{}:lease:{}", self.name, job_id, lease_token)
    }

    /// Push a job. If a live job with the same ID already exists this is a
    /// no-op (intake deduplication); the job re-becomes pushable once pruned
    /// or completed.
    pub async fn push(
        &self,
        job_options: JobOptions<H::JobData>,
    ) -> Result<Job<H::JobData>, QueueError> {
        let script = redis::Script::new(
            r#"
            local job_id = ARGV[1]
            local job_data = ARGV[2]
            local now = tonumber(ARGV[3])
            local delay = tonumber(ARGV[4])
            local reentry_position = ARGV[5]

            local delayed_zset = KEYS[1]
            local pending_list = KEYS[2]
            local job_data_hash = KEYS[3]
            local job_meta_hash = KEYS[4]
            local dedupe_set = KEYS[5]

            if redis.call('SISMEMBER', dedupe_set, job_id) == 1 then
                return { 0, job_id }
            end

            redis.call('HSET', job_data_hash, job_id, job_data)
            redis.call('HSET', job_meta_hash, 'created_at', now)
            redis.call('HSET', job_meta_hash, 'attempts', 0)
            redis.call('SADD', dedupe_set, job_id)

            if delay > 0 then
                redis.call('HSET', job_meta_hash, 'reentry_position', reentry_position)
                redis.call('ZADD', delayed_zset, now + delay, job_id)
            else
                redis.call('RPUSH', pending_list, job_id)
            end

            return { 1, job_id }
            "#,
        );

        let now = now_seconds();

        let job = Job {
            id: job_options.id.clone(),
            data: job_options.data,
            attempts: 0,
            created_at: now,
            processed_at: None,
            finished_at: None,
        };

        let job_data = serde_json::to_string(&job.data)?;
        let delay = job_options.delay.unwrap_or(DelayOptions {
            delay: Duration::ZERO,
            position: RequeuePosition::Last,
        });

        let _result: (i32, String) = script
            .key(self.delayed_zset_name())
            .key(self.pending_list_name())
            .key(self.job_data_hash_name())
            .key(self.job_meta_hash_name(&job.id))
            .key(self.dedupe_set_name())
            .arg(&job.id)
            .arg(job_data)
            .arg(now)
            .arg(delay.delay.as_secs())
            .arg(delay.position.to_string())
            .invoke_async(&mut self.redis.clone())
            .await?;

        Ok(job)
    }

    /// Append push commands for a job onto an existing pipeline, for atomic
    /// cross-queue scheduling from hooks or store transactions. Deduplication
    /// is best-effort here: a live duplicate ID simply overwrites its data.
    pub fn add_job_to_pipeline(
        &self,
        job_options: JobOptions<H::JobData>,
        pipeline: &mut Pipeline,
    ) -> Result<(), QueueError> {
        let now = now_seconds();
        let job_data = serde_json::to_string(&job_options.data)?;
        let meta_key = self.job_meta_hash_name(&job_options.id);

        pipeline
            .hset(self.job_data_hash_name(), &job_options.id, job_data)
            .hset(&meta_key, "created_at", now)
            .hset(&meta_key, "attempts", 0)
            .sadd(self.dedupe_set_name(), &job_options.id);

        match job_options.delay {
            Some(delay) => {
                pipeline
                    .hset(&meta_key, "reentry_position", delay.position.to_string())
                    .zadd(
                        self.delayed_zset_name(),
                        &job_options.id,
                        now + delay.delay.as_secs(),
                    );
            }
            None => {
                pipeline.rpush(self.pending_list_name(), &job_options.id);
            }
        }

        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job<H::JobData>>, QueueError> {
        let mut conn = self.redis.clone();
        let data_json: Option<String> = conn.hget(self.job_data_hash_name(), job_id).await?;

        let Some(data_json) = data_json else {
            return Ok(None);
        };

        let data: H::JobData = serde_json::from_str(&data_json)?;
        let meta: std::collections::HashMap<String, String> =
            conn.hgetall(self.job_meta_hash_name(job_id)).await?;

        Ok(Some(Job {
            id: job_id.to_string(),
            data,
            attempts: meta.get("attempts").and_then(|s| s.parse().ok()).unwrap_or(0),
            created_at: meta
                .get("created_at")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            processed_at: meta.get("processed_at").and_then(|s| s.parse().ok()),
            finished_at: meta.get("finished_at").and_then(|s| s.parse().ok()),
        }))
    }

    pub async fn count(&self, status: JobStatus) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();

        let count: usize = match status {
            JobStatus::Pending => conn.llen(self.pending_list_name()).await?,
            JobStatus::Active => conn.hlen(self.active_hash_name()).await?,
            JobStatus::Delayed => conn.zcard(self.delayed_zset_name()).await?,
            JobStatus::Success => conn.llen(self.success_list_name()).await?,
            JobStatus::Failed => conn.llen(self.failed_list_name()).await?,
        };

        Ok(count)
    }

    /// Start the polling worker loop for this queue.
    pub fn work(self: &Arc<Self>) -> WorkerHandle<Queue<H>> {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let semaphore = Arc::new(Semaphore::new(self.options.local_concurrency));
        let handler = self.handler.clone();
        let queue = self.clone();

        let join_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(queue.options.polling_interval);
            tracing::info!(queue = queue.name(), "worker started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::info!(queue = queue.name(), "shutdown signal received");
                        break;
                    }

                    _ = interval.tick() => {
                        let available_permits = semaphore.available_permits();
                        if available_permits == 0 && !queue.options.always_poll {
                            continue;
                        }

                        match queue.pop_batch_jobs(available_permits).await {
                            Ok(jobs) => {
                                for job in jobs {
                                    let permit = match semaphore.clone().acquire_owned().await {
                                        Ok(permit) => permit,
                                        Err(_) => break,
                                    };
                                    let queue = queue.clone();
                                    let handler = handler.clone();
                                    let job_id = job.id().to_string();
                                    let queue_name = queue.name().to_string();

                                    tokio::spawn(async move {
                                        let result = handler.process(&job).await;
                                        if let Err(e) = queue.complete_job(&job, result).await {
                                            tracing::error!(
                                                job_id = job.id(),
                                                error = ?e,
                                                "failed to complete job"
                                            );
                                        }
                                        drop(permit);
                                    }.instrument(tracing::info_span!("relayq_worker", job_id, queue_name)));
                                }
                            }
                            Err(e) => {
                                tracing::error!(queue = queue.name(), error = ?e, "failed to pop jobs");
                                sleep(Duration::from_millis(1000)).await;
                            }
                        }
                    }
                }
            }

            // Drain: hold every permit so no job is still running when we return.
            let _permits: Vec<_> = (0..queue.options.local_concurrency)
                .map(|_| semaphore.clone().acquire_owned())
                .collect::<futures::future::JoinAll<_>>()
                .await
                .into_iter()
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| {
                    QueueError::runtime(format!("failed to acquire permits during shutdown: {e}"))
                })?;

            tracing::info!(queue = queue.name(), "worker shutdown complete");
            Ok(())
        });

        WorkerHandle {
            join_handle,
            shutdown_tx,
            queue: self.clone(),
        }
    }

    /// Single round trip that reclaims expired leases, promotes due delayed
    /// jobs and pops up to `batch_size` pending jobs under fresh leases.
    async fn pop_batch_jobs(
        self: &Arc<Self>,
        batch_size: usize,
    ) -> Result<Vec<BorrowedJob<H::JobData>>, QueueError> {
        let script = redis::Script::new(
            r#"
            local now = tonumber(ARGV[1])
            local batch_size = tonumber(ARGV[2])
            local lease_seconds = tonumber(ARGV[3])
            local prefix = ARGV[4]

            local delayed_zset = KEYS[1]
            local pending_list = KEYS[2]
            local active_hash = KEYS[3]
            local job_data_hash = KEYS[4]

            -- 1. reclaim jobs whose lease expired
            local active_jobs = redis.call('HGETALL', active_hash)
            local reclaimed = {}
            for i = 1, #active_jobs, 2 do
                local job_id = active_jobs[i]
                local meta_hash = prefix .. ':job:' .. job_id .. ':meta'
                local token = redis.call('HGET', meta_hash, 'lease_token')
                local lease_alive = 0
                if token then
                    lease_alive = redis.call('EXISTS', prefix .. ':job:' .. job_id .. ':lease:' .. token)
                end
                if lease_alive == 0 then
                    redis.call('HDEL', meta_hash, 'lease_token')
                    redis.call('HDEL', active_hash, job_id)
                    redis.call('LPUSH', pending_list, job_id)
                    table.insert(reclaimed, job_id)
                end
            end

            -- 2. promote due delayed jobs
            local due = redis.call('ZRANGEBYSCORE', delayed_zset, 0, now)
            for _, job_id in ipairs(due) do
                local meta_hash = prefix .. ':job:' .. job_id .. ':meta'
                local position = redis.call('HGET', meta_hash, 'reentry_position') or 'last'
                redis.call('ZREM', delayed_zset, job_id)
                redis.call('HDEL', meta_hash, 'reentry_position')
                if position == 'first' then
                    redis.call('LPUSH', pending_list, job_id)
                else
                    redis.call('RPUSH', pending_list, job_id)
                end
            end

            -- 3. pop under fresh leases
            local popped = {}
            for i = 1, batch_size do
                local job_id = redis.call('LPOP', pending_list)
                if not job_id then
                    break
                end
                local job_data = redis.call('HGET', job_data_hash, job_id)
                if job_data then
                    local meta_hash = prefix .. ':job:' .. job_id .. ':meta'
                    redis.call('HSET', meta_hash, 'processed_at', now)
                    local created_at = redis.call('HGET', meta_hash, 'created_at') or now
                    local attempts = redis.call('HINCRBY', meta_hash, 'attempts', 1)
                    local token = now .. '_' .. attempts .. '_' .. job_id
                    redis.call('SET', prefix .. ':job:' .. job_id .. ':lease:' .. token, '1', 'EX', lease_seconds)
                    redis.call('HSET', meta_hash, 'lease_token', token)
                    redis.call('HSET', active_hash, job_id, attempts)
                    table.insert(popped, {job_id, job_data, tostring(attempts), tostring(created_at), token})
                end
            end

            return { popped, reclaimed }
            "#,
        );

        let now = now_seconds();

        let (popped, reclaimed): (Vec<(String, String, String, String, String)>, Vec<String>) =
            script
                .key(self.delayed_zset_name())
                .key(self.pending_list_name())
                .key(self.active_hash_name())
                .key(self.job_data_hash_name())
                .arg(now)
                .arg(batch_size)
                .arg(self.options.lease_duration.as_secs())
                .arg(format!("relayq:{}", self.name))
                .invoke_async(&mut self.redis.clone())
                .await?;

        for job_id in &reclaimed {
            tracing::warn!(job_id = job_id, "job lease expired, moved back to pending");
        }

        let mut jobs = Vec::with_capacity(popped.len());
        for (job_id, data_json, attempts, created_at, lease_token) in popped {
            match serde_json::from_str::<H::JobData>(&data_json) {
                Ok(data) => {
                    jobs.push(BorrowedJob::new(
                        Job {
                            id: job_id,
                            data,
                            attempts: attempts.parse().unwrap_or(1),
                            created_at: created_at.parse().unwrap_or(now),
                            processed_at: Some(now),
                            finished_at: None,
                        },
                        lease_token,
                    ));
                }
                Err(e) => {
                    tracing::error!(
                        job_id = job_id,
                        error = ?e,
                        "failed to deserialize job data, moving job to failed"
                    );
                    self.quarantine_undecodable_job(&job_id, &lease_token).await?;
                }
            }
        }

        Ok(jobs)
    }

    /// A job whose payload no longer deserializes can never process; park it
    /// in the failed list so it stops cycling through pending.
    async fn quarantine_undecodable_job(
        &self,
        job_id: &str,
        lease_token: &str,
    ) -> Result<(), QueueError> {
        let now = now_seconds();
        let mut pipeline = redis::pipe();
        pipeline.atomic();
        pipeline
            .del(self.lease_key_name(job_id, lease_token))
            .hdel(self.active_hash_name(), job_id)
            .hdel(self.job_meta_hash_name(job_id), "lease_token")
            .hset(self.job_meta_hash_name(job_id), "finished_at", now)
            .lpush(self.failed_list_name(), job_id)
            .srem(self.dedupe_set_name(), job_id);
        pipeline
            .query_async::<Vec<redis::Value>>(&mut self.redis.clone())
            .await?;
        Ok(())
    }

    pub async fn complete_job(
        &self,
        job: &BorrowedJob<H::JobData>,
        result: JobResult<H::Output, H::ErrorData>,
    ) -> Result<(), QueueError> {
        let mut pipeline = redis::pipe();
        pipeline.atomic();

        {
            let mut tx = TransactionContext::new(&mut pipeline, self.name.clone());

            match &result {
                Ok(output) => {
                    self.append_success_operations(job, output, &mut tx)?;
                    self.handler
                        .on_success(job, SuccessHookData { result: output }, &mut tx)
                        .await;
                }
                Err(JobError::Nack {
                    error,
                    delay,
                    position,
                }) => {
                    self.append_nack_operations(job, error, *delay, *position, &mut tx)?;
                    self.handler
                        .on_nack(
                            job,
                            NackHookData {
                                error,
                                delay: *delay,
                                position: *position,
                            },
                            &mut tx,
                        )
                        .await;
                }
                Err(JobError::Fail(error)) => {
                    self.append_fail_operations(job, error, &mut tx)?;
                    self.handler
                        .on_fail(job, FailHookData { error }, &mut tx)
                        .await;
                }
            }
        }

        pipeline
            .query_async::<Vec<redis::Value>>(&mut self.redis.clone())
            .await?;

        match &result {
            Ok(_) => {
                self.prune_finished(&self.success_list_name(), self.options.max_success)
                    .await?
            }
            Err(JobError::Fail(_)) => {
                self.prune_finished(&self.failed_list_name(), self.options.max_failed)
                    .await?
            }
            Err(JobError::Nack { .. }) => {}
        }

        Ok(())
    }

    fn append_success_operations(
        &self,
        job: &BorrowedJob<H::JobData>,
        result: &H::Output,
        tx: &mut TransactionContext<'_>,
    ) -> Result<(), QueueError> {
        let now = now_seconds();
        let result_json = serde_json::to_string(result)?;

        tx.pipeline()
            .del(self.lease_key_name(&job.job.id, &job.lease_token))
            .hdel(self.active_hash_name(), &job.job.id)
            .hdel(self.job_meta_hash_name(&job.job.id), "lease_token")
            .hset(self.job_meta_hash_name(&job.job.id), "finished_at", now)
            .lpush(self.success_list_name(), &job.job.id)
            .hset(self.job_result_hash_name(), &job.job.id, result_json)
            .srem(self.dedupe_set_name(), &job.job.id);

        Ok(())
    }

    fn append_nack_operations(
        &self,
        job: &BorrowedJob<H::JobData>,
        error: &H::ErrorData,
        delay: Option<Duration>,
        position: RequeuePosition,
        tx: &mut TransactionContext<'_>,
    ) -> Result<(), QueueError> {
        let now = now_seconds();
        let record = JobErrorRecord {
            error,
            attempt: job.job.attempts,
            details: JobErrorType::Nack {
                delay_ms: delay.map(|d| d.as_millis() as u64),
                position,
            },
            created_at: now,
        };
        let record_json = serde_json::to_string(&record)?;

        tx.pipeline()
            .del(self.lease_key_name(&job.job.id, &job.lease_token))
            .hdel(self.active_hash_name(), &job.job.id)
            .hdel(self.job_meta_hash_name(&job.job.id), "lease_token")
            .lpush(self.job_errors_list_name(&job.job.id), record_json);

        match delay {
            Some(delay) => {
                tx.pipeline()
                    .hset(
                        self.job_meta_hash_name(&job.job.id),
                        "reentry_position",
                        position.to_string(),
                    )
                    .zadd(
                        self.delayed_zset_name(),
                        &job.job.id,
                        now + delay.as_secs(),
                    );
            }
            None => match position {
                RequeuePosition::First => {
                    tx.pipeline().lpush(self.pending_list_name(), &job.job.id);
                }
                RequeuePosition::Last => {
                    tx.pipeline().rpush(self.pending_list_name(), &job.job.id);
                }
            },
        }

        Ok(())
    }

    fn append_fail_operations(
        &self,
        job: &BorrowedJob<H::JobData>,
        error: &H::ErrorData,
        tx: &mut TransactionContext<'_>,
    ) -> Result<(), QueueError> {
        let now = now_seconds();
        let record = JobErrorRecord {
            error,
            attempt: job.job.attempts,
            details: JobErrorType::Fail,
            created_at: now,
        };
        let record_json = serde_json::to_string(&record)?;

        tx.pipeline()
            .del(self.lease_key_name(&job.job.id, &job.lease_token))
            .hdel(self.active_hash_name(), &job.job.id)
            .hdel(self.job_meta_hash_name(&job.job.id), "lease_token")
            .hset(self.job_meta_hash_name(&job.job.id), "finished_at", now)
            .lpush(self.failed_list_name(), &job.job.id)
            .lpush(self.job_errors_list_name(&job.job.id), record_json)
            .srem(self.dedupe_set_name(), &job.job.id);

        Ok(())
    }

    /// Trim a finished list to `max_len`, deleting data, meta, results and
    /// error records of everything that falls off the end.
    async fn prune_finished(&self, list_name: &str, max_len: usize) -> Result<(), QueueError> {
        let script = redis::Script::new(
            r#"
            local prefix = ARGV[2]
            local list_name = KEYS[1]
            local job_data_hash = KEYS[2]
            local results_hash = KEYS[3]
            local dedupe_set = KEYS[4]
            local max_len = tonumber(ARGV[1])

            local evicted = redis.call('LRANGE', list_name, max_len, -1)
            if #evicted > 0 then
                for _, job_id in ipairs(evicted) do
                    redis.call('SREM', dedupe_set, job_id)
                    redis.call('HDEL', job_data_hash, job_id)
                    redis.call('HDEL', results_hash, job_id)
                    redis.call('DEL', prefix .. ':job:' .. job_id .. ':meta')
                    redis.call('DEL', prefix .. ':job:' .. job_id .. ':errors')
                end
                redis.call('LTRIM', list_name, 0, max_len - 1)
            end
            return #evicted
            "#,
        );

        let evicted: usize = script
            .key(list_name)
            .key(self.job_data_hash_name())
            .key(self.job_result_hash_name())
            .key(self.dedupe_set_name())
            .arg(max_len)
            .arg(format!("relayq:{}", self.name))
            .invoke_async(&mut self.redis.clone())
            .await?;

        if evicted > 0 {
            tracing::debug!(queue = self.name(), evicted = evicted, "pruned finished jobs");
        }

        Ok(())
    }
}
