use alloy::primitives::Address;
use relayq::redis::{AsyncCommands, aio::ConnectionManager};
use serde::{Deserialize, Serialize};

mod error;

pub use error::NonceStoreError;

/// Queue-ID prefix used for cancellation self-transfers occupying a nonce.
/// These never correspond to a stored transaction record.
pub const CANCELLATION_ID_PREFIX: &str = "noop:";

/// How a nonce was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatedNonce {
    /// Popped from the recycle pool; reuse before growing the counter keeps
    /// the allocation frontier from drifting ahead of the chain.
    Recycled(u64),
    /// Freshly incremented from the counter.
    Fresh(u64),
}

impl AllocatedNonce {
    pub fn value(&self) -> u64 {
        match self {
            AllocatedNonce::Recycled(nonce) | AllocatedNonce::Fresh(nonce) => *nonce,
        }
    }

    pub fn is_recycled(&self) -> bool {
        matches!(self, AllocatedNonce::Recycled(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecycleOutcome {
    Recycled,
    /// The chain already consumed this nonce; the recycle was rejected and
    /// the nonce dropped from in-flight bookkeeping instead. The chain wins.
    AlreadyConsumed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecycledNonce {
    pub nonce: u64,
    pub recycled_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentNonce {
    pub nonce: u64,
    pub queue_id: String,
}

impl SentNonce {
    pub fn is_cancellation(&self) -> bool {
        self.queue_id.starts_with(CANCELLATION_ID_PREFIX)
    }
}

#[derive(Debug, Clone)]
pub struct NonceStateSnapshot {
    /// Counter value: the next fresh nonce to hand out. `None` until the
    /// first sync against the chain.
    pub allocated_count: Option<u64>,
    /// Chain transaction count as of the last resync.
    pub confirmed_count: Option<u64>,
    pub recycled: Vec<RecycledNonce>,
    pub sent: Vec<SentNonce>,
}

/// True when the chain's transaction count proves this nonce was consumed.
pub fn consumed_on_chain(nonce: u64, confirmed_count: u64) -> bool {
    nonce < confirmed_count
}

pub struct NonceStoreKeys {
    pub chain_id: u64,
    pub sender: Address,
    pub namespace: Option<String>,
}

impl NonceStoreKeys {
    fn prefix(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:relay:nonce:{}:{}", self.chain_id, self.sender),
            None => format!("relay:nonce:{}:{}", self.chain_id, self.sender),
        }
    }

    /// The next fresh nonce, atomically incremented. Value N means nonces
    /// `[0, N)` have been handed out or consumed.
    pub fn counter_key(&self) -> String {
        format!("{}:counter", self.prefix())
    }

    /// Zset of free nonces scored by nonce so allocation pops the lowest.
    pub fn recycled_key(&self) -> String {
        format!("{}:recycled", self.prefix())
    }

    /// Hash nonce -> recycled_at millis, for abandonment expiry.
    pub fn recycled_at_key(&self) -> String {
        format!("{}:recycled_at", self.prefix())
    }

    /// Hash nonce -> queue_id of in-flight broadcasts.
    pub fn sent_key(&self) -> String {
        format!("{}:sent", self.prefix())
    }

    /// Chain transaction count at last resync.
    pub fn confirmed_key(&self) -> String {
        format!("{}:confirmed", self.prefix())
    }
}

/// Per-(chain, sender) strictly increasing counter with a recycle pool.
///
/// Allocation is a single server-side script: pop the lowest recycled nonce
/// or increment the counter, never read-then-write across an await. Two
/// concurrent callers can never receive the same value.
pub struct NonceAllocator {
    pub redis: ConnectionManager,
    pub namespace: Option<String>,
}

impl NonceAllocator {
    pub fn new(redis: ConnectionManager, namespace: Option<String>) -> Self {
        Self { redis, namespace }
    }

    pub fn keys(&self, chain_id: u64, sender: Address) -> NonceStoreKeys {
        NonceStoreKeys {
            chain_id,
            sender,
            namespace: self.namespace.clone(),
        }
    }

    pub async fn allocate(
        &self,
        chain_id: u64,
        sender: Address,
    ) -> Result<AllocatedNonce, NonceStoreError> {
        let keys = self.keys(chain_id, sender);

        let script = relayq::redis::Script::new(
            r#"
            local recycled = KEYS[1]
            local recycled_at = KEYS[2]
            local counter = KEYS[3]

            local popped = redis.call('ZPOPMIN', recycled, 1)
            if #popped > 0 then
                redis.call('HDEL', recycled_at, popped[1])
                return { 'recycled', popped[1] }
            end

            if redis.call('EXISTS', counter) == 0 then
                return { 'unsynced', '0' }
            end

            local next = redis.call('INCR', counter)
            return { 'fresh', tostring(next - 1) }
            "#,
        );

        let (kind, nonce): (String, String) = script
            .key(keys.recycled_key())
            .key(keys.recycled_at_key())
            .key(keys.counter_key())
            .invoke_async(&mut self.redis.clone())
            .await?;

        let nonce: u64 = nonce
            .parse()
            .map_err(|_| NonceStoreError::CorruptState {
                message: format!("non-numeric nonce '{nonce}' in allocation reply"),
            })?;

        match kind.as_str() {
            "recycled" => Ok(AllocatedNonce::Recycled(nonce)),
            "fresh" => Ok(AllocatedNonce::Fresh(nonce)),
            "unsynced" => Err(NonceStoreError::SyncRequired { chain_id, sender }),
            other => Err(NonceStoreError::CorruptState {
                message: format!("unknown allocation kind '{other}'"),
            }),
        }
    }

    /// First-time seeding of the counter from the chain's transaction count.
    /// A no-op when the counter already exists, so racing workers are safe.
    pub async fn initialize_if_absent(
        &self,
        chain_id: u64,
        sender: Address,
        chain_transaction_count: u64,
    ) -> Result<bool, NonceStoreError> {
        let keys = self.keys(chain_id, sender);
        let mut conn = self.redis.clone();

        let seeded: bool = conn
            .set_nx(keys.counter_key(), chain_transaction_count)
            .await?;
        let _: bool = conn
            .set_nx(keys.confirmed_key(), chain_transaction_count)
            .await?;

        if seeded {
            tracing::info!(
                chain_id = chain_id,
                sender = %sender,
                chain_transaction_count = chain_transaction_count,
                "seeded nonce counter from chain"
            );
        }

        Ok(seeded)
    }

    /// Return a nonce that was allocated but is known never to have been (or
    /// never will be) offered to the network. Rejected when resync has
    /// already observed the nonce as consumed.
    pub async fn recycle(
        &self,
        chain_id: u64,
        sender: Address,
        nonce: u64,
    ) -> Result<RecycleOutcome, NonceStoreError> {
        let keys = self.keys(chain_id, sender);
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;

        let script = relayq::redis::Script::new(
            r#"
            local recycled = KEYS[1]
            local recycled_at = KEYS[2]
            local sent = KEYS[3]
            local confirmed = KEYS[4]

            local nonce = tonumber(ARGV[1])
            local now = ARGV[2]

            redis.call('HDEL', sent, nonce)

            local confirmed_count = tonumber(redis.call('GET', confirmed) or '0')
            if nonce < confirmed_count then
                return 'consumed'
            end

            redis.call('ZADD', recycled, nonce, nonce)
            redis.call('HSET', recycled_at, nonce, now)
            return 'recycled'
            "#,
        );

        let outcome: String = script
            .key(keys.recycled_key())
            .key(keys.recycled_at_key())
            .key(keys.sent_key())
            .key(keys.confirmed_key())
            .arg(nonce)
            .arg(now)
            .invoke_async(&mut self.redis.clone())
            .await?;

        match outcome.as_str() {
            "recycled" => {
                tracing::debug!(chain_id, sender = %sender, nonce, "nonce recycled");
                Ok(RecycleOutcome::Recycled)
            }
            _ => {
                tracing::warn!(
                    chain_id,
                    sender = %sender,
                    nonce,
                    "recycle rejected, chain already consumed this nonce"
                );
                Ok(RecycleOutcome::AlreadyConsumed)
            }
        }
    }

    /// Record that `nonce` is now in flight for `queue_id`.
    pub async fn mark_sent(
        &self,
        chain_id: u64,
        sender: Address,
        nonce: u64,
        queue_id: &str,
    ) -> Result<(), NonceStoreError> {
        let keys = self.keys(chain_id, sender);
        let mut conn = self.redis.clone();

        let mut pipeline = relayq::redis::pipe();
        pipeline.atomic();
        pipeline
            .zrem(keys.recycled_key(), nonce)
            .hdel(keys.recycled_at_key(), nonce)
            .hset(keys.sent_key(), nonce, queue_id);
        pipeline
            .query_async::<Vec<relayq::redis::Value>>(&mut conn)
            .await?;

        Ok(())
    }

    /// Drop a nonce from in-flight bookkeeping permanently once mined.
    pub async fn mark_consumed(
        &self,
        chain_id: u64,
        sender: Address,
        nonce: u64,
    ) -> Result<(), NonceStoreError> {
        let keys = self.keys(chain_id, sender);
        let mut conn = self.redis.clone();
        let _: u32 = conn.hdel(keys.sent_key(), nonce).await?;
        Ok(())
    }

    pub async fn sent_nonces(
        &self,
        chain_id: u64,
        sender: Address,
    ) -> Result<Vec<SentNonce>, NonceStoreError> {
        let keys = self.keys(chain_id, sender);
        let mut conn = self.redis.clone();

        let entries: std::collections::HashMap<String, String> =
            conn.hgetall(keys.sent_key()).await?;

        let mut sent = Vec::with_capacity(entries.len());
        for (nonce, queue_id) in entries {
            let nonce = nonce.parse().map_err(|_| NonceStoreError::CorruptState {
                message: format!("non-numeric nonce '{nonce}' in sent map"),
            })?;
            sent.push(SentNonce { nonce, queue_id });
        }
        sent.sort_by_key(|entry| entry.nonce);
        Ok(sent)
    }

    /// In-flight nonces strictly below the chain's transaction count, i.e.
    /// slots the chain has already consumed one way or another.
    pub async fn sent_below(
        &self,
        chain_id: u64,
        sender: Address,
        below: u64,
    ) -> Result<Vec<SentNonce>, NonceStoreError> {
        let mut sent = self.sent_nonces(chain_id, sender).await?;
        sent.retain(|entry| entry.nonce < below);
        Ok(sent)
    }

    pub async fn recycled_nonces(
        &self,
        chain_id: u64,
        sender: Address,
    ) -> Result<Vec<RecycledNonce>, NonceStoreError> {
        let keys = self.keys(chain_id, sender);
        let mut conn = self.redis.clone();

        let nonces: Vec<u64> = conn.zrange(keys.recycled_key(), 0, -1).await?;
        let recycled_at: std::collections::HashMap<String, String> =
            conn.hgetall(keys.recycled_at_key()).await?;

        Ok(nonces
            .into_iter()
            .map(|nonce| RecycledNonce {
                nonce,
                recycled_at: recycled_at
                    .get(&nonce.to_string())
                    .and_then(|at| at.parse().ok())
                    .unwrap_or(0),
            })
            .collect())
    }

    pub async fn snapshot(
        &self,
        chain_id: u64,
        sender: Address,
    ) -> Result<NonceStateSnapshot, NonceStoreError> {
        let keys = self.keys(chain_id, sender);
        let mut conn = self.redis.clone();

        let (allocated_count, confirmed_count): (Option<u64>, Option<u64>) =
            relayq::redis::pipe()
                .get(keys.counter_key())
                .get(keys.confirmed_key())
                .query_async(&mut conn)
                .await?;

        Ok(NonceStateSnapshot {
            allocated_count,
            confirmed_count,
            recycled: self.recycled_nonces(chain_id, sender).await?,
            sent: self.sent_nonces(chain_id, sender).await?,
        })
    }

    pub async fn confirmed_count(
        &self,
        chain_id: u64,
        sender: Address,
    ) -> Result<Option<u64>, NonceStoreError> {
        let keys = self.keys(chain_id, sender);
        let mut conn = self.redis.clone();
        let count: Option<u64> = conn.get(keys.confirmed_key()).await?;
        Ok(count)
    }

    /// Record the chain's transaction count observed by resync and purge
    /// recycled nonces the chain has consumed out from under us: they can
    /// never be offered again.
    pub async fn advance_confirmed_count(
        &self,
        chain_id: u64,
        sender: Address,
        chain_transaction_count: u64,
    ) -> Result<u64, NonceStoreError> {
        let keys = self.keys(chain_id, sender);

        let script = relayq::redis::Script::new(
            r#"
            local confirmed = KEYS[1]
            local recycled = KEYS[2]
            local recycled_at = KEYS[3]
            local counter = KEYS[4]

            local count = tonumber(ARGV[1])

            redis.call('SET', confirmed, count)

            -- the counter can never lag the chain: someone consumed nonces
            -- outside our bookkeeping
            local current = tonumber(redis.call('GET', counter) or '0')
            if count > current then
                redis.call('SET', counter, count)
            end

            local stale = redis.call('ZRANGEBYSCORE', recycled, 0, count - 1)
            for _, nonce in ipairs(stale) do
                redis.call('HDEL', recycled_at, nonce)
            end
            if #stale > 0 then
                redis.call('ZREMRANGEBYSCORE', recycled, 0, count - 1)
            end
            return #stale
            "#,
        );

        let dropped: u64 = script
            .key(keys.confirmed_key())
            .key(keys.recycled_key())
            .key(keys.recycled_at_key())
            .key(keys.counter_key())
            .arg(chain_transaction_count)
            .invoke_async(&mut self.redis.clone())
            .await?;

        if dropped > 0 {
            tracing::info!(
                chain_id,
                sender = %sender,
                dropped = dropped,
                chain_transaction_count,
                "dropped recycled nonces already consumed on chain"
            );
        }

        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_names_are_scoped_per_chain_and_sender() {
        let keys = NonceStoreKeys {
            chain_id: 137,
            sender: Address::ZERO,
            namespace: None,
        };
        let prefix = format!("relay:nonce:137:{}", Address::ZERO);
        assert_eq!(keys.counter_key(), format!("{prefix}:counter"));
        assert_eq!(keys.recycled_key(), format!("{prefix}:recycled"));
        assert_eq!(keys.sent_key(), format!("{prefix}:sent"));

        let namespaced = NonceStoreKeys {
            chain_id: 137,
            sender: Address::ZERO,
            namespace: Some("staging".to_string()),
        };
        assert!(namespaced.counter_key().starts_with("staging:relay:nonce:"));
    }

    #[test]
    fn chain_consumption_is_strictly_below_the_count() {
        // Transaction count 7 means nonces 0..=6 are consumed.
        assert!(consumed_on_chain(6, 7));
        assert!(!consumed_on_chain(7, 7));
        assert!(!consumed_on_chain(8, 7));
    }

    #[test]
    fn allocated_nonce_reports_its_origin() {
        assert_eq!(AllocatedNonce::Recycled(5).value(), 5);
        assert_eq!(AllocatedNonce::Fresh(6).value(), 6);
        assert!(AllocatedNonce::Recycled(5).is_recycled());
        assert!(!AllocatedNonce::Fresh(6).is_recycled());
    }

    #[test]
    fn cancellation_entries_are_distinguishable_from_transactions() {
        let cancellation = SentNonce {
            nonce: 4,
            queue_id: format!("{CANCELLATION_ID_PREFIX}0xabc"),
        };
        let real = SentNonce {
            nonce: 5,
            queue_id: "8b9c0d".to_string(),
        };
        assert!(cancellation.is_cancellation());
        assert!(!real.is_cancellation());
    }
}
