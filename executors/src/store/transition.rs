use std::fmt::Display;

use relayq::redis::{AsyncCommands, Pipeline, aio::ConnectionManager};
use serde::{Deserialize, Serialize};

use crate::store::QueuedTransaction;
use crate::store::error::TransactionStoreError;
use crate::store::phase::{
    CancelledPhase, ErroredPhase, GasFees, MinedPhase, MinedReceipt, SentPhase, TransactionPhase,
    TransactionStatus,
};

const MAX_RETRIES: u32 = 10;
const RETRY_BASE_DELAY_MS: u64 = 10;

/// A compare-and-set mutation of transaction lifecycle state.
///
/// Validation names the statuses it may be applied from; a record that has
/// already been advanced by another worker yields [`TransitionOutcome::Stale`]
/// instead of clobbering the newer state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "patch", rename_all = "camelCase")]
pub enum PhasePatch {
    MarkSent {
        nonce: u64,
        hash: String,
        fees: GasFees,
        at: u64,
    },
    AppendResend {
        hash: String,
        fees: GasFees,
        at: u64,
    },
    MarkMined {
        hash: String,
        receipt: MinedReceipt,
        at: u64,
    },
    MarkErrored {
        error_message: String,
        at: u64,
    },
    MarkCancelled {
        at: u64,
    },
}

impl Display for PhasePatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhasePatch::MarkSent { .. } => write!(f, "mark-sent"),
            PhasePatch::AppendResend { .. } => write!(f, "append-resend"),
            PhasePatch::MarkMined { .. } => write!(f, "mark-mined"),
            PhasePatch::MarkErrored { .. } => write!(f, "mark-errored"),
            PhasePatch::MarkCancelled { .. } => write!(f, "mark-cancelled"),
        }
    }
}

impl PhasePatch {
    pub fn allowed_from(&self) -> &'static [TransactionStatus] {
        match self {
            PhasePatch::MarkSent { .. } => &[TransactionStatus::Queued],
            PhasePatch::AppendResend { .. } => &[TransactionStatus::Sent],
            PhasePatch::MarkMined { .. } => &[TransactionStatus::Sent],
            PhasePatch::MarkErrored { .. } => {
                &[TransactionStatus::Queued, TransactionStatus::Sent]
            }
            PhasePatch::MarkCancelled { .. } => {
                &[TransactionStatus::Queued, TransactionStatus::Sent]
            }
        }
    }

    /// Compute the successor phase. Pure; callers check `allowed_from` first
    /// but an illegal pairing still fails instead of corrupting state.
    pub fn apply(self, current: &TransactionPhase) -> Result<TransactionPhase, IllegalPatch> {
        let from = current.status();
        let illegal = |patch: &PhasePatch| IllegalPatch {
            from,
            patch: patch.to_string(),
        };

        match (self, current) {
            (
                PhasePatch::MarkSent {
                    nonce,
                    hash,
                    fees,
                    at,
                },
                TransactionPhase::Queued,
            ) => Ok(TransactionPhase::Sent(SentPhase {
                nonce,
                sent_at: at,
                last_attempt_at: at,
                sent_hashes: vec![hash],
                resend_count: 0,
                last_fees: fees,
            })),

            (PhasePatch::AppendResend { hash, fees, at }, TransactionPhase::Sent(sent)) => {
                let mut sent = sent.clone();
                sent.sent_hashes.push(hash);
                sent.resend_count += 1;
                sent.last_attempt_at = at;
                sent.last_fees = fees;
                Ok(TransactionPhase::Sent(sent))
            }

            (PhasePatch::MarkMined { hash, receipt, at }, TransactionPhase::Sent(sent)) => {
                Ok(TransactionPhase::Mined(MinedPhase {
                    nonce: sent.nonce,
                    hash,
                    mined_at: at,
                    receipt,
                }))
            }

            (PhasePatch::MarkErrored { error_message, at }, TransactionPhase::Queued)
            | (PhasePatch::MarkErrored { error_message, at }, TransactionPhase::Sent(_)) => {
                Ok(TransactionPhase::Errored(ErroredPhase {
                    error_message,
                    errored_at: at,
                }))
            }

            (PhasePatch::MarkCancelled { at }, TransactionPhase::Queued)
            | (PhasePatch::MarkCancelled { at }, TransactionPhase::Sent(_)) => {
                Ok(TransactionPhase::Cancelled(CancelledPhase {
                    cancelled_at: at,
                    nonce: current.nonce(),
                }))
            }

            (patch, _) => Err(illegal(&patch)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IllegalPatch {
    pub from: TransactionStatus,
    pub patch: String,
}

#[derive(Debug)]
pub enum TransitionOutcome {
    /// The patch was applied; the boxed record is the post-transition snapshot.
    Applied(Box<QueuedTransaction>),
    /// Another worker advanced the record first; nothing was written.
    Stale { actual: TransactionStatus },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

/// A multi-key Redis mutation guarded by WATCH. Validation runs inside the
/// WATCH window; staging appends to a MULTI/EXEC pipeline. If any watched key
/// changes before EXEC, the whole operation retries with backoff.
pub trait AtomicRedisOp: Send + Sync {
    type Staged: Send;
    type Outcome: Send;

    fn name(&self) -> &str;
    fn watch_keys(&self) -> Vec<String>;

    fn validate(
        &self,
        conn: &mut ConnectionManager,
    ) -> impl Future<Output = Result<Validation<Self::Staged, Self::Outcome>, TransactionStoreError>>
    + Send;

    fn stage(
        &self,
        pipeline: &mut Pipeline,
        staged: Self::Staged,
    ) -> Result<Self::Outcome, TransactionStoreError>;
}

/// Validation either stages a mutation or short-circuits with an outcome
/// (e.g. a stale CAS) without touching the pipeline.
pub enum Validation<S, O> {
    Proceed(S),
    Abort(O),
}

pub async fn execute_with_watch_and_retry<T: AtomicRedisOp>(
    redis: &ConnectionManager,
    op: &T,
) -> Result<T::Outcome, TransactionStoreError> {
    let mut conn = redis.clone();
    let mut retry_count = 0;

    loop {
        if retry_count >= MAX_RETRIES {
            return Err(TransactionStoreError::WatchRetriesExhausted {
                operation: op.name().to_string(),
            });
        }

        if retry_count > 0 {
            let delay_ms = RETRY_BASE_DELAY_MS * (1 << (retry_count - 1).min(6));
            tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
            tracing::debug!(
                retry_count = retry_count,
                delay_ms = delay_ms,
                operation = op.name(),
                "retrying atomic operation"
            );
        }

        let mut watch_cmd = relayq::redis::cmd("WATCH");
        for key in op.watch_keys() {
            watch_cmd.arg(key);
        }
        let _: () = watch_cmd.query_async(&mut conn).await?;

        match op.validate(&mut conn).await {
            Ok(Validation::Proceed(staged)) => {
                let mut pipeline = relayq::redis::pipe();
                pipeline.atomic();
                let outcome = op.stage(&mut pipeline, staged)?;

                match pipeline
                    .query_async::<Vec<relayq::redis::Value>>(&mut conn)
                    .await
                {
                    Ok(_) => return Ok(outcome),
                    Err(_) => {
                        // A watched key moved under us; re-validate and retry.
                        retry_count += 1;
                        continue;
                    }
                }
            }
            Ok(Validation::Abort(outcome)) => {
                let _: () = relayq::redis::cmd("UNWATCH").query_async(&mut conn).await?;
                return Ok(outcome);
            }
            Err(e) => {
                let _: () = relayq::redis::cmd("UNWATCH").query_async(&mut conn).await?;
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent_phase() -> TransactionPhase {
        TransactionPhase::Sent(SentPhase {
            nonce: 5,
            sent_at: 10,
            last_attempt_at: 10,
            sent_hashes: vec!["0xaa".to_string()],
            resend_count: 0,
            last_fees: GasFees::Legacy { gas_price: 100 },
        })
    }

    fn receipt(success: bool) -> MinedReceipt {
        MinedReceipt {
            block_number: 42,
            effective_gas_price: 110,
            cumulative_gas_used: 21_000,
            onchain_success: success,
        }
    }

    #[test]
    fn mark_sent_is_only_legal_from_queued() {
        let patch = PhasePatch::MarkSent {
            nonce: 5,
            hash: "0xaa".to_string(),
            fees: GasFees::Legacy { gas_price: 100 },
            at: 10,
        };
        assert_eq!(patch.allowed_from(), &[TransactionStatus::Queued]);

        let next = patch.clone().apply(&TransactionPhase::Queued).unwrap();
        assert_eq!(next.status(), TransactionStatus::Sent);
        assert_eq!(next.nonce(), Some(5));

        assert!(patch.apply(&sent_phase()).is_err());
    }

    #[test]
    fn resend_appends_hash_and_raises_attempt_counters() {
        let patch = PhasePatch::AppendResend {
            hash: "0xbb".to_string(),
            fees: GasFees::Legacy { gas_price: 120 },
            at: 20,
        };
        let next = patch.apply(&sent_phase()).unwrap();
        match next {
            TransactionPhase::Sent(sent) => {
                assert_eq!(sent.sent_hashes, vec!["0xaa", "0xbb"]);
                assert_eq!(sent.resend_count, 1);
                assert_eq!(sent.last_attempt_at, 20);
                assert_eq!(sent.last_fees, GasFees::Legacy { gas_price: 120 });
                // The nonce never changes across resends.
                assert_eq!(sent.nonce, 5);
            }
            _ => panic!("expected sent phase"),
        }
    }

    #[test]
    fn a_revert_is_mined_not_errored() {
        let patch = PhasePatch::MarkMined {
            hash: "0xaa".to_string(),
            receipt: receipt(false),
            at: 30,
        };
        let next = patch.apply(&sent_phase()).unwrap();
        match next {
            TransactionPhase::Mined(mined) => {
                assert!(!mined.receipt.onchain_success);
                assert_eq!(mined.nonce, 5);
            }
            _ => panic!("expected mined phase"),
        }
    }

    #[test]
    fn terminal_states_accept_no_further_patches() {
        let mined = PhasePatch::MarkMined {
            hash: "0xaa".to_string(),
            receipt: receipt(true),
            at: 30,
        }
        .apply(&sent_phase())
        .unwrap();

        let errored = PhasePatch::MarkErrored {
            error_message: "boom".to_string(),
            at: 40,
        };
        assert!(errored.apply(&mined).is_err());

        let cancelled = PhasePatch::MarkCancelled { at: 40 };
        assert!(cancelled.apply(&mined).is_err());
    }

    #[test]
    fn cancellation_captures_the_claimed_nonce() {
        let patch = PhasePatch::MarkCancelled { at: 40 };
        match patch.clone().apply(&sent_phase()).unwrap() {
            TransactionPhase::Cancelled(cancelled) => assert_eq!(cancelled.nonce, Some(5)),
            _ => panic!("expected cancelled phase"),
        }
        match patch.apply(&TransactionPhase::Queued).unwrap() {
            TransactionPhase::Cancelled(cancelled) => assert_eq!(cancelled.nonce, None),
            _ => panic!("expected cancelled phase"),
        }
    }
}
