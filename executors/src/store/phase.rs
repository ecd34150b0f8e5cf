use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// The five lifecycle states of a queued transaction. Each variant carries
/// exactly the fields that are valid in that state; receipt data only exists
/// once mined, an error message only once errored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum TransactionPhase {
    Queued,
    Sent(SentPhase),
    Mined(MinedPhase),
    Errored(ErroredPhase),
    Cancelled(CancelledPhase),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentPhase {
    pub nonce: u64,
    pub sent_at: u64,
    /// Timestamp of the newest broadcast for this record; the confirmation
    /// timeout is measured from here, not from the first send.
    pub last_attempt_at: u64,
    /// Every hash ever broadcast for this queue ID, oldest first. The last
    /// entry is the canonical candidate.
    pub sent_hashes: Vec<String>,
    pub resend_count: u32,
    /// Fees of the newest attempt; a resend must strictly outbid these.
    pub last_fees: GasFees,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinedPhase {
    pub nonce: u64,
    /// The hash that actually landed, which is not necessarily the first one
    /// broadcast.
    pub hash: String,
    pub mined_at: u64,
    pub receipt: MinedReceipt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinedReceipt {
    pub block_number: u64,
    pub effective_gas_price: u128,
    pub cumulative_gas_used: u64,
    /// An onchain revert still consumed the nonce and spent gas; it is mined
    /// with this flag false, never errored.
    pub onchain_success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErroredPhase {
    pub error_message: String,
    pub errored_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledPhase {
    pub cancelled_at: u64,
    /// Set when the transaction had already claimed a nonce at cancellation
    /// time.
    pub nonce: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionStatus {
    Queued,
    Sent,
    Mined,
    Errored,
    Cancelled,
}

impl Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::Queued => write!(f, "queued"),
            TransactionStatus::Sent => write!(f, "sent"),
            TransactionStatus::Mined => write!(f, "mined"),
            TransactionStatus::Errored => write!(f, "errored"),
            TransactionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Mined | TransactionStatus::Errored | TransactionStatus::Cancelled
        )
    }
}

impl TransactionPhase {
    pub fn status(&self) -> TransactionStatus {
        match self {
            TransactionPhase::Queued => TransactionStatus::Queued,
            TransactionPhase::Sent(_) => TransactionStatus::Sent,
            TransactionPhase::Mined(_) => TransactionStatus::Mined,
            TransactionPhase::Errored(_) => TransactionStatus::Errored,
            TransactionPhase::Cancelled(_) => TransactionStatus::Cancelled,
        }
    }

    pub fn nonce(&self) -> Option<u64> {
        match self {
            TransactionPhase::Queued | TransactionPhase::Errored(_) => None,
            TransactionPhase::Sent(sent) => Some(sent.nonce),
            TransactionPhase::Mined(mined) => Some(mined.nonce),
            TransactionPhase::Cancelled(cancelled) => cancelled.nonce,
        }
    }

    /// The newest broadcast hash, if any was ever broadcast.
    pub fn latest_hash(&self) -> Option<&str> {
        match self {
            TransactionPhase::Sent(sent) => sent.sent_hashes.last().map(String::as_str),
            TransactionPhase::Mined(mined) => Some(&mined.hash),
            _ => None,
        }
    }
}

/// Fees of one broadcast attempt, kept so the next attempt at the same nonce
/// can always outbid the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "feeKind", rename_all = "camelCase")]
pub enum GasFees {
    Legacy {
        gas_price: u128,
    },
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
}

fn bump_component(value: u128, percent: u32) -> u128 {
    (value.saturating_mul(percent as u128) / 100).max(value.saturating_add(1))
}

impl GasFees {
    /// Multiply every component by `percent / 100`, never returning a value
    /// equal to the input: replacement transactions must strictly outbid.
    pub fn bumped(self, percent: u32) -> GasFees {
        match self {
            GasFees::Legacy { gas_price } => GasFees::Legacy {
                gas_price: bump_component(gas_price, percent),
            },
            GasFees::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasFees::Eip1559 {
                max_fee_per_gas: bump_component(max_fee_per_gas, percent),
                max_priority_fee_per_gas: bump_component(max_priority_fee_per_gas, percent),
            },
        }
    }

    /// Fees for a resend: the fresh network estimate when it already outbids
    /// the previous attempt, else the previous attempt bumped by `percent`.
    /// The result is strictly higher than `self` in every component.
    pub fn escalated(self, fresh: GasFees, percent: u32) -> GasFees {
        let floor = self.bumped(percent);
        match (floor, fresh) {
            (
                GasFees::Legacy { gas_price: floor },
                GasFees::Legacy { gas_price: fresh },
            ) => GasFees::Legacy {
                gas_price: floor.max(fresh),
            },
            (
                GasFees::Eip1559 {
                    max_fee_per_gas: floor_max,
                    max_priority_fee_per_gas: floor_priority,
                },
                GasFees::Eip1559 {
                    max_fee_per_gas: fresh_max,
                    max_priority_fee_per_gas: fresh_priority,
                },
            ) => GasFees::Eip1559 {
                max_fee_per_gas: floor_max.max(fresh_max),
                max_priority_fee_per_gas: floor_priority.max(fresh_priority),
            },
            // Fee market changed shape between attempts; the bumped previous
            // attempt is the only value guaranteed comparable.
            (floor, _) => floor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_is_strictly_monotonic_even_for_tiny_values() {
        let fees = GasFees::Legacy { gas_price: 1 };
        match fees.bumped(120) {
            GasFees::Legacy { gas_price } => assert!(gas_price > 1),
            _ => unreachable!(),
        }

        let fees = GasFees::Eip1559 {
            max_fee_per_gas: 30_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
        };
        match fees.bumped(120) {
            GasFees::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                assert_eq!(max_fee_per_gas, 36_000_000_000);
                assert_eq!(max_priority_fee_per_gas, 1_200_000_000);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn escalation_takes_fresh_estimate_when_it_outbids_the_bump() {
        let previous = GasFees::Eip1559 {
            max_fee_per_gas: 10,
            max_priority_fee_per_gas: 2,
        };
        let fresh = GasFees::Eip1559 {
            max_fee_per_gas: 100,
            max_priority_fee_per_gas: 50,
        };
        assert_eq!(previous.escalated(fresh, 120), fresh);
    }

    #[test]
    fn escalation_never_drops_below_the_bumped_previous_attempt() {
        let previous = GasFees::Legacy { gas_price: 100 };
        let stale_market = GasFees::Legacy { gas_price: 10 };
        assert_eq!(
            previous.escalated(stale_market, 120),
            GasFees::Legacy { gas_price: 120 }
        );
    }

    #[test]
    fn escalation_across_fee_kinds_keeps_the_previous_kind() {
        let previous = GasFees::Legacy { gas_price: 100 };
        let fresh = GasFees::Eip1559 {
            max_fee_per_gas: 1,
            max_priority_fee_per_gas: 1,
        };
        assert_eq!(
            previous.escalated(fresh, 150),
            GasFees::Legacy { gas_price: 150 }
        );
    }

    #[test]
    fn phase_accessors_expose_only_valid_fields() {
        assert_eq!(TransactionPhase::Queued.nonce(), None);
        assert_eq!(TransactionPhase::Queued.latest_hash(), None);

        let sent = TransactionPhase::Sent(SentPhase {
            nonce: 5,
            sent_at: 1,
            last_attempt_at: 2,
            sent_hashes: vec!["0xaa".to_string(), "0xbb".to_string()],
            resend_count: 1,
            last_fees: GasFees::Legacy { gas_price: 7 },
        });
        assert_eq!(sent.nonce(), Some(5));
        assert_eq!(sent.latest_hash(), Some("0xbb"));
        assert!(!sent.status().is_terminal());

        let mined = TransactionPhase::Mined(MinedPhase {
            nonce: 5,
            hash: "0xbb".to_string(),
            mined_at: 3,
            receipt: MinedReceipt {
                block_number: 100,
                effective_gas_price: 25,
                cumulative_gas_used: 21_000,
                onchain_success: false,
            },
        });
        assert!(mined.status().is_terminal());
        assert_eq!(mined.latest_hash(), Some("0xbb"));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&TransactionStatus::Errored).unwrap();
        assert_eq!(json, r#""errored""#);
        assert_eq!(TransactionStatus::Errored.to_string(), "errored");
    }
}
