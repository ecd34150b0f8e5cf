//! Lifecycle walks of the queue state machine: happy path, pre-broadcast
//! rejection, gas-bumped resend and external nonce consumption.

use relay_executors::nonce::{SentNonce, consumed_on_chain};
use relay_executors::pipeline::{
    RelayWorkerError, is_retryable_preparation_error,
};
use relay_executors::store::{
    GasFees, MinedReceipt, PhasePatch, TransactionPhase, TransactionStatus,
};
use relay_core::error::{RelayError, RpcErrorKind, RpcErrorResponse};

fn fees(max_fee: u128, priority: u128) -> GasFees {
    GasFees::Eip1559 {
        max_fee_per_gas: max_fee,
        max_priority_fee_per_gas: priority,
    }
}

fn success_receipt(block: u64) -> MinedReceipt {
    MinedReceipt {
        block_number: block,
        effective_gas_price: 30_000_000_000,
        cumulative_gas_used: 21_000,
        onchain_success: true,
    }
}

/// Broadcast accepted, receipt appears: queued -> sent -> mined with exactly
/// one broadcast hash and the allocated nonce intact.
#[test]
fn send_then_confirm_happy_path() {
    let phase = TransactionPhase::Queued;

    let phase = PhasePatch::MarkSent {
        nonce: 5,
        hash: "0xaaa".to_string(),
        fees: fees(100, 2),
        at: 1_000,
    }
    .apply(&phase)
    .unwrap();

    assert_eq!(phase.status(), TransactionStatus::Sent);
    assert_eq!(phase.nonce(), Some(5));

    let phase = PhasePatch::MarkMined {
        hash: "0xaaa".to_string(),
        receipt: success_receipt(42),
        at: 2_000,
    }
    .apply(&phase)
    .unwrap();

    match phase {
        TransactionPhase::Mined(mined) => {
            assert_eq!(mined.nonce, 5);
            assert_eq!(mined.hash, "0xaaa");
            assert!(mined.receipt.onchain_success);
        }
        other => panic!("expected mined, got {other:?}"),
    }
}

/// Once mined, no further broadcast-side transition may touch the record.
#[test]
fn mined_records_accept_no_further_broadcasts() {
    let sent = PhasePatch::MarkSent {
        nonce: 5,
        hash: "0xaaa".to_string(),
        fees: fees(100, 2),
        at: 1_000,
    }
    .apply(&TransactionPhase::Queued)
    .unwrap();

    let mined = PhasePatch::MarkMined {
        hash: "0xaaa".to_string(),
        receipt: success_receipt(42),
        at: 2_000,
    }
    .apply(&sent)
    .unwrap();

    let resend = PhasePatch::AppendResend {
        hash: "0xbbb".to_string(),
        fees: fees(120, 3),
        at: 3_000,
    };
    assert!(!resend.allowed_from().contains(&mined.status()));
    assert!(resend.apply(&mined).is_err());
}

/// Simulation failure before broadcast is deterministic: the job must not
/// retry, the record errors, and the nonce goes back to the pool (Scenario B;
/// pool pop order is covered by the allocator's lowest-first contract).
#[test]
fn pre_broadcast_rejection_is_terminal_and_not_retried() {
    let simulation_failure = RelayWorkerError::SimulationFailed {
        message: "execution reverted: insufficient balance".to_string(),
        inner: RelayError::RpcError {
            chain_id: 137,
            rpc_url: "http://localhost:8545".to_string(),
            message: "execution reverted".to_string(),
            kind: RpcErrorKind::ErrorResp(RpcErrorResponse {
                code: 3,
                message: "execution reverted: insufficient balance".to_string(),
                data: None,
            }),
        },
    };
    assert!(!is_retryable_preparation_error(&simulation_failure));

    let errored = PhasePatch::MarkErrored {
        error_message: simulation_failure.to_string(),
        at: 1_000,
    }
    .apply(&TransactionPhase::Queued)
    .unwrap();
    assert_eq!(errored.status(), TransactionStatus::Errored);
    // No nonce was ever attached to the record.
    assert_eq!(errored.nonce(), None);
}

/// Timeout, fee-bumped resend at the same nonce, receipt for the second
/// hash: the mined record references the replacement only (Scenario C).
#[test]
fn resend_keeps_nonce_and_mines_under_the_replacement_hash() {
    let original_fees = fees(100, 2);

    let sent = PhasePatch::MarkSent {
        nonce: 5,
        hash: "0xaaa".to_string(),
        fees: original_fees,
        at: 1_000,
    }
    .apply(&TransactionPhase::Queued)
    .unwrap();

    let bumped = original_fees.escalated(fees(90, 1), 120);
    match bumped {
        GasFees::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => {
            assert!(max_fee_per_gas > 100);
            assert!(max_priority_fee_per_gas > 2);
        }
        _ => panic!("expected EIP-1559 fees"),
    }

    let resent = PhasePatch::AppendResend {
        hash: "0xbbb".to_string(),
        fees: bumped,
        at: 2_000,
    }
    .apply(&sent)
    .unwrap();

    match &resent {
        TransactionPhase::Sent(sent) => {
            assert_eq!(sent.nonce, 5);
            assert_eq!(sent.sent_hashes, vec!["0xaaa", "0xbbb"]);
            assert_eq!(sent.resend_count, 1);
            // The timeout clock restarts at the resend.
            assert_eq!(sent.last_attempt_at, 2_000);
        }
        other => panic!("expected sent, got {other:?}"),
    }

    let mined = PhasePatch::MarkMined {
        hash: "0xbbb".to_string(),
        receipt: success_receipt(43),
        at: 3_000,
    }
    .apply(&resent)
    .unwrap();

    match mined {
        TransactionPhase::Mined(mined) => {
            assert_eq!(mined.hash, "0xbbb");
            assert_eq!(mined.nonce, 5);
        }
        other => panic!("expected mined, got {other:?}"),
    }
}

/// Chain transaction count moved past a nonce the relay believed in flight:
/// the nonce is externally consumed and its record errors out (Scenario D).
#[test]
fn externally_consumed_nonces_are_reconciled_against_the_chain() {
    let chain_count = 7;
    let sent = vec![
        SentNonce {
            nonce: 5,
            queue_id: "q5".to_string(),
        },
        SentNonce {
            nonce: 6,
            queue_id: "q6".to_string(),
        },
        SentNonce {
            nonce: 7,
            queue_id: "q7".to_string(),
        },
    ];

    let consumed: Vec<_> = sent
        .iter()
        .filter(|entry| consumed_on_chain(entry.nonce, chain_count))
        .collect();
    assert_eq!(consumed.len(), 2);
    assert!(consumed.iter().all(|entry| entry.nonce < 7));

    // Each consumed record with no locatable receipt moves sent -> errored.
    let phase = PhasePatch::MarkSent {
        nonce: 6,
        hash: "0xccc".to_string(),
        fees: fees(100, 2),
        at: 1_000,
    }
    .apply(&TransactionPhase::Queued)
    .unwrap();

    let errored = PhasePatch::MarkErrored {
        error_message: "nonce 6 consumed outside the relay; outcome unknown".to_string(),
        at: 2_000,
    }
    .apply(&phase)
    .unwrap();
    assert_eq!(errored.status(), TransactionStatus::Errored);
}

/// An abandoned nonce is cancelled rather than left to wedge the sender:
/// cancellation transitions capture the claimed nonce.
#[test]
fn explicit_cancellation_records_the_claimed_nonce() {
    let sent = PhasePatch::MarkSent {
        nonce: 9,
        hash: "0xddd".to_string(),
        fees: fees(100, 2),
        at: 1_000,
    }
    .apply(&TransactionPhase::Queued)
    .unwrap();

    let cancelled = PhasePatch::MarkCancelled { at: 2_000 }.apply(&sent).unwrap();
    match cancelled {
        TransactionPhase::Cancelled(cancelled) => {
            assert_eq!(cancelled.nonce, Some(9));
            assert_eq!(cancelled.cancelled_at, 2_000);
        }
        other => panic!("expected cancelled, got {other:?}"),
    }
}
