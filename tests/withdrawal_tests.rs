mod common;

use common::Env;
use tollgate::domain::action::ActionKind;
use tollgate::domain::msats::Msats;
use tollgate::domain::payin::{FailureReason, PayInState, PayoutPurpose};
use tollgate::error::PayError;

#[tokio::test]
async fn test_withdrawal_pays_out_and_refunds_fee_surplus() {
    let env = Env::new();
    env.fund_sats(1, 60_000).await;
    let (bolt11, hash) = env.peer_invoice(50_000);

    let outcome = env
        .submit(
            ActionKind::Withdrawal,
            serde_json::json!({ "bolt11": bolt11, "max_fee_msats": 1_000 }),
            Some(1),
        )
        .await
        .unwrap();
    let id = outcome.payin.id;
    assert_eq!(outcome.payin.state, PayInState::PendingWithdrawal);
    assert_eq!(outcome.payin.custodial_debited(), Msats(51_000));
    assert_eq!(env.balance(1).await, Msats(9_000));
    assert!(env.node.has_pending_payment(&hash));

    env.node.complete_payment(&hash, Msats(400));
    env.pump().await;

    let payin = env.payin(id).await;
    assert_eq!(payin.state, PayInState::Paid);
    let outgoing = payin.outgoing.as_ref().unwrap();
    assert_eq!(outgoing.fee_paid, Some(Msats(400)));
    assert_eq!(payin.payout_total() + outgoing.msats, payin.mcost);

    // the unused fee budget came back to the owner
    let refund = payin
        .pay_out_tokens
        .iter()
        .find(|t| t.purpose == PayoutPurpose::RoutingFeeRefund)
        .unwrap();
    assert_eq!(refund.amount, Msats(600));
    assert_eq!(env.balance(1).await, Msats(9_600));
}

#[tokio::test]
async fn test_failed_withdrawal_refunds_in_full() {
    let env = Env::new();
    env.fund_sats(1, 60_000).await;
    let (bolt11, hash) = env.peer_invoice(50_000);

    let outcome = env
        .submit(
            ActionKind::Withdrawal,
            serde_json::json!({ "bolt11": bolt11, "max_fee_msats": 1_000 }),
            Some(1),
        )
        .await
        .unwrap();

    env.node.fail_payment(&hash, "no route");
    env.pump().await;

    let payin = env.payin(outcome.payin.id).await;
    assert_eq!(payin.state, PayInState::Failed);
    assert_eq!(payin.failure_reason, Some(FailureReason::WithdrawalFailed));
    assert_eq!(payin.refund_tokens, payin.pay_in_tokens);
    assert_eq!(payin.refunded_total(), Msats(51_000));
    assert_eq!(env.balance(1).await, Msats(60_000));
}

#[tokio::test]
async fn test_withdrawal_requires_full_balance() {
    let env = Env::new();
    env.fund_sats(1, 10_000).await;
    let (bolt11, hash) = env.peer_invoice(50_000);

    let err = env
        .submit(
            ActionKind::Withdrawal,
            serde_json::json!({ "bolt11": bolt11, "max_fee_msats": 1_000 }),
            Some(1),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PayError::InsufficientFunds));
    assert_eq!(env.balance(1).await, Msats(10_000));
    assert!(!env.node.has_pending_payment(&hash));
}

#[tokio::test]
async fn test_failed_withdrawal_is_not_retryable() {
    let env = Env::new();
    env.fund_sats(1, 60_000).await;
    let (bolt11, hash) = env.peer_invoice(50_000);

    let outcome = env
        .submit(
            ActionKind::Withdrawal,
            serde_json::json!({ "bolt11": bolt11, "max_fee_msats": 1_000 }),
            Some(1),
        )
        .await
        .unwrap();
    env.node.fail_payment(&hash, "no route");
    env.pump().await;
    assert_eq!(env.payin(outcome.payin.id).await.state, PayInState::Failed);

    let err = env
        .retry
        .retry(outcome.payin.id, tollgate::domain::account::AccountId(1))
        .await
        .unwrap_err();
    assert!(matches!(err, PayError::RetryNotAllowed(_)));
}
