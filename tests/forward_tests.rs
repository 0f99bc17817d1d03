mod common;

use common::Env;
use tollgate::domain::action::ActionKind;
use tollgate::domain::msats::Msats;
use tollgate::domain::payin::{FailureReason, PayInState, PayoutPurpose};
use tollgate::error::PayError;

#[tokio::test]
async fn test_forward_settles_end_to_end() {
    let env = Env::new();
    env.fund_sats(1, 1_000).await;
    env.node.set_route_estimate(Msats(100), 40);
    let (bolt11, peer_hash) = env.peer_invoice(9_000);

    let outcome = env
        .submit(
            ActionKind::Tip,
            serde_json::json!({ "recipient": 2, "msats": 10_000, "bolt11": bolt11 }),
            Some(1),
        )
        .await
        .unwrap();
    let id = outcome.payin.id;
    let payin = &outcome.payin;
    assert_eq!(payin.state, PayInState::PendingHeld);

    // wrapped invoice: recipient share + 1/9 markup + padded fee budget,
    // sharing the outgoing payment hash
    let incoming = payin.incoming.as_ref().unwrap();
    assert_eq!(incoming.hash, peer_hash);
    assert_eq!(incoming.msats_requested, Msats(9_000 + 1_000 + 110));
    assert_eq!(payin.mcost, Msats(10_000 + 1_000 + 110));
    assert_eq!(payin.outgoing.as_ref().unwrap().max_fee, Msats(110));
    assert_eq!(env.balance(1).await, Msats::ZERO);

    env.node.pay_incoming(&incoming.hash, incoming.msats_requested);
    env.pump().await;
    assert_eq!(env.payin(id).await.state, PayInState::Forwarding);
    assert!(env.node.has_pending_payment(&peer_hash));

    env.node.complete_payment(&peer_hash, Msats(60));
    env.pump().await;

    let payin = env.payin(id).await;
    assert_eq!(payin.state, PayInState::Paid);

    // conservation: payouts plus the outgoing amount equal the final cost
    let outgoing = payin.outgoing.as_ref().unwrap();
    assert_eq!(payin.payout_total() + outgoing.msats, payin.mcost);
    assert_eq!(outgoing.fee_paid, Some(Msats(60)));

    // the fee entry was trued down and the surplus pooled
    let fee = payin
        .pay_out_tokens
        .iter()
        .find(|t| t.purpose == PayoutPurpose::RoutingFee)
        .unwrap();
    assert_eq!(fee.amount, Msats(60));
    let pooled: Msats = payin
        .pay_out_tokens
        .iter()
        .filter(|t| t.purpose == PayoutPurpose::RewardsPool)
        .map(|t| t.amount)
        .sum();
    assert_eq!(pooled, Msats(1_000 + 50));

    // the preimage revealed downstream settled our wrapping invoice
    let incoming = payin.incoming.as_ref().unwrap();
    assert!(incoming.confirmed_at.is_some());
    assert_eq!(incoming.preimage, outgoing.preimage);
}

#[tokio::test]
async fn test_wrap_rejection_fails_the_payin_with_refund() {
    let env = Env::new();
    env.fund_sats(1, 200_000).await;
    // 50 sats predicted against a 2% cap
    env.node.set_route_estimate(Msats(50_000), 40);
    let (bolt11, _) = env.peer_invoice(999_900);

    let err = env
        .submit(
            ActionKind::Tip,
            serde_json::json!({ "recipient": 2, "msats": 1_111_000, "bolt11": bolt11 }),
            Some(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PayError::Wrap {
            reason: FailureReason::WrapHighPredictedFee,
            ..
        }
    ));

    // the compensating fail refunded the pool-fee debit
    assert_eq!(env.balance(1).await, Msats(200_000));
    assert!(env.store.pending_payins().await.is_empty());
}

#[tokio::test]
async fn test_failed_forward_unwinds_without_refund() {
    let env = Env::new();
    env.node.set_route_estimate(Msats(100), 40);
    let (bolt11, peer_hash) = env.peer_invoice(9_000);

    // zero balance: the wrapped invoice collects the pool fee too
    let outcome = env
        .submit(
            ActionKind::Tip,
            serde_json::json!({ "recipient": 2, "msats": 10_000, "bolt11": bolt11 }),
            Some(1),
        )
        .await
        .unwrap();
    let id = outcome.payin.id;
    let incoming = outcome.payin.incoming.as_ref().unwrap().clone();
    assert_eq!(incoming.msats_requested, Msats(1_000 + 9_000 + 1_000 + 110));
    assert!(outcome.payin.pay_in_tokens.is_empty());

    env.node.pay_incoming(&incoming.hash, incoming.msats_requested);
    env.pump().await;
    assert_eq!(env.payin(id).await.state, PayInState::Forwarding);

    env.node.fail_payment(&peer_hash, "no route");
    env.pump().await;

    let payin = env.payin(id).await;
    assert_eq!(payin.state, PayInState::Failed);
    assert_eq!(payin.failure_reason, Some(FailureReason::ForwardFailed));
    // nothing was debited, so nothing is refunded
    assert!(payin.refund_tokens.is_empty());
    assert_eq!(env.balance(1).await, Msats::ZERO);
    assert_eq!(env.node.invoice_state(&incoming.hash), Some("canceled"));
    assert!(!env.node.has_pending_payment(&peer_hash));
}
