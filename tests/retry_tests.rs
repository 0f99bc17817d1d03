mod common;

use async_trait::async_trait;
use common::Env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tollgate::domain::account::AccountId;
use tollgate::domain::action::ActionKind;
use tollgate::domain::invoice::PaymentHash;
use tollgate::domain::msats::Msats;
use tollgate::domain::payin::{NewPayIn, PayIn, PayInId, PayInState};
use tollgate::domain::ports::{LedgerCredit, PayInMutation, PayInStore};
use tollgate::error::{PayError, Result};
use tollgate::infrastructure::in_memory::InMemoryStore;

async fn fail_payin(env: &Env, id: PayInId) {
    env.engine.payin_cancel(id, None).await.unwrap();
    env.pump().await;
    assert_eq!(env.payin(id).await.state, PayInState::Failed);
}

#[tokio::test]
async fn test_retry_chain_keeps_one_genesis() {
    let env = Env::new();
    env.fund_sats(1, 4_000).await;

    let first = env
        .submit(ActionKind::Donate, serde_json::json!({ "msats": 10_000 }), Some(1))
        .await
        .unwrap()
        .payin;
    fail_payin(&env, first.id).await;
    assert_eq!(env.balance(1).await, Msats(4_000));

    let second = env.retry.retry(first.id, AccountId(1)).await.unwrap().payin;
    assert_eq!(second.state, PayInState::Pending);
    assert_eq!(second.genesis, Some(first.id));
    assert_eq!(second.retry_count, 1);
    assert_eq!(second.args, first.args);
    assert_eq!(env.payin(first.id).await.successor, Some(second.id));
    // the marker never outlives the attempt
    assert_eq!(env.payin(first.id).await.state, PayInState::Failed);

    fail_payin(&env, second.id).await;
    let third = env.retry.retry(second.id, AccountId(1)).await.unwrap().payin;

    // the chain always points back at the first attempt
    assert_eq!(third.genesis, Some(first.id));
    assert_eq!(third.retry_count, 2);
    assert_eq!(env.payin(second.id).await.successor, Some(third.id));
}

#[tokio::test]
async fn test_retried_payin_cannot_be_retried_again() {
    let env = Env::new();
    env.fund_sats(1, 4_000).await;

    let first = env
        .submit(ActionKind::Donate, serde_json::json!({ "msats": 10_000 }), Some(1))
        .await
        .unwrap()
        .payin;
    fail_payin(&env, first.id).await;
    env.retry.retry(first.id, AccountId(1)).await.unwrap();

    let err = env.retry.retry(first.id, AccountId(1)).await.unwrap_err();
    assert!(matches!(err, PayError::RetryNotAllowed(_)));
}

#[tokio::test]
async fn test_retry_rejects_non_owner() {
    let env = Env::new();
    env.fund_sats(1, 4_000).await;

    let first = env
        .submit(ActionKind::Donate, serde_json::json!({ "msats": 10_000 }), Some(1))
        .await
        .unwrap()
        .payin;
    fail_payin(&env, first.id).await;

    let err = env.retry.retry(first.id, AccountId(2)).await.unwrap_err();
    assert!(matches!(err, PayError::NotOwner));
}

#[tokio::test]
async fn test_retry_rejects_live_payin() {
    let env = Env::new();
    env.fund_sats(1, 4_000).await;

    let first = env
        .submit(ActionKind::Donate, serde_json::json!({ "msats": 10_000 }), Some(1))
        .await
        .unwrap()
        .payin;
    assert_eq!(first.state, PayInState::Pending);

    let err = env.retry.retry(first.id, AccountId(1)).await.unwrap_err();
    assert!(matches!(err, PayError::RetryNotAllowed(_)));
}

/// Store wrapper that, once armed, parks the caller right after the
/// `Retrying -> Failed` update commits, holding the coordinator at the exact
/// point where the marker has cleared and the successor link is visible.
struct StallAfterRelinkStore {
    inner: InMemoryStore,
    armed: AtomicBool,
    reached: Notify,
    release: Notify,
}

#[async_trait]
impl PayInStore for StallAfterRelinkStore {
    async fn create(&self, new: NewPayIn) -> Result<PayIn> {
        self.inner.create(new).await
    }

    async fn get(&self, id: PayInId) -> Result<Option<PayIn>> {
        self.inner.get(id).await
    }

    async fn find_by_incoming_hash(&self, hash: &PaymentHash) -> Result<Option<PayIn>> {
        self.inner.find_by_incoming_hash(hash).await
    }

    async fn find_by_outgoing_hash(&self, hash: &PaymentHash) -> Result<Option<PayIn>> {
        self.inner.find_by_outgoing_hash(hash).await
    }

    async fn transition(
        &self,
        id: PayInId,
        from: &[PayInState],
        to: PayInState,
        credits: Vec<LedgerCredit>,
        mutate: PayInMutation,
    ) -> Result<Option<PayIn>> {
        let updated = self.inner.transition(id, from, to, credits, mutate).await?;
        if matches!(from, [PayInState::Retrying])
            && to == PayInState::Failed
            && self.armed.swap(false, Ordering::SeqCst)
        {
            self.reached.notify_one();
            self.release.notified().await;
        }
        Ok(updated)
    }

    async fn record_pessimistic(
        &self,
        id: PayInId,
        outcome: std::result::Result<serde_json::Value, String>,
    ) -> Result<()> {
        self.inner.record_pessimistic(id, outcome).await
    }
}

#[tokio::test]
async fn test_concurrent_retry_spawns_single_successor() {
    let inner = InMemoryStore::new();
    let stall = Arc::new(StallAfterRelinkStore {
        inner: inner.clone(),
        armed: AtomicBool::new(false),
        reached: Notify::new(),
        release: Notify::new(),
    });
    let env = Env::with_payin_store(inner, stall.clone());
    env.fund_sats(1, 4_000).await;

    let first = env
        .submit(ActionKind::Donate, serde_json::json!({ "msats": 10_000 }), Some(1))
        .await
        .unwrap()
        .payin;
    fail_payin(&env, first.id).await;

    stall.armed.store(true, Ordering::SeqCst);
    let racer = env.retry.clone();
    let original_id = first.id;
    let task = tokio::spawn(async move { racer.retry(original_id, AccountId(1)).await });
    stall.reached.notified().await;

    // a second caller arriving while the first is still mid-flight must be
    // turned away: the marker clears and the successor links in one update
    let err = env.retry.retry(first.id, AccountId(1)).await.unwrap_err();
    assert!(matches!(err, PayError::RetryNotAllowed(_)));

    stall.release.notify_one();
    let outcome = task.await.unwrap().unwrap();

    let original = env.payin(first.id).await;
    assert_eq!(original.state, PayInState::Failed);
    assert_eq!(original.successor, Some(outcome.payin.id));
}

#[tokio::test]
async fn test_retry_that_settles_at_once_keeps_genesis() {
    let env = Env::new();
    env.fund_sats(1, 4_000).await;

    let first = env
        .submit(ActionKind::Donate, serde_json::json!({ "msats": 10_000 }), Some(1))
        .await
        .unwrap()
        .payin;
    fail_payin(&env, first.id).await;

    // refill so the next attempt settles from balance without any invoice;
    // the lineage still has to land on the stored pay-in
    env.fund_sats(1, 10_000).await;
    let second = env.retry.retry(first.id, AccountId(1)).await.unwrap().payin;
    assert_eq!(second.state, PayInState::Paid);
    assert_eq!(second.genesis, Some(first.id));
    assert_eq!(second.retry_count, 1);

    let stored = env.payin(second.id).await;
    assert_eq!(stored.genesis, Some(first.id));
    assert_eq!(stored.retry_count, 1);
    assert_eq!(env.payin(first.id).await.successor, Some(second.id));
}

#[tokio::test]
async fn test_retried_attempt_can_settle() {
    let env = Env::new();
    env.fund_sats(1, 4_000).await;

    let first = env
        .submit(ActionKind::Donate, serde_json::json!({ "msats": 10_000 }), Some(1))
        .await
        .unwrap()
        .payin;
    fail_payin(&env, first.id).await;

    let second = env.retry.retry(first.id, AccountId(1)).await.unwrap().payin;
    let incoming = second.incoming.as_ref().unwrap();
    env.node.pay_incoming(&incoming.hash, incoming.msats_requested);
    env.pump().await;

    let settled = env.payin(second.id).await;
    assert_eq!(settled.state, PayInState::Paid);
    assert_eq!(settled.payout_total(), settled.mcost);
    assert_eq!(settled.genesis, Some(first.id));
    assert_eq!(env.balance(1).await, Msats::ZERO);
}
