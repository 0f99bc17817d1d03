#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tollgate::actions::default_registry;
use tollgate::application::orchestrator::{Orchestrator, SubmitContext, SubmitOutcome};
use tollgate::application::retry::RetryCoordinator;
use tollgate::application::transitions::TransitionEngine;
use tollgate::application::wrap::{InvoiceWrapper, WrapPolicy};
use tollgate::domain::account::{Account, AccountId};
use tollgate::domain::action::ActionKind;
use tollgate::domain::msats::Msats;
use tollgate::domain::payin::PayIn;
use tollgate::domain::ports::{Clock, Ledger, PayInStore};
use tollgate::error::Result;
use tollgate::infrastructure::in_memory::{InMemoryJobQueue, InMemoryStore, ManualClock};
use tollgate::infrastructure::mock_node::{MockNode, NodeEvent};

/// Full payment core wired against the in-memory store, the mock node, and a
/// manual clock. Node events and jobs are pumped explicitly so tests control
/// exactly when asynchronous work happens.
pub struct Env {
    pub store: InMemoryStore,
    pub node: MockNode,
    pub queue: InMemoryJobQueue,
    pub clock: ManualClock,
    pub engine: Arc<TransitionEngine>,
    pub orchestrator: Arc<Orchestrator>,
    pub retry: Arc<RetryCoordinator>,
}

impl Env {
    pub fn new() -> Self {
        let store = InMemoryStore::new();
        Self::with_payin_store(store.clone(), Arc::new(store))
    }

    /// Same wiring as [`Env::new`], but the pay-in store handed to the
    /// engine, orchestrator, and retry coordinator is caller-supplied
    /// (usually a wrapper around `store`), so tests can observe or stall
    /// persistence calls at chosen points.
    pub fn with_payin_store(store: InMemoryStore, payins: Arc<dyn PayInStore>) -> Self {
        let node = MockNode::new();
        let queue = InMemoryJobQueue::new();
        let clock = ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let registry = Arc::new(default_registry());
        let wrapper = Arc::new(InvoiceWrapper::new(
            Arc::new(node.clone()),
            Arc::new(clock.clone()),
            WrapPolicy::default(),
        ));
        let engine = Arc::new(TransitionEngine::new(
            payins.clone(),
            Arc::new(node.clone()),
            Arc::new(queue.clone()),
            registry.clone(),
            Arc::new(clock.clone()),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            payins.clone(),
            Arc::new(store.clone()),
            Arc::new(node.clone()),
            Arc::new(queue.clone()),
            registry.clone(),
            Arc::new(clock.clone()),
            wrapper,
            engine.clone(),
        ));
        let retry = Arc::new(RetryCoordinator::new(
            payins,
            registry,
            orchestrator.clone(),
        ));
        Self {
            store,
            node,
            queue,
            clock,
            engine,
            orchestrator,
            retry,
        }
    }

    pub async fn fund_sats(&self, account: u64, msats: u64) {
        self.store
            .upsert_account(Account {
                id: AccountId(account),
                mcredits: Msats::ZERO,
                msats: Msats(msats),
            })
            .await
            .unwrap();
    }

    pub async fn fund_credits(&self, account: u64, msats: u64) {
        self.store
            .upsert_account(Account {
                id: AccountId(account),
                mcredits: Msats(msats),
                msats: Msats::ZERO,
            })
            .await
            .unwrap();
    }

    pub async fn balance(&self, account: u64) -> Msats {
        self.store
            .account(AccountId(account))
            .await
            .unwrap()
            .map(|a| a.available())
            .unwrap_or(Msats::ZERO)
    }

    pub async fn submit(
        &self,
        kind: ActionKind,
        args: serde_json::Value,
        actor: Option<u64>,
    ) -> Result<SubmitOutcome> {
        self.orchestrator
            .submit(
                kind,
                args,
                SubmitContext {
                    actor: actor.map(AccountId),
                    ..SubmitContext::default()
                },
            )
            .await
    }

    pub async fn payin(&self, id: tollgate::domain::payin::PayInId) -> PayIn {
        self.store.get(id).await.unwrap().expect("pay-in exists")
    }

    /// Pumps node events and due jobs until nothing is left to do. Outgoing
    /// payments are NOT completed automatically; tests script those.
    pub async fn pump(&self) {
        loop {
            let mut progressed = false;
            for event in self.node.take_events() {
                match event {
                    NodeEvent::Invoice(snap) => {
                        self.engine.on_invoice_event(snap).await.unwrap()
                    }
                    NodeEvent::Payment(snap) => {
                        self.engine.on_payment_event(snap).await.unwrap()
                    }
                }
                progressed = true;
            }
            while let Some(job) = self.queue.pop_due(self.clock.now()) {
                self.engine.handle(job).await.unwrap();
                progressed = true;
            }
            if !progressed {
                return;
            }
        }
    }

    /// Registers an invoice from a peer wallet, payable through the node.
    pub fn peer_invoice(&self, msats: u64) -> (String, tollgate::domain::invoice::PaymentHash) {
        self.node.register_external_invoice(
            Some(Msats(msats)),
            "peer-wallet",
            40,
            vec![8, 14, 17],
            Some("peer invoice".into()),
            None,
            self.clock.now() + Duration::from_secs(3600),
        )
    }
}
