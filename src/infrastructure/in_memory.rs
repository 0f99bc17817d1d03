use crate::domain::account::{Account, AccountId, CustodialToken};
use crate::domain::invoice::PaymentHash;
use crate::domain::msats::{Msats, TokenKind};
use crate::domain::payin::{NewPayIn, PayIn, PayInId, PayInState};
use crate::domain::ports::{Clock, Job, JobQueue, Ledger, LedgerCredit, PayInMutation, PayInStore};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    accounts: HashMap<AccountId, Account>,
    payins: HashMap<PayInId, PayIn>,
    by_incoming_hash: HashMap<PaymentHash, PayInId>,
    by_outgoing_hash: HashMap<PaymentHash, PayInId>,
    next_id: u64,
}

impl Inner {
    fn index_hashes(&mut self, id: PayInId) {
        let payin = &self.payins[&id];
        let incoming = payin.incoming.as_ref().map(|b| b.hash.clone());
        let outgoing = payin.outgoing.as_ref().map(|b| b.hash.clone());
        if let Some(hash) = incoming {
            self.by_incoming_hash.insert(hash, id);
        }
        if let Some(hash) = outgoing {
            self.by_outgoing_hash.insert(hash, id);
        }
    }
}

/// In-memory store implementing both the ledger and the pay-in store.
///
/// Accounts and pay-ins live behind one `Arc<RwLock<..>>` so a guarded
/// transition and its ledger credits commit atomically, the way a relational
/// transaction would.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All accounts, for reporting at the end of a run.
    pub async fn accounts(&self) -> Vec<Account> {
        let inner = self.inner.read().await;
        let mut accounts: Vec<_> = inner.accounts.values().cloned().collect();
        accounts.sort_by_key(|a| a.id);
        accounts
    }

    /// All pay-ins that are not yet in a terminal state.
    pub async fn pending_payins(&self) -> Vec<PayIn> {
        let inner = self.inner.read().await;
        let mut payins: Vec<_> = inner
            .payins
            .values()
            .filter(|p| !p.state.is_terminal())
            .cloned()
            .collect();
        payins.sort_by_key(|p| p.id);
        payins
    }
}

#[async_trait]
impl Ledger for InMemoryStore {
    async fn debit(&self, account: AccountId, amount: Msats) -> Result<Vec<CustodialToken>> {
        let mut inner = self.inner.write().await;
        let acct = inner
            .accounts
            .entry(account)
            .or_insert_with(|| Account::new(account));
        Ok(acct.debit(amount))
    }

    async fn credit(&self, account: AccountId, kind: TokenKind, amount: Msats) -> Result<()> {
        let mut inner = self.inner.write().await;
        let acct = inner
            .accounts
            .entry(account)
            .or_insert_with(|| Account::new(account));
        acct.credit(kind, amount);
        Ok(())
    }

    async fn account(&self, account: AccountId) -> Result<Option<Account>> {
        let inner = self.inner.read().await;
        Ok(inner.accounts.get(&account).cloned())
    }

    async fn upsert_account(&self, account: Account) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.accounts.insert(account.id, account);
        Ok(())
    }
}

#[async_trait]
impl PayInStore for InMemoryStore {
    async fn create(&self, new: NewPayIn) -> Result<PayIn> {
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let id = PayInId(inner.next_id);
        let now = SystemTime::now();
        let payin = PayIn {
            id,
            kind: new.kind,
            args: new.args,
            mcost: new.mcost,
            state: new.state,
            account: new.account,
            benefactor: new.benefactor,
            genesis: new.genesis,
            successor: None,
            failure_reason: None,
            retry_count: new.retry_count,
            created_at: now,
            state_changed_at: now,
            pay_in_tokens: new.pay_in_tokens,
            pay_out_tokens: new.pay_out_tokens,
            refund_tokens: Vec::new(),
            incoming: None,
            outgoing: new.outgoing,
            pessimistic: new.pessimistic,
        };
        inner.payins.insert(id, payin.clone());
        inner.index_hashes(id);
        Ok(payin)
    }

    async fn get(&self, id: PayInId) -> Result<Option<PayIn>> {
        let inner = self.inner.read().await;
        Ok(inner.payins.get(&id).cloned())
    }

    async fn find_by_incoming_hash(&self, hash: &PaymentHash) -> Result<Option<PayIn>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_incoming_hash
            .get(hash)
            .and_then(|id| inner.payins.get(id))
            .cloned())
    }

    async fn find_by_outgoing_hash(&self, hash: &PaymentHash) -> Result<Option<PayIn>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_outgoing_hash
            .get(hash)
            .and_then(|id| inner.payins.get(id))
            .cloned())
    }

    async fn transition(
        &self,
        id: PayInId,
        from: &[PayInState],
        to: PayInState,
        credits: Vec<LedgerCredit>,
        mutate: PayInMutation,
    ) -> Result<Option<PayIn>> {
        let mut inner = self.inner.write().await;
        let Some(payin) = inner.payins.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&payin.state) {
            // zero rows affected: another worker already transitioned it
            return Ok(None);
        }
        payin.state = to;
        mutate(payin);
        let updated = payin.clone();
        for credit in credits {
            let acct = inner
                .accounts
                .entry(credit.account)
                .or_insert_with(|| Account::new(credit.account));
            acct.credit(credit.kind, credit.amount);
        }
        inner.index_hashes(id);
        Ok(Some(updated))
    }

    async fn record_pessimistic(
        &self,
        id: PayInId,
        outcome: std::result::Result<serde_json::Value, String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(payin) = inner.payins.get_mut(&id)
            && let Some(env) = payin.pessimistic.as_mut()
        {
            env.performed = true;
            match outcome {
                Ok(result) => env.result = Some(result),
                Err(error) => env.error = Some(error),
            }
        }
        Ok(())
    }
}

/// In-memory job queue. `pop_due` hands out the highest-priority job whose
/// `start_after` has passed; tests and the simulator drive it manually.
#[derive(Default, Clone)]
pub struct InMemoryJobQueue {
    jobs: Arc<Mutex<Vec<Job>>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop_due(&self, now: SystemTime) -> Option<Job> {
        let mut jobs = self.jobs.lock().expect("job queue lock poisoned");
        let mut best: Option<usize> = None;
        for (i, job) in jobs.iter().enumerate() {
            if job.opts.start_after.is_some_and(|t| t > now) {
                continue;
            }
            match best {
                Some(b) if jobs[b].opts.priority >= job.opts.priority => {}
                _ => best = Some(i),
            }
        }
        best.map(|i| jobs.remove(i))
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().expect("job queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending jobs, for assertions.
    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.lock().expect("job queue lock poisoned").clone()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        self.jobs.lock().expect("job queue lock poisoned").push(job);
        Ok(())
    }
}

/// Wall-clock time source.
#[derive(Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually advanced time source for tests.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: std::time::Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock poisoned")
    }
}
