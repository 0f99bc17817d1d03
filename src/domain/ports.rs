use crate::domain::account::{Account, AccountId, CustodialToken};
use crate::domain::invoice::{
    DecodedInvoice, IncomingBolt11, InvoiceSnapshot, PaymentHash, PaymentSnapshot,
};
use crate::domain::msats::{Msats, TokenKind};
use crate::domain::payin::{NewPayIn, PayIn, PayInId, PayInState};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Injected time source, so deadlines and expiries are testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Atomic debit/credit of the two custodial balance kinds.
///
/// Implementations must serialize concurrent debits against the same account
/// (a row lock in a relational store, a single write lock in memory) and must
/// never let a balance go below zero.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Debits up to `amount`, credits first, then sats; returns the entries
    /// actually taken, summing to `min(amount, available)`.
    async fn debit(&self, account: AccountId, amount: Msats) -> Result<Vec<CustodialToken>>;

    async fn credit(&self, account: AccountId, kind: TokenKind, amount: Msats) -> Result<()>;

    async fn account(&self, account: AccountId) -> Result<Option<Account>>;

    async fn upsert_account(&self, account: Account) -> Result<()>;
}

/// A balance credit applied atomically with a state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerCredit {
    pub account: AccountId,
    pub kind: TokenKind,
    pub amount: Msats,
}

/// Field updates applied to the pay-in row if (and only if) the guarded
/// transition wins.
pub type PayInMutation = Box<dyn FnOnce(&mut PayIn) + Send>;

/// Persistence for pay-in aggregates.
///
/// `transition` is the only way a pay-in's state changes after creation: a
/// single conditional update (`state := to WHERE state IN from`) applied
/// atomically together with the mutation and any ledger credits. A `None`
/// return means another worker won the race; callers treat it as a no-op.
#[async_trait]
pub trait PayInStore: Send + Sync {
    async fn create(&self, new: NewPayIn) -> Result<PayIn>;

    async fn get(&self, id: PayInId) -> Result<Option<PayIn>>;

    async fn find_by_incoming_hash(&self, hash: &PaymentHash) -> Result<Option<PayIn>>;

    async fn find_by_outgoing_hash(&self, hash: &PaymentHash) -> Result<Option<PayIn>>;

    async fn transition(
        &self,
        id: PayInId,
        from: &[PayInState],
        to: PayInState,
        credits: Vec<LedgerCredit>,
        mutate: PayInMutation,
    ) -> Result<Option<PayIn>>;

    /// Binds the incoming invoice created for the unpaid remainder. Guarded
    /// like `transition`.
    async fn attach_incoming(
        &self,
        id: PayInId,
        to: PayInState,
        incoming: IncomingBolt11,
        mutate: PayInMutation,
    ) -> Result<Option<PayIn>> {
        self.transition(
            id,
            &[PayInState::PendingInvoiceCreation],
            to,
            Vec::new(),
            Box::new(move |p| {
                p.incoming = Some(incoming);
                mutate(p);
            }),
        )
        .await
    }

    /// Records the deferred action's outcome and marks it performed, so the
    /// two transition paths that can run it never run it twice.
    async fn record_pessimistic(
        &self,
        id: PayInId,
        outcome: std::result::Result<serde_json::Value, String>,
    ) -> Result<()>;
}

/// Invoice creation parameters shared by plain and hold invoices.
#[derive(Debug, Clone)]
pub struct CreateInvoice {
    pub description: Option<String>,
    pub description_hash: Option<String>,
    pub msats: Msats,
    pub expires_at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct CreateHoldInvoice {
    /// Reuse an existing payment hash (invoice wrapping) instead of letting
    /// the node generate one.
    pub hash: Option<PaymentHash>,
    pub invoice: CreateInvoice,
    pub cltv_delta: u32,
}

#[derive(Debug, Clone)]
pub struct CreatedInvoice {
    pub bolt11: String,
    pub hash: PaymentHash,
    /// Present when the node generated the preimage (not for wrapped
    /// invoices, whose preimage only the far payee knows).
    pub preimage: Option<String>,
}

/// Route-fee estimate for paying a given invoice.
#[derive(Debug, Clone, Copy)]
pub struct RouteEstimate {
    pub fee: Msats,
    /// Absolute block height at which the route is estimated to expire in
    /// the worst case.
    pub timelock_height: u32,
}

#[derive(Debug, Clone)]
pub struct PayRequest {
    pub bolt11: String,
    pub max_fee: Msats,
    pub max_timeout_height: Option<u32>,
}

/// Adapter to the external payment node. Calls block for the duration of the
/// RPC and must never run inside a store mutation whose rollback would leave
/// an invoice orphaned.
#[async_trait]
pub trait PaymentNode: Send + Sync {
    async fn create_invoice(&self, req: CreateInvoice) -> Result<CreatedInvoice>;

    async fn create_hold_invoice(&self, req: CreateHoldInvoice) -> Result<CreatedInvoice>;

    async fn settle_hold_invoice(&self, preimage: &str) -> Result<()>;

    async fn cancel_invoice(&self, hash: &PaymentHash) -> Result<()>;

    async fn decode(&self, bolt11: &str) -> Result<DecodedInvoice>;

    async fn estimate_route_fee(
        &self,
        destination: &str,
        msats: Msats,
        bolt11: &str,
        timeout: Duration,
    ) -> Result<RouteEstimate>;

    /// Dispatches an outgoing payment. The outcome arrives asynchronously as
    /// a payment snapshot event, never as this call's return value.
    async fn pay(&self, req: PayRequest) -> Result<()>;

    async fn block_height(&self) -> Result<u32>;
}

/// Job names map one-to-one onto transition operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobName {
    CheckPayIn,
    PayInPaid,
    PayInHeld,
    PayInForwarding,
    PayInForwarded,
    PayInFailedForward,
    PayInCancel,
    PayInFailed,
    FinalizeHoldInvoice,
    WithdrawalPaid,
    WithdrawalFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobOptions {
    pub start_after: Option<SystemTime>,
    pub priority: i32,
    pub retry_limit: u32,
    pub retry_backoff: bool,
    pub retry_delay: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            start_after: None,
            priority: 0,
            retry_limit: 1000,
            retry_backoff: false,
            retry_delay: Duration::from_secs(30),
        }
    }
}

/// A queued transition job carrying the pay-in identifier and any externally
/// observed invoice/payment snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub name: JobName,
    pub payin_id: Option<PayInId>,
    pub hash: Option<PaymentHash>,
    pub invoice: Option<InvoiceSnapshot>,
    pub payment: Option<PaymentSnapshot>,
    pub reason: Option<crate::domain::payin::FailureReason>,
    pub opts: JobOptions,
}

impl Job {
    pub fn new(name: JobName, payin_id: PayInId) -> Self {
        Self {
            name,
            payin_id: Some(payin_id),
            hash: None,
            invoice: None,
            payment: None,
            reason: None,
            opts: JobOptions::default(),
        }
    }
}

/// Durable at-least-once job queue with delayed execution.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<()>;
}
