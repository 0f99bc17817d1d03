use crate::domain::account::AccountId;
use crate::domain::invoice::{DecodedInvoice, PaymentHash};
use crate::domain::msats::Msats;
use crate::domain::payin::{PayIn, PayoutPurpose, PayoutToken};
use crate::domain::ports::{Clock, PaymentNode};
use crate::error::{PayError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Tag identifying an action type. The catalog of real actions lives outside
/// the payment core; the core only dispatches on the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Post,
    Tip,
    Donate,
    BuyCredits,
    ProxyPayment,
    Withdrawal,
}

/// Opaque, serialized action arguments.
pub type ActionArgs = serde_json::Value;

/// Capability flags an action advertises to the orchestrator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionFlags {
    /// May be submitted without an authenticated account.
    pub anonable: bool,
    /// Side effects may run before payment is confirmed.
    pub optimistic: bool,
    /// Side effects may be deferred until payment is held.
    pub pessimistic: bool,
    /// May be paid from the custodial balance.
    pub fee_credit: bool,
    /// The outgoing invoice amount is carved out of the cost and settled
    /// peer-to-peer instead of custodially.
    pub p2p: bool,
    /// A failed attempt may be retried into a successor pay-in.
    pub retryable: bool,
    /// The action is a withdrawal: cost is fully custodial and the payout is
    /// the outgoing payment itself.
    pub withdrawal: bool,
}

impl ActionFlags {
    /// Whether an unpaid remainder can be collected via an invoice.
    pub fn invoiceable(&self) -> bool {
        self.optimistic || self.pessimistic || self.p2p
    }
}

/// A bound outgoing payment requested by an action's payout plan.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub bolt11: String,
    pub hash: PaymentHash,
    pub msats: Msats,
    pub purpose: PayoutPurpose,
    pub recipient: Option<AccountId>,
}

impl OutgoingRequest {
    pub fn from_decoded(
        bolt11: &str,
        decoded: &DecodedInvoice,
        purpose: PayoutPurpose,
        recipient: Option<AccountId>,
    ) -> Result<Self> {
        let msats = decoded
            .msats
            .ok_or_else(|| PayError::InvoiceCreation("outgoing invoice has no amount".into()))?;
        Ok(Self {
            bolt11: bolt11.to_string(),
            hash: decoded.hash.clone(),
            msats,
            purpose,
            recipient,
        })
    }
}

/// The payout side of a cost computation.
#[derive(Debug, Clone, Default)]
pub struct PayoutPlan {
    pub tokens: Vec<PayoutToken>,
    pub outgoing: Option<OutgoingRequest>,
}

/// Collaborators handed to action strategies.
#[derive(Clone)]
pub struct ActionContext {
    pub node: Arc<dyn PaymentNode>,
    pub clock: Arc<dyn Clock>,
    pub actor: Option<AccountId>,
}

/// The per-action-type strategy the orchestrator drives.
///
/// `cost` plus `payouts` must conserve value: the plan's token amounts plus
/// any outgoing invoice amount must sum to the cost. `perform`, `on_paid` and
/// `on_fail` must be idempotent; they can be replayed by job retries.
#[async_trait]
pub trait Action: Send + Sync {
    fn flags(&self) -> ActionFlags;

    async fn cost(&self, args: &ActionArgs, ctx: &ActionContext) -> Result<Msats>;

    async fn payouts(
        &self,
        args: &ActionArgs,
        cost: Msats,
        ctx: &ActionContext,
    ) -> Result<PayoutPlan>;

    async fn perform(&self, payin: &PayIn, args: &ActionArgs) -> Result<serde_json::Value>;

    fn describe(&self, args: &ActionArgs) -> String;

    async fn on_paid(&self, _payin: &PayIn) -> Result<()> {
        Ok(())
    }

    async fn on_fail(&self, _payin: &PayIn) -> Result<()> {
        Ok(())
    }

    /// Re-links domain records from a failed attempt to its successor.
    async fn retry(&self, _predecessor: &PayIn, _successor: &PayIn) -> Result<()> {
        Ok(())
    }
}

/// Maps action tags to strategies. Built once at startup and shared.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<ActionKind, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: ActionKind, action: Arc<dyn Action>) -> Self {
        self.actions.insert(kind, action);
        self
    }

    pub fn get(&self, kind: ActionKind) -> Result<&Arc<dyn Action>> {
        self.actions.get(&kind).ok_or(PayError::UnknownAction(kind))
    }
}
