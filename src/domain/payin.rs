use crate::domain::account::{AccountId, CustodialToken};
use crate::domain::action::ActionKind;
use crate::domain::invoice::{IncomingBolt11, OutgoingBolt11};
use crate::domain::msats::{Msats, TokenKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PayInId(pub u64);

impl fmt::Display for PayInId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "payin:{}", self.0)
    }
}

/// Lifecycle states of a pay-in. Transitions happen only along the edge set
/// enforced by the transition engine; `Paid` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayInState {
    PendingInvoiceCreation,
    Pending,
    PendingHeld,
    Held,
    Forwarding,
    Forwarded,
    FailedForward,
    PendingWithdrawal,
    Cancelled,
    Failed,
    Paid,
    /// Transient marker set on a failed pay-in while a retry attempt is being
    /// created, so two callers can't both spawn a successor.
    Retrying,
}

impl PayInState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Paid | Self::Failed)
    }
}

/// Machine-readable reason a pay-in did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    InvoiceCreationFailed,
    WrapHighPredictedFee,
    WrapHighPredictedExpiry,
    WrapUnknown,
    ForwardCltvTooLow,
    ForwardFailed,
    HeldUnexpectedError,
    HeldSettledTooSlow,
    WithdrawalFailed,
    UserCancelled,
    SystemCancelled,
    InvoiceExpired,
    ExecutionFailed,
    InsufficientFunds,
    UnknownFailure,
}

/// What a planned payout is for. `RoutingFee`, `RewardsPool` and
/// `SystemRevenue` entries are pooled (no recipient account).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutPurpose {
    Payee,
    RewardsPool,
    RoutingFee,
    RoutingFeeRefund,
    SystemRevenue,
    Withdrawal,
}

/// A planned distribution of part of the pay-in's cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutToken {
    pub purpose: PayoutPurpose,
    /// `None` means the value stays pooled with the service.
    pub recipient: Option<AccountId>,
    pub kind: TokenKind,
    pub amount: Msats,
}

/// Stored arguments (and eventually the result) of an action whose side
/// effects are deferred until payment is held. Exists only for pessimistic
/// pay-ins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PessimisticEnv {
    pub args: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Set the moment the deferred action has run, so the two transition
    /// paths that can invoke it never run it twice.
    pub performed: bool,
}

impl PessimisticEnv {
    pub fn new(args: serde_json::Value) -> Self {
        Self {
            args,
            result: None,
            error: None,
            performed: false,
        }
    }
}

/// One monetary action instance: the aggregate driven through the state
/// machine. Never deleted; terminal pay-ins are kept for audit and for
/// retry-chain traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayIn {
    pub id: PayInId,
    pub kind: ActionKind,
    /// The submitted action arguments, kept for retries.
    pub args: serde_json::Value,
    /// Total cost in millisatoshis. Grows when a wrapping invoice adds its
    /// markup and fee budget.
    pub mcost: Msats,
    pub state: PayInState,
    pub account: AccountId,
    /// Parent pay-in when this one is a carved-out beneficiary share.
    pub benefactor: Option<PayInId>,
    /// First attempt in the retry chain this pay-in belongs to.
    pub genesis: Option<PayInId>,
    /// The retry attempt that superseded this one, if any.
    pub successor: Option<PayInId>,
    pub failure_reason: Option<FailureReason>,
    pub retry_count: u32,
    pub created_at: SystemTime,
    pub state_changed_at: SystemTime,
    /// Custodial debits actually taken at creation.
    pub pay_in_tokens: Vec<CustodialToken>,
    /// Planned payouts. Together with `outgoing.msats` they sum to `mcost`
    /// once the pay-in is `Paid`.
    pub pay_out_tokens: Vec<PayoutToken>,
    /// Refunds issued on failure; one matching entry per custodial debit.
    pub refund_tokens: Vec<CustodialToken>,
    pub incoming: Option<IncomingBolt11>,
    pub outgoing: Option<OutgoingBolt11>,
    pub pessimistic: Option<PessimisticEnv>,
}

impl PayIn {
    pub fn custodial_debited(&self) -> Msats {
        self.pay_in_tokens.iter().map(|t| t.amount).sum()
    }

    pub fn payout_total(&self) -> Msats {
        self.pay_out_tokens.iter().map(|t| t.amount).sum()
    }

    pub fn refunded_total(&self) -> Msats {
        self.refund_tokens.iter().map(|t| t.amount).sum()
    }
}

/// The fields the orchestrator supplies when persisting a new pay-in.
#[derive(Debug, Clone)]
pub struct NewPayIn {
    pub kind: ActionKind,
    pub args: serde_json::Value,
    pub mcost: Msats,
    pub state: PayInState,
    pub account: AccountId,
    pub benefactor: Option<PayInId>,
    pub genesis: Option<PayInId>,
    pub retry_count: u32,
    pub pay_in_tokens: Vec<CustodialToken>,
    pub pay_out_tokens: Vec<PayoutToken>,
    pub outgoing: Option<OutgoingBolt11>,
    pub pessimistic: Option<PessimisticEnv>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(PayInState::Paid.is_terminal());
        assert!(PayInState::Failed.is_terminal());
        for s in [
            PayInState::Pending,
            PayInState::PendingHeld,
            PayInState::Held,
            PayInState::Forwarding,
            PayInState::Forwarded,
            PayInState::FailedForward,
            PayInState::Cancelled,
            PayInState::Retrying,
            PayInState::PendingWithdrawal,
            PayInState::PendingInvoiceCreation,
        ] {
            assert!(!s.is_terminal(), "{s:?} must not be terminal");
        }
    }

    #[test]
    fn test_state_serde_names() {
        let s = serde_json::to_string(&PayInState::PendingInvoiceCreation).unwrap();
        assert_eq!(s, "\"PENDING_INVOICE_CREATION\"");
        let s = serde_json::to_string(&FailureReason::WrapHighPredictedFee).unwrap();
        assert_eq!(s, "\"WRAP_HIGH_PREDICTED_FEE\"");
    }
}
