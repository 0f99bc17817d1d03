//! Reference action strategies exercising every payment method of the core:
//! a custodial sink (donate), a split payout with an optional peer invoice
//! (tip), and a withdrawal.

use crate::domain::action::{
    Action, ActionArgs, ActionContext, ActionFlags, ActionKind, ActionRegistry, OutgoingRequest,
    PayoutPlan,
};
use crate::domain::msats::{Msats, TokenKind};
use crate::domain::payin::{PayIn, PayoutPurpose, PayoutToken};
use crate::error::{PayError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

fn bad_args(err: serde_json::Error) -> PayError {
    PayError::Execution(format!("invalid action arguments: {err}"))
}

#[derive(Debug, Deserialize)]
struct DonateArgs {
    msats: u64,
}

/// Sinks the whole cost into the pooled rewards entry.
#[derive(Default)]
pub struct DonateAction;

#[async_trait]
impl Action for DonateAction {
    fn flags(&self) -> ActionFlags {
        ActionFlags {
            anonable: true,
            optimistic: true,
            pessimistic: true,
            fee_credit: true,
            retryable: true,
            ..Default::default()
        }
    }

    async fn cost(&self, args: &ActionArgs, _ctx: &ActionContext) -> Result<Msats> {
        let args: DonateArgs = serde_json::from_value(args.clone()).map_err(bad_args)?;
        Ok(Msats(args.msats))
    }

    async fn payouts(
        &self,
        _args: &ActionArgs,
        cost: Msats,
        _ctx: &ActionContext,
    ) -> Result<PayoutPlan> {
        Ok(PayoutPlan {
            tokens: vec![PayoutToken {
                purpose: PayoutPurpose::RewardsPool,
                recipient: None,
                kind: TokenKind::Sats,
                amount: cost,
            }],
            outgoing: None,
        })
    }

    async fn perform(&self, _payin: &PayIn, args: &ActionArgs) -> Result<serde_json::Value> {
        let args: DonateArgs = serde_json::from_value(args.clone()).map_err(bad_args)?;
        Ok(serde_json::json!({ "donated_msats": args.msats }))
    }

    fn describe(&self, _args: &ActionArgs) -> String {
        "donation to the rewards pool".to_string()
    }
}

#[derive(Debug, Deserialize)]
struct TipArgs {
    recipient: u64,
    msats: u64,
    /// Invoice from the recipient's own wallet; when present their share is
    /// forwarded peer to peer instead of credited custodially.
    #[serde(default)]
    bolt11: Option<String>,
}

impl TipArgs {
    fn pool_fee(&self) -> Msats {
        Msats(self.msats / 10)
    }

    fn recipient_share(&self) -> Msats {
        Msats(self.msats).saturating_sub(self.pool_fee())
    }
}

/// Pays a recipient, keeping a tenth for the rewards pool. With a supplied
/// recipient invoice the share becomes a bound outgoing payment.
#[derive(Default)]
pub struct TipAction;

#[async_trait]
impl Action for TipAction {
    fn flags(&self) -> ActionFlags {
        ActionFlags {
            optimistic: true,
            pessimistic: true,
            fee_credit: true,
            p2p: true,
            retryable: true,
            ..Default::default()
        }
    }

    async fn cost(&self, args: &ActionArgs, _ctx: &ActionContext) -> Result<Msats> {
        let args: TipArgs = serde_json::from_value(args.clone()).map_err(bad_args)?;
        Ok(Msats(args.msats))
    }

    async fn payouts(
        &self,
        args: &ActionArgs,
        _cost: Msats,
        ctx: &ActionContext,
    ) -> Result<PayoutPlan> {
        let args: TipArgs = serde_json::from_value(args.clone()).map_err(bad_args)?;
        let recipient = crate::domain::account::AccountId(args.recipient);
        let mut tokens = vec![PayoutToken {
            purpose: PayoutPurpose::RewardsPool,
            recipient: None,
            kind: TokenKind::Sats,
            amount: args.pool_fee(),
        }];
        let outgoing = match &args.bolt11 {
            Some(bolt11) => {
                let decoded = ctx.node.decode(bolt11).await?;
                let req = OutgoingRequest::from_decoded(
                    bolt11,
                    &decoded,
                    PayoutPurpose::Payee,
                    Some(recipient),
                )?;
                if req.msats != args.recipient_share() {
                    return Err(PayError::Execution(format!(
                        "invoice amount {} does not match the recipient share {}",
                        req.msats,
                        args.recipient_share()
                    )));
                }
                Some(req)
            }
            None => {
                tokens.push(PayoutToken {
                    purpose: PayoutPurpose::Payee,
                    recipient: Some(recipient),
                    kind: TokenKind::Sats,
                    amount: args.recipient_share(),
                });
                None
            }
        };
        Ok(PayoutPlan { tokens, outgoing })
    }

    async fn perform(&self, _payin: &PayIn, args: &ActionArgs) -> Result<serde_json::Value> {
        let args: TipArgs = serde_json::from_value(args.clone()).map_err(bad_args)?;
        Ok(serde_json::json!({
            "tipped_msats": args.msats,
            "recipient": args.recipient,
        }))
    }

    fn describe(&self, args: &ActionArgs) -> String {
        match serde_json::from_value::<TipArgs>(args.clone()) {
            Ok(args) => format!("tip of {} to account {}", Msats(args.msats), args.recipient),
            Err(_) => "tip".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WithdrawArgs {
    bolt11: String,
    max_fee_msats: u64,
}

/// Pays an invoice of the owner's choosing from their custodial balance. The
/// cost covers the invoice amount plus a routing-fee budget trued up after
/// settlement.
#[derive(Default)]
pub struct WithdrawAction;

#[async_trait]
impl Action for WithdrawAction {
    fn flags(&self) -> ActionFlags {
        ActionFlags {
            fee_credit: true,
            withdrawal: true,
            ..Default::default()
        }
    }

    async fn cost(&self, args: &ActionArgs, ctx: &ActionContext) -> Result<Msats> {
        let args: WithdrawArgs = serde_json::from_value(args.clone()).map_err(bad_args)?;
        let decoded = ctx.node.decode(&args.bolt11).await?;
        let amount = decoded
            .msats
            .ok_or_else(|| PayError::InvoiceCreation("withdrawal invoice has no amount".into()))?;
        Ok(amount + Msats(args.max_fee_msats))
    }

    async fn payouts(
        &self,
        args: &ActionArgs,
        _cost: Msats,
        ctx: &ActionContext,
    ) -> Result<PayoutPlan> {
        let args: WithdrawArgs = serde_json::from_value(args.clone()).map_err(bad_args)?;
        let decoded = ctx.node.decode(&args.bolt11).await?;
        let outgoing = OutgoingRequest::from_decoded(
            &args.bolt11,
            &decoded,
            PayoutPurpose::Withdrawal,
            None,
        )?;
        Ok(PayoutPlan {
            tokens: vec![PayoutToken {
                purpose: PayoutPurpose::RoutingFee,
                recipient: None,
                kind: TokenKind::Sats,
                amount: Msats(args.max_fee_msats),
            }],
            outgoing: Some(outgoing),
        })
    }

    async fn perform(&self, _payin: &PayIn, _args: &ActionArgs) -> Result<serde_json::Value> {
        // a withdrawal has no side effect beyond the payment itself
        Ok(serde_json::Value::Null)
    }

    fn describe(&self, _args: &ActionArgs) -> String {
        "withdrawal to an external wallet".to_string()
    }
}

/// The registry the simulator and tests run with.
pub fn default_registry() -> ActionRegistry {
    ActionRegistry::new()
        .register(ActionKind::Donate, Arc::new(DonateAction))
        .register(ActionKind::Tip, Arc::new(TipAction))
        .register(ActionKind::Withdrawal, Arc::new(WithdrawAction))
}
