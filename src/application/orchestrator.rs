use crate::application::transitions::TransitionEngine;
use crate::application::wrap::{InvoiceWrapper, WrapDescription};
use crate::domain::account::AccountId;
use crate::domain::action::{ActionArgs, ActionContext, ActionKind, PayoutPlan};
use crate::domain::invoice::{IncomingBolt11, OutgoingBolt11, OutgoingStatus};
use crate::domain::msats::Msats;
use crate::domain::payin::{
    NewPayIn, PayIn, PayInId, PayInState, PayoutPurpose, PayoutToken, PessimisticEnv,
};
use crate::domain::ports::{
    Clock, CreateHoldInvoice, CreateInvoice, Job, JobName, JobQueue, Ledger, PayInStore,
    PayRequest, PaymentNode,
};
use crate::error::{PayError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long an invoice collecting the unpaid remainder stays payable.
const INVOICE_EXPIRY: Duration = Duration::from_secs(600);

/// Settlement delta carried by our own (non-wrapping) hold invoices.
const HOLD_CLTV_DELTA: u32 = 200;

/// Delay before the creation sweep checks on a new pay-in.
const CHECK_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitContext {
    pub actor: Option<AccountId>,
    /// Re-entry carrying proof an invoice was already paid; forces the
    /// pessimistic path.
    pub payment_proof: bool,
    /// Retry lineage: the chain root and attempt number, persisted with the
    /// pay-in at creation.
    pub genesis: Option<PayInId>,
    pub retry_count: u32,
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub payin: PayIn,
    /// The action's result when it ran inline (fee-credit or optimistic).
    pub result: Option<serde_json::Value>,
    /// The invoice the caller must pay, when a remainder exists.
    pub invoice: Option<String>,
}

/// Entry point for submitting monetary actions: decides the execution mode,
/// debits the ledger, persists the pay-in, and issues the invoice for any
/// unpaid remainder.
pub struct Orchestrator {
    store: Arc<dyn PayInStore>,
    ledger: Arc<dyn Ledger>,
    node: Arc<dyn PaymentNode>,
    queue: Arc<dyn JobQueue>,
    registry: Arc<crate::domain::action::ActionRegistry>,
    clock: Arc<dyn Clock>,
    wrapper: Arc<InvoiceWrapper>,
    engine: Arc<TransitionEngine>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn PayInStore>,
        ledger: Arc<dyn Ledger>,
        node: Arc<dyn PaymentNode>,
        queue: Arc<dyn JobQueue>,
        registry: Arc<crate::domain::action::ActionRegistry>,
        clock: Arc<dyn Clock>,
        wrapper: Arc<InvoiceWrapper>,
        engine: Arc<TransitionEngine>,
    ) -> Self {
        Self {
            store,
            ledger,
            node,
            queue,
            registry,
            clock,
            wrapper,
            engine,
        }
    }

    pub async fn submit(
        &self,
        kind: ActionKind,
        args: ActionArgs,
        ctx: SubmitContext,
    ) -> Result<SubmitOutcome> {
        let action = self.registry.get(kind)?.clone();
        let flags = action.flags();
        if ctx.actor.is_none() && !flags.anonable {
            return Err(PayError::AnonymousNotAllowed);
        }

        let actx = ActionContext {
            node: self.node.clone(),
            clock: self.clock.clone(),
            actor: ctx.actor,
        };
        let cost = action.cost(&args, &actx).await?;
        let plan = action.payouts(&args, cost, &actx).await?;

        // the p2p carve-out settles peer to peer, never custodially
        let carved = if flags.p2p {
            plan.outgoing.as_ref().map(|o| o.msats).unwrap_or(Msats::ZERO)
        } else {
            Msats::ZERO
        };
        let custodial_target = cost.saturating_sub(carved);

        let pessimistic = ctx.actor.is_none()
            || !flags.optimistic
            || ctx.payment_proof
            || (flags.p2p && plan.outgoing.is_some());

        let debited = match ctx.actor {
            Some(actor) if flags.fee_credit || flags.withdrawal => {
                self.ledger.debit(actor, custodial_target).await?
            }
            _ => Vec::new(),
        };
        let debited_total: Msats = debited.iter().map(|t| t.amount).sum();
        let remainder = custodial_target.saturating_sub(debited_total);
        debug!(?kind, %cost, %debited_total, %remainder, "submitting pay-in");

        if flags.withdrawal {
            return self
                .submit_withdrawal(kind, args, ctx, cost, plan, debited, remainder)
                .await;
        }

        // nothing left to collect: settle inline
        if remainder.is_zero() && plan.outgoing.is_none() {
            return self.settle_inline(kind, &args, ctx, cost, plan, debited).await;
        }

        if !flags.invoiceable() {
            if let Some(actor) = ctx.actor {
                for token in &debited {
                    self.ledger.credit(actor, token.kind, token.amount).await?;
                }
            }
            return Err(PayError::InsufficientFunds);
        }

        let outgoing = plan.outgoing.as_ref().map(|req| OutgoingBolt11 {
            hash: req.hash.clone(),
            bolt11: req.bolt11.clone(),
            msats: req.msats,
            purpose: req.purpose,
            recipient: req.recipient,
            max_fee: Msats::ZERO,
            fee_paid: None,
            msats_paid: None,
            preimage: None,
            status: OutgoingStatus::Pending,
            failure: None,
            expiry_height: None,
            accept_height: None,
        });
        let env = pessimistic.then(|| PessimisticEnv::new(args.clone()));
        let payin = self
            .store
            .create(NewPayIn {
                kind,
                args: args.clone(),
                mcost: cost,
                state: PayInState::PendingInvoiceCreation,
                account: ctx.actor.unwrap_or_default(),
                benefactor: None,
                genesis: ctx.genesis,
                retry_count: ctx.retry_count,
                pay_in_tokens: debited,
                pay_out_tokens: plan.tokens.clone(),
                outgoing,
                pessimistic: env,
            })
            .await?;
        self.enqueue_check(&payin).await?;

        // optimistic side effects run before any payment is seen
        let mut result = None;
        if !pessimistic {
            match action.perform(&payin, &args).await {
                Ok(v) => result = Some(v),
                Err(err) => {
                    warn!(id = %payin.id, %err, "optimistic perform failed");
                    self.engine
                        .payin_failed(payin.id, Some(err.failure_reason()))
                        .await?;
                    return Err(err);
                }
            }
        }

        // invoice creation is external; on failure a compensating fail
        // refunds whatever was already debited
        match self.issue_invoice(&payin, &plan, remainder, pessimistic).await {
            Ok(payin) => {
                let invoice = payin.incoming.as_ref().map(|inc| inc.bolt11.clone());
                info!(id = %payin.id, state = ?payin.state, "pay-in awaiting payment");
                Ok(SubmitOutcome {
                    payin,
                    result,
                    invoice,
                })
            }
            Err(err) => {
                warn!(id = %payin.id, %err, "invoice creation failed");
                self.engine
                    .payin_failed(payin.id, Some(err.failure_reason()))
                    .await?;
                Err(err)
            }
        }
    }

    async fn settle_inline(
        &self,
        kind: ActionKind,
        args: &ActionArgs,
        ctx: SubmitContext,
        cost: Msats,
        plan: PayoutPlan,
        debited: Vec<crate::domain::account::CustodialToken>,
    ) -> Result<SubmitOutcome> {
        let action = self.registry.get(kind)?.clone();
        let payin = self
            .store
            .create(NewPayIn {
                kind,
                args: args.clone(),
                mcost: cost,
                state: PayInState::PendingInvoiceCreation,
                account: ctx.actor.unwrap_or_default(),
                benefactor: None,
                genesis: ctx.genesis,
                retry_count: ctx.retry_count,
                pay_in_tokens: debited,
                pay_out_tokens: plan.tokens,
                outgoing: None,
                pessimistic: None,
            })
            .await?;
        match action.perform(&payin, args).await {
            Ok(result) => {
                let credits = payin
                    .pay_out_tokens
                    .iter()
                    .filter_map(|t| {
                        t.recipient.map(|account| crate::domain::ports::LedgerCredit {
                            account,
                            kind: t.kind,
                            amount: t.amount,
                        })
                    })
                    .collect();
                let now = self.clock.now();
                let updated = self
                    .store
                    .transition(
                        payin.id,
                        &[PayInState::PendingInvoiceCreation],
                        PayInState::Paid,
                        credits,
                        Box::new(move |p| p.state_changed_at = now),
                    )
                    .await?
                    .ok_or_else(|| PayError::Store("pay-in vanished during inline settle".into()))?;
                action.on_paid(&updated).await?;
                info!(id = %updated.id, %cost, "pay-in settled from balance");
                Ok(SubmitOutcome {
                    payin: updated,
                    result: Some(result),
                    invoice: None,
                })
            }
            Err(err) => {
                warn!(id = %payin.id, %err, "inline perform failed");
                self.engine
                    .payin_failed(payin.id, Some(err.failure_reason()))
                    .await?;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit_withdrawal(
        &self,
        kind: ActionKind,
        args: ActionArgs,
        ctx: SubmitContext,
        cost: Msats,
        plan: PayoutPlan,
        debited: Vec<crate::domain::account::CustodialToken>,
        remainder: Msats,
    ) -> Result<SubmitOutcome> {
        let actor = ctx.actor.ok_or(PayError::AnonymousNotAllowed)?;
        let Some(req) = plan.outgoing else {
            return Err(PayError::Execution("withdrawal has no outgoing invoice".into()));
        };
        if !remainder.is_zero() {
            // withdrawals are never invoiceable: give back what was taken
            for token in &debited {
                self.ledger.credit(actor, token.kind, token.amount).await?;
            }
            return Err(PayError::InsufficientFunds);
        }
        let max_fee = plan
            .tokens
            .iter()
            .find(|t| t.purpose == PayoutPurpose::RoutingFee)
            .map(|t| t.amount)
            .unwrap_or(Msats::ZERO);
        let payin = self
            .store
            .create(NewPayIn {
                kind,
                args,
                mcost: cost,
                state: PayInState::PendingWithdrawal,
                account: actor,
                benefactor: None,
                genesis: ctx.genesis,
                retry_count: ctx.retry_count,
                pay_in_tokens: debited,
                pay_out_tokens: plan.tokens,
                outgoing: Some(OutgoingBolt11 {
                    hash: req.hash.clone(),
                    bolt11: req.bolt11.clone(),
                    msats: req.msats,
                    purpose: PayoutPurpose::Withdrawal,
                    recipient: req.recipient,
                    max_fee,
                    fee_paid: None,
                    msats_paid: None,
                    preimage: None,
                    status: OutgoingStatus::Pending,
                    failure: None,
                    expiry_height: None,
                    accept_height: None,
                }),
                pessimistic: None,
            })
            .await?;
        self.enqueue_check(&payin).await?;
        info!(id = %payin.id, msats = %req.msats, "withdrawal dispatched");

        if let Err(err) = self
            .node
            .pay(PayRequest {
                bolt11: req.bolt11,
                max_fee,
                max_timeout_height: None,
            })
            .await
        {
            warn!(id = %payin.id, %err, "withdrawal dispatch failed");
            let mut failed = Job::new(JobName::WithdrawalFailed, payin.id);
            failed.payment = Some(crate::domain::invoice::PaymentSnapshot {
                hash: req.hash,
                not_sent: true,
                failure: Some(err.to_string()),
                ..Default::default()
            });
            self.queue.enqueue(failed).await?;
        }
        Ok(SubmitOutcome {
            payin,
            result: None,
            invoice: None,
        })
    }

    /// Issues the invoice collecting the unpaid remainder: a wrapping hold
    /// invoice when an outgoing invoice is bound, a plain hold invoice for
    /// pessimistic pay-ins, a regular invoice otherwise.
    async fn issue_invoice(
        &self,
        payin: &PayIn,
        plan: &PayoutPlan,
        remainder: Msats,
        pessimistic: bool,
    ) -> Result<PayIn> {
        let now = self.clock.now();
        if let Some(req) = &plan.outgoing {
            let decoded = self.node.decode(&req.bolt11).await?;
            let wrapped = self
                .wrapper
                .wrap(&req.bolt11, &decoded, remainder, WrapDescription::default())
                .await?;
            let incoming = IncomingBolt11 {
                hash: wrapped.invoice.hash.clone(),
                bolt11: wrapped.invoice.bolt11.clone(),
                msats_requested: wrapped.msats,
                msats_received: None,
                expires_at: wrapped.expires_at,
                preimage: None,
                confirmed_at: None,
                cancelled_at: None,
                hold: true,
            };
            let markup = wrapped.markup;
            let budget = wrapped.fee_budget;
            return self
                .store
                .attach_incoming(
                    payin.id,
                    PayInState::PendingHeld,
                    incoming,
                    Box::new(move |p| {
                        // the wrap surcharge grows the cost and is owed to
                        // the routing-fee and revenue pools
                        p.mcost += markup + budget;
                        if let Some(out) = p.outgoing.as_mut() {
                            out.max_fee = budget;
                        }
                        p.pay_out_tokens.push(PayoutToken {
                            purpose: PayoutPurpose::RoutingFee,
                            recipient: None,
                            kind: crate::domain::msats::TokenKind::Sats,
                            amount: budget,
                        });
                        p.pay_out_tokens.push(PayoutToken {
                            purpose: PayoutPurpose::SystemRevenue,
                            recipient: None,
                            kind: crate::domain::msats::TokenKind::Sats,
                            amount: markup,
                        });
                    }),
                )
                .await?
                .ok_or_else(|| PayError::Store("pay-in left invoicing state early".into()));
        }

        let expires_at = now + INVOICE_EXPIRY;
        let (created, to_state, hold) = if pessimistic {
            let created = self
                .node
                .create_hold_invoice(CreateHoldInvoice {
                    hash: None,
                    invoice: CreateInvoice {
                        description: None,
                        description_hash: None,
                        msats: remainder,
                        expires_at,
                    },
                    cltv_delta: HOLD_CLTV_DELTA,
                })
                .await?;
            (created, PayInState::PendingHeld, true)
        } else {
            let created = self
                .node
                .create_invoice(CreateInvoice {
                    description: None,
                    description_hash: None,
                    msats: remainder,
                    expires_at,
                })
                .await?;
            (created, PayInState::Pending, false)
        };
        let incoming = IncomingBolt11 {
            hash: created.hash,
            bolt11: created.bolt11,
            msats_requested: remainder,
            msats_received: None,
            expires_at,
            preimage: created.preimage,
            confirmed_at: None,
            cancelled_at: None,
            hold,
        };
        self.store
            .attach_incoming(payin.id, to_state, incoming, Box::new(|_| {}))
            .await?
            .ok_or_else(|| PayError::Store("pay-in left invoicing state early".into()))
    }

    async fn enqueue_check(&self, payin: &PayIn) -> Result<()> {
        let mut check = Job::new(JobName::CheckPayIn, payin.id);
        check.opts.start_after = Some(self.clock.now() + CHECK_DELAY);
        self.queue.enqueue(check).await
    }
}
