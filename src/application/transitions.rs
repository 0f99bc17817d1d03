use crate::application::wrap::MIN_SETTLEMENT_CLTV_DELTA;
use crate::domain::action::ActionRegistry;
use crate::domain::invoice::{InvoiceSnapshot, OutgoingStatus, PaymentHash, PaymentSnapshot};
use crate::domain::msats::{Msats, TokenKind};
use crate::domain::payin::{FailureReason, PayIn, PayInId, PayInState, PayoutPurpose, PayoutToken};
use crate::domain::ports::{
    Clock, Job, JobName, JobQueue, LedgerCredit, PayInStore, PayRequest, PaymentNode,
};
use crate::error::{PayError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Longest a held invoice may lock the payer's funds before the deadline job
/// force-cancels it.
const HELD_DEADLINE: Duration = Duration::from_secs(60);

/// Retry options for cancellation jobs. A stuck held invoice is a liability
/// against channel liquidity, so these retry near-unlimited with minimal
/// delay until the node accepts the cancel.
fn cancellation_opts() -> crate::domain::ports::JobOptions {
    crate::domain::ports::JobOptions {
        retry_limit: u32::MAX,
        retry_delay: Duration::from_secs(1),
        ..Default::default()
    }
}

/// What a single transition attempt did.
#[derive(Debug)]
pub enum TransitionOutcome {
    Applied(PayIn),
    /// Benign no-op: record gone, lost race, or already terminal.
    Skipped(&'static str),
}

/// Drives every post-creation state change of a pay-in.
///
/// Each operation re-reads the aggregate, checks its preconditions, and
/// applies one guarded conditional update; a lost race is a no-op. Node calls
/// (settle, cancel, pay) happen only after the update commits.
pub struct TransitionEngine {
    store: Arc<dyn PayInStore>,
    node: Arc<dyn PaymentNode>,
    queue: Arc<dyn JobQueue>,
    registry: Arc<ActionRegistry>,
    clock: Arc<dyn Clock>,
}

impl TransitionEngine {
    pub fn new(
        store: Arc<dyn PayInStore>,
        node: Arc<dyn PaymentNode>,
        queue: Arc<dyn JobQueue>,
        registry: Arc<ActionRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            node,
            queue,
            registry,
            clock,
        }
    }

    /// Runs one job. Errors never propagate to the queue consumer: the job is
    /// re-enqueued with a delay, and unexpected errors additionally schedule
    /// an aggressive cancellation of the bound incoming invoice.
    pub async fn handle(&self, job: Job) -> Result<()> {
        match self.dispatch(&job).await {
            Ok(TransitionOutcome::Applied(payin)) => {
                info!(name = ?job.name, id = %payin.id, state = ?payin.state, "transition applied");
                Ok(())
            }
            Ok(TransitionOutcome::Skipped(why)) => {
                debug!(name = ?job.name, id = ?job.payin_id, why, "transition skipped");
                Ok(())
            }
            Err(err) => {
                if !matches!(err, PayError::Precondition(_)) {
                    error!(name = ?job.name, id = ?job.payin_id, %err, "transition failed");
                    self.schedule_finalize_for(&job).await?;
                } else {
                    warn!(name = ?job.name, id = ?job.payin_id, %err, "transition not ready");
                }
                self.requeue(job).await
            }
        }
    }

    async fn dispatch(&self, job: &Job) -> Result<TransitionOutcome> {
        if let JobName::FinalizeHoldInvoice = job.name {
            let hash = job
                .hash
                .as_ref()
                .ok_or(PayError::Precondition("finalize job carries no hash"))?;
            return self.finalize_hold_invoice(hash).await;
        }
        let id = job
            .payin_id
            .ok_or(PayError::Precondition("job carries no pay-in id"))?;
        match job.name {
            JobName::CheckPayIn => self.check_payin(id).await,
            JobName::PayInPaid => self.payin_paid(id, job.invoice.clone()).await,
            JobName::PayInHeld => self.payin_held(id, job.invoice.clone()).await,
            JobName::PayInForwarding => self.payin_forwarding(id, job.invoice.clone()).await,
            JobName::PayInForwarded => {
                let snap = job
                    .payment
                    .clone()
                    .ok_or(PayError::Precondition("forwarded job carries no payment"))?;
                self.payin_forwarded(id, snap).await
            }
            JobName::PayInFailedForward => {
                self.payin_failed_forward(id, job.payment.clone().unwrap_or_default())
                    .await
            }
            JobName::PayInCancel => self.payin_cancel(id, job.reason).await,
            JobName::PayInFailed => self.payin_failed(id, job.reason).await,
            JobName::WithdrawalPaid => {
                let snap = job
                    .payment
                    .clone()
                    .ok_or(PayError::Precondition("withdrawal job carries no payment"))?;
                self.withdrawal_paid(id, snap).await
            }
            JobName::WithdrawalFailed => {
                self.withdrawal_failed(id, job.payment.clone().unwrap_or_default())
                    .await
            }
            JobName::FinalizeHoldInvoice => unreachable!("handled above"),
        }
    }

    async fn requeue(&self, mut job: Job) -> Result<()> {
        if job.opts.retry_limit == 0 {
            error!(name = ?job.name, id = ?job.payin_id, "job exhausted its retries");
            return Ok(());
        }
        job.opts.retry_limit -= 1;
        job.opts.start_after = Some(self.clock.now() + job.opts.retry_delay);
        if job.opts.retry_backoff {
            job.opts.retry_delay *= 2;
        }
        self.queue.enqueue(job).await
    }

    async fn schedule_finalize_for(&self, job: &Job) -> Result<()> {
        let Some(id) = job.payin_id else {
            return Ok(());
        };
        let Some(payin) = self.store.get(id).await? else {
            return Ok(());
        };
        if let Some(incoming) = payin.incoming {
            self.queue
                .enqueue(Job {
                    hash: Some(incoming.hash),
                    opts: cancellation_opts(),
                    ..Job::new(JobName::FinalizeHoldInvoice, id)
                })
                .await?;
        }
        Ok(())
    }

    /// Maps an invoice notification onto the transition job it warrants.
    pub async fn on_invoice_event(&self, snap: InvoiceSnapshot) -> Result<()> {
        let Some(payin) = self.store.find_by_incoming_hash(&snap.hash).await? else {
            debug!(hash = %snap.hash, "invoice event for unknown hash");
            return Ok(());
        };
        if payin.state.is_terminal() {
            return Ok(());
        }
        let name = if snap.is_held {
            if payin.outgoing.is_some() {
                JobName::PayInForwarding
            } else {
                JobName::PayInHeld
            }
        } else if snap.is_confirmed {
            JobName::PayInPaid
        } else if snap.is_canceled {
            JobName::PayInCancel
        } else {
            return Ok(());
        };
        self.queue
            .enqueue(Job {
                invoice: Some(snap),
                ..Job::new(name, payin.id)
            })
            .await
    }

    /// Maps an outgoing-payment notification onto its transition job.
    pub async fn on_payment_event(&self, snap: PaymentSnapshot) -> Result<()> {
        let Some(payin) = self.store.find_by_outgoing_hash(&snap.hash).await? else {
            debug!(hash = %snap.hash, "payment event for unknown hash");
            return Ok(());
        };
        if payin.state.is_terminal() {
            return Ok(());
        }
        let withdrawal = payin
            .outgoing
            .as_ref()
            .is_some_and(|o| o.purpose == PayoutPurpose::Withdrawal);
        let name = if snap.is_confirmed {
            if withdrawal {
                JobName::WithdrawalPaid
            } else {
                JobName::PayInForwarded
            }
        } else if snap.is_failed || snap.not_sent {
            if withdrawal {
                JobName::WithdrawalFailed
            } else {
                JobName::PayInFailedForward
            }
        } else {
            return Ok(());
        };
        self.queue
            .enqueue(Job {
                payment: Some(snap),
                ..Job::new(name, payin.id)
            })
            .await
    }

    fn payout_credits(payin: &PayIn) -> Vec<LedgerCredit> {
        payin
            .pay_out_tokens
            .iter()
            .filter_map(|t| {
                t.recipient.map(|account| LedgerCredit {
                    account,
                    kind: t.kind,
                    amount: t.amount,
                })
            })
            .collect()
    }

    fn refund_credits(payin: &PayIn) -> Vec<LedgerCredit> {
        payin
            .pay_in_tokens
            .iter()
            .map(|t| LedgerCredit {
                account: payin.account,
                kind: t.kind,
                amount: t.amount,
            })
            .collect()
    }

    /// Runs the deferred action of a pessimistic pay-in exactly once; the
    /// `performed` flag guards the two transition paths that can reach here.
    async fn run_deferred(&self, payin: &PayIn) -> Result<()> {
        let Some(env) = &payin.pessimistic else {
            return Ok(());
        };
        if env.performed {
            return Ok(());
        }
        let action = self.registry.get(payin.kind)?;
        let outcome = match action.perform(payin, &env.args).await {
            Ok(result) => Ok(result),
            Err(err) => {
                error!(id = %payin.id, %err, "deferred action failed");
                Err(err.to_string())
            }
        };
        self.store.record_pessimistic(payin.id, outcome).await
    }

    /// mark-paid: HELD | PENDING | FORWARDED → PAID.
    pub async fn payin_paid(
        &self,
        id: PayInId,
        snap: Option<InvoiceSnapshot>,
    ) -> Result<TransitionOutcome> {
        let Some(payin) = self.store.get(id).await? else {
            return Ok(TransitionOutcome::Skipped("not found"));
        };
        if payin.state.is_terminal() {
            return Ok(TransitionOutcome::Skipped("terminal"));
        }
        let credits = Self::payout_credits(&payin);
        let now = self.clock.now();
        let updated = self
            .store
            .transition(
                id,
                &[PayInState::Held, PayInState::Pending, PayInState::Forwarded],
                PayInState::Paid,
                credits,
                Box::new(move |p| {
                    p.state_changed_at = now;
                    if let Some(incoming) = p.incoming.as_mut() {
                        if let Some(snap) = snap {
                            if snap.received.is_some() {
                                incoming.msats_received = snap.received;
                            }
                            if snap.preimage.is_some() {
                                incoming.preimage = snap.preimage;
                            }
                            incoming.confirmed_at = snap.confirmed_at.or(Some(now));
                        } else if incoming.confirmed_at.is_none() {
                            incoming.confirmed_at = Some(now);
                        }
                    }
                }),
            )
            .await?;
        match updated {
            Some(payin) => {
                self.registry.get(payin.kind)?.on_paid(&payin).await?;
                Ok(TransitionOutcome::Applied(payin))
            }
            None => Ok(TransitionOutcome::Skipped("lost race")),
        }
    }

    /// mark-held: PENDING_HELD → HELD, then settle the hold invoice.
    pub async fn payin_held(
        &self,
        id: PayInId,
        snap: Option<InvoiceSnapshot>,
    ) -> Result<TransitionOutcome> {
        let Some(payin) = self.store.get(id).await? else {
            return Ok(TransitionOutcome::Skipped("not found"));
        };
        if payin.outgoing.is_some() {
            return Err(PayError::Precondition(
                "held invoice has a bound outgoing payment; forward instead",
            ));
        }
        let Some(incoming) = payin.incoming.clone() else {
            return Err(PayError::Precondition("no incoming invoice bound"));
        };
        let now = self.clock.now();
        let received = snap.as_ref().and_then(|s| s.received);
        let updated = self
            .store
            .transition(
                id,
                &[PayInState::PendingHeld],
                PayInState::Held,
                Vec::new(),
                Box::new(move |p| {
                    p.state_changed_at = now;
                    if let Some(inc) = p.incoming.as_mut()
                        && received.is_some()
                    {
                        inc.msats_received = received;
                    }
                }),
            )
            .await?;
        let Some(payin) = updated else {
            // race-tolerant: the invoice may have confirmed straight away
            if snap.is_some_and(|s| s.is_confirmed) {
                self.queue
                    .enqueue(Job::new(JobName::PayInPaid, id))
                    .await?;
            }
            return Ok(TransitionOutcome::Skipped("lost race"));
        };

        // deadline job: a held invoice never outlives min(expiry, ceiling)
        let deadline = incoming.expires_at.min(now + HELD_DEADLINE);
        let mut cancel = Job::new(JobName::PayInCancel, id);
        cancel.reason = Some(FailureReason::HeldSettledTooSlow);
        cancel.opts.start_after = Some(deadline);
        cancel.opts.retry_limit = 21;
        cancel.opts.retry_backoff = true;
        self.queue.enqueue(cancel).await?;

        self.run_deferred(&payin).await?;

        let preimage = incoming
            .preimage
            .ok_or(PayError::Precondition("hold invoice has no settlement secret"))?;
        self.node.settle_hold_invoice(&preimage).await?;
        Ok(TransitionOutcome::Applied(payin))
    }

    /// begin-forward: PENDING_HELD → FORWARDING, then pay the outgoing
    /// invoice post-commit.
    pub async fn payin_forwarding(
        &self,
        id: PayInId,
        snap: Option<InvoiceSnapshot>,
    ) -> Result<TransitionOutcome> {
        let Some(payin) = self.store.get(id).await? else {
            return Ok(TransitionOutcome::Skipped("not found"));
        };
        let Some(outgoing) = payin.outgoing.clone() else {
            return Err(PayError::Precondition("no outgoing payment bound"));
        };
        let snap =
            snap.ok_or(PayError::Precondition("forward job carries no invoice snapshot"))?;
        let accept_height = snap
            .accept_height
            .ok_or(PayError::Precondition("no accept height observed"))?;
        let expiry_height = snap
            .expiry_height
            .ok_or(PayError::Precondition("no expiry height observed"))?;

        let decoded = self.node.decode(&outgoing.bolt11).await?;
        let budget = expiry_height.saturating_sub(accept_height);
        if budget.saturating_sub(decoded.cltv_delta) < MIN_SETTLEMENT_CLTV_DELTA {
            warn!(%id, budget, outgoing_delta = decoded.cltv_delta, "timelock budget too small");
            let mut cancel = Job::new(JobName::PayInCancel, id);
            cancel.reason = Some(FailureReason::ForwardCltvTooLow);
            cancel.opts = cancellation_opts();
            self.queue.enqueue(cancel).await?;
            return Ok(TransitionOutcome::Skipped("insufficient timelock budget"));
        }

        let now = self.clock.now();
        let updated = self
            .store
            .transition(
                id,
                &[PayInState::PendingHeld],
                PayInState::Forwarding,
                Vec::new(),
                Box::new(move |p| {
                    p.state_changed_at = now;
                    if let Some(out) = p.outgoing.as_mut() {
                        out.accept_height = Some(accept_height);
                        out.expiry_height = Some(expiry_height);
                    }
                    if let Some(inc) = p.incoming.as_mut() {
                        inc.msats_received = snap.received;
                    }
                }),
            )
            .await?;
        let Some(payin) = updated else {
            return Ok(TransitionOutcome::Skipped("lost race"));
        };

        self.run_deferred(&payin).await?;

        let pay = self
            .node
            .pay(PayRequest {
                bolt11: outgoing.bolt11.clone(),
                max_fee: outgoing.max_fee,
                max_timeout_height: Some(expiry_height - MIN_SETTLEMENT_CLTV_DELTA),
            })
            .await;
        if let Err(err) = pay {
            // the payment was never handed off; fail the forward directly
            warn!(%id, %err, "outgoing payment dispatch failed");
            let mut failed = Job::new(JobName::PayInFailedForward, id);
            failed.payment = Some(PaymentSnapshot {
                hash: outgoing.hash.clone(),
                not_sent: true,
                failure: Some(err.to_string()),
                ..PaymentSnapshot::default()
            });
            self.queue.enqueue(failed).await?;
        }
        Ok(TransitionOutcome::Applied(payin))
    }

    /// forward-settled: FORWARDING → FORWARDED, then settle the incoming hold
    /// invoice with the preimage the outgoing payment revealed.
    pub async fn payin_forwarded(
        &self,
        id: PayInId,
        snap: PaymentSnapshot,
    ) -> Result<TransitionOutcome> {
        let Some(payin) = self.store.get(id).await? else {
            return Ok(TransitionOutcome::Skipped("not found"));
        };
        let Some(outgoing) = payin.outgoing.clone() else {
            return Err(PayError::Precondition("no outgoing payment bound"));
        };
        let preimage = snap
            .preimage
            .clone()
            .ok_or(PayError::Precondition("confirmed payment revealed no preimage"))?;
        let fee_paid = snap.fee_paid.unwrap_or(outgoing.max_fee);
        let surplus = outgoing.max_fee.saturating_sub(fee_paid);
        let now = self.clock.now();
        let settle_preimage = preimage.clone();
        let updated = self
            .store
            .transition(
                id,
                &[PayInState::Forwarding],
                PayInState::Forwarded,
                Vec::new(),
                Box::new(move |p| {
                    p.state_changed_at = now;
                    if let Some(out) = p.outgoing.as_mut() {
                        out.status = OutgoingStatus::Confirmed;
                        out.msats_paid = snap.msats_paid;
                        out.fee_paid = Some(fee_paid);
                        out.preimage = Some(preimage);
                    }
                    true_up_routing_fee(&mut p.pay_out_tokens, fee_paid, surplus, None);
                }),
            )
            .await?;
        match updated {
            Some(payin) => {
                self.node.settle_hold_invoice(&settle_preimage).await?;
                Ok(TransitionOutcome::Applied(payin))
            }
            None => Ok(TransitionOutcome::Skipped("lost race")),
        }
    }

    /// forward-failed: FORWARDING → FAILED_FORWARD, with the incoming
    /// invoice's cancellation scheduled before the transition.
    pub async fn payin_failed_forward(
        &self,
        id: PayInId,
        snap: PaymentSnapshot,
    ) -> Result<TransitionOutcome> {
        let Some(payin) = self.store.get(id).await? else {
            return Ok(TransitionOutcome::Skipped("not found"));
        };
        if let Some(incoming) = &payin.incoming {
            self.queue
                .enqueue(Job {
                    hash: Some(incoming.hash.clone()),
                    opts: cancellation_opts(),
                    ..Job::new(JobName::FinalizeHoldInvoice, id)
                })
                .await?;
        }
        let now = self.clock.now();
        let updated = self
            .store
            .transition(
                id,
                &[PayInState::Forwarding],
                PayInState::FailedForward,
                Vec::new(),
                Box::new(move |p| {
                    p.state_changed_at = now;
                    p.failure_reason.get_or_insert(FailureReason::ForwardFailed);
                    if let Some(out) = p.outgoing.as_mut() {
                        out.status = OutgoingStatus::Failed;
                        out.failure = snap.failure;
                    }
                }),
            )
            .await?;
        match updated {
            Some(payin) => Ok(TransitionOutcome::Applied(payin)),
            None => Ok(TransitionOutcome::Skipped("lost race")),
        }
    }

    /// cancel: HELD | PENDING | PENDING_HELD | FAILED_FORWARD → CANCELLED.
    pub async fn payin_cancel(
        &self,
        id: PayInId,
        reason: Option<FailureReason>,
    ) -> Result<TransitionOutcome> {
        let Some(payin) = self.store.get(id).await? else {
            return Ok(TransitionOutcome::Skipped("not found"));
        };
        if payin.state.is_terminal() {
            return Ok(TransitionOutcome::Skipped("terminal"));
        }
        let Some(incoming) = payin.incoming.clone() else {
            return Ok(TransitionOutcome::Skipped("no incoming invoice"));
        };
        if incoming.confirmed_at.is_some() {
            return Ok(TransitionOutcome::Skipped("invoice already confirmed"));
        }

        // cancel at the node first; if that fails the job retries and the
        // state stays untouched
        if incoming.cancelled_at.is_none() {
            self.node.cancel_invoice(&incoming.hash).await?;
        }

        let now = self.clock.now();
        let updated = self
            .store
            .transition(
                id,
                &[
                    PayInState::Held,
                    PayInState::Pending,
                    PayInState::PendingHeld,
                    PayInState::FailedForward,
                ],
                PayInState::Cancelled,
                Vec::new(),
                Box::new(move |p| {
                    p.state_changed_at = now;
                    p.failure_reason = p
                        .failure_reason
                        .or(reason)
                        .or(Some(FailureReason::SystemCancelled));
                    if let Some(inc) = p.incoming.as_mut() {
                        inc.cancelled_at = Some(now);
                    }
                }),
            )
            .await?;
        match updated {
            Some(payin) => {
                self.queue
                    .enqueue(Job::new(JobName::PayInFailed, id))
                    .await?;
                Ok(TransitionOutcome::Applied(payin))
            }
            None => Ok(TransitionOutcome::Skipped("lost race")),
        }
    }

    /// fail: any live non-withdrawal state → FAILED, with exact refunds.
    pub async fn payin_failed(
        &self,
        id: PayInId,
        reason: Option<FailureReason>,
    ) -> Result<TransitionOutcome> {
        let Some(payin) = self.store.get(id).await? else {
            return Ok(TransitionOutcome::Skipped("not found"));
        };
        if payin.state.is_terminal() {
            return Ok(TransitionOutcome::Skipped("terminal"));
        }
        if let Some(incoming) = &payin.incoming
            && incoming.cancelled_at.is_none()
            && incoming.confirmed_at.is_none()
        {
            return Err(PayError::Precondition("incoming invoice not canceled yet"));
        }
        let credits = Self::refund_credits(&payin);
        let now = self.clock.now();
        let updated = self
            .store
            .transition(
                id,
                &[
                    PayInState::Pending,
                    PayInState::PendingHeld,
                    PayInState::Held,
                    PayInState::FailedForward,
                    PayInState::Cancelled,
                    PayInState::PendingInvoiceCreation,
                ],
                PayInState::Failed,
                credits,
                Box::new(move |p| {
                    p.state_changed_at = now;
                    p.refund_tokens = p.pay_in_tokens.clone();
                    p.failure_reason = p
                        .failure_reason
                        .or(reason)
                        .or(Some(FailureReason::InvoiceExpired));
                }),
            )
            .await?;
        match updated {
            Some(payin) => {
                self.registry.get(payin.kind)?.on_fail(&payin).await?;
                Ok(TransitionOutcome::Applied(payin))
            }
            None => Ok(TransitionOutcome::Skipped("lost race")),
        }
    }

    /// withdrawal-paid: PENDING_WITHDRAWAL → PAID, truing the routing-fee
    /// entry down to the fee actually paid and refunding the surplus.
    pub async fn withdrawal_paid(
        &self,
        id: PayInId,
        snap: PaymentSnapshot,
    ) -> Result<TransitionOutcome> {
        let Some(payin) = self.store.get(id).await? else {
            return Ok(TransitionOutcome::Skipped("not found"));
        };
        let Some(outgoing) = payin.outgoing.clone() else {
            return Err(PayError::Precondition("no outgoing payment bound"));
        };
        let fee_paid = snap.fee_paid.unwrap_or(outgoing.max_fee);
        let surplus = outgoing.max_fee.saturating_sub(fee_paid);
        let owner = payin.account;
        let mut credits = Vec::new();
        if !surplus.is_zero() {
            credits.push(LedgerCredit {
                account: owner,
                kind: TokenKind::Sats,
                amount: surplus,
            });
        }
        let now = self.clock.now();
        let updated = self
            .store
            .transition(
                id,
                &[PayInState::PendingWithdrawal],
                PayInState::Paid,
                credits,
                Box::new(move |p| {
                    p.state_changed_at = now;
                    if let Some(out) = p.outgoing.as_mut() {
                        out.status = OutgoingStatus::Confirmed;
                        out.msats_paid = snap.msats_paid;
                        out.fee_paid = Some(fee_paid);
                        out.preimage = snap.preimage;
                    }
                    true_up_routing_fee(&mut p.pay_out_tokens, fee_paid, surplus, Some(owner));
                }),
            )
            .await?;
        match updated {
            Some(payin) => {
                self.registry.get(payin.kind)?.on_paid(&payin).await?;
                Ok(TransitionOutcome::Applied(payin))
            }
            None => Ok(TransitionOutcome::Skipped("lost race")),
        }
    }

    /// withdrawal-failed: PENDING_WITHDRAWAL → FAILED with full refund.
    pub async fn withdrawal_failed(
        &self,
        id: PayInId,
        snap: PaymentSnapshot,
    ) -> Result<TransitionOutcome> {
        let Some(payin) = self.store.get(id).await? else {
            return Ok(TransitionOutcome::Skipped("not found"));
        };
        let credits = Self::refund_credits(&payin);
        let now = self.clock.now();
        let updated = self
            .store
            .transition(
                id,
                &[PayInState::PendingWithdrawal],
                PayInState::Failed,
                credits,
                Box::new(move |p| {
                    p.state_changed_at = now;
                    p.refund_tokens = p.pay_in_tokens.clone();
                    p.failure_reason.get_or_insert(FailureReason::WithdrawalFailed);
                    if let Some(out) = p.outgoing.as_mut() {
                        out.status = OutgoingStatus::Failed;
                        out.failure = snap.failure;
                    }
                }),
            )
            .await?;
        match updated {
            Some(payin) => {
                self.registry.get(payin.kind)?.on_fail(&payin).await?;
                Ok(TransitionOutcome::Applied(payin))
            }
            None => Ok(TransitionOutcome::Skipped("lost race")),
        }
    }

    /// Sweep: drives a pay-in stuck before invoicing to FAILED and expires
    /// invoices the node never resolved.
    pub async fn check_payin(&self, id: PayInId) -> Result<TransitionOutcome> {
        let Some(payin) = self.store.get(id).await? else {
            return Ok(TransitionOutcome::Skipped("not found"));
        };
        match payin.state {
            PayInState::PendingInvoiceCreation => {
                let mut job = Job::new(JobName::PayInFailed, id);
                job.reason = Some(FailureReason::InvoiceCreationFailed);
                self.queue.enqueue(job).await?;
                Ok(TransitionOutcome::Skipped("stuck before invoicing"))
            }
            PayInState::Pending | PayInState::PendingHeld => {
                let expired = payin
                    .incoming
                    .as_ref()
                    .is_some_and(|inc| inc.expires_at <= self.clock.now());
                if expired {
                    let mut job = Job::new(JobName::PayInCancel, id);
                    job.reason = Some(FailureReason::InvoiceExpired);
                    self.queue.enqueue(job).await?;
                }
                Ok(TransitionOutcome::Skipped("checked"))
            }
            _ => Ok(TransitionOutcome::Skipped("checked")),
        }
    }

    /// Cancels a bound hold invoice at the node, skipping settled ones.
    async fn finalize_hold_invoice(&self, hash: &PaymentHash) -> Result<TransitionOutcome> {
        if let Some(payin) = self.store.find_by_incoming_hash(hash).await?
            && payin
                .incoming
                .as_ref()
                .is_some_and(|inc| inc.confirmed_at.is_some())
        {
            return Ok(TransitionOutcome::Skipped("invoice already confirmed"));
        }
        self.node.cancel_invoice(hash).await?;
        Ok(TransitionOutcome::Skipped("invoice canceled"))
    }
}

/// Replaces the estimated routing-fee entry with the fee actually paid and
/// moves the surplus: refunded to the owner on withdrawals, pooled into the
/// rewards entry on forwards.
fn true_up_routing_fee(
    tokens: &mut Vec<PayoutToken>,
    fee_paid: Msats,
    surplus: Msats,
    refund_to: Option<crate::domain::account::AccountId>,
) {
    if let Some(fee_token) = tokens
        .iter_mut()
        .find(|t| t.purpose == PayoutPurpose::RoutingFee)
    {
        fee_token.amount = fee_paid;
    }
    if surplus.is_zero() {
        return;
    }
    match refund_to {
        Some(account) => tokens.push(PayoutToken {
            purpose: PayoutPurpose::RoutingFeeRefund,
            recipient: Some(account),
            kind: TokenKind::Sats,
            amount: surplus,
        }),
        None => tokens.push(PayoutToken {
            purpose: PayoutPurpose::RewardsPool,
            recipient: None,
            kind: TokenKind::Sats,
            amount: surplus,
        }),
    }
}
