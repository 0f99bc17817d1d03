use crate::application::orchestrator::{Orchestrator, SubmitContext, SubmitOutcome};
use crate::domain::account::AccountId;
use crate::domain::payin::{PayInId, PayInState};
use crate::domain::ports::PayInStore;
use crate::error::{PayError, Result};
use std::sync::Arc;
use tracing::info;

/// Re-creates a failed pay-in as a fresh attempt linked into its retry chain.
pub struct RetryCoordinator {
    store: Arc<dyn PayInStore>,
    registry: Arc<crate::domain::action::ActionRegistry>,
    orchestrator: Arc<Orchestrator>,
}

impl RetryCoordinator {
    pub fn new(
        store: Arc<dyn PayInStore>,
        registry: Arc<crate::domain::action::ActionRegistry>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            store,
            registry,
            orchestrator,
        }
    }

    pub async fn retry(&self, original_id: PayInId, actor: AccountId) -> Result<SubmitOutcome> {
        let original = self
            .store
            .get(original_id)
            .await?
            .ok_or(PayError::PayInNotFound(original_id))?;
        if original.account != actor {
            return Err(PayError::NotOwner);
        }
        if original.state != PayInState::Failed {
            return Err(PayError::RetryNotAllowed("pay-in is not in a failed state"));
        }
        if original.successor.is_some() {
            return Err(PayError::RetryNotAllowed("pay-in was already retried"));
        }
        let action = self.registry.get(original.kind)?.clone();
        let flags = action.flags();
        if !flags.retryable || flags.withdrawal {
            return Err(PayError::RetryNotAllowed("action type does not support retrying"));
        }

        // transient marker so two callers can't both spawn a successor
        let marked = self
            .store
            .transition(
                original_id,
                &[PayInState::Failed],
                PayInState::Retrying,
                Vec::new(),
                Box::new(|_| {}),
            )
            .await?;
        if marked.is_none() {
            return Err(PayError::RetryNotAllowed("pay-in was already retried"));
        }

        let genesis = original.genesis.unwrap_or(original.id);
        let outcome = self
            .orchestrator
            .submit(
                original.kind,
                original.args.clone(),
                SubmitContext {
                    actor: Some(actor),
                    genesis: Some(genesis),
                    retry_count: original.retry_count + 1,
                    ..SubmitContext::default()
                },
            )
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                // no successor exists; drop the marker so the pay-in stays
                // retryable
                self.store
                    .transition(
                        original_id,
                        &[PayInState::Retrying],
                        PayInState::Failed,
                        Vec::new(),
                        Box::new(|_| {}),
                    )
                    .await?;
                return Err(err);
            }
        };

        // clear the marker and link the successor in one guarded update, so
        // no caller ever observes a failed pay-in without its link
        let successor_id = outcome.payin.id;
        self.store
            .transition(
                original_id,
                &[PayInState::Retrying],
                PayInState::Failed,
                Vec::new(),
                Box::new(move |p| p.successor = Some(successor_id)),
            )
            .await?;

        action.retry(&original, &outcome.payin).await?;
        info!(
            original = %original_id,
            successor = %outcome.payin.id,
            %genesis,
            "retry attempt created"
        );
        Ok(outcome)
    }
}
