use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tollgate::actions::default_registry;
use tollgate::application::orchestrator::{Orchestrator, SubmitContext};
use tollgate::application::transitions::TransitionEngine;
use tollgate::application::wrap::{InvoiceWrapper, WrapPolicy};
use tollgate::domain::account::AccountId;
use tollgate::domain::action::ActionKind;
use tollgate::domain::msats::{Msats, TokenKind};
use tollgate::domain::ports::Ledger;
use tollgate::infrastructure::in_memory::{InMemoryJobQueue, InMemoryStore, SystemClock};
use tollgate::infrastructure::mock_node::{MockNode, NodeEvent};
use tollgate::interfaces::csv::balance_writer::BalanceWriter;
use tollgate::interfaces::csv::submission_reader::{Op, Submission, SubmissionReader};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input submissions CSV file
    input: PathBuf,
}

struct Simulator {
    orchestrator: Arc<Orchestrator>,
    engine: Arc<TransitionEngine>,
    node: MockNode,
    queue: InMemoryJobQueue,
    store: InMemoryStore,
}

impl Simulator {
    fn new() -> Self {
        let store = InMemoryStore::new();
        let node = MockNode::new();
        let queue = InMemoryJobQueue::new();
        let clock = Arc::new(SystemClock);
        let registry = Arc::new(default_registry());
        let wrapper = Arc::new(InvoiceWrapper::new(
            Arc::new(node.clone()),
            clock.clone(),
            WrapPolicy::default(),
        ));
        let engine = Arc::new(TransitionEngine::new(
            Arc::new(store.clone()),
            Arc::new(node.clone()),
            Arc::new(queue.clone()),
            registry.clone(),
            clock.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(node.clone()),
            Arc::new(queue.clone()),
            registry,
            clock,
            wrapper,
            engine.clone(),
        ));
        Self {
            orchestrator,
            engine,
            node,
            queue,
            store,
        }
    }

    async fn apply(&self, submission: Submission) -> tollgate::error::Result<()> {
        let actor = AccountId(submission.account);
        let msats = submission.msats.unwrap_or(0);
        match submission.op {
            Op::Fund => {
                self.store.credit(actor, TokenKind::Sats, Msats(msats)).await?;
            }
            Op::Donate => {
                let args = serde_json::json!({ "msats": msats });
                self.submit_and_pay(ActionKind::Donate, args, actor).await?;
            }
            Op::Tip => {
                let recipient = submission.recipient.unwrap_or(0);
                let args = if submission.p2p.unwrap_or(false) {
                    // the recipient's wallet hands us an invoice for their share
                    let share = msats - msats / 10;
                    let (bolt11, _) = self.node.register_external_invoice(
                        Some(Msats(share)),
                        "recipient-wallet",
                        40,
                        vec![8, 14, 17],
                        Some("tip forward".into()),
                        None,
                        SystemTime::now() + Duration::from_secs(3600),
                    );
                    serde_json::json!({ "recipient": recipient, "msats": msats, "bolt11": bolt11 })
                } else {
                    serde_json::json!({ "recipient": recipient, "msats": msats })
                };
                self.submit_and_pay(ActionKind::Tip, args, actor).await?;
            }
            Op::Withdraw => {
                let (bolt11, _) = self.node.register_external_invoice(
                    Some(Msats(msats)),
                    "user-wallet",
                    40,
                    vec![8, 14, 17],
                    Some("withdrawal".into()),
                    None,
                    SystemTime::now() + Duration::from_secs(3600),
                );
                let args = serde_json::json!({
                    "bolt11": bolt11,
                    "max_fee_msats": submission.max_fee_msats.unwrap_or(1000),
                });
                self.submit_and_pay(ActionKind::Withdrawal, args, actor).await?;
            }
        }
        self.drive().await
    }

    async fn submit_and_pay(
        &self,
        kind: ActionKind,
        args: serde_json::Value,
        actor: AccountId,
    ) -> tollgate::error::Result<()> {
        let outcome = self
            .orchestrator
            .submit(
                kind,
                args,
                SubmitContext {
                    actor: Some(actor),
                    ..SubmitContext::default()
                },
            )
            .await?;
        // the payer settles any invoice straight away
        if let Some(incoming) = &outcome.payin.incoming {
            self.node.pay_incoming(&incoming.hash, incoming.msats_requested);
        }
        Ok(())
    }

    /// Pumps node events, outgoing payments, and due jobs to quiescence.
    async fn drive(&self) -> tollgate::error::Result<()> {
        loop {
            let mut progressed = false;
            for hash in self.node.pending_payment_hashes() {
                self.node.complete_payment(&hash, Msats(500));
                progressed = true;
            }
            for event in self.node.take_events() {
                match event {
                    NodeEvent::Invoice(snap) => self.engine.on_invoice_event(snap).await?,
                    NodeEvent::Payment(snap) => self.engine.on_payment_event(snap).await?,
                }
                progressed = true;
            }
            while let Some(job) = self.queue.pop_due(SystemTime::now()) {
                self.engine.handle(job).await?;
                progressed = true;
            }
            if !progressed {
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let sim = Simulator::new();

    let file = File::open(cli.input).into_diagnostic()?;
    let reader = SubmissionReader::new(file);
    for submission in reader.submissions() {
        match submission {
            Ok(submission) => {
                if let Err(e) = sim.apply(submission).await {
                    eprintln!("Error processing submission: {}", e);
                }
            }
            Err(e) => {
                eprintln!("Error reading submission: {}", e);
            }
        }
    }

    let accounts = sim.store.accounts().await;
    let stdout = io::stdout();
    let mut writer = BalanceWriter::new(stdout.lock());
    writer.write_accounts(accounts).into_diagnostic()?;

    Ok(())
}
