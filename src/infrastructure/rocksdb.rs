use crate::domain::account::{Account, AccountId, CustodialToken};
use crate::domain::invoice::PaymentHash;
use crate::domain::msats::{Msats, TokenKind};
use crate::domain::payin::{NewPayIn, PayIn, PayInId, PayInState};
use crate::domain::ports::{Ledger, LedgerCredit, PayInMutation, PayInStore};
use crate::error::{PayError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, DB, Options};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;

/// Column family for account balances.
pub const CF_ACCOUNTS: &str = "accounts";
/// Column family for pay-in aggregates.
pub const CF_PAYINS: &str = "payins";
/// Column family mapping incoming payment hashes to pay-in ids.
pub const CF_INCOMING_INDEX: &str = "incoming_index";
/// Column family mapping outgoing payment hashes to pay-in ids.
pub const CF_OUTGOING_INDEX: &str = "outgoing_index";
/// Column family for counters.
pub const CF_META: &str = "meta";

const NEXT_PAYIN_ID: &[u8] = b"next_payin_id";

/// A persistent store implementation using RocksDB.
///
/// RocksDB has no multi-key conditional update, so every debit and guarded
/// transition runs under one async mutex; within that critical section the
/// read-check-write sequence is equivalent to the in-memory store's CAS.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDbStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDbStore {
    /// Opens or creates a RocksDB instance at the specified path, ensuring
    /// the required column families exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = [
            CF_ACCOUNTS,
            CF_PAYINS,
            CF_INCOMING_INDEX,
            CF_OUTGOING_INDEX,
            CF_META,
        ]
        .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PayError::Store(format!("{name} column family not found")))
    }

    fn read_account(&self, id: AccountId) -> Result<Option<Account>> {
        let cf = self.cf(CF_ACCOUNTS)?;
        match self.db.get_cf(cf, id.0.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_account(&self, account: &Account) -> Result<()> {
        let cf = self.cf(CF_ACCOUNTS)?;
        self.db
            .put_cf(cf, account.id.0.to_be_bytes(), serde_json::to_vec(account)?)?;
        Ok(())
    }

    fn read_payin(&self, id: PayInId) -> Result<Option<PayIn>> {
        let cf = self.cf(CF_PAYINS)?;
        match self.db.get_cf(cf, id.0.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_payin(&self, payin: &PayIn) -> Result<()> {
        let cf = self.cf(CF_PAYINS)?;
        self.db
            .put_cf(cf, payin.id.0.to_be_bytes(), serde_json::to_vec(payin)?)?;
        self.index_hashes(payin)
    }

    fn index_hashes(&self, payin: &PayIn) -> Result<()> {
        if let Some(incoming) = &payin.incoming {
            let cf = self.cf(CF_INCOMING_INDEX)?;
            self.db
                .put_cf(cf, incoming.hash.0.as_bytes(), payin.id.0.to_be_bytes())?;
        }
        if let Some(outgoing) = &payin.outgoing {
            let cf = self.cf(CF_OUTGOING_INDEX)?;
            self.db
                .put_cf(cf, outgoing.hash.0.as_bytes(), payin.id.0.to_be_bytes())?;
        }
        Ok(())
    }

    fn lookup(&self, index_cf: &str, hash: &PaymentHash) -> Result<Option<PayIn>> {
        let cf = self.cf(index_cf)?;
        let Some(bytes) = self.db.get_cf(cf, hash.0.as_bytes())? else {
            return Ok(None);
        };
        let id = u64::from_be_bytes(
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| PayError::Store("corrupt hash index entry".into()))?,
        );
        self.read_payin(PayInId(id))
    }

    fn apply_credit(&self, credit: &LedgerCredit) -> Result<()> {
        let mut account = self
            .read_account(credit.account)?
            .unwrap_or_else(|| Account::new(credit.account));
        account.credit(credit.kind, credit.amount);
        self.write_account(&account)
    }
}

#[async_trait]
impl Ledger for RocksDbStore {
    async fn debit(&self, account: AccountId, amount: Msats) -> Result<Vec<CustodialToken>> {
        let _guard = self.write_lock.lock().await;
        let mut acct = self
            .read_account(account)?
            .unwrap_or_else(|| Account::new(account));
        let taken = acct.debit(amount);
        self.write_account(&acct)?;
        Ok(taken)
    }

    async fn credit(&self, account: AccountId, kind: TokenKind, amount: Msats) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.apply_credit(&LedgerCredit {
            account,
            kind,
            amount,
        })
    }

    async fn account(&self, account: AccountId) -> Result<Option<Account>> {
        self.read_account(account)
    }

    async fn upsert_account(&self, account: Account) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_account(&account)
    }
}

#[async_trait]
impl PayInStore for RocksDbStore {
    async fn create(&self, new: NewPayIn) -> Result<PayIn> {
        let _guard = self.write_lock.lock().await;
        let meta = self.cf(CF_META)?;
        let next = match self.db.get_cf(meta, NEXT_PAYIN_ID)? {
            Some(bytes) => u64::from_be_bytes(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| PayError::Store("corrupt pay-in counter".into()))?,
            ),
            None => 1,
        };
        self.db
            .put_cf(meta, NEXT_PAYIN_ID, (next + 1).to_be_bytes())?;

        let now = SystemTime::now();
        let payin = PayIn {
            id: PayInId(next),
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
        self.write_payin(&payin)?;
        Ok(payin)
    }

    async fn get(&self, id: PayInId) -> Result<Option<PayIn>> {
        self.read_payin(id)
    }

    async fn find_by_incoming_hash(&self, hash: &PaymentHash) -> Result<Option<PayIn>> {
        self.lookup(CF_INCOMING_INDEX, hash)
    }

    async fn find_by_outgoing_hash(&self, hash: &PaymentHash) -> Result<Option<PayIn>> {
        self.lookup(CF_OUTGOING_INDEX, hash)
    }

    async fn transition(
        &self,
        id: PayInId,
        from: &[PayInState],
        to: PayInState,
        credits: Vec<LedgerCredit>,
        mutate: PayInMutation,
    ) -> Result<Option<PayIn>> {
        let _guard = self.write_lock.lock().await;
        let Some(mut payin) = self.read_payin(id)? else {
            return Ok(None);
        };
        if !from.contains(&payin.state) {
            return Ok(None);
        }
        payin.state = to;
        mutate(&mut payin);
        self.write_payin(&payin)?;
        for credit in &credits {
            self.apply_credit(credit)?;
        }
        Ok(Some(payin))
    }

    async fn record_pessimistic(
        &self,
        id: PayInId,
        outcome: std::result::Result<serde_json::Value, String>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let Some(mut payin) = self.read_payin(id)? else {
            return Ok(());
        };
        if let Some(env) = payin.pessimistic.as_mut() {
            env.performed = true;
            match outcome {
                Ok(result) => env.result = Some(result),
                Err(error) => env.error = Some(error),
            }
            self.write_payin(&payin)?;
        }
        Ok(())
    }
}
