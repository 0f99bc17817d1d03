use crate::domain::msats::{Msats, TokenKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The unique identifier of a custodial account.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct AccountId(pub u64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "account:{}", self.0)
    }
}

/// A custodial account holding the two balance kinds.
///
/// Balances are only ever mutated through [`debit`](Account::debit) and
/// [`credit`](Account::credit); callers never read-then-write them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Pre-purchased credit balance.
    pub mcredits: Msats,
    /// Earned-value balance.
    pub msats: Msats,
}

/// A ledger entry recording value taken from (or returned to) one balance kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodialToken {
    pub kind: TokenKind,
    pub amount: Msats,
}

impl Account {
    pub fn new(id: AccountId) -> Self {
        Self {
            id,
            mcredits: Msats::ZERO,
            msats: Msats::ZERO,
        }
    }

    pub fn available(&self) -> Msats {
        self.mcredits + self.msats
    }

    /// Debits up to `amount`, credits first, then earned sats, never below
    /// zero. Returns the entries actually taken, summing to
    /// `min(amount, available)`.
    pub fn debit(&mut self, amount: Msats) -> Vec<CustodialToken> {
        let mut taken = Vec::new();
        let mut remaining = amount;

        let from_credits = self.mcredits.min(remaining);
        if !from_credits.is_zero() {
            self.mcredits = self.mcredits.saturating_sub(from_credits);
            remaining = remaining.saturating_sub(from_credits);
            taken.push(CustodialToken {
                kind: TokenKind::Credits,
                amount: from_credits,
            });
        }

        let from_sats = self.msats.min(remaining);
        if !from_sats.is_zero() {
            self.msats = self.msats.saturating_sub(from_sats);
            taken.push(CustodialToken {
                kind: TokenKind::Sats,
                amount: from_sats,
            });
        }

        taken
    }

    /// Adds to the named balance; used for payouts and refunds.
    pub fn credit(&mut self, kind: TokenKind, amount: Msats) {
        match kind {
            TokenKind::Credits => self.mcredits += amount,
            TokenKind::Sats => self.msats += amount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(mcredits: u64, msats: u64) -> Account {
        Account {
            id: AccountId(1),
            mcredits: Msats(mcredits),
            msats: Msats(msats),
        }
    }

    #[test]
    fn test_debit_takes_credits_first() {
        let mut acct = account(500, 500);
        let taken = acct.debit(Msats(700));
        assert_eq!(
            taken,
            vec![
                CustodialToken {
                    kind: TokenKind::Credits,
                    amount: Msats(500)
                },
                CustodialToken {
                    kind: TokenKind::Sats,
                    amount: Msats(200)
                },
            ]
        );
        assert_eq!(acct.mcredits, Msats::ZERO);
        assert_eq!(acct.msats, Msats(300));
    }

    #[test]
    fn test_debit_never_overdraws() {
        let mut acct = account(100, 50);
        let taken = acct.debit(Msats(1000));
        let total: Msats = taken.iter().map(|t| t.amount).sum();
        assert_eq!(total, Msats(150));
        assert_eq!(acct.available(), Msats::ZERO);
    }

    #[test]
    fn test_debit_zero_takes_nothing() {
        let mut acct = account(100, 0);
        assert!(acct.debit(Msats::ZERO).is_empty());
        assert_eq!(acct.mcredits, Msats(100));
    }

    #[test]
    fn test_credit() {
        let mut acct = account(0, 0);
        acct.credit(TokenKind::Sats, Msats(42));
        acct.credit(TokenKind::Credits, Msats(8));
        assert_eq!(acct.msats, Msats(42));
        assert_eq!(acct.mcredits, Msats(8));
    }
}
