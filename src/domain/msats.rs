use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// An amount of millisatoshis.
///
/// All value in the system is integer millisatoshis, never fractional.
/// Subtraction is only exposed through checked/saturating helpers so that
/// ledger code can't silently underflow.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Msats(pub u64);

impl Msats {
    pub const ZERO: Self = Self(0);

    pub fn new(msats: u64) -> Self {
        Self(msats)
    }

    /// Whole satoshis, truncating the sub-satoshi remainder.
    pub fn sats(self) -> u64 {
        self.0 / 1000
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    pub fn min(self, rhs: Self) -> Self {
        Self(self.0.min(rhs.0))
    }

    /// `ceil(self * num / den)` in integer arithmetic, used for the service
    /// markup and routing-fee padding multipliers.
    pub fn ceil_mul(self, num: u64, den: u64) -> Self {
        debug_assert!(den > 0);
        Self((self.0 * num).div_ceil(den))
    }
}

impl Add for Msats {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Msats {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sum for Msats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, m| acc + m)
    }
}

impl fmt::Display for Msats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}msat", self.0)
    }
}

/// The two custodial balance kinds an account holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenKind {
    /// Pre-purchased credits, spent before earned value.
    Credits,
    /// Earned value, withdrawable over the payment network.
    Sats,
}
