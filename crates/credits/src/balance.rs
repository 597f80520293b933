//! Denormalized per-account balance and the aggregate it is repaired from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use creditledger_core::AccountId;

use crate::lot::CreditLot;

/// Cached spendable balance of one account.
///
/// `invalidate_at` is the earliest expiry among the lots that made up
/// `balance`; once it passes the snapshot may count expired credits and must
/// be recomputed before it is trusted. `revision` increases on every write and
/// is what conditional cache writes compare against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceCache {
    pub account_id: AccountId,
    pub balance: i64,
    pub invalidate_at: Option<DateTime<Utc>>,
    pub revision: i64,
}

impl BalanceCache {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.invalidate_at.is_none_or(|at| at > now)
    }
}

/// Authoritative figures recomputed from the lot table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotAggregate {
    /// Sum of `remaining_credits` over spendable lots.
    pub balance: i64,
    /// Earliest expiry among those lots (`None` when none of them expire).
    pub invalidate_at: Option<DateTime<Utc>>,
}

impl LotAggregate {
    /// Aggregate the spendable lots, or `None` if their sum overflows `i64`.
    pub fn from_lots<'a, I>(lots: I, now: DateTime<Utc>) -> Option<Self>
    where
        I: IntoIterator<Item = &'a CreditLot>,
    {
        lots.into_iter()
            .filter(|lot| lot.is_spendable(now))
            .try_fold(Self::default(), |acc, lot| {
                Some(Self {
                    balance: acc.balance.checked_add(lot.remaining_credits)?,
                    invalidate_at: match (acc.invalidate_at, lot.expires_at) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    },
                })
            })
    }
}
