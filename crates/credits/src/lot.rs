//! Credit lots and first-expiring-first-consumed selection.

use core::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use creditledger_core::LedgerEntryId;

/// The spendable view of a credit ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditLot {
    pub id: LedgerEntryId,
    pub remaining_credits: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CreditLot {
    /// A lot is spendable while it has credits left and has not reached its expiry.
    pub fn is_spendable(&self, now: DateTime<Utc>) -> bool {
        self.remaining_credits > 0 && self.expires_at.is_none_or(|expires_at| expires_at > now)
    }

    /// How much of `wanted` this lot can cover.
    pub fn take(&self, wanted: i64) -> i64 {
        wanted.min(self.remaining_credits).max(0)
    }

    /// FIFO order: earliest expiry first, non-expiring lots last, then oldest grant.
    pub fn fifo_cmp(&self, other: &Self) -> Ordering {
        match (self.expires_at, other.expires_at) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| self.created_at.cmp(&other.created_at))
        .then_with(|| self.id.cmp(&other.id))
    }
}

/// Pick the lot the next slice of a debit must come from.
pub fn select_next_lot<'a, I>(lots: I, now: DateTime<Utc>) -> Option<&'a CreditLot>
where
    I: IntoIterator<Item = &'a CreditLot>,
{
    lots.into_iter()
        .filter(|lot| lot.is_spendable(now))
        .min_by(|a, b| a.fifo_cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn lot(remaining: i64, expires_in_days: Option<i64>, now: DateTime<Utc>) -> CreditLot {
        CreditLot {
            id: LedgerEntryId::new(),
            remaining_credits: remaining,
            expires_at: expires_in_days.map(|d| now + Duration::days(d)),
            created_at: now,
        }
    }

    #[test]
    fn earliest_expiry_is_selected_first() {
        let now = Utc::now();
        let later = lot(200, Some(60), now);
        let sooner = lot(300, Some(30), now);
        let lots = [later, sooner];

        assert_eq!(select_next_lot(&lots, now).unwrap().id, sooner.id);
    }

    #[test]
    fn non_expiring_lots_go_last() {
        let now = Utc::now();
        let forever = lot(10, None, now);
        let expiring = lot(10, Some(365), now);
        let lots = [forever, expiring];

        assert_eq!(select_next_lot(&lots, now).unwrap().id, expiring.id);
    }

    #[test]
    fn expired_and_empty_lots_are_skipped() {
        let now = Utc::now();
        let expired = lot(50, Some(-1), now);
        let empty = lot(0, Some(1), now);
        let at_boundary = CreditLot {
            expires_at: Some(now),
            ..lot(5, None, now)
        };
        let lots = [expired, empty, at_boundary];

        assert!(select_next_lot(&lots, now).is_none());
    }

    #[test]
    fn equal_expiry_prefers_oldest_grant() {
        let now = Utc::now();
        let expires_at = Some(now + Duration::days(10));
        let older = CreditLot {
            id: LedgerEntryId::new(),
            remaining_credits: 1,
            expires_at,
            created_at: now - Duration::hours(2),
        };
        let newer = CreditLot {
            created_at: now - Duration::hours(1),
            id: LedgerEntryId::new(),
            ..older
        };
        let lots = [newer, older];

        assert_eq!(select_next_lot(&lots, now).unwrap().id, older.id);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: the selected lot is spendable and no other spendable lot
        /// expires strictly earlier.
        #[test]
        fn selection_never_skips_an_earlier_expiry(
            specs in prop::collection::vec((0i64..500, prop::option::of(-30i64..365)), 0..12)
        ) {
            let now = Utc::now();
            let lots: Vec<CreditLot> = specs
                .iter()
                .map(|(remaining, days)| lot(*remaining, *days, now))
                .collect();

            match select_next_lot(&lots, now) {
                Some(chosen) => {
                    prop_assert!(chosen.is_spendable(now));
                    for other in lots.iter().filter(|l| l.is_spendable(now)) {
                        prop_assert_ne!(other.fifo_cmp(chosen), Ordering::Less);
                    }
                }
                None => prop_assert!(lots.iter().all(|l| !l.is_spendable(now))),
            }
        }

        /// Property: a lot never yields more than it holds or more than was asked.
        #[test]
        fn take_is_bounded(remaining in 0i64..10_000, wanted in 1i64..10_000) {
            let now = Utc::now();
            let taken = lot(remaining, Some(1), now).take(wanted);
            prop_assert!(taken <= remaining);
            prop_assert!(taken <= wanted);
            prop_assert!(taken >= 0);
        }
    }
}
