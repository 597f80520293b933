use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use creditledger_core::{AccountId, LedgerEntryId};
use creditledger_credits::{
    Allocation, BalanceCache, CreditLot, EntryKind, IdempotencyKey, LedgerEntry, LotAggregate,
    select_next_lot,
};

use super::r#trait::{
    IDEMPOTENCY_KEY_CONSTRAINT, LedgerStore, LedgerTx, PAYMENT_SESSION_CONSTRAINT, StorageError,
};

#[derive(Debug, Clone, Default)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    allocations: Vec<Allocation>,
    balances: HashMap<AccountId, BalanceCache>,
}

impl LedgerState {
    fn lots(&self, account_id: AccountId) -> Vec<CreditLot> {
        self.entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .filter_map(LedgerEntry::as_lot)
            .collect()
    }

    fn entry_ids(&self, account_id: AccountId) -> Vec<LedgerEntryId> {
        self.entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .map(|e| e.id)
            .collect()
    }
}

/// In-memory ledger store.
///
/// Intended for tests/dev. Transactions are fully serialized: `begin` takes
/// an async mutex and works on a staged copy that `commit` publishes. Clones
/// share the same underlying ledger.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<LedgerState>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows of an account, in insertion order.
    pub async fn entries(&self, account_id: AccountId) -> Vec<LedgerEntry> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect()
    }

    pub async fn entry(&self, id: LedgerEntryId) -> Option<LedgerEntry> {
        let state = self.state.lock().await;
        state.entries.iter().find(|e| e.id == id).cloned()
    }

    pub async fn allocations(&self) -> Vec<Allocation> {
        self.state.lock().await.allocations.clone()
    }

    pub async fn balance_cache(&self, account_id: AccountId) -> Option<BalanceCache> {
        self.state.lock().await.balances.get(&account_id).copied()
    }

    /// Overwrite a cache row, bypassing the ledger.
    ///
    /// Only for simulating accounting drift in tests.
    pub async fn force_balance_cache(&self, cache: BalanceCache) {
        self.state.lock().await.balances.insert(cache.account_id, cache);
    }
}

#[async_trait::async_trait]
impl LedgerStore for InMemoryLedgerStore {
    type Tx = InMemoryLedgerTx;

    async fn begin(&self) -> Result<Self::Tx, StorageError> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(InMemoryLedgerTx { guard, staged })
    }
}

/// Transaction over [`InMemoryLedgerStore`]; holds the store lock until dropped.
pub struct InMemoryLedgerTx {
    guard: OwnedMutexGuard<LedgerState>,
    staged: LedgerState,
}

fn unique_violation(operation: &'static str, constraint: &str) -> StorageError {
    StorageError::UniqueViolation {
        operation,
        constraint: constraint.to_string(),
        message: "duplicate key value".to_string(),
    }
}

#[async_trait::async_trait]
impl LedgerTx for InMemoryLedgerTx {
    async fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<(), StorageError> {
        let key = entry.idempotency_key();
        for existing in &self.staged.entries {
            if existing.id == entry.id {
                return Err(unique_violation("insert_entry", "credit_ledger_entries_pkey"));
            }
            if key.is_some() && existing.idempotency_key() == key {
                return Err(unique_violation("insert_entry", IDEMPOTENCY_KEY_CONSTRAINT));
            }
            if entry.refs.payment_session_id.is_some()
                && existing.refs.payment_session_id == entry.refs.payment_session_id
            {
                return Err(unique_violation("insert_entry", PAYMENT_SESSION_CONSTRAINT));
            }
        }

        self.staged.entries.push(entry.clone());
        Ok(())
    }

    async fn find_debit(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<LedgerEntry>, StorageError> {
        Ok(self
            .staged
            .entries
            .iter()
            .find(|e| e.idempotency_key().as_ref() == Some(key))
            .cloned())
    }

    async fn load_balance_cache(
        &mut self,
        account_id: AccountId,
    ) -> Result<Option<BalanceCache>, StorageError> {
        Ok(self.staged.balances.get(&account_id).copied())
    }

    async fn store_balance_cache(
        &mut self,
        account_id: AccountId,
        aggregate: LotAggregate,
        expected_revision: Option<i64>,
    ) -> Result<bool, StorageError> {
        let current = self.staged.balances.get(&account_id).map(|c| c.revision);
        if current != expected_revision {
            return Ok(false);
        }

        self.staged.balances.insert(
            account_id,
            BalanceCache {
                account_id,
                balance: aggregate.balance,
                invalidate_at: aggregate.invalidate_at,
                revision: current.map_or(0, |r| r + 1),
            },
        );
        Ok(true)
    }

    async fn increment_balance(
        &mut self,
        account_id: AccountId,
        amount: i64,
        lot_expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let balance = match self.staged.balances.get_mut(&account_id) {
            Some(cache) => {
                cache.balance = cache
                    .balance
                    .checked_add(amount)
                    .ok_or(StorageError::Overflow { operation: "increment_balance" })?;
                cache.invalidate_at = match (cache.invalidate_at, lot_expires_at) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                cache.revision += 1;
                cache.balance
            }
            None => {
                self.staged.balances.insert(
                    account_id,
                    BalanceCache {
                        account_id,
                        balance: amount,
                        invalidate_at: lot_expires_at,
                        revision: 0,
                    },
                );
                amount
            }
        };
        tracing::trace!(balance, "cached balance incremented");
        Ok(())
    }

    async fn reserve_balance(
        &mut self,
        account_id: AccountId,
        amount: i64,
    ) -> Result<bool, StorageError> {
        match self.staged.balances.get_mut(&account_id) {
            Some(cache) if cache.balance >= amount => {
                cache.balance -= amount;
                cache.revision += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn aggregate_spendable(
        &mut self,
        account_id: AccountId,
        now: DateTime<Utc>,
    ) -> Result<LotAggregate, StorageError> {
        let lots = self.staged.lots(account_id);
        LotAggregate::from_lots(&lots, now).ok_or(StorageError::Overflow {
            operation: "aggregate_spendable",
        })
    }

    async fn next_spendable_lot(
        &mut self,
        account_id: AccountId,
        now: DateTime<Utc>,
    ) -> Result<Option<CreditLot>, StorageError> {
        let lots = self.staged.lots(account_id);
        Ok(select_next_lot(&lots, now).copied())
    }

    async fn consume_lot(
        &mut self,
        lot_id: LedgerEntryId,
        amount: i64,
    ) -> Result<bool, StorageError> {
        let lot = self
            .staged
            .entries
            .iter_mut()
            .find(|e| e.id == lot_id && e.kind == EntryKind::Credit);

        match lot {
            Some(entry) => match entry.remaining_credits {
                Some(remaining) if remaining >= amount => {
                    entry.remaining_credits = Some(remaining - amount);
                    Ok(true)
                }
                _ => Ok(false),
            },
            None => Ok(false),
        }
    }

    async fn insert_allocation(&mut self, allocation: &Allocation) -> Result<(), StorageError> {
        let duplicate = self.staged.allocations.iter().any(|a| {
            a.debit_entry_id == allocation.debit_entry_id
                && a.credit_entry_id == allocation.credit_entry_id
        });
        if duplicate {
            return Err(unique_violation("insert_allocation", "credit_allocations_pkey"));
        }

        self.staged.allocations.push(*allocation);
        Ok(())
    }

    async fn list_entries(
        &mut self,
        account_id: AccountId,
        kind: Option<EntryKind>,
        offset: u64,
        limit: u32,
    ) -> Result<(Vec<LedgerEntry>, u64), StorageError> {
        let mut matching: Vec<&LedgerEntry> = self
            .staged
            .entries
            .iter()
            .filter(|e| e.account_id == account_id && kind.is_none_or(|k| e.kind == k))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn sum_expiring(
        &mut self,
        account_id: AccountId,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        self.staged
            .lots(account_id)
            .iter()
            .filter(|lot| lot.expires_at.is_some_and(|at| at > from && at <= until))
            .try_fold(0i64, |acc, lot| acc.checked_add(lot.remaining_credits))
            .ok_or(StorageError::Overflow { operation: "sum_expiring" })
    }

    async fn sum_debited(
        &mut self,
        account_id: AccountId,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        self.staged
            .entries
            .iter()
            .filter(|e| e.account_id == account_id && e.kind == EntryKind::Debit)
            .filter(|e| e.created_at >= from && e.created_at < until)
            .try_fold(0i64, |acc, e| acc.checked_add(e.amount.abs()))
            .ok_or(StorageError::Overflow { operation: "sum_debited" })
    }

    async fn stale_accounts(
        &mut self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<AccountId>, StorageError> {
        let mut stale: Vec<&BalanceCache> = self
            .staged
            .balances
            .values()
            .filter(|c| c.invalidate_at.is_some_and(|at| at <= now))
            .collect();
        stale.sort_by_key(|c| (c.invalidate_at, c.account_id));

        Ok(stale
            .into_iter()
            .take(limit as usize)
            .map(|c| c.account_id)
            .collect())
    }

    async fn delete_account(&mut self, account_id: AccountId) -> Result<u64, StorageError> {
        let ids = self.staged.entry_ids(account_id);

        self.staged.allocations.retain(|a| {
            !ids.contains(&a.debit_entry_id) && !ids.contains(&a.credit_entry_id)
        });
        self.staged.entries.retain(|e| e.account_id != account_id);
        self.staged.balances.remove(&account_id);

        Ok(ids.len() as u64)
    }

    async fn commit(self) -> Result<(), StorageError> {
        let Self { mut guard, staged } = self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use creditledger_credits::{Credits, CreditSource, GrantRefs, GrantRequest};

    fn lot_entry(account_id: AccountId, amount: i64, expires_at: DateTime<Utc>) -> LedgerEntry {
        let request = GrantRequest {
            account_id,
            amount: Credits::new(amount).unwrap(),
            source: CreditSource::Purchase,
            expires_at,
            refs: GrantRefs::default(),
        };
        LedgerEntry::credit_lot(&request, Utc::now())
    }

    #[tokio::test]
    async fn uncommitted_writes_are_discarded() {
        let store = InMemoryLedgerStore::new();
        let account_id = AccountId::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_entry(&lot_entry(account_id, 10, Utc::now() + Duration::days(1)))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(store.entries(account_id).await.is_empty());
    }

    #[tokio::test]
    async fn conditional_cache_write_loses_against_newer_revision() {
        let store = InMemoryLedgerStore::new();
        let account_id = AccountId::new();
        let expires_at = Utc::now() + Duration::days(1);

        let mut tx = store.begin().await.unwrap();
        tx.increment_balance(account_id, 10, Some(expires_at)).await.unwrap();
        let seen = tx.load_balance_cache(account_id).await.unwrap().unwrap();
        assert!(tx.reserve_balance(account_id, 3).await.unwrap());

        let aggregate = LotAggregate {
            balance: 10,
            invalidate_at: Some(expires_at),
        };
        let written = tx
            .store_balance_cache(account_id, aggregate, Some(seen.revision))
            .await
            .unwrap();
        assert!(!written);
        assert_eq!(tx.load_balance_cache(account_id).await.unwrap().unwrap().balance, 7);

        let missing = AccountId::new();
        assert!(tx.store_balance_cache(missing, aggregate, None).await.unwrap());
        assert!(!tx.store_balance_cache(missing, aggregate, None).await.unwrap());
    }

    #[tokio::test]
    async fn reserve_never_overdraws() {
        let store = InMemoryLedgerStore::new();
        let account_id = AccountId::new();

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.reserve_balance(account_id, 1).await.unwrap());
        tx.increment_balance(account_id, 5, None).await.unwrap();
        assert!(!tx.reserve_balance(account_id, 6).await.unwrap());
        assert!(tx.reserve_balance(account_id, 5).await.unwrap());
        tx.commit().await.unwrap();

        assert_eq!(store.balance_cache(account_id).await.unwrap().balance, 0);
    }

    #[tokio::test]
    async fn increment_past_i64_max_is_rejected() {
        let store = InMemoryLedgerStore::new();
        let account_id = AccountId::new();
        let expires_at = Utc::now() + Duration::days(1);

        let mut tx = store.begin().await.unwrap();
        tx.increment_balance(account_id, i64::MAX, None).await.unwrap();
        let err = tx
            .increment_balance(account_id, 1, Some(expires_at))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Overflow { operation: "increment_balance" }));

        let cache = tx.load_balance_cache(account_id).await.unwrap().unwrap();
        assert_eq!(cache.balance, i64::MAX);
        assert_eq!(cache.invalidate_at, None);
    }

    #[tokio::test]
    async fn aggregate_past_i64_max_is_rejected() {
        let store = InMemoryLedgerStore::new();
        let account_id = AccountId::new();
        let expires_at = Utc::now() + Duration::days(1);

        let mut tx = store.begin().await.unwrap();
        tx.insert_entry(&lot_entry(account_id, i64::MAX, expires_at)).await.unwrap();
        tx.insert_entry(&lot_entry(account_id, 1, expires_at)).await.unwrap();

        let err = tx.aggregate_spendable(account_id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StorageError::Overflow { operation: "aggregate_spendable" }));
        let err = tx
            .sum_expiring(account_id, Utc::now(), expires_at)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Overflow { operation: "sum_expiring" }));
    }

    #[tokio::test]
    async fn duplicate_payment_session_is_rejected() {
        let store = InMemoryLedgerStore::new();
        let account_id = AccountId::new();
        let expires_at = Utc::now() + Duration::days(30);

        let mut first = lot_entry(account_id, 10, expires_at);
        first.refs = GrantRefs::payment_session("cs_1");
        let mut second = lot_entry(account_id, 10, expires_at);
        second.refs = GrantRefs::payment_session("cs_1");

        let mut tx = store.begin().await.unwrap();
        tx.insert_entry(&first).await.unwrap();
        let err = tx.insert_entry(&second).await.unwrap_err();

        match err {
            StorageError::UniqueViolation { constraint, .. } => {
                assert_eq!(constraint, PAYMENT_SESSION_CONSTRAINT)
            }
            other => panic!("expected unique violation, got {other:?}"),
        }
    }
}
