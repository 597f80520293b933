use chrono::{DateTime, Utc};
use thiserror::Error;

use creditledger_core::{AccountId, LedgerEntryId};
use creditledger_credits::{
    Allocation, BalanceCache, CreditLot, EntryKind, IdempotencyKey, LedgerEntry, LotAggregate,
};

/// Name of the unique index over `(account_id, operation_type, operation_id)` for debits.
///
/// Backends report a collision on it as a [`StorageError::UniqueViolation`]
/// carrying this constraint name.
pub const IDEMPOTENCY_KEY_CONSTRAINT: &str = "credit_ledger_entries_operation_key";

/// Name of the unique index over grant payment session ids.
pub const PAYMENT_SESSION_CONSTRAINT: &str = "credit_ledger_entries_payment_session";

/// Ledger storage failure.
///
/// These are **infrastructure errors**; the expected "not enough credits"
/// outcome is never expressed through this type.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unique constraint '{constraint}' violated in {operation}: {message}")]
    UniqueViolation {
        operation: &'static str,
        constraint: String,
        message: String,
    },

    #[error("database error in {operation}: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to decode row in {operation}: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },

    /// A credit total no longer fits in a signed 64-bit integer.
    #[error("credit total out of range in {operation}")]
    Overflow { operation: &'static str },
}

impl StorageError {
    /// True when a debit with the same idempotency key already exists.
    pub fn is_idempotency_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::UniqueViolation { constraint, .. }
                if constraint == IDEMPOTENCY_KEY_CONSTRAINT
        )
    }
}

/// Transactional ledger storage.
///
/// A backend only has to open transactions; all ledger reads and writes go
/// through the [`LedgerTx`] it hands out.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    type Tx: LedgerTx;

    /// Start a transaction (read-committed or stronger).
    async fn begin(&self) -> Result<Self::Tx, StorageError>;
}

/// One open ledger transaction.
///
/// Nothing written through a transaction is visible to others until
/// [`commit`](LedgerTx::commit). Dropping a transaction without committing
/// discards its writes.
#[async_trait::async_trait]
pub trait LedgerTx: Send {
    /// Insert a credit lot or debit row.
    async fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<(), StorageError>;

    /// Look up the debit row for an idempotency key.
    async fn find_debit(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<LedgerEntry>, StorageError>;

    async fn load_balance_cache(
        &mut self,
        account_id: AccountId,
    ) -> Result<Option<BalanceCache>, StorageError>;

    /// Persist a recomputed cache only if the row is still at `expected_revision`
    /// (`None`: only if no row exists yet). Returns whether the write happened.
    async fn store_balance_cache(
        &mut self,
        account_id: AccountId,
        aggregate: LotAggregate,
        expected_revision: Option<i64>,
    ) -> Result<bool, StorageError>;

    /// Add a freshly granted lot to the cached balance, creating the row if needed.
    ///
    /// `invalidate_at` becomes the earlier of its current value and `lot_expires_at`.
    async fn increment_balance(
        &mut self,
        account_id: AccountId,
        amount: i64,
        lot_expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError>;

    /// Conditionally subtract `amount` from the cached balance, only if
    /// `balance >= amount`. Returns whether the row was updated.
    async fn reserve_balance(
        &mut self,
        account_id: AccountId,
        amount: i64,
    ) -> Result<bool, StorageError>;

    /// Sum and earliest expiry over the account's spendable lots.
    async fn aggregate_spendable(
        &mut self,
        account_id: AccountId,
        now: DateTime<Utc>,
    ) -> Result<LotAggregate, StorageError>;

    /// The spendable lot a debit must draw from next (FIFO by expiry).
    async fn next_spendable_lot(
        &mut self,
        account_id: AccountId,
        now: DateTime<Utc>,
    ) -> Result<Option<CreditLot>, StorageError>;

    /// Decrement a lot's `remaining_credits`, only if it still holds `amount`.
    /// Returns whether the lot was updated.
    async fn consume_lot(
        &mut self,
        lot_id: LedgerEntryId,
        amount: i64,
    ) -> Result<bool, StorageError>;

    async fn insert_allocation(&mut self, allocation: &Allocation) -> Result<(), StorageError>;

    /// One page of entries, newest first, plus the total matching count.
    async fn list_entries(
        &mut self,
        account_id: AccountId,
        kind: Option<EntryKind>,
        offset: u64,
        limit: u32,
    ) -> Result<(Vec<LedgerEntry>, u64), StorageError>;

    /// Unconsumed credits in lots expiring within `(from, until]`.
    async fn sum_expiring(
        &mut self,
        account_id: AccountId,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<i64, StorageError>;

    /// Total debited (as a positive number) for rows created within `[from, until)`.
    async fn sum_debited(
        &mut self,
        account_id: AccountId,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<i64, StorageError>;

    /// Accounts whose cache went stale at or before `now`, oldest first.
    async fn stale_accounts(
        &mut self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<AccountId>, StorageError>;

    /// Remove allocations, entries and the cache row of an account.
    /// Returns the number of ledger entries deleted.
    async fn delete_account(&mut self, account_id: AccountId) -> Result<u64, StorageError>;

    async fn commit(self) -> Result<(), StorageError>;

    async fn rollback(self) -> Result<(), StorageError>;
}
