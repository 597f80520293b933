//! Credit ledger service.
//!
//! `CreditLedger` is the single entry point collaborators use to grant,
//! consume and inspect credits. It is an explicitly constructed value (store,
//! clock, settings); there is no process-wide ledger state.
//!
//! Every operation runs in exactly one storage transaction. The only
//! concurrency control is the conditional balance decrement performed by
//! [`LedgerTx::reserve_balance`]: as many debits succeed as the balance
//! covers, however many race.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use creditledger_core::{AccountId, Clock, LedgerEntryId, SystemClock};
use creditledger_credits::{
    Allocation, DebitReceipt, DebitRequest, GrantRequest, HistoryPage, HistoryQuery,
    HistorySummary, IdempotencyKey, IdempotentDebit, LedgerEntry, PageInfo,
    billing_month_bounds,
};

use crate::config::LedgerSettings;
use crate::ledger_store::{LedgerStore, LedgerTx, StorageError};

/// Ledger operation error.
///
/// `InsufficientCredits` is a business outcome (show a top-up flow);
/// `Storage` is an infrastructure failure (the caller decides whether to retry).
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient credits")]
    InsufficientCredits,

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// Multi-tenant credit ledger over a transactional store.
#[derive(Debug)]
pub struct CreditLedger<S, C = SystemClock> {
    store: S,
    clock: C,
    settings: LedgerSettings,
}

impl<S> CreditLedger<S, SystemClock>
where
    S: LedgerStore,
{
    pub fn new(store: S, settings: LedgerSettings) -> Self {
        Self::with_clock(store, SystemClock, settings)
    }
}

impl<S, C> CreditLedger<S, C>
where
    S: LedgerStore,
    C: Clock,
{
    pub fn with_clock(store: S, clock: C, settings: LedgerSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    /// Create a new credit lot and add it to the cached balance.
    ///
    /// Not idempotent: callers that must not grant twice rely on the unique
    /// payment session reference (or their own check).
    #[instrument(
        skip(self, request),
        fields(
            account_id = %request.account_id,
            amount = request.amount.get(),
            source = request.source.as_str()
        ),
        err
    )]
    pub async fn grant(&self, request: GrantRequest) -> Result<LedgerEntryId, LedgerError> {
        let entry = LedgerEntry::credit_lot(&request, self.clock.now());

        let mut tx = self.store.begin().await?;
        let result = grant_in_tx(&mut tx, &entry).await;
        finish(tx, result).await?;

        info!(entry_id = %entry.id, expires_at = %request.expires_at, "credits granted");
        Ok(entry.id)
    }

    /// Consume `amount` credits, first-expiring lot first.
    ///
    /// Either the debit row, every lot decrement and every allocation commit
    /// together, or nothing is written.
    #[instrument(
        skip(self, request),
        fields(
            account_id = %request.account_id,
            amount = request.amount.get(),
            operation_type = %request.operation.operation_type,
            operation_id = %request.operation.operation_id
        )
    )]
    pub async fn debit(&self, request: DebitRequest) -> Result<DebitReceipt, LedgerError> {
        let now = self.clock.now();

        let mut tx = self.store.begin().await?;
        let result = debit_in_tx(&mut tx, &request, now).await;
        let receipt = finish(tx, result).await?;

        info!(
            debit_entry_id = %receipt.debit_entry_id,
            lots = receipt.allocations.len(),
            "credits debited"
        );
        Ok(receipt)
    }

    /// Debit once per `(account, operation type, operation id)`.
    ///
    /// A repeated delivery, or a concurrent one that wins the race on the
    /// idempotency index, yields `debited: false` instead of an error. So
    /// does a concurrent delivery that drained the balance before this one
    /// reached the guard.
    #[instrument(
        skip(self, request),
        fields(
            account_id = %request.account_id,
            operation_type = %request.operation.operation_type,
            operation_id = %request.operation.operation_id
        )
    )]
    pub async fn debit_if_not_exists(
        &self,
        request: DebitRequest,
    ) -> Result<IdempotentDebit, LedgerError> {
        let key = request.idempotency_key();

        if let Some(entry) = self.find_debit(&key).await? {
            debug!(debit_entry_id = %entry.id, "operation already debited");
            return Ok(IdempotentDebit::already_charged());
        }

        match self.debit(request).await {
            Ok(receipt) => Ok(IdempotentDebit::charged(receipt)),
            Err(LedgerError::Storage(err)) if err.is_idempotency_conflict() => {
                debug!("concurrent delivery debited the operation first");
                Ok(IdempotentDebit::already_charged())
            }
            Err(LedgerError::InsufficientCredits) => match self.find_debit(&key).await? {
                Some(entry) => {
                    debug!(
                        debit_entry_id = %entry.id,
                        "concurrent delivery debited the operation and drained the balance"
                    );
                    Ok(IdempotentDebit::already_charged())
                }
                None => Err(LedgerError::InsufficientCredits),
            },
            Err(err) => Err(err),
        }
    }

    async fn find_debit(&self, key: &IdempotencyKey) -> Result<Option<LedgerEntry>, LedgerError> {
        let mut tx = self.store.begin().await?;
        let existing = tx.find_debit(key).await.map_err(LedgerError::from);
        finish(tx, existing).await
    }

    /// Spendable balance, served from the cache while it is fresh.
    #[instrument(skip(self), fields(account_id = %account_id), err)]
    pub async fn get_balance(&self, account_id: AccountId) -> Result<i64, LedgerError> {
        let now = self.clock.now();

        let mut tx = self.store.begin().await?;
        let result = current_balance(&mut tx, account_id, now)
            .await
            .map_err(LedgerError::from);
        finish(tx, result).await
    }

    /// Earliest expiry among the account's spendable lots.
    #[instrument(skip(self), fields(account_id = %account_id), err)]
    pub async fn get_next_expiry(
        &self,
        account_id: AccountId,
    ) -> Result<Option<DateTime<Utc>>, LedgerError> {
        let now = self.clock.now();

        let mut tx = self.store.begin().await?;
        let result = tx
            .aggregate_spendable(account_id, now)
            .await
            .map(|aggregate| aggregate.invalidate_at)
            .map_err(LedgerError::from);
        finish(tx, result).await
    }

    /// One page of ledger rows (newest first) with account-wide summary figures.
    #[instrument(skip(self, query), fields(account_id = %account_id, page = query.page), err)]
    pub async fn get_history(
        &self,
        account_id: AccountId,
        query: HistoryQuery,
    ) -> Result<HistoryPage, LedgerError> {
        let query = query.normalized(
            self.settings.history_default_limit,
            self.settings.history_max_limit,
        );
        let now = self.clock.now();

        let mut tx = self.store.begin().await?;
        let result = history_in_tx(&mut tx, account_id, &query, now, &self.settings).await;
        finish(tx, result).await
    }

    /// Delete every allocation, ledger row and the cache row of an account.
    ///
    /// Terminal and irreversible; on failure nothing is deleted and the whole
    /// call must be retried.
    #[instrument(skip(self), fields(account_id = %account_id), err)]
    pub async fn delete_all(&self, account_id: AccountId) -> Result<u64, LedgerError> {
        let mut tx = self.store.begin().await?;
        let result = tx.delete_account(account_id).await.map_err(LedgerError::from);
        let deleted = finish(tx, result).await?;

        info!(deleted, "credit ledger deleted for account");
        Ok(deleted)
    }

    /// Recompute up to `limit` balance caches whose `invalidate_at` has passed.
    ///
    /// Returns how many accounts were repaired. A failure on one account is
    /// logged and does not stop the sweep.
    #[instrument(skip(self), err)]
    pub async fn repair_stale_balances(&self, limit: u32) -> Result<usize, LedgerError> {
        let now = self.clock.now();

        let mut tx = self.store.begin().await?;
        let stale = tx.stale_accounts(now, limit).await.map_err(LedgerError::from);
        let stale = finish(tx, stale).await?;

        let mut repaired = 0;
        for account_id in stale {
            match self.get_balance(account_id).await {
                Ok(_) => repaired += 1,
                Err(err) => error!(account_id = %account_id, error = %err, "balance repair failed"),
            }
        }

        if repaired > 0 {
            info!(repaired, "stale balance caches repaired");
        }
        Ok(repaired)
    }
}

/// Commit on success, roll back on failure (keeping the original error).
async fn finish<T, X>(tx: X, result: Result<T, LedgerError>) -> Result<T, LedgerError>
where
    X: LedgerTx,
{
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                error!(error = %rollback_err, "transaction rollback failed");
            }
            Err(err)
        }
    }
}

async fn grant_in_tx<X>(tx: &mut X, entry: &LedgerEntry) -> Result<(), LedgerError>
where
    X: LedgerTx,
{
    tx.insert_entry(entry).await?;
    tx.increment_balance(entry.account_id, entry.amount, entry.expires_at)
        .await?;
    Ok(())
}

/// Cached balance if fresh; otherwise recompute from the lots and persist.
///
/// The write only lands if the cache row is still at the revision read here.
/// If something else wrote it in between, the row as it is now wins.
async fn current_balance<X>(
    tx: &mut X,
    account_id: AccountId,
    now: DateTime<Utc>,
) -> Result<i64, StorageError>
where
    X: LedgerTx,
{
    let cached = tx.load_balance_cache(account_id).await?;
    if let Some(cache) = cached.filter(|c| c.is_fresh(now)) {
        return Ok(cache.balance);
    }

    let aggregate = tx.aggregate_spendable(account_id, now).await?;
    let expected_revision = cached.map(|c| c.revision);

    if tx
        .store_balance_cache(account_id, aggregate, expected_revision)
        .await?
    {
        debug!(
            balance = aggregate.balance,
            invalidate_at = ?aggregate.invalidate_at,
            "balance cache recomputed"
        );
        return Ok(aggregate.balance);
    }

    debug!("balance cache changed concurrently; returning current row");
    let current = tx.load_balance_cache(account_id).await?;
    Ok(current.map_or(aggregate.balance, |c| c.balance))
}

async fn debit_in_tx<X>(
    tx: &mut X,
    request: &DebitRequest,
    now: DateTime<Utc>,
) -> Result<DebitReceipt, LedgerError>
where
    X: LedgerTx,
{
    let account_id = request.account_id;
    let amount = request.amount.get();

    // Balance guard: a stale cache may still count expired lots, so repair it
    // before the compare-and-swap.
    current_balance(tx, account_id, now).await?;
    if !tx.reserve_balance(account_id, amount).await? {
        warn!("insufficient credits");
        return Err(LedgerError::InsufficientCredits);
    }

    let debit_entry_id = LedgerEntryId::new();
    tx.insert_entry(&LedgerEntry::debit(debit_entry_id, request, now))
        .await?;

    let mut outstanding = amount;
    let mut allocations = Vec::new();
    while outstanding > 0 {
        let Some(lot) = tx.next_spendable_lot(account_id, now).await? else {
            warn!(outstanding, "balance guard passed but no spendable lot is left");
            return Err(LedgerError::InsufficientCredits);
        };

        let take = lot.take(outstanding);
        if !tx.consume_lot(lot.id, take).await? {
            warn!(lot_id = %lot.id, take, "credit lot changed while being consumed");
            return Err(LedgerError::InsufficientCredits);
        }

        let allocation = Allocation {
            debit_entry_id,
            credit_entry_id: lot.id,
            amount: take,
        };
        tx.insert_allocation(&allocation).await?;
        allocations.push(allocation);
        outstanding -= take;
    }

    Ok(DebitReceipt {
        debit_entry_id,
        allocations,
    })
}

async fn history_in_tx<X>(
    tx: &mut X,
    account_id: AccountId,
    query: &HistoryQuery,
    now: DateTime<Utc>,
    settings: &LedgerSettings,
) -> Result<HistoryPage, LedgerError>
where
    X: LedgerTx,
{
    let (entries, total_count) = tx
        .list_entries(account_id, query.kind, query.offset(), query.limit)
        .await?;

    let (month_start, month_end) = billing_month_bounds(now, settings.billing_offset);
    let summary = HistorySummary {
        balance: current_balance(tx, account_id, now).await?,
        expiring_soon: tx
            .sum_expiring(account_id, now, now + settings.expiry_warning)
            .await?,
        used_this_month: tx.sum_debited(account_id, month_start, month_end).await?,
    };

    Ok(HistoryPage {
        entries,
        summary,
        pagination: PageInfo::new(query, total_count),
    })
}
