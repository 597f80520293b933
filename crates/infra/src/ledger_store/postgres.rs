//! Postgres-backed ledger store.
//!
//! Every ledger operation runs inside one read-committed transaction. The
//! row-level atomicity of conditional `UPDATE`s carries the concurrency
//! guarantees: the balance guard is `UPDATE ... WHERE balance >= $amount`,
//! lot consumption is `UPDATE ... WHERE remaining_credits >= $take`, and a
//! cache repair only lands if the row is still at the revision that was read.
//!
//! ## Error Mapping
//!
//! | SQLx error | SQLSTATE | StorageError | Scenario |
//! |------------|----------|--------------|----------|
//! | Database | `23505` | `UniqueViolation` | Duplicate key, payment session or allocation |
//! | Database | `22003` | `Overflow` | Balance or lot sum exceeds `BIGINT` |
//! | Database | Any other | `Database` | Check/FK violations, serialization failures |
//! | PoolClosed, Io, ... | N/A | `Database` | Connection problems |
//! | Column decode | N/A | `Decode` | Row does not map onto domain types |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use creditledger_core::{AccountId, LedgerEntryId};
use creditledger_credits::{
    Allocation, BalanceCache, CreditLot, EntryKind, GrantRefs, IdempotencyKey, LedgerEntry,
    LotAggregate, OperationRef,
};

use super::r#trait::{LedgerStore, LedgerTx, StorageError};

const SCHEMA: &str = include_str!("../../migrations/0001_credit_ledger.sql");

const ENTRY_COLUMNS: &str = r#"
    id,
    account_id,
    amount,
    kind,
    source,
    expires_at,
    remaining_credits,
    operation_type,
    operation_id,
    payment_session_id,
    promo_code,
    created_at
"#;

/// Postgres-backed ledger store.
///
/// `Send + Sync` and cheap to clone; all connections come from the shared pool.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the ledger schema (idempotent).
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        tracing::debug!("credit ledger schema applied");
        Ok(())
    }
}

#[async_trait::async_trait]
impl LedgerStore for PostgresLedgerStore {
    type Tx = PostgresLedgerTx;

    async fn begin(&self) -> Result<Self::Tx, StorageError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PostgresLedgerTx { tx })
    }
}

/// One open Postgres transaction.
pub struct PostgresLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl LedgerTx for PostgresLedgerTx {
    async fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO credit_ledger_entries (
                id,
                account_id,
                amount,
                kind,
                source,
                expires_at,
                remaining_credits,
                operation_type,
                operation_id,
                payment_session_id,
                promo_code,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.account_id.as_uuid())
        .bind(entry.amount)
        .bind(entry.kind.as_str())
        .bind(entry.source.as_str())
        .bind(entry.expires_at)
        .bind(entry.remaining_credits)
        .bind(entry.operation.as_ref().map(|o| o.operation_type.as_str()))
        .bind(entry.operation.as_ref().map(|o| o.operation_id.as_str()))
        .bind(entry.refs.payment_session_id.as_deref())
        .bind(entry.refs.promo_code.as_deref())
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_entry", e))?;

        Ok(())
    }

    async fn find_debit(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<LedgerEntry>, StorageError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM credit_ledger_entries
            WHERE account_id = $1
                AND kind = 'debit'
                AND operation_type = $2
                AND operation_id = $3
            "#
        ))
        .bind(key.account_id.as_uuid())
        .bind(&key.operation.operation_type)
        .bind(&key.operation.operation_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_debit", e))?;

        row.map(|r| decode_entry("find_debit", &r)).transpose()
    }

    async fn load_balance_cache(
        &mut self,
        account_id: AccountId,
    ) -> Result<Option<BalanceCache>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT account_id, balance, invalidate_at, revision
            FROM credit_balances
            WHERE account_id = $1
            "#,
        )
        .bind(account_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("load_balance_cache", e))?;

        row.map(|r| {
            BalanceCacheRow::from_row(&r)
                .map(BalanceCache::from)
                .map_err(|e| decode_error("load_balance_cache", e))
        })
        .transpose()
    }

    async fn store_balance_cache(
        &mut self,
        account_id: AccountId,
        aggregate: LotAggregate,
        expected_revision: Option<i64>,
    ) -> Result<bool, StorageError> {
        let result = match expected_revision {
            None => sqlx::query(
                r#"
                INSERT INTO credit_balances (account_id, balance, invalidate_at, revision)
                VALUES ($1, $2, $3, 0)
                ON CONFLICT (account_id) DO NOTHING
                "#,
            )
            .bind(account_id.as_uuid())
            .bind(aggregate.balance)
            .bind(aggregate.invalidate_at)
            .execute(&mut *self.tx)
            .await,
            Some(revision) => sqlx::query(
                r#"
                UPDATE credit_balances
                SET balance = $2,
                    invalidate_at = $3,
                    revision = revision + 1,
                    updated_at = NOW()
                WHERE account_id = $1 AND revision = $4
                "#,
            )
            .bind(account_id.as_uuid())
            .bind(aggregate.balance)
            .bind(aggregate.invalidate_at)
            .bind(revision)
            .execute(&mut *self.tx)
            .await,
        }
        .map_err(|e| map_sqlx_error("store_balance_cache", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn increment_balance(
        &mut self,
        account_id: AccountId,
        amount: i64,
        lot_expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        // LEAST ignores NULLs, so a non-expiring cache adopts the lot's expiry.
        sqlx::query(
            r#"
            INSERT INTO credit_balances (account_id, balance, invalidate_at, revision)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (account_id) DO UPDATE SET
                balance = credit_balances.balance + EXCLUDED.balance,
                invalidate_at = LEAST(credit_balances.invalidate_at, EXCLUDED.invalidate_at),
                revision = credit_balances.revision + 1,
                updated_at = NOW()
            "#,
        )
        .bind(account_id.as_uuid())
        .bind(amount)
        .bind(lot_expires_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("increment_balance", e))?;

        Ok(())
    }

    async fn reserve_balance(
        &mut self,
        account_id: AccountId,
        amount: i64,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE credit_balances
            SET balance = balance - $2,
                revision = revision + 1,
                updated_at = NOW()
            WHERE account_id = $1 AND balance >= $2
            "#,
        )
        .bind(account_id.as_uuid())
        .bind(amount)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("reserve_balance", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn aggregate_spendable(
        &mut self,
        account_id: AccountId,
        now: DateTime<Utc>,
    ) -> Result<LotAggregate, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(remaining_credits), 0)::BIGINT AS balance,
                MIN(expires_at) AS invalidate_at
            FROM credit_ledger_entries
            WHERE account_id = $1
                AND kind = 'credit'
                AND remaining_credits > 0
                AND (expires_at IS NULL OR expires_at > $2)
            "#,
        )
        .bind(account_id.as_uuid())
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("aggregate_spendable", e))?;

        Ok(LotAggregate {
            balance: row
                .try_get("balance")
                .map_err(|e| decode_error("aggregate_spendable", e))?,
            invalidate_at: row
                .try_get("invalidate_at")
                .map_err(|e| decode_error("aggregate_spendable", e))?,
        })
    }

    async fn next_spendable_lot(
        &mut self,
        account_id: AccountId,
        now: DateTime<Utc>,
    ) -> Result<Option<CreditLot>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, remaining_credits, expires_at, created_at
            FROM credit_ledger_entries
            WHERE account_id = $1
                AND kind = 'credit'
                AND remaining_credits > 0
                AND (expires_at IS NULL OR expires_at > $2)
            ORDER BY expires_at ASC NULLS LAST, created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(account_id.as_uuid())
        .bind(now)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("next_spendable_lot", e))?;

        row.map(|r| {
            CreditLotRow::from_row(&r)
                .map(CreditLot::from)
                .map_err(|e| decode_error("next_spendable_lot", e))
        })
        .transpose()
    }

    async fn consume_lot(
        &mut self,
        lot_id: LedgerEntryId,
        amount: i64,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE credit_ledger_entries
            SET remaining_credits = remaining_credits - $2
            WHERE id = $1 AND kind = 'credit' AND remaining_credits >= $2
            "#,
        )
        .bind(lot_id.as_uuid())
        .bind(amount)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("consume_lot", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_allocation(&mut self, allocation: &Allocation) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO credit_allocations (debit_entry_id, credit_entry_id, amount)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(allocation.debit_entry_id.as_uuid())
        .bind(allocation.credit_entry_id.as_uuid())
        .bind(allocation.amount)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_allocation", e))?;

        Ok(())
    }

    async fn list_entries(
        &mut self,
        account_id: AccountId,
        kind: Option<EntryKind>,
        offset: u64,
        limit: u32,
    ) -> Result<(Vec<LedgerEntry>, u64), StorageError> {
        let kind_param = kind.map(EntryKind::as_str);

        let total: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM credit_ledger_entries
            WHERE account_id = $1 AND ($2::text IS NULL OR kind = $2)
            "#,
        )
        .bind(account_id.as_uuid())
        .bind(kind_param)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("count_entries", e))?
        .try_get("total")
        .map_err(|e| decode_error("count_entries", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM credit_ledger_entries
            WHERE account_id = $1 AND ($2::text IS NULL OR kind = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(account_id.as_uuid())
        .bind(kind_param)
        .bind(i64::from(limit))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_entries", e))?;

        let entries = rows
            .iter()
            .map(|r| decode_entry("list_entries", r))
            .collect::<Result<Vec<_>, _>>()?;

        Ok((entries, total.max(0) as u64))
    }

    async fn sum_expiring(
        &mut self,
        account_id: AccountId,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        sqlx::query(
            r#"
            SELECT COALESCE(SUM(remaining_credits), 0)::BIGINT AS total
            FROM credit_ledger_entries
            WHERE account_id = $1
                AND kind = 'credit'
                AND remaining_credits > 0
                AND expires_at > $2
                AND expires_at <= $3
            "#,
        )
        .bind(account_id.as_uuid())
        .bind(from)
        .bind(until)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("sum_expiring", e))?
        .try_get("total")
        .map_err(|e| decode_error("sum_expiring", e))
    }

    async fn sum_debited(
        &mut self,
        account_id: AccountId,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        sqlx::query(
            r#"
            SELECT COALESCE(SUM(-amount), 0)::BIGINT AS total
            FROM credit_ledger_entries
            WHERE account_id = $1
                AND kind = 'debit'
                AND created_at >= $2
                AND created_at < $3
            "#,
        )
        .bind(account_id.as_uuid())
        .bind(from)
        .bind(until)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("sum_debited", e))?
        .try_get("total")
        .map_err(|e| decode_error("sum_debited", e))
    }

    async fn stale_accounts(
        &mut self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<AccountId>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT account_id
            FROM credit_balances
            WHERE invalidate_at <= $1
            ORDER BY invalidate_at ASC, account_id ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("stale_accounts", e))?;

        rows.iter()
            .map(|r| {
                r.try_get::<uuid::Uuid, _>("account_id")
                    .map(AccountId::from_uuid)
                    .map_err(|e| decode_error("stale_accounts", e))
            })
            .collect()
    }

    async fn delete_account(&mut self, account_id: AccountId) -> Result<u64, StorageError> {
        // Allocations reference entries, so they go first.
        sqlx::query(
            r#"
            DELETE FROM credit_allocations
            WHERE debit_entry_id IN (SELECT id FROM credit_ledger_entries WHERE account_id = $1)
               OR credit_entry_id IN (SELECT id FROM credit_ledger_entries WHERE account_id = $1)
            "#,
        )
        .bind(account_id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("delete_allocations", e))?;

        let deleted = sqlx::query("DELETE FROM credit_ledger_entries WHERE account_id = $1")
            .bind(account_id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_entries", e))?
            .rows_affected();

        sqlx::query("DELETE FROM credit_balances WHERE account_id = $1")
            .bind(account_id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_balance_cache", e))?;

        Ok(deleted)
    }

    async fn commit(self) -> Result<(), StorageError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StorageError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_transaction", e))
    }
}

/// Map SQLx errors to StorageError, keeping the violated constraint name.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some("23505") => {
                return StorageError::UniqueViolation {
                    operation,
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                    message: db_err.message().to_string(),
                };
            }
            Some("22003") => return StorageError::Overflow { operation },
            _ => {}
        }
    }
    StorageError::Database {
        operation,
        source: err,
    }
}

fn decode_error(operation: &'static str, err: impl core::fmt::Display) -> StorageError {
    StorageError::Decode {
        operation,
        message: err.to_string(),
    }
}

fn decode_entry(operation: &'static str, row: &PgRow) -> Result<LedgerEntry, StorageError> {
    let raw = LedgerEntryRow::from_row(row).map_err(|e| decode_error(operation, e))?;
    raw.into_entry().map_err(|e| decode_error(operation, e))
}

// SQLx row types

#[derive(Debug)]
struct LedgerEntryRow {
    id: uuid::Uuid,
    account_id: uuid::Uuid,
    amount: i64,
    kind: String,
    source: String,
    expires_at: Option<DateTime<Utc>>,
    remaining_credits: Option<i64>,
    operation_type: Option<String>,
    operation_id: Option<String>,
    payment_session_id: Option<String>,
    promo_code: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for LedgerEntryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(LedgerEntryRow {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            amount: row.try_get("amount")?,
            kind: row.try_get("kind")?,
            source: row.try_get("source")?,
            expires_at: row.try_get("expires_at")?,
            remaining_credits: row.try_get("remaining_credits")?,
            operation_type: row.try_get("operation_type")?,
            operation_id: row.try_get("operation_id")?,
            payment_session_id: row.try_get("payment_session_id")?,
            promo_code: row.try_get("promo_code")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl LedgerEntryRow {
    fn into_entry(self) -> Result<LedgerEntry, creditledger_core::DomainError> {
        let operation = match (self.operation_type, self.operation_id) {
            (Some(operation_type), Some(operation_id)) => Some(OperationRef {
                operation_type,
                operation_id,
            }),
            _ => None,
        };

        Ok(LedgerEntry {
            id: LedgerEntryId::from_uuid(self.id),
            account_id: AccountId::from_uuid(self.account_id),
            amount: self.amount,
            kind: self.kind.parse()?,
            source: self.source.parse()?,
            expires_at: self.expires_at,
            remaining_credits: self.remaining_credits,
            operation,
            refs: GrantRefs {
                payment_session_id: self.payment_session_id,
                promo_code: self.promo_code,
            },
            created_at: self.created_at,
        })
    }
}

#[derive(Debug)]
struct CreditLotRow {
    id: uuid::Uuid,
    remaining_credits: i64,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for CreditLotRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(CreditLotRow {
            id: row.try_get("id")?,
            remaining_credits: row.try_get("remaining_credits")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<CreditLotRow> for CreditLot {
    fn from(row: CreditLotRow) -> Self {
        CreditLot {
            id: LedgerEntryId::from_uuid(row.id),
            remaining_credits: row.remaining_credits,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug)]
struct BalanceCacheRow {
    account_id: uuid::Uuid,
    balance: i64,
    invalidate_at: Option<DateTime<Utc>>,
    revision: i64,
}

impl<'r> FromRow<'r, PgRow> for BalanceCacheRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(BalanceCacheRow {
            account_id: row.try_get("account_id")?,
            balance: row.try_get("balance")?,
            invalidate_at: row.try_get("invalidate_at")?,
            revision: row.try_get("revision")?,
        })
    }
}

impl From<BalanceCacheRow> for BalanceCache {
    fn from(row: BalanceCacheRow) -> Self {
        BalanceCache {
            account_id: AccountId::from_uuid(row.account_id),
            balance: row.balance,
            invalidate_at: row.invalidate_at,
            revision: row.revision,
        }
    }
}
