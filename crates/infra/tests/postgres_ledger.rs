//! Black-box tests of the ledger against a real Postgres.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -p creditledger-infra -- --ignored`.
//! Every test works on fresh account ids, so a shared database is fine.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use creditledger_core::{AccountId, ManualClock};
use creditledger_credits::{
    CreditSource, Credits, DebitRequest, EntryKind, GrantRefs, GrantRequest, HistoryQuery,
    OperationRef,
};
use creditledger_infra::{CreditLedger, LedgerError, LedgerSettings, PostgresLedgerStore};
use sqlx::postgres::PgPoolOptions;

struct TestDb {
    store: PostgresLedgerStore,
}

impl TestDb {
    async fn connect() -> Self {
        let database_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for Postgres tests");
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(&database_url)
            .await
            .expect("failed to connect to Postgres");

        let store = PostgresLedgerStore::new(pool);
        store.migrate().await.expect("failed to apply schema");
        Self { store }
    }

    fn ledger(&self, clock: ManualClock) -> CreditLedger<PostgresLedgerStore, ManualClock> {
        CreditLedger::with_clock(self.store.clone(), clock, LedgerSettings::default())
    }
}

fn grant_request(account_id: AccountId, amount: i64, expires_at: DateTime<Utc>) -> GrantRequest {
    GrantRequest {
        account_id,
        amount: Credits::new(amount).unwrap(),
        source: CreditSource::Purchase,
        expires_at,
        refs: GrantRefs::default(),
    }
}

fn debit_request(account_id: AccountId, amount: i64, operation_id: &str) -> DebitRequest {
    DebitRequest {
        account_id,
        amount: Credits::new(amount).unwrap(),
        operation: OperationRef::new("image_upload", operation_id),
        source: CreditSource::Upload,
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn fifo_debit_and_balance() {
    let db = TestDb::connect().await;
    let now = Utc::now();
    let ledger = db.ledger(ManualClock::new(now));
    let account_id = AccountId::new();

    let later = ledger
        .grant(grant_request(account_id, 200, now + Duration::days(60)))
        .await
        .unwrap();
    let sooner = ledger
        .grant(grant_request(account_id, 300, now + Duration::days(30)))
        .await
        .unwrap();

    let receipt = ledger.debit(debit_request(account_id, 400, "photo-1")).await.unwrap();

    let drawn: Vec<_> = receipt
        .allocations
        .iter()
        .map(|a| (a.credit_entry_id, a.amount))
        .collect();
    assert_eq!(drawn, vec![(sooner, 300), (later, 100)]);
    assert_eq!(ledger.get_balance(account_id).await.unwrap(), 100);
    assert_eq!(
        ledger.get_next_expiry(account_id).await.unwrap().map(|at| at.timestamp()),
        Some((now + Duration::days(60)).timestamp())
    );

    ledger.delete_all(account_id).await.unwrap();
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn insufficient_credits_rolls_back() {
    let db = TestDb::connect().await;
    let now = Utc::now();
    let ledger = db.ledger(ManualClock::new(now));
    let account_id = AccountId::new();
    ledger
        .grant(grant_request(account_id, 100, now + Duration::days(30)))
        .await
        .unwrap();

    let err = ledger
        .debit(debit_request(account_id, 150, "photo-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientCredits));

    let history = ledger
        .get_history(account_id, HistoryQuery::new(1, 10, None))
        .await
        .unwrap();
    assert_eq!(history.pagination.total_count, 1);
    assert_eq!(history.summary.balance, 100);

    ledger.delete_all(account_id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "requires DATABASE_URL"]
async fn concurrent_debits_never_overdraw() {
    let db = TestDb::connect().await;
    let now = Utc::now();
    let ledger = Arc::new(db.ledger(ManualClock::new(now)));
    let account_id = AccountId::new();
    ledger
        .grant(grant_request(account_id, 60, now + Duration::days(30)))
        .await
        .unwrap();
    ledger
        .grant(grant_request(account_id, 40, now + Duration::days(40)))
        .await
        .unwrap();

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .debit(debit_request(account_id, 30, &format!("photo-{i}")))
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(receipt) => {
                assert_eq!(receipt.total_allocated(), 30);
                succeeded += 1;
            }
            Err(LedgerError::InsufficientCredits) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(succeeded, 3);
    assert_eq!(ledger.get_balance(account_id).await.unwrap(), 10);

    ledger.delete_all(account_id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "requires DATABASE_URL"]
async fn concurrent_deliveries_charge_once() {
    let db = TestDb::connect().await;
    let now = Utc::now();
    let ledger = Arc::new(db.ledger(ManualClock::new(now)));
    let account_id = AccountId::new();
    ledger
        .grant(grant_request(account_id, 100, now + Duration::days(30)))
        .await
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .debit_if_not_exists(debit_request(account_id, 5, "line-42"))
                    .await
            })
        })
        .collect();

    let mut debited = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().debited {
            debited += 1;
        }
    }

    assert_eq!(debited, 1);
    assert_eq!(ledger.get_balance(account_id).await.unwrap(), 95);

    ledger.delete_all(account_id).await.unwrap();
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn expiry_invalidates_cache_and_sweep_repairs_it() {
    let db = TestDb::connect().await;
    let now = Utc::now();
    let clock = ManualClock::new(now);
    let ledger = db.ledger(clock.clone());
    let account_id = AccountId::new();
    ledger
        .grant(grant_request(account_id, 100, now + Duration::days(1)))
        .await
        .unwrap();
    ledger
        .grant(grant_request(account_id, 25, now + Duration::days(90)))
        .await
        .unwrap();

    clock.advance(Duration::days(2));

    // Other tests may leave stale rows behind; only require that ours is repaired.
    ledger.repair_stale_balances(10_000).await.unwrap();
    assert_eq!(ledger.get_balance(account_id).await.unwrap(), 25);

    let err = ledger
        .debit(debit_request(account_id, 30, "photo-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientCredits));

    ledger.delete_all(account_id).await.unwrap();
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn history_and_delete_all() {
    let db = TestDb::connect().await;
    let now = Utc::now();
    let clock = ManualClock::new(now);
    let ledger = db.ledger(clock.clone());
    let account_id = AccountId::new();
    ledger
        .grant(grant_request(account_id, 50, now + Duration::days(10)))
        .await
        .unwrap();
    for i in 0..3 {
        clock.advance(Duration::seconds(1));
        ledger
            .debit(debit_request(account_id, 5, &format!("photo-{i}")))
            .await
            .unwrap();
    }

    let debits = ledger
        .get_history(account_id, HistoryQuery::new(1, 2, Some(EntryKind::Debit)))
        .await
        .unwrap();
    assert_eq!(debits.entries.len(), 2);
    assert_eq!(debits.pagination.total_count, 3);
    assert!(debits.pagination.has_next_page);
    assert!(debits.entries[0].created_at > debits.entries[1].created_at);
    assert_eq!(debits.summary.balance, 35);
    assert_eq!(debits.summary.expiring_soon, 35);

    assert_eq!(ledger.delete_all(account_id).await.unwrap(), 4);
    let empty = ledger
        .get_history(account_id, HistoryQuery::new(1, 10, None))
        .await
        .unwrap();
    assert!(empty.entries.is_empty());
}
