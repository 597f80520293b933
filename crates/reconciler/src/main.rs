//! Background balance reconciler.
//!
//! Periodically recomputes balance caches whose `invalidate_at` has passed, so
//! accounts whose credits expired while idle show the right figures before
//! anyone reads them. Reads stay correct without it; this only moves the
//! recomputation off the request path.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use creditledger_core::Clock;
use creditledger_infra::{CreditLedger, LedgerConfig, LedgerStore, PostgresLedgerStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    creditledger_observability::init();

    let config = LedgerConfig::from_env().context("invalid ledger configuration")?;
    let settings = config.settings().context("invalid ledger configuration")?;
    let database_url = config.require_database_url()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresLedgerStore::new(pool);
    store.migrate().await.context("failed to apply ledger schema")?;

    let ledger = CreditLedger::new(store, settings);
    let interval = Duration::from_secs(config.reconcile_interval_secs.max(1));

    info!(
        interval_secs = interval.as_secs(),
        batch_size = config.reconcile_batch_size,
        "balance reconciler started"
    );

    let batch_size = config.reconcile_batch_size;
    let repaired = reconcile_until(&ledger, interval, batch_size, shutdown_signal()).await;

    info!(repaired, "balance reconciler stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// Sweep stale caches every `interval` until `shutdown` resolves.
///
/// A sweep that fills a whole batch is followed immediately by another one.
/// Returns the total number of repaired accounts.
async fn reconcile_until<S, C, F>(
    ledger: &CreditLedger<S, C>,
    interval: Duration,
    batch_size: u32,
    shutdown: F,
) -> usize
where
    S: LedgerStore,
    C: Clock,
    F: Future<Output = ()>,
{
    let batch_size = batch_size.max(1);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let mut total = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                total += sweep(ledger, batch_size).await;
            }
        }
    }
    total
}

async fn sweep<S, C>(ledger: &CreditLedger<S, C>, batch_size: u32) -> usize
where
    S: LedgerStore,
    C: Clock,
{
    let mut repaired = 0;
    loop {
        match ledger.repair_stale_balances(batch_size).await {
            Ok(n) => {
                repaired += n;
                if n < batch_size as usize {
                    return repaired;
                }
            }
            Err(err) => {
                error!(error = %err, "reconcile sweep failed");
                return repaired;
            }
        }
    }
}
