//! Infrastructure layer: ledger storage backends, configuration and the
//! credit ledger service built on top of them.

pub mod config;
pub mod ledger;
pub mod ledger_store;


pub use config::{ConfigError, LedgerConfig, LedgerSettings};
pub use ledger::{CreditLedger, LedgerError};
pub use ledger_store::{
    InMemoryLedgerStore, LedgerStore, LedgerTx, PostgresLedgerStore, StorageError,
};
