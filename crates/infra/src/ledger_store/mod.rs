//! Transactional ledger storage boundary.
//!
//! The credit ledger's algorithms (balance guard, FIFO consumption, cache
//! repair) are written once against [`LedgerTx`]; backends only provide the
//! primitive steps with the atomicity each one documents.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use r#trait::{
    IDEMPOTENCY_KEY_CONSTRAINT, LedgerStore, LedgerTx, PAYMENT_SESSION_CONSTRAINT, StorageError,
};
