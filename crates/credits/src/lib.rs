//! Credit ledger domain (lots, debits, allocations, balance cache).
//!
//! Pure domain logic only: no IO, no persistence concerns. The rules that
//! decide which lot pays for a debit and when a cached balance goes stale
//! live here so every storage backend applies them identically.

pub mod amount;
pub mod balance;
pub mod command;
pub mod entry;
pub mod history;
pub mod lot;

pub use amount::Credits;
pub use balance::{BalanceCache, LotAggregate};
pub use command::{Allocation, DebitReceipt, DebitRequest, GrantRequest, IdempotentDebit};
pub use entry::{CreditSource, EntryKind, GrantRefs, IdempotencyKey, LedgerEntry, OperationRef};
pub use history::{HistoryPage, HistoryQuery, HistorySummary, PageInfo, billing_month_bounds};
pub use lot::{CreditLot, select_next_lot};
