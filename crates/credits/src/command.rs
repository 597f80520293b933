//! Requests accepted by the ledger and the results it hands back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use creditledger_core::{AccountId, LedgerEntryId};

use crate::amount::Credits;
use crate::entry::{CreditSource, GrantRefs, IdempotencyKey, OperationRef};

/// Command: add a new credit lot to an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRequest {
    pub account_id: AccountId,
    pub amount: Credits,
    pub source: CreditSource,
    pub expires_at: DateTime<Utc>,
    pub refs: GrantRefs,
}

/// Command: consume credits for one metered operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitRequest {
    pub account_id: AccountId,
    pub amount: Credits,
    pub operation: OperationRef,
    pub source: CreditSource,
}

impl DebitRequest {
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey {
            account_id: self.account_id,
            operation: self.operation.clone(),
        }
    }
}

/// How much of a debit a given credit lot paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub debit_entry_id: LedgerEntryId,
    pub credit_entry_id: LedgerEntryId,
    pub amount: i64,
}

/// Successful debit: the debit row plus the lots it drew from, in FIFO order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitReceipt {
    pub debit_entry_id: LedgerEntryId,
    pub allocations: Vec<Allocation>,
}

impl DebitReceipt {
    pub fn total_allocated(&self) -> i64 {
        self.allocations.iter().map(|a| a.amount).sum()
    }
}

/// Outcome of an idempotent debit.
///
/// `debited == false` means the operation had already been charged (or a
/// concurrent delivery charged it first); `receipt` is then `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotentDebit {
    pub debited: bool,
    pub receipt: Option<DebitReceipt>,
}

impl IdempotentDebit {
    pub fn charged(receipt: DebitReceipt) -> Self {
        Self {
            debited: true,
            receipt: Some(receipt),
        }
    }

    pub fn already_charged() -> Self {
        Self {
            debited: false,
            receipt: None,
        }
    }
}
