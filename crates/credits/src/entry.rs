use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use creditledger_core::{AccountId, DomainError, LedgerEntryId};

use crate::command::{DebitRequest, GrantRequest};
use crate::lot::CreditLot;

/// Which side of the ledger a row is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Credit,
    Debit,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Credit => "credit",
            EntryKind::Debit => "debit",
        }
    }
}

impl FromStr for EntryKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(EntryKind::Credit),
            "debit" => Ok(EntryKind::Debit),
            other => Err(DomainError::validation(format!("unknown entry kind '{other}'"))),
        }
    }
}

/// Provenance tag of a ledger row.
///
/// Grants use the acquisition sources (purchase, gift, ...); debits use the
/// metered operation that consumed credits (upload, line delivery).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditSource {
    Purchase,
    Gift,
    Discount,
    Refund,
    AdminAdjustment,
    Upload,
    LineDelivery,
}

impl CreditSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CreditSource::Purchase => "purchase",
            CreditSource::Gift => "gift",
            CreditSource::Discount => "discount",
            CreditSource::Refund => "refund",
            CreditSource::AdminAdjustment => "admin_adjustment",
            CreditSource::Upload => "upload",
            CreditSource::LineDelivery => "line_delivery",
        }
    }
}

impl FromStr for CreditSource {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let source = match s {
            "purchase" => CreditSource::Purchase,
            "gift" => CreditSource::Gift,
            "discount" => CreditSource::Discount,
            "refund" => CreditSource::Refund,
            "admin_adjustment" => CreditSource::AdminAdjustment,
            "upload" => CreditSource::Upload,
            "line_delivery" => CreditSource::LineDelivery,
            other => {
                return Err(DomainError::validation(format!("unknown credit source '{other}'")));
            }
        };
        Ok(source)
    }
}

/// External identity of a metered operation (e.g. `image_upload` / photo id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationRef {
    pub operation_type: String,
    pub operation_id: String,
}

impl OperationRef {
    pub fn new(operation_type: impl Into<String>, operation_id: impl Into<String>) -> Self {
        Self {
            operation_type: operation_type.into(),
            operation_id: operation_id.into(),
        }
    }
}

/// `(account, operation type, operation id)`: identifies one logical debit
/// no matter how many times it is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub account_id: AccountId,
    pub operation: OperationRef,
}

/// Optional provenance references attached to a grant.
///
/// `payment_session_id` is unique across the ledger, which is how payment
/// fulfillment avoids granting twice for one checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRefs {
    pub payment_session_id: Option<String>,
    pub promo_code: Option<String>,
}

impl GrantRefs {
    pub fn payment_session(id: impl Into<String>) -> Self {
        Self {
            payment_session_id: Some(id.into()),
            promo_code: None,
        }
    }

    pub fn promo_code(code: impl Into<String>) -> Self {
        Self {
            payment_session_id: None,
            promo_code: Some(code.into()),
        }
    }
}

/// One ledger row: a credit lot (positive amount) or a debit (negative amount).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub account_id: AccountId,
    /// Signed: positive for credit lots, negative for debits.
    pub amount: i64,
    pub kind: EntryKind,
    pub source: CreditSource,
    /// Credit lots only.
    pub expires_at: Option<DateTime<Utc>>,
    /// Credit lots only; debits never carry or mutate this.
    pub remaining_credits: Option<i64>,
    /// Debits only.
    pub operation: Option<OperationRef>,
    pub refs: GrantRefs,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// New, untouched credit lot for a grant.
    pub fn credit_lot(request: &GrantRequest, created_at: DateTime<Utc>) -> Self {
        let amount = request.amount.get();
        Self {
            id: LedgerEntryId::new(),
            account_id: request.account_id,
            amount,
            kind: EntryKind::Credit,
            source: request.source,
            expires_at: Some(request.expires_at),
            remaining_credits: Some(amount),
            operation: None,
            refs: request.refs.clone(),
            created_at,
        }
    }

    /// Debit row for the full requested amount.
    pub fn debit(id: LedgerEntryId, request: &DebitRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            account_id: request.account_id,
            amount: -request.amount.get(),
            kind: EntryKind::Debit,
            source: request.source,
            expires_at: None,
            remaining_credits: None,
            operation: Some(request.operation.clone()),
            refs: GrantRefs::default(),
            created_at,
        }
    }

    /// The idempotency key of a debit row.
    pub fn idempotency_key(&self) -> Option<IdempotencyKey> {
        match self.kind {
            EntryKind::Debit => self.operation.clone().map(|operation| IdempotencyKey {
                account_id: self.account_id,
                operation,
            }),
            EntryKind::Credit => None,
        }
    }

    /// View of this row as a spendable lot (credit rows only).
    pub fn as_lot(&self) -> Option<CreditLot> {
        match (self.kind, self.remaining_credits) {
            (EntryKind::Credit, Some(remaining)) => Some(CreditLot {
                id: self.id,
                remaining_credits: remaining,
                expires_at: self.expires_at,
                created_at: self.created_at,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Credits;
    use chrono::Duration;

    #[test]
    fn source_strings_round_trip() {
        for source in [
            CreditSource::Purchase,
            CreditSource::Gift,
            CreditSource::Discount,
            CreditSource::Refund,
            CreditSource::AdminAdjustment,
            CreditSource::Upload,
            CreditSource::LineDelivery,
        ] {
            assert_eq!(source.as_str().parse::<CreditSource>().unwrap(), source);
        }
        assert!("coupon".parse::<CreditSource>().is_err());
    }

    #[test]
    fn credit_lot_starts_fully_unconsumed() {
        let now = Utc::now();
        let request = GrantRequest {
            account_id: AccountId::new(),
            amount: Credits::new(300).unwrap(),
            source: CreditSource::Purchase,
            expires_at: now + Duration::days(180),
            refs: GrantRefs::payment_session("cs_test_1"),
        };

        let entry = LedgerEntry::credit_lot(&request, now);

        assert_eq!(entry.kind, EntryKind::Credit);
        assert_eq!(entry.amount, 300);
        assert_eq!(entry.remaining_credits, Some(300));
        assert!(entry.operation.is_none());
        assert!(entry.idempotency_key().is_none());
        assert_eq!(entry.as_lot().unwrap().remaining_credits, 300);
    }

    #[test]
    fn debit_is_negative_and_keyed() {
        let account_id = AccountId::new();
        let request = DebitRequest {
            account_id,
            amount: Credits::new(2).unwrap(),
            operation: OperationRef::new("image_upload", "photo-1"),
            source: CreditSource::Upload,
        };

        let entry = LedgerEntry::debit(LedgerEntryId::new(), &request, Utc::now());

        assert_eq!(entry.amount, -2);
        assert!(entry.remaining_credits.is_none());
        assert!(entry.as_lot().is_none());
        assert_eq!(entry.idempotency_key(), Some(request.idempotency_key()));
    }
}
