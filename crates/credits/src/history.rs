//! Paginated ledger history and its summary figures.

use chrono::{DateTime, Datelike, FixedOffset, Months, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::{EntryKind, LedgerEntry};

/// History request. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub page: u32,
    pub limit: u32,
    pub kind: Option<EntryKind>,
}

impl HistoryQuery {
    pub fn new(page: u32, limit: u32, kind: Option<EntryKind>) -> Self {
        Self { page, limit, kind }
    }

    /// Clamp to `page >= 1` and `1 <= limit <= max_limit` (`0` selects the default).
    pub fn normalized(self, default_limit: u32, max_limit: u32) -> Self {
        let max_limit = max_limit.max(1);
        let limit = match self.limit {
            0 => default_limit.clamp(1, max_limit),
            n => n.min(max_limit),
        };
        Self {
            page: self.page.max(1),
            limit,
            kind: self.kind,
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }
}

/// Account-wide figures shown next to the history, independent of the kind filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySummary {
    pub balance: i64,
    /// Unconsumed credits in lots that expire within the warning window.
    pub expiring_soon: i64,
    /// Credits debited since the start of the current billing month.
    pub used_this_month: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub page: u32,
    pub limit: u32,
    pub total_count: u64,
    pub total_pages: u64,
    pub has_next_page: bool,
    pub has_prev_page: bool,
}

impl PageInfo {
    pub fn new(query: &HistoryQuery, total_count: u64) -> Self {
        let limit = u64::from(query.limit.max(1));
        let total_pages = total_count.div_ceil(limit);
        Self {
            page: query.page,
            limit: query.limit,
            total_count,
            total_pages,
            has_next_page: u64::from(query.page) < total_pages,
            has_prev_page: query.page > 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Newest first.
    pub entries: Vec<LedgerEntry>,
    pub summary: HistorySummary,
    pub pagination: PageInfo,
}

/// `[start, end)` of the calendar month containing `now`, as seen on the
/// billing clock `offset`, expressed in UTC.
pub fn billing_month_bounds(
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let local = now.with_timezone(&offset).date_naive();
    let first = local - chrono::Days::new(u64::from(local.day0()));
    let next = first + Months::new(1);
    let shift = TimeDelta::seconds(i64::from(offset.local_minus_utc()));

    let to_utc = |date: chrono::NaiveDate| (date.and_time(NaiveTime::MIN) - shift).and_utc();
    (to_utc(first), to_utc(next))
}
