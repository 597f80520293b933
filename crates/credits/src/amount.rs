use serde::{Deserialize, Serialize};

use creditledger_core::{DomainError, DomainResult};

/// A strictly positive number of credits.
///
/// Grant and debit amounts are always expressed as `Credits`, so a zero or
/// negative request is rejected before any transaction is opened.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Credits(i64);

impl Credits {
    pub fn new(amount: i64) -> DomainResult<Self> {
        if amount <= 0 {
            return Err(DomainError::validation(format!(
                "credit amount must be positive (got {amount})"
            )));
        }
        Ok(Self(amount))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for Credits {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Credits> for i64 {
    fn from(value: Credits) -> Self {
        value.0
    }
}

impl core::fmt::Display for Credits {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_and_negative() {
        assert!(Credits::new(0).is_err());
        assert!(Credits::new(-5).is_err());
        assert_eq!(Credits::new(1).unwrap().get(), 1);
    }

    #[test]
    fn deserialization_validates() {
        let ok: Credits = serde_json::from_str("42").unwrap();
        assert_eq!(ok.get(), 42);
        assert!(serde_json::from_str::<Credits>("0").is_err());
    }
}
