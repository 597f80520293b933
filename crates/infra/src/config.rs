//! Configuration loading and representation.
//!
//! `LedgerConfig` is the raw, serde-friendly shape (env vars or a config
//! file); `LedgerSettings` is the validated subset the ledger service runs on.

use chrono::{Duration, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Raw ledger configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub expiry_warning_days: i64,
    pub billing_utc_offset_minutes: i32,
    pub history_default_limit: u32,
    pub history_max_limit: u32,
    pub reconcile_interval_secs: u64,
    pub reconcile_batch_size: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            expiry_warning_days: 30,
            billing_utc_offset_minutes: 0,
            history_default_limit: 20,
            history_max_limit: 100,
            reconcile_interval_secs: 60,
            reconcile_batch_size: 500,
        }
    }
}

impl LedgerConfig {
    /// Load from the process environment, falling back to defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable lookup (the environment, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            max_connections: parse_var(
                &lookup,
                "CREDITS_DB_MAX_CONNECTIONS",
                defaults.max_connections,
            )?,
            expiry_warning_days: parse_var(
                &lookup,
                "CREDITS_EXPIRY_WARNING_DAYS",
                defaults.expiry_warning_days,
            )?,
            billing_utc_offset_minutes: parse_var(
                &lookup,
                "CREDITS_BILLING_UTC_OFFSET_MINUTES",
                defaults.billing_utc_offset_minutes,
            )?,
            history_default_limit: parse_var(
                &lookup,
                "CREDITS_HISTORY_DEFAULT_LIMIT",
                defaults.history_default_limit,
            )?,
            history_max_limit: parse_var(
                &lookup,
                "CREDITS_HISTORY_MAX_LIMIT",
                defaults.history_max_limit,
            )?,
            reconcile_interval_secs: parse_var(
                &lookup,
                "CREDITS_RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval_secs,
            )?,
            reconcile_batch_size: parse_var(
                &lookup,
                "CREDITS_RECONCILE_BATCH_SIZE",
                defaults.reconcile_batch_size,
            )?,
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    /// Validate and convert into the settings the ledger service uses.
    pub fn settings(&self) -> Result<LedgerSettings, ConfigError> {
        if self.expiry_warning_days < 0 {
            return Err(ConfigError::Invalid {
                var: "CREDITS_EXPIRY_WARNING_DAYS",
                reason: "must not be negative".to_string(),
            });
        }
        let offset_secs = self.billing_utc_offset_minutes.saturating_mul(60);
        let billing_offset = FixedOffset::east_opt(offset_secs)
            .ok_or_else(|| ConfigError::Invalid {
                var: "CREDITS_BILLING_UTC_OFFSET_MINUTES",
                reason: "must be within +/- 24 hours".to_string(),
            })?;
        if self.history_max_limit == 0 {
            return Err(ConfigError::Invalid {
                var: "CREDITS_HISTORY_MAX_LIMIT",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(LedgerSettings {
            expiry_warning: Duration::days(self.expiry_warning_days),
            billing_offset,
            history_default_limit: self.history_default_limit,
            history_max_limit: self.history_max_limit,
        })
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
    }
}

/// Validated settings consumed by [`CreditLedger`](crate::ledger::CreditLedger).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSettings {
    /// Lots expiring within this window count as "expiring soon".
    pub expiry_warning: Duration,
    /// Clock used to decide where a billing month starts.
    pub billing_offset: FixedOffset,
    pub history_default_limit: u32,
    pub history_max_limit: u32,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            expiry_warning: Duration::days(30),
            billing_offset: Utc.fix(),
            history_default_limit: 20,
            history_max_limit: 100,
        }
    }
}
