use crate::error::{Result, RoomError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Platform fee in basis points of the pool.
    pub fee_bps: u32,
    pub ledger_url: Option<String>,
    pub ledger_timeout: Duration,
    pub retry: RetryPolicy,
    pub scan_interval: Duration,
    pub max_capacity: u32,
    pub outbox_batch: usize,
    pub outbox_max_attempts: u32,
    pub read_model_url: Option<String>,
    pub currencies: Vec<CurrencyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyConfig {
    pub code: String,
    pub decimals: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before the given retry (1-based), capped.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fee_bps: 700, // 7%
            ledger_url: None,
            ledger_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            scan_interval: Duration::from_secs(30),
            max_capacity: 100,
            outbox_batch: 100,
            outbox_max_attempts: 10,
            read_model_url: None,
            currencies: vec![CurrencyConfig {
                code: "SUI".to_string(),
                decimals: 9,
            }],
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn currency(&self, code: &str) -> Option<&CurrencyConfig> {
        self.currencies.iter().find(|c| c.code == code)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fee_bps > 10_000 {
            return Err(RoomError::config("Fee rate cannot exceed 100%"));
        }

        if self.max_capacity < 2 {
            return Err(RoomError::config("Max capacity must be at least 2"));
        }

        // Integer split percentages stop dividing evenly past 100 payees
        if self.max_capacity > 100 {
            return Err(RoomError::config("Max capacity cannot exceed 100"));
        }

        if self.ledger_timeout.is_zero() || self.scan_interval.is_zero() {
            return Err(RoomError::config("Timeouts and intervals must be non-zero"));
        }

        if self.retry.max_attempts == 0 {
            return Err(RoomError::config("Retry policy needs at least one attempt"));
        }

        if self.outbox_batch == 0 {
            return Err(RoomError::config("Outbox batch must be greater than 0"));
        }

        if self.currencies.is_empty() {
            return Err(RoomError::config("At least one currency must be configured"));
        }

        let mut seen = HashSet::new();
        for currency in &self.currencies {
            if currency.code.is_empty() {
                return Err(RoomError::config("Currency code cannot be empty"));
            }
            if currency.decimals > 18 {
                return Err(RoomError::config(format!(
                    "Currency {} has too many decimals",
                    currency.code
                )));
            }
            if !seen.insert(currency.code.as_str()) {
                return Err(RoomError::config(format!(
                    "Duplicate currency {}",
                    currency.code
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.fee_bps, 700);
        assert_eq!(config.currency("SUI").unwrap().decimals, 9);
    }

    #[test]
    fn test_rejects_bad_config() {
        let mut config = EngineConfig::default();
        config.fee_bps = 10_001;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.currencies.push(config.currencies[0].clone());
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.max_capacity = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(5));
        assert_eq!(policy.backoff_for(64), Duration::from_secs(5));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("missing.json")).unwrap();
        assert_eq!(config.max_capacity, 100);
    }
}
