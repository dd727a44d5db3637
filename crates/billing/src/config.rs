//! Billing run configuration, read from `BILLRUN_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::dispatcher::{DEFAULT_CONCURRENT_CHUNKS, Dispatcher};
use crate::processor::InvoiceProcessor;
use crate::provider::PaymentProvider;
use crate::retry::RetryPolicy;
use crate::store::InvoiceStore;

pub const CONCURRENT_CHUNKS_VAR: &str = "BILLRUN_CONCURRENT_CHUNKS";
pub const MAX_RETRIES_VAR: &str = "BILLRUN_MAX_RETRIES";
pub const RETRY_BASE_DELAY_MS_VAR: &str = "BILLRUN_RETRY_BASE_DELAY_MS";
pub const RUN_DEADLINE_SECS_VAR: &str = "BILLRUN_RUN_DEADLINE_SECS";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Tunables of a billing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingConfig {
    pub concurrent_chunks: usize,
    pub retry: RetryPolicy,
    /// `None` lets a run take as long as it needs.
    pub run_deadline: Option<Duration>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            concurrent_chunks: DEFAULT_CONCURRENT_CHUNKS,
            retry: RetryPolicy::default(),
            run_deadline: None,
        }
    }
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let concurrent_chunks = parse(&lookup, CONCURRENT_CHUNKS_VAR)?.unwrap_or(defaults.concurrent_chunks);
        if concurrent_chunks == 0 {
            return Err(ConfigError::Invalid {
                key: CONCURRENT_CHUNKS_VAR,
                value: "0".to_string(),
            });
        }

        let max_retries = parse(&lookup, MAX_RETRIES_VAR)?.unwrap_or(defaults.retry.max_retries);
        let base_delay = parse(&lookup, RETRY_BASE_DELAY_MS_VAR)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry.base_delay);
        let run_deadline = parse(&lookup, RUN_DEADLINE_SECS_VAR)?.map(Duration::from_secs);

        Ok(Self {
            concurrent_chunks,
            retry: RetryPolicy::new(max_retries, base_delay),
            run_deadline,
        })
    }

    /// Wire a dispatcher around `provider` and `store` with these settings.
    pub fn dispatcher<P, S>(&self, provider: P, store: S) -> Dispatcher<P, S>
    where
        P: PaymentProvider,
        S: InvoiceStore,
    {
        Dispatcher::new(InvoiceProcessor::new(provider, store, self.retry))
            .with_concurrent_chunks(self.concurrent_chunks)
            .with_run_deadline(self.run_deadline)
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn unset_variables_keep_defaults() {
        let config = BillingConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, BillingConfig::default());
        assert_eq!(config.concurrent_chunks, 10);
        assert_eq!(config.retry, RetryPolicy::new(3, Duration::from_millis(100)));
        assert_eq!(config.run_deadline, None);
    }

    #[test]
    fn reads_every_variable() {
        let config = BillingConfig::from_lookup(lookup(&[
            (CONCURRENT_CHUNKS_VAR, "4"),
            (MAX_RETRIES_VAR, "0"),
            (RETRY_BASE_DELAY_MS_VAR, " 250 "),
            (RUN_DEADLINE_SECS_VAR, "3600"),
        ]))
        .unwrap();

        assert_eq!(config.concurrent_chunks, 4);
        assert_eq!(config.retry, RetryPolicy::new(0, Duration::from_millis(250)));
        assert_eq!(config.run_deadline, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn unparsable_value_is_rejected_with_its_key() {
        let err = BillingConfig::from_lookup(lookup(&[(MAX_RETRIES_VAR, "three")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: MAX_RETRIES_VAR,
                value: "three".to_string()
            }
        );
    }

    #[test]
    fn zero_chunks_is_rejected() {
        let err = BillingConfig::from_lookup(lookup(&[(CONCURRENT_CHUNKS_VAR, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: CONCURRENT_CHUNKS_VAR, .. }));
    }

    #[test]
    fn negative_delay_is_rejected() {
        assert!(BillingConfig::from_lookup(lookup(&[(RETRY_BASE_DELAY_MS_VAR, "-5")])).is_err());
    }
}
