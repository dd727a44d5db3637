//! `billrun` demo application: seeded in-memory invoices, a simulated
//! payment provider, and the monthly billing scheduler.

pub mod provider;
pub mod seed;

use billrun_billing::ConfigError;

pub const RUN_ON_START_VAR: &str = "BILLRUN_RUN_ON_START";
pub const SEED_CUSTOMERS_VAR: &str = "BILLRUN_SEED_CUSTOMERS";

/// Settings that only matter to the demo binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppSettings {
    /// Run once at startup in addition to the schedule.
    pub run_on_start: bool,
    pub seed_customers: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            run_on_start: false,
            seed_customers: 100,
        }
    }
}

impl AppSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let invalid = |key, value: String| ConfigError::Invalid { key, value };

        let run_on_start = match lookup(RUN_ON_START_VAR) {
            None => defaults.run_on_start,
            Some(raw) => raw.trim().parse().map_err(|_| invalid(RUN_ON_START_VAR, raw))?,
        };
        let seed_customers = match lookup(SEED_CUSTOMERS_VAR) {
            None => defaults.seed_customers,
            Some(raw) => raw.trim().parse().map_err(|_| invalid(SEED_CUSTOMERS_VAR, raw))?,
        };

        Ok(Self {
            run_on_start,
            seed_customers,
        })
    }
}
