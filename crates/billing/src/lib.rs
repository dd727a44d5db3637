//! Recurring billing run orchestration.
//!
//! ## Components
//!
//! - `RetryExecutor`: bounded retry with exponential backoff and full jitter
//! - `InvoiceProcessor`: charges one invoice and records its terminal status
//! - `Dispatcher`: fans pending invoices out into concurrent sequential chunks
//! - `BillingScheduler`: arms a self-rescheduling monthly timer
//!
//! Storage and the payment provider are consumed through the `InvoiceStore`
//! and `PaymentProvider` traits.

pub mod config;
pub mod dispatcher;
pub mod processor;
pub mod provider;
pub mod retry;
pub mod scheduler;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{BillingConfig, ConfigError};
pub use dispatcher::{BillingRun, Dispatcher, RunSummary, partition};
pub use processor::{InvoiceOutcome, InvoiceProcessor, ProcessedInvoice};
pub use provider::{ChargeError, ChargeErrorKind, PaymentProvider};
pub use retry::{JitterSource, RandomJitter, RetryExecutor, RetryPolicy, Sleeper, ThreadSleeper};
pub use scheduler::{
    BillingScheduler, Clock, FixedClock, SchedulerError, SchedulerState, SystemClock, ThreadTimer,
    Timer, TimerTask, next_run,
};
pub use store::{InMemoryInvoiceStore, InvoiceStore, StoreError};
