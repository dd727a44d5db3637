//! Fakes shared by the unit and integration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use billrun_core::{Currency, CustomerId, InvoiceId, Money};
use billrun_invoicing::Invoice;

use crate::dispatcher::{BillingRun, RunSummary};
use crate::provider::{ChargeError, PaymentProvider};
use crate::retry::{JitterSource, Sleeper};
use crate::scheduler::{SchedulerError, Timer, TimerTask};

/// Deterministic pending invoice: the same `n` always yields the same ids.
pub fn pending_invoice(n: u128) -> Invoice {
    Invoice::pending(
        InvoiceId::from_uuid(Uuid::from_u128(n + 1)),
        CustomerId::from_uuid(Uuid::from_u128(1_000_000 + n)),
        Money::new(Decimal::new(10_000, 2), Currency::Eur).unwrap(),
    )
}

/// Records requested sleeps instead of sleeping.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.slept.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
    }
}

/// Returns scripted samples (the ceiling once they run out) and records the
/// ceilings it was asked for.
#[derive(Debug, Clone, Default)]
pub struct ScriptedJitter {
    samples: Arc<Mutex<VecDeque<Duration>>>,
    ceilings: Arc<Mutex<Vec<Duration>>>,
}

impl ScriptedJitter {
    /// Always samples the ceiling itself.
    pub fn ceiling() -> Self {
        Self::default()
    }

    pub fn new(samples: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            samples: Arc::new(Mutex::new(samples.into_iter().collect())),
            ceilings: Arc::default(),
        }
    }

    pub fn ceilings(&self) -> Vec<Duration> {
        self.ceilings.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl JitterSource for ScriptedJitter {
    fn sample(&self, ceiling: Duration) -> Duration {
        self.ceilings.lock().unwrap_or_else(PoisonError::into_inner).push(ceiling);
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(ceiling)
    }
}

type ChargeResult = Result<bool, ChargeError>;

enum Script {
    Sequence {
        queued: Mutex<VecDeque<ChargeResult>>,
        fallback: ChargeResult,
    },
    PerInvoice(Box<dyn Fn(InvoiceId) -> ChargeResult + Send + Sync>),
    Panic,
}

/// Payment provider answering from a script and counting calls.
pub struct ScriptedProvider {
    script: Script,
    calls: AtomicU32,
    charged: Mutex<Vec<InvoiceId>>,
}

impl ScriptedProvider {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            calls: AtomicU32::new(0),
            charged: Mutex::new(Vec::new()),
        }
    }

    pub fn always(result: ChargeResult) -> Self {
        Self::sequence(std::iter::empty(), result)
    }

    /// Answers `queued` in order, then `fallback` forever.
    pub fn sequence(queued: impl IntoIterator<Item = ChargeResult>, fallback: ChargeResult) -> Self {
        Self::with_script(Script::Sequence {
            queued: Mutex::new(queued.into_iter().collect()),
            fallback,
        })
    }

    pub fn per_invoice(answer: impl Fn(InvoiceId) -> ChargeResult + Send + Sync + 'static) -> Self {
        Self::with_script(Script::PerInvoice(Box::new(answer)))
    }

    pub fn panicking() -> Self {
        Self::with_script(Script::Panic)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Invoice ids in call order, retries included.
    pub fn charged_ids(&self) -> Vec<InvoiceId> {
        self.charged.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl PaymentProvider for ScriptedProvider {
    fn charge(&self, invoice: &Invoice) -> ChargeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.charged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(invoice.id_typed());

        match &self.script {
            Script::Sequence { queued, fallback } => queued
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .unwrap_or_else(|| fallback.clone()),
            Script::PerInvoice(answer) => answer(invoice.id_typed()),
            Script::Panic => panic!("provider exploded"),
        }
    }
}

/// Timer that records every schedule call and only fires on demand.
#[derive(Default)]
pub struct RecordingTimer {
    entries: Mutex<Vec<(DateTime<Utc>, Option<TimerTask>)>>,
    stopped: AtomicBool,
}

impl RecordingTimer {
    /// Every instant ever scheduled, fired or not, in call order.
    pub fn scheduled(&self) -> Vec<DateTime<Utc>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }

    /// Run the earliest task that has not fired yet. Returns `false` if none is left.
    pub fn fire_next(&self) -> bool {
        let task = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let earliest = entries
                .iter()
                .enumerate()
                .filter(|(_, (_, task))| task.is_some())
                .min_by_key(|(_, (at, _))| *at)
                .map(|(index, _)| index);
            earliest.and_then(|index| entries[index].1.take())
        };
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Reject every later `schedule` call.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

impl Timer for RecordingTimer {
    fn schedule(&self, at: DateTime<Utc>, task: TimerTask) -> Result<(), SchedulerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SchedulerError::TimerStopped);
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((at, Some(task)));
        Ok(())
    }
}

/// Billing run that only counts how often it was fired.
#[derive(Default)]
pub struct CountingRun {
    runs: AtomicU32,
    timer: Option<Arc<RecordingTimer>>,
    armed_when_run: Mutex<Vec<usize>>,
}

impl CountingRun {
    /// Also note how many instants `timer` had scheduled when each run started.
    pub fn watching(timer: Arc<RecordingTimer>) -> Self {
        Self {
            timer: Some(timer),
            ..Self::default()
        }
    }

    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn armed_when_run(&self) -> Vec<usize> {
        self.armed_when_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl BillingRun for CountingRun {
    fn run_once(&self) -> RunSummary {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(timer) = &self.timer {
            self.armed_when_run
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(timer.scheduled().len());
        }
        RunSummary {
            completed: true,
            ..RunSummary::default()
        }
    }
}
