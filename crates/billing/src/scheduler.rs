//! Monthly billing schedule.
//!
//! The run fires at 00:01:00 UTC on the first day of every month. The timer
//! callback re-arms the next period *before* dispatching, so a slow run can
//! delay the start of an already-armed period but never loses it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{BillingRun, RunSummary};
use crate::processor::panic_message;

/// Scheduling failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("next billing run after {0} is outside the representable date range")]
    OutOfRange(DateTime<Utc>),
    #[error("timer is shut down")]
    TimerStopped,
}

/// Next billing instant strictly after `now`.
///
/// Candidate is the first day of `now`'s month at 00:01:00; if that is not
/// strictly after `now`, the candidate one month later.
pub fn next_run(now: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
    let candidate = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .and_then(|day| day.and_hms_opt(0, 1, 0))
        .map(|at| at.and_utc())
        .ok_or(SchedulerError::OutOfRange(now))?;

    if candidate > now {
        Ok(candidate)
    } else {
        candidate
            .checked_add_months(Months::new(1))
            .ok_or(SchedulerError::OutOfRange(now))
    }
}

/// Source of "now".
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs a task once at (or after) a given instant.
pub trait Timer: Send + Sync {
    fn schedule(&self, at: DateTime<Utc>, task: TimerTask) -> Result<(), SchedulerError>;
}

impl<T: Timer + ?Sized> Timer for Arc<T> {
    fn schedule(&self, at: DateTime<Utc>, task: TimerTask) -> Result<(), SchedulerError> {
        (**self).schedule(at, task)
    }
}

enum TimerMessage {
    Schedule(DateTime<Utc>, TimerTask),
    Shutdown,
}

/// Single dedicated timer thread.
///
/// Tasks run on the timer thread itself, one at a time, in deadline order.
/// A panicking task is logged and dropped; the thread keeps serving the queue.
#[derive(Debug)]
pub struct ThreadTimer {
    sender: Mutex<mpsc::Sender<TimerMessage>>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ThreadTimer {
    /// Spawn the timer thread.
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<TimerMessage>();
        let name = name.into();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || timer_loop(&name, receiver))?;

        Ok(Self {
            sender: Mutex::new(sender),
            join: Mutex::new(Some(join)),
        })
    }

    /// Stop the timer thread, dropping tasks that have not fired yet.
    ///
    /// Waits for a task that is currently running to finish. Must not be
    /// called from inside a timer task.
    pub fn shutdown(&self) {
        let _ = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(TimerMessage::Shutdown);
        let join = self.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(join) = join {
            let _ = join.join();
        }
    }
}

impl Timer for ThreadTimer {
    fn schedule(&self, at: DateTime<Utc>, task: TimerTask) -> Result<(), SchedulerError> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(TimerMessage::Schedule(at, task))
            .map_err(|_| SchedulerError::TimerStopped)
    }
}

fn timer_loop(name: &str, receiver: mpsc::Receiver<TimerMessage>) {
    debug!(timer = name, "timer started");
    let mut queue: Vec<(DateTime<Utc>, TimerTask)> = Vec::new();

    loop {
        // Run everything that is due, earliest first.
        while let Some(index) = next_due(&queue, Utc::now()) {
            let (at, task) = queue.swap_remove(index);
            debug!(timer = name, scheduled_for = %at, "timer fired");
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                error!(
                    timer = name,
                    scheduled_for = %at,
                    error = %panic_message(payload.as_ref()),
                    "timer task panicked"
                );
            }
        }

        let message = match queue.iter().map(|(at, _)| *at).min() {
            Some(earliest) => {
                let wait = (earliest - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                receiver.recv_timeout(wait)
            }
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match message {
            Ok(TimerMessage::Schedule(at, task)) => queue.push((at, task)),
            Ok(TimerMessage::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(timer = name, dropped = queue.len(), "timer stopped");
}

fn next_due(queue: &[(DateTime<Utc>, TimerTask)], now: DateTime<Utc>) -> Option<usize> {
    queue
        .iter()
        .enumerate()
        .filter(|(_, (at, _))| *at <= now)
        .min_by_key(|(_, (at, _))| *at)
        .map(|(index, _)| index)
}

/// Scheduler state. There is no terminal state: once armed it stays armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Armed { next_run: DateTime<Utc> },
}

/// Self-rescheduling monthly trigger for a [`BillingRun`].
pub struct BillingScheduler<C, T, R> {
    clock: C,
    timer: T,
    run: R,
    state: Mutex<SchedulerState>,
}

impl<C, T, R> core::fmt::Debug for BillingScheduler<C, T, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BillingScheduler")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<C, T, R> BillingScheduler<C, T, R> {
    pub fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C, T, R> BillingScheduler<C, T, R>
where
    C: Clock + 'static,
    T: Timer + 'static,
    R: BillingRun + 'static,
{
    pub fn new(clock: C, timer: T, run: R) -> Arc<Self> {
        Arc::new(Self {
            clock,
            timer,
            run,
            state: Mutex::new(SchedulerState::Idle),
        })
    }

    /// Arm the timer for the next period.
    ///
    /// Idempotent: if already armed, returns the armed instant and arms nothing.
    pub fn start(self: &Arc<Self>) -> Result<DateTime<Utc>, SchedulerError> {
        let next = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let SchedulerState::Armed { next_run } = *state {
                debug!(next_run = %next_run, "billing scheduler already armed");
                return Ok(next_run);
            }
            let next = next_run(self.clock.now())?;
            *state = SchedulerState::Armed { next_run: next };
            next
        };
        self.arm_at(next)
    }

    /// Run the billing pass immediately, outside the schedule. The armed
    /// period is left untouched.
    pub fn run_now(&self) -> RunSummary {
        let summary = self.run.run_once();
        info!(paid = summary.paid, failed = summary.failed_total(), "manual billing run finished");
        summary
    }

    fn rearm(self: &Arc<Self>) -> Result<DateTime<Utc>, SchedulerError> {
        let next = next_run(self.clock.now())?;
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SchedulerState::Armed { next_run: next };
        self.arm_at(next)
    }

    // The state lock is released here: a timer may run the task synchronously.
    fn arm_at(self: &Arc<Self>, at: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
        let this = Arc::clone(self);
        if let Err(err) = self.timer.schedule(at, Box::new(move || this.fire(at))) {
            *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SchedulerState::Idle;
            return Err(err);
        }
        info!(next_run = %at, "billing run scheduled");
        Ok(at)
    }

    fn fire(self: &Arc<Self>, scheduled_for: DateTime<Utc>) {
        info!(scheduled_for = %scheduled_for, "billing timer fired");
        if let Err(err) = self.rearm() {
            error!(error = %err, "failed to schedule next billing run");
        }

        let summary = self.run.run_once();
        if summary.completed {
            info!(scheduled_for = %scheduled_for, paid = summary.paid, failed = summary.failed_total(), "all invoices processed");
        } else {
            warn!(
                scheduled_for = %scheduled_for,
                skipped = summary.skipped,
                "billing run ended before all invoices were processed"
            );
        }
    }
}
