//! Billing run fan-out: pending invoices are split into contiguous chunks,
//! chunks run concurrently, invoices inside a chunk run sequentially.
//!
//! With `K` chunks at most `K` provider requests are in flight at once,
//! regardless of how many invoices are pending. Each invoice belongs to
//! exactly one chunk, so no two workers ever write the same invoice.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, warn};

use billrun_invoicing::{FailureReason, Invoice};

use crate::processor::{InvoiceOutcome, InvoiceProcessor, ProcessedInvoice, panic_message};
use crate::provider::PaymentProvider;
use crate::store::InvoiceStore;

/// Default number of concurrently processed chunks.
pub const DEFAULT_CONCURRENT_CHUNKS: usize = 10;

/// Something the scheduler can fire once per period.
pub trait BillingRun: Send + Sync {
    /// Process every pending invoice; returns once all work has settled.
    fn run_once(&self) -> RunSummary;
}

impl<R: BillingRun + ?Sized> BillingRun for Arc<R> {
    fn run_once(&self) -> RunSummary {
        (**self).run_once()
    }
}

/// Split `invoices` into at most `concurrent_chunks` contiguous chunks.
///
/// Chunk size is `ceil(len / concurrent_chunks)`; the last chunk may be
/// shorter. Concatenating the chunks yields `invoices` unchanged. An empty
/// input yields no chunks. A width of 0 is treated as 1.
pub fn partition<T: Clone>(invoices: &[T], concurrent_chunks: usize) -> Vec<Vec<T>> {
    if invoices.is_empty() {
        return Vec::new();
    }
    let chunk_size = invoices.len().div_ceil(concurrent_chunks.max(1));
    invoices.chunks(chunk_size).map(<[T]>::to_vec).collect()
}

/// Aggregate result of one billing run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Invoices fetched as pending at run start.
    pub pending: usize,
    pub chunks: usize,
    pub paid: usize,
    pub failed: BTreeMap<FailureReason, usize>,
    /// Outcomes the store refused to record.
    pub store_errors: usize,
    /// Invoices not started because the run deadline elapsed.
    pub skipped: usize,
    /// Invoices whose processing panicked; their stored status is whatever the
    /// store last accepted.
    pub aborted: usize,
    /// `false` when the deadline cut the run short, an invoice was aborted, or
    /// pending invoices could not be fetched.
    pub completed: bool,
}

impl RunSummary {
    fn empty(completed: bool) -> Self {
        Self {
            completed,
            ..Self::default()
        }
    }

    pub fn failed_total(&self) -> usize {
        self.failed.values().sum()
    }

    pub fn failed_with(&self, reason: FailureReason) -> usize {
        self.failed.get(&reason).copied().unwrap_or(0)
    }

    fn record(&mut self, processed: &ProcessedInvoice) {
        match processed.outcome {
            InvoiceOutcome::Paid => self.paid += 1,
            InvoiceOutcome::Failed(reason) => *self.failed.entry(reason).or_default() += 1,
        }
        if !processed.recorded {
            self.store_errors += 1;
        }
    }

    fn merge(&mut self, chunk: ChunkReport) {
        for processed in &chunk.processed {
            self.record(processed);
        }
        self.skipped += chunk.skipped;
        self.aborted += chunk.aborted;
    }
}

#[derive(Debug, Default)]
struct ChunkReport {
    processed: Vec<ProcessedInvoice>,
    skipped: usize,
    aborted: usize,
}

impl ChunkReport {
    /// A chunk whose worker died without reporting back.
    fn lost(len: usize) -> Self {
        Self {
            aborted: len,
            ..Self::default()
        }
    }
}

/// Fetches pending invoices and drives them through an [`InvoiceProcessor`].
#[derive(Debug)]
pub struct Dispatcher<P, S> {
    processor: InvoiceProcessor<P, S>,
    concurrent_chunks: usize,
    run_deadline: Option<Duration>,
}

impl<P, S> Dispatcher<P, S>
where
    P: PaymentProvider,
    S: InvoiceStore,
{
    pub fn new(processor: InvoiceProcessor<P, S>) -> Self {
        Self {
            processor,
            concurrent_chunks: DEFAULT_CONCURRENT_CHUNKS,
            run_deadline: None,
        }
    }

    pub fn with_concurrent_chunks(mut self, concurrent_chunks: usize) -> Self {
        self.concurrent_chunks = concurrent_chunks.max(1);
        self
    }

    /// Stop starting new invoices once `deadline` has elapsed since run start.
    pub fn with_run_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.run_deadline = deadline;
        self
    }

    pub fn processor(&self) -> &InvoiceProcessor<P, S> {
        &self.processor
    }

    /// Run one billing pass. Blocks until every chunk has finished.
    pub fn run_once(&self) -> RunSummary {
        let started = Instant::now();
        let deadline = self.run_deadline.map(|d| started + d);

        let pending = match self.processor.store().fetch_pending() {
            Ok(pending) => pending,
            Err(err) => {
                error!(error = %err, "failed to fetch pending invoices; skipping run");
                return RunSummary::empty(false);
            }
        };

        let chunks = partition(&pending, self.concurrent_chunks);
        info!(
            pending = pending.len(),
            chunks = chunks.len(),
            "billing run started"
        );

        let mut summary = RunSummary {
            pending: pending.len(),
            chunks: chunks.len(),
            ..RunSummary::default()
        };

        let reports = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(chunks.len());
            let mut inline = Vec::new();
            for (index, chunk) in chunks.iter().enumerate() {
                let spawned = thread::Builder::new()
                    .name(format!("billing-chunk-{index}"))
                    .spawn_scoped(scope, move || self.process_chunk(index, chunk, deadline));
                match spawned {
                    Ok(handle) => handles.push((index, chunk.len(), handle)),
                    Err(err) => {
                        warn!(chunk = index, error = %err, "failed to spawn chunk worker; processing inline");
                        inline.push((index, chunk));
                    }
                }
            }

            let mut reports: Vec<ChunkReport> = inline
                .into_iter()
                .map(|(index, chunk)| self.process_chunk(index, chunk, deadline))
                .collect();
            for (index, len, handle) in handles {
                match handle.join() {
                    Ok(report) => reports.push(report),
                    Err(_) => {
                        error!(chunk = index, invoices = len, "chunk worker panicked");
                        reports.push(ChunkReport::lost(len));
                    }
                }
            }
            reports
        });

        for report in reports {
            summary.merge(report);
        }
        summary.completed = summary.skipped == 0 && summary.aborted == 0;

        info!(
            pending = summary.pending,
            paid = summary.paid,
            failed = summary.failed_total(),
            store_errors = summary.store_errors,
            skipped = summary.skipped,
            aborted = summary.aborted,
            completed = summary.completed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "billing run finished"
        );
        summary
    }

    fn process_chunk(&self, index: usize, chunk: &[Invoice], deadline: Option<Instant>) -> ChunkReport {
        let mut report = ChunkReport::default();
        for (position, invoice) in chunk.iter().enumerate() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                report.skipped = chunk.len() - position;
                warn!(
                    chunk = index,
                    skipped = report.skipped,
                    "run deadline elapsed; leaving remaining invoices pending"
                );
                break;
            }
            // A panicking store must not take the rest of the chunk down with it.
            match panic::catch_unwind(AssertUnwindSafe(|| self.processor.process(invoice))) {
                Ok(processed) => report.processed.push(processed),
                Err(payload) => {
                    report.aborted += 1;
                    error!(
                        chunk = index,
                        invoice_id = %invoice.id_typed(),
                        error = %panic_message(payload.as_ref()),
                        "invoice processing panicked; continuing with the rest of the chunk"
                    );
                }
            }
        }
        info!(chunk = index, processed = report.processed.len(), "processed chunk");
        report
    }
}

impl<P, S> BillingRun for Dispatcher<P, S>
where
    P: PaymentProvider,
    S: InvoiceStore,
{
    fn run_once(&self) -> RunSummary {
        Dispatcher::run_once(self)
    }
}
