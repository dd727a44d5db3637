//! Charges a single invoice and records its terminal status.

use std::panic::{self, AssertUnwindSafe};

use serde::Serialize;
use tracing::{error, info, warn};

use billrun_core::InvoiceId;
use billrun_invoicing::{FailureReason, Invoice, InvoiceStatus};

use crate::provider::{ChargeError, PaymentProvider};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::store::InvoiceStore;

/// Terminal outcome of charging one invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceOutcome {
    Paid,
    Failed(FailureReason),
}

impl InvoiceOutcome {
    pub fn status(&self) -> InvoiceStatus {
        match self {
            InvoiceOutcome::Paid => InvoiceStatus::Paid,
            InvoiceOutcome::Failed(_) => InvoiceStatus::Failed,
        }
    }

    /// Map the (post-retry) result of a charge to its outcome.
    pub fn from_charge(result: &Result<bool, ChargeError>) -> Self {
        match result {
            Ok(true) => InvoiceOutcome::Paid,
            Ok(false) => InvoiceOutcome::Failed(FailureReason::InsufficientFunds),
            Err(err) => InvoiceOutcome::Failed(err.kind().into()),
        }
    }
}

/// Record of one processed invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessedInvoice {
    pub invoice_id: InvoiceId,
    pub outcome: InvoiceOutcome,
    /// Provider calls made, including the first.
    pub attempts: u32,
    /// Whether the store accepted the status write.
    pub recorded: bool,
}

/// Charges invoices through a [`PaymentProvider`] and writes the outcome to
/// an [`InvoiceStore`].
///
/// `process` never fails and never panics on provider misbehaviour: every
/// invocation resolves to a terminal outcome, so one bad invoice cannot abort
/// the chunk it belongs to.
#[derive(Debug)]
pub struct InvoiceProcessor<P, S> {
    provider: P,
    store: S,
    retry: RetryExecutor<ChargeError>,
}

impl<P: PaymentProvider, S: InvoiceStore> InvoiceProcessor<P, S> {
    /// Processor retrying only network failures under `policy`.
    pub fn new(provider: P, store: S, policy: RetryPolicy) -> Self {
        Self::with_retry(provider, store, RetryExecutor::new(policy, ChargeError::is_retryable))
    }

    /// Processor with a fully custom executor (injected sleeper/jitter in tests).
    pub fn with_retry(provider: P, store: S, retry: RetryExecutor<ChargeError>) -> Self {
        Self {
            provider,
            store,
            retry,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn process(&self, invoice: &Invoice) -> ProcessedInvoice {
        let invoice_id = invoice.id_typed();
        let mut attempts = 0u32;

        // Retrying relies on the provider using the invoice id as an idempotency
        // key; see the contract on `PaymentProvider`.
        let result = self.retry.execute(|| {
            attempts += 1;
            self.charge_once(invoice)
        });

        let outcome = InvoiceOutcome::from_charge(&result);
        log_outcome(invoice, &result, attempts);

        let write = match outcome {
            InvoiceOutcome::Paid => self.store.set_status(invoice_id, InvoiceStatus::Paid),
            InvoiceOutcome::Failed(reason) => self.store.mark_failed(invoice_id, reason),
        };
        let recorded = match write {
            Ok(()) => true,
            Err(err) => {
                error!(
                    invoice_id = %invoice_id,
                    outcome = ?outcome,
                    error = %err,
                    "failed to record invoice outcome"
                );
                false
            }
        };

        ProcessedInvoice {
            invoice_id,
            outcome,
            attempts,
            recorded,
        }
    }

    /// One provider call; a panic inside the provider becomes `Unclassified`.
    fn charge_once(&self, invoice: &Invoice) -> Result<bool, ChargeError> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.provider.charge(invoice))) {
            Ok(result) => result,
            Err(payload) => Err(ChargeError::unclassified(format!(
                "provider panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }
}

fn log_outcome(invoice: &Invoice, result: &Result<bool, ChargeError>, attempts: u32) {
    let invoice_id = invoice.id_typed();
    let customer_id = invoice.customer_id();
    match result {
        Ok(true) => info!(
            invoice_id = %invoice_id,
            customer_id = %customer_id,
            amount = %invoice.amount(),
            attempts,
            "charged customer"
        ),
        Ok(false) => warn!(
            invoice_id = %invoice_id,
            customer_id = %customer_id,
            amount = %invoice.amount(),
            "charge declined; customer needs to update payment details"
        ),
        Err(err) => warn!(
            invoice_id = %invoice_id,
            customer_id = %customer_id,
            attempts,
            error = %err,
            reason = %FailureReason::from(err.kind()),
            "charge failed"
        ),
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
