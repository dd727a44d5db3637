//! External payment provider interface.
//!
//! ## Idempotency contract
//!
//! Implementations MUST treat the invoice identifier as an idempotency key:
//! repeating `charge` for the same invoice after a network error (which may
//! have succeeded upstream with the response lost) must not charge the
//! customer twice. The processor retries `Network` failures on the strength
//! of this contract alone; it does not verify it.

use thiserror::Error;

use billrun_core::{CustomerId, InvoiceId};
use billrun_invoicing::{FailureReason, Invoice};

/// Charges customers for invoices.
pub trait PaymentProvider: Send + Sync {
    /// Attempt to charge the invoice amount to the customer.
    ///
    /// `Ok(true)` means the charge was accepted, `Ok(false)` that it was
    /// declined (e.g. insufficient funds). Declines are business outcomes,
    /// not errors.
    fn charge(&self, invoice: &Invoice) -> Result<bool, ChargeError>;
}

impl<P: PaymentProvider + ?Sized> PaymentProvider for std::sync::Arc<P> {
    fn charge(&self, invoice: &Invoice) -> Result<bool, ChargeError> {
        (**self).charge(invoice)
    }
}

/// Failure raised by a payment provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChargeError {
    #[error("customer {0} not found by payment provider")]
    CustomerNotFound(CustomerId),
    #[error("currency of invoice {0} does not match the customer account")]
    CurrencyMismatch(InvoiceId),
    #[error("network failure: {0}")]
    Network(String),
    #[error("unclassified provider failure: {0}")]
    Unclassified(String),
}

/// Coarse classification of a [`ChargeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChargeErrorKind {
    CustomerNotFound,
    CurrencyMismatch,
    Network,
    Unclassified,
}

impl ChargeError {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn unclassified(msg: impl Into<String>) -> Self {
        Self::Unclassified(msg.into())
    }

    pub fn kind(&self) -> ChargeErrorKind {
        match self {
            ChargeError::CustomerNotFound(_) => ChargeErrorKind::CustomerNotFound,
            ChargeError::CurrencyMismatch(_) => ChargeErrorKind::CurrencyMismatch,
            ChargeError::Network(_) => ChargeErrorKind::Network,
            ChargeError::Unclassified(_) => ChargeErrorKind::Unclassified,
        }
    }

    /// Only transient network failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ChargeErrorKind::Network
    }
}

impl From<ChargeErrorKind> for FailureReason {
    fn from(kind: ChargeErrorKind) -> Self {
        match kind {
            ChargeErrorKind::CustomerNotFound => FailureReason::CustomerNotFound,
            ChargeErrorKind::CurrencyMismatch => FailureReason::CurrencyMismatch,
            ChargeErrorKind::Network => FailureReason::Network,
            ChargeErrorKind::Unclassified => FailureReason::Unknown,
        }
    }
}
