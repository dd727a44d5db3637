//! Invoicing domain module.
//!
//! Invoices, their billing status lifecycle and failure reasons, implemented
//! as deterministic domain logic (no IO, no storage, no provider calls).

pub mod invoice;

pub use invoice::{FailureReason, Invoice, InvoiceStatus};
