//! Invoice storage interface and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use billrun_core::{DomainError, InvoiceId};
use billrun_invoicing::{FailureReason, Invoice, InvoiceStatus};

/// Invoice store abstraction.
///
/// Must tolerate concurrent writes to *different* invoices; the dispatcher
/// never writes the same invoice from two workers.
pub trait InvoiceStore: Send + Sync {
    /// All invoices currently `Pending`, in a stable order.
    fn fetch_pending(&self) -> Result<Vec<Invoice>, StoreError>;

    /// Record a status transition. Only `Paid` is accepted; failures go
    /// through [`InvoiceStore::mark_failed`] so they always carry a reason.
    fn set_status(&self, invoice_id: InvoiceId, status: InvoiceStatus) -> Result<(), StoreError>;

    /// Record `Failed` together with its reason.
    fn mark_failed(&self, invoice_id: InvoiceId, reason: FailureReason) -> Result<(), StoreError>;
}

impl<S: InvoiceStore + ?Sized> InvoiceStore for Arc<S> {
    fn fetch_pending(&self) -> Result<Vec<Invoice>, StoreError> {
        (**self).fetch_pending()
    }

    fn set_status(&self, invoice_id: InvoiceId, status: InvoiceStatus) -> Result<(), StoreError> {
        (**self).set_status(invoice_id, status)
    }

    fn mark_failed(&self, invoice_id: InvoiceId, reason: FailureReason) -> Result<(), StoreError> {
        (**self).mark_failed(invoice_id, reason)
    }
}

/// Invoice store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("invoice not found: {0}")]
    NotFound(InvoiceId),
    #[error("invoice already exists: {0}")]
    AlreadyExists(InvoiceId),
    #[error("unsupported status transition to {0:?}")]
    UnsupportedStatus(InvoiceStatus),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Default)]
struct Inner {
    order: Vec<InvoiceId>,
    invoices: HashMap<InvoiceId, Invoice>,
}

/// In-memory invoice store for tests/dev.
///
/// Preserves insertion order, which is the order `fetch_pending` returns.
#[derive(Debug, Default)]
pub struct InMemoryInvoiceStore {
    inner: RwLock<Inner>,
}

impl InMemoryInvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Build a store holding `invoices` in the given order.
    pub fn with_invoices(invoices: impl IntoIterator<Item = Invoice>) -> Result<Self, StoreError> {
        let store = Self::new();
        for invoice in invoices {
            store.insert(invoice)?;
        }
        Ok(store)
    }

    pub fn insert(&self, invoice: Invoice) -> Result<InvoiceId, StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let id = invoice.id_typed();
        if inner.invoices.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        inner.order.push(id);
        inner.invoices.insert(id, invoice);
        Ok(id)
    }

    pub fn fetch(&self, invoice_id: InvoiceId) -> Result<Invoice, StoreError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .invoices
            .get(&invoice_id)
            .cloned()
            .ok_or(StoreError::NotFound(invoice_id))
    }

    pub fn fetch_all(&self) -> Vec<Invoice> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .order
            .iter()
            .filter_map(|id| inner.invoices.get(id).cloned())
            .collect()
    }

    pub fn fetch_with_status(&self, status: InvoiceStatus) -> Vec<Invoice> {
        self.fetch_all()
            .into_iter()
            .filter(|invoice| invoice.status() == status)
            .collect()
    }

    fn update<F>(&self, invoice_id: InvoiceId, transition: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Invoice) -> Result<(), DomainError>,
    {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let invoice = inner
            .invoices
            .get_mut(&invoice_id)
            .ok_or(StoreError::NotFound(invoice_id))?;
        transition(invoice)?;
        Ok(())
    }
}

impl InvoiceStore for InMemoryInvoiceStore {
    fn fetch_pending(&self) -> Result<Vec<Invoice>, StoreError> {
        Ok(self.fetch_with_status(InvoiceStatus::Pending))
    }

    fn set_status(&self, invoice_id: InvoiceId, status: InvoiceStatus) -> Result<(), StoreError> {
        match status {
            InvoiceStatus::Paid => self.update(invoice_id, Invoice::mark_paid),
            other => Err(StoreError::UnsupportedStatus(other)),
        }
    }

    fn mark_failed(&self, invoice_id: InvoiceId, reason: FailureReason) -> Result<(), StoreError> {
        self.update(invoice_id, |invoice| invoice.mark_failed(reason))
    }
}
