//! Demo data for the `billrun` binary.

use std::collections::HashMap;

use rand::Rng;
use rust_decimal::Decimal;
use tracing::info;

use billrun_billing::{InMemoryInvoiceStore, StoreError};
use billrun_core::{Currency, CustomerId, InvoiceId, Money};
use billrun_invoicing::Invoice;

pub const INVOICES_PER_CUSTOMER: usize = 10;

/// Share of pending invoices issued in a currency other than the customer's.
const FOREIGN_CURRENCY_RATE: f64 = 0.05;
/// Share of customers the payment provider has no account for.
const UNREGISTERED_RATE: f64 = 0.02;

/// What the provider needs to know about the seeded customers.
#[derive(Debug, Default)]
pub struct DemoData {
    /// Provider-side accounts: customer -> account currency.
    pub accounts: HashMap<CustomerId, Currency>,
    pub customers: usize,
    pub pending: usize,
}

/// Insert `customers` customers with [`INVOICES_PER_CUSTOMER`] invoices each.
///
/// Every customer's last invoice is pending; the earlier ones are already paid.
pub fn seed(store: &InMemoryInvoiceStore, customers: usize, rng: &mut impl Rng) -> Result<DemoData, StoreError> {
    let mut data = DemoData {
        customers,
        ..DemoData::default()
    };

    for _ in 0..customers {
        let customer_id = CustomerId::new();
        let currency = random_currency(rng);
        if !rng.gen_bool(UNREGISTERED_RATE) {
            data.accounts.insert(customer_id, currency);
        }

        for index in 0..INVOICES_PER_CUSTOMER {
            let pending = index + 1 == INVOICES_PER_CUSTOMER;
            let invoice_currency = if pending && rng.gen_bool(FOREIGN_CURRENCY_RATE) {
                random_currency(rng)
            } else {
                currency
            };
            let amount = Money::new(Decimal::new(rng.gen_range(1_000..50_000), 2), invoice_currency)?;

            let mut invoice = Invoice::pending(InvoiceId::new(), customer_id, amount);
            if pending {
                data.pending += 1;
            } else {
                invoice.mark_paid()?;
            }
            store.insert(invoice)?;
        }
    }

    info!(
        customers = data.customers,
        pending = data.pending,
        registered = data.accounts.len(),
        "seeded demo invoices"
    );
    Ok(data)
}

fn random_currency(rng: &mut impl Rng) -> Currency {
    Currency::ALL[rng.gen_range(0..Currency::ALL.len())]
}
