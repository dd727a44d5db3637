//! Stand-in payment provider for the demo binary.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use billrun_billing::{ChargeError, PaymentProvider};
use billrun_core::{Currency, CustomerId, InvoiceId};
use billrun_invoicing::Invoice;

/// Accepts or declines at random, after checking the customer account.
///
/// Charges are keyed on the invoice id: a repeated charge for an invoice that
/// was already accepted is acknowledged without charging again.
#[derive(Debug)]
pub struct SimulatedPaymentProvider {
    accounts: HashMap<CustomerId, Currency>,
    accept_rate: f64,
    network_failure_rate: f64,
    state: Mutex<ProviderState>,
}

#[derive(Debug)]
struct ProviderState {
    rng: StdRng,
    charged: HashMap<InvoiceId, bool>,
}

impl SimulatedPaymentProvider {
    pub fn new(accounts: HashMap<CustomerId, Currency>) -> Self {
        Self {
            accounts,
            accept_rate: 0.9,
            network_failure_rate: 0.05,
            state: Mutex::new(ProviderState {
                rng: StdRng::from_entropy(),
                charged: HashMap::new(),
            }),
        }
    }

    /// Override the odds; both rates are clamped to `[0, 1]`.
    pub fn with_rates(mut self, accept_rate: f64, network_failure_rate: f64) -> Self {
        self.accept_rate = accept_rate.clamp(0.0, 1.0);
        self.network_failure_rate = network_failure_rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_seed(self, seed: u64) -> Self {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).rng = StdRng::seed_from_u64(seed);
        self
    }
}

impl PaymentProvider for SimulatedPaymentProvider {
    fn charge(&self, invoice: &Invoice) -> Result<bool, ChargeError> {
        let currency = self
            .accounts
            .get(&invoice.customer_id())
            .ok_or(ChargeError::CustomerNotFound(invoice.customer_id()))?;
        if *currency != invoice.amount().currency() {
            return Err(ChargeError::CurrencyMismatch(invoice.id_typed()));
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(&accepted) = state.charged.get(&invoice.id_typed()) {
            return Ok(accepted);
        }
        if state.rng.gen_bool(self.network_failure_rate) {
            return Err(ChargeError::network("simulated connection reset"));
        }
        let accepted = state.rng.gen_bool(self.accept_rate);
        state.charged.insert(invoice.id_typed(), accepted);
        Ok(accepted)
    }
}
