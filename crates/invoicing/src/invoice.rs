use serde::{Deserialize, Serialize};

use billrun_core::{CustomerId, DomainError, DomainResult, InvoiceId, Money};

/// Invoice billing status lifecycle.
///
/// `Pending` is the only status eligible for a billing run. `Paid` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Failed,
}

impl InvoiceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Failed)
    }
}

/// Why a charge did not go through. Attached only to `Failed` invoices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    CustomerNotFound,
    CurrencyMismatch,
    InsufficientFunds,
    Network,
    Unknown,
}

impl FailureReason {
    pub const ALL: [FailureReason; 5] = [
        FailureReason::CustomerNotFound,
        FailureReason::CurrencyMismatch,
        FailureReason::InsufficientFunds,
        FailureReason::Network,
        FailureReason::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::CustomerNotFound => "CUSTOMER_NOT_FOUND",
            FailureReason::CurrencyMismatch => "CURRENCY_MISMATCH",
            FailureReason::InsufficientFunds => "INSUFFICIENT_FUNDS",
            FailureReason::Network => "NETWORK",
            FailureReason::Unknown => "UNKNOWN",
        }
    }
}

impl core::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An invoice awaiting (or past) collection.
///
/// Invariant: `failure_reason` is `Some` exactly when `status` is `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    id: InvoiceId,
    customer_id: CustomerId,
    amount: Money,
    status: InvoiceStatus,
    failure_reason: Option<FailureReason>,
}

impl Invoice {
    /// A freshly issued invoice, eligible for the next billing run.
    pub fn pending(id: InvoiceId, customer_id: CustomerId, amount: Money) -> Self {
        Self {
            id,
            customer_id,
            amount,
            status: InvoiceStatus::Pending,
            failure_reason: None,
        }
    }

    /// Rebuild an invoice from stored fields, checking the status/reason pairing.
    pub fn restore(
        id: InvoiceId,
        customer_id: CustomerId,
        amount: Money,
        status: InvoiceStatus,
        failure_reason: Option<FailureReason>,
    ) -> DomainResult<Self> {
        match (status, failure_reason) {
            (InvoiceStatus::Failed, None) => Err(DomainError::invariant(format!(
                "failed invoice {id} must carry a failure reason"
            ))),
            (InvoiceStatus::Pending | InvoiceStatus::Paid, Some(reason)) => {
                Err(DomainError::invariant(format!(
                    "invoice {id} with status {status:?} cannot carry failure reason {reason}"
                )))
            }
            _ => Ok(Self {
                id,
                customer_id,
                amount,
                status,
                failure_reason,
            }),
        }
    }

    pub fn id_typed(&self) -> InvoiceId {
        self.id
    }

    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    pub fn amount(&self) -> &Money {
        &self.amount
    }

    pub fn status(&self) -> InvoiceStatus {
        self.status
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.failure_reason
    }

    pub fn is_pending(&self) -> bool {
        self.status == InvoiceStatus::Pending
    }

    /// Transition `Pending -> Paid`.
    pub fn mark_paid(&mut self) -> DomainResult<()> {
        self.ensure_pending("mark as paid")?;
        self.status = InvoiceStatus::Paid;
        self.failure_reason = None;
        Ok(())
    }

    /// Transition `Pending -> Failed` with exactly one reason.
    pub fn mark_failed(&mut self, reason: FailureReason) -> DomainResult<()> {
        self.ensure_pending("mark as failed")?;
        self.status = InvoiceStatus::Failed;
        self.failure_reason = Some(reason);
        Ok(())
    }

    fn ensure_pending(&self, action: &str) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "cannot {action} invoice {} in terminal status {:?}",
                self.id, self.status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use billrun_core::Currency;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn test_invoice() -> Invoice {
        Invoice::pending(
            InvoiceId::from_uuid(Uuid::from_u128(123)),
            CustomerId::from_uuid(Uuid::from_u128(999)),
            Money::new(Decimal::new(100, 0), Currency::Eur).unwrap(),
        )
    }

    #[test]
    fn new_invoice_is_pending_without_reason() {
        let invoice = test_invoice();
        assert!(invoice.is_pending());
        assert_eq!(invoice.failure_reason(), None);
    }

    #[test]
    fn paid_invoice_carries_no_reason() {
        let mut invoice = test_invoice();
        invoice.mark_paid().unwrap();
        assert_eq!(invoice.status(), InvoiceStatus::Paid);
        assert_eq!(invoice.failure_reason(), None);
    }

    #[test]
    fn failed_invoice_carries_its_reason() {
        let mut invoice = test_invoice();
        invoice.mark_failed(FailureReason::CurrencyMismatch).unwrap();
        assert_eq!(invoice.status(), InvoiceStatus::Failed);
        assert_eq!(invoice.failure_reason(), Some(FailureReason::CurrencyMismatch));
    }

    #[test]
    fn cannot_revisit_paid_invoice() {
        let mut invoice = test_invoice();
        invoice.mark_paid().unwrap();

        let err = invoice.mark_failed(FailureReason::Network).unwrap_err();
        match err {
            DomainError::InvariantViolation(msg) if msg.contains("terminal status") => {}
            _ => panic!("Expected InvariantViolation for leaving Paid"),
        }
        assert_eq!(invoice.status(), InvoiceStatus::Paid);
        assert_eq!(invoice.failure_reason(), None);
    }

    #[test]
    fn cannot_revisit_failed_invoice() {
        let mut invoice = test_invoice();
        invoice.mark_failed(FailureReason::InsufficientFunds).unwrap();

        assert!(invoice.mark_paid().is_err());
        assert!(invoice.mark_failed(FailureReason::Unknown).is_err());
        assert_eq!(invoice.failure_reason(), Some(FailureReason::InsufficientFunds));
    }

    #[test]
    fn restore_rejects_failed_without_reason() {
        let template = test_invoice();
        let err = Invoice::restore(
            template.id_typed(),
            template.customer_id(),
            template.amount().clone(),
            InvoiceStatus::Failed,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn restore_rejects_reason_on_paid() {
        let template = test_invoice();
        let err = Invoice::restore(
            template.id_typed(),
            template.customer_id(),
            template.amount().clone(),
            InvoiceStatus::Paid,
            Some(FailureReason::Network),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn failure_reason_display_matches_wire_name() {
        assert_eq!(FailureReason::CustomerNotFound.to_string(), "CUSTOMER_NOT_FOUND");
        assert_eq!(FailureReason::InsufficientFunds.to_string(), "INSUFFICIENT_FUNDS");
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn any_reason() -> impl Strategy<Value = FailureReason> {
            prop::sample::select(FailureReason::ALL.to_vec())
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: once terminal, no sequence of transitions changes status or reason.
            #[test]
            fn terminal_status_is_sticky(
                first in prop::option::of(any_reason()),
                later in prop::collection::vec(prop::option::of(any_reason()), 0..8)
            ) {
                let mut invoice = test_invoice();
                match first {
                    Some(reason) => invoice.mark_failed(reason).unwrap(),
                    None => invoice.mark_paid().unwrap(),
                }
                let settled = invoice.clone();

                for step in later {
                    let result = match step {
                        Some(reason) => invoice.mark_failed(reason),
                        None => invoice.mark_paid(),
                    };
                    prop_assert!(result.is_err());
                }

                prop_assert_eq!(&invoice, &settled);
                prop_assert_eq!(
                    invoice.failure_reason().is_some(),
                    invoice.status() == InvoiceStatus::Failed
                );
            }
        }
    }
}
