//! Ledger-driven invoice status derivation.
//!
//! The status of an invoice is a pure function of its amount and the sum of
//! its payments:
//!
//! | sum                 | status           | `paid_at` |
//! |---------------------|------------------|-----------|
//! | `0`                 | `unpaid`         | none      |
//! | `0 < sum < amount`  | `partially-paid` | none      |
//! | `sum >= amount`     | `paid`           | set       |
//!
//! `paid_at` is the timestamp of the payment at which the running sum (payments
//! ordered by timestamp, then id) first reaches the amount. Re-running the
//! derivation over an unchanged ledger yields the same result. A ledger whose
//! total does not fit in a `Decimal` cannot be settled.

use chrono::{DateTime, Utc};
use hap_core::{DomainError, DomainResult};
use rust_decimal::Decimal;

use crate::invoice::InvoiceStatus;
use crate::payment::Payment;

/// Status derived from `amount` and the ledger total.
pub fn derive_status(amount: Decimal, total_paid: Decimal) -> InvoiceStatus {
    if total_paid <= Decimal::ZERO {
        InvoiceStatus::Unpaid
    } else if total_paid < amount {
        InvoiceStatus::PartiallyPaid
    } else {
        InvoiceStatus::Paid
    }
}

/// Result of settling an invoice against its payments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub status: InvoiceStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub total_paid: Decimal,
}

/// Settle an invoice of `amount` against `payments` (any order).
pub fn settle(amount: Decimal, payments: &[Payment]) -> DomainResult<Settlement> {
    let mut ordered: Vec<&Payment> = payments.iter().collect();
    ordered.sort_by(|a, b| a.paid_at.cmp(&b.paid_at).then_with(|| a.id.cmp(&b.id)));

    let mut total_paid = Decimal::ZERO;
    let mut reached_at = None;
    for payment in ordered {
        total_paid = total_paid.checked_add(payment.amount).ok_or_else(|| {
            DomainError::invariant(format!(
                "payments on invoice {} overflow the ledger total",
                payment.invoice_id
            ))
        })?;
        if reached_at.is_none() && total_paid >= amount {
            reached_at = Some(payment.paid_at);
        }
    }

    let status = derive_status(amount, total_paid);
    let paid_at = match status {
        InvoiceStatus::Paid => reached_at,
        _ => None,
    };

    Ok(Settlement {
        status,
        paid_at,
        total_paid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use hap_core::{InvoiceId, PaymentId};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    use crate::payment::PaymentMethod;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn payment(amount: Decimal, minutes: i64) -> Payment {
        Payment {
            id: PaymentId::new(),
            invoice_id: InvoiceId::new(),
            amount,
            method: PaymentMethod::parse("cash").unwrap(),
            paid_at: test_time() + Duration::minutes(minutes),
            notes: String::new(),
        }
    }

    #[test]
    fn status_table() {
        assert_eq!(derive_status(dec!(100), dec!(0)), InvoiceStatus::Unpaid);
        assert_eq!(derive_status(dec!(100), dec!(0.01)), InvoiceStatus::PartiallyPaid);
        assert_eq!(derive_status(dec!(100), dec!(99.99)), InvoiceStatus::PartiallyPaid);
        assert_eq!(derive_status(dec!(100), dec!(100)), InvoiceStatus::Paid);
        assert_eq!(derive_status(dec!(100), dec!(100.00)), InvoiceStatus::Paid);
        assert_eq!(derive_status(dec!(100), dec!(180)), InvoiceStatus::Paid);
    }

    #[test]
    fn forty_then_sixty_pays_at_second_payment() {
        let first = payment(dec!(40), 0);
        let after_first = settle(dec!(100), std::slice::from_ref(&first)).unwrap();
        assert_eq!(after_first.status, InvoiceStatus::PartiallyPaid);
        assert_eq!(after_first.paid_at, None);

        let second = payment(dec!(60), 5);
        let after_second = settle(dec!(100), &[first, second.clone()]).unwrap();
        assert_eq!(after_second.status, InvoiceStatus::Paid);
        assert_eq!(after_second.paid_at, Some(second.paid_at));
        assert_eq!(after_second.total_paid, dec!(100));
    }

    #[test]
    fn overpayment_keeps_first_crossing() {
        let crossing = payment(dec!(100), 1);
        let extra = payment(dec!(20), 9);
        let settled = settle(dec!(100), &[extra, crossing.clone()]).unwrap();
        assert_eq!(settled.paid_at, Some(crossing.paid_at));
    }

    #[test]
    fn empty_ledger_is_unpaid() {
        let settled = settle(dec!(100), &[]).unwrap();
        assert_eq!(settled.status, InvoiceStatus::Unpaid);
        assert_eq!(settled.total_paid, Decimal::ZERO);
    }

    #[test]
    fn overflowing_total_is_an_error_not_a_panic() {
        let payments = [payment(Decimal::MAX - dec!(1), 0), payment(dec!(10), 1)];
        let err = settle(Decimal::MAX - dec!(1), &payments).unwrap_err();
        assert_eq!(err.kind(), hap_core::ErrorKind::Validation);
    }

    fn ledger() -> impl Strategy<Value = (Decimal, Vec<Payment>)> {
        (1i64..50_000, prop::collection::vec((1i64..20_000, 0i64..10_000), 0..12)).prop_map(
            |(amount_cents, entries)| {
                let payments = entries
                    .into_iter()
                    .map(|(cents, minutes)| payment(Decimal::new(cents, 2), minutes))
                    .collect();
                (Decimal::new(amount_cents, 2), payments)
            },
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn status_follows_the_sum((amount, payments) in ledger()) {
            let settled = settle(amount, &payments).unwrap();
            let sum: Decimal = payments.iter().map(|p| p.amount).sum();

            prop_assert_eq!(settled.total_paid, sum);
            prop_assert_eq!(settled.status == InvoiceStatus::Unpaid, sum == Decimal::ZERO);
            prop_assert_eq!(
                settled.status == InvoiceStatus::PartiallyPaid,
                sum > Decimal::ZERO && sum < amount
            );
            prop_assert_eq!(settled.status == InvoiceStatus::Paid, sum >= amount);
            prop_assert_eq!(settled.paid_at.is_some(), settled.status == InvoiceStatus::Paid);
        }

        #[test]
        fn settlement_is_idempotent_and_order_independent((amount, payments) in ledger()) {
            let once = settle(amount, &payments).unwrap();
            let again = settle(amount, &payments).unwrap();
            prop_assert_eq!(once, again);

            let mut reversed = payments.clone();
            reversed.reverse();
            prop_assert_eq!(settle(amount, &reversed).unwrap(), once);
        }

        #[test]
        fn paid_at_is_a_payment_timestamp((amount, payments) in ledger()) {
            let settled = settle(amount, &payments).unwrap();
            if let Some(paid_at) = settled.paid_at {
                prop_assert!(payments.iter().any(|p| p.paid_at == paid_at));
            }
        }
    }
}
