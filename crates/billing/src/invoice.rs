use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use hap_core::{AppointmentId, DomainError, DomainResult, InvoiceId, PatientId};

use crate::events::{StatusTransition, TransitionSource};
use crate::reconcile::Settlement;
use crate::timestamp;

/// Days until an invoice falls due when the caller does not say.
pub const DEFAULT_DUE_DAYS: i64 = 14;

/// Invoice payment status.
///
/// Serialized as `unpaid`, `partially-paid`, `paid`. No other spelling is
/// accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvoiceStatus {
    Unpaid,
    PartiallyPaid,
    Paid,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Unpaid => "unpaid",
            InvoiceStatus::PartiallyPaid => "partially-paid",
            InvoiceStatus::Paid => "paid",
        }
    }
}

impl core::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for InvoiceStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unpaid" => Ok(InvoiceStatus::Unpaid),
            "partially-paid" => Ok(InvoiceStatus::PartiallyPaid),
            "paid" => Ok(InvoiceStatus::Paid),
            other => Err(DomainError::validation(format!("unknown invoice status {other:?}"))),
        }
    }
}

/// An invoice billed to a patient.
///
/// `status` and `paid_at` are owned by the reconciliation rules: they change
/// through [`Invoice::apply_settlement`] (ledger-driven) or
/// [`Invoice::mark_paid`] (administrative override), never through field edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub patient_id: PatientId,
    pub appointment_id: Option<AppointmentId>,
    pub amount: Decimal,
    pub status: InvoiceStatus,
    pub due_date: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub notes: String,
}

impl Invoice {
    /// Write a ledger-derived settlement onto the invoice.
    pub fn apply_settlement(&mut self, settlement: &Settlement) -> StatusTransition {
        let from = self.status;
        self.status = settlement.status;
        self.paid_at = settlement.paid_at;
        StatusTransition::new(TransitionSource::Ledger, from, self.status)
    }

    /// Force the paid state regardless of the ledger.
    pub fn mark_paid(&mut self, paid_at: DateTime<Utc>) -> StatusTransition {
        let from = self.status;
        self.status = InvoiceStatus::Paid;
        self.paid_at = Some(paid_at);
        StatusTransition::new(TransitionSource::Override, from, self.status)
    }
}

/// Input for creating an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInvoice {
    pub patient_id: PatientId,
    #[serde(default)]
    pub appointment_id: Option<AppointmentId>,
    pub amount: Decimal,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: String,
}

impl NewInvoice {
    pub fn new(patient_id: PatientId, amount: Decimal) -> Self {
        Self {
            patient_id,
            appointment_id: None,
            amount,
            due_date: None,
            notes: String::new(),
        }
    }

    /// Validate and build an `unpaid` invoice issued at `issued_at`.
    pub fn into_invoice(self, id: InvoiceId, issued_at: DateTime<Utc>) -> DomainResult<Invoice> {
        ensure_positive_amount(self.amount)?;

        let due_date = timestamp::supplied(self.due_date)
            .unwrap_or_else(|| issued_at + Duration::days(DEFAULT_DUE_DAYS));

        Ok(Invoice {
            id,
            patient_id: self.patient_id,
            appointment_id: self.appointment_id,
            amount: self.amount,
            status: InvoiceStatus::Unpaid,
            due_date,
            issued_at,
            paid_at: None,
            notes: self.notes,
        })
    }
}

/// Direct edits to an invoice. Status is left as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceDetailsUpdate {
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
}

impl InvoiceDetailsUpdate {
    pub fn is_empty(&self) -> bool {
        self.amount.is_none() && self.notes.is_none() && self.due_date.is_none()
    }

    pub fn apply(self, invoice: &mut Invoice) -> DomainResult<()> {
        if let Some(amount) = self.amount {
            ensure_positive_amount(amount)?;
            invoice.amount = amount;
        }
        if let Some(notes) = self.notes {
            invoice.notes = notes;
        }
        if let Some(due_date) = timestamp::supplied(self.due_date) {
            invoice.due_date = due_date;
        }
        Ok(())
    }
}

fn ensure_positive_amount(amount: Decimal) -> DomainResult<()> {
    if amount <= Decimal::ZERO {
        return Err(DomainError::validation("invoice amount must be greater than zero"));
    }
    Ok(())
}

/// Invoice listing filter. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvoiceFilter {
    pub patient_id: Option<PatientId>,
    pub status: Option<InvoiceStatus>,
    /// Inclusive lower bound on `issued_at`.
    pub issued_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `issued_at`.
    pub issued_to: Option<DateTime<Utc>>,
}

impl InvoiceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_patient(patient_id: PatientId) -> Self {
        Self {
            patient_id: Some(patient_id),
            ..Self::default()
        }
    }

    pub fn with_status(status: InvoiceStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn issued_between(from: DateTime<Utc>, to: DateTime<Utc>) -> DomainResult<Self> {
        if from > to {
            return Err(DomainError::validation("date range start is after its end"));
        }
        Ok(Self {
            issued_from: Some(from),
            issued_to: Some(to),
            ..Self::default()
        })
    }

    pub fn matches(&self, invoice: &Invoice) -> bool {
        self.patient_id.is_none_or(|p| invoice.patient_id == p)
            && self.status.is_none_or(|s| invoice.status == s)
            && self.issued_from.is_none_or(|from| invoice.issued_at >= from)
            && self.issued_to.is_none_or(|to| invoice.issued_at <= to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn test_invoice() -> Invoice {
        NewInvoice::new(PatientId::new(), dec!(100))
            .into_invoice(InvoiceId::new(), test_time())
            .unwrap()
    }

    #[test]
    fn new_invoice_starts_unpaid_and_due_in_fourteen_days() {
        let invoice = test_invoice();
        assert_eq!(invoice.status, InvoiceStatus::Unpaid);
        assert_eq!(invoice.paid_at, None);
        assert_eq!(invoice.due_date, test_time() + Duration::days(14));
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        for amount in [dec!(0), dec!(-5)] {
            let err = NewInvoice::new(PatientId::new(), amount)
                .into_invoice(InvoiceId::new(), test_time())
                .unwrap_err();
            assert!(matches!(err, DomainError::Validation(_)));
        }
    }

    #[test]
    fn status_parsing_is_strict() {
        assert_eq!("partially-paid".parse::<InvoiceStatus>().unwrap(), InvoiceStatus::PartiallyPaid);
        assert!("partiallypaid".parse::<InvoiceStatus>().is_err());
        assert!("Paid".parse::<InvoiceStatus>().is_err());
        assert!(serde_json::from_str::<InvoiceStatus>("\"partiallypaid\"").is_err());
        assert_eq!(serde_json::to_string(&InvoiceStatus::PartiallyPaid).unwrap(), "\"partially-paid\"");
    }

    #[test]
    fn detail_edits_leave_status_alone() {
        let mut invoice = test_invoice();
        invoice.mark_paid(test_time());

        InvoiceDetailsUpdate {
            amount: Some(dec!(250)),
            notes: Some("adjusted".into()),
            due_date: None,
        }
        .apply(&mut invoice)
        .unwrap();

        assert_eq!(invoice.amount, dec!(250));
        assert_eq!(invoice.notes, "adjusted");
        assert_eq!(invoice.status, InvoiceStatus::Paid);
    }

    #[test]
    fn detail_edit_rejects_zero_amount() {
        let mut invoice = test_invoice();
        let update = InvoiceDetailsUpdate {
            amount: Some(Decimal::ZERO),
            ..InvoiceDetailsUpdate::default()
        };
        assert!(update.apply(&mut invoice).is_err());
        assert_eq!(invoice.amount, dec!(100));
    }

    #[test]
    fn override_is_distinguished_from_ledger_transition() {
        let mut invoice = test_invoice();
        let transition = invoice.mark_paid(test_time());
        assert_eq!(transition.source, TransitionSource::Override);
        assert_eq!(transition.from, InvoiceStatus::Unpaid);
        assert_eq!(invoice.paid_at, Some(test_time()));
    }

    #[test]
    fn filter_matches_inclusive_issue_range() {
        let invoice = test_invoice();
        let exact = InvoiceFilter::issued_between(test_time(), test_time()).unwrap();
        assert!(exact.matches(&invoice));

        let later = InvoiceFilter::issued_between(test_time() + Duration::seconds(1), test_time() + Duration::days(1)).unwrap();
        assert!(!later.matches(&invoice));

        assert!(InvoiceFilter::issued_between(test_time(), test_time() - Duration::days(1)).is_err());
        assert!(InvoiceFilter::for_patient(invoice.patient_id).matches(&invoice));
        assert!(!InvoiceFilter::with_status(InvoiceStatus::Paid).matches(&invoice));
    }
}
