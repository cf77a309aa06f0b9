//! Billing lifecycle events.
//!
//! Every event is keyed by its invoice id so that, within a partition, the
//! events of one invoice are observed in the order they were committed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use hap_core::{InvoiceId, PatientId, PaymentId};
use hap_events::{Envelope, Event, topic};

use crate::invoice::{Invoice, InvoiceStatus};
use crate::payment::Payment;

/// What moved the invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionSource {
    /// Recomputed from the payment ledger.
    Ledger,
    /// Administrative mark-as-paid.
    Override,
}

impl TransitionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionSource::Ledger => "ledger",
            TransitionSource::Override => "override",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub source: TransitionSource,
    pub from: InvoiceStatus,
    pub to: InvoiceStatus,
}

impl StatusTransition {
    pub fn new(source: TransitionSource, from: InvoiceStatus, to: InvoiceStatus) -> Self {
        Self { source, from, to }
    }

    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceSummary {
    pub invoice_id: InvoiceId,
    pub patient_id: PatientId,
    pub amount: Decimal,
    pub total_paid: Decimal,
    pub status: InvoiceStatus,
    pub paid_at: Option<DateTime<Utc>>,
}

impl InvoiceSummary {
    pub fn of(invoice: &Invoice, total_paid: Decimal) -> Self {
        Self {
            invoice_id: invoice.id,
            patient_id: invoice.patient_id,
            amount: invoice.amount,
            total_paid,
            status: invoice.status,
            paid_at: invoice.paid_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSummary {
    pub payment_id: PaymentId,
    pub amount: Decimal,
    pub method: String,
    pub paid_at: DateTime<Utc>,
}

impl From<&Payment> for PaymentSummary {
    fn from(payment: &Payment) -> Self {
        Self {
            payment_id: payment.id,
            amount: payment.amount,
            method: payment.method.to_string(),
            paid_at: payment.paid_at,
        }
    }
}

/// Payload shared by the three payment events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentChange {
    pub invoice: InvoiceSummary,
    pub payment: PaymentSummary,
    pub transition: StatusTransition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceMarkedPaid {
    pub invoice: InvoiceSummary,
    pub transition: StatusTransition,
}

/// Billing events. The envelope `event_type` carries the variant; the
/// serialized payload is the inner struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum BillingEvent {
    PaymentRecorded(PaymentChange),
    PaymentUpdated(PaymentChange),
    PaymentDeleted(PaymentChange),
    InvoiceMarkedPaid(InvoiceMarkedPaid),
}

impl BillingEvent {
    pub const PAYMENT_RECORDED: &'static str = "payment.recorded";
    pub const PAYMENT_UPDATED: &'static str = "payment.updated";
    pub const PAYMENT_DELETED: &'static str = "payment.deleted";
    pub const INVOICE_MARKED_PAID: &'static str = "invoice.marked_paid";

    pub fn invoice(&self) -> &InvoiceSummary {
        match self {
            BillingEvent::PaymentRecorded(c)
            | BillingEvent::PaymentUpdated(c)
            | BillingEvent::PaymentDeleted(c) => &c.invoice,
            BillingEvent::InvoiceMarkedPaid(m) => &m.invoice,
        }
    }

    pub fn transition(&self) -> &StatusTransition {
        match self {
            BillingEvent::PaymentRecorded(c)
            | BillingEvent::PaymentUpdated(c)
            | BillingEvent::PaymentDeleted(c) => &c.transition,
            BillingEvent::InvoiceMarkedPaid(m) => &m.transition,
        }
    }

    /// Rebuild a typed event from a decoded envelope.
    ///
    /// Returns `Ok(None)` when the envelope carries a non-billing event type.
    pub fn from_envelope(envelope: &Envelope) -> Result<Option<Self>, serde_json::Error> {
        let data = envelope.data().clone();
        let event = match envelope.event_type() {
            Self::PAYMENT_RECORDED => BillingEvent::PaymentRecorded(serde_json::from_value(data)?),
            Self::PAYMENT_UPDATED => BillingEvent::PaymentUpdated(serde_json::from_value(data)?),
            Self::PAYMENT_DELETED => BillingEvent::PaymentDeleted(serde_json::from_value(data)?),
            Self::INVOICE_MARKED_PAID => BillingEvent::InvoiceMarkedPaid(serde_json::from_value(data)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

impl Event for BillingEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BillingEvent::PaymentRecorded(_) => Self::PAYMENT_RECORDED,
            BillingEvent::PaymentUpdated(_) => Self::PAYMENT_UPDATED,
            BillingEvent::PaymentDeleted(_) => Self::PAYMENT_DELETED,
            BillingEvent::InvoiceMarkedPaid(_) => Self::INVOICE_MARKED_PAID,
        }
    }

    fn topic(&self) -> &'static str {
        match self {
            BillingEvent::PaymentRecorded(_) => topic::PAYMENTS_RECORDED,
            BillingEvent::PaymentUpdated(_) => topic::PAYMENTS_UPDATED,
            BillingEvent::PaymentDeleted(_) => topic::PAYMENTS_DELETED,
            BillingEvent::InvoiceMarkedPaid(_) => topic::INVOICES_MARKED_PAID,
        }
    }

    fn partition_key(&self) -> String {
        self.invoice().invoice_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hap_events::{decode, encode};
    use rust_decimal_macros::dec;

    use crate::invoice::NewInvoice;
    use crate::payment::RecordPayment;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn recorded() -> BillingEvent {
        let invoice = NewInvoice::new(PatientId::new(), dec!(100))
            .into_invoice(InvoiceId::new(), test_time())
            .unwrap();
        let payment = RecordPayment::new(invoice.id, dec!(40), "cash")
            .into_payment(PaymentId::new(), test_time())
            .unwrap();

        BillingEvent::PaymentRecorded(PaymentChange {
            invoice: InvoiceSummary::of(&invoice, dec!(40)),
            payment: PaymentSummary::from(&payment),
            transition: StatusTransition::new(
                TransitionSource::Ledger,
                InvoiceStatus::Unpaid,
                InvoiceStatus::PartiallyPaid,
            ),
        })
    }

    #[test]
    fn routes_by_variant_and_keys_by_invoice() {
        let event = recorded();
        assert_eq!(event.topic(), "payments.recorded");
        assert_eq!(event.event_type(), "payment.recorded");
        assert_eq!(event.partition_key(), event.invoice().invoice_id.to_string());
    }

    #[test]
    fn payload_is_untagged_with_lowercase_source() {
        let value = serde_json::to_value(recorded()).unwrap();
        assert_eq!(value["transition"]["source"], "ledger");
        assert_eq!(value["transition"]["to"], "partially-paid");
        assert_eq!(value["invoice"]["amount"], "100");
        assert!(value.get("PaymentRecorded").is_none());
    }

    #[test]
    fn rebuilds_from_envelope() {
        let event = recorded();
        let bytes = encode(event.event_type(), &event).unwrap();
        let envelope = decode(&bytes).unwrap();

        assert_eq!(BillingEvent::from_envelope(&envelope).unwrap(), Some(event));
    }

    #[test]
    fn foreign_event_types_are_not_billing_events() {
        let bytes = encode("appointment.created", &serde_json::json!({"x": 1})).unwrap();
        let envelope = decode(&bytes).unwrap();
        assert_eq!(BillingEvent::from_envelope(&envelope).unwrap(), None);
    }
}
