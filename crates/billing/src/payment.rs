use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use hap_core::{DomainError, DomainResult, InvoiceId, PaymentId};

use crate::timestamp;

/// How a payment was made ("cash", "card", "insurance", ...). Never blank.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PaymentMethod(String);

impl PaymentMethod {
    pub fn parse(raw: impl Into<String>) -> DomainResult<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("payment method is required"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PaymentMethod {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<PaymentMethod> for String {
    fn from(value: PaymentMethod) -> Self {
        value.0
    }
}

impl core::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A payment against exactly one invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub invoice_id: InvoiceId,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub paid_at: DateTime<Utc>,
    pub notes: String,
}

/// Command: record a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPayment {
    pub invoice_id: InvoiceId,
    pub amount: Decimal,
    pub method: String,
    /// Payment date; absent or zero means "now".
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: String,
}

impl RecordPayment {
    pub fn new(invoice_id: InvoiceId, amount: Decimal, method: impl Into<String>) -> Self {
        Self {
            invoice_id,
            amount,
            method: method.into(),
            paid_at: None,
            notes: String::new(),
        }
    }

    pub fn into_payment(self, id: PaymentId, now: DateTime<Utc>) -> DomainResult<Payment> {
        ensure_positive_amount(self.amount)?;

        Ok(Payment {
            id,
            invoice_id: self.invoice_id,
            amount: self.amount,
            method: PaymentMethod::parse(self.method)?,
            paid_at: timestamp::supplied(self.paid_at).unwrap_or(now),
            notes: self.notes,
        })
    }
}

/// Command: change fields of an existing payment. The invoice reference is fixed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentUpdate {
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl PaymentUpdate {
    /// Validate every field before touching `payment`.
    pub fn apply(self, payment: &mut Payment) -> DomainResult<()> {
        if let Some(amount) = self.amount {
            ensure_positive_amount(amount)?;
        }
        let method = self.method.map(PaymentMethod::parse).transpose()?;

        if let Some(amount) = self.amount {
            payment.amount = amount;
        }
        if let Some(method) = method {
            payment.method = method;
        }
        if let Some(paid_at) = timestamp::supplied(self.paid_at) {
            payment.paid_at = paid_at;
        }
        if let Some(notes) = self.notes {
            payment.notes = notes;
        }
        Ok(())
    }
}

fn ensure_positive_amount(amount: Decimal) -> DomainResult<()> {
    if amount <= Decimal::ZERO {
        return Err(DomainError::validation("payment amount must be greater than zero"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn test_payment() -> Payment {
        RecordPayment::new(InvoiceId::new(), dec!(40), "cash")
            .into_payment(PaymentId::new(), test_time())
            .unwrap()
    }

    #[test]
    fn record_defaults_payment_date_to_now() {
        let payment = test_payment();
        assert_eq!(payment.paid_at, test_time());
        assert_eq!(payment.method.as_str(), "cash");
    }

    #[test]
    fn record_keeps_supplied_payment_date() {
        let backdated = test_time() - chrono::Duration::days(2);
        let mut cmd = RecordPayment::new(InvoiceId::new(), dec!(10), "card");
        cmd.paid_at = Some(backdated);

        let payment = cmd.into_payment(PaymentId::new(), test_time()).unwrap();
        assert_eq!(payment.paid_at, backdated);
    }

    #[test]
    fn record_rejects_bad_input() {
        let zero = RecordPayment::new(InvoiceId::new(), Decimal::ZERO, "cash");
        assert!(zero.into_payment(PaymentId::new(), test_time()).is_err());

        let blank = RecordPayment::new(InvoiceId::new(), dec!(5), "   ");
        assert!(blank.into_payment(PaymentId::new(), test_time()).is_err());
    }

    #[test]
    fn update_is_all_or_nothing() {
        let mut payment = test_payment();
        let update = PaymentUpdate {
            amount: Some(dec!(75)),
            method: Some(" ".into()),
            ..PaymentUpdate::default()
        };

        assert!(update.apply(&mut payment).is_err());
        assert_eq!(payment.amount, dec!(40));
    }

    #[test]
    fn update_changes_only_given_fields() {
        let mut payment = test_payment();
        PaymentUpdate {
            amount: Some(dec!(60)),
            notes: Some("corrected".into()),
            ..PaymentUpdate::default()
        }
        .apply(&mut payment)
        .unwrap();

        assert_eq!(payment.amount, dec!(60));
        assert_eq!(payment.notes, "corrected");
        assert_eq!(payment.method.as_str(), "cash");
    }

    #[test]
    fn method_deserialization_validates() {
        assert!(serde_json::from_str::<PaymentMethod>("\"\"").is_err());
        assert_eq!(serde_json::from_str::<PaymentMethod>("\" card \"").unwrap().as_str(), "card");
    }
}
