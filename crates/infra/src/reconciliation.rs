//! Billing reconciliation engine.
//!
//! Keeps every invoice's `status` / `paid_at` consistent with its payment
//! ledger. Each payment mutation runs one ledger transaction:
//!
//! ```text
//! validate input
//!   ↓
//! begin → lock invoice row
//!   ↓
//! insert / update / delete payment
//!   ↓
//! re-read the invoice's payments → settle → write status
//!   ↓
//! commit
//!   ↓
//! emit event (outside the transaction, bounded, best-effort)
//! ```
//!
//! Validation failures are returned before anything is written, persistence
//! failures abort the whole transaction, and publish failures are reported in
//! [`LedgerOutcome::notification`] without undoing the committed change.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, instrument, warn};

use hap_billing::{
    BillingEvent, Invoice, InvoiceDetailsUpdate, InvoiceFilter, InvoiceMarkedPaid, InvoiceSummary,
    NewInvoice, Payment, PaymentChange, PaymentSummary, PaymentUpdate, RecordPayment,
    StatusTransition, settle, timestamp,
};
use hap_core::{DomainError, ErrorKind, InvoiceId, PaymentId};
use hap_events::Event;

use crate::ledger_store::{LedgerStore, LedgerTx, StoreError};
use crate::messaging::PublisherPool;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Persistence(#[from] StoreError),
}

impl BillingError {
    fn invoice_not_found(id: InvoiceId) -> Self {
        Self::NotFound {
            entity: "invoice",
            id: id.to_string(),
        }
    }

    fn payment_not_found(id: PaymentId) -> Self {
        Self::NotFound {
            entity: "payment",
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::NotFound { .. } => ErrorKind::NotFound,
            BillingError::Validation(_) => ErrorKind::Validation,
            BillingError::Persistence(err) => err.kind(),
        }
    }
}

impl From<DomainError> for BillingError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg)
            | DomainError::InvariantViolation(msg)
            | DomainError::InvalidId(msg) => BillingError::Validation(msg),
            DomainError::NotFound => BillingError::NotFound {
                entity: "record",
                id: String::new(),
            },
        }
    }
}

/// What happened to the event announcing a committed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Published { topic: String, position: String },
    /// The change is committed, but nobody was told.
    Failed { topic: String, reason: String },
    /// The operation does not announce anything.
    Skipped,
}

impl Notification {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Notification::Published { .. })
    }
}

/// Result of a ledger mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerOutcome {
    pub invoice: Invoice,
    /// The payment recorded, updated or deleted, if any.
    pub payment: Option<Payment>,
    pub total_paid: Decimal,
    pub transition: StatusTransition,
    pub notification: Notification,
}

pub struct ReconciliationEngine<S> {
    store: S,
    publisher: Arc<PublisherPool>,
}

impl<S> core::fmt::Debug for ReconciliationEngine<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("publisher", &self.publisher)
            .finish_non_exhaustive()
    }
}

impl<S> ReconciliationEngine<S>
where
    S: LedgerStore,
{
    pub fn new(store: S, publisher: Arc<PublisherPool>) -> Self {
        Self { store, publisher }
    }

    // ---------------------------------------------------------------------
    // Invoices
    // ---------------------------------------------------------------------

    #[instrument(skip(self, new), fields(patient_id = %new.patient_id), err)]
    pub async fn create_invoice(&self, new: NewInvoice) -> Result<Invoice, BillingError> {
        let invoice = new.into_invoice(InvoiceId::new(), timestamp::now())?;
        self.store.insert_invoice(&invoice).await?;

        info!(invoice_id = %invoice.id, amount = %invoice.amount, "invoice created");
        Ok(invoice)
    }

    /// Edit amount, notes or due date. Status is not recomputed; use
    /// [`Self::reconcile_invoice`] for that.
    #[instrument(skip(self, update), err)]
    pub async fn edit_invoice(
        &self,
        id: InvoiceId,
        update: InvoiceDetailsUpdate,
    ) -> Result<Invoice, BillingError> {
        let mut tx = self.store.begin().await?;
        let mut invoice = tx
            .lock_invoice(id)
            .await?
            .ok_or_else(|| BillingError::invoice_not_found(id))?;

        if update.is_empty() {
            tx.rollback().await?;
            return Ok(invoice);
        }

        update.apply(&mut invoice)?;
        tx.update_invoice(&invoice).await?;
        tx.commit().await?;

        info!(invoice_id = %id, "invoice edited");
        Ok(invoice)
    }

    /// Delete an invoice together with its payments.
    #[instrument(skip(self), err)]
    pub async fn delete_invoice(&self, id: InvoiceId) -> Result<(), BillingError> {
        let mut tx = self.store.begin().await?;
        if tx.lock_invoice(id).await?.is_none() || !tx.delete_invoice(id).await? {
            return Err(BillingError::invoice_not_found(id));
        }
        tx.commit().await?;

        info!(invoice_id = %id, "invoice deleted");
        Ok(())
    }

    pub async fn invoice(&self, id: InvoiceId) -> Result<Invoice, BillingError> {
        self.store
            .invoice(id)
            .await?
            .ok_or_else(|| BillingError::invoice_not_found(id))
    }

    pub async fn invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, BillingError> {
        Ok(self.store.invoices(filter).await?)
    }

    // ---------------------------------------------------------------------
    // Payments
    // ---------------------------------------------------------------------

    pub async fn payment(&self, id: PaymentId) -> Result<Payment, BillingError> {
        self.store
            .payment(id)
            .await?
            .ok_or_else(|| BillingError::payment_not_found(id))
    }

    pub async fn payments(&self, invoice_id: Option<InvoiceId>) -> Result<Vec<Payment>, BillingError> {
        Ok(self.store.payments(invoice_id).await?)
    }

    #[instrument(skip(self, cmd), fields(invoice_id = %cmd.invoice_id, amount = %cmd.amount), err)]
    pub async fn record_payment(&self, cmd: RecordPayment) -> Result<LedgerOutcome, BillingError> {
        let invoice_id = cmd.invoice_id;
        let payment = cmd.into_payment(PaymentId::new(), timestamp::now())?;

        let mut tx = self.store.begin().await?;
        let invoice = tx
            .lock_invoice(invoice_id)
            .await?
            .ok_or_else(|| BillingError::invoice_not_found(invoice_id))?;

        tx.insert_payment(&payment).await?;
        let (invoice, total_paid, transition) = resettle(tx.as_mut(), invoice).await?;
        tx.commit().await?;

        info!(
            payment_id = %payment.id,
            status = %invoice.status,
            total_paid = %total_paid,
            "payment recorded"
        );

        let event = BillingEvent::PaymentRecorded(PaymentChange {
            invoice: InvoiceSummary::of(&invoice, total_paid),
            payment: PaymentSummary::from(&payment),
            transition,
        });
        let notification = self.notify(&event).await;

        Ok(LedgerOutcome {
            invoice,
            payment: Some(payment),
            total_paid,
            transition,
            notification,
        })
    }

    #[instrument(skip(self, update), err)]
    pub async fn update_payment(
        &self,
        id: PaymentId,
        update: PaymentUpdate,
    ) -> Result<LedgerOutcome, BillingError> {
        let invoice_id = self.payment(id).await?.invoice_id;

        let mut tx = self.store.begin().await?;
        let invoice = tx
            .lock_invoice(invoice_id)
            .await?
            .ok_or_else(|| BillingError::invoice_not_found(invoice_id))?;

        // Re-read under the invoice lock; the unlocked read only found the invoice.
        let mut payment = tx
            .payment(id)
            .await?
            .ok_or_else(|| BillingError::payment_not_found(id))?;
        update.apply(&mut payment)?;

        if !tx.update_payment(&payment).await? {
            return Err(BillingError::payment_not_found(id));
        }
        let (invoice, total_paid, transition) = resettle(tx.as_mut(), invoice).await?;
        tx.commit().await?;

        info!(
            invoice_id = %invoice.id,
            status = %invoice.status,
            total_paid = %total_paid,
            "payment updated"
        );

        let event = BillingEvent::PaymentUpdated(PaymentChange {
            invoice: InvoiceSummary::of(&invoice, total_paid),
            payment: PaymentSummary::from(&payment),
            transition,
        });
        let notification = self.notify(&event).await;

        Ok(LedgerOutcome {
            invoice,
            payment: Some(payment),
            total_paid,
            transition,
            notification,
        })
    }

    #[instrument(skip(self), err)]
    pub async fn delete_payment(&self, id: PaymentId) -> Result<LedgerOutcome, BillingError> {
        let invoice_id = self.payment(id).await?.invoice_id;

        let mut tx = self.store.begin().await?;
        let invoice = tx
            .lock_invoice(invoice_id)
            .await?
            .ok_or_else(|| BillingError::invoice_not_found(invoice_id))?;

        let payment = tx
            .payment(id)
            .await?
            .ok_or_else(|| BillingError::payment_not_found(id))?;
        if !tx.delete_payment(id).await? {
            return Err(BillingError::payment_not_found(id));
        }
        let (invoice, total_paid, transition) = resettle(tx.as_mut(), invoice).await?;
        tx.commit().await?;

        info!(
            invoice_id = %invoice.id,
            status = %invoice.status,
            total_paid = %total_paid,
            "payment deleted"
        );

        let event = BillingEvent::PaymentDeleted(PaymentChange {
            invoice: InvoiceSummary::of(&invoice, total_paid),
            payment: PaymentSummary::from(&payment),
            transition,
        });
        let notification = self.notify(&event).await;

        Ok(LedgerOutcome {
            invoice,
            payment: Some(payment),
            total_paid,
            transition,
            notification,
        })
    }

    /// Administrative override: force `paid` regardless of the ledger.
    ///
    /// `paid_at` defaults to now when absent or zero. The next ledger-driven
    /// recomputation on the invoice replaces the override.
    #[instrument(skip(self), err)]
    pub async fn mark_invoice_paid(
        &self,
        id: InvoiceId,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<LedgerOutcome, BillingError> {
        let paid_at = timestamp::supplied(paid_at).unwrap_or_else(timestamp::now);

        let mut tx = self.store.begin().await?;
        let mut invoice = tx
            .lock_invoice(id)
            .await?
            .ok_or_else(|| BillingError::invoice_not_found(id))?;

        let total_paid = settle(invoice.amount, &tx.payments_for(id).await?)?.total_paid;
        let transition = invoice.mark_paid(paid_at);
        tx.update_invoice(&invoice).await?;
        tx.commit().await?;

        info!(
            invoice_id = %id,
            source = transition.source.as_str(),
            from = %transition.from,
            total_paid = %total_paid,
            "invoice marked paid"
        );

        let event = BillingEvent::InvoiceMarkedPaid(InvoiceMarkedPaid {
            invoice: InvoiceSummary::of(&invoice, total_paid),
            transition,
        });
        let notification = self.notify(&event).await;

        Ok(LedgerOutcome {
            invoice,
            payment: None,
            total_paid,
            transition,
            notification,
        })
    }

    /// Re-derive status from the ledger without mutating payments. Emits
    /// nothing; repairs invoices whose announcement was lost or whose amount
    /// was edited.
    #[instrument(skip(self), err)]
    pub async fn reconcile_invoice(&self, id: InvoiceId) -> Result<LedgerOutcome, BillingError> {
        let mut tx = self.store.begin().await?;
        let invoice = tx
            .lock_invoice(id)
            .await?
            .ok_or_else(|| BillingError::invoice_not_found(id))?;

        let (invoice, total_paid, transition) = resettle(tx.as_mut(), invoice).await?;
        tx.commit().await?;

        if transition.changed() {
            info!(
                invoice_id = %id,
                from = %transition.from,
                to = %transition.to,
                "invoice status corrected"
            );
        }

        Ok(LedgerOutcome {
            invoice,
            payment: None,
            total_paid,
            transition,
            notification: Notification::Skipped,
        })
    }

    async fn notify(&self, event: &BillingEvent) -> Notification {
        match self.publisher.emit(event).await {
            Ok(receipt) => Notification::Published {
                topic: receipt.topic,
                position: receipt.position,
            },
            Err(err) => {
                warn!(
                    invoice_id = %event.invoice().invoice_id,
                    event_type = event.event_type(),
                    error = %err,
                    "ledger change committed without notification"
                );
                Notification::Failed {
                    topic: event.topic().to_string(),
                    reason: err.to_string(),
                }
            }
        }
    }
}

/// Recompute the invoice from the payments visible in `tx` and stage the
/// result. The caller must hold the invoice lock.
async fn resettle(
    tx: &mut dyn LedgerTx,
    mut invoice: Invoice,
) -> Result<(Invoice, Decimal, StatusTransition), BillingError> {
    let payments = tx.payments_for(invoice.id).await?;
    let settlement = settle(invoice.amount, &payments)?;
    let transition = invoice.apply_settlement(&settlement);

    if !tx.update_invoice(&invoice).await? {
        return Err(BillingError::invoice_not_found(invoice.id));
    }
    Ok((invoice, settlement.total_paid, transition))
}
