//! Durable record of invoices and payments.
//!
//! The store exposes two surfaces:
//!
//! - [`LedgerStore`]: plain reads and invoice creation, no locking.
//! - [`LedgerTx`]: a transaction that serializes all work on an invoice behind
//!   its row lock ([`LedgerTx::lock_invoice`]). Reads made through the
//!   transaction see its own staged writes.
//!
//! Every payment mutation runs as lock invoice → mutate payment → re-read the
//! invoice's payments → write the derived status → commit, so two writers on
//! the same invoice can never both recompute from a stale aggregate.
//!
//! Dropping a transaction without committing rolls it back.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use hap_billing::{Invoice, InvoiceFilter, Payment};
use hap_core::{ErrorKind, InvoiceId, PaymentId};

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A payment referenced an invoice that does not exist.
    #[error("foreign key violation: {0}")]
    ForeignKey(String),

    /// A row failed a schema constraint (e.g. non-positive amount).
    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("database error in {operation}: {message}")]
    Database { operation: String, message: String },

    /// A stored row could not be mapped back into the domain.
    #[error("failed to decode row: {0}")]
    Decode(String),

    #[error("ledger lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn database(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::ForeignKey(_) => ErrorKind::NotFound,
            StoreError::Constraint(_) => ErrorKind::Validation,
            StoreError::Database { .. } | StoreError::Decode(_) | StoreError::Poisoned => {
                ErrorKind::Persistence
            }
        }
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError>;

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError>;

    async fn invoice(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError>;

    /// Invoices matching `filter`, newest issued first.
    async fn invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, StoreError>;

    async fn payment(&self, id: PaymentId) -> Result<Option<Payment>, StoreError>;

    /// Payments, optionally for one invoice, newest first.
    async fn payments(&self, invoice_id: Option<InvoiceId>) -> Result<Vec<Payment>, StoreError>;
}

#[async_trait]
pub trait LedgerTx: Send {
    /// Take the invoice's row lock for the rest of the transaction and return
    /// its current state. Re-locking an invoice already held is a no-op.
    async fn lock_invoice(&mut self, id: InvoiceId) -> Result<Option<Invoice>, StoreError>;

    async fn payment(&mut self, id: PaymentId) -> Result<Option<Payment>, StoreError>;

    async fn payments_for(&mut self, invoice_id: InvoiceId) -> Result<Vec<Payment>, StoreError>;

    async fn insert_payment(&mut self, payment: &Payment) -> Result<(), StoreError>;

    /// Overwrite amount, method, date and notes. Returns `false` if absent.
    async fn update_payment(&mut self, payment: &Payment) -> Result<bool, StoreError>;

    async fn delete_payment(&mut self, id: PaymentId) -> Result<bool, StoreError>;

    /// Overwrite every mutable invoice column (status, paid_at, amount, due
    /// date, notes). Returns `false` if absent.
    async fn update_invoice(&mut self, invoice: &Invoice) -> Result<bool, StoreError>;

    /// Delete an invoice and, with it, its payments.
    async fn delete_invoice(&mut self, id: InvoiceId) -> Result<bool, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        (**self).begin().await
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        (**self).insert_invoice(invoice).await
    }

    async fn invoice(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        (**self).invoice(id).await
    }

    async fn invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, StoreError> {
        (**self).invoices(filter).await
    }

    async fn payment(&self, id: PaymentId) -> Result<Option<Payment>, StoreError> {
        (**self).payment(id).await
    }

    async fn payments(&self, invoice_id: Option<InvoiceId>) -> Result<Vec<Payment>, StoreError> {
        (**self).payments(invoice_id).await
    }
}
