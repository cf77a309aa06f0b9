//! In-memory ledger store for tests/dev.
//!
//! Row locks are per-invoice async mutexes held by the transaction until it
//! commits or is dropped; a lock nobody holds or waits on is forgotten. Writes
//! are staged in the transaction and applied to the shared ledger in one step
//! on commit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use hap_billing::{Invoice, InvoiceFilter, Payment};
use hap_core::{InvoiceId, PaymentId};

use super::{LedgerStore, LedgerTx, StoreError};

#[derive(Debug, Default)]
struct Ledger {
    invoices: HashMap<InvoiceId, Invoice>,
    payments: HashMap<PaymentId, Payment>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    ledger: Arc<RwLock<Ledger>>,
    row_locks: Arc<Mutex<HashMap<InvoiceId, Arc<RowLock<()>>>>>,
    failing_commits: Arc<AtomicU32>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail (nothing is applied).
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    fn row_lock(&self, id: InvoiceId) -> Result<Arc<RowLock<()>>, StoreError> {
        let mut locks = self.row_locks.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(Arc::clone(locks.entry(id).or_default()))
    }

    /// Release `held` row locks and forget the ones no other transaction
    /// is holding or waiting on.
    fn release(&self, held: HashMap<InvoiceId, OwnedMutexGuard<()>>) {
        let ids: Vec<InvoiceId> = held.keys().copied().collect();
        drop(held);

        let Ok(mut locks) = self.row_locks.lock() else {
            return;
        };
        for id in ids {
            if locks.get(&id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(&id);
            }
        }
    }

    fn take_commit_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn read<R>(&self, f: impl FnOnce(&Ledger) -> R) -> Result<R, StoreError> {
        let ledger = self.ledger.read().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&ledger))
    }
}

fn newest_invoices_first(a: &Invoice, b: &Invoice) -> std::cmp::Ordering {
    b.issued_at.cmp(&a.issued_at).then_with(|| b.id.cmp(&a.id))
}

fn newest_payments_first(a: &Payment, b: &Payment) -> std::cmp::Ordering {
    b.paid_at.cmp(&a.paid_at).then_with(|| b.id.cmp(&a.id))
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        Ok(Box::new(InMemoryLedgerTx {
            store: self.clone(),
            held: HashMap::new(),
            invoices: HashMap::new(),
            payments: HashMap::new(),
        }))
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        let mut ledger = self.ledger.write().map_err(|_| StoreError::Poisoned)?;
        if ledger.invoices.contains_key(&invoice.id) {
            return Err(StoreError::Constraint(format!("invoice {} already exists", invoice.id)));
        }
        ledger.invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn invoice(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        self.read(|l| l.invoices.get(&id).cloned())
    }

    async fn invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, StoreError> {
        let mut invoices = self.read(|l| {
            l.invoices
                .values()
                .filter(|i| filter.matches(i))
                .cloned()
                .collect::<Vec<_>>()
        })?;
        invoices.sort_by(newest_invoices_first);
        Ok(invoices)
    }

    async fn payment(&self, id: PaymentId) -> Result<Option<Payment>, StoreError> {
        self.read(|l| l.payments.get(&id).cloned())
    }

    async fn payments(&self, invoice_id: Option<InvoiceId>) -> Result<Vec<Payment>, StoreError> {
        let mut payments = self.read(|l| {
            l.payments
                .values()
                .filter(|p| invoice_id.is_none_or(|id| p.invoice_id == id))
                .cloned()
                .collect::<Vec<_>>()
        })?;
        payments.sort_by(newest_payments_first);
        Ok(payments)
    }
}

/// Staged writes: `None` marks a deletion.
struct InMemoryLedgerTx {
    store: InMemoryLedgerStore,
    held: HashMap<InvoiceId, OwnedMutexGuard<()>>,
    invoices: HashMap<InvoiceId, Option<Invoice>>,
    payments: HashMap<PaymentId, Option<Payment>>,
}

impl InMemoryLedgerTx {
    fn invoice_view(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        match self.invoices.get(&id) {
            Some(staged) => Ok(staged.clone()),
            None => self.store.read(|l| l.invoices.get(&id).cloned()),
        }
    }

    fn payment_view(&self, id: PaymentId) -> Result<Option<Payment>, StoreError> {
        let payment = match self.payments.get(&id) {
            Some(staged) => staged.clone(),
            None => self.store.read(|l| l.payments.get(&id).cloned())?,
        };

        // Payments of an invoice deleted in this transaction are gone too.
        match payment {
            Some(p) if self.invoice_view(p.invoice_id)?.is_some() => Ok(Some(p)),
            _ => Ok(None),
        }
    }

    fn staged_state_is_consistent(&self, ledger: &Ledger) -> Result<(), StoreError> {
        for payment in self.payments.values().flatten() {
            let invoice_exists = match self.invoices.get(&payment.invoice_id) {
                Some(staged) => staged.is_some(),
                None => ledger.invoices.contains_key(&payment.invoice_id),
            };
            if !invoice_exists {
                return Err(StoreError::ForeignKey(format!(
                    "payment {} references missing invoice {}",
                    payment.id, payment.invoice_id
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerTx for InMemoryLedgerTx {
    async fn lock_invoice(&mut self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        if !self.held.contains_key(&id) {
            let guard = self.store.row_lock(id)?.lock_owned().await;
            self.held.insert(id, guard);
        }
        self.invoice_view(id)
    }

    async fn payment(&mut self, id: PaymentId) -> Result<Option<Payment>, StoreError> {
        self.payment_view(id)
    }

    async fn payments_for(&mut self, invoice_id: InvoiceId) -> Result<Vec<Payment>, StoreError> {
        if self.invoice_view(invoice_id)?.is_none() {
            return Ok(Vec::new());
        }

        let mut payments = self.store.read(|l| {
            l.payments
                .values()
                .filter(|p| p.invoice_id == invoice_id && !self.payments.contains_key(&p.id))
                .cloned()
                .collect::<Vec<_>>()
        })?;
        payments.extend(
            self.payments
                .values()
                .flatten()
                .filter(|p| p.invoice_id == invoice_id)
                .cloned(),
        );
        payments.sort_by(newest_payments_first);
        Ok(payments)
    }

    async fn insert_payment(&mut self, payment: &Payment) -> Result<(), StoreError> {
        if self.invoice_view(payment.invoice_id)?.is_none() {
            return Err(StoreError::ForeignKey(format!(
                "payment {} references missing invoice {}",
                payment.id, payment.invoice_id
            )));
        }
        if self.payment_view(payment.id)?.is_some() {
            return Err(StoreError::Constraint(format!("payment {} already exists", payment.id)));
        }

        self.payments.insert(payment.id, Some(payment.clone()));
        Ok(())
    }

    async fn update_payment(&mut self, payment: &Payment) -> Result<bool, StoreError> {
        if self.payment_view(payment.id)?.is_none() {
            return Ok(false);
        }
        self.payments.insert(payment.id, Some(payment.clone()));
        Ok(true)
    }

    async fn delete_payment(&mut self, id: PaymentId) -> Result<bool, StoreError> {
        if self.payment_view(id)?.is_none() {
            return Ok(false);
        }
        self.payments.insert(id, None);
        Ok(true)
    }

    async fn update_invoice(&mut self, invoice: &Invoice) -> Result<bool, StoreError> {
        if self.invoice_view(invoice.id)?.is_none() {
            return Ok(false);
        }
        self.invoices.insert(invoice.id, Some(invoice.clone()));
        Ok(true)
    }

    async fn delete_invoice(&mut self, id: InvoiceId) -> Result<bool, StoreError> {
        if self.invoice_view(id)?.is_none() {
            return Ok(false);
        }
        self.invoices.insert(id, None);
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if self.store.take_commit_failure() {
            return Err(StoreError::database("commit", "injected commit failure"));
        }

        let mut this = *self;
        let mut ledger = this.store.ledger.write().map_err(|_| StoreError::Poisoned)?;
        this.staged_state_is_consistent(&ledger)?;

        let mut deleted = Vec::new();
        for (id, staged) in std::mem::take(&mut this.invoices) {
            match staged {
                Some(invoice) => {
                    ledger.invoices.insert(id, invoice);
                }
                None => deleted.push(id),
            }
        }
        for (id, staged) in std::mem::take(&mut this.payments) {
            match staged {
                Some(payment) => {
                    ledger.payments.insert(id, payment);
                }
                None => {
                    ledger.payments.remove(&id);
                }
            }
        }
        for id in deleted {
            ledger.invoices.remove(&id);
            ledger.payments.retain(|_, p| p.invoice_id != id);
        }

        // Row locks are released when `this` drops, after the ledger write guard.
        drop(ledger);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

impl Drop for InMemoryLedgerTx {
    fn drop(&mut self) {
        self.store.release(std::mem::take(&mut self.held));
    }
}
