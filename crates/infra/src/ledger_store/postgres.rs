//! Postgres-backed ledger store.
//!
//! Invoice row locks are `SELECT ... FOR UPDATE` taken inside the transaction,
//! so concurrent payment mutations on one invoice queue behind each other and
//! each recomputes from a fresh aggregate read.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (foreign key violation) | `23503` | `ForeignKey` |
//! | Database (unique violation) | `23505` | `Constraint` |
//! | Database (check constraint violation) | `23514` | `Constraint` |
//! | Database (other) | Any other | `Database` |
//! | PoolClosed / other | N/A | `Database` |

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use async_trait::async_trait;

use hap_billing::{Invoice, InvoiceFilter, InvoiceStatus, Payment, PaymentMethod};
use hap_core::{AppointmentId, InvoiceId, PatientId, PaymentId};

use super::{LedgerStore, LedgerTx, StoreError};

const SCHEMA: &str = include_str!("../../migrations/0001_ledger.sql");

const INVOICE_COLUMNS: &str =
    "id, patient_id, appointment_id, amount, status, due_date, issued_at, paid_at, notes";

const PAYMENT_COLUMNS: &str = "id, invoice_id, amount, method, paid_at, notes";

/// Postgres-backed ledger store.
///
/// `Clone` is cheap: the pool is reference-counted internally.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresLedgerTx { tx }))
    }

    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.id), err)]
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO invoices (
                id, patient_id, appointment_id, amount, status,
                due_date, issued_at, paid_at, notes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(invoice.id.as_uuid())
        .bind(invoice.patient_id.as_uuid())
        .bind(invoice.appointment_id.map(Uuid::from))
        .bind(invoice.amount)
        .bind(invoice.status.as_str())
        .bind(invoice.due_date)
        .bind(invoice.issued_at)
        .bind(invoice.paid_at)
        .bind(&invoice.notes)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_invoice", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(invoice_id = %id), err)]
    async fn invoice(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        let row = sqlx::query(&format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("invoice", e))?;
        row.as_ref().map(invoice_from_row).transpose()
    }

    #[instrument(skip(self), fields(row_count = tracing::field::Empty), err)]
    async fn invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM invoices
            WHERE ($1::uuid IS NULL OR patient_id = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::timestamptz IS NULL OR issued_at >= $3)
              AND ($4::timestamptz IS NULL OR issued_at <= $4)
            ORDER BY issued_at DESC, id DESC
            "#
        ))
        .bind(filter.patient_id.map(Uuid::from))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.issued_from)
        .bind(filter.issued_to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("invoices", e))?;

        Span::current().record("row_count", rows.len());
        rows.iter().map(invoice_from_row).collect()
    }

    #[instrument(skip(self), fields(payment_id = %id), err)]
    async fn payment(&self, id: PaymentId) -> Result<Option<Payment>, StoreError> {
        let row = sqlx::query(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("payment", e))?;
        row.as_ref().map(payment_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn payments(&self, invoice_id: Option<InvoiceId>) -> Result<Vec<Payment>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS}
            FROM payments
            WHERE ($1::uuid IS NULL OR invoice_id = $1)
            ORDER BY paid_at DESC, id DESC
            "#
        ))
        .bind(invoice_id.map(Uuid::from))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("payments", e))?;
        rows.iter().map(payment_from_row).collect()
    }
}

/// A ledger transaction on one pooled connection. Dropping it rolls back.
pub struct PostgresLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PostgresLedgerTx {
    #[instrument(skip(self), fields(invoice_id = %id), err)]
    async fn lock_invoice(&mut self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_invoice", e))?;
        row.as_ref().map(invoice_from_row).transpose()
    }

    async fn payment(&mut self, id: PaymentId) -> Result<Option<Payment>, StoreError> {
        let row = sqlx::query(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("payment", e))?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn payments_for(&mut self, invoice_id: InvoiceId) -> Result<Vec<Payment>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE invoice_id = $1 ORDER BY paid_at DESC, id DESC"
        ))
        .bind(invoice_id.as_uuid())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("payments_for", e))?;
        rows.iter().map(payment_from_row).collect()
    }

    #[instrument(skip(self, payment), fields(payment_id = %payment.id, invoice_id = %payment.invoice_id), err)]
    async fn insert_payment(&mut self, payment: &Payment) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO payments (id, invoice_id, amount, method, paid_at, notes)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(payment.id.as_uuid())
        .bind(payment.invoice_id.as_uuid())
        .bind(payment.amount)
        .bind(payment.method.as_str())
        .bind(payment.paid_at)
        .bind(&payment.notes)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_payment", e))?;
        Ok(())
    }

    #[instrument(skip(self, payment), fields(payment_id = %payment.id), err)]
    async fn update_payment(&mut self, payment: &Payment) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET amount = $2, method = $3, paid_at = $4, notes = $5
            WHERE id = $1
            "#,
        )
        .bind(payment.id.as_uuid())
        .bind(payment.amount)
        .bind(payment.method.as_str())
        .bind(payment.paid_at)
        .bind(&payment.notes)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_payment", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(payment_id = %id), err)]
    async fn delete_payment(&mut self, id: PaymentId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM payments WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_payment", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.id, status = %invoice.status), err)]
    async fn update_invoice(&mut self, invoice: &Invoice) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET amount = $2, status = $3, due_date = $4, paid_at = $5, notes = $6
            WHERE id = $1
            "#,
        )
        .bind(invoice.id.as_uuid())
        .bind(invoice.amount)
        .bind(invoice.status.as_str())
        .bind(invoice.due_date)
        .bind(invoice.paid_at)
        .bind(&invoice.notes)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_invoice", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(invoice_id = %id), err)]
    async fn delete_invoice(&mut self, id: InvoiceId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM invoices WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_invoice", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                Some("23503") => StoreError::ForeignKey(msg),
                Some("23505") | Some("23514") => StoreError::Constraint(msg),
                _ => StoreError::database(operation, db_err.message()),
            }
        }
        sqlx::Error::PoolClosed => StoreError::database(operation, "connection pool closed"),
        _ => StoreError::database(operation, err.to_string()),
    }
}

fn decode_err(err: sqlx::Error) -> StoreError {
    StoreError::Decode(err.to_string())
}

fn invoice_from_row(row: &PgRow) -> Result<Invoice, StoreError> {
    let status: String = row.try_get("status").map_err(decode_err)?;
    let appointment_id: Option<Uuid> = row.try_get("appointment_id").map_err(decode_err)?;

    Ok(Invoice {
        id: InvoiceId::from_uuid(row.try_get("id").map_err(decode_err)?),
        patient_id: PatientId::from_uuid(row.try_get("patient_id").map_err(decode_err)?),
        appointment_id: appointment_id.map(AppointmentId::from_uuid),
        amount: row.try_get::<Decimal, _>("amount").map_err(decode_err)?,
        status: status
            .parse::<InvoiceStatus>()
            .map_err(|e| StoreError::Decode(e.to_string()))?,
        due_date: row.try_get::<DateTime<Utc>, _>("due_date").map_err(decode_err)?,
        issued_at: row.try_get::<DateTime<Utc>, _>("issued_at").map_err(decode_err)?,
        paid_at: row.try_get::<Option<DateTime<Utc>>, _>("paid_at").map_err(decode_err)?,
        notes: row.try_get("notes").map_err(decode_err)?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment, StoreError> {
    let method: String = row.try_get("method").map_err(decode_err)?;

    Ok(Payment {
        id: PaymentId::from_uuid(row.try_get("id").map_err(decode_err)?),
        invoice_id: InvoiceId::from_uuid(row.try_get("invoice_id").map_err(decode_err)?),
        amount: row.try_get::<Decimal, _>("amount").map_err(decode_err)?,
        method: PaymentMethod::parse(method).map_err(|e| StoreError::Decode(e.to_string()))?,
        paid_at: row.try_get::<DateTime<Utc>, _>("paid_at").map_err(decode_err)?,
        notes: row.try_get("notes").map_err(decode_err)?,
    })
}
