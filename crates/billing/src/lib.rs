//! `hap-billing` — invoices, payments and the rules that reconcile them.
//!
//! Pure domain code: no IO, no async. Persistence and notification live in
//! `hap-infra`.

pub mod events;
pub mod invoice;
pub mod payment;
pub mod reconcile;
pub mod timestamp;

pub use events::{BillingEvent, InvoiceMarkedPaid, InvoiceSummary, PaymentChange, PaymentSummary, StatusTransition, TransitionSource};
pub use invoice::{Invoice, InvoiceDetailsUpdate, InvoiceFilter, InvoiceStatus, NewInvoice};
pub use payment::{Payment, PaymentMethod, PaymentUpdate, RecordPayment};
pub use reconcile::{Settlement, derive_status, settle};
