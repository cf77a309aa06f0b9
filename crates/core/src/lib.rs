//! `hap-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers and the error model every other crate classifies against.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult, ErrorKind};
pub use id::{AppointmentId, InvoiceId, PatientId, PaymentId};
