//! Infrastructure layer: ledger storage, messaging runtime, reconciliation
//! engine and configuration.

pub mod config;
pub mod ledger_store;
pub mod messaging;
pub mod reconciliation;


pub use config::{ConfigError, Settings};
pub use ledger_store::{InMemoryLedgerStore, LedgerStore, LedgerTx, PostgresLedgerStore, StoreError};
pub use messaging::{
    AuditLogHandler, ConsumerConfig, ConsumerSupervisor, EnvelopeHandler, PublishError, PublisherPool,
    ReaderState, SupervisorHandle,
};
pub use reconciliation::{BillingError, LedgerOutcome, Notification, ReconciliationEngine};
