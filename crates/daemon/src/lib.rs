//! `hap-billingd`: composition root for the billing reconciliation service.

pub mod app;
