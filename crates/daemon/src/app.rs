//! Service wiring: settings → ledger store → broker → publisher pool →
//! reconciliation engine → consumer supervisor.
//!
//! Backends are chosen by configuration:
//! - `DATABASE_URL` set: Postgres ledger (schema applied on startup),
//!   otherwise the in-memory ledger
//! - `REDIS_URL` set: Redis Streams broker, otherwise an in-memory broker with
//!   every configured topic provisioned

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use hap_events::{Broker, InMemoryBroker};
use hap_infra::{
    AuditLogHandler, ConsumerSupervisor, InMemoryLedgerStore, LedgerStore, PostgresLedgerStore,
    PublisherPool, ReconciliationEngine, Settings, SupervisorHandle,
};

const POSTGRES_MAX_CONNECTIONS: u32 = 10;

pub type Engine = ReconciliationEngine<Arc<dyn LedgerStore>>;

/// A running service instance.
pub struct App {
    pub settings: Settings,
    pub engine: Arc<Engine>,
    pub publisher: Arc<PublisherPool>,
    pub audit: Arc<AuditLogHandler>,
    consumers: SupervisorHandle,
}

impl App {
    pub fn consumers(&self) -> &SupervisorHandle {
        &self.consumers
    }

    /// Stop the readers, then close the writers.
    pub async fn shutdown(self) {
        info!("shutting down");
        for (topic, state) in self.consumers.shutdown().await {
            info!(topic = %topic, state = ?state, "reader finished");
        }
        self.publisher.close().await;
        info!(
            audited = self.audit.observed(),
            stats = ?self.publisher.stats(),
            "shutdown complete"
        );
    }
}

pub async fn build(settings: Settings) -> anyhow::Result<App> {
    let store = ledger_store(&settings).await?;
    let broker = broker(&settings)?;

    let publisher = Arc::new(
        PublisherPool::connect(broker.as_ref(), &settings.topics, settings.publish_timeout)
            .await
            .context("failed to open topic writers")?,
    );

    let engine = Arc::new(ReconciliationEngine::new(store, Arc::clone(&publisher)));

    let audit = Arc::new(AuditLogHandler::new());
    let consumers = ConsumerSupervisor::start(
        Arc::clone(&broker),
        &settings.topics,
        settings.consumer_config(),
        audit.clone(),
    );

    info!(topics = %settings.topics, "service started");

    Ok(App {
        settings,
        engine,
        publisher,
        audit,
        consumers,
    })
}

async fn ledger_store(settings: &Settings) -> anyhow::Result<Arc<dyn LedgerStore>> {
    let Some(url) = settings.database_url.as_deref() else {
        warn!("DATABASE_URL not set; using in-memory ledger (data is lost on exit)");
        return Ok(Arc::new(InMemoryLedgerStore::new()));
    };

    let store = PostgresLedgerStore::connect(url, POSTGRES_MAX_CONNECTIONS)
        .await
        .context("failed to connect to Postgres")?;
    store.migrate().await.context("failed to apply ledger schema")?;
    info!("using Postgres ledger");
    Ok(Arc::new(store))
}

#[cfg(feature = "redis")]
fn broker(settings: &Settings) -> anyhow::Result<Arc<dyn Broker>> {
    use hap_infra::messaging::RedisStreamsBroker;

    match settings.redis_url.as_deref() {
        Some(url) => {
            let broker = RedisStreamsBroker::new(url, settings.stream_prefix.clone())
                .context("failed to configure Redis Streams broker")?;
            info!(prefix = %settings.stream_prefix, "using Redis Streams broker");
            Ok(Arc::new(broker))
        }
        None => Ok(in_memory_broker(settings)),
    }
}

#[cfg(not(feature = "redis"))]
fn broker(settings: &Settings) -> anyhow::Result<Arc<dyn Broker>> {
    if settings.redis_url.is_some() {
        anyhow::bail!("REDIS_URL is set but hap-billingd was built without the `redis` feature");
    }
    Ok(in_memory_broker(settings))
}

fn in_memory_broker(settings: &Settings) -> Arc<dyn Broker> {
    warn!("REDIS_URL not set; using in-memory broker (events stay in-process)");
    Arc::new(InMemoryBroker::with_topics(settings.topics.iter()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use hap_billing::{InvoiceStatus, NewInvoice, RecordPayment};
    use hap_core::PatientId;
    use hap_infra::ReaderState;
    use rust_decimal_macros::dec;

    fn in_memory_settings() -> Settings {
        Settings::from_lookup(|var| match var {
            "HAP_CONSUMER_BACKOFF_MS" => Some("20".to_string()),
            _ => None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn in_memory_service_settles_and_audits() {
        let app = build(in_memory_settings()).await.unwrap();

        let invoice = app
            .engine
            .create_invoice(NewInvoice::new(PatientId::new(), dec!(80)))
            .await
            .unwrap();
        let outcome = app
            .engine
            .record_payment(RecordPayment::new(invoice.id, dec!(80), "cash"))
            .await
            .unwrap();
        assert_eq!(outcome.invoice.status, InvoiceStatus::Paid);
        assert!(outcome.notification.is_delivered());

        tokio::time::timeout(Duration::from_secs(5), async {
            while app.audit.observed() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("payment event was not audited");

        assert!(
            app.consumers()
                .states()
                .iter()
                .all(|(_, state)| *state != ReaderState::Stopped)
        );
        app.shutdown().await;
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn redis_url_requires_the_redis_feature() {
        let settings = Settings::from_lookup(|var| {
            (var == "REDIS_URL").then(|| "redis://localhost:6379".to_string())
        })
        .unwrap();
        assert!(build(settings).await.is_err());
    }
}
