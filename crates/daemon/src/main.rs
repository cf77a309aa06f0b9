use anyhow::Context;

use hap_infra::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hap_observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;
    let app = hap_daemon::app::build(settings).await?;

    tracing::info!("hap-billingd running; Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    app.shutdown().await;
    Ok(())
}
