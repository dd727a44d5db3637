use std::sync::Arc;

use billrun_app::AppSettings;
use billrun_app::provider::SimulatedPaymentProvider;
use billrun_app::seed;
use billrun_billing::{BillingConfig, BillingScheduler, InMemoryInvoiceStore, SystemClock, ThreadTimer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    billrun_observability::init();

    let settings = AppSettings::from_env()?;
    let config = BillingConfig::from_env()?;
    tracing::info!(
        concurrent_chunks = config.concurrent_chunks,
        max_retries = config.retry.max_retries,
        base_delay_ms = config.retry.base_delay.as_millis() as u64,
        run_deadline_secs = config.run_deadline.map(|d| d.as_secs()),
        "billing configuration loaded"
    );

    let store = InMemoryInvoiceStore::arc();
    let demo = seed::seed(&store, settings.seed_customers, &mut rand::thread_rng())?;
    let provider = SimulatedPaymentProvider::new(demo.accounts);
    let dispatcher = config.dispatcher(provider, Arc::clone(&store));

    let timer = Arc::new(ThreadTimer::spawn("billing-timer")?);
    let scheduler = BillingScheduler::new(SystemClock, Arc::clone(&timer), dispatcher);
    let next_run = scheduler.start()?;
    tracing::info!(next_run = %next_run, "billing scheduler armed");

    if settings.run_on_start {
        let scheduler = Arc::clone(&scheduler);
        let summary = tokio::task::spawn_blocking(move || scheduler.run_now()).await?;
        tracing::info!(summary = %serde_json::to_string(&summary)?, "startup billing run");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested; stopping billing timer");
    timer.shutdown();
    Ok(())
}
