use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use payday::adapters::{NullNotifier, NullProcessorSync, ProcessorSync};
use payday::config::Config;
use payday::error::PaydayError;
use payday::payday::Payday;
use payday::store::postgres::PgStore;
use payday::store::PaydayStore;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,payday=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    dotenv::dotenv().ok();
    let config = Config::from_env()?;

    info!("Starting payday");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let store = PgStore::new(pool);
    store.migrate().await?;

    // One payday at a time, across all processes.
    if !store.try_acquire_job_lock(config.job_lock_key).await? {
        error!("another payday process is already running");
        return Err(PaydayError::AlreadyRunning.into());
    }

    let result = run_payday(&store, &config).await;
    store.release_job_lock(config.job_lock_key).await?;
    result?;
    Ok(())
}

async fn run_payday(store: &PgStore, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    // Pull fresh account state before any money moves.
    NullProcessorSync.sync_accounts().await?;

    match Payday::start(store, config).await? {
        Some(mut payday) => payday.run(&NullNotifier).await?,
        None => info!("nothing to do"),
    }
    Ok(())
}
