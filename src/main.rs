/// Fanout service entry point
///
/// Wires the PostgreSQL registry, the LISTEN/NOTIFY change bus, and the
/// signed push sender into one coordinator and runs it until interrupted.
use std::sync::Arc;

use gateway_fanout::{
    init_tracing, ChangeBus, FanoutConfig, FanoutCoordinator, HttpConnectionSender,
    PostgresChangeBus, PostgresConnectionStore, RequestSigner,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = FanoutConfig::from_env()?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.store.max_connections)
        .connect(&config.store.database_url)
        .await?;

    let store = Arc::new(PostgresConnectionStore::with_table(
        pool.clone(),
        config.store.table.as_str(),
    )?);

    let signer = config
        .push
        .credentials
        .clone()
        .map(|credentials| RequestSigner::new(credentials, &config.push.region, "execute-api"));
    if signer.is_none() {
        tracing::warn!("no credentials in environment, push requests will be unsigned");
    }
    let sender = Arc::new(
        HttpConnectionSender::new(&config.push.endpoint, signer)?
            .with_clock_skew(config.push.clock_skew_tolerance),
    );

    let bus = PostgresChangeBus::new(pool, &config.bus.channel)?;
    let events = bus.start().await?;

    tracing::info!(
        channel = %config.bus.channel,
        endpoint = %config.push.endpoint,
        "fanout service started"
    );

    let coordinator = FanoutCoordinator::with_retry_policy(store, sender, config.retry.clone());

    tokio::select! {
        _ = coordinator.run(events) => {
            tracing::warn!("change stream ended unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    bus.stop().await?;
    Ok(())
}
