//! Relay daemon: registers the consumer group and runs the poller until Ctrl-C.
//!
//! Every delivered event is logged by a catch-all handler. Configuration comes from
//! `EVENTLOG_*` environment variables.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use eventlog_events::HandlerRegistry;
use eventlog_infra::EventStoreConfig;
use eventlog_infra::consumer::{ConsumerGroupPoller, ConsumerGroupRegistrar};
use eventlog_infra::stream_store::RedisStreamStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eventlog_observability::init();

    let config = EventStoreConfig::from_env().context("invalid EVENTLOG_* configuration")?;
    if std::env::var("EVENTLOG_REDIS_URL").is_err() {
        warn!(redis_url = %config.redis_url, "EVENTLOG_REDIS_URL not set; using default");
    }
    info!(config = ?config, "relay configuration loaded");

    let store = Arc::new(RedisStreamStore::new(&config.redis_url).context("invalid redis url")?);

    if config.create_consumer_group_if_not_exists {
        let registrar = ConsumerGroupRegistrar::new(store.clone(), config.clone());
        // The poller retries registration on every tick until it succeeds.
        match tokio::task::spawn_blocking(move || registrar.register_all()).await? {
            Ok(report) => info!(
                created = report.created.len(),
                already_existed = report.already_existed.len(),
                "consumer groups ready"
            ),
            Err(err) => error!(error = %err, "initial consumer group registration failed"),
        }
    }

    let handlers = Arc::new(HandlerRegistry::new());
    handlers.register_all(|event| {
        info!(
            event_id = %event.event_id(),
            event_type = %event.event_type(),
            aggregate_id = %event.aggregate_id(),
            version = event.version(),
            "event delivered"
        );
        Ok(())
    });

    let report_interval = config.metrics_report_interval;
    let handle = ConsumerGroupPoller::new(store, handlers, config)
        .spawn()
        .context("failed to spawn poller thread")?;

    let mut report = tokio::time::interval(report_interval);
    report.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                break;
            }
            _ = report.tick() => {
                let stats = handle.stats();
                info!(
                    ticks = stats.ticks,
                    delivered = stats.delivered,
                    acknowledged = stats.acknowledged,
                    claimed = stats.claimed,
                    handler_failures = stats.handler_failures,
                    malformed_records = stats.malformed_records,
                    skipped_cycles = stats.skipped_cycles,
                    "poller stats"
                );
            }
        }
    }

    info!("shutting down");
    tokio::task::spawn_blocking(move || handle.shutdown()).await?;
    Ok(())
}
