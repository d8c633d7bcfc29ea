use std::sync::Arc;

use kvstore::config::ReplicationConfig;
use kvstore::replication::Master;
use kvstore::shards::ShardPool;
use kvstore::store::{BtreeStore, KeyValueStore};
use kvstore::time::SystemTimeSource;
use kvstore::timestamp::Timestamper;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kvstore=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match ReplicationConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Loaded configuration: port={}, shards={}, heartbeat={:?}, backfill_timeout={:?}",
        config.listen_port,
        config.shard_count,
        config.heartbeat_interval,
        config.backfill_stall_timeout
    );

    let timestamper = Arc::new(Timestamper::new(SystemTimeSource));
    let shards = Arc::new(ShardPool::spawn(config.shard_count, timestamper));

    let store: Arc<dyn KeyValueStore> = match BtreeStore::new(config.shard_count) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("Failed to create store: {e}");
            std::process::exit(1);
        }
    };

    let master = Master::new(config, shards);
    if let Err(e) = master.register_key_value_store(store).await {
        tracing::error!("Failed to start replication: {e}");
        std::process::exit(1);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to wait for shutdown signal: {e}");
    }
    tracing::info!("shutting down");
    master.shutdown().await;
}
