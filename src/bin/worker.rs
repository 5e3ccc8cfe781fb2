use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::signal;
use tracing::info;

use atmosfeed::blobstore::BlobStore;
use atmosfeed::broker::Broker;
use atmosfeed::classifier::ClassifierRuntime;
use atmosfeed::config::WorkerConfig;
use atmosfeed::pool::ClassifierPool;
use atmosfeed::{db, logging, worker};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging first thing
    logging::setup_logging();

    // Load environment variables from .env file if present
    dotenv::dotenv().ok();

    info!("Starting Atmosfeed worker");

    let config = WorkerConfig::from_env()?;

    let db_pool = db::init_db_pool(&config.store.postgres_url, false).await?;

    let broker = Broker::connect(&config.store.redis_url).await?;
    // Idempotent, so whichever role starts first creates the groups
    broker.init_streams().await?;

    let blobs = Arc::new(BlobStore::connect(&config.store.s3_url).await?);

    let runtime = ClassifierRuntime::new()?;
    let pool = Arc::new(ClassifierPool::new(
        runtime,
        config.working_directory.clone(),
        config.classifier_timeout,
    ));

    // Wipe the on-disk shadow and fetch every live classifier before
    // consuming any posts
    pool.load_all(&db_pool, &blobs).await?;

    let upsert_handle = tokio::spawn(worker::run_feed_upsert_listener(
        broker.clone(),
        blobs.clone(),
        pool.clone(),
    ));
    let delete_handle = tokio::spawn(worker::run_feed_delete_listener(
        broker.clone(),
        pool.clone(),
    ));
    let insert_handle = tokio::spawn(worker::run_insert_consumer(
        broker.clone(),
        db_pool.clone(),
        pool.clone(),
    ));
    let like_handle = tokio::spawn(worker::run_like_consumer(
        broker.clone(),
        db_pool.clone(),
        pool.clone(),
    ));

    // Any loop ending is fatal; external supervision restarts the process
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal, shutting down");
            Ok(())
        }
        res = upsert_handle => {
            res??;
            Err(anyhow!("feed upsert listener terminated"))
        }
        res = delete_handle => {
            res??;
            Err(anyhow!("feed delete listener terminated"))
        }
        res = insert_handle => {
            res??;
            Err(anyhow!("post insert consumer terminated"))
        }
        res = like_handle => {
            res??;
            Err(anyhow!("post like consumer terminated"))
        }
    }
}
