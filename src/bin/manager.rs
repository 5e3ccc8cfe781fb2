use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::{signal, sync::oneshot};
use tracing::info;

use atmosfeed::api::{self, ApiState};
use atmosfeed::blobstore::BlobStore;
use atmosfeed::broker::Broker;
use atmosfeed::config::ManagerConfig;
use atmosfeed::{db, firehose, logging};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging first thing
    logging::setup_logging();

    // Load environment variables from .env file if present
    dotenv::dotenv().ok();

    info!("Starting Atmosfeed manager");

    let config = ManagerConfig::from_env()?;

    // The manager owns migrations; workers only consume the schema
    let db_pool = db::init_db_pool(&config.store.postgres_url, true).await?;

    if config.delete_all_posts {
        db::delete_all_posts(&db_pool).await?;
        info!("Deleted all posts");
    }

    let broker = Broker::connect(&config.store.redis_url).await?;
    broker.init_streams().await?;

    let blobs = Arc::new(BlobStore::connect(&config.store.s3_url).await?);

    // Create shutdown signal for the ingester
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let firehose_handle = tokio::spawn(firehose::run_firehose_ingester(
        config.bgs_url.clone(),
        broker.clone(),
        db_pool.clone(),
        shutdown_rx,
    ));

    let state = Arc::new(ApiState {
        db_pool,
        broker,
        blobs,
        http: reqwest::Client::new(),
        config: config.clone(),
    });
    let router = api::create_router(state)?;

    let listener = tokio::net::TcpListener::bind(&config.laddr).await?;
    info!("Listening on {}", listener.local_addr()?);

    let api_handle = tokio::spawn(async move { axum::serve(listener, router).await });

    // A terminated loop is fatal; external supervision restarts the process
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal, shutting down gracefully");
        }
        res = firehose_handle => {
            res??;
            return Err(anyhow!("firehose ingester terminated"));
        }
        res = api_handle => {
            res??;
            return Err(anyhow!("HTTP server terminated"));
        }
    }

    let _ = shutdown_tx.send(());

    info!("Shutdown complete");
    Ok(())
}
