use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::{Pool, Postgres};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::blobstore::BlobStore;
use crate::broker::feed_payload;
use crate::classifier::{is_deadline, Classifier, ClassifierRuntime, PostInput};
use crate::db;
use crate::metrics;
use crate::models::Post;

const CLASSIFIERS_PATH: &str = "classifiers";

/// Per-worker cache of live classifiers, keyed `did/rkey`, with an on-disk
/// shadow of the raw binaries.
///
/// The map lock is held for the whole classify fan-out, so an upsert or
/// delete can never interleave with a running classification: callers see
/// either the old instance set or the new one.
pub struct ClassifierPool {
    runtime: ClassifierRuntime,
    classifiers: Mutex<HashMap<String, Arc<Classifier>>>,
    working_directory: PathBuf,
    timeout: Duration,
}

impl ClassifierPool {
    pub fn new(runtime: ClassifierRuntime, working_directory: PathBuf, timeout: Duration) -> Self {
        Self {
            runtime,
            classifiers: Mutex::new(HashMap::new()),
            working_directory,
            timeout,
        }
    }

    fn classifiers_dir(&self) -> PathBuf {
        self.working_directory.join(CLASSIFIERS_PATH)
    }

    fn classifier_path(&self, did: &str, rkey: &str) -> PathBuf {
        self.classifiers_dir().join(did).join(rkey)
    }

    /// Wipes the on-disk shadow and loads every feed's classifier from the
    /// blob store. Per-feed failures are logged and that feed is skipped.
    pub async fn load_all(&self, db_pool: &Pool<Postgres>, blobs: &BlobStore) -> Result<()> {
        let dir = self.classifiers_dir();
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&dir).await?;

        let feeds = db::get_feeds(db_pool).await?;

        for feed in feeds {
            if let Err(e) = self.fetch(blobs, &feed.did, &feed.rkey).await {
                warn!(
                    "Could not fetch classifier for feed {}/{}, skipping: {}",
                    feed.did, feed.rkey, e
                );
            }
        }

        info!(
            "Fetched {} classifiers",
            self.classifiers.lock().await.len()
        );

        Ok(())
    }

    /// Fetches the current blob and swaps the instance in. The fetch and
    /// compile happen before the lock is taken; on failure the previous
    /// entry stays intact.
    pub async fn fetch(&self, blobs: &BlobStore, did: &str, rkey: &str) -> Result<()> {
        let binary = blobs.get_classifier(did, rkey).await?;

        self.insert(did, rkey, &binary).await
    }

    pub async fn insert(&self, did: &str, rkey: &str, binary: &[u8]) -> Result<()> {
        let classifier = self.runtime.load(binary, self.timeout)?;

        let path = self.classifier_path(did, rkey);

        let mut classifiers = self.classifiers.lock().await;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, binary).await?;

        classifiers.insert(feed_payload(did, rkey), Arc::new(classifier));

        Ok(())
    }

    pub async fn remove(&self, did: &str, rkey: &str) -> Result<()> {
        let mut classifiers = self.classifiers.lock().await;

        match tokio::fs::remove_file(self.classifier_path(did, rkey)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        classifiers.remove(&feed_payload(did, rkey));

        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.classifiers.lock().await.len()
    }

    /// Fans the post out across every live classifier in parallel and
    /// indexes it into each feed whose classifier returns a non-negative
    /// weight.
    ///
    /// Deadline overruns and foreign-key violations (the feed was deleted
    /// mid-flight) are swallowed; the first remaining error is returned
    /// once every invocation has settled.
    pub async fn classify(&self, db_pool: &Pool<Postgres>, post: &Post) -> Result<()> {
        let timer = metrics::CLASSIFY_TIME.start_timer();

        let classifiers = self.classifiers.lock().await;

        let input = PostInput::from(post);

        let mut invocations = Vec::new();
        for (feed, classifier) in classifiers.iter() {
            let Some((feed_did, feed_rkey)) = crate::broker::split_feed_payload(feed) else {
                continue;
            };

            let classifier = classifier.clone();
            let input = input.clone();

            invocations.push(async move {
                metrics::CLASSIFIER_INVOCATIONS.inc();

                let result = tokio::task::spawn_blocking(move || classifier.classify(&input))
                    .await
                    .map_err(anyhow::Error::new)?;

                let weight = match result {
                    Ok(weight) => weight,
                    Err(e) if is_deadline(&e) => {
                        metrics::CLASSIFIER_TIMEOUTS.inc();
                        warn!(
                            "Classifier for feed {}/{} hit its deadline, skipping",
                            feed_did, feed_rkey
                        );
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };

                if weight >= 0 {
                    match db::upsert_feed_post(
                        db_pool,
                        &feed_did,
                        &feed_rkey,
                        &post.did,
                        &post.rkey,
                        weight as i32,
                    )
                    .await
                    {
                        Ok(()) => {
                            metrics::POSTS_INDEXED.inc();
                        }
                        Err(e) if db::is_foreign_key_violation(&e) => {
                            // The feed was deleted while this post was in
                            // flight; the index row would be orphaned anyway.
                            debug!(
                                "Feed {}/{} vanished during classification, skipping",
                                feed_did, feed_rkey
                            );
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                Ok(())
            });
        }

        let results = futures::future::join_all(invocations).await;

        drop(classifiers);
        timer.observe_duration();

        for result in results {
            result?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONSTANT_CLASSIFIER: &[u8] = br#"
        (module
          (memory (export "memory") 1)
          (func (export "alloc") (param i32) (result i32) (i32.const 16))
          (func (export "classify") (param i32 i32) (result i64) (i64.const 7)))
    "#;

    fn test_pool() -> ClassifierPool {
        let dir = std::env::temp_dir()
            .join("atmosfeed-pool-tests")
            .join(uuid::Uuid::new_v4().to_string());

        ClassifierPool::new(
            ClassifierRuntime::new().unwrap(),
            dir,
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_insert_replace_remove() {
        let pool = test_pool();

        pool.insert("did:plc:a", "feed-1", CONSTANT_CLASSIFIER)
            .await
            .unwrap();
        assert_eq!(pool.len().await, 1);
        assert!(pool.classifier_path("did:plc:a", "feed-1").exists());

        // Replacing is keyed, not additive
        pool.insert("did:plc:a", "feed-1", CONSTANT_CLASSIFIER)
            .await
            .unwrap();
        assert_eq!(pool.len().await, 1);

        pool.insert("did:plc:a", "feed-2", CONSTANT_CLASSIFIER)
            .await
            .unwrap();
        assert_eq!(pool.len().await, 2);

        pool.remove("did:plc:a", "feed-1").await.unwrap();
        assert_eq!(pool.len().await, 1);
        assert!(!pool.classifier_path("did:plc:a", "feed-1").exists());

        // Removing an unknown feed is a no-op
        pool.remove("did:plc:a", "feed-1").await.unwrap();
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_insert_rejects_invalid_binary() {
        let pool = test_pool();

        assert!(pool
            .insert("did:plc:a", "feed-1", b"not a wasm module")
            .await
            .is_err());
        assert_eq!(pool.len().await, 0);
    }
}
