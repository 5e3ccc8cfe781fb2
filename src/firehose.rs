use std::io::Cursor;

use anyhow::{anyhow, Result};
use atrium_api::com::atproto::sync::subscribe_repos::{Commit, NSID};
use atrium_repo::blockstore::{AsyncBlockStoreRead, CarStore};
use futures::StreamExt;
use ipld_core::cid::Cid;
use serde::Deserialize;
use sqlx::{Pool, Postgres};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::db;
use crate::metrics;
use crate::models::{AtUri, LEXICON_FEED_LIKE, LEXICON_FEED_POST};
use crate::stream::frames::Frame;
use crate::subscription::{CommitHandler, Subscription};

/// Post record as decoded off the wire. `createdAt` stays a raw string here;
/// the worker owns timestamp validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostRecord {
    text: String,
    created_at: String,
    #[serde(default)]
    reply: Option<serde::de::IgnoredAny>,
    #[serde(default)]
    langs: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct LikeRecord {
    subject: LikeSubject,
}

#[derive(Debug, Deserialize)]
struct LikeSubject {
    uri: String,
}

pub fn subscribe_repos_url(bgs_url: &str) -> String {
    let host = bgs_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("wss://")
        .trim_start_matches("ws://")
        .trim_end_matches('/');

    format!("wss://{}/xrpc/{}", host, NSID)
}

// WebSocket connection wrapper
struct RepoSubscription {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RepoSubscription {
    async fn new(bgs_url: &str) -> Result<Self> {
        let ws_url = subscribe_repos_url(bgs_url);
        info!("Connecting to firehose at: {}", ws_url);

        let (stream, _) = connect_async(ws_url).await?;
        info!("WebSocket connection established");

        Ok(RepoSubscription { stream })
    }
}

impl Subscription for RepoSubscription {
    async fn next(&mut self) -> Option<Result<Frame>> {
        while let Some(msg) = self.stream.next().await {
            match msg {
                Ok(Message::Binary(data)) => return Some(Frame::try_from(&data[..])),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue, // ping/pong/text frames carry no commits
                Err(e) => return Some(Err(anyhow::Error::new(e))),
            }
        }

        None
    }
}

/// Demultiplexes commits into broker messages and direct deletes.
struct IngestHandler {
    broker: Broker,
    db_pool: Pool<Postgres>,
}

impl IngestHandler {
    async fn handle_create(
        &self,
        car_store: &mut CarStore<Cursor<&[u8]>>,
        repo_did: &str,
        collection: &str,
        rkey: &str,
        cid_link: &atrium_api::types::CidLink,
    ) -> Result<()> {
        let cid_bytes = cid_link.0.to_bytes();
        let cid = Cid::try_from(cid_bytes.as_slice())
            .map_err(|e| anyhow!("invalid CID format: {}", e))?;

        let mut record_block = Vec::new();
        car_store
            .read_block_into(cid, &mut record_block)
            .await
            .map_err(|e| anyhow!("record block not found for CID {:?}: {}", cid_link, e))?;

        match collection {
            LEXICON_FEED_POST => {
                let post: PostRecord =
                    serde_ipld_dagcbor::from_reader(Cursor::new(&record_block[..]))
                        .map_err(|e| anyhow!("could not decode post record: {}", e))?;

                let langs = post.langs.unwrap_or_default().join(",");

                self.broker
                    .publish_post_insert(
                        repo_did,
                        rkey,
                        &post.created_at,
                        &post.text,
                        post.reply.is_some(),
                        &langs,
                    )
                    .await?;

                metrics::POSTS_PUBLISHED.inc();
                debug!("Published post {}/{}", repo_did, rkey);
            }
            LEXICON_FEED_LIKE => {
                let like: LikeRecord =
                    serde_ipld_dagcbor::from_reader(Cursor::new(&record_block[..]))
                        .map_err(|e| anyhow!("could not decode like record: {}", e))?;

                let subject = AtUri::parse(&like.subject.uri)
                    .map_err(|e| anyhow!("could not parse like subject URI: {}", e))?;

                self.broker
                    .publish_post_like(&subject.did, &subject.rkey)
                    .await?;

                metrics::LIKES_PUBLISHED.inc();
                debug!("Published like for {}/{}", subject.did, subject.rkey);
            }
            _ => {}
        }

        Ok(())
    }
}

impl CommitHandler for IngestHandler {
    async fn handle_commit(&self, commit: &Commit) -> Result<()> {
        metrics::COMMITS_PROCESSED.inc();

        // Only log occasional commits for processing stats
        if commit.seq % 5000 == 0 {
            debug!("Processing commit at sequence: {}", commit.seq);
        }

        let mut car_store = match CarStore::open(Cursor::new(&commit.blocks[..])).await {
            Ok(store) => store,
            Err(e) => {
                warn!("Could not parse repo, skipping: {}", e);
                metrics::OPS_SKIPPED.inc();
                return Ok(());
            }
        };

        let repo_did = commit.repo.as_str();

        for op in &commit.ops {
            let parts: Vec<&str> = op.path.split('/').collect();
            if parts.len() < 2 {
                continue;
            }

            let collection = parts[0];
            let rkey = parts[1];

            match op.action.as_str() {
                "create" | "update" => {
                    if collection != LEXICON_FEED_POST && collection != LEXICON_FEED_LIKE {
                        continue; // Skip unhandled types silently
                    }

                    let Some(cid_link) = &op.cid else {
                        continue;
                    };

                    if let Err(e) = self
                        .handle_create(&mut car_store, repo_did, collection, rkey, cid_link)
                        .await
                    {
                        debug!("Could not process operation, skipping: {}", e);
                        metrics::OPS_SKIPPED.inc();
                    }
                }
                "delete" => {
                    // Deletes bypass classification and propagate straight
                    // to the store.
                    if collection != LEXICON_FEED_POST {
                        continue;
                    }

                    if let Err(e) = db::delete_post(&self.db_pool, repo_did, rkey).await {
                        warn!("Could not delete post, skipping: {}", e);
                    } else {
                        debug!("Deleted post {}/{}", repo_did, rkey);
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Runs the firehose ingester until shutdown. Loss of the connection is
/// fatal and bubbles up to the process supervisor; per-operation decode
/// failures are logged and skipped.
pub async fn run_firehose_ingester(
    bgs_url: String,
    broker: Broker,
    db_pool: Pool<Postgres>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    info!("Starting firehose ingester");

    let mut subscription = RepoSubscription::new(&bgs_url).await?;

    let handler = IngestHandler { broker, db_pool };

    loop {
        tokio::select! {
            frame = subscription.next() => {
                match frame {
                    Some(Ok(Frame::Message(Some(t), message))) => {
                        if t.as_str() != "#commit" {
                            debug!("Received message of type: {}", t);
                            continue;
                        }

                        match serde_ipld_dagcbor::from_reader::<Commit, _>(&message.body[..]) {
                            Ok(commit) => {
                                if let Err(e) = handler.handle_commit(&commit).await {
                                    error!("Error handling commit: {}", e);
                                }
                            }
                            Err(e) => {
                                warn!("Failed to parse commit, skipping: {}", e);
                                metrics::OPS_SKIPPED.inc();
                            }
                        }
                    }
                    Some(Ok(Frame::Message(None, _))) => {
                        // Ignore messages with no type
                    }
                    Some(Ok(Frame::Error(_))) => {
                        return Err(anyhow!("received error frame from firehose"));
                    }
                    Some(Err(e)) => {
                        // A frame that cannot be decoded is dropped; the
                        // stream itself is still healthy.
                        warn!("Error parsing frame, skipping: {}", e);
                        metrics::OPS_SKIPPED.inc();
                    }
                    None => {
                        return Err(anyhow!("firehose connection closed"));
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Received shutdown signal, stopping firehose ingester");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_repos_url() {
        assert_eq!(
            subscribe_repos_url("https://bsky.network"),
            "wss://bsky.network/xrpc/com.atproto.sync.subscribeRepos"
        );
        assert_eq!(
            subscribe_repos_url("wss://bsky.network/"),
            "wss://bsky.network/xrpc/com.atproto.sync.subscribeRepos"
        );
    }

    #[test]
    fn test_post_record_decoding() {
        // Reply presence is carried as a flag, and langs may be absent
        let record = serde_json::json!({
            "$type": "app.bsky.feed.post",
            "text": "hallo",
            "createdAt": "2024-05-01T12:00:00.123456789Z",
            "langs": ["de"],
        });

        let mut buf = Vec::new();
        serde_ipld_dagcbor::to_writer(&mut buf, &record).unwrap();

        let post: PostRecord = serde_ipld_dagcbor::from_reader(Cursor::new(&buf[..])).unwrap();
        assert_eq!(post.text, "hallo");
        assert_eq!(post.created_at, "2024-05-01T12:00:00.123456789Z");
        assert!(post.reply.is_none());
        assert_eq!(post.langs.as_deref(), Some(&["de".to_string()][..]));

        let reply_record = serde_json::json!({
            "text": "re: hallo",
            "createdAt": "2024-05-01T12:00:00Z",
            "reply": {
                "root": {"uri": "at://did:plc:a/app.bsky.feed.post/r1", "cid": "bafy"},
                "parent": {"uri": "at://did:plc:a/app.bsky.feed.post/r1", "cid": "bafy"},
            },
        });

        let mut buf = Vec::new();
        serde_ipld_dagcbor::to_writer(&mut buf, &reply_record).unwrap();

        let post: PostRecord = serde_ipld_dagcbor::from_reader(Cursor::new(&buf[..])).unwrap();
        assert!(post.reply.is_some());
        assert!(post.langs.is_none());
    }

    #[test]
    fn test_like_record_decoding() {
        let record = serde_json::json!({
            "$type": "app.bsky.feed.like",
            "subject": {"uri": "at://did:plc:a/app.bsky.feed.post/r1", "cid": "bafy"},
            "createdAt": "2024-05-01T12:00:00Z",
        });

        let mut buf = Vec::new();
        serde_ipld_dagcbor::to_writer(&mut buf, &record).unwrap();

        let like: LikeRecord = serde_ipld_dagcbor::from_reader(Cursor::new(&buf[..])).unwrap();
        let subject = AtUri::parse(&like.subject.uri).unwrap();
        assert_eq!(subject.did, "did:plc:a");
        assert_eq!(subject.rkey, "r1");
    }
}
