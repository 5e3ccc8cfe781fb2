use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, Value};
use tracing::{debug, info};

/// Durable, consumer-grouped streams: post traffic is load-balanced across
/// workers with at-least-once delivery.
pub const STREAM_POST_INSERT: &str = "post/insert";
pub const STREAM_POST_LIKE: &str = "post/like";

/// Ephemeral fan-out topics: every worker keeps its own classifier pool, so
/// every worker needs its own copy of each lifecycle event.
pub const TOPIC_FEED_UPSERT: &str = "feed/upsert";
pub const TOPIC_FEED_DELETE: &str = "feed/delete";

/// Messages are claimed in batches of this size.
const READ_COUNT: usize = 10;

/// Returned when a consumer group already exists; creation is idempotent.
const BUSYGROUP: &str = "BUSYGROUP";

#[derive(Clone)]
pub struct Broker {
    client: Client,
    conn: MultiplexedConnection,
}

impl Broker {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("invalid Redis URL")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("could not connect to Redis")?;

        info!("Connected to Redis");

        Ok(Self { client, conn })
    }

    /// Creates the post streams and their consumer groups. Each group is
    /// named after its stream; an existing group is not an error.
    pub async fn init_streams(&self) -> Result<()> {
        let mut conn = self.conn.clone();

        for stream in [STREAM_POST_INSERT, STREAM_POST_LIKE] {
            let res: redis::RedisResult<String> =
                conn.xgroup_create_mkstream(stream, stream, "$").await;

            match res {
                Ok(_) => debug!("Created stream {}", stream),
                Err(e) if e.code() == Some(BUSYGROUP) => {
                    debug!("Stream {} already exists", stream)
                }
                Err(e) => return Err(e).context("could not create stream"),
            }
        }

        Ok(())
    }

    pub async fn publish_post_insert(
        &self,
        did: &str,
        rkey: &str,
        created_at: &str,
        text: &str,
        reply: bool,
        langs: &str,
    ) -> Result<()> {
        let mut conn = self.conn.clone();

        let _: String = conn
            .xadd(
                STREAM_POST_INSERT,
                "*",
                &[
                    ("did", did),
                    ("rkey", rkey),
                    ("createdAt", created_at),
                    ("text", text),
                    ("reply", if reply { "true" } else { "false" }),
                    ("langs", langs),
                ],
            )
            .await?;

        Ok(())
    }

    pub async fn publish_post_like(&self, did: &str, rkey: &str) -> Result<()> {
        let mut conn = self.conn.clone();

        let _: String = conn
            .xadd(STREAM_POST_LIKE, "*", &[("did", did), ("rkey", rkey)])
            .await?;

        Ok(())
    }

    pub async fn publish_feed_upsert(&self, did: &str, rkey: &str) -> Result<()> {
        self.publish_topic(TOPIC_FEED_UPSERT, did, rkey).await
    }

    pub async fn publish_feed_delete(&self, did: &str, rkey: &str) -> Result<()> {
        self.publish_topic(TOPIC_FEED_DELETE, did, rkey).await
    }

    async fn publish_topic(&self, topic: &str, did: &str, rkey: &str) -> Result<()> {
        let mut conn = self.conn.clone();

        let _: () = conn.publish(topic, feed_payload(did, rkey)).await?;

        Ok(())
    }

    /// Subscribes to a fan-out topic on a dedicated pub/sub connection.
    pub async fn subscribe(&self, topic: &str) -> Result<redis::aio::PubSub> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;

        Ok(pubsub)
    }

    /// Opens a dedicated reader for one stream. Blocking reads would stall
    /// every other command on a shared connection, so each consumer loop
    /// gets its own.
    pub async fn stream_reader(&self, stream: &'static str, consumer: &str) -> Result<StreamReader> {
        let conn = self.client.get_multiplexed_async_connection().await?;

        Ok(StreamReader {
            conn,
            ack: self.conn.clone(),
            stream,
            consumer: consumer.to_string(),
        })
    }
}

pub struct StreamReader {
    conn: MultiplexedConnection,
    ack: MultiplexedConnection,
    stream: &'static str,
    consumer: String,
}

#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub map: std::collections::HashMap<String, Value>,
}

impl StreamReader {
    /// Claims the next batch for this consumer, blocking until messages
    /// arrive.
    pub async fn read(&mut self) -> Result<Vec<StreamEntry>> {
        let opts = StreamReadOptions::default()
            .group(self.stream, &self.consumer)
            .count(READ_COUNT)
            .block(0);

        let reply: StreamReadReply = self
            .conn
            .xread_options(&[self.stream], &[">"], &opts)
            .await?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                entries.push(StreamEntry {
                    id: id.id,
                    map: id.map,
                });
            }
        }

        Ok(entries)
    }

    pub async fn ack(&mut self, id: &str) -> Result<()> {
        let _: i64 = self.ack.xack(self.stream, self.stream, &[id]).await?;

        Ok(())
    }
}

/// Lifecycle notifications carry the feed key as `did/rkey`.
pub fn feed_payload(did: &str, rkey: &str) -> String {
    format!("{}/{}", did, rkey)
}

pub fn split_feed_payload(payload: &str) -> Option<(String, String)> {
    let (did, rkey) = payload.rsplit_once('/')?;
    if did.is_empty() || rkey.is_empty() {
        return None;
    }

    Some((did.to_string(), rkey.to_string()))
}

/// Stream-message fields arrive as untyped Redis values; only strings are
/// accepted.
pub fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_payload_round_trip() {
        let payload = feed_payload("did:plc:abc123", "my-feed");
        assert_eq!(payload, "did:plc:abc123/my-feed");

        let (did, rkey) = split_feed_payload(&payload).unwrap();
        assert_eq!(did, "did:plc:abc123");
        assert_eq!(rkey, "my-feed");

        assert!(split_feed_payload("no-separator").is_none());
        assert!(split_feed_payload("/rkey-only").is_none());
        assert!(split_feed_payload("did-only/").is_none());
    }

    #[test]
    fn test_value_as_string() {
        assert_eq!(
            value_as_string(&Value::BulkString(b"hallo".to_vec())),
            Some("hallo".to_string())
        );
        assert_eq!(
            value_as_string(&Value::SimpleString("ok".to_string())),
            Some("ok".to_string())
        );
        assert_eq!(value_as_string(&Value::Int(3)), None);
        assert_eq!(value_as_string(&Value::Nil), None);
    }
}
