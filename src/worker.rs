use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::StreamExt;
use sqlx::{Pool, Postgres};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, info, warn};

use crate::blobstore::BlobStore;
use crate::broker::{
    split_feed_payload, value_as_string, Broker, StreamEntry, STREAM_POST_INSERT,
    STREAM_POST_LIKE, TOPIC_FEED_DELETE, TOPIC_FEED_UPSERT,
};
use crate::db;
use crate::pool::ClassifierPool;

/// Per-field validation failures for broker messages. A message failing any
/// of these is dropped and logged; the stream continues.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("message did not contain DID")]
    MissingDid,
    #[error("message contained invalid DID")]
    InvalidDid,
    #[error("message did not contain rkey")]
    MissingRkey,
    #[error("message contained invalid rkey")]
    InvalidRkey,
    #[error("message did not contain createdAt")]
    MissingCreatedAt,
    #[error("message contained invalid createdAt")]
    InvalidCreatedAt,
    #[error("message did not contain text")]
    MissingText,
    #[error("message contained invalid text")]
    InvalidText,
    #[error("message did not contain reply")]
    MissingReply,
    #[error("message contained invalid reply")]
    InvalidReply,
    #[error("message did not contain langs")]
    MissingLangs,
    #[error("message contained invalid langs")]
    InvalidLangs,
}

fn string_field(
    entry: &StreamEntry,
    key: &str,
    missing: MessageError,
    invalid: MessageError,
) -> Result<String, MessageError> {
    let value = entry.map.get(key).ok_or(missing)?;

    value_as_string(value).ok_or(invalid)
}

/// `createdAt` is RFC 3339 with optional fractional seconds; the upstream
/// sometimes omits the timezone, in which case UTC is assumed.
pub fn parse_created_at(raw: &str) -> Result<OffsetDateTime, MessageError> {
    if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Ok(parsed);
    }

    let fallback = format_description!(
        version = 2,
        "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
    );

    PrimitiveDateTime::parse(raw, fallback)
        .map(|t| t.assume_utc())
        .map_err(|_| MessageError::InvalidCreatedAt)
}

/// Typed view of a `post/insert` stream entry. All dynamic-map handling is
/// confined to `from_entry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostMessage {
    pub did: String,
    pub rkey: String,
    pub created_at: OffsetDateTime,
    pub text: String,
    pub reply: bool,
    pub langs: Vec<String>,
}

impl PostMessage {
    pub fn from_entry(entry: &StreamEntry) -> Result<Self, MessageError> {
        let did = string_field(entry, "did", MessageError::MissingDid, MessageError::InvalidDid)?;
        let rkey = string_field(
            entry,
            "rkey",
            MessageError::MissingRkey,
            MessageError::InvalidRkey,
        )?;
        let raw_created_at = string_field(
            entry,
            "createdAt",
            MessageError::MissingCreatedAt,
            MessageError::InvalidCreatedAt,
        )?;
        let created_at = parse_created_at(&raw_created_at)?;
        let text = string_field(
            entry,
            "text",
            MessageError::MissingText,
            MessageError::InvalidText,
        )?;
        let reply = string_field(
            entry,
            "reply",
            MessageError::MissingReply,
            MessageError::InvalidReply,
        )? == "true";
        let raw_langs = string_field(
            entry,
            "langs",
            MessageError::MissingLangs,
            MessageError::InvalidLangs,
        )?;

        let langs = if raw_langs.is_empty() {
            Vec::new()
        } else {
            raw_langs.split(',').map(str::to_string).collect()
        };

        Ok(Self {
            did,
            rkey,
            created_at,
            text,
            reply,
            langs,
        })
    }
}

/// Typed view of a `post/like` stream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LikeMessage {
    pub did: String,
    pub rkey: String,
}

impl LikeMessage {
    pub fn from_entry(entry: &StreamEntry) -> Result<Self, MessageError> {
        Ok(Self {
            did: string_field(entry, "did", MessageError::MissingDid, MessageError::InvalidDid)?,
            rkey: string_field(
                entry,
                "rkey",
                MessageError::MissingRkey,
                MessageError::InvalidRkey,
            )?,
        })
    }
}

/// Consumes `post/insert`, creating and classifying posts. A duplicate
/// insert fails on the unique key and is skipped; redelivery makes that
/// benign, if noisy.
pub async fn run_insert_consumer(
    broker: Broker,
    db_pool: Pool<Postgres>,
    pool: Arc<ClassifierPool>,
) -> Result<()> {
    let consumer = uuid::Uuid::new_v4().to_string();
    let mut reader = broker.stream_reader(STREAM_POST_INSERT, &consumer).await?;

    info!("Consuming post inserts as {}", consumer);

    loop {
        let entries = reader.read().await?;

        for entry in entries {
            match PostMessage::from_entry(&entry) {
                Ok(message) => {
                    match db::create_post(
                        &db_pool,
                        &message.did,
                        &message.rkey,
                        message.created_at,
                        &message.text,
                        message.reply,
                        &message.langs,
                    )
                    .await
                    {
                        Ok(post) => {
                            debug!("Created post {}/{}", post.did, post.rkey);

                            if let Err(e) = pool.classify(&db_pool, &post).await {
                                warn!("Could not classify post, skipping: {}", e);
                            }
                        }
                        Err(e) => warn!("Could not insert post, skipping: {}", e),
                    }
                }
                Err(e) => warn!("Dropping malformed post message: {}", e),
            }

            if let Err(e) = reader.ack(&entry.id).await {
                warn!("Could not ack post message: {}", e);
            }
        }
    }
}

/// Consumes `post/like`, bumping counters and re-classifying. A like for a
/// post this worker group has never seen is a benign no-op; likes and
/// inserts are not ordered across streams.
pub async fn run_like_consumer(
    broker: Broker,
    db_pool: Pool<Postgres>,
    pool: Arc<ClassifierPool>,
) -> Result<()> {
    let consumer = uuid::Uuid::new_v4().to_string();
    let mut reader = broker.stream_reader(STREAM_POST_LIKE, &consumer).await?;

    info!("Consuming post likes as {}", consumer);

    loop {
        let entries = reader.read().await?;

        for entry in entries {
            match LikeMessage::from_entry(&entry) {
                Ok(message) => match db::like_post(&db_pool, &message.did, &message.rkey).await {
                    Ok(Some(post)) => {
                        debug!("Liked post {}/{}", post.did, post.rkey);

                        if let Err(e) = pool.classify(&db_pool, &post).await {
                            warn!("Could not classify post, skipping: {}", e);
                        }
                    }
                    Ok(None) => {
                        debug!(
                            "Like for unknown post {}/{}, skipping",
                            message.did, message.rkey
                        );
                    }
                    Err(e) => warn!("Could not like post, skipping: {}", e),
                },
                Err(e) => warn!("Dropping malformed like message: {}", e),
            }

            if let Err(e) = reader.ack(&entry.id).await {
                warn!("Could not ack like message: {}", e);
            }
        }
    }
}

pub async fn run_feed_upsert_listener(
    broker: Broker,
    blobs: Arc<BlobStore>,
    pool: Arc<ClassifierPool>,
) -> Result<()> {
    let mut pubsub = broker.subscribe(TOPIC_FEED_UPSERT).await?;
    let mut messages = pubsub.on_message();

    info!("Listening for feed upserts");

    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not read feed upsert payload, skipping: {}", e);
                continue;
            }
        };

        let Some((did, rkey)) = split_feed_payload(&payload) else {
            warn!("Malformed feed upsert payload, skipping: {}", payload);
            continue;
        };

        if let Err(e) = pool.fetch(&blobs, &did, &rkey).await {
            warn!("Could not fetch classifier, skipping: {}", e);
            continue;
        }

        debug!("Upserted classifier for feed {}/{}", did, rkey);
    }

    Err(anyhow!("feed upsert subscription closed"))
}

pub async fn run_feed_delete_listener(broker: Broker, pool: Arc<ClassifierPool>) -> Result<()> {
    let mut pubsub = broker.subscribe(TOPIC_FEED_DELETE).await?;
    let mut messages = pubsub.on_message();

    info!("Listening for feed deletes");

    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not read feed delete payload, skipping: {}", e);
                continue;
            }
        };

        let Some((did, rkey)) = split_feed_payload(&payload) else {
            warn!("Malformed feed delete payload, skipping: {}", payload);
            continue;
        };

        if let Err(e) = pool.remove(&did, &rkey).await {
            warn!("Could not remove classifier, skipping: {}", e);
            continue;
        }

        debug!("Deleted classifier for feed {}/{}", did, rkey);
    }

    Err(anyhow!("feed delete subscription closed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value;
    use std::collections::HashMap;
    use time::macros::datetime;

    fn entry(fields: &[(&str, &str)]) -> StreamEntry {
        let mut map = HashMap::new();
        for (key, value) in fields {
            map.insert(
                key.to_string(),
                Value::BulkString(value.as_bytes().to_vec()),
            );
        }

        StreamEntry {
            id: "0-1".to_string(),
            map,
        }
    }

    fn post_entry() -> StreamEntry {
        entry(&[
            ("did", "did:plc:a"),
            ("rkey", "r1"),
            ("createdAt", "2024-05-01T12:00:00Z"),
            ("text", "hallo"),
            ("reply", "false"),
            ("langs", "de"),
        ])
    }

    #[test]
    fn test_post_message_from_entry() {
        let message = PostMessage::from_entry(&post_entry()).unwrap();

        assert_eq!(message.did, "did:plc:a");
        assert_eq!(message.rkey, "r1");
        assert_eq!(message.created_at, datetime!(2024-05-01 12:00:00 UTC));
        assert_eq!(message.text, "hallo");
        assert!(!message.reply);
        assert_eq!(message.langs, vec!["de".to_string()]);
    }

    #[test]
    fn test_post_message_missing_fields() {
        let mut e = post_entry();
        e.map.remove("did");
        assert_eq!(
            PostMessage::from_entry(&e),
            Err(MessageError::MissingDid)
        );

        let mut e = post_entry();
        e.map.remove("langs");
        assert_eq!(
            PostMessage::from_entry(&e),
            Err(MessageError::MissingLangs)
        );
    }

    #[test]
    fn test_post_message_non_string_field() {
        let mut e = post_entry();
        e.map.insert("text".to_string(), Value::Int(7));
        assert_eq!(
            PostMessage::from_entry(&e),
            Err(MessageError::InvalidText)
        );
    }

    #[test]
    fn test_post_message_langs() {
        let mut e = post_entry();
        e.map.insert(
            "langs".to_string(),
            Value::BulkString(b"de,en-US".to_vec()),
        );
        let message = PostMessage::from_entry(&e).unwrap();
        assert_eq!(message.langs, vec!["de".to_string(), "en-US".to_string()]);

        // Empty langs are accepted and ordering is retained as provided
        let mut e = post_entry();
        e.map.insert("langs".to_string(), Value::BulkString(Vec::new()));
        let message = PostMessage::from_entry(&e).unwrap();
        assert!(message.langs.is_empty());
    }

    #[test]
    fn test_post_message_utf8_text() {
        let mut e = post_entry();
        e.map.insert(
            "text".to_string(),
            Value::BulkString("🦋 skeets über alles 🝊".as_bytes().to_vec()),
        );
        let message = PostMessage::from_entry(&e).unwrap();
        assert_eq!(message.text, "🦋 skeets über alles 🝊");
    }

    #[test]
    fn test_created_at_rfc3339() {
        assert_eq!(
            parse_created_at("2024-05-01T12:00:00.123456789Z").unwrap(),
            datetime!(2024-05-01 12:00:00.123456789 UTC)
        );
        assert_eq!(
            parse_created_at("2024-05-01T14:00:00+02:00").unwrap(),
            datetime!(2024-05-01 12:00:00 UTC)
        );
    }

    #[test]
    fn test_created_at_zoneless_fallback() {
        // The upstream sometimes omits the timezone; UTC is assumed
        assert_eq!(
            parse_created_at("2024-05-01T12:00:00.123456").unwrap(),
            datetime!(2024-05-01 12:00:00.123456 UTC)
        );
        assert_eq!(
            parse_created_at("2024-05-01T12:00:00").unwrap(),
            datetime!(2024-05-01 12:00:00 UTC)
        );
    }

    #[test]
    fn test_created_at_garbage_rejected() {
        assert_eq!(
            parse_created_at("not-a-date"),
            Err(MessageError::InvalidCreatedAt)
        );
    }

    #[test]
    fn test_like_message_from_entry() {
        let message =
            LikeMessage::from_entry(&entry(&[("did", "did:plc:a"), ("rkey", "r1")])).unwrap();
        assert_eq!(message.did, "did:plc:a");
        assert_eq!(message.rkey, "r1");

        assert_eq!(
            LikeMessage::from_entry(&entry(&[("did", "did:plc:a")])),
            Err(MessageError::MissingRkey)
        );
    }
}
