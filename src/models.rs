use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sqlx::types::time::OffsetDateTime;

pub const LEXICON_FEED_POST: &str = "app.bsky.feed.post";
pub const LEXICON_FEED_LIKE: &str = "app.bsky.feed.like";

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub did: String,
    pub rkey: String,
    pub created_at: OffsetDateTime,
    pub text: String,
    pub reply: bool,
    pub langs: Vec<String>,
    pub likes: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Feed {
    pub did: String,
    pub rkey: String,
    pub pinned_did: String,
    pub pinned_rkey: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FeedPost {
    pub feed_did: String,
    pub feed_rkey: String,
    pub post_did: String,
    pub post_rkey: String,
    pub weight: i32,
}

/// `(did, rkey)` reference returned by the feed-skeleton queries.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PostRef {
    pub did: String,
    pub rkey: String,
}

impl PostRef {
    pub fn to_at_uri(&self) -> String {
        format!("at://{}/{}/{}", self.did, LEXICON_FEED_POST, self.rkey)
    }
}

/// Parsed `at://<did>/<collection>/<rkey>` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtUri {
    pub did: String,
    pub collection: String,
    pub rkey: String,
}

impl AtUri {
    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw
            .strip_prefix("at://")
            .ok_or_else(|| anyhow!("URI is missing the at:// scheme: {}", raw))?;

        let mut parts = rest.splitn(3, '/');
        let did = parts.next().unwrap_or_default();
        let collection = parts.next().unwrap_or_default();
        let rkey = parts.next().unwrap_or_default();

        if did.is_empty() || collection.is_empty() || rkey.is_empty() {
            return Err(anyhow!("URI is missing components: {}", raw));
        }

        Ok(Self {
            did: did.to_string(),
            collection: collection.to_string(),
            rkey: rkey.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_uri_parsing() {
        let uri = AtUri::parse("at://did:plc:abc123/app.bsky.feed.post/3k44deefuvz2c").unwrap();

        assert_eq!(uri.did, "did:plc:abc123");
        assert_eq!(uri.collection, "app.bsky.feed.post");
        assert_eq!(uri.rkey, "3k44deefuvz2c");

        assert!(AtUri::parse("https://example.com/foo").is_err());
        assert!(AtUri::parse("at://did:plc:abc123").is_err());
        assert!(AtUri::parse("at://did:plc:abc123/app.bsky.feed.post").is_err());
        assert!(AtUri::parse("at://").is_err());
    }

    #[test]
    fn test_post_ref_uri() {
        let post = PostRef {
            did: "did:plc:abc123".to_string(),
            rkey: "r1".to_string(),
        };

        assert_eq!(post.to_at_uri(), "at://did:plc:abc123/app.bsky.feed.post/r1");

        // The skeleton cursor is the URI of the last post, so it must
        // round-trip through the parser.
        let parsed = AtUri::parse(&post.to_at_uri()).unwrap();
        assert_eq!(parsed.did, post.did);
        assert_eq!(parsed.rkey, post.rkey);
    }
}
