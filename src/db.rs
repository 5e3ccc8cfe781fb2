use anyhow::Result;
use sqlx::types::time::OffsetDateTime;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use tracing::info;

use crate::models::{Feed, FeedPost, Post, PostRef};

/// Postgres error code raised when a feed-post upsert races a feed delete.
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Opens the Postgres pool, sized from the host's core count unless
/// `DATABASE_MAX_CONNECTIONS` overrides it. Only the manager migrates;
/// workers consume the schema as-is.
pub async fn init_db_pool(database_url: &str, migrate: bool) -> Result<Pool<Postgres>> {
    let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(num_cpus::get() as u32 * 2 + 1);

    info!(
        "Connecting to PostgreSQL with up to {} connections",
        max_connections
    );

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    if migrate {
        sqlx::migrate!("./migrations").run(&pool).await?;
    }

    Ok(pool)
}

/// Whether an error is a foreign-key violation, which callers treat as a
/// benign race between a feed-post upsert and a feed delete.
pub fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some(FOREIGN_KEY_VIOLATION)
        }
        _ => false,
    }
}

pub async fn create_post(
    pool: &Pool<Postgres>,
    did: &str,
    rkey: &str,
    created_at: OffsetDateTime,
    text: &str,
    reply: bool,
    langs: &[String],
) -> Result<Post, sqlx::Error> {
    sqlx::query_as::<_, Post>(
        r#"
        insert into posts (did, rkey, created_at, text, reply, langs, likes)
        values ($1, $2, $3, $4, $5, $6, 0)
        returning did, rkey, created_at, text, reply, langs, likes
        "#,
    )
    .bind(did)
    .bind(rkey)
    .bind(created_at)
    .bind(text)
    .bind(reply)
    .bind(langs)
    .fetch_one(pool)
    .await
}

/// Increments the like counter. Returns `None` when the post is unknown,
/// which happens whenever a like overtakes its post on the broker.
pub async fn like_post(
    pool: &Pool<Postgres>,
    did: &str,
    rkey: &str,
) -> Result<Option<Post>, sqlx::Error> {
    sqlx::query_as::<_, Post>(
        r#"
        update posts
        set likes = likes + 1
        where did = $1 and rkey = $2
        returning did, rkey, created_at, text, reply, langs, likes
        "#,
    )
    .bind(did)
    .bind(rkey)
    .fetch_optional(pool)
    .await
}

pub async fn delete_post(pool: &Pool<Postgres>, did: &str, rkey: &str) -> Result<()> {
    sqlx::query("delete from posts where did = $1 and rkey = $2")
        .bind(did)
        .bind(rkey)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn delete_all_posts(pool: &Pool<Postgres>) -> Result<()> {
    sqlx::query("delete from posts").execute(pool).await?;

    Ok(())
}

pub async fn delete_posts_for_did(pool: &Pool<Postgres>, did: &str) -> Result<()> {
    sqlx::query("delete from posts where did = $1")
        .bind(did)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn get_posts_for_did(pool: &Pool<Postgres>, did: &str) -> Result<Vec<Post>> {
    let posts = sqlx::query_as::<_, Post>(
        "select did, rkey, created_at, text, reply, langs, likes from posts where did = $1",
    )
    .bind(did)
    .fetch_all(pool)
    .await?;

    Ok(posts)
}

/// Creates the feed row if it does not exist. Pinned-post coordinates are
/// left untouched on conflict so a classifier re-upload does not clear them.
pub async fn upsert_feed(pool: &Pool<Postgres>, did: &str, rkey: &str) -> Result<()> {
    sqlx::query("insert into feeds (did, rkey) values ($1, $2) on conflict (did, rkey) do nothing")
        .bind(did)
        .bind(rkey)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn update_feed_pins(
    pool: &Pool<Postgres>,
    did: &str,
    rkey: &str,
    pinned_did: &str,
    pinned_rkey: &str,
) -> Result<()> {
    sqlx::query(
        "update feeds set pinned_did = $3, pinned_rkey = $4 where did = $1 and rkey = $2",
    )
    .bind(did)
    .bind(rkey)
    .bind(pinned_did)
    .bind(pinned_rkey)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_feeds(pool: &Pool<Postgres>) -> Result<Vec<Feed>> {
    let feeds =
        sqlx::query_as::<_, Feed>("select did, rkey, pinned_did, pinned_rkey from feeds")
            .fetch_all(pool)
            .await?;

    Ok(feeds)
}

pub async fn get_feeds_for_did(pool: &Pool<Postgres>, did: &str) -> Result<Vec<Feed>> {
    let feeds = sqlx::query_as::<_, Feed>(
        "select did, rkey, pinned_did, pinned_rkey from feeds where did = $1",
    )
    .bind(did)
    .fetch_all(pool)
    .await?;

    Ok(feeds)
}

/// Removes the feed row; dependent feed-post rows go with it via cascade.
pub async fn delete_feed(pool: &Pool<Postgres>, did: &str, rkey: &str) -> Result<()> {
    sqlx::query("delete from feeds where did = $1 and rkey = $2")
        .bind(did)
        .bind(rkey)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn upsert_feed_post(
    pool: &Pool<Postgres>,
    feed_did: &str,
    feed_rkey: &str,
    post_did: &str,
    post_rkey: &str,
    weight: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        insert into feed_posts (feed_did, feed_rkey, post_did, post_rkey, weight)
        values ($1, $2, $3, $4, $5)
        on conflict (feed_did, feed_rkey, post_did, post_rkey) do update
        set weight = excluded.weight
        "#,
    )
    .bind(feed_did)
    .bind(feed_rkey)
    .bind(post_did)
    .bind(post_rkey)
    .bind(weight)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn delete_feed_posts_for_did(pool: &Pool<Postgres>, did: &str) -> Result<()> {
    sqlx::query("delete from feed_posts where post_did = $1")
        .bind(did)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn get_feed_posts_for_did(pool: &Pool<Postgres>, did: &str) -> Result<Vec<FeedPost>> {
    let feed_posts = sqlx::query_as::<_, FeedPost>(
        r#"
        select feed_did, feed_rkey, post_did, post_rkey, weight
        from feed_posts
        where post_did = $1 or feed_did = $1
        "#,
    )
    .bind(did)
    .fetch_all(pool)
    .await?;

    Ok(feed_posts)
}

/// First page of a feed: weight-ordered references to posts newer than the
/// TTL cutoff.
pub async fn get_feed_posts(
    pool: &Pool<Postgres>,
    feed_did: &str,
    feed_rkey: &str,
    min_created_at: OffsetDateTime,
    limit: i32,
) -> Result<Vec<PostRef>> {
    let posts = sqlx::query_as::<_, PostRef>(
        r#"
        select p.did, p.rkey
        from posts p
            join feed_posts fp on p.did = fp.post_did and p.rkey = fp.post_rkey
        where fp.feed_did = $1
            and fp.feed_rkey = $2
            and p.created_at > $3
        order by fp.weight desc
        limit $4
        "#,
    )
    .bind(feed_did)
    .bind(feed_rkey)
    .bind(min_created_at)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(posts)
}

/// Subsequent pages: same selection, additionally bounded above by the
/// cursor post's creation time. The cursor is a time predicate even though
/// the primary ordering is weight; posts sharing a created_at can straddle
/// a page boundary.
pub async fn get_feed_posts_cursor(
    pool: &Pool<Postgres>,
    feed_did: &str,
    feed_rkey: &str,
    min_created_at: OffsetDateTime,
    limit: i32,
    cursor_did: &str,
    cursor_rkey: &str,
) -> Result<Vec<PostRef>> {
    let posts = sqlx::query_as::<_, PostRef>(
        r#"
        select p.did, p.rkey
        from posts p
            join feed_posts fp on p.did = fp.post_did and p.rkey = fp.post_rkey
        where fp.feed_did = $1
            and fp.feed_rkey = $2
            and p.created_at > $3
            and p.created_at < (
                select created_at
                from posts
                where did = $5 and rkey = $6
            )
        order by fp.weight desc
        limit $4
        "#,
    )
    .bind(feed_did)
    .bind(feed_rkey)
    .bind(min_created_at)
    .bind(limit)
    .bind(cursor_did)
    .bind(cursor_rkey)
    .fetch_all(pool)
    .await?;

    Ok(posts)
}
