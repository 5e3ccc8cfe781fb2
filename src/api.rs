use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    body::Bytes,
    error_handling::HandleErrorLayer,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{delete, get},
    BoxError, Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Postgres};
use time::OffsetDateTime;
use tower::timeout::TimeoutLayer;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::auth;
use crate::blobstore::BlobStore;
use crate::broker::Broker;
use crate::config::ManagerConfig;
use crate::db;
use crate::error::ApiError;
use crate::models::{AtUri, Feed, FeedPost, Post, PostRef};

// Response models
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FeedSkeleton {
    pub feed: Vec<FeedSkeletonPost>,
    pub cursor: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FeedSkeletonPost {
    pub post: String,
}

impl FeedSkeleton {
    /// The cursor is the at-uri of the page's last post, or empty when the
    /// page is empty.
    pub fn from_posts(posts: &[PostRef]) -> Self {
        let feed: Vec<FeedSkeletonPost> = posts
            .iter()
            .map(|p| FeedSkeletonPost {
                post: p.to_at_uri(),
            })
            .collect();

        let cursor = feed.last().map(|p| p.post.clone()).unwrap_or_default();

        Self { feed, cursor }
    }
}

#[derive(Serialize)]
struct WellKnownDidDocument {
    #[serde(rename = "@context")]
    context: Vec<String>,
    id: String,
    service: Vec<WellKnownService>,
}

#[derive(Serialize)]
struct WellKnownService {
    id: String,
    #[serde(rename = "type")]
    service_type: String,
    #[serde(rename = "serviceEndpoint")]
    service_endpoint: String,
}

#[derive(Serialize)]
struct AdminFeed {
    rkey: String,
    #[serde(rename = "pinnedDID")]
    pinned_did: String,
    #[serde(rename = "pinnedRkey")]
    pinned_rkey: String,
}

#[derive(Serialize)]
struct UserData {
    feeds: Vec<Feed>,
    posts: Vec<Post>,
    #[serde(rename = "feedPosts")]
    feed_posts: Vec<FeedPost>,
}

// Request models
#[derive(Deserialize)]
struct FeedSkeletonQuery {
    feed: Option<String>,
    limit: Option<String>,
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct AdminQuery {
    service: Option<String>,
    rkey: Option<String>,
    #[serde(rename = "pinnedDID")]
    pinned_did: Option<String>,
    #[serde(rename = "pinnedRkey")]
    pinned_rkey: Option<String>,
    resource: Option<String>,
}

// API state
pub struct ApiState {
    pub db_pool: Pool<Postgres>,
    pub broker: Broker,
    pub blobs: Arc<BlobStore>,
    pub http: reqwest::Client,
    pub config: ManagerConfig,
}

/// Routes middleware failures through the error taxonomy: an elapsed
/// timeout maps to its 408 code, anything else is treated as internal.
async fn handle_middleware_error(error: BoxError) -> ApiError {
    if error.is::<tower::timeout::error::Elapsed>() {
        ApiError::Timeout
    } else {
        ApiError::Internal(anyhow::anyhow!("middleware failure: {}", error))
    }
}

pub fn create_router(state: Arc<ApiState>) -> Result<Router> {
    // CORS headers are emitted only for the configured origin; preflight
    // requests are answered by the layer before any handler runs.
    let origin = state.config.origin.parse::<HeaderValue>()?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::PUT, Method::PATCH, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    Ok(Router::new()
        .route("/xrpc/app.bsky.feed.getFeedSkeleton", get(get_feed_skeleton))
        .route("/.well-known/did.json", get(get_did_document))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .route(
            "/admin/feeds",
            get(list_feeds)
                .put(upsert_feed)
                .patch(patch_feed)
                .delete(remove_feed),
        )
        .route("/userdata", delete(delete_userdata))
        .route("/userdata/structured", get(get_userdata_structured))
        .route("/userdata/blob", get(get_userdata_blob))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_middleware_error))
                .layer(TimeoutLayer::new(Duration::from_secs(30))),
        )
        .layer(cors))
}

/// Resolves the caller's DID through their identity host. The resolved DID
/// is the only identity trusted for ownership checks.
async fn authorize(
    state: &ApiState,
    headers: &HeaderMap,
    service: Option<&str>,
) -> Result<String, ApiError> {
    let access_jwt = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or_default();

    if access_jwt.trim().is_empty() {
        return Err(ApiError::Unauthorized);
    }

    let service = service.unwrap_or_default();
    if service.trim().is_empty() {
        return Err(ApiError::MissingService);
    }

    let session = auth::get_session(&state.http, service, access_jwt)
        .await
        .map_err(|_| ApiError::Unauthorized)?;

    Ok(session.did)
}

async fn get_feed_skeleton(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<FeedSkeletonQuery>,
) -> Result<Json<FeedSkeleton>, ApiError> {
    let feed_url = query.feed.unwrap_or_default();
    if feed_url.trim().is_empty() {
        return Err(ApiError::MissingFeedUri);
    }

    let feed = AtUri::parse(&feed_url).map_err(|_| ApiError::InvalidFeedUri)?;

    let raw_limit = query.limit.unwrap_or_default();
    let raw_limit = if raw_limit.trim().is_empty() {
        "1"
    } else {
        raw_limit.trim()
    };

    let limit: i32 = raw_limit.parse().map_err(|_| ApiError::InvalidLimit)?;
    if limit < 1 {
        return Err(ApiError::InvalidLimit);
    }
    if limit > state.config.limit {
        return Err(ApiError::LimitTooHigh);
    }

    let min_created_at = OffsetDateTime::now_utc() - state.config.ttl;

    let cursor = query.cursor.unwrap_or_default();
    let posts = if cursor.trim().is_empty() {
        db::get_feed_posts(&state.db_pool, &feed.did, &feed.rkey, min_created_at, limit).await?
    } else {
        let cursor = AtUri::parse(&cursor).map_err(|_| ApiError::InvalidFeedCursor)?;

        db::get_feed_posts_cursor(
            &state.db_pool,
            &feed.did,
            &feed.rkey,
            min_created_at,
            limit,
            &cursor.did,
            &cursor.rkey,
        )
        .await?
    };

    Ok(Json(FeedSkeleton::from_posts(&posts)))
}

async fn get_did_document(State(state): State<Arc<ApiState>>) -> Json<WellKnownDidDocument> {
    Json(WellKnownDidDocument {
        context: vec!["https://www.w3.org/ns/did/v1".to_string()],
        id: state.config.feed_generator_did.clone(),
        service: vec![WellKnownService {
            id: "#bsky_fg".to_string(),
            service_type: "BskyFeedGenerator".to_string(),
            service_endpoint: state.config.feed_generator_url.clone(),
        }],
    })
}

async fn health_check(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").fetch_one(&state.db_pool).await {
        Ok(_) => (StatusCode::OK, "Healthy"),
        Err(e) => {
            error!("Health check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "Unhealthy: Database issue")
        }
    }
}

async fn metrics_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        crate::metrics::metrics_handler(),
    )
}

async fn list_feeds(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<AdminQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<AdminFeed>>, ApiError> {
    let did = authorize(&state, &headers, query.service.as_deref()).await?;

    let feeds = db::get_feeds_for_did(&state.db_pool, &did).await?;

    Ok(Json(
        feeds
            .into_iter()
            .map(|feed| AdminFeed {
                rkey: feed.rkey,
                pinned_did: feed.pinned_did,
                pinned_rkey: feed.pinned_rkey,
            })
            .collect(),
    ))
}

/// Uploads a classifier and upserts the feed's metadata, then tells every
/// worker to refresh its instance pool.
async fn upsert_feed(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<AdminQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let did = authorize(&state, &headers, query.service.as_deref()).await?;

    let rkey = query.rkey.unwrap_or_default();
    if rkey.trim().is_empty() {
        return Err(ApiError::MissingRkey);
    }

    state.blobs.put_classifier(&did, &rkey, body.to_vec()).await?;
    db::upsert_feed(&state.db_pool, &did, &rkey).await?;
    state.broker.publish_feed_upsert(&did, &rkey).await?;

    info!("Upserted feed {}/{}", did, rkey);

    Ok(StatusCode::OK)
}

/// Metadata-only update: the pinned-post coordinates change, the classifier
/// stays as uploaded.
async fn patch_feed(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<AdminQuery>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let did = authorize(&state, &headers, query.service.as_deref()).await?;

    let rkey = query.rkey.unwrap_or_default();
    if rkey.trim().is_empty() {
        return Err(ApiError::MissingRkey);
    }

    db::update_feed_pins(
        &state.db_pool,
        &did,
        &rkey,
        query.pinned_did.as_deref().unwrap_or_default(),
        query.pinned_rkey.as_deref().unwrap_or_default(),
    )
    .await?;
    state.broker.publish_feed_upsert(&did, &rkey).await?;

    Ok(StatusCode::OK)
}

async fn remove_feed(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<AdminQuery>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let did = authorize(&state, &headers, query.service.as_deref()).await?;

    let rkey = query.rkey.unwrap_or_default();
    if rkey.trim().is_empty() {
        return Err(ApiError::MissingRkey);
    }

    db::delete_feed(&state.db_pool, &did, &rkey).await?;
    state.blobs.delete_classifier(&did, &rkey).await?;
    state.broker.publish_feed_delete(&did, &rkey).await?;

    info!("Deleted feed {}/{}", did, rkey);

    Ok(StatusCode::OK)
}

/// Erasure request: removes every feed (blob and notification included),
/// every post, and every feed-post association of the caller.
async fn delete_userdata(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<AdminQuery>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let did = authorize(&state, &headers, query.service.as_deref()).await?;

    let feeds = db::get_feeds_for_did(&state.db_pool, &did).await?;
    for feed in feeds {
        db::delete_feed(&state.db_pool, &feed.did, &feed.rkey).await?;
        state.blobs.delete_classifier(&feed.did, &feed.rkey).await?;
        state.broker.publish_feed_delete(&feed.did, &feed.rkey).await?;
    }

    db::delete_feed_posts_for_did(&state.db_pool, &did).await?;
    db::delete_posts_for_did(&state.db_pool, &did).await?;

    info!("Deleted all user data for {}", did);

    Ok(StatusCode::OK)
}

async fn get_userdata_structured(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<AdminQuery>,
    headers: HeaderMap,
) -> Result<Json<UserData>, ApiError> {
    let did = authorize(&state, &headers, query.service.as_deref()).await?;

    let feeds = db::get_feeds_for_did(&state.db_pool, &did).await?;
    let posts = db::get_posts_for_did(&state.db_pool, &did).await?;
    let feed_posts = db::get_feed_posts_for_did(&state.db_pool, &did).await?;

    Ok(Json(UserData {
        feeds,
        posts,
        feed_posts,
    }))
}

async fn get_userdata_blob(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<AdminQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let did = authorize(&state, &headers, query.service.as_deref()).await?;

    let resource = query.resource.unwrap_or_default();
    if resource.trim().is_empty() {
        return Err(ApiError::MissingResource);
    }
    if resource != "classifier" {
        return Err(ApiError::InvalidResource);
    }

    let rkey = query.rkey.unwrap_or_default();
    if rkey.trim().is_empty() {
        return Err(ApiError::MissingRkey);
    }

    let blob = state.blobs.get_classifier(&did, &rkey).await?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        blob,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_skeleton_assembly() {
        let posts = vec![
            PostRef {
                did: "did:plc:a".to_string(),
                rkey: "r3".to_string(),
            },
            PostRef {
                did: "did:plc:b".to_string(),
                rkey: "r2".to_string(),
            },
        ];

        let skeleton = FeedSkeleton::from_posts(&posts);

        assert_eq!(skeleton.feed.len(), 2);
        assert_eq!(
            skeleton.feed[0].post,
            "at://did:plc:a/app.bsky.feed.post/r3"
        );
        // Cursor points at the last post of the page
        assert_eq!(skeleton.cursor, "at://did:plc:b/app.bsky.feed.post/r2");
    }

    #[test]
    fn test_empty_feed_skeleton_has_empty_cursor() {
        let skeleton = FeedSkeleton::from_posts(&[]);

        assert!(skeleton.feed.is_empty());
        assert_eq!(skeleton.cursor, "");
    }

    #[test]
    fn test_did_document_shape() {
        let doc = WellKnownDidDocument {
            context: vec!["https://www.w3.org/ns/did/v1".to_string()],
            id: "did:web:feeds.example.com".to_string(),
            service: vec![WellKnownService {
                id: "#bsky_fg".to_string(),
                service_type: "BskyFeedGenerator".to_string(),
                service_endpoint: "https://feeds.example.com".to_string(),
            }],
        };

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "@context": ["https://www.w3.org/ns/did/v1"],
                "id": "did:web:feeds.example.com",
                "service": [{
                    "id": "#bsky_fg",
                    "type": "BskyFeedGenerator",
                    "serviceEndpoint": "https://feeds.example.com",
                }],
            })
        );
    }
}
