//! ActivityPub endpoints
//!
//! - Actor document
//! - Inbox (personal and shared)
//! - Outbox, followers, following, liked, featured and tag collections
//! - Posts as Note and as Create

use axum::body::Bytes;
use axum::{
    Router,
    extract::{OriginalUri, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::Value;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{ACTIVITY_JSON, CollectionKind, InboxOutcome, with_context};
use crate::metrics::{
    FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL,
    HTTP_REQUEST_DURATION_SECONDS, HTTP_REQUESTS_TOTAL,
};

/// Create ActivityPub router
///
/// Routes:
/// - GET /activitypub/users/:username - Actor document
/// - POST /activitypub/users/:username/inbox - Personal inbox
/// - POST /activitypub/inbox - Shared inbox
/// - GET /activitypub/users/:username/{outbox,followers,following,liked}
/// - GET /activitypub/users/:username/collections/{featured,tags}
/// - GET /activitypub/posts/:id - Note
/// - GET /activitypub/posts/:id/activity - Create
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/activitypub/users/:username", get(actor))
        .route("/activitypub/users/:username/inbox", post(user_inbox))
        .route("/activitypub/inbox", post(shared_inbox))
        .route("/activitypub/users/:username/outbox", get(outbox))
        .route("/activitypub/users/:username/followers", get(followers))
        .route("/activitypub/users/:username/following", get(following))
        .route("/activitypub/users/:username/liked", get(liked))
        .route(
            "/activitypub/users/:username/collections/featured",
            get(featured),
        )
        .route(
            "/activitypub/users/:username/collections/tags",
            get(featured_tags),
        )
        .route("/activitypub/posts/:id", get(post_note))
        .route("/activitypub/posts/:id/activity", get(post_activity))
}

/// JSON body served as `application/activity+json`
struct ActivityJson(Value);

impl IntoResponse for ActivityJson {
    fn into_response(self) -> Response {
        match serde_json::to_vec(&self.0) {
            Ok(body) => ([(header::CONTENT_TYPE, ACTIVITY_JSON)], body).into_response(),
            Err(e) => AppError::Internal(e.into()).into_response(),
        }
    }
}

fn record_request(method: &str, endpoint: &str, result: &Result<impl Sized, AppError>) {
    let status = match result {
        Ok(_) => "200".to_string(),
        Err(e) => e.status_and_kind().0.as_u16().to_string(),
    };
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, endpoint, status.as_str()])
        .inc();
}

/// GET /activitypub/users/:username
///
/// Creates the actor's keypair on first request.
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<ActivityJson, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/activitypub/users/:username"])
        .start_timer();

    let result = state.actors.resolve_local_actor(&username).await;
    record_request("GET", "/activitypub/users/:username", &result);
    Ok(ActivityJson(result?))
}

// =============================================================================
// Inbox
// =============================================================================

/// Reject anything not sent as `application/activity+json`.
fn require_activity_json(headers: &HeaderMap) -> Result<(), AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let media_type = content_type.split(';').next().unwrap_or_default().trim();

    if media_type.eq_ignore_ascii_case(ACTIVITY_JSON) {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "Content-Type must be {}",
            ACTIVITY_JSON
        )))
    }
}

async fn receive(
    state: &AppState,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, AppError> {
    let _fed_timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    require_activity_json(headers)?;

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    let result = state
        .inbox
        .handle("POST", path_and_query, headers, body)
        .await;

    let status = match &result {
        Ok(_) => "success",
        Err(AppError::InvalidSignature(_) | AppError::InvalidEnvelope(_)) => "unauthorized",
        Err(_) => "error",
    };
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["inbound", status])
        .inc();

    let InboxOutcome { effect, .. } = result?;
    tracing::debug!(?effect, "Inbox activity processed");

    Ok((StatusCode::ACCEPTED, "Activity accepted").into_response())
}

/// POST /activitypub/users/:username/inbox
async fn user_inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/activitypub/users/:username/inbox"])
        .start_timer();

    let result = async {
        state
            .db
            .get_account_by_username(&username)
            .await?
            .ok_or(AppError::NotFound)?;
        receive(&state, &uri, &headers, &body).await
    }
    .await;

    record_request("POST", "/activitypub/users/:username/inbox", &result);
    result
}

/// POST /activitypub/inbox
async fn shared_inbox(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/activitypub/inbox"])
        .start_timer();

    let result = receive(&state, &uri, &headers, &body).await;
    record_request("POST", "/activitypub/inbox", &result);
    result
}

// =============================================================================
// Collections
// =============================================================================

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<String>,
}

impl PageQuery {
    fn page(&self) -> Result<Option<u32>, AppError> {
        self.page
            .as_deref()
            .map(|p| {
                p.parse::<u32>()
                    .map_err(|_| AppError::Validation(format!("Invalid page: {}", p)))
            })
            .transpose()
    }
}

async fn collection(
    state: &AppState,
    kind: CollectionKind,
    username: &str,
    query: &PageQuery,
) -> Result<ActivityJson, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", kind.as_str()])
        .start_timer();

    let result = match query.page() {
        Ok(Some(page)) => state.collections.collection_page(kind, username, page).await,
        Ok(None) => state.collections.collection_summary(kind, username).await,
        Err(e) => Err(e),
    };
    record_request("GET", kind.as_str(), &result);
    result.map(ActivityJson)
}

/// GET /activitypub/users/:username/outbox
async fn outbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<ActivityJson, AppError> {
    collection(&state, CollectionKind::Outbox, &username, &query).await
}

/// GET /activitypub/users/:username/followers
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<ActivityJson, AppError> {
    collection(&state, CollectionKind::Followers, &username, &query).await
}

/// GET /activitypub/users/:username/following
async fn following(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<ActivityJson, AppError> {
    collection(&state, CollectionKind::Following, &username, &query).await
}

/// GET /activitypub/users/:username/liked
async fn liked(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<ActivityJson, AppError> {
    collection(&state, CollectionKind::Liked, &username, &query).await
}

/// GET /activitypub/users/:username/collections/featured
async fn featured(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<ActivityJson, AppError> {
    collection(&state, CollectionKind::Featured, &username, &query).await
}

/// GET /activitypub/users/:username/collections/tags
async fn featured_tags(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<ActivityJson, AppError> {
    collection(&state, CollectionKind::FeaturedTags, &username, &query).await
}

// =============================================================================
// Posts
// =============================================================================

async fn public_post(state: &AppState, id: &str) -> Result<crate::data::Post, AppError> {
    state
        .db
        .get_post(id)
        .await?
        .filter(|post| post.is_public())
        .ok_or(AppError::NotFound)
}

/// GET /activitypub/posts/:id
///
/// Public posts only; anything else is 404.
async fn post_note(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ActivityJson, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/activitypub/posts/:id"])
        .start_timer();

    let result = async {
        let post = public_post(&state, &id).await?;
        state.converter.post_to_note(&post).await
    }
    .await;

    record_request("GET", "/activitypub/posts/:id", &result);
    result.map(|note| ActivityJson(with_context(note)))
}

/// GET /activitypub/posts/:id/activity
async fn post_activity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ActivityJson, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/activitypub/posts/:id/activity"])
        .start_timer();

    let result = async {
        let post = public_post(&state, &id).await?;
        state.converter.convert_post_to_activity(&post).await
    }
    .await;

    record_request("GET", "/activitypub/posts/:id/activity", &result);
    result.map(|activity| ActivityJson(with_context(activity)))
}
