//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/nodeinfo
//! - /.well-known/host-meta

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{WebFingerResponse, resolve_local_resource};
use crate::metrics::{HTTP_REQUEST_DURATION_SECONDS, HTTP_REQUESTS_TOTAL};

const NODEINFO_SCHEMA: &str = "http://nodeinfo.diaspora.software/ns/schema/2.0";

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/nodeinfo
/// - GET /.well-known/host-meta
/// - GET /nodeinfo/2.0
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/nodeinfo", get(nodeinfo_links))
        .route("/.well-known/host-meta", get(host_meta))
        .route("/nodeinfo/2.0", get(nodeinfo))
}

#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: Option<String>,
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<impl IntoResponse, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/.well-known/webfinger"])
        .start_timer();

    let result = match query.resource.as_deref() {
        Some(resource) => {
            resolve_local_resource(&state.db, &state.config.server, &state.urls, resource).await
        }
        None => Err(AppError::Validation(
            "Missing resource parameter".to_string(),
        )),
    };

    let status = match &result {
        Ok(_) => "200".to_string(),
        Err(e) => e.status_and_kind().0.as_u16().to_string(),
    };
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/.well-known/webfinger", status.as_str()])
        .inc();

    let response: WebFingerResponse = result?;
    Ok((
        [(header::CONTENT_TYPE, "application/jrd+json")],
        Json(response),
    ))
}

/// GET /.well-known/nodeinfo
async fn nodeinfo_links(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "links": [
            {
                "rel": NODEINFO_SCHEMA,
                "href": format!("{}/nodeinfo/2.0", state.urls.base_url())
            }
        ]
    }))
}

/// GET /nodeinfo/2.0
///
/// Usage counts are read live.
async fn nodeinfo(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let users = state.db.count_accounts().await?;
    let local_posts = state.db.count_all_public_posts().await?;

    Ok(Json(serde_json::json!({
        "version": "2.0",
        "software": {
            "name": "pubgate",
            "version": env!("CARGO_PKG_VERSION")
        },
        "protocols": ["activitypub"],
        "services": {
            "inbound": [],
            "outbound": []
        },
        "openRegistrations": false,
        "usage": {
            "users": {
                "total": users
            },
            "localPosts": local_posts
        },
        "metadata": {}
    })))
}

/// GET /.well-known/host-meta
///
/// Returns host-meta XML for WebFinger discovery.
async fn host_meta(State(state): State<AppState>) -> impl IntoResponse {
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <Link rel="lrdd" template="{}/.well-known/webfinger?resource={{uri}}"/>
</XRD>"#,
        state.urls.base_url()
    );

    ([(header::CONTENT_TYPE, "application/xrd+xml")], xml)
}
