//! WebFinger protocol implementation
//!
//! Maps `acct:user@domain` resources to local actor URLs.

use serde::{Deserialize, Serialize};

use super::actor::{ACTIVITY_JSON, ActorUrls};
use crate::config::ServerConfig;
use crate::data::Database;
use crate::error::AppError;

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Split an `acct:user@domain` resource.
///
/// # Errors
/// `Validation` for any other shape
pub fn parse_acct_resource(resource: &str) -> Result<(&str, &str), AppError> {
    let acct = resource
        .trim()
        .strip_prefix("acct:")
        .ok_or_else(|| AppError::Validation("Resource must use the acct: scheme".to_string()))?;

    match acct.split_once('@') {
        Some((user, domain))
            if !user.is_empty() && !domain.is_empty() && !domain.contains('@') =>
        {
            Ok((user, domain))
        }
        _ => Err(AppError::Validation(
            "Resource must be acct:user@domain".to_string(),
        )),
    }
}

/// Resolve a WebFinger resource against local accounts.
///
/// The domain must be the configured domain or one of its aliases.
///
/// # Errors
/// - `Validation` for a malformed resource
/// - `NotFound` for a foreign domain or unknown user
pub async fn resolve_local_resource(
    db: &Database,
    server: &ServerConfig,
    urls: &ActorUrls,
    resource: &str,
) -> Result<WebFingerResponse, AppError> {
    let (username, domain) = parse_acct_resource(resource)?;

    if !server.is_local_host(domain) {
        tracing::debug!(domain = %domain, "WebFinger lookup for foreign domain");
        return Err(AppError::NotFound);
    }

    let account = db
        .get_account_by_username(username)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(generate_webfinger_response(
        &account.username,
        &server.domain,
        &urls.actor(&account.username),
    ))
}

/// Generate WebFinger response for a local account.
///
/// # Arguments
/// * `username` - Local username
/// * `domain` - Instance domain
/// * `actor_url` - Actor document URL
pub fn generate_webfinger_response(
    username: &str,
    domain: &str,
    actor_url: &str,
) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", username, domain),
        aliases: Some(vec![actor_url.to_string()]),
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: Some(ACTIVITY_JSON.to_string()),
            href: Some(actor_url.to_string()),
            template: None,
        }],
    }
}
