//! Actor documents and URL scheme
//!
//! - `ActorUrls`: every absolute URL this instance publishes, and the
//!   reverse mapping from URLs back to local usernames and post IDs
//! - `ActorResolver`: local Person documents and remote actor fetches

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::keys::KeyManager;
use super::signature::key_id_matches_actor;
use crate::config::{FederationConfig, ServerConfig};
use crate::data::{Database, LocalActor};
use crate::error::AppError;
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

pub const ACTIVITY_STREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// URL builder for everything this instance exposes over ActivityPub.
///
/// Actor IDs depend only on the base URL and the username.
#[derive(Debug, Clone)]
pub struct ActorUrls {
    base_url: String,
    server: ServerConfig,
}

impl ActorUrls {
    pub fn new(server: &ServerConfig) -> Self {
        Self {
            base_url: server.base_url().trim_end_matches('/').to_string(),
            server: server.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn domain(&self) -> &str {
        &self.server.domain
    }

    pub fn actor(&self, username: &str) -> String {
        format!("{}/activitypub/users/{}", self.base_url, username)
    }

    pub fn key_id(&self, username: &str) -> String {
        format!("{}#main-key", self.actor(username))
    }

    pub fn inbox(&self, username: &str) -> String {
        format!("{}/inbox", self.actor(username))
    }

    pub fn outbox(&self, username: &str) -> String {
        format!("{}/outbox", self.actor(username))
    }

    pub fn followers(&self, username: &str) -> String {
        format!("{}/followers", self.actor(username))
    }

    pub fn following(&self, username: &str) -> String {
        format!("{}/following", self.actor(username))
    }

    pub fn liked(&self, username: &str) -> String {
        format!("{}/liked", self.actor(username))
    }

    pub fn featured(&self, username: &str) -> String {
        format!("{}/collections/featured", self.actor(username))
    }

    pub fn featured_tags(&self, username: &str) -> String {
        format!("{}/collections/tags", self.actor(username))
    }

    pub fn shared_inbox(&self) -> String {
        format!("{}/activitypub/inbox", self.base_url)
    }

    pub fn post(&self, post_id: &str) -> String {
        format!("{}/activitypub/posts/{}", self.base_url, post_id)
    }

    pub fn post_activity(&self, post_id: &str) -> String {
        format!("{}/activity", self.post(post_id))
    }

    pub fn tag(&self, name: &str) -> String {
        format!("{}/tags/{}", self.base_url, name)
    }

    /// Local username named by an actor URL on this instance.
    ///
    /// Returns `None` for foreign hosts or unrecognized paths.
    pub fn local_username(&self, url: &str) -> Option<String> {
        let parsed = url::Url::parse(url).ok()?;
        if !self.server.is_local_host(parsed.host_str()?) {
            return None;
        }
        extract_username_from_actor_path(parsed.path())
    }

    /// Local post ID named by a post URL on this instance.
    pub fn local_post_id(&self, url: &str) -> Option<String> {
        let parsed = url::Url::parse(url).ok()?;
        if !self.server.is_local_host(parsed.host_str()?) {
            return None;
        }
        let segments: Vec<&str> = parsed.path_segments()?.collect();
        match segments.as_slice() {
            ["activitypub", "posts", id, ..] if !id.is_empty() => Some((*id).to_string()),
            _ => None,
        }
    }
}

/// Extract the username from `/activitypub/users/<name>` or `/users/<name>`.
///
/// Anything after the username segment is ignored.
pub fn extract_username_from_actor_path(path: &str) -> Option<String> {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let username = match segments.as_slice() {
        ["activitypub", "users", name, ..] => *name,
        ["users", name, ..] => *name,
        _ => return None,
    };

    if username.is_empty() {
        None
    } else {
        Some(username.to_string())
    }
}

/// Remote actor document, reduced to the fields federation needs
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteActor {
    pub id: String,
    #[serde(rename = "type", default)]
    pub actor_type: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    pub inbox: String,
    #[serde(default)]
    pub endpoints: Option<RemoteEndpoints>,
    #[serde(default)]
    pub public_key: Option<RemotePublicKey>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEndpoints {
    #[serde(default)]
    pub shared_inbox: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePublicKey {
    pub id: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub public_key_pem: String,
}

impl RemoteActor {
    /// Inbox to deliver to: the shared inbox when advertised.
    pub fn delivery_inbox(&self) -> &str {
        self.endpoints
            .as_ref()
            .and_then(|e| e.shared_inbox.as_deref())
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.inbox)
    }
}

/// Resolves local and remote actors
pub struct ActorResolver {
    db: Arc<Database>,
    keys: Arc<KeyManager>,
    urls: ActorUrls,
    http_client: Arc<reqwest::Client>,
    federation: FederationConfig,
}

impl ActorResolver {
    pub fn new(
        db: Arc<Database>,
        keys: Arc<KeyManager>,
        urls: ActorUrls,
        http_client: Arc<reqwest::Client>,
        federation: FederationConfig,
    ) -> Self {
        Self {
            db,
            keys,
            urls,
            http_client,
            federation,
        }
    }

    pub fn urls(&self) -> &ActorUrls {
        &self.urls
    }

    /// Build the Person document for a local account.
    ///
    /// Creates the actor's keypair on first call.
    ///
    /// # Errors
    /// `NotFound` if no such local account exists
    pub async fn resolve_local_actor(&self, username: &str) -> Result<Value, AppError> {
        let actor = self
            .db
            .get_local_actor(username)
            .await?
            .ok_or(AppError::NotFound)?;
        let public_key_pem = self.keys.get_or_create_key_pair(&actor.account.uid).await?;

        Ok(build_actor_document(&self.urls, &actor, &public_key_pem))
    }

    /// Fetch a remote actor document. Never cached.
    ///
    /// # Errors
    /// `Federation` on non-2xx, timeout or malformed document;
    /// `Forbidden` when the host resolves to a disallowed address
    pub async fn resolve_remote_actor(&self, actor_url: &str) -> Result<RemoteActor, AppError> {
        self.fetch_remote(actor_url, "actor").await
    }

    async fn fetch_remote<T: DeserializeOwned>(
        &self,
        url: &str,
        what: &str,
    ) -> Result<T, AppError> {
        let _timer = FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound_fetch"])
            .start_timer();

        let result = self.fetch_document(url, what).await;
        let status = if result.is_ok() { "success" } else { "error" };
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["outbound_fetch", status])
            .inc();

        if let Err(ref e) = result {
            tracing::warn!(url = %url, error = %e, "Remote {} fetch failed", what);
        }
        result
    }

    async fn fetch_document<T: DeserializeOwned>(
        &self,
        url: &str,
        what: &str,
    ) -> Result<T, AppError> {
        let target = ensure_remote_target(url, &self.federation).await?;

        let response = self
            .http_client
            .get(target)
            .header("Accept", ACTIVITY_JSON)
            .timeout(self.federation.request_timeout())
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to fetch {}: {}", what, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Failed to fetch {}: HTTP {}",
                what,
                response.status()
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to parse {}: {}", what, e)))
    }

    /// Public key PEM for a signature keyId, checked to belong to `actor_id`.
    ///
    /// A keyId of the form `<actor>#fragment` is looked up on the actor
    /// document, which must advertise exactly that key ID. Any other keyId
    /// (e.g. `<actor>/main-key`) is fetched as its own document; its
    /// `owner` must be `actor_id` and it must live on the actor's origin.
    ///
    /// # Errors
    /// `InvalidSignature` when the key is not owned by `actor_id`;
    /// `Federation` when a document cannot be fetched
    pub async fn fetch_public_key(
        &self,
        key_id: &str,
        actor_id: &str,
    ) -> Result<String, AppError> {
        if key_id.contains('#') && key_id_matches_actor(key_id, actor_id) {
            let actor = self.resolve_remote_actor(actor_id).await?;
            let public_key = actor
                .public_key
                .ok_or_else(|| AppError::Federation("Missing publicKey in actor".to_string()))?;

            if public_key.id != key_id {
                return Err(AppError::InvalidSignature(
                    "Signature keyId does not match actor public key id".to_string(),
                ));
            }
            return Ok(public_key.public_key_pem);
        }

        if !same_origin(key_id, actor_id) {
            return Err(AppError::InvalidSignature(
                "Signature keyId actor mismatch".to_string(),
            ));
        }

        let document: KeyDocument = self.fetch_remote(key_id, "key").await?;
        let key = document.into_key()?;
        if key.id != key_id {
            return Err(AppError::InvalidSignature(
                "Signature keyId does not match fetched key id".to_string(),
            ));
        }
        if key.owner.as_deref() != Some(actor_id) {
            return Err(AppError::InvalidSignature(
                "Signature key is not owned by the activity actor".to_string(),
            ));
        }

        Ok(key.public_key_pem)
    }
}

/// A standalone key document, or an actor stub embedding `publicKey`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyDocument {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    public_key_pem: Option<String>,
    #[serde(default)]
    public_key: Option<RemotePublicKey>,
}

impl KeyDocument {
    fn into_key(self) -> Result<RemotePublicKey, AppError> {
        match self.public_key {
            Some(mut key) => {
                if key.owner.is_none() {
                    key.owner = self.id;
                }
                Ok(key)
            }
            None => match (self.id, self.public_key_pem) {
                (Some(id), Some(public_key_pem)) => Ok(RemotePublicKey {
                    id,
                    owner: self.owner,
                    public_key_pem,
                }),
                _ => Err(AppError::Federation(
                    "Key document has no public key".to_string(),
                )),
            },
        }
    }
}

fn same_origin(a: &str, b: &str) -> bool {
    match (url::Url::parse(a), url::Url::parse(b)) {
        (Ok(a), Ok(b)) => a.origin() == b.origin(),
        _ => false,
    }
}

/// Person document for a local actor
pub fn build_actor_document(urls: &ActorUrls, actor: &LocalActor, public_key_pem: &str) -> Value {
    let account = &actor.account;
    let username = account.username.as_str();
    let actor_url = urls.actor(username);

    let summary = account
        .bio
        .as_deref()
        .filter(|bio| !bio.trim().is_empty())
        .map(|bio| format!("<p>{}</p>", html_escape::encode_text(bio)))
        .unwrap_or_default();

    let mut document = json!({
        "@context": [
            ACTIVITY_STREAMS_CONTEXT,
            SECURITY_CONTEXT,
            {
                "manuallyApprovesFollowers": "as:manuallyApprovesFollowers",
                "toot": "http://joinmastodon.org/ns#",
                "featured": { "@id": "toot:featured", "@type": "@id" },
                "featuredTags": { "@id": "toot:featuredTags", "@type": "@id" },
                "discoverable": "toot:discoverable",
                "schema": "http://schema.org#",
                "PropertyValue": "schema:PropertyValue",
                "value": "schema:value"
            }
        ],
        "id": actor_url,
        "type": "Person",
        "preferredUsername": username,
        "name": account.public_name(),
        "summary": summary,
        "url": actor_url,
        "published": account.created_at.to_rfc3339(),
        "inbox": urls.inbox(username),
        "outbox": urls.outbox(username),
        "followers": urls.followers(username),
        "following": urls.following(username),
        "featured": urls.featured(username),
        "featuredTags": urls.featured_tags(username),
        "liked": urls.liked(username),
        "manuallyApprovesFollowers": false,
        "discoverable": true,
        "publicKey": {
            "id": urls.key_id(username),
            "owner": actor_url,
            "publicKeyPem": public_key_pem
        },
        "endpoints": {
            "sharedInbox": urls.shared_inbox()
        }
    });

    if let Some(avatar) = account.avatar_url.as_deref().filter(|a| !a.is_empty()) {
        document["icon"] = json!({
            "type": "Image",
            "url": avatar
        });
    }

    document
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::time::timeout(
        timeout,
        tokio::net::lookup_host((normalized.as_str(), port)),
    )
    .await
    .map_err(|_| AppError::Federation(format!("Timed out resolving remote host {}", host)))?
    .map_err(|e| AppError::Federation(format!("Failed to resolve remote host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Federation(
            "No DNS records for remote host".to_string(),
        ));
    }

    Ok(())
}

/// Validate a remote URL before any outbound request touches it.
///
/// Rejects non-HTTP(S) schemes and, unless `allow_private_addresses` is
/// set, hosts that are or resolve to loopback/private/link-local addresses.
/// Name resolution is bounded by the request timeout.
pub async fn ensure_remote_target(
    url: &str,
    federation: &FederationConfig,
) -> Result<url::Url, AppError> {
    let parsed = url::Url::parse(url)
        .map_err(|e| AppError::Validation(format!("Invalid remote URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported remote URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in remote URL".to_string()))?
        .to_string();

    if !federation.allow_private_addresses {
        if is_disallowed_host(&host) {
            return Err(AppError::Forbidden);
        }
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| AppError::Validation("Missing port in remote URL".to_string()))?;
        validate_resolved_host_ips(&host, port, federation.request_timeout()).await?;
    }

    Ok(parsed)
}
