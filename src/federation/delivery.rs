//! Activity delivery
//!
//! Signs and POSTs activities to remote inboxes. Every delivery is a single
//! attempt bounded by the configured request timeout; there is no retry
//! queue.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;

use super::actor::{ACTIVITY_JSON, ActorUrls, ensure_remote_target};
use super::keys::KeyManager;
use super::signature::sign_request;
use crate::config::FederationConfig;
use crate::data::{Database, EntityId};
use crate::error::AppError;
use crate::metrics::{
    ACTIVITYPUB_ACTIVITIES_SENT, FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL,
};

/// Activity delivery service
#[derive(Clone)]
pub struct ActivityDelivery {
    db: Arc<Database>,
    keys: Arc<KeyManager>,
    urls: ActorUrls,
    http_client: Arc<reqwest::Client>,
    federation: FederationConfig,
}

/// Key material for signing as one local actor
#[derive(Debug, Clone)]
struct ActorSigner {
    key_id: String,
    private_key_pem: String,
}

/// Result of a delivery attempt
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// Target inbox URI
    pub inbox_uri: String,
    /// Whether delivery succeeded
    pub success: bool,
    /// Error message if failed
    pub error: Option<String>,
    /// HTTP status code of a successful delivery
    pub status_code: Option<u16>,
}

/// Deduplicate identical inbox URIs while keeping distinct personal inboxes.
pub fn unique_inbox_targets(inbox_uris: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    inbox_uris
        .into_iter()
        .filter(|inbox_uri| seen.insert(inbox_uri.clone()))
        .collect()
}

fn activity_type(activity: &Value) -> &str {
    activity
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
}

impl ActivityDelivery {
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

    async fn signer_for(&self, signing_uid: &str) -> Result<ActorSigner, AppError> {
        let account = self
            .db
            .get_account(signing_uid)
            .await?
            .ok_or(AppError::NotFound)?;
        let private_key_pem = self.keys.get_private_key(signing_uid).await?;

        Ok(ActorSigner {
            key_id: self.urls.key_id(&account.username),
            private_key_pem,
        })
    }

    /// Deliver activity to a single inbox, signed as `signing_uid`.
    ///
    /// # Returns
    /// HTTP status of the accepted delivery
    ///
    /// # Errors
    /// `KeyNotFound` when the signer has no keypair; `Federation` on
    /// network failure, timeout or non-2xx response
    pub async fn deliver_to_inbox(
        &self,
        activity: &Value,
        inbox_uri: &str,
        signing_uid: &str,
    ) -> Result<u16, AppError> {
        let signer = self.signer_for(signing_uid).await?;
        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize activity: {}", e)))?;

        let result = self.post_signed(&body, inbox_uri, &signer).await;
        record_delivery(activity_type(activity), &result);
        result
    }

    async fn post_signed(
        &self,
        body: &[u8],
        inbox_uri: &str,
        signer: &ActorSigner,
    ) -> Result<u16, AppError> {
        let _timer = FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound_delivery"])
            .start_timer();

        let target = ensure_remote_target(inbox_uri, &self.federation).await?;

        let sig_headers = sign_request(
            "POST",
            target.as_str(),
            Some(body),
            &signer.private_key_pem,
            &signer.key_id,
        )?;

        let mut request = self
            .http_client
            .post(target)
            .timeout(self.federation.request_timeout())
            .header("Content-Type", ACTIVITY_JSON)
            .header("Accept", ACTIVITY_JSON)
            .header("Date", sig_headers.date)
            .header("Signature", sig_headers.signature);

        if let Some(digest) = sig_headers.digest {
            request = request.header("Digest", digest);
        }

        let response = request.body(body.to_vec()).send().await.map_err(|e| {
            AppError::Federation(format!("Failed to deliver to {}: {}", inbox_uri, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Federation(format!(
                "Inbox {} rejected activity: HTTP {}",
                inbox_uri, status
            )));
        }

        tracing::debug!(inbox = %inbox_uri, status = status.as_u16(), "Delivered activity");
        Ok(status.as_u16())
    }

    /// Deliver one activity to many inboxes with bounded concurrency.
    ///
    /// Identical inbox URIs are delivered once. Each delivery succeeds or
    /// fails independently.
    pub async fn deliver_to_inboxes(
        &self,
        activity: Value,
        inbox_uris: Vec<String>,
        signing_uid: &str,
    ) -> Vec<DeliveryResult> {
        let total_targets = inbox_uris.len();
        let delivery_targets = unique_inbox_targets(inbox_uris);
        let kind = activity_type(&activity).to_string();

        tracing::info!(
            activity_type = %kind,
            unique = delivery_targets.len(),
            total = total_targets,
            "Delivering activity"
        );

        let signer = match self.signer_for(signing_uid).await {
            Ok(signer) => Arc::new(signer),
            Err(e) => {
                tracing::error!(uid = %signing_uid, error = %e, "Cannot sign deliveries");
                return delivery_targets
                    .into_iter()
                    .map(|inbox_uri| DeliveryResult {
                        inbox_uri,
                        success: false,
                        error: Some(e.to_string()),
                        status_code: None,
                    })
                    .collect();
            }
        };

        let body = match serde_json::to_vec(&activity) {
            Ok(body) => Arc::new(body),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize activity");
                return Vec::new();
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.federation.delivery_concurrency));
        let mut tasks = Vec::with_capacity(delivery_targets.len());

        for inbox_uri in delivery_targets {
            let semaphore = semaphore.clone();
            let body = body.clone();
            let signer = signer.clone();
            let kind = kind.clone();
            let delivery = self.clone();

            tasks.push(tokio::spawn(async move {
                let result = match semaphore.acquire().await {
                    Ok(_permit) => delivery.post_signed(&body, &inbox_uri, &signer).await,
                    Err(e) => Err(AppError::Internal(e.into())),
                };
                record_delivery(&kind, &result);

                match result {
                    Ok(status) => DeliveryResult {
                        inbox_uri,
                        success: true,
                        error: None,
                        status_code: Some(status),
                    },
                    Err(e) => {
                        tracing::warn!(inbox = %inbox_uri, error = %e, "Delivery failed");
                        DeliveryResult {
                            inbox_uri,
                            success: false,
                            error: Some(e.to_string()),
                            status_code: None,
                        }
                    }
                }
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(error = %e, "Delivery task panicked"),
            }
        }

        let success_count = results.iter().filter(|r| r.success).count();
        tracing::info!(
            succeeded = success_count,
            failed = results.len() - success_count,
            "Batch delivery complete"
        );

        results
    }

    /// Send an Accept for a received Follow.
    ///
    /// # Arguments
    /// * `follow` - The Follow activity as received
    /// * `follower_inbox_uri` - Follower's inbox
    /// * `local_uid` - The followed local account (signer)
    pub async fn send_accept(
        &self,
        follow: &Value,
        follower_inbox_uri: &str,
        local_uid: &str,
    ) -> Result<(), AppError> {
        let account = self
            .db
            .get_account(local_uid)
            .await?
            .ok_or(AppError::NotFound)?;
        // The follower may never have fetched our actor document.
        self.keys.get_or_create_key_pair(local_uid).await?;

        let actor_url = self.urls.actor(&account.username);
        let accept_id = format!("{}#accepts/follows/{}", actor_url, EntityId::new().0);

        let activity = builder::accept(&accept_id, &actor_url, builder::embedded(follow));
        self.deliver_to_inbox(&activity, follower_inbox_uri, local_uid)
            .await?;

        tracing::info!(
            inbox = %follower_inbox_uri,
            follow = ?follow.get("id"),
            "Sent Accept"
        );
        Ok(())
    }
}

fn record_delivery(activity_type: &str, result: &Result<u16, AppError>) {
    let outcome = if result.is_ok() { "success" } else { "failure" };
    ACTIVITYPUB_ACTIVITIES_SENT
        .with_label_values(&[activity_type, outcome])
        .inc();
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["outbound_delivery", outcome])
        .inc();
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    use crate::federation::actor::ACTIVITY_STREAMS_CONTEXT;

    /// Copy of an activity suitable for embedding as an `object`
    /// (top-level `@context` removed).
    pub fn embedded(activity: &Value) -> Value {
        let mut object = activity.clone();
        if let Some(map) = object.as_object_mut() {
            map.remove("@context");
        }
        object
    }

    /// Build a Follow activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (follower)
    /// * `object` - Object URI (followee)
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Accept activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (accepter)
    /// * `object` - Original activity being accepted (usually a Follow)
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Like activity
    pub fn like(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "type": "Like",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Undo activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (undoer)
    /// * `object` - Original activity being undone
    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Create activity around an object
    pub fn create(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "published": chrono::Utc::now().to_rfc3339()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::data::Account;
    use axum::{Router, extract::State, http::StatusCode, routing::post};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[test]
    fn unique_inbox_targets_keeps_distinct_personal_inboxes_on_same_domain() {
        let targets = unique_inbox_targets(vec![
            "https://instance1.com/users/alice/inbox".to_string(),
            "https://instance1.com/users/bob/inbox".to_string(),
            "https://instance2.com/inbox".to_string(),
        ]);

        assert_eq!(
            targets,
            vec![
                "https://instance1.com/users/alice/inbox".to_string(),
                "https://instance1.com/users/bob/inbox".to_string(),
                "https://instance2.com/inbox".to_string(),
            ]
        );
    }

    #[test]
    fn unique_inbox_targets_deduplicates_identical_shared_inbox_uris() {
        let targets = unique_inbox_targets(vec![
            "https://instance1.com/inbox".to_string(),
            "https://instance1.com/inbox".to_string(),
            "https://instance2.com/inbox".to_string(),
            "https://instance2.com/inbox".to_string(),
        ]);

        assert_eq!(
            targets,
            vec![
                "https://instance1.com/inbox".to_string(),
                "https://instance2.com/inbox".to_string(),
            ]
        );
    }

    #[test]
    fn embedded_strips_context_only() {
        let follow = builder::follow(
            "https://remote.example/follows/1",
            "https://remote.example/users/alice",
            "https://local.example/activitypub/users/bob",
        );
        let embedded = builder::embedded(&follow);
        assert!(embedded.get("@context").is_none());
        assert_eq!(embedded["id"], "https://remote.example/follows/1");
        assert_eq!(embedded["type"], "Follow");
    }

    struct Harness {
        delivery: ActivityDelivery,
        keys: Arc<KeyManager>,
        _temp_dir: TempDir,
    }

    async fn harness() -> Harness {
        harness_with_timeout(2).await
    }

    async fn harness_with_timeout(request_timeout_seconds: u64) -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&temp_dir.path().join("delivery.db"))
                .await
                .unwrap(),
        );
        db.upsert_account(&Account {
            uid: "uid-bob".to_string(),
            username: "bob".to_string(),
            display_name: None,
            bio: None,
            avatar_url: None,
            verified: false,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        let federation = FederationConfig {
            key_bits: 1024,
            allow_private_addresses: true,
            request_timeout_seconds,
            delivery_concurrency: 2,
            ..FederationConfig::default()
        };
        let keys = Arc::new(KeyManager::new(db.clone(), federation.key_bits));
        let urls = ActorUrls::new(&ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            domain: "local.example".to_string(),
            protocol: "https".to_string(),
            aliases: vec![],
        });

        Harness {
            delivery: ActivityDelivery::new(
                db,
                keys.clone(),
                urls,
                Arc::new(reqwest::Client::new()),
                federation,
            ),
            keys,
            _temp_dir: temp_dir,
        }
    }

    async fn spawn_inbox(status: StatusCode) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/inbox",
                post(
                    move |State(hits): State<Arc<AtomicUsize>>, headers: http::HeaderMap| async move {
                        if headers.get("signature").is_some() && headers.get("digest").is_some() {
                            hits.fetch_add(1, Ordering::SeqCst);
                        }
                        status
                    },
                ),
            )
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/inbox", addr), hits)
    }

    /// An inbox that accepts the connection but answers only after `delay`.
    async fn spawn_slow_inbox(delay: Duration) -> String {
        let app = Router::new().route(
            "/inbox",
            post(move || async move {
                tokio::time::sleep(delay).await;
                StatusCode::ACCEPTED
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/inbox", addr)
    }

    #[tokio::test]
    async fn deliver_times_out_on_hanging_inbox() {
        let h = harness_with_timeout(1).await;
        h.keys.get_or_create_key_pair("uid-bob").await.unwrap();
        let hanging = spawn_slow_inbox(Duration::from_secs(30)).await;
        let activity = builder::like("x", "y", "z");

        let started = Instant::now();
        let result = h
            .delivery
            .deliver_to_inbox(&activity, &hanging, "uid-bob")
            .await;

        assert!(matches!(result, Err(AppError::Federation(_))), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn fan_out_is_not_stalled_by_hanging_inbox() {
        let h = harness_with_timeout(1).await;
        h.keys.get_or_create_key_pair("uid-bob").await.unwrap();
        let hanging = spawn_slow_inbox(Duration::from_secs(30)).await;
        let (healthy, healthy_hits) = spawn_inbox(StatusCode::ACCEPTED).await;

        let started = Instant::now();
        let results = h
            .delivery
            .deliver_to_inboxes(
                builder::create("x", "y", serde_json::json!({"type": "Note"})),
                vec![hanging.clone(), healthy.clone()],
                "uid-bob",
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(healthy_hits.load(Ordering::SeqCst), 1);
        let healthy_result = results.iter().find(|r| r.inbox_uri == healthy).unwrap();
        assert!(healthy_result.success);
        let hanging_result = results.iter().find(|r| r.inbox_uri == hanging).unwrap();
        assert!(!hanging_result.success);
    }

    #[tokio::test]
    async fn deliver_requires_signing_key() {
        let h = harness().await;
        let activity = builder::like("x", "y", "z");
        let result = h
            .delivery
            .deliver_to_inbox(&activity, "http://127.0.0.1:9/inbox", "uid-bob")
            .await;
        assert!(matches!(result, Err(AppError::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn deliver_treats_non_2xx_as_failure() {
        let h = harness().await;
        h.keys.get_or_create_key_pair("uid-bob").await.unwrap();
        let (ok_inbox, ok_hits) = spawn_inbox(StatusCode::ACCEPTED).await;
        let (bad_inbox, _) = spawn_inbox(StatusCode::INTERNAL_SERVER_ERROR).await;
        let activity = builder::like("x", "y", "z");

        let status = h
            .delivery
            .deliver_to_inbox(&activity, &ok_inbox, "uid-bob")
            .await
            .unwrap();
        assert_eq!(status, 202);
        assert_eq!(ok_hits.load(Ordering::SeqCst), 1);

        assert!(matches!(
            h.delivery
                .deliver_to_inbox(&activity, &bad_inbox, "uid-bob")
                .await,
            Err(AppError::Federation(_))
        ));
    }

    #[tokio::test]
    async fn fan_out_deduplicates_and_isolates_failures() {
        let h = harness().await;
        h.keys.get_or_create_key_pair("uid-bob").await.unwrap();
        let (shared, shared_hits) = spawn_inbox(StatusCode::ACCEPTED).await;
        let (failing, _) = spawn_inbox(StatusCode::GONE).await;

        let results = h
            .delivery
            .deliver_to_inboxes(
                builder::create("x", "y", serde_json::json!({"type": "Note"})),
                vec![
                    shared.clone(),
                    failing.clone(),
                    shared.clone(),
                    "http://127.0.0.1:9/inbox".to_string(),
                ],
                "uid-bob",
            )
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(shared_hits.load(Ordering::SeqCst), 1);
        assert_eq!(results.iter().filter(|r| r.success).count(), 1);
        let ok = results.iter().find(|r| r.inbox_uri == shared).unwrap();
        assert_eq!(ok.status_code, Some(202));
    }
}
