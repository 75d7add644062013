//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    http::StatusCode,
    routing::{get, post},
};
use chrono::Utc;
use pubgate::data::{Account, EntityId, LocalFollow, Post, Privacy};
use pubgate::federation::{generate_key_pair, sign_request};
use pubgate::{AppState, config};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const LOCAL_DOMAIN: &str = "local.example";
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                domain: LOCAL_DOMAIN.to_string(),
                protocol: "https".to_string(),
                aliases: vec!["alias.example".to_string()],
            },
            database: config::DatabaseConfig { path: db_path },
            federation: config::FederationConfig {
                request_timeout_seconds: 5,
                delivery_concurrency: 4,
                key_bits: 1024,
                allow_private_addresses: true,
                user_agent: "pubgate-tests".to_string(),
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        // Initialize app state
        let state = AppState::new(config).await.unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = pubgate::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Public actor URL of a local user
    pub fn actor_url(&self, username: &str) -> String {
        format!("https://{}/activitypub/users/{}", LOCAL_DOMAIN, username)
    }

    /// Public URL of a local post
    pub fn post_url(&self, post_id: &str) -> String {
        format!("https://{}/activitypub/posts/{}", LOCAL_DOMAIN, post_id)
    }

    /// Create a local account in the database
    pub async fn create_account(&self, username: &str) -> Account {
        let account = Account {
            uid: EntityId::new().0,
            username: username.to_string(),
            display_name: Some(format!("{} display", username)),
            bio: Some("Test bio".to_string()),
            avatar_url: None,
            verified: false,
            created_at: Utc::now(),
        };
        self.state.db.upsert_account(&account).await.unwrap();
        account
    }

    /// Create a local post `minutes_ago` minutes in the past
    pub async fn create_post(&self, author_uid: &str, privacy: Privacy, minutes_ago: i64) -> Post {
        let post = Post {
            id: EntityId::new().0,
            author_uid: author_uid.to_string(),
            content: format!("<p>post from {} minutes ago</p>", minutes_ago),
            privacy: privacy.as_str().to_string(),
            pinned: false,
            created_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
        };
        self.state.db.insert_post(&post).await.unwrap();
        post
    }

    pub async fn create_local_follow(&self, follower_uid: &str, following_uid: &str) {
        self.state
            .db
            .insert_local_follow(&LocalFollow {
                follower_uid: follower_uid.to_string(),
                following_uid: following_uid.to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    /// GET with an ActivityPub Accept header
    pub async fn get_activity(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header("Accept", ACTIVITY_JSON)
            .send()
            .await
            .unwrap()
    }

    /// POST an activity signed by `remote`'s key
    pub async fn post_signed(
        &self,
        path: &str,
        activity: &Value,
        remote: &MockRemote,
    ) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        self.post_signed_bytes(path, body, remote).await
    }

    pub async fn post_signed_bytes(
        &self,
        path: &str,
        body: Vec<u8>,
        remote: &MockRemote,
    ) -> reqwest::Response {
        self.post_signed_with_key(path, body, remote, &remote.key_id)
            .await
    }

    /// POST signed by `remote`, advertising `key_id` as the signing key.
    pub async fn post_signed_with_key(
        &self,
        path: &str,
        body: Vec<u8>,
        remote: &MockRemote,
        key_id: &str,
    ) -> reqwest::Response {
        let url = self.url(path);
        let headers =
            sign_request("POST", &url, Some(&body), &remote.private_key_pem, key_id).unwrap();

        self.client
            .post(&url)
            .header("Content-Type", ACTIVITY_JSON)
            .header("Date", headers.date)
            .header("Digest", headers.digest.unwrap())
            .header("Signature", headers.signature)
            .body(body)
            .send()
            .await
            .unwrap()
    }
}

/// A remote ActivityPub server hosting a single actor, `alice`.
///
/// Serves her actor document (with a real public key), the same key as a
/// standalone document at `<actor>/main-key`, and records every activity
/// POSTed to her inbox.
pub struct MockRemote {
    pub base: String,
    pub actor_url: String,
    pub key_id: String,
    pub path_key_id: String,
    pub private_key_pem: String,
    pub received: Arc<Mutex<Vec<Value>>>,
}

impl MockRemote {
    pub async fn start() -> Self {
        let (private_key_pem, public_key_pem) = generate_key_pair(1024).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let actor_url = format!("{}/users/alice", base);
        let key_id = format!("{}#main-key", actor_url);
        let path_key_id = format!("{}/main-key", actor_url);
        let received: Arc<Mutex<Vec<Value>>> = Arc::default();

        let actor_doc = json!({
            "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
            "id": actor_url,
            "type": "Person",
            "preferredUsername": "alice",
            "inbox": format!("{}/inbox", actor_url),
            "publicKey": {
                "id": key_id,
                "owner": actor_url,
                "publicKeyPem": public_key_pem
            }
        });

        let key_doc = json!({
            "@context": "https://w3id.org/security/v1",
            "id": path_key_id,
            "type": "Key",
            "owner": actor_url,
            "publicKeyPem": public_key_pem
        });

        let received_by_inbox = received.clone();
        let app = Router::new()
            .route(
                "/users/alice",
                get(move || {
                    let actor_doc = actor_doc.clone();
                    async move { Json(actor_doc) }
                }),
            )
            .route(
                "/users/alice/main-key",
                get(move || {
                    let key_doc = key_doc.clone();
                    async move { Json(key_doc) }
                }),
            )
            .route(
                "/users/alice/inbox",
                post(move |Json(activity): Json<Value>| {
                    let received = received_by_inbox.clone();
                    async move {
                        received.lock().unwrap().push(activity);
                        StatusCode::ACCEPTED
                    }
                }),
            );

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base,
            actor_url,
            key_id,
            path_key_id,
            private_key_pem,
            received,
        }
    }

    /// Activities delivered to alice so far
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    /// Wait until alice has received at least `count` activities.
    pub async fn wait_for_deliveries(&self, count: usize) -> Vec<Value> {
        for _ in 0..100 {
            let received = self.received();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.received()
    }
}
