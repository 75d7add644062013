//! Inbound activity processing
//!
//! Each inbox request is authenticated, decoded into an [`InboundActivity`]
//! and applied in one pass. Structural problems with the envelope are
//! rejected; problems inside a known activity degrade to
//! [`InboundActivity::Unrecognized`] and are dropped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;

use super::actor::{ActorResolver, ActorUrls};
use super::delivery::ActivityDelivery;
use super::signature::{extract_signature_key_id, verify_signature};
use crate::data::{Database, EntityId, FederatedFollow, FederatedLike, FederatedPost};
use crate::error::AppError;
use crate::metrics::ACTIVITYPUB_ACTIVITIES_RECEIVED;

/// Minimal fields every activity must carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEnvelope {
    pub activity_type: String,
    pub actor: String,
    pub id: Option<String>,
}

impl ActivityEnvelope {
    /// # Errors
    /// `InvalidEnvelope` when `type` or `actor` is missing
    pub fn parse(activity: &Value) -> Result<Self, AppError> {
        if !activity.is_object() {
            return Err(AppError::InvalidEnvelope(
                "Activity must be a JSON object".to_string(),
            ));
        }

        let activity_type = activity
            .get("type")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::InvalidEnvelope("Missing activity type".to_string()))?;
        let actor = activity
            .get("actor")
            .and_then(object_id)
            .ok_or_else(|| AppError::InvalidEnvelope("Missing actor".to_string()))?;

        Ok(Self {
            activity_type: activity_type.to_string(),
            actor,
            id: activity.get("id").and_then(object_id),
        })
    }
}

#[derive(Debug, Clone)]
pub struct FollowActivity {
    pub id: Option<String>,
    pub actor: String,
    /// Followed actor URL
    pub object: String,
    /// The activity as received, echoed back inside the Accept
    pub raw: Value,
}

/// What an Undo refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoTarget {
    Follow {
        id: Option<String>,
        object: Option<String>,
    },
    Like {
        id: Option<String>,
        object: Option<String>,
    },
    /// Compact form: the undone activity's ID only
    Reference(String),
}

#[derive(Debug, Clone)]
pub struct UndoActivity {
    pub actor: String,
    pub target: UndoTarget,
}

#[derive(Debug, Clone)]
pub struct LikeActivity {
    pub id: Option<String>,
    pub actor: String,
    pub object: String,
}

#[derive(Debug, Clone)]
pub struct CreateNoteActivity {
    pub id: String,
    pub actor: String,
    /// Raw remote HTML
    pub content: String,
    pub published: Option<DateTime<Utc>>,
}

/// Typed inbound activity
#[derive(Debug, Clone)]
pub enum InboundActivity {
    Follow(FollowActivity),
    Undo(UndoActivity),
    Like(LikeActivity),
    CreateNote(CreateNoteActivity),
    Unrecognized { activity_type: String, reason: String },
}

impl InboundActivity {
    /// Decode an activity.
    ///
    /// # Errors
    /// `InvalidEnvelope` only when `type` or `actor` is unusable
    pub fn decode(activity: &Value) -> Result<Self, AppError> {
        let envelope = ActivityEnvelope::parse(activity)?;

        let decoded = match envelope.activity_type.as_str() {
            "Follow" => decode_follow(activity, &envelope),
            "Undo" => decode_undo(activity, &envelope),
            "Like" => decode_like(activity, &envelope),
            "Create" => decode_create(activity, &envelope),
            _ => Err("unsupported activity type".to_string()),
        };

        Ok(decoded.unwrap_or_else(|reason| Self::Unrecognized {
            activity_type: envelope.activity_type.clone(),
            reason,
        }))
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Follow(_) => "Follow",
            Self::Undo(_) => "Undo",
            Self::Like(_) => "Like",
            Self::CreateNote(_) => "Create",
            Self::Unrecognized { activity_type, .. } => activity_type,
        }
    }
}

/// An ID reference: either a bare string or an object with `id`.
fn object_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

fn decode_follow(activity: &Value, envelope: &ActivityEnvelope) -> Result<InboundActivity, String> {
    let object = activity
        .get("object")
        .and_then(object_id)
        .ok_or("Follow without object")?;

    Ok(InboundActivity::Follow(FollowActivity {
        id: envelope.id.clone(),
        actor: envelope.actor.clone(),
        object,
        raw: activity.clone(),
    }))
}

fn decode_undo(activity: &Value, envelope: &ActivityEnvelope) -> Result<InboundActivity, String> {
    let inner = activity.get("object").ok_or("Undo without object")?;

    let target = match inner {
        Value::String(id) if !id.is_empty() => UndoTarget::Reference(id.clone()),
        Value::Object(map) => {
            let id = map.get("id").and_then(object_id);
            let object = map.get("object").and_then(object_id);
            match map.get("type").and_then(Value::as_str) {
                Some("Follow") => UndoTarget::Follow { id, object },
                Some("Like") => UndoTarget::Like { id, object },
                Some(other) => return Err(format!("Undo of unsupported type {}", other)),
                None => match id {
                    Some(id) => UndoTarget::Reference(id),
                    None => return Err("Undo object without type or id".to_string()),
                },
            }
        }
        _ => return Err("Undo object is neither a reference nor an object".to_string()),
    };

    Ok(InboundActivity::Undo(UndoActivity {
        actor: envelope.actor.clone(),
        target,
    }))
}

fn decode_like(activity: &Value, envelope: &ActivityEnvelope) -> Result<InboundActivity, String> {
    let object = activity
        .get("object")
        .and_then(object_id)
        .ok_or("Like without object")?;

    Ok(InboundActivity::Like(LikeActivity {
        id: envelope.id.clone(),
        actor: envelope.actor.clone(),
        object,
    }))
}

fn decode_create(activity: &Value, envelope: &ActivityEnvelope) -> Result<InboundActivity, String> {
    let note = activity
        .get("object")
        .filter(|o| o.is_object())
        .ok_or("Create without embedded object")?;

    match note.get("type").and_then(Value::as_str) {
        Some("Note") => {}
        other => return Err(format!("Create of unsupported object {:?}", other)),
    }

    let id = envelope
        .id
        .clone()
        .or_else(|| note.get("id").and_then(object_id))
        .ok_or("Create without id")?;
    let content = note
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let published = note
        .get("published")
        .and_then(Value::as_str)
        .and_then(|p| DateTime::parse_from_rfc3339(p).ok())
        .map(|p| p.with_timezone(&Utc));

    Ok(InboundActivity::CreateNote(CreateNoteActivity {
        id,
        actor: envelope.actor.clone(),
        content,
        published,
    }))
}

fn sanitize_remote_html(content: &str) -> String {
    ammonia::clean(content)
}

/// What an inbox call changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxEffect {
    FollowRecorded,
    FollowAlreadyRecorded,
    FollowRemoved,
    LikeRecorded,
    LikeAlreadyRecorded,
    LikeRemoved,
    NoteArchived,
    /// Accepted but nothing applied
    Dropped,
}

/// Result of processing one inbound activity
#[derive(Debug)]
pub struct InboxOutcome {
    pub effect: InboxEffect,
    /// Detached Accept delivery, for Follow
    pub accept_task: Option<JoinHandle<()>>,
}

impl InboxOutcome {
    fn effect(effect: InboxEffect) -> Self {
        Self {
            effect,
            accept_task: None,
        }
    }

    fn dropped() -> Self {
        Self::effect(InboxEffect::Dropped)
    }
}

/// Authenticates and applies inbound activities
pub struct InboxProcessor {
    db: Arc<Database>,
    urls: ActorUrls,
    resolver: Arc<ActorResolver>,
    delivery: Arc<ActivityDelivery>,
}

impl InboxProcessor {
    pub fn new(
        db: Arc<Database>,
        urls: ActorUrls,
        resolver: Arc<ActorResolver>,
        delivery: Arc<ActivityDelivery>,
    ) -> Self {
        Self {
            db,
            urls,
            resolver,
            delivery,
        }
    }

    /// Full inbox pipeline: envelope, signature, decode, apply.
    ///
    /// # Arguments
    /// * `method` - HTTP method as received
    /// * `path_and_query` - Request target as received
    /// * `headers` - Request headers
    /// * `body` - Raw request body
    ///
    /// # Errors
    /// - `InvalidEnvelope` for unparseable JSON or missing `type`/`actor`
    /// - `InvalidSignature` when the signature is absent or does not verify
    /// - `Database` when applying the activity fails
    pub async fn handle(
        &self,
        method: &str,
        path_and_query: &str,
        headers: &http::HeaderMap,
        body: &[u8],
    ) -> Result<InboxOutcome, AppError> {
        let activity: Value = serde_json::from_slice(body)
            .map_err(|e| AppError::InvalidEnvelope(format!("Invalid JSON: {}", e)))?;
        let envelope = ActivityEnvelope::parse(&activity)?;

        self.authenticate(method, path_and_query, headers, body, &envelope.actor)
            .await?;

        ACTIVITYPUB_ACTIVITIES_RECEIVED
            .with_label_values(&[envelope.activity_type.as_str()])
            .inc();

        let inbound = InboundActivity::decode(&activity)?;
        self.process(inbound).await
    }

    /// Verify the HTTP signature was made by `actor`.
    async fn authenticate(
        &self,
        method: &str,
        path_and_query: &str,
        headers: &http::HeaderMap,
        body: &[u8],
        actor: &str,
    ) -> Result<(), AppError> {
        let key_id = extract_signature_key_id(headers)?;

        let public_key_pem = self
            .resolver
            .fetch_public_key(&key_id, actor)
            .await
            .map_err(|e| match e {
                AppError::InvalidSignature(msg) => AppError::InvalidSignature(msg),
                other => AppError::InvalidSignature(format!("Unable to fetch signer key: {}", other)),
            })?;

        verify_signature(method, path_and_query, headers, Some(body), &public_key_pem)
    }

    /// Apply a decoded activity.
    pub async fn process(&self, activity: InboundActivity) -> Result<InboxOutcome, AppError> {
        match activity {
            InboundActivity::Follow(follow) => self.handle_follow(follow).await,
            InboundActivity::Undo(undo) => self.handle_undo(undo).await,
            InboundActivity::Like(like) => self.handle_like(like).await,
            InboundActivity::CreateNote(note) => self.handle_create_note(note).await,
            InboundActivity::Unrecognized {
                activity_type,
                reason,
            } => {
                tracing::info!(activity_type = %activity_type, reason = %reason, "Ignoring activity");
                Ok(InboxOutcome::dropped())
            }
        }
    }

    async fn handle_follow(&self, follow: FollowActivity) -> Result<InboxOutcome, AppError> {
        let Some(username) = self.urls.local_username(&follow.object) else {
            tracing::info!(object = %follow.object, "Follow target is not a local actor, dropping");
            return Ok(InboxOutcome::dropped());
        };
        let Some(account) = self.db.get_account_by_username(&username).await? else {
            tracing::info!(username = %username, "Follow target does not exist, dropping");
            return Ok(InboxOutcome::dropped());
        };

        let activity_id = follow
            .id
            .clone()
            .unwrap_or_else(|| format!("{}#follows/{}", follow.actor, EntityId::new().0));
        let inserted = self
            .db
            .insert_federated_follow_if_absent(&FederatedFollow {
                id: EntityId::new().0,
                remote_actor_url: follow.actor.clone(),
                local_following_uid: account.uid.clone(),
                activity_id,
                created_at: Utc::now(),
            })
            .await?;

        if inserted {
            tracing::info!(actor = %follow.actor, username = %username, "Recorded remote follow");
        } else {
            tracing::debug!(actor = %follow.actor, username = %username, "Follow already recorded");
        }

        let accept_task = self.spawn_accept(follow, account.uid);

        Ok(InboxOutcome {
            effect: if inserted {
                InboxEffect::FollowRecorded
            } else {
                InboxEffect::FollowAlreadyRecorded
            },
            accept_task: Some(accept_task),
        })
    }

    /// Send the Accept in the background. Failures are logged only.
    fn spawn_accept(&self, follow: FollowActivity, local_uid: String) -> JoinHandle<()> {
        let resolver = self.resolver.clone();
        let delivery = self.delivery.clone();

        tokio::spawn(async move {
            let remote = match resolver.resolve_remote_actor(&follow.actor).await {
                Ok(remote) => remote,
                Err(e) => {
                    tracing::warn!(actor = %follow.actor, error = %e, "Cannot resolve follower for Accept");
                    return;
                }
            };

            if let Err(e) = delivery
                .send_accept(&follow.raw, &remote.inbox, &local_uid)
                .await
            {
                tracing::warn!(inbox = %remote.inbox, error = %e, "Failed to deliver Accept");
            }
        })
    }

    async fn handle_undo(&self, undo: UndoActivity) -> Result<InboxOutcome, AppError> {
        let actor = undo.actor.as_str();
        match undo.target {
            UndoTarget::Follow { id, object } => {
                let mut removed = match id.as_deref() {
                    Some(id) => self.db.delete_federated_follow_by_activity(actor, id).await?,
                    None => 0,
                };

                if removed == 0 {
                    if let Some(uid) = self.local_uid_for(object.as_deref()).await? {
                        removed = self.db.delete_federated_follow_by_target(actor, &uid).await?;
                    }
                }

                tracing::info!(actor = %actor, removed, "Processed Undo(Follow)");
                Ok(InboxOutcome::effect(if removed > 0 {
                    InboxEffect::FollowRemoved
                } else {
                    InboxEffect::Dropped
                }))
            }
            UndoTarget::Like { id, object } => {
                let mut removed = match id.as_deref() {
                    Some(id) => self.db.delete_federated_like_by_activity(actor, id).await?,
                    None => 0,
                };

                if removed == 0 {
                    if let Some(post_id) = object.as_deref().and_then(|o| self.urls.local_post_id(o)) {
                        removed = self
                            .db
                            .delete_federated_like_by_target(actor, &post_id)
                            .await?;
                    }
                }

                tracing::info!(actor = %actor, removed, "Processed Undo(Like)");
                Ok(InboxOutcome::effect(if removed > 0 {
                    InboxEffect::LikeRemoved
                } else {
                    InboxEffect::Dropped
                }))
            }
            UndoTarget::Reference(id) => {
                if self.db.delete_federated_follow_by_activity(actor, &id).await? > 0 {
                    return Ok(InboxOutcome::effect(InboxEffect::FollowRemoved));
                }
                if self.db.delete_federated_like_by_activity(actor, &id).await? > 0 {
                    return Ok(InboxOutcome::effect(InboxEffect::LikeRemoved));
                }
                tracing::debug!(actor = %actor, id = %id, "Undo reference matched nothing");
                Ok(InboxOutcome::dropped())
            }
        }
    }

    async fn local_uid_for(&self, actor_url: Option<&str>) -> Result<Option<String>, AppError> {
        let Some(username) = actor_url.and_then(|url| self.urls.local_username(url)) else {
            return Ok(None);
        };
        Ok(self
            .db
            .get_account_by_username(&username)
            .await?
            .map(|account| account.uid))
    }

    async fn handle_like(&self, like: LikeActivity) -> Result<InboxOutcome, AppError> {
        let Some(post_id) = self.urls.local_post_id(&like.object) else {
            tracing::info!(object = %like.object, "Like target is not a local post, dropping");
            return Ok(InboxOutcome::dropped());
        };
        if self.db.get_post(&post_id).await?.is_none() {
            tracing::info!(post_id = %post_id, "Like target does not exist, dropping");
            return Ok(InboxOutcome::dropped());
        }

        let activity_id = like
            .id
            .unwrap_or_else(|| format!("{}#likes/{}", like.actor, EntityId::new().0));
        let inserted = self
            .db
            .insert_federated_like_if_absent(&FederatedLike {
                id: EntityId::new().0,
                target_post_id: post_id.clone(),
                remote_actor_url: like.actor.clone(),
                activity_id,
                created_at: Utc::now(),
            })
            .await?;

        tracing::info!(actor = %like.actor, post_id = %post_id, inserted, "Processed Like");
        Ok(InboxOutcome::effect(if inserted {
            InboxEffect::LikeRecorded
        } else {
            InboxEffect::LikeAlreadyRecorded
        }))
    }

    async fn handle_create_note(&self, note: CreateNoteActivity) -> Result<InboxOutcome, AppError> {
        let now = Utc::now();
        self.db
            .insert_federated_post(&FederatedPost {
                id: EntityId::new().0,
                remote_actor_url: note.actor.clone(),
                content: sanitize_remote_html(&note.content),
                activity_id: note.id.clone(),
                published_at: note.published.unwrap_or(now),
                received_at: now,
            })
            .await?;

        tracing::info!(actor = %note.actor, activity = %note.id, "Archived remote note");
        Ok(InboxOutcome::effect(InboxEffect::NoteArchived))
    }
}
