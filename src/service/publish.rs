//! Public post fan-out
//!
//! Delivers a `Create` for a local public post to every remote follower of
//! its author. Deliveries are best-effort with a single attempt each.

use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::data::Database;
use crate::error::AppError;
use crate::federation::{
    ActivityDelivery, ActorResolver, DeliveryResult, KeyManager, NoteConverter, with_context,
};

/// Publishes local posts to remote followers
pub struct PublishService {
    db: Arc<Database>,
    keys: Arc<KeyManager>,
    resolver: Arc<ActorResolver>,
    delivery: Arc<ActivityDelivery>,
    converter: Arc<NoteConverter>,
    concurrency: usize,
}

impl PublishService {
    pub fn new(
        db: Arc<Database>,
        keys: Arc<KeyManager>,
        resolver: Arc<ActorResolver>,
        delivery: Arc<ActivityDelivery>,
        converter: Arc<NoteConverter>,
        concurrency: usize,
    ) -> Self {
        Self {
            db,
            keys,
            resolver,
            delivery,
            converter,
            concurrency: concurrency.max(1),
        }
    }

    /// Fan a post out to the author's federated followers.
    ///
    /// Non-public posts are never federated and yield no deliveries.
    /// Followers whose actor document cannot be fetched are skipped.
    ///
    /// # Errors
    /// `NotFound` for an unknown post; storage failures propagate
    pub async fn federate_post(&self, post_id: &str) -> Result<Vec<DeliveryResult>, AppError> {
        let post = self.db.get_post(post_id).await?.ok_or(AppError::NotFound)?;
        if !post.is_public() {
            tracing::debug!(post_id = %post_id, privacy = %post.privacy, "Skipping non-public post");
            return Ok(Vec::new());
        }

        let follower_urls = self
            .db
            .get_all_federated_follower_urls(&post.author_uid)
            .await?;
        if follower_urls.is_empty() {
            tracing::debug!(post_id = %post_id, "No remote followers to deliver to");
            return Ok(Vec::new());
        }

        let activity = with_context(self.converter.convert_post_to_activity(&post).await?);
        self.keys.get_or_create_key_pair(&post.author_uid).await?;

        let inboxes = self.resolve_delivery_inboxes(follower_urls).await;
        Ok(self
            .delivery
            .deliver_to_inboxes(activity, inboxes, &post.author_uid)
            .await)
    }

    /// Resolve follower actors concurrently, preferring shared inboxes.
    async fn resolve_delivery_inboxes(&self, follower_urls: Vec<String>) -> Vec<String> {
        let resolver = &self.resolver;
        stream::iter(follower_urls)
            .map(|actor_url| async move {
                resolver
                    .resolve_remote_actor(&actor_url)
                    .await
                    .map(|actor| actor.delivery_inbox().to_string())
                    .ok()
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|inbox| async move { inbox })
            .collect()
            .await
    }
}
