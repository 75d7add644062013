//! OrderedCollection paging
//!
//! Collections are served as an `OrderedCollection` summary pointing at
//! page 1, and 1-indexed `OrderedCollectionPage`s with offset paging.

use std::sync::Arc;

use serde_json::{Value, json};

use super::actor::{ACTIVITY_STREAMS_CONTEXT, ActorUrls};
use super::convert::NoteConverter;
use crate::data::{Database, LocalActor};
use crate::error::AppError;

/// Items per page for every collection except featured
pub const PAGE_SIZE: i64 = 20;
/// Featured collection page size, and its overall cap
pub const FEATURED_LIMIT: i64 = 10;

/// Which collection of an actor is being paged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Outbox,
    Followers,
    Following,
    Featured,
    FeaturedTags,
    Liked,
}

impl CollectionKind {
    pub fn page_size(self) -> i64 {
        match self {
            Self::Featured => FEATURED_LIMIT,
            _ => PAGE_SIZE,
        }
    }

    pub fn url(self, urls: &ActorUrls, username: &str) -> String {
        match self {
            Self::Outbox => urls.outbox(username),
            Self::Followers => urls.followers(username),
            Self::Following => urls.following(username),
            Self::Featured => urls.featured(username),
            Self::FeaturedTags => urls.featured_tags(username),
            Self::Liked => urls.liked(username),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outbox => "outbox",
            Self::Followers => "followers",
            Self::Following => "following",
            Self::Featured => "featured",
            Self::FeaturedTags => "featuredTags",
            Self::Liked => "liked",
        }
    }
}

/// Builds collection summaries and pages
pub struct CollectionPaginator {
    db: Arc<Database>,
    urls: ActorUrls,
    converter: Arc<NoteConverter>,
}

impl CollectionPaginator {
    pub fn new(db: Arc<Database>, urls: ActorUrls, converter: Arc<NoteConverter>) -> Self {
        Self {
            db,
            urls,
            converter,
        }
    }

    /// `OrderedCollection` with a live `totalItems` and a link to page 1
    pub async fn collection_summary(
        &self,
        kind: CollectionKind,
        username: &str,
    ) -> Result<Value, AppError> {
        let actor = self.local_actor(username).await?;
        let total = self.total_items(kind, &actor).await?;
        let id = kind.url(&self.urls, username);

        Ok(json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "id": id,
            "type": "OrderedCollection",
            "totalItems": total,
            "first": page_url(&id, 1)
        }))
    }

    /// One `OrderedCollectionPage`.
    ///
    /// A page past the end has empty `orderedItems`.
    ///
    /// # Errors
    /// `Validation` for page 0, `NotFound` for an unknown user
    pub async fn collection_page(
        &self,
        kind: CollectionKind,
        username: &str,
        page: u32,
    ) -> Result<Value, AppError> {
        if page == 0 {
            return Err(AppError::Validation("Pages start at 1".to_string()));
        }

        let actor = self.local_actor(username).await?;
        let total = self.total_items(kind, &actor).await?;
        let size = kind.page_size();
        let offset = (i64::from(page) - 1).saturating_mul(size);
        let items = self.page_items(kind, &actor, offset, size).await?;

        let part_of = kind.url(&self.urls, username);
        let mut body = json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "id": page_url(&part_of, page),
            "type": "OrderedCollectionPage",
            "partOf": part_of,
            "totalItems": total,
        });

        if offset + (items.len() as i64) < total {
            body["next"] = json!(page_url(&part_of, page + 1));
        }
        if page > 1 {
            body["prev"] = json!(page_url(&part_of, page - 1));
        }
        body["orderedItems"] = Value::Array(items);

        Ok(body)
    }

    async fn local_actor(&self, username: &str) -> Result<LocalActor, AppError> {
        self.db
            .get_local_actor(username)
            .await?
            .ok_or(AppError::NotFound)
    }

    async fn total_items(&self, kind: CollectionKind, actor: &LocalActor) -> Result<i64, AppError> {
        let uid = actor.account.uid.as_str();
        Ok(match kind {
            CollectionKind::Outbox => actor.counts.posts,
            CollectionKind::Followers => actor.counts.followers,
            CollectionKind::Following => actor.counts.following,
            CollectionKind::Featured => self.db.count_pinned_posts(uid).await?.min(FEATURED_LIMIT),
            CollectionKind::FeaturedTags => self.db.count_featured_tags(uid).await?,
            CollectionKind::Liked => self.db.count_liked_posts(uid).await?,
        })
    }

    async fn page_items(
        &self,
        kind: CollectionKind,
        actor: &LocalActor,
        offset: i64,
        size: i64,
    ) -> Result<Vec<Value>, AppError> {
        let uid = actor.account.uid.as_str();
        match kind {
            CollectionKind::Outbox => {
                let posts = self.db.get_public_posts(uid, size, offset).await?;
                self.converter.convert_posts(&posts).await
            }
            CollectionKind::Featured => {
                if offset >= FEATURED_LIMIT {
                    return Ok(Vec::new());
                }
                let limit = size.min(FEATURED_LIMIT - offset);
                let posts = self.db.get_pinned_posts(uid, limit, offset).await?;
                self.converter.convert_posts(&posts).await
            }
            CollectionKind::Followers => {
                let urls = self.follower_page(uid, offset, size).await?;
                Ok(urls.into_iter().map(Value::String).collect())
            }
            CollectionKind::Following => {
                let usernames = self
                    .db
                    .get_local_following_usernames(uid, size, offset)
                    .await?;
                Ok(usernames
                    .iter()
                    .map(|name| Value::String(self.urls.actor(name)))
                    .collect())
            }
            CollectionKind::FeaturedTags => {
                let tags = self.db.get_featured_tags(uid, size, offset).await?;
                Ok(tags
                    .iter()
                    .map(|tag| {
                        json!({
                            "type": "Hashtag",
                            "href": self.urls.tag(&tag.name),
                            "name": format!("#{}", tag.name)
                        })
                    })
                    .collect())
            }
            CollectionKind::Liked => {
                let ids = self.db.get_liked_post_ids(uid, size, offset).await?;
                Ok(ids
                    .iter()
                    .map(|id| Value::String(self.urls.post(id)))
                    .collect())
            }
        }
    }

    /// Local followers first; federated followers fill the remaining slots.
    async fn follower_page(
        &self,
        uid: &str,
        offset: i64,
        size: i64,
    ) -> Result<Vec<String>, AppError> {
        let local_total = self.db.count_local_followers(uid).await?;

        let mut items: Vec<String> = if offset < local_total {
            self.db
                .get_local_follower_usernames(uid, size, offset)
                .await?
                .iter()
                .map(|name| self.urls.actor(name))
                .collect()
        } else {
            Vec::new()
        };

        let remaining = size - items.len() as i64;
        if remaining > 0 {
            let federated_offset = (offset - local_total).max(0);
            items.extend(
                self.db
                    .get_federated_follower_urls(uid, remaining, federated_offset)
                    .await?,
            );
        }

        Ok(items)
    }
}

fn page_url(collection_url: &str, page: u32) -> String {
    format!("{}?page={}", collection_url, page)
}
