//! Local post to ActivityStreams conversion
//!
//! Post content carries internal mention tokens of the form `@[<uid>]`.
//! They are rewritten to `@<display name>` before anything leaves the
//! instance; an unknown uid becomes `@unknown`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};

use super::actor::{ACTIVITY_STREAMS_CONTEXT, ActorUrls, PUBLIC_COLLECTION};
use crate::data::{Database, Post};
use crate::error::AppError;

const UNKNOWN_MENTION: &str = "unknown";

/// Converts local posts into Note objects and Create activities
pub struct NoteConverter {
    db: Arc<Database>,
    urls: ActorUrls,
}

impl NoteConverter {
    pub fn new(db: Arc<Database>, urls: ActorUrls) -> Self {
        Self { db, urls }
    }

    /// Note object for a post, with mentions expanded
    pub async fn post_to_note(&self, post: &Post) -> Result<Value, AppError> {
        let author = self
            .db
            .get_account(&post.author_uid)
            .await?
            .ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!(
                    "Post {} has no author account {}",
                    post.id,
                    post.author_uid
                ))
            })?;
        let content = self.expand_mentions(&post.content).await?;

        Ok(build_note(&self.urls, post, &author.username, &content))
    }

    /// Create activity wrapping the post's Note
    pub async fn convert_post_to_activity(&self, post: &Post) -> Result<Value, AppError> {
        let note = self.post_to_note(post).await?;
        Ok(wrap_in_create(&self.urls, post, note))
    }

    /// Convert a page of posts, preserving order
    pub async fn convert_posts(&self, posts: &[Post]) -> Result<Vec<Value>, AppError> {
        let mut activities = Vec::with_capacity(posts.len());
        for post in posts {
            activities.push(self.convert_post_to_activity(post).await?);
        }
        Ok(activities)
    }

    async fn expand_mentions(&self, content: &str) -> Result<String, AppError> {
        let uids = mention_uids(content);
        if uids.is_empty() {
            return Ok(content.to_string());
        }

        let names: HashMap<String, String> = self
            .db
            .get_accounts_by_uids(&uids)
            .await?
            .into_iter()
            .map(|account| {
                let name = account.public_name().to_string();
                (account.uid, name)
            })
            .collect();

        Ok(expand_mention_tokens(content, &names))
    }
}

/// Add the ActivityStreams `@context` to a top-level object
pub fn with_context(mut value: Value) -> Value {
    if let Some(object) = value.as_object_mut() {
        object.insert("@context".to_string(), json!(ACTIVITY_STREAMS_CONTEXT));
    }
    value
}

fn build_note(urls: &ActorUrls, post: &Post, author_username: &str, content: &str) -> Value {
    let post_url = urls.post(&post.id);
    json!({
        "id": post_url,
        "type": "Note",
        "attributedTo": urls.actor(author_username),
        "content": content,
        "published": post.created_at.to_rfc3339(),
        "url": post_url,
        "to": [PUBLIC_COLLECTION],
        "cc": [urls.followers(author_username)]
    })
}

fn wrap_in_create(urls: &ActorUrls, post: &Post, note: Value) -> Value {
    json!({
        "id": urls.post_activity(&post.id),
        "type": "Create",
        "actor": note["attributedTo"],
        "published": note["published"],
        "to": note["to"],
        "cc": note["cc"],
        "object": note
    })
}

/// Iterate over `(start, end, uid)` for every `@[uid]` token.
fn mention_tokens(content: &str) -> impl Iterator<Item = (usize, usize, &str)> {
    let mut cursor = 0;
    std::iter::from_fn(move || {
        while let Some(offset) = content[cursor..].find("@[") {
            let start = cursor + offset;
            let uid_start = start + 2;
            let Some(len) = content[uid_start..].find(']') else {
                cursor = content.len();
                return None;
            };
            let uid = &content[uid_start..uid_start + len];
            if is_mention_uid(uid) {
                let end = uid_start + len + 1;
                cursor = end;
                return Some((start, end, uid));
            }
            cursor = uid_start;
        }
        None
    })
}

fn is_mention_uid(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Distinct uids mentioned in `content`
pub fn mention_uids(content: &str) -> Vec<String> {
    let mut uids: Vec<String> = Vec::new();
    for (_, _, uid) in mention_tokens(content) {
        if !uids.iter().any(|u| u == uid) {
            uids.push(uid.to_string());
        }
    }
    uids
}

/// Replace each `@[uid]` with `@<escaped name>` using `names`.
pub fn expand_mention_tokens(content: &str, names: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(content.len());
    let mut last = 0;
    for (start, end, uid) in mention_tokens(content) {
        out.push_str(&content[last..start]);
        out.push('@');
        match names.get(uid) {
            Some(name) => out.push_str(&html_escape::encode_text(name)),
            None => out.push_str(UNKNOWN_MENTION),
        }
        last = end;
    }
    out.push_str(&content[last..]);
    out
}
