//! SQLite database operations
//!
//! All database access goes through this module.

use sqlx::{Pool, QueryBuilder, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
///
/// Constructed once at startup and shared through `Arc`.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Create or update a local account
    pub async fn upsert_account(&self, account: &Account) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
                uid, username, display_name, bio, avatar_url, verified, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uid) DO UPDATE SET
                display_name = excluded.display_name,
                bio = excluded.bio,
                avatar_url = excluded.avatar_url,
                verified = excluded.verified
            "#,
        )
        .bind(&account.uid)
        .bind(&account.username)
        .bind(&account.display_name)
        .bind(&account.bio)
        .bind(&account.avatar_url)
        .bind(account.verified)
        .bind(account.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Look up a local account by username
    pub async fn get_account_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        Ok(account)
    }

    /// Look up a local account by uid
    pub async fn get_account(&self, uid: &str) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE uid = ?")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;

        Ok(account)
    }

    /// Fetch every account whose uid is in `uids`
    pub async fn get_accounts_by_uids(&self, uids: &[String]) -> Result<Vec<Account>, AppError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query_builder = QueryBuilder::<Sqlite>::new("SELECT * FROM accounts WHERE uid IN (");
        {
            let mut separated = query_builder.separated(", ");
            for uid in uids {
                separated.push_bind(uid);
            }
        }
        query_builder.push(")");

        let accounts = query_builder
            .build_query_as::<Account>()
            .fetch_all(&self.pool)
            .await?;

        Ok(accounts)
    }

    /// Count local accounts
    pub async fn count_accounts(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM accounts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Account with live post/follower/following counts
    pub async fn get_local_actor(&self, username: &str) -> Result<Option<LocalActor>, AppError> {
        let Some(account) = self.get_account_by_username(username).await? else {
            return Ok(None);
        };

        let posts = self.count_public_posts(&account.uid).await?;
        let followers = self.count_local_followers(&account.uid).await?
            + self.count_federated_followers(&account.uid).await?;
        let following = self.count_local_following(&account.uid).await?;

        Ok(Some(LocalActor {
            account,
            counts: ActorCounts {
                posts,
                followers,
                following,
            },
        }))
    }

    // =========================================================================
    // Posts
    // =========================================================================

    /// Insert a local post
    pub async fn insert_post(&self, post: &Post) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO posts (id, author_uid, content, privacy, pinned, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.author_uid)
        .bind(&post.content)
        .bind(&post.privacy)
        .bind(post.pinned)
        .bind(post.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a post by ID regardless of privacy
    pub async fn get_post(&self, id: &str) -> Result<Option<Post>, AppError> {
        let post = sqlx::query_as::<_, Post>("SELECT * FROM posts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(post)
    }

    /// Count public posts by an author
    pub async fn count_public_posts(&self, author_uid: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM posts WHERE author_uid = ? AND privacy = 'public'",
        )
        .bind(author_uid)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Count public posts across all local accounts
    pub async fn count_all_public_posts(&self) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM posts WHERE privacy = 'public'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Public posts by an author, newest first
    pub async fn get_public_posts(
        &self,
        author_uid: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Post>, AppError> {
        let posts = sqlx::query_as::<_, Post>(
            r#"
            SELECT * FROM posts
            WHERE author_uid = ? AND privacy = 'public'
            ORDER BY created_at DESC, rowid DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(author_uid)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(posts)
    }

    /// Count pinned public posts by an author
    pub async fn count_pinned_posts(&self, author_uid: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM posts WHERE author_uid = ? AND privacy = 'public' AND pinned = 1",
        )
        .bind(author_uid)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Pinned public posts by an author, newest first
    pub async fn get_pinned_posts(
        &self,
        author_uid: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Post>, AppError> {
        let posts = sqlx::query_as::<_, Post>(
            r#"
            SELECT * FROM posts
            WHERE author_uid = ? AND privacy = 'public' AND pinned = 1
            ORDER BY created_at DESC, rowid DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(author_uid)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(posts)
    }

    // =========================================================================
    // Local social graph
    // =========================================================================

    /// Insert a local follow edge
    pub async fn insert_local_follow(&self, follow: &LocalFollow) -> Result<(), AppError> {
        sqlx::query(
            "INSERT OR IGNORE INTO follows (follower_uid, following_uid, created_at) VALUES (?, ?, ?)",
        )
        .bind(&follow.follower_uid)
        .bind(&follow.following_uid)
        .bind(follow.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Count local accounts following `uid`
    pub async fn count_local_followers(&self, uid: &str) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM follows WHERE following_uid = ?")
                .bind(uid)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Usernames of local accounts following `uid`, newest first
    pub async fn get_local_follower_usernames(
        &self,
        uid: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, AppError> {
        let usernames = sqlx::query_scalar::<_, String>(
            r#"
            SELECT a.username FROM follows f
            JOIN accounts a ON a.uid = f.follower_uid
            WHERE f.following_uid = ?
            ORDER BY f.created_at DESC, f.rowid DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(uid)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(usernames)
    }

    /// Count local accounts `uid` follows
    pub async fn count_local_following(&self, uid: &str) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM follows WHERE follower_uid = ?")
                .bind(uid)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Usernames of local accounts `uid` follows, newest first
    pub async fn get_local_following_usernames(
        &self,
        uid: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, AppError> {
        let usernames = sqlx::query_scalar::<_, String>(
            r#"
            SELECT a.username FROM follows f
            JOIN accounts a ON a.uid = f.following_uid
            WHERE f.follower_uid = ?
            ORDER BY f.created_at DESC, f.rowid DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(uid)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(usernames)
    }

    /// Record that a local account liked a post
    pub async fn insert_local_like(&self, post_id: &str, liker_uid: &str) -> Result<(), AppError> {
        sqlx::query("INSERT OR IGNORE INTO likes (post_id, liker_uid, created_at) VALUES (?, ?, ?)")
            .bind(post_id)
            .bind(liker_uid)
            .bind(chrono::Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Count public posts liked by `uid`
    pub async fn count_liked_posts(&self, uid: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM likes l
            JOIN posts p ON p.id = l.post_id
            WHERE l.liker_uid = ? AND p.privacy = 'public'
            "#,
        )
        .bind(uid)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// IDs of public posts liked by `uid`, most recent like first
    pub async fn get_liked_post_ids(
        &self,
        uid: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, AppError> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT l.post_id FROM likes l
            JOIN posts p ON p.id = l.post_id
            WHERE l.liker_uid = ? AND p.privacy = 'public'
            ORDER BY l.created_at DESC, l.rowid DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(uid)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Feature a tag on a profile
    pub async fn insert_featured_tag(&self, uid: &str, name: &str) -> Result<(), AppError> {
        sqlx::query("INSERT OR IGNORE INTO featured_tags (uid, name, created_at) VALUES (?, ?, ?)")
            .bind(uid)
            .bind(name)
            .bind(chrono::Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Count featured tags of `uid`
    pub async fn count_featured_tags(&self, uid: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM featured_tags WHERE uid = ?")
            .bind(uid)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Featured tags of `uid`, oldest first (profile order)
    pub async fn get_featured_tags(
        &self,
        uid: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FeaturedTag>, AppError> {
        let tags = sqlx::query_as::<_, FeaturedTag>(
            r#"
            SELECT * FROM featured_tags WHERE uid = ?
            ORDER BY created_at ASC, rowid ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(uid)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(tags)
    }

    // =========================================================================
    // Actor keys
    // =========================================================================

    /// Get the keypair on file for a local actor
    pub async fn get_actor_key_pair(&self, uid: &str) -> Result<Option<ActorKeyPair>, AppError> {
        let key_pair =
            sqlx::query_as::<_, ActorKeyPair>("SELECT * FROM actor_keys WHERE owner_uid = ?")
                .bind(uid)
                .fetch_optional(&self.pool)
                .await?;

        Ok(key_pair)
    }

    /// Persist a keypair unless one already exists for the owner.
    ///
    /// # Returns
    /// `true` if this call inserted the row.
    pub async fn insert_actor_key_pair_if_absent(
        &self,
        key_pair: &ActorKeyPair,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO actor_keys (owner_uid, public_key_pem, private_key_pem, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(owner_uid) DO NOTHING
            "#,
        )
        .bind(&key_pair.owner_uid)
        .bind(&key_pair.public_key_pem)
        .bind(&key_pair.private_key_pem)
        .bind(key_pair.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Federated follows
    // =========================================================================

    /// Insert a federated follow unless the (actor, target) pair already exists.
    ///
    /// # Returns
    /// `true` if a new row was created.
    pub async fn insert_federated_follow_if_absent(
        &self,
        follow: &FederatedFollow,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO federated_follows (
                id, remote_actor_url, local_following_uid, activity_id, created_at
            ) VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(remote_actor_url, local_following_uid) DO NOTHING
            "#,
        )
        .bind(&follow.id)
        .bind(&follow.remote_actor_url)
        .bind(&follow.local_following_uid)
        .bind(&follow.activity_id)
        .bind(follow.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get the federated follow for an (actor, target) pair
    pub async fn get_federated_follow(
        &self,
        remote_actor_url: &str,
        local_following_uid: &str,
    ) -> Result<Option<FederatedFollow>, AppError> {
        let follow = sqlx::query_as::<_, FederatedFollow>(
            "SELECT * FROM federated_follows WHERE remote_actor_url = ? AND local_following_uid = ?",
        )
        .bind(remote_actor_url)
        .bind(local_following_uid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(follow)
    }

    /// Delete a federated follow by actor and Follow activity ID
    ///
    /// # Returns
    /// Number of rows removed
    pub async fn delete_federated_follow_by_activity(
        &self,
        remote_actor_url: &str,
        activity_id: &str,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            "DELETE FROM federated_follows WHERE remote_actor_url = ? AND activity_id = ?",
        )
        .bind(remote_actor_url)
        .bind(activity_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete a federated follow by actor and followed local account
    ///
    /// # Returns
    /// Number of rows removed
    pub async fn delete_federated_follow_by_target(
        &self,
        remote_actor_url: &str,
        local_following_uid: &str,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            "DELETE FROM federated_follows WHERE remote_actor_url = ? AND local_following_uid = ?",
        )
        .bind(remote_actor_url)
        .bind(local_following_uid)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Count remote followers of `uid`
    pub async fn count_federated_followers(&self, uid: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM federated_follows WHERE local_following_uid = ?",
        )
        .bind(uid)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Remote follower actor URLs of `uid`, newest first
    pub async fn get_federated_follower_urls(
        &self,
        uid: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, AppError> {
        let urls = sqlx::query_scalar::<_, String>(
            r#"
            SELECT remote_actor_url FROM federated_follows
            WHERE local_following_uid = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(uid)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(urls)
    }

    /// Every remote follower actor URL of `uid` (fan-out)
    pub async fn get_all_federated_follower_urls(&self, uid: &str) -> Result<Vec<String>, AppError> {
        let urls = sqlx::query_scalar::<_, String>(
            "SELECT remote_actor_url FROM federated_follows WHERE local_following_uid = ? ORDER BY created_at ASC",
        )
        .bind(uid)
        .fetch_all(&self.pool)
        .await?;

        Ok(urls)
    }

    // =========================================================================
    // Federated likes
    // =========================================================================

    /// Insert a federated like unless this actor already liked the post.
    ///
    /// # Returns
    /// `true` if a new row was created.
    pub async fn insert_federated_like_if_absent(
        &self,
        like: &FederatedLike,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO federated_likes (
                id, target_post_id, remote_actor_url, activity_id, created_at
            ) VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(target_post_id, remote_actor_url) DO NOTHING
            "#,
        )
        .bind(&like.id)
        .bind(&like.target_post_id)
        .bind(&like.remote_actor_url)
        .bind(&like.activity_id)
        .bind(like.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a federated like by actor and Like activity ID
    pub async fn delete_federated_like_by_activity(
        &self,
        remote_actor_url: &str,
        activity_id: &str,
    ) -> Result<u64, AppError> {
        let result =
            sqlx::query("DELETE FROM federated_likes WHERE remote_actor_url = ? AND activity_id = ?")
                .bind(remote_actor_url)
                .bind(activity_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    /// Delete a federated like by actor and liked post
    pub async fn delete_federated_like_by_target(
        &self,
        remote_actor_url: &str,
        target_post_id: &str,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            "DELETE FROM federated_likes WHERE remote_actor_url = ? AND target_post_id = ?",
        )
        .bind(remote_actor_url)
        .bind(target_post_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Count remote likes on a post
    pub async fn count_federated_likes(&self, target_post_id: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM federated_likes WHERE target_post_id = ?",
        )
        .bind(target_post_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // =========================================================================
    // Federated posts
    // =========================================================================

    /// Archive a remote Note
    pub async fn insert_federated_post(&self, post: &FederatedPost) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO federated_posts (
                id, remote_actor_url, content, activity_id, published_at, received_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.remote_actor_url)
        .bind(&post.content)
        .bind(&post.activity_id)
        .bind(post.published_at)
        .bind(post.received_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Archived Notes from one remote actor, newest first
    pub async fn get_federated_posts_by_actor(
        &self,
        remote_actor_url: &str,
    ) -> Result<Vec<FederatedPost>, AppError> {
        let posts = sqlx::query_as::<_, FederatedPost>(
            "SELECT * FROM federated_posts WHERE remote_actor_url = ? ORDER BY published_at DESC",
        )
        .bind(remote_actor_url)
        .fetch_all(&self.pool)
        .await?;

        Ok(posts)
    }

    /// Count archived remote Notes
    pub async fn count_federated_posts(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM federated_posts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Count every federation row (follows, likes, posts).
    ///
    /// Used to assert that rejected requests left no trace.
    pub async fn count_federation_rows(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM federated_follows)
                + (SELECT COUNT(*) FROM federated_likes)
                + (SELECT COUNT(*) FROM federated_posts)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
