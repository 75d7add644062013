//! Data models
//!
//! Rust structs representing database rows.
//! Federation rows use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Local accounts and content
// =============================================================================

/// A local account as stored by the main application
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    /// Immutable identity
    pub uid: String,
    pub username: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Name shown to other servers (display name, falling back to username)
    pub fn public_name(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.username)
    }
}

/// Live counters attached to a local actor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActorCounts {
    pub posts: i64,
    pub followers: i64,
    pub following: i64,
}

/// Account plus counters; the shape the federation layer reasons about
#[derive(Debug, Clone)]
pub struct LocalActor {
    pub account: Account,
    pub counts: ActorCounts,
}

/// Post visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privacy {
    Public,
    Followers,
    Private,
}

impl Privacy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Followers => "followers",
            Self::Private => "private",
        }
    }

    /// Unknown values are treated as private so they never federate.
    pub fn parse(value: &str) -> Self {
        match value {
            "public" => Self::Public,
            "followers" => Self::Followers,
            _ => Self::Private,
        }
    }
}

/// A local post
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub id: String,
    pub author_uid: String,
    /// HTML content, may contain `@[uid]` mention tokens
    pub content: String,
    /// Visibility: public, followers, private
    pub privacy: String,
    /// Shown in the featured collection
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
}

impl Post {
    pub fn privacy(&self) -> Privacy {
        Privacy::parse(&self.privacy)
    }

    pub fn is_public(&self) -> bool {
        self.privacy() == Privacy::Public
    }
}

/// A local follow edge
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocalFollow {
    pub follower_uid: String,
    pub following_uid: String,
    pub created_at: DateTime<Utc>,
}

/// A tag featured on a profile
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FeaturedTag {
    pub uid: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Federation state
// =============================================================================

/// RSA keypair for one local actor
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActorKeyPair {
    pub owner_uid: String,
    /// SPKI PEM
    pub public_key_pem: String,
    /// PKCS#8 PEM
    pub private_key_pem: String,
    pub created_at: DateTime<Utc>,
}

/// A remote actor following a local account
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FederatedFollow {
    pub id: String,
    pub remote_actor_url: String,
    pub local_following_uid: String,
    /// ID of the Follow activity that created this row
    pub activity_id: String,
    pub created_at: DateTime<Utc>,
}

/// A remote Like of a local post
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FederatedLike {
    pub id: String,
    pub target_post_id: String,
    pub remote_actor_url: String,
    pub activity_id: String,
    pub created_at: DateTime<Utc>,
}

/// Archived copy of a remote Note received via Create
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FederatedPost {
    pub id: String,
    pub remote_actor_url: String,
    /// Sanitized HTML
    pub content: String,
    pub activity_id: String,
    pub published_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}
