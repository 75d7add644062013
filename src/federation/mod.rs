//! ActivityPub federation module
//!
//! Handles:
//! - Actor documents and remote actor fetching
//! - Per-actor RSA keys
//! - HTTP Signatures
//! - Inbox processing
//! - Activity delivery
//! - Paged collections
//! - WebFinger

mod activity;
mod actor;
mod collection;
mod convert;
mod delivery;
mod keys;
mod signature;
mod webfinger;

pub use activity::{
    ActivityEnvelope, CreateNoteActivity, FollowActivity, InboundActivity, InboxEffect,
    InboxOutcome, InboxProcessor, LikeActivity, UndoActivity, UndoTarget,
};
pub use actor::{
    ACTIVITY_JSON, ACTIVITY_STREAMS_CONTEXT, ActorResolver, ActorUrls, PUBLIC_COLLECTION,
    RemoteActor, SECURITY_CONTEXT, build_actor_document, ensure_remote_target,
    extract_username_from_actor_path,
};
pub use collection::{CollectionKind, CollectionPaginator, FEATURED_LIMIT, PAGE_SIZE};
pub use convert::{NoteConverter, expand_mention_tokens, mention_uids, with_context};
pub use delivery::{ActivityDelivery, DeliveryResult, builder, unique_inbox_targets};
pub use keys::{KeyManager, generate_key_pair};
pub use signature::{
    MAX_DATE_SKEW_SECONDS, SignatureHeaders, extract_signature_key_id, generate_digest,
    key_id_matches_actor, parse_signature_header, sign_request, verify_signature,
};
pub use webfinger::{
    WebFingerLink, WebFingerResponse, generate_webfinger_response, parse_acct_resource,
    resolve_local_resource,
};
