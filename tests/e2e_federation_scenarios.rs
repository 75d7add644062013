//! E2E federation scenarios: signed inbound activities from a mock remote
//! server, and the Accept it receives back.

mod common;

use common::{ACTIVITY_JSON, MockRemote, TestServer};
use pubgate::data::Privacy;
use pubgate::federation::{builder, sign_request};
use serde_json::json;

#[tokio::test]
async fn test_follow_is_recorded_and_accepted() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    let bob = server.create_account("bob").await;

    let follow_id = format!("{}/follows/1", remote.actor_url);
    let follow = builder::follow(&follow_id, &remote.actor_url, &server.actor_url("bob"));

    let response = server
        .post_signed("/activitypub/users/bob/inbox", &follow, &remote)
        .await;
    assert_eq!(response.status(), 202);
    assert_eq!(response.text().await.unwrap(), "Activity accepted");

    let row = server
        .state
        .db
        .get_federated_follow(&remote.actor_url, &bob.uid)
        .await
        .unwrap()
        .expect("follow row");
    assert_eq!(row.activity_id, follow_id);

    let received = remote.wait_for_deliveries(1).await;
    assert_eq!(received.len(), 1);
    let accept = &received[0];
    assert_eq!(accept["type"], "Accept");
    assert_eq!(accept["actor"], server.actor_url("bob"));
    assert_eq!(accept["object"]["type"], "Follow");
    assert_eq!(accept["object"]["id"], follow_id);
}

#[tokio::test]
async fn test_replayed_follow_keeps_single_row() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    let bob = server.create_account("bob").await;

    let follow = builder::follow(
        &format!("{}/follows/1", remote.actor_url),
        &remote.actor_url,
        &server.actor_url("bob"),
    );
    for _ in 0..2 {
        let response = server
            .post_signed("/activitypub/inbox", &follow, &remote)
            .await;
        assert_eq!(response.status(), 202);
    }

    assert_eq!(
        server.state.db.count_federated_followers(&bob.uid).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_undo_follow_with_unknown_id_falls_back_to_target() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    let bob = server.create_account("bob").await;

    let follow = builder::follow(
        &format!("{}/follows/1", remote.actor_url),
        &remote.actor_url,
        &server.actor_url("bob"),
    );
    server
        .post_signed("/activitypub/inbox", &follow, &remote)
        .await;

    // Inner object uses the short /users/ form of the actor URL.
    let undo = builder::undo(
        &format!("{}/undo/1", remote.actor_url),
        &remote.actor_url,
        json!({
            "type": "Follow",
            "id": format!("{}/follows/unknown", remote.actor_url),
            "actor": remote.actor_url,
            "object": "https://local.example/users/bob"
        }),
    );
    let response = server.post_signed("/activitypub/inbox", &undo, &remote).await;

    assert_eq!(response.status(), 202);
    assert!(
        server
            .state
            .db
            .get_federated_follow(&remote.actor_url, &bob.uid)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_like_and_create_are_applied() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    let bob = server.create_account("bob").await;
    let post = server.create_post(&bob.uid, Privacy::Public, 1).await;

    let like = builder::like(
        &format!("{}/likes/1", remote.actor_url),
        &remote.actor_url,
        &server.post_url(&post.id),
    );
    let response = server.post_signed("/activitypub/inbox", &like, &remote).await;
    assert_eq!(response.status(), 202);
    assert_eq!(
        server.state.db.count_federated_likes(&post.id).await.unwrap(),
        1
    );

    let create = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}/notes/1/activity", remote.actor_url),
        "type": "Create",
        "actor": remote.actor_url,
        "object": {
            "id": format!("{}/notes/1", remote.actor_url),
            "type": "Note",
            "content": "<p>hello<script>alert(1)</script></p>",
            "published": "2024-05-01T12:00:00Z"
        }
    });
    let response = server
        .post_signed("/activitypub/inbox", &create, &remote)
        .await;
    assert_eq!(response.status(), 202);

    let archived = server
        .state
        .db
        .get_federated_posts_by_actor(&remote.actor_url)
        .await
        .unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].content, "<p>hello</p>");
}

#[tokio::test]
async fn test_unknown_activity_is_accepted_without_mutation() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    server.create_account("bob").await;

    let arrive = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}/arrive/1", remote.actor_url),
        "type": "Arrive",
        "actor": remote.actor_url,
        "location": "https://places.example/1"
    });
    let response = server
        .post_signed("/activitypub/users/bob/inbox", &arrive, &remote)
        .await;

    assert_eq!(response.status(), 202);
    assert_eq!(server.state.db.count_federation_rows().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unsigned_follow_is_rejected_without_mutation() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    server.create_account("bob").await;

    let follow = builder::follow(
        &format!("{}/follows/1", remote.actor_url),
        &remote.actor_url,
        &server.actor_url("bob"),
    );
    let response = server
        .client
        .post(server.url("/activitypub/users/bob/inbox"))
        .header("Content-Type", ACTIVITY_JSON)
        .body(serde_json::to_vec(&follow).unwrap())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
    assert_eq!(server.state.db.count_federation_rows().await.unwrap(), 0);
    assert!(remote.received().is_empty());
}

#[tokio::test]
async fn test_tampered_body_is_rejected_without_mutation() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    server.create_account("bob").await;

    let follow = builder::follow(
        &format!("{}/follows/1", remote.actor_url),
        &remote.actor_url,
        &server.actor_url("bob"),
    );
    let signed_body = serde_json::to_vec(&follow).unwrap();
    let url = server.url("/activitypub/inbox");
    let headers = sign_request(
        "POST",
        &url,
        Some(&signed_body),
        &remote.private_key_pem,
        &remote.key_id,
    )
    .unwrap();

    let mut tampered = follow.clone();
    tampered["object"] = json!("https://local.example/activitypub/users/carol");

    let response = server
        .client
        .post(&url)
        .header("Content-Type", ACTIVITY_JSON)
        .header("Date", headers.date)
        .header("Digest", headers.digest.unwrap())
        .header("Signature", headers.signature)
        .body(serde_json::to_vec(&tampered).unwrap())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
    assert_eq!(server.state.db.count_federation_rows().await.unwrap(), 0);
}

#[tokio::test]
async fn test_follow_signed_with_path_style_key_id_is_accepted() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    let bob = server.create_account("bob").await;

    let follow = builder::follow(
        &format!("{}/follows/1", remote.actor_url),
        &remote.actor_url,
        &server.actor_url("bob"),
    );
    let response = server
        .post_signed_with_key(
            "/activitypub/inbox",
            serde_json::to_vec(&follow).unwrap(),
            &remote,
            &remote.path_key_id,
        )
        .await;

    assert_eq!(response.status(), 202);
    assert!(
        server
            .state
            .db
            .get_federated_follow(&remote.actor_url, &bob.uid)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_key_id_for_other_actor_is_rejected() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    server.create_account("bob").await;

    let follow = builder::follow(
        "https://remote.example/follows/1",
        "https://remote.example/users/mallory",
        &server.actor_url("bob"),
    );
    let response = server
        .post_signed("/activitypub/inbox", &follow, &remote)
        .await;

    assert_eq!(response.status(), 401);
    assert_eq!(server.state.db.count_federation_rows().await.unwrap(), 0);
}

#[tokio::test]
async fn test_structurally_invalid_envelope_is_unauthorized() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;

    let response = server
        .post_signed_bytes("/activitypub/inbox", b"{not json".to_vec(), &remote)
        .await;
    assert_eq!(response.status(), 401);

    let missing_actor = json!({"type": "Follow", "object": server.actor_url("bob")});
    let response = server
        .post_signed("/activitypub/inbox", &missing_actor, &remote)
        .await;
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_wrong_content_type_is_bad_request() {
    let server = TestServer::new().await;
    server.create_account("bob").await;

    let response = server
        .client
        .post(server.url("/activitypub/users/bob/inbox"))
        .header("Content-Type", "text/plain")
        .body("{}")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_inbox_of_unknown_user_is_not_found() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;

    let follow = builder::follow(
        &format!("{}/follows/1", remote.actor_url),
        &remote.actor_url,
        &server.actor_url("nobody"),
    );
    let response = server
        .post_signed("/activitypub/users/nobody/inbox", &follow, &remote)
        .await;

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_published_post_reaches_remote_follower() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    let bob = server.create_account("bob").await;

    let follow = builder::follow(
        &format!("{}/follows/1", remote.actor_url),
        &remote.actor_url,
        &server.actor_url("bob"),
    );
    server
        .post_signed("/activitypub/inbox", &follow, &remote)
        .await;
    remote.wait_for_deliveries(1).await;

    let post = server.create_post(&bob.uid, Privacy::Public, 0).await;
    let results = server.state.publisher.federate_post(&post.id).await.unwrap();

    assert_eq!(results.len(), 1);
    assert!(results[0].success);
    let received = remote.wait_for_deliveries(2).await;
    let create = received
        .iter()
        .find(|activity| activity["type"] == "Create")
        .expect("Create delivered");
    assert_eq!(create["object"]["id"], server.post_url(&post.id));
}
