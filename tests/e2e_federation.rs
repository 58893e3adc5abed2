//! E2E tests for activity federation
//!
//! Each test runs a real node with its worker pool against a fake remote
//! pump server that performs host-meta/lrdd discovery, dialback-checked
//! client registration and OAuth-verified inbox delivery.

mod common;

use common::{FakeRemote, TestServer};
use fedispatch::data::{CollectionType, ItemKind};
use fedispatch::federation::{AudienceEntry, AudienceTier, CollectionRef, NewActivity, Verb};
use fedispatch::queue::Job;
use serde_json::json;

fn note(content: &str) -> serde_json::Value {
    json!({ "objectType": "note", "content": content })
}

// =============================================================================
// Remote delivery
// =============================================================================

#[tokio::test]
async fn test_remote_delivery_registers_and_signs() {
    let server = TestServer::new().await;
    let remote = FakeRemote::start().await;
    let alice = server.create_user("alice").await;
    let bob = server.entry(&remote.handle("bob")).await;

    let new = NewActivity::new(Verb::Post, &alice.id)
        .with_object(note("hello bob"))
        .address(AudienceTier::To, vec![bob]);
    let (record, _) = server.state.create_and_publish(new).await.unwrap();
    server.wait_idle().await;

    let received = remote.received();
    assert_eq!(received.len(), 1);
    let (username, body) = &received[0];
    assert_eq!(username, "bob");
    assert_eq!(body["verb"], "post");
    assert_eq!(body["object"]["content"], "hello bob");
    assert_eq!(
        body["actor"]["id"],
        format!("acct:alice@{}", server.state.config.server.domain)
    );
    assert_eq!(body["to"][0]["id"], format!("acct:{}", remote.handle("bob")));

    // Registration was dialed back to this node and accepted
    assert_eq!(remote.registrations(), 1);
    assert_eq!(
        remote.state.dialbacks.load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    // Successful remote delivery is recorded on the distribution record
    let stored = server.state.db.get_activity(&record.id).await.unwrap().unwrap();
    let distribution_id = stored.distribution_id.expect("distribution record");
    let items = server
        .state
        .db
        .get_collection_items(&distribution_id)
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].item_kind, ItemKind::RemoteUser.as_str());

    // Author sees their own activity
    assert_eq!(server.inbox(&alice).await, vec![record.id.clone()]);
    assert!(server.state.queue.dead_letters().is_empty());
}

#[tokio::test]
async fn test_credentials_reused_across_activities() {
    let server = TestServer::new().await;
    let remote = FakeRemote::start().await;
    let alice = server.create_user("alice").await;

    for text in ["first", "second"] {
        let bob = server.entry(&remote.handle("bob")).await;
        let new = NewActivity::new(Verb::Post, &alice.id)
            .with_object(note(text))
            .address(AudienceTier::To, vec![bob]);
        server.state.create_and_publish(new).await.unwrap();
        server.wait_idle().await;
    }

    assert_eq!(remote.received().len(), 2);
    assert_eq!(remote.registrations(), 1);

    let sender = server.state.db.get_local_user(&alice.id).await.unwrap().unwrap();
    let credential = server
        .state
        .db
        .get_client_credential(&sender.id, &remote.state.addr.to_string())
        .await
        .unwrap()
        .expect("stored credential");
    assert_eq!(credential.client_id, "client-1");
}

#[tokio::test]
async fn test_inbox_failure_is_retried_once_delivered() {
    let server = TestServer::new().await;
    let remote = FakeRemote::start_with(true, 1).await;
    let alice = server.create_user("alice").await;
    let bob = server.entry(&remote.handle("bob")).await;

    let new = NewActivity::new(Verb::Post, &alice.id)
        .with_object(note("eventually"))
        .address(AudienceTier::Cc, vec![bob]);
    let (record, _) = server.state.create_and_publish(new).await.unwrap();
    server.wait_idle().await;

    assert_eq!(remote.inbox_attempts(), 2);
    assert_eq!(remote.received().len(), 1);
    assert_eq!(remote.registrations(), 1);
    assert!(server.state.queue.dead_letters().is_empty());

    let stored = server.state.db.get_activity(&record.id).await.unwrap().unwrap();
    let items = server
        .state
        .db
        .get_collection_items(&stored.distribution_id.unwrap())
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
}

#[tokio::test]
async fn test_missing_activity_inbox_dead_letters() {
    let server = TestServer::new().await;
    let remote = FakeRemote::start_with(false, 0).await;
    let alice = server.create_user("alice").await;
    let bob = server.entry(&remote.handle("bob")).await;

    let new = NewActivity::new(Verb::Post, &alice.id)
        .with_object(note("nowhere to go"))
        .address(AudienceTier::To, vec![bob]);
    let (record, _) = server.state.create_and_publish(new).await.unwrap();
    server.wait_idle().await;

    assert!(remote.received().is_empty());
    assert_eq!(remote.registrations(), 0);

    let dead = server.state.queue.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);
    match &dead[0].job {
        Job::DeliverRemote(delivery) => {
            assert_eq!(delivery.activity_id, record.id);
            assert_eq!(delivery.recipient, remote.handle("bob"));
        }
        other => panic!("unexpected dead letter {:?}", other),
    }

    // Local side of the distribution still happened
    assert_eq!(server.inbox(&alice).await, vec![record.id]);
}

// =============================================================================
// Audience handling
// =============================================================================

#[tokio::test]
async fn test_blind_tiers_reach_recipients_but_not_the_payload() {
    let server = TestServer::new().await;
    let remote = FakeRemote::start().await;
    let alice = server.create_user("alice").await;
    let carol = server.create_user("carol").await;
    let dave = server.create_user("dave").await;

    let new = NewActivity::new(Verb::Post, &alice.id)
        .with_object(note("secret cc"))
        .address(AudienceTier::To, vec![server.entry("carol").await])
        .address(AudienceTier::Bto, vec![server.entry("dave").await])
        .address(
            AudienceTier::Bcc,
            vec![server.entry(&remote.handle("bob")).await],
        );
    let (record, _) = server.state.create_and_publish(new).await.unwrap();
    server.wait_idle().await;

    let received = remote.received();
    assert_eq!(received.len(), 1);
    let body = &received[0].1;
    assert!(body.get("bto").is_none());
    assert!(body.get("bcc").is_none());
    assert_eq!(body["to"].as_array().unwrap().len(), 1);

    assert_eq!(server.inbox(&carol).await, vec![record.id.clone()]);
    assert_eq!(server.inbox(&dave).await, vec![record.id]);
}

#[tokio::test]
async fn test_empty_audience_delivers_nothing() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice").await;

    let new = NewActivity::new(Verb::Post, &alice.id).with_object(note("to nobody"));
    let (record, handle) = server.state.create_and_publish(new).await.unwrap();
    assert_eq!(handle.job, "federate");
    server.wait_idle().await;

    let stored = server.state.db.get_activity(&record.id).await.unwrap().unwrap();
    assert!(stored.distribution_id.is_none());
    assert!(server.inbox(&alice).await.is_empty());
    assert!(server.state.queue.dead_letters().is_empty());

    // Still in the author's outbox
    let outbox = server
        .state
        .db
        .get_collection_items(&alice.outbox_id)
        .await
        .unwrap();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].item_id, record.id);
}

#[tokio::test]
async fn test_cyclic_lists_deliver_each_member_once() {
    let server = TestServer::new().await;
    let remote = FakeRemote::start().await;
    let alice = server.create_user("alice").await;
    let carol = server.create_user("carol").await;
    let db = &server.state.db;

    let friends = db
        .create_collection(CollectionType::UserDefined, Some("friends"), Some(alice.id.as_str()))
        .await
        .unwrap();
    let family = db
        .create_collection(CollectionType::UserDefined, Some("family"), Some(alice.id.as_str()))
        .await
        .unwrap();
    db.append_to_collection(&friends.id, ItemKind::Collection, &family.id)
        .await
        .unwrap();
    db.append_to_collection(&family.id, ItemKind::Collection, &friends.id)
        .await
        .unwrap();
    db.append_to_collection(&family.id, ItemKind::LocalUser, &carol.id)
        .await
        .unwrap();
    db.append_to_collection(&friends.id, ItemKind::LocalUser, &carol.id)
        .await
        .unwrap();

    let new = NewActivity::new(Verb::Post, &alice.id)
        .with_object(note("for the lists"))
        .address(
            AudienceTier::To,
            vec![AudienceEntry::Collection(CollectionRef {
                id: friends.id.clone(),
                title: Some("friends".to_string()),
            })],
        );
    let (record, _) = server.state.create_and_publish(new).await.unwrap();
    server.wait_idle().await;

    assert_eq!(server.inbox(&carol).await, vec![record.id.clone()]);
    assert_eq!(server.inbox(&alice).await, vec![record.id]);
    assert!(remote.received().is_empty());
    assert!(server.state.queue.dead_letters().is_empty());
}

#[tokio::test]
async fn test_republish_reuses_distribution_record() {
    let server = TestServer::new().await;
    let remote = FakeRemote::start().await;
    let alice = server.create_user("alice").await;
    let bob = server.entry(&remote.handle("bob")).await;

    let new = NewActivity::new(Verb::Share, &alice.id)
        .with_object(note("again"))
        .address(AudienceTier::To, vec![bob]);
    let (record, _) = server.state.create_and_publish(new).await.unwrap();
    server.wait_idle().await;
    let first = server
        .state
        .db
        .get_activity(&record.id)
        .await
        .unwrap()
        .unwrap()
        .distribution_id;

    server.state.publish(&record.id).unwrap();
    server.wait_idle().await;
    let second = server
        .state
        .db
        .get_activity(&record.id)
        .await
        .unwrap()
        .unwrap()
        .distribution_id;

    assert!(first.is_some());
    assert_eq!(first, second);
    // Already-delivered recipient is skipped on the second run
    assert_eq!(remote.received().len(), 1);
    assert_eq!(server.inbox(&alice).await.len(), 1);
}
