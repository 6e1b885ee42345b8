//! Records Subscribe

use std::time::Duration;

use dwn_core::event::Notification;
use dwn_core::records::{Data, RecordsFilter, SubscribeBuilder, WriteBuilder};
use dwn_core::{Error, endpoint};
use futures::StreamExt;
use http::StatusCode;
use test_node::key_store::{self, ALICE_DID, BOB_DID};
use test_node::provider::ProviderImpl;

// A committed write matching the subscription's filter is delivered; a
// non-matching write is not.
#[tokio::test]
async fn filtered_notifications() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);

    let subscribe = SubscribeBuilder::new()
        .filter(RecordsFilter::new().schema("https://example.com/chat"))
        .build(&alice)
        .await
        .expect("should create subscribe");
    let reply = endpoint::handle(ALICE_DID, subscribe, &provider).await.expect("should subscribe");
    assert_eq!(reply.status.code, StatusCode::OK);
    let mut subscription = reply.body.expect("should have body").subscription;

    // non-matching write
    let other = WriteBuilder::new()
        .data(Data::from(b"off topic".to_vec()))
        .schema("https://example.com/other")
        .build(&alice)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, other, &provider).await.expect("should write");

    // matching write
    let chat = WriteBuilder::new()
        .data(Data::from(b"on topic".to_vec()))
        .schema("https://example.com/chat")
        .build(&alice)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, chat.clone(), &provider).await.expect("should write");

    // the first delivered notification is the matching write
    let notification = tokio::time::timeout(Duration::from_secs(1), subscription.next())
        .await
        .expect("should not time out")
        .expect("stream should be open");

    let Notification::Event(event) = notification else {
        panic!("should be an event");
    };
    let write = event.as_write().expect("should be a write");
    assert_eq!(write.record_id, chat.record_id);

    // nothing else is pending
    let pending = tokio::time::timeout(Duration::from_millis(100), subscription.next()).await;
    assert!(pending.is_err(), "no further notifications expected");
}

// An anonymous subscription is limited to published records.
#[tokio::test]
async fn anonymous_subscription() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);

    // unpublished filter: rejected
    let subscribe = SubscribeBuilder::new()
        .filter(RecordsFilter::new())
        .authorize(false)
        .build(&alice)
        .await
        .expect("should create subscribe");
    let Err(Error::Forbidden(_)) = endpoint::handle(ALICE_DID, subscribe, &provider).await else {
        panic!("should be Forbidden");
    };

    // published-only filter: accepted, and delivered on publish
    let subscribe = SubscribeBuilder::new()
        .filter(RecordsFilter::new().published(true))
        .authorize(false)
        .build(&alice)
        .await
        .expect("should create subscribe");
    let reply = endpoint::handle(ALICE_DID, subscribe, &provider).await.expect("should subscribe");
    let mut subscription = reply.body.expect("should have body").subscription;

    let write = WriteBuilder::new()
        .data(Data::from(b"broadcast".to_vec()))
        .published(true)
        .build(&alice)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, write.clone(), &provider).await.expect("should write");

    let notification = tokio::time::timeout(Duration::from_secs(1), subscription.next())
        .await
        .expect("should not time out")
        .expect("stream should be open");

    let Notification::Event(event) = notification else {
        panic!("should be an event");
    };
    assert_eq!(event.as_write().expect("should be a write").record_id, write.record_id);
}

// A non-owner without a grant or protocol rule may not install an
// unpublished subscription.
#[tokio::test]
async fn stranger_subscription() {
    let provider = ProviderImpl::new();
    let bob = key_store::keyring(BOB_DID);

    let subscribe = SubscribeBuilder::new()
        .filter(RecordsFilter::new())
        .build(&bob)
        .await
        .expect("should create subscribe");
    let Err(Error::Forbidden(_)) = endpoint::handle(ALICE_DID, subscribe, &provider).await else {
        panic!("should be Forbidden");
    };
}
