//! Records Delete

use chrono::Duration;
use dwn_core::provider::KvStore;
use dwn_core::records::{Data, DeleteBuilder, QueryBuilder, RecordsFilter, WriteBuilder};
use dwn_core::{Error, endpoint};
use http::StatusCode;
use test_node::key_store::{self, ALICE_DID, BOB_DID};
use test_node::provider::ProviderImpl;

// A deleted record disappears from queries and earlier writes are rejected.
#[tokio::test]
async fn delete_then_stale_write() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);

    let initial = WriteBuilder::new()
        .data(Data::from(b"to be deleted".to_vec()))
        .build(&alice)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(ALICE_DID, initial.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let delete = DeleteBuilder::new()
        .record_id(&initial.record_id)
        .build(&alice)
        .await
        .expect("should create delete");
    let reply = endpoint::handle(ALICE_DID, delete, &provider).await.expect("should delete");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // queries omit the record
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().record_id(&initial.record_id))
        .build(&alice)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);
    assert!(reply.body.is_none());

    // an update pre-dating the delete is rejected
    let stale = WriteBuilder::from(initial.clone())
        .data(Data::from(b"too late".to_vec()))
        .message_timestamp(initial.descriptor.base.message_timestamp + Duration::microseconds(1))
        .build(&alice)
        .await
        .expect("should create update");
    let Err(Error::Conflict(_)) = endpoint::handle(ALICE_DID, stale, &provider).await else {
        panic!("should be Conflict");
    };
}

// Only the original author revives a deleted record with a later write.
#[tokio::test]
async fn revive_deleted() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);

    let initial = WriteBuilder::new()
        .data(Data::from(b"phoenix".to_vec()))
        .build(&alice)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, initial.clone(), &provider).await.expect("should write");

    let delete = DeleteBuilder::new()
        .record_id(&initial.record_id)
        .build(&alice)
        .await
        .expect("should create delete");
    endpoint::handle(ALICE_DID, delete, &provider).await.expect("should delete");

    // a later write by the original author revives the record
    let revive = WriteBuilder::from(initial.clone())
        .data(Data::from(b"reborn".to_vec()))
        .build(&alice)
        .await
        .expect("should create update");
    let reply = endpoint::handle(ALICE_DID, revive, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().record_id(&initial.record_id))
        .build(&alice)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    let body = reply.body.expect("should have body");
    assert_eq!(body.entries.expect("should have entries").len(), 1);
}

// A stranger may not delete another tenant's record.
#[tokio::test]
async fn stranger_delete() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);
    let bob = key_store::keyring(BOB_DID);

    let write = WriteBuilder::new()
        .data(Data::from(b"alice's record".to_vec()))
        .build(&alice)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, write.clone(), &provider).await.expect("should write");

    let delete = DeleteBuilder::new()
        .record_id(&write.record_id)
        .build(&bob)
        .await
        .expect("should create delete");
    let Err(Error::Forbidden(_)) = endpoint::handle(ALICE_DID, delete, &provider).await else {
        panic!("should be Forbidden");
    };
}

// Deleting an already deleted record returns not-found.
#[tokio::test]
async fn double_delete() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);

    let write = WriteBuilder::new()
        .data(Data::from(b"once".to_vec()))
        .build(&alice)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, write.clone(), &provider).await.expect("should write");

    let delete = DeleteBuilder::new()
        .record_id(&write.record_id)
        .build(&alice)
        .await
        .expect("should create delete");
    endpoint::handle(ALICE_DID, delete, &provider).await.expect("should delete");

    let again = DeleteBuilder::new()
        .record_id(&write.record_id)
        .build(&alice)
        .await
        .expect("should create delete");
    let Err(Error::NotFound(_)) = endpoint::handle(ALICE_DID, again, &provider).await else {
        panic!("should be NotFound");
    };
}

// After pruning, no index key in the store references a pruned message CID.
#[tokio::test]
async fn index_purge() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);

    let initial = WriteBuilder::new()
        .data(Data::from(b"watch the index".to_vec()))
        .build(&alice)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, initial.clone(), &provider).await.expect("should write");

    let update = WriteBuilder::from(initial.clone())
        .data(Data::from(b"update the index".to_vec()))
        .build(&alice)
        .await
        .expect("should create update");
    endpoint::handle(ALICE_DID, update.clone(), &provider).await.expect("should write");

    let update_cid = dwn_core::Message::cid(&update).expect("should compute CID");

    let delete = DeleteBuilder::new()
        .record_id(&initial.record_id)
        .build(&alice)
        .await
        .expect("should create delete");
    endpoint::handle(ALICE_DID, delete, &provider).await.expect("should delete");

    // iterate every index key: the pruned update must not be referenced
    let all = provider.range(ALICE_DID, "", "\u{7f}").await.expect("should scan");
    for (key, value) in all {
        assert_ne!(String::from_utf8_lossy(&value), update_cid, "residual key {key}");
    }
}
