//! Records Write

use std::io::Read as _;

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Duration;
use dwn_core::records::{Data, QueryBuilder, RecordsFilter, WriteBuilder, entry_id};
use dwn_core::{Error, endpoint};
use http::StatusCode;
use test_node::key_store::{self, ALICE_DID, BOB_DID};
use test_node::provider::ProviderImpl;

// Should be able to update an existing record when the update has a later
// `messageTimestamp`.
#[tokio::test]
async fn update_older() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);

    // --------------------------------------------------
    // Write a record.
    // --------------------------------------------------
    let data = b"a new write record";

    let initial = WriteBuilder::new()
        .data(Data::from(data.to_vec()))
        .build(&alice)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(ALICE_DID, initial.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Verify the record was created.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().record_id(&initial.record_id))
        .build(&alice)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.encoded_data, Some(Base64UrlUnpadded::encode_string(data)));

    // --------------------------------------------------
    // Update the existing record.
    // --------------------------------------------------
    let data = b"updated write record";

    let update = WriteBuilder::from(initial.clone())
        .data(Data::from(data.to_vec()))
        .build(&alice)
        .await
        .expect("should create update");
    let reply = endpoint::handle(ALICE_DID, update.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Attempt to overwrite the latest record with an older version.
    // --------------------------------------------------
    let Err(Error::Conflict(e)) = endpoint::handle(ALICE_DID, initial, &provider).await else {
        panic!("should be Conflict");
    };
    assert_eq!(e, "a more recent update exists");

    // --------------------------------------------------
    // Verify the latest update remains in place.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().record_id(&update.record_id))
        .build(&alice)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.encoded_data, Some(Base64UrlUnpadded::encode_string(data)));
}

// Should reconcile writes with identical timestamps in favour of the larger
// message CID, regardless of submission order.
#[tokio::test]
async fn tie_break_by_cid() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);

    let initial = WriteBuilder::new()
        .data(Data::from(b"a new write record".to_vec()))
        .build(&alice)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(ALICE_DID, initial.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Create 2 updates with the same `messageTimestamp`.
    // --------------------------------------------------
    let message_timestamp = initial.descriptor.base.message_timestamp + Duration::seconds(1);

    let update_1 = WriteBuilder::from(initial.clone())
        .data(Data::from(b"message 1".to_vec()))
        .message_timestamp(message_timestamp)
        .build(&alice)
        .await
        .expect("should create update");
    let update_2 = WriteBuilder::from(initial)
        .data(Data::from(b"message 2".to_vec()))
        .message_timestamp(message_timestamp)
        .build(&alice)
        .await
        .expect("should create update");

    let cid_1 = dwn_core::Message::cid(&update_1).expect("should compute CID");
    let cid_2 = dwn_core::Message::cid(&update_2).expect("should compute CID");
    assert_ne!(cid_1, cid_2);

    let (smaller, larger) =
        if cid_1 < cid_2 { (update_1, update_2) } else { (update_2, update_1) };

    // the smaller CID applies first, then loses to the larger
    let reply =
        endpoint::handle(ALICE_DID, smaller.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let reply = endpoint::handle(ALICE_DID, larger.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // resubmitting the smaller CID conflicts
    let Err(Error::Conflict(_)) = endpoint::handle(ALICE_DID, smaller, &provider).await else {
        panic!("should be Conflict");
    };

    // the larger CID is the record's state
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().record_id(&larger.record_id))
        .build(&alice)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);

    let mut stream = larger.data_stream.clone().expect("should have data");
    let mut winner = Vec::new();
    stream.read_to_end(&mut winner).expect("should read data");
    assert_eq!(entries[0].write.encoded_data, Some(Base64UrlUnpadded::encode_string(&winner)));
}

// Should reject an update that changes an immutable property.
#[tokio::test]
async fn immutable_properties() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);

    let initial = WriteBuilder::new()
        .data(Data::from(b"original".to_vec()))
        .schema("https://example.com/original")
        .build(&alice)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(ALICE_DID, initial.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // attempt to change the schema
    let update = WriteBuilder::from(initial)
        .data(Data::from(b"changed".to_vec()))
        .schema("https://example.com/changed")
        .build(&alice)
        .await
        .expect("should create update");

    let Err(Error::BadRequest(e)) = endpoint::handle(ALICE_DID, update, &provider).await else {
        panic!("should be BadRequest");
    };
    assert_eq!(e, "immutable property `schema` changed");
}

// Should reject a write from a non-owner with no grant and no protocol.
#[tokio::test]
async fn stranger_write() {
    let provider = ProviderImpl::new();
    let bob = key_store::keyring(BOB_DID);

    let write = WriteBuilder::new()
        .data(Data::from(b"uninvited".to_vec()))
        .build(&bob)
        .await
        .expect("should create write");

    let Err(Error::Forbidden(_)) = endpoint::handle(ALICE_DID, write, &provider).await else {
        panic!("should be Forbidden");
    };
}

// Should reject an initial write whose `dateCreated` and `messageTimestamp`
// disagree.
#[tokio::test]
async fn initial_write_timestamps() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);

    let timestamp = chrono::Utc::now();
    let write = WriteBuilder::new()
        .data(Data::from(b"skewed".to_vec()))
        .message_timestamp(timestamp)
        .date_created(timestamp - Duration::days(1))
        .build(&alice)
        .await
        .expect("should create write");

    let Err(Error::BadRequest(_)) = endpoint::handle(ALICE_DID, write, &provider).await else {
        panic!("should be BadRequest");
    };
}

// An attested write carries a verifiable single-attester commitment to the
// descriptor.
#[tokio::test]
async fn attested_write() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);
    let issuer = key_store::keyring(test_node::key_store::ISSUER_DID);

    let write = WriteBuilder::new()
        .data(Data::from(b"attested claim".to_vec()))
        .build_attested(&alice, Some(&issuer))
        .await
        .expect("should create write");
    assert_eq!(write.attester().as_deref(), Some(test_node::key_store::ISSUER_DID));

    let reply = endpoint::handle(ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // records are filterable by attester
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().attester(test_node::key_store::ISSUER_DID))
        .build(&alice)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.record_id, write.record_id);
}

// A record's id depends only on the initial descriptor and author, and is
// stable across re-computation.
#[tokio::test]
async fn record_id_deterministic() {
    let alice = key_store::keyring(ALICE_DID);

    let write = WriteBuilder::new()
        .data(Data::from(b"identity".to_vec()))
        .build(&alice)
        .await
        .expect("should create write");

    let id_1 = entry_id(&write.descriptor, ALICE_DID).expect("should compute entry id");
    let id_2 = entry_id(&write.descriptor, ALICE_DID).expect("should compute entry id");
    assert_eq!(id_1, id_2);
    assert_eq!(id_1, write.record_id);

    // a different author yields a different identity
    let id_bob = entry_id(&write.descriptor, BOB_DID).expect("should compute entry id");
    assert_ne!(id_1, id_bob);
}
