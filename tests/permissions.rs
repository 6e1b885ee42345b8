//! Permissions Grant and Revoke

use chrono::Duration;
use dwn_core::permissions::{
    ConditionPublication, Conditions, GrantBuilder, RevokeBuilder, Scope,
};
use dwn_core::records::{Data, ReadBuilder, RecordsFilter, WriteBuilder};
use dwn_core::{Error, Interface, Message as _, Method, endpoint};
use http::StatusCode;
use test_node::key_store::{self, ALICE_DID, BOB_DID};
use test_node::provider::ProviderImpl;

// A grant holder writes within the grant's scope.
#[tokio::test]
async fn granted_write() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);
    let bob = key_store::keyring(BOB_DID);

    // --------------------------------------------------
    // Alice grants Bob permission to write notes.
    // --------------------------------------------------
    let grant = GrantBuilder::new()
        .granted_to(BOB_DID)
        .scope(Scope::new(Interface::Records, Method::Write).schema("https://example.com/note"))
        .build(&alice)
        .await
        .expect("should create grant");
    let reply = endpoint::handle(ALICE_DID, grant.clone(), &provider).await.expect("should grant");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let grant_id = grant.cid().expect("should compute grant CID");

    // --------------------------------------------------
    // Bob writes a note, invoking the grant.
    // --------------------------------------------------
    let write = WriteBuilder::new()
        .data(Data::from(b"bob's note".to_vec()))
        .schema("https://example.com/note")
        .permission_grant_id(&grant_id)
        .build(&bob)
        .await
        .expect("should create write");
    let reply = endpoint::handle(ALICE_DID, write, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // A write outside the granted schema is rejected.
    // --------------------------------------------------
    let write = WriteBuilder::new()
        .data(Data::from(b"off-scope".to_vec()))
        .schema("https://example.com/other")
        .permission_grant_id(&grant_id)
        .build(&bob)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(e)) = endpoint::handle(ALICE_DID, write, &provider).await else {
        panic!("should be Forbidden");
    };
    assert_eq!(e, "record schema does not match grant schema");
}

// Invoking a grant with the wrong method is rejected with a detail naming
// the mismatch.
#[tokio::test]
async fn method_mismatch() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);
    let bob = key_store::keyring(BOB_DID);

    let target = WriteBuilder::new()
        .data(Data::from(b"a record".to_vec()))
        .build(&alice)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, target.clone(), &provider).await.expect("should write");

    // a write-scoped grant
    let grant = GrantBuilder::new()
        .granted_to(BOB_DID)
        .scope(Scope::new(Interface::Records, Method::Write))
        .build(&alice)
        .await
        .expect("should create grant");
    endpoint::handle(ALICE_DID, grant.clone(), &provider).await.expect("should grant");

    // Bob invokes it for a read
    let read = ReadBuilder::new()
        .filter(RecordsFilter::new().record_id(&target.record_id))
        .permission_grant_id(grant.cid().expect("should compute grant CID"))
        .build(&bob)
        .await
        .expect("should create read");
    let Err(Error::Forbidden(e)) = endpoint::handle(ALICE_DID, read, &provider).await else {
        panic!("should be Forbidden");
    };
    assert_eq!(e, "method Read does not match grant scope method Write");
}

// A revoked grant no longer authorizes anything.
#[tokio::test]
async fn revoked_grant() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);
    let bob = key_store::keyring(BOB_DID);

    let grant = GrantBuilder::new()
        .granted_to(BOB_DID)
        .scope(Scope::new(Interface::Records, Method::Write))
        .build(&alice)
        .await
        .expect("should create grant");
    endpoint::handle(ALICE_DID, grant.clone(), &provider).await.expect("should grant");
    let grant_id = grant.cid().expect("should compute grant CID");

    // the grant works before revocation
    let write = WriteBuilder::new()
        .data(Data::from(b"while it lasts".to_vec()))
        .permission_grant_id(&grant_id)
        .build(&bob)
        .await
        .expect("should create write");
    let reply = endpoint::handle(ALICE_DID, write, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Alice revokes the grant.
    // --------------------------------------------------
    let revoke = RevokeBuilder::new()
        .permissions_grant_id(&grant_id)
        .build(&alice)
        .await
        .expect("should create revoke");
    let reply = endpoint::handle(ALICE_DID, revoke, &provider).await.expect("should revoke");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let write = WriteBuilder::new()
        .data(Data::from(b"too late".to_vec()))
        .permission_grant_id(&grant_id)
        .build(&bob)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(e)) = endpoint::handle(ALICE_DID, write, &provider).await else {
        panic!("should be Forbidden");
    };
    assert_eq!(e, "grant has been revoked");
}

// An expired grant no longer authorizes anything.
#[tokio::test]
async fn expired_grant() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);
    let bob = key_store::keyring(BOB_DID);

    let granted_at = chrono::Utc::now();
    let grant = GrantBuilder::new()
        .granted_to(BOB_DID)
        .scope(Scope::new(Interface::Records, Method::Write))
        .message_timestamp(granted_at)
        .date_expires(granted_at + Duration::minutes(5))
        .build(&alice)
        .await
        .expect("should create grant");
    endpoint::handle(ALICE_DID, grant.clone(), &provider).await.expect("should grant");

    // an invocation after expiry fails
    let late = granted_at + Duration::minutes(10);
    let write = WriteBuilder::new()
        .data(Data::from(b"after hours".to_vec()))
        .message_timestamp(late)
        .date_created(late)
        .permission_grant_id(grant.cid().expect("should compute grant CID"))
        .build(&bob)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(e)) = endpoint::handle(ALICE_DID, write, &provider).await else {
        panic!("should be Forbidden");
    };
    assert_eq!(e, "grant has expired");
}

// A grant's publication condition binds the writes made under it.
#[tokio::test]
async fn publication_condition() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);
    let bob = key_store::keyring(BOB_DID);

    let grant = GrantBuilder::new()
        .granted_to(BOB_DID)
        .scope(Scope::new(Interface::Records, Method::Write))
        .conditions(Conditions {
            publication: Some(ConditionPublication::Required),
        })
        .build(&alice)
        .await
        .expect("should create grant");
    endpoint::handle(ALICE_DID, grant.clone(), &provider).await.expect("should grant");
    let grant_id = grant.cid().expect("should compute grant CID");

    // unpublished write fails the condition
    let write = WriteBuilder::new()
        .data(Data::from(b"keeping it quiet".to_vec()))
        .permission_grant_id(&grant_id)
        .build(&bob)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(e)) = endpoint::handle(ALICE_DID, write, &provider).await else {
        panic!("should be Forbidden");
    };
    assert_eq!(e, "grant requires the record to be published");

    // published write passes
    let write = WriteBuilder::new()
        .data(Data::from(b"out loud".to_vec()))
        .published(true)
        .permission_grant_id(&grant_id)
        .build(&bob)
        .await
        .expect("should create write");
    let reply = endpoint::handle(ALICE_DID, write, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);
}

// Only the tenant may create grants, and only the grantor may revoke them.
#[tokio::test]
async fn grant_administration() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);
    let bob = key_store::keyring(BOB_DID);

    // Bob cannot grant on Alice's node
    let grant = GrantBuilder::new()
        .granted_to(ALICE_DID)
        .scope(Scope::new(Interface::Records, Method::Write))
        .build(&bob)
        .await
        .expect("should create grant");
    let Err(Error::Forbidden(_)) = endpoint::handle(ALICE_DID, grant, &provider).await else {
        panic!("should be Forbidden");
    };

    // Alice grants Bob; Bob cannot revoke
    let grant = GrantBuilder::new()
        .granted_to(BOB_DID)
        .scope(Scope::new(Interface::Records, Method::Write))
        .build(&alice)
        .await
        .expect("should create grant");
    endpoint::handle(ALICE_DID, grant.clone(), &provider).await.expect("should grant");

    let revoke = RevokeBuilder::new()
        .permissions_grant_id(grant.cid().expect("should compute grant CID"))
        .build(&bob)
        .await
        .expect("should create revoke");
    let Err(Error::Forbidden(_)) = endpoint::handle(ALICE_DID, revoke, &provider).await else {
        panic!("should be Forbidden");
    };
}
