//! Records Query

use dwn_core::records::{Data, QueryBuilder, RecordsFilter, WriteBuilder};
use dwn_core::store::{Pagination, Sort};
use dwn_core::{DateRange, endpoint};
use http::StatusCode;
use test_node::key_store::{self, ALICE_DID, BOB_DID};
use test_node::provider::ProviderImpl;

// A non-owner sees published records plus unpublished records they
// authored or received; nothing else.
#[tokio::test]
async fn non_owner_visibility() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);
    let bob = key_store::keyring(BOB_DID);

    // a published record, a private record, and a record addressed to Bob
    let published = WriteBuilder::new()
        .data(Data::from(b"published".to_vec()))
        .schema("https://example.com/note")
        .published(true)
        .build(&alice)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, published.clone(), &provider).await.expect("should write");

    let private = WriteBuilder::new()
        .data(Data::from(b"private".to_vec()))
        .schema("https://example.com/note")
        .build(&alice)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, private, &provider).await.expect("should write");

    let for_bob = WriteBuilder::new()
        .data(Data::from(b"for bob".to_vec()))
        .schema("https://example.com/note")
        .recipient(BOB_DID)
        .build(&alice)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, for_bob.clone(), &provider).await.expect("should write");

    // --------------------------------------------------
    // Bob's query returns the published record and his own.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().schema("https://example.com/note"))
        .build(&bob)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 2);

    let ids: Vec<&str> = entries.iter().map(|e| e.write.record_id.as_str()).collect();
    assert!(ids.contains(&published.record_id.as_str()));
    assert!(ids.contains(&for_bob.record_id.as_str()));

    // --------------------------------------------------
    // Alice's query returns all three.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().schema("https://example.com/note"))
        .build(&alice)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");
    let body = reply.body.expect("should have body");
    assert_eq!(body.entries.expect("should have entries").len(), 3);
}

// An anonymous query sees published records only.
#[tokio::test]
async fn anonymous_query() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);

    let published = WriteBuilder::new()
        .data(Data::from(b"published".to_vec()))
        .published(true)
        .build(&alice)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, published.clone(), &provider).await.expect("should write");

    let private = WriteBuilder::new()
        .data(Data::from(b"private".to_vec()))
        .build(&alice)
        .await
        .expect("should create write");
    endpoint::handle(ALICE_DID, private, &provider).await.expect("should write");

    let query = QueryBuilder::new()
        .filter(RecordsFilter::new())
        .authorize(false)
        .build(&alice)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");

    let body = reply.body.expect("should have body");
    let entries = body.entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.record_id, published.record_id);
}

// Query results sort ascending by creation date and paginate by cursor
// without overlap.
#[tokio::test]
async fn sorted_pagination() {
    let provider = ProviderImpl::new();
    let alice = key_store::keyring(ALICE_DID);

    let base = chrono::Utc::now() - chrono::Duration::days(30);
    for day in 0..8 {
        let created = base + chrono::Duration::days(day);
        let write = WriteBuilder::new()
            .data(Data::from(format!("entry {day}").into_bytes()))
            .schema("https://example.com/log")
            .message_timestamp(created)
            .date_created(created)
            .build(&alice)
            .await
            .expect("should create write");
        endpoint::handle(ALICE_DID, write, &provider).await.expect("should write");
    }

    let filter = RecordsFilter::new()
        .schema("https://example.com/log")
        .date_created(DateRange::new().from(base + chrono::Duration::days(3)));

    let query = QueryBuilder::new()
        .filter(filter.clone())
        .date_sort(Sort::CreatedAsc)
        .pagination(Pagination::new().limit(3))
        .build(&alice)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");

    let body = reply.body.expect("should have body");
    let page_one = body.entries.expect("should have entries");
    assert_eq!(page_one.len(), 3);
    let cursor = body.cursor.expect("should have cursor");

    // ascending order within the page
    let dates: Vec<_> =
        page_one.iter().map(|e| e.write.descriptor.date_created).collect();
    let mut sorted = dates.clone();
    sorted.sort();
    assert_eq!(dates, sorted);

    // the second page holds the remaining two, no overlap
    let query = QueryBuilder::new()
        .filter(filter)
        .date_sort(Sort::CreatedAsc)
        .pagination(Pagination::new().limit(10).cursor(cursor))
        .build(&alice)
        .await
        .expect("should create query");
    let reply = endpoint::handle(ALICE_DID, query, &provider).await.expect("should query");

    let body = reply.body.expect("should have body");
    let page_two = body.entries.expect("should have entries");
    assert_eq!(page_two.len(), 2);

    for entry in &page_two {
        assert!(!page_one.iter().any(|e| e.write.record_id == entry.write.record_id));
    }
}
