//! # Message Store
//!
//! Persists messages as content-addressed blocks keyed by message CID and
//! maintains their secondary index keys. Mutations are ordered so that no
//! index key ever references a missing block: blocks are written before
//! index keys and removed after them.

use serde_json::{Map, Value};

use crate::bad_request;
use crate::error::Result;
use crate::provider::{BlockStore, KvStore};
use crate::store::{Cursor, Entry, Query, block, index};

/// Store a message entry and update its secondary index keys. Re-putting an
/// entry with changed indexes replaces its keys.
///
/// # Errors
///
/// Returns `Error::BadRequest` when the entry carries no index properties.
pub async fn put<S: BlockStore + KvStore>(owner: &str, entry: &Entry, store: &S) -> Result<()> {
    if entry.indexes.is_empty() {
        return Err(bad_request!("entry has no index properties"));
    }

    let message_cid = entry.cid()?;
    let encoded = block::encode(entry)?;

    BlockStore::put(store, owner, &message_cid, &encoded).await?;
    index::insert(owner, &message_cid, &entry.indexes, store).await?;

    tracing::debug!(owner, %message_cid, "stored message");
    Ok(())
}

/// Fetch a single message by CID, returning `None` if no message was found.
pub async fn get<S: BlockStore>(
    owner: &str, message_cid: &str, store: &S,
) -> Result<Option<Entry>> {
    let Some(bytes) = BlockStore::get(store, owner, message_cid).await? else {
        return Ok(None);
    };
    Ok(Some(block::decode(&bytes)?))
}

/// Delete a message and all of its index keys.
pub async fn delete<S: BlockStore + KvStore>(
    owner: &str, message_cid: &str, store: &S,
) -> Result<()> {
    index::delete(owner, message_cid, store).await?;
    BlockStore::delete(store, owner, message_cid).await?;

    tracing::debug!(owner, message_cid, "deleted message");
    Ok(())
}

/// Query for matching messages, returning them in sort order together with
/// a cursor when the result set was truncated.
pub async fn query<S: BlockStore + KvStore>(
    owner: &str, query: &Query, store: &S,
) -> Result<(Vec<Entry>, Option<Cursor>)> {
    let (matches, cursor) = index::query(owner, query, store).await?;

    let mut entries = vec![];
    for (message_cid, _) in matches {
        if let Some(entry) = get(owner, &message_cid, store).await? {
            entries.push(entry);
        }
    }

    Ok((entries, cursor))
}

/// The index values a query would sort and match on, without fetching
/// message bodies.
pub async fn query_indexes<S: KvStore>(
    owner: &str, query: &Query, store: &S,
) -> Result<Vec<(String, Map<String, Value>)>> {
    let (matches, _) = index::query(owner, query, store).await?;
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;
    use test_node::key_store::{self, ALICE_DID};
    use test_node::provider::ProviderImpl;

    use super::*;
    use crate::records::{Data, RecordsFilter, WriteBuilder};
    use crate::store::{Filter, Matcher, Pagination, RecordsQueryBuilder, Sort};
    use crate::{DateRange, Lower, Range, Upper};

    async fn stored_write(provider: &ProviderImpl, data: &[u8]) -> Entry {
        let alice = key_store::keyring(ALICE_DID);
        let write = WriteBuilder::new()
            .data(Data::from(data.to_vec()))
            .build(&alice)
            .await
            .expect("should create write");
        let entry = Entry::from(&write);
        put(ALICE_DID, &entry, provider).await.expect("should store entry");
        entry
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let provider = ProviderImpl::new();
        let entry = stored_write(&provider, b"round trip").await;
        let message_cid = entry.cid().unwrap();

        let fetched = get(ALICE_DID, &message_cid, &provider).await.unwrap().unwrap();
        assert_eq!(fetched.cid().unwrap(), message_cid);
        assert_eq!(fetched.indexes, entry.indexes);
    }

    #[tokio::test]
    async fn missing_indexes_rejected() {
        let provider = ProviderImpl::new();
        let alice = key_store::keyring(ALICE_DID);
        let write = WriteBuilder::new()
            .data(Data::from(b"no indexes".to_vec()))
            .build(&alice)
            .await
            .unwrap();

        let entry = Entry {
            message: crate::store::EntryType::Write(write),
            indexes: Map::new(),
        };
        let result = put(ALICE_DID, &entry, &provider).await;
        assert!(matches!(result, Err(crate::Error::BadRequest(_))));
    }

    #[tokio::test]
    async fn delete_purges_every_index_key() {
        let provider = ProviderImpl::new();
        let entry = stored_write(&provider, b"purge me").await;
        let keep = stored_write(&provider, b"keep me").await;
        let message_cid = entry.cid().unwrap();

        delete(ALICE_DID, &message_cid, &provider).await.unwrap();
        assert!(get(ALICE_DID, &message_cid, &provider).await.unwrap().is_none());

        // no residual index key may reference the deleted CID
        let all = KvStore::range(&provider, ALICE_DID, "", "\u{7f}").await.unwrap();
        for (key, value) in all {
            assert_ne!(String::from_utf8_lossy(&value), message_cid, "residual key {key}");
        }

        // the other message remains queryable
        let query = RecordsQueryBuilder::new().build();
        let (entries, _) = super::query(ALICE_DID, &query, &provider).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cid().unwrap(), keep.cid().unwrap());
    }

    #[tokio::test]
    async fn equality_does_not_match_prefix() {
        let provider = ProviderImpl::new();
        let alice = key_store::keyring(ALICE_DID);

        for schema in ["https://example.com/foo", "https://example.com/foobar"] {
            let write = WriteBuilder::new()
                .data(Data::from(schema.as_bytes().to_vec()))
                .schema(schema)
                .build(&alice)
                .await
                .unwrap();
            put(ALICE_DID, &Entry::from(&write), &provider).await.unwrap();
        }

        let query = RecordsQueryBuilder::new()
            .add_filter(RecordsFilter::new().schema("https://example.com/foo"))
            .build();
        let (entries, _) = super::query(ALICE_DID, &query, &provider).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].as_write().unwrap().descriptor.schema.as_deref(),
            Some("https://example.com/foo")
        );
    }

    #[tokio::test]
    async fn or_filter_returns_union() {
        let provider = ProviderImpl::new();
        let alice = key_store::keyring(ALICE_DID);

        let mut cids = vec![];
        for format in ["image/jpeg", "image/png", "text/plain"] {
            let write = WriteBuilder::new()
                .data(Data::from(format.as_bytes().to_vec()))
                .data_format(format)
                .build(&alice)
                .await
                .unwrap();
            let entry = Entry::from(&write);
            put(ALICE_DID, &entry, &provider).await.unwrap();
            cids.push(entry.cid().unwrap());
        }

        let query = RecordsQueryBuilder::new()
            .add_filter(RecordsFilter::new().data_format("image/jpeg"))
            .add_filter(RecordsFilter::new().data_format("image/png"))
            .build();
        let (entries, _) = super::query(ALICE_DID, &query, &provider).await.unwrap();
        assert_eq!(entries.len(), 2);

        let found: Vec<String> = entries.iter().map(|e| e.cid().unwrap()).collect();
        assert!(found.contains(&cids[0]));
        assert!(found.contains(&cids[1]));
        assert!(!found.contains(&cids[2]));
    }

    #[tokio::test]
    async fn range_bounds_inclusive_and_strict() {
        let provider = ProviderImpl::new();
        let alice = key_store::keyring(ALICE_DID);

        for size in [10u64, 20, 30, 40] {
            let write = WriteBuilder::new()
                .data(Data::from(vec![0u8; size as usize]))
                .build(&alice)
                .await
                .unwrap();
            put(ALICE_DID, &Entry::from(&write), &provider).await.unwrap();
        }

        // gte 20, lte 30: inclusive bounds
        let query = RecordsQueryBuilder::new()
            .add_filter(RecordsFilter::new().data_size(Range::new().ge(20u64).le(30u64)))
            .build();
        let (entries, _) = super::query(ALICE_DID, &query, &provider).await.unwrap();
        assert_eq!(entries.len(), 2);

        // gt 20, lt 30: strict bounds
        let query = RecordsQueryBuilder::new()
            .add_filter(RecordsFilter::new().data_size(Range::new().gt(20u64).lt(30u64)))
            .build();
        let (entries, _) = super::query(ALICE_DID, &query, &provider).await.unwrap();
        assert!(entries.is_empty());

        // gt 20 alone
        let query = RecordsQueryBuilder::new()
            .add_filter(RecordsFilter::new().data_size(Range::new().gt(20u64)))
            .build();
        let (entries, _) = super::query(ALICE_DID, &query, &provider).await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn boolean_distinct_from_string() {
        let provider = ProviderImpl::new();

        let mut flagged = stored_write(&provider, b"boolean flag").await;
        flagged.add_index("flag", true);
        put(ALICE_DID, &flagged, &provider).await.unwrap();

        let mut spelled = stored_write(&provider, b"string flag").await;
        spelled.add_index("flag", "true");
        put(ALICE_DID, &spelled, &provider).await.unwrap();

        let query = Query {
            filters: vec![Filter::new().add("flag", Matcher::Equal(json!(true)))],
            sort: Sort::default(),
            pagination: None,
        };
        let (matches, _) = index::query(ALICE_DID, &query, &provider).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0, flagged.cid().unwrap());
    }

    #[tokio::test]
    async fn sort_and_cursor_pagination() {
        let provider = ProviderImpl::new();
        let alice = key_store::keyring(ALICE_DID);

        // records created 2023-01-10 .. 2023-01-19
        for day in 10..20 {
            let created = chrono::Utc.with_ymd_and_hms(2023, 1, day, 0, 0, 0).unwrap();
            let write = WriteBuilder::new()
                .data(Data::from(format!("day {day}").into_bytes()))
                .message_timestamp(created)
                .date_created(created)
                .build(&alice)
                .await
                .unwrap();
            put(ALICE_DID, &Entry::from(&write), &provider).await.unwrap();
        }

        // five records created on or after the 15th, ascending
        let query = RecordsQueryBuilder::new()
            .add_filter(RecordsFilter::new().date_created(
                DateRange::new().from(chrono::Utc.with_ymd_and_hms(2023, 1, 15, 0, 0, 0).unwrap()),
            ))
            .sort(Sort::CreatedAsc)
            .build();
        let (entries, _) = super::query(ALICE_DID, &query, &provider).await.unwrap();
        assert_eq!(entries.len(), 5);

        let days: Vec<u32> = entries
            .iter()
            .map(|e| {
                use chrono::Datelike;
                e.as_write().unwrap().descriptor.date_created.day()
            })
            .collect();
        assert_eq!(days, vec![15, 16, 17, 18, 19]);

        // a cursor at the last returned entry yields the empty set
        let last = entries.last().unwrap();
        let cursor = Cursor {
            message_cid: last.cid().unwrap(),
            value: last.indexes.get("dateCreated").cloned(),
        };
        let query = RecordsQueryBuilder::new()
            .add_filter(RecordsFilter::new().date_created(
                DateRange::new().from(chrono::Utc.with_ymd_and_hms(2023, 1, 15, 0, 0, 0).unwrap()),
            ))
            .sort(Sort::CreatedAsc)
            .pagination(Pagination::new().limit(5).cursor(cursor))
            .build();
        let (entries, _) = super::query(ALICE_DID, &query, &provider).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn limit_truncates_and_returns_cursor() {
        let provider = ProviderImpl::new();
        let alice = key_store::keyring(ALICE_DID);

        for i in 0..5u8 {
            let write = WriteBuilder::new()
                .data(Data::from(vec![i]))
                .build(&alice)
                .await
                .unwrap();
            put(ALICE_DID, &Entry::from(&write), &provider).await.unwrap();
        }

        let query = RecordsQueryBuilder::new()
            .pagination(Pagination::new().limit(2))
            .build();
        let (page_one, cursor) = super::query(ALICE_DID, &query, &provider).await.unwrap();
        assert_eq!(page_one.len(), 2);
        let cursor = cursor.expect("should have a cursor");

        let query = RecordsQueryBuilder::new()
            .pagination(Pagination::new().limit(10).cursor(cursor))
            .build();
        let (page_two, cursor) = super::query(ALICE_DID, &query, &provider).await.unwrap();
        assert_eq!(page_two.len(), 3);
        assert!(cursor.is_none());

        // no overlap between pages
        for entry in &page_two {
            let cid = entry.cid().unwrap();
            assert!(!page_one.iter().any(|e| e.cid().unwrap() == cid));
        }
    }

    #[tokio::test]
    async fn invalid_cursor_yields_empty_set() {
        let provider = ProviderImpl::new();
        stored_write(&provider, b"cursor target").await;

        let cursor = Cursor {
            message_cid: "baguqeera000000".to_string(),
            value: None,
        };
        let query = RecordsQueryBuilder::new()
            .pagination(Pagination::new().cursor(cursor))
            .build();
        let (entries, _) = super::query(ALICE_DID, &query, &provider).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn range_lower_unbounded() {
        let provider = ProviderImpl::new();
        let alice = key_store::keyring(ALICE_DID);

        for size in [5u64, 50] {
            let write = WriteBuilder::new()
                .data(Data::from(vec![1u8; size as usize]))
                .build(&alice)
                .await
                .unwrap();
            put(ALICE_DID, &Entry::from(&write), &provider).await.unwrap();
        }

        let query = RecordsQueryBuilder::new()
            .add_filter(RecordsFilter::new().data_size(Range {
                lower: None,
                upper: Some(Upper::Exclusive(50u64)),
            }))
            .build();
        let (entries, _) = super::query(ALICE_DID, &query, &provider).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].as_write().unwrap().descriptor.data_size, 5);

        let query = RecordsQueryBuilder::new()
            .add_filter(RecordsFilter::new().data_size(Range {
                lower: Some(Lower::Inclusive(5u64)),
                upper: None,
            }))
            .build();
        let (entries, _) = super::query(ALICE_DID, &query, &provider).await.unwrap();
        assert_eq!(entries.len(), 2);
    }
}
