//! # Event Log
//!
//! An append-only, per-tenant log of committed message CIDs. Entries are
//! keyed by ULID so iteration follows append order. Retention is enforced
//! by the record handlers: superseded writes' events are deleted, keeping
//! the initial write and the latest state per record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

use crate::error::Result;
use crate::provider::KvStore;
use crate::store::{Cursor, Entry, block};

const SEP: char = '\u{0}';

#[derive(Deserialize, Serialize)]
struct LogEntry {
    message_cid: String,
    indexes: Map<String, Value>,
}

/// Append a message event to a tenant's event log.
pub async fn append(owner: &str, entry: &Entry, store: &impl KvStore) -> Result<()> {
    let message_cid = entry.cid()?;
    let ulid = Ulid::new().to_string();

    let log_entry = LogEntry {
        message_cid: message_cid.clone(),
        indexes: entry.indexes.clone(),
    };
    store.put(owner, &format!("LOG{SEP}{ulid}"), &block::encode(&log_entry)?).await?;
    store.put(owner, &format!("LOGCID{SEP}{message_cid}"), ulid.as_bytes()).await?;

    Ok(())
}

/// Retrieve a tenant's events that occurred after the cursor. With no
/// cursor, all events are returned. The cursor identifies a `message_cid`;
/// an unknown cursor yields no events.
pub async fn events(
    owner: &str, cursor: Option<&Cursor>, store: &impl KvStore,
) -> Result<(Vec<String>, Option<Cursor>)> {
    let prefix = format!("LOG{SEP}");
    let lower = if let Some(cursor) = cursor {
        let Some(bytes) =
            store.get(owner, &format!("LOGCID{SEP}{}", cursor.message_cid)).await?
        else {
            return Ok((vec![], None));
        };
        let ulid = String::from_utf8_lossy(&bytes).to_string();
        // start strictly after the cursor's entry
        format!("{prefix}{ulid}\u{1}")
    } else {
        prefix.clone()
    };
    let mut upper = "LOG".to_string();
    upper.push('\u{1}');

    let mut message_cids = vec![];
    for (_, value) in store.range(owner, &lower, &upper).await? {
        let log_entry: LogEntry = block::decode(&value)?;
        message_cids.push(log_entry.message_cid);
    }

    let cursor = message_cids.last().map(|last| Cursor {
        message_cid: last.clone(),
        value: None,
    });

    Ok((message_cids, cursor))
}

/// Delete the event for the specified message CID. A no-op when no event
/// exists.
pub async fn delete(owner: &str, message_cid: &str, store: &impl KvStore) -> Result<()> {
    let cid_key = format!("LOGCID{SEP}{message_cid}");
    let Some(bytes) = store.get(owner, &cid_key).await? else {
        return Ok(());
    };
    let ulid = String::from_utf8_lossy(&bytes).to_string();

    store.delete(owner, &format!("LOG{SEP}{ulid}")).await?;
    store.delete(owner, &cid_key).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use test_node::key_store::{self, ALICE_DID};
    use test_node::provider::ProviderImpl;

    use super::*;
    use crate::records::{Data, WriteBuilder};

    async fn entry(data: &[u8]) -> Entry {
        let alice = key_store::keyring(ALICE_DID);
        let write = WriteBuilder::new()
            .data(Data::from(data.to_vec()))
            .build(&alice)
            .await
            .expect("should create write");
        Entry::from(&write)
    }

    #[tokio::test]
    async fn append_order_and_cursor() {
        let provider = ProviderImpl::new();

        let first = entry(b"first").await;
        let second = entry(b"second").await;
        append(ALICE_DID, &first, &provider).await.unwrap();
        append(ALICE_DID, &second, &provider).await.unwrap();

        let (all, cursor) = events(ALICE_DID, None, &provider).await.unwrap();
        assert_eq!(all, vec![first.cid().unwrap(), second.cid().unwrap()]);
        let cursor = cursor.expect("should have cursor");

        // resuming from the cursor yields nothing new
        let (rest, _) = events(ALICE_DID, Some(&cursor), &provider).await.unwrap();
        assert!(rest.is_empty());

        // resuming from the first event yields the second
        let first_cursor = Cursor {
            message_cid: first.cid().unwrap(),
            value: None,
        };
        let (rest, _) = events(ALICE_DID, Some(&first_cursor), &provider).await.unwrap();
        assert_eq!(rest, vec![second.cid().unwrap()]);
    }

    #[tokio::test]
    async fn delete_removes_event() {
        let provider = ProviderImpl::new();

        let retained = entry(b"retained").await;
        let pruned = entry(b"pruned").await;
        append(ALICE_DID, &retained, &provider).await.unwrap();
        append(ALICE_DID, &pruned, &provider).await.unwrap();

        delete(ALICE_DID, &pruned.cid().unwrap(), &provider).await.unwrap();

        let (all, _) = events(ALICE_DID, None, &provider).await.unwrap();
        assert_eq!(all, vec![retained.cid().unwrap()]);

        // deleting a missing event is a no-op
        delete(ALICE_DID, &pruned.cid().unwrap(), &provider).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_cursor_yields_nothing() {
        let provider = ProviderImpl::new();
        append(ALICE_DID, &entry(b"only").await, &provider).await.unwrap();

        let cursor = Cursor {
            message_cid: "baguqeera000000".to_string(),
            value: None,
        };
        let (all, _) = events(ALICE_DID, Some(&cursor), &provider).await.unwrap();
        assert!(all.is_empty());
    }
}
