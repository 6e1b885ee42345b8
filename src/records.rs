//! # Records
//!
//! Record create/update, read, query, subscribe, and delete operations. A
//! record's current state is its latest `RecordsWrite` (or deleted when a
//! `RecordsDelete` is the latest state); competing writes reconcile under
//! `(message timestamp, message CID)` ordering.

mod delete;
mod encryption;
mod protocol;
mod query;
mod read;
mod subscribe;
pub(crate) mod write;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use self::delete::{Delete, DeleteBuilder, DeleteDescriptor, DeleteReply};
pub use self::encryption::{
    EncryptOptions, EncryptedKey, EncryptionProperty, KeyDerivationScheme, Recipient, decrypt,
};
pub use self::query::{Query, QueryBuilder, QueryDescriptor, QueryReply, QueryReplyEntry};
pub use self::read::{Read, ReadBuilder, ReadDescriptor, ReadReply, ReadReplyEntry};
pub use self::subscribe::{Subscribe, SubscribeBuilder, SubscribeDescriptor, SubscribeReply};
pub use self::write::{
    Data, Write, WriteBuilder, WriteDescriptor, WriteProtocol, WriteReply, entry_id,
};
pub use crate::data::DataStream;
use crate::error::Result;
use crate::provider::{BlockStore, KvStore};
use crate::store::{Entry, RecordsQueryBuilder};
use crate::{DateRange, OneOrMany, Range, store};

/// Records filter.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecordsFilter {
    /// Get a single record by its id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,

    /// Records written by the specified author(s).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<OneOrMany<String>>,

    /// Records attested by the specified DID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attester: Option<String>,

    /// Records addressed to the specified recipient(s).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<OneOrMany<String>>,

    /// Records within the specified context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// Records with the specified parent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Records of the specified protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Records at the specified protocol path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_path: Option<String>,

    /// Records with the specified schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Records with the specified MIME type, e.g. `application/json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_format: Option<String>,

    /// Records whose payload has the specified CID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_cid: Option<String>,

    /// Records whose payload size falls within the range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_size: Option<Range<u64>>,

    /// Published (or unpublished) records only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<bool>,

    /// Records created within the range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_created: Option<DateRange>,

    /// Records published within the range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_published: Option<DateRange>,
}

/// Implement builder-like behaviour.
impl RecordsFilter {
    /// Returns a new [`RecordsFilter`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize the filter's protocol and schema URLs.
    pub(crate) fn normalize(&self) -> Result<Self> {
        let mut filter = self.clone();
        filter.protocol = match &self.protocol {
            Some(protocol) => Some(crate::utils::clean_url(protocol)?),
            None => None,
        };
        filter.schema = match &self.schema {
            Some(schema) => Some(crate::utils::clean_url(schema)?),
            None => None,
        };
        Ok(filter)
    }

    /// Add a record id to the filter.
    #[must_use]
    pub fn record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// Add one or more authors to the filter.
    #[must_use]
    pub fn add_author(mut self, author: impl Into<String>) -> Self {
        match &mut self.author {
            Some(OneOrMany::Many(existing)) => {
                existing.push(author.into());
            }
            Some(OneOrMany::One(existing)) => {
                self.author = Some(OneOrMany::Many(vec![existing.clone(), author.into()]));
            }
            None => {
                self.author = Some(OneOrMany::One(author.into()));
            }
        }
        self
    }

    /// Add an attester to the filter.
    #[must_use]
    pub fn attester(mut self, attester: impl Into<String>) -> Self {
        self.attester = Some(attester.into());
        self
    }

    /// Add one or more recipients to the filter.
    #[must_use]
    pub fn add_recipient(mut self, recipient: impl Into<String>) -> Self {
        match &mut self.recipient {
            Some(OneOrMany::Many(existing)) => {
                existing.push(recipient.into());
            }
            Some(OneOrMany::One(existing)) => {
                self.recipient = Some(OneOrMany::Many(vec![existing.clone(), recipient.into()]));
            }
            None => {
                self.recipient = Some(OneOrMany::One(recipient.into()));
            }
        }
        self
    }

    /// Add a context id to the filter.
    #[must_use]
    pub fn context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Add a parent id to the filter.
    #[must_use]
    pub fn parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Add a protocol to the filter.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Add a protocol path to the filter.
    #[must_use]
    pub fn protocol_path(mut self, protocol_path: impl Into<String>) -> Self {
        self.protocol_path = Some(protocol_path.into());
        self
    }

    /// Add a schema to the filter.
    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Add a data format to the filter.
    #[must_use]
    pub fn data_format(mut self, data_format: impl Into<String>) -> Self {
        self.data_format = Some(data_format.into());
        self
    }

    /// Add a data CID to the filter.
    #[must_use]
    pub fn data_cid(mut self, data_cid: impl Into<String>) -> Self {
        self.data_cid = Some(data_cid.into());
        self
    }

    /// Add a data size range to the filter.
    #[must_use]
    pub const fn data_size(mut self, data_size: Range<u64>) -> Self {
        self.data_size = Some(data_size);
        self
    }

    /// Add a published flag to the filter.
    #[must_use]
    pub const fn published(mut self, published: bool) -> Self {
        self.published = Some(published);
        self
    }

    /// Add a date-created range to the filter.
    #[must_use]
    pub const fn date_created(mut self, date_created: DateRange) -> Self {
        self.date_created = Some(date_created);
        self
    }

    /// Add a date-published range to the filter.
    #[must_use]
    pub const fn date_published(mut self, date_published: DateRange) -> Self {
        self.date_published = Some(date_published);
        self
    }
}

/// Every message (write and delete, archived included) stored for a record,
/// ordered oldest to newest by `(message timestamp, message CID)`.
pub(crate) async fn existing_entries<S: BlockStore + KvStore>(
    owner: &str, record_id: &str, store_impl: &S,
) -> Result<Vec<Entry>> {
    let query = RecordsQueryBuilder::new()
        .method(None)
        .include_archived(true)
        .add_filter(RecordsFilter::new().record_id(record_id))
        .build();
    let (entries, _) = store::message::query(owner, &query, store_impl).await?;

    let mut keyed = BTreeMap::new();
    for entry in entries {
        let key =
            (entry.descriptor().message_timestamp.timestamp_micros(), entry.cid()?);
        keyed.insert(key, entry);
    }

    Ok(keyed.into_values().collect())
}

/// The initial (first) write of a record, if the record exists.
pub(crate) async fn initial_write<S: BlockStore + KvStore>(
    owner: &str, record_id: &str, store_impl: &S,
) -> Result<Option<Write>> {
    let entries = existing_entries(owner, record_id, store_impl).await?;
    for entry in entries {
        if let Some(write) = entry.as_write() {
            if write.is_initial()? {
                return Ok(Some(write.clone()));
            }
        }
    }
    Ok(None)
}
