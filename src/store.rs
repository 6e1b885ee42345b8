//! # Store
//!
//! Message persistence: entries, secondary indexes, the range-query engine,
//! data blocks, and the event log. Built over the host-provided
//! [`crate::provider::BlockStore`] and [`crate::provider::KvStore`].

pub(crate) mod block;
pub(crate) mod data;
pub(crate) mod event_log;
pub(crate) mod index;
pub(crate) mod message;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::endpoint::Message as _;
use crate::error::Result;
use crate::records::RecordsFilter;
use crate::{Descriptor, Interface, Lower, Method, Range, Upper, permissions, protocols, records};

/// A stored message together with the property values it is indexed on.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Entry {
    /// The message.
    pub message: EntryType,

    /// Indexable property values, flattened.
    #[serde(default)]
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub indexes: Map<String, Value>,
}

impl Entry {
    /// The CID of the stored message.
    ///
    /// # Errors
    ///
    /// Returns an error when the message cannot be encoded.
    pub fn cid(&self) -> Result<String> {
        match &self.message {
            EntryType::Write(write) => write.cid(),
            EntryType::Delete(delete) => crate::cid::from_value(delete),
            EntryType::Configure(configure) => crate::cid::from_value(configure),
            EntryType::Grant(grant) => crate::cid::from_value(grant),
            EntryType::Revoke(revoke) => crate::cid::from_value(revoke),
        }
    }

    /// The message's base descriptor.
    #[must_use]
    pub const fn descriptor(&self) -> &Descriptor {
        match &self.message {
            EntryType::Write(write) => &write.descriptor.base,
            EntryType::Delete(delete) => &delete.descriptor.base,
            EntryType::Configure(configure) => &configure.descriptor.base,
            EntryType::Grant(grant) => &grant.descriptor.base,
            EntryType::Revoke(revoke) => &revoke.descriptor.base,
        }
    }

    /// The entry as a `RecordsWrite` message, if it is one.
    #[must_use]
    pub const fn as_write(&self) -> Option<&records::Write> {
        match &self.message {
            EntryType::Write(write) => Some(write),
            _ => None,
        }
    }

    /// The entry as a `RecordsDelete` message, if it is one.
    #[must_use]
    pub const fn as_delete(&self) -> Option<&records::Delete> {
        match &self.message {
            EntryType::Delete(delete) => Some(delete),
            _ => None,
        }
    }

    /// The entry as a `ProtocolsConfigure` message, if it is one.
    #[must_use]
    pub const fn as_configure(&self) -> Option<&protocols::Configure> {
        match &self.message {
            EntryType::Configure(configure) => Some(configure),
            _ => None,
        }
    }

    /// The entry as a `PermissionsGrant` message, if it is one.
    #[must_use]
    pub const fn as_grant(&self) -> Option<&permissions::Grant> {
        match &self.message {
            EntryType::Grant(grant) => Some(grant),
            _ => None,
        }
    }

    /// The entry as a `PermissionsRevoke` message, if it is one.
    #[must_use]
    pub const fn as_revoke(&self) -> Option<&permissions::Revoke> {
        match &self.message {
            EntryType::Revoke(revoke) => Some(revoke),
            _ => None,
        }
    }

    /// Add (or replace) an index property.
    pub fn add_index(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.indexes.insert(key.into(), value.into());
    }
}

/// The type of message stored in an [`Entry`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum EntryType {
    /// A `RecordsWrite` message.
    Write(records::Write),

    /// A `ProtocolsConfigure` message.
    Configure(protocols::Configure),

    /// A `PermissionsGrant` message.
    Grant(permissions::Grant),

    /// A `PermissionsRevoke` message.
    Revoke(permissions::Revoke),

    /// A `RecordsDelete` message.
    Delete(records::Delete),
}

impl From<&records::Write> for Entry {
    fn from(write: &records::Write) -> Self {
        Self {
            message: EntryType::Write(write.clone()),
            indexes: write.build_indexes(),
        }
    }
}

impl From<&records::Delete> for Entry {
    fn from(delete: &records::Delete) -> Self {
        Self {
            message: EntryType::Delete(delete.clone()),
            indexes: delete.build_indexes(),
        }
    }
}

impl From<&protocols::Configure> for Entry {
    fn from(configure: &protocols::Configure) -> Self {
        Self {
            message: EntryType::Configure(configure.clone()),
            indexes: configure.build_indexes(),
        }
    }
}

impl From<&permissions::Grant> for Entry {
    fn from(grant: &permissions::Grant) -> Self {
        Self {
            message: EntryType::Grant(grant.clone()),
            indexes: grant.build_indexes(),
        }
    }
}

impl From<&permissions::Revoke> for Entry {
    fn from(revoke: &permissions::Revoke) -> Self {
        Self {
            message: EntryType::Revoke(revoke.clone()),
            indexes: revoke.build_indexes(),
        }
    }
}

/// A store query: a disjunction of conjunctive filters plus sort and
/// pagination settings. Results match when any one filter's criteria all
/// hold.
#[derive(Clone, Debug, Default)]
pub struct Query {
    /// The filters; results are the union of each filter's matches.
    pub filters: Vec<Filter>,

    /// Sort property and direction.
    pub sort: Sort,

    /// Pagination settings.
    pub pagination: Option<Pagination>,
}

/// A conjunction of per-property match criteria.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    /// Criteria keyed by index property.
    pub criteria: BTreeMap<String, Matcher>,
}

impl Filter {
    /// Create an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a criterion for `property`.
    #[must_use]
    pub fn add(mut self, property: impl Into<String>, matcher: Matcher) -> Self {
        self.criteria.insert(property.into(), matcher);
        self
    }

    /// Check every criterion against a set of index values.
    #[must_use]
    pub fn is_match(&self, indexes: &Map<String, Value>) -> bool {
        self.criteria.iter().all(|(property, matcher)| {
            indexes.get(property).is_some_and(|value| matcher.is_match(value))
        })
    }
}

/// A single match criterion.
#[derive(Clone, Debug)]
pub enum Matcher {
    /// The property must equal the value exactly.
    Equal(Value),

    /// The property must equal one of the values.
    OneOf(Vec<Value>),

    /// The property must fall within the range. Comparison uses the index's
    /// order-preserving encoding.
    Range(Range<Value>),
}

impl Matcher {
    /// Check the criterion against an index value.
    #[must_use]
    pub fn is_match(&self, value: &Value) -> bool {
        match self {
            Self::Equal(expected) => index::values_equal(expected, value),
            Self::OneOf(candidates) => candidates.iter().any(|c| index::values_equal(c, value)),
            Self::Range(range) => {
                let encoded = index::encode_value(value);
                let lower_ok = match &range.lower {
                    Some(Lower::Inclusive(lower)) => encoded >= index::encode_value(lower),
                    Some(Lower::Exclusive(lower)) => encoded > index::encode_value(lower),
                    None => true,
                };
                let upper_ok = match &range.upper {
                    Some(Upper::Inclusive(upper)) => encoded <= index::encode_value(upper),
                    Some(Upper::Exclusive(upper)) => encoded < index::encode_value(upper),
                    None => true,
                };
                lower_ok && upper_ok
            }
        }
    }
}

/// Sort property and direction for query results.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum Sort {
    /// Sort `dateCreated` from oldest to newest.
    #[serde(rename = "createdAscending")]
    CreatedAsc,

    /// Sort `dateCreated` newest to oldest.
    #[serde(rename = "createdDescending")]
    CreatedDesc,

    /// Sort `datePublished` from oldest to newest.
    #[serde(rename = "publishedAscending")]
    PublishedAsc,

    /// Sort `datePublished` from newest to oldest.
    #[serde(rename = "publishedDescending")]
    PublishedDesc,

    /// Sort `messageTimestamp` from oldest to newest.
    #[serde(rename = "timestampAscending")]
    #[default]
    TimestampAsc,

    /// Sort `messageTimestamp` from newest to oldest.
    #[serde(rename = "timestampDescending")]
    TimestampDesc,
}

impl Sort {
    /// The index property sorted on.
    #[must_use]
    pub const fn property(&self) -> &'static str {
        match self {
            Self::CreatedAsc | Self::CreatedDesc => "dateCreated",
            Self::PublishedAsc | Self::PublishedDesc => "datePublished",
            Self::TimestampAsc | Self::TimestampDesc => "messageTimestamp",
        }
    }

    /// Whether the sort is ascending.
    #[must_use]
    pub const fn is_ascending(&self) -> bool {
        matches!(self, Self::CreatedAsc | Self::PublishedAsc | Self::TimestampAsc)
    }
}

/// A pagination cursor: the sort value and message CID of the last entry of
/// the previous page.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    /// The message CID of the last returned entry.
    pub message_cid: String,

    /// The sort property value of the last returned entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Pagination settings for a query.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    /// The maximum number of entries to return.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// Resume after the entry identified by the cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

impl Pagination {
    /// Create an empty pagination setting.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the page size.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the cursor to resume after.
    #[must_use]
    pub fn cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

/// Builds a [`Query`] over records from one or more [`RecordsFilter`]s.
#[derive(Clone, Debug)]
pub struct RecordsQueryBuilder {
    filters: Vec<RecordsFilter>,
    method: Option<Method>,
    include_archived: bool,
    sort: Sort,
    pagination: Option<Pagination>,
}

impl Default for RecordsQueryBuilder {
    fn default() -> Self {
        Self {
            filters: vec![],
            method: Some(Method::Write),
            include_archived: false,
            sort: Sort::default(),
            pagination: None,
        }
    }
}

impl RecordsQueryBuilder {
    /// Returns a new [`RecordsQueryBuilder`]. By default only active (not
    /// archived) `RecordsWrite` entries match.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter; each added filter widens the result set.
    #[must_use]
    pub fn add_filter(mut self, filter: RecordsFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Restrict matches to the given method. `None` matches any record
    /// message (write or delete).
    #[must_use]
    pub fn method(mut self, method: Option<Method>) -> Self {
        self.method = method;
        self
    }

    /// Include archived (superseded initial write) entries.
    #[must_use]
    pub const fn include_archived(mut self, include_archived: bool) -> Self {
        self.include_archived = include_archived;
        self
    }

    /// Set the sort property and direction.
    #[must_use]
    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    /// Set pagination settings.
    #[must_use]
    pub fn pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = Some(pagination);
        self
    }

    /// Lower to a store [`Query`].
    #[must_use]
    pub fn build(self) -> Query {
        let mut filters = vec![];
        for filter in &self.filters {
            filters.push(lower_filter(filter, self.method.as_ref(), self.include_archived));
        }
        if filters.is_empty() {
            filters.push(lower_filter(
                &RecordsFilter::default(),
                self.method.as_ref(),
                self.include_archived,
            ));
        }

        Query {
            filters,
            sort: self.sort,
            pagination: self.pagination,
        }
    }
}

#[allow(clippy::too_many_lines)]
fn lower_filter(
    filter: &RecordsFilter, method: Option<&Method>, include_archived: bool,
) -> Filter {
    let mut lowered =
        Filter::new().add("interface", Matcher::Equal(Value::String(Interface::Records.to_string())));

    if let Some(method) = method {
        lowered = lowered.add("method", Matcher::Equal(Value::String(method.to_string())));
    }
    if !include_archived {
        lowered = lowered.add("archived", Matcher::Equal(Value::Bool(false)));
    }

    if let Some(record_id) = &filter.record_id {
        lowered = lowered.add("recordId", Matcher::Equal(Value::String(record_id.clone())));
    }
    if let Some(author) = &filter.author {
        let authors = author.to_vec().into_iter().map(Value::String).collect();
        lowered = lowered.add("author", Matcher::OneOf(authors));
    }
    if let Some(attester) = &filter.attester {
        lowered = lowered.add("attester", Matcher::Equal(Value::String(attester.clone())));
    }
    if let Some(recipient) = &filter.recipient {
        let recipients = recipient.to_vec().into_iter().map(Value::String).collect();
        lowered = lowered.add("recipient", Matcher::OneOf(recipients));
    }
    if let Some(context_id) = &filter.context_id {
        lowered = lowered.add("contextId", Matcher::Equal(Value::String(context_id.clone())));
    }
    if let Some(parent_id) = &filter.parent_id {
        lowered = lowered.add("parentId", Matcher::Equal(Value::String(parent_id.clone())));
    }
    if let Some(protocol) = &filter.protocol {
        lowered = lowered.add("protocol", Matcher::Equal(Value::String(protocol.clone())));
    }
    if let Some(protocol_path) = &filter.protocol_path {
        lowered =
            lowered.add("protocolPath", Matcher::Equal(Value::String(protocol_path.clone())));
    }
    if let Some(schema) = &filter.schema {
        lowered = lowered.add("schema", Matcher::Equal(Value::String(schema.clone())));
    }
    if let Some(data_format) = &filter.data_format {
        lowered = lowered.add("dataFormat", Matcher::Equal(Value::String(data_format.clone())));
    }
    if let Some(data_cid) = &filter.data_cid {
        lowered = lowered.add("dataCid", Matcher::Equal(Value::String(data_cid.clone())));
    }
    if let Some(data_size) = &filter.data_size {
        let lower = data_size.lower.as_ref().map(|lower| match lower {
            Lower::Inclusive(val) => Lower::Inclusive(Value::from(*val)),
            Lower::Exclusive(val) => Lower::Exclusive(Value::from(*val)),
        });
        let upper = data_size.upper.as_ref().map(|upper| match upper {
            Upper::Inclusive(val) => Upper::Inclusive(Value::from(*val)),
            Upper::Exclusive(val) => Upper::Exclusive(Value::from(*val)),
        });
        lowered = lowered.add("dataSize", Matcher::Range(Range { lower, upper }));
    }
    if let Some(published) = filter.published {
        lowered = lowered.add("published", Matcher::Equal(Value::Bool(published)));
    }
    if let Some(date_created) = &filter.date_created {
        lowered = lowered.add("dateCreated", Matcher::Range(date_range_to_range(date_created)));
    }
    if let Some(date_published) = &filter.date_published {
        lowered =
            lowered.add("datePublished", Matcher::Range(date_range_to_range(date_published)));
    }

    lowered
}

fn date_range_to_range(range: &crate::DateRange) -> Range<Value> {
    use chrono::SecondsFormat::Micros;

    let mut lowered = Range::default();
    if let Some(lower) = &range.lower {
        lowered.lower =
            Some(Lower::Inclusive(Value::String(lower.to_rfc3339_opts(Micros, true))));
    }
    if let Some(upper) = &range.upper {
        lowered.upper =
            Some(Upper::Inclusive(Value::String(upper.to_rfc3339_opts(Micros, true))));
    }
    lowered
}

/// Builds a [`Query`] over installed protocol configurations.
#[derive(Clone, Debug, Default)]
pub struct ProtocolsQueryBuilder {
    protocol: Option<String>,
    published: Option<bool>,
}

impl ProtocolsQueryBuilder {
    /// Returns a new [`ProtocolsQueryBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict matches to the given protocol URI.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Restrict matches by the definition's `published` flag.
    #[must_use]
    pub const fn published(mut self, published: bool) -> Self {
        self.published = Some(published);
        self
    }

    /// Lower to a store [`Query`].
    #[must_use]
    pub fn build(self) -> Query {
        let mut filter = Filter::new()
            .add("interface", Matcher::Equal(Value::String(Interface::Protocols.to_string())))
            .add("method", Matcher::Equal(Value::String(Method::Configure.to_string())));

        if let Some(protocol) = self.protocol {
            filter = filter.add("protocol", Matcher::Equal(Value::String(protocol)));
        }
        if let Some(published) = self.published {
            filter = filter.add("published", Matcher::Equal(Value::Bool(published)));
        }

        Query {
            filters: vec![filter],
            sort: Sort::TimestampAsc,
            pagination: None,
        }
    }
}

