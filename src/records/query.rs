//! # Records Query
//!
//! The records query endpoint handles `RecordsQuery` messages — requests to
//! query the store for matching records. Non-owner callers see the union of
//! published records and unpublished records they authored or received.

use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::error::Result;
use crate::provider::{Provider, Signer};
use crate::records::{RecordsFilter, Write};
use crate::store::{Cursor, Pagination, RecordsQueryBuilder, Sort};
use crate::{Descriptor, Interface, Method, bad_request, cid, forbidden, permissions, records,
    store};

/// Handle — or process — a [`Query`] message.
///
/// # Errors
///
/// The endpoint will return an error when an invoked grant fails
/// verification or the underlying store fails.
pub async fn handle(
    owner: &str, query: Query, provider: &impl Provider,
) -> Result<Reply<QueryReply>> {
    query.validate()?;

    let filter = query.descriptor.filter.normalize()?;
    let mut builder = RecordsQueryBuilder::new();
    if let Some(sort) = query.descriptor.date_sort.clone() {
        builder = builder.sort(sort);
    }
    if let Some(pagination) = query.descriptor.pagination.clone() {
        builder = builder.pagination(pagination);
    }

    let store_query = if query.only_published() {
        // anonymous (and published-only) queries see published records only
        builder.add_filter(filter.published(true)).build()
    } else {
        let unrestricted = query.authorize(owner, provider).await?;
        if unrestricted {
            builder.add_filter(filter).build()
        } else {
            // non-owner: published ∪ authored-by-caller ∪ addressed-to-caller
            let author = query
                .authorization
                .as_ref()
                .ok_or_else(|| forbidden!("missing authorization"))?
                .author()?;
            builder
                .add_filter(filter.clone().published(true))
                .add_filter(filter.clone().published(false).add_author(author.clone()))
                .add_filter(filter.published(false).add_recipient(author))
                .build()
        }
    };

    let (entries, cursor) = store::message::query(owner, &store_query, provider).await?;

    if entries.is_empty() {
        return Ok(Reply {
            status: Status {
                code: StatusCode::OK.as_u16(),
                detail: None,
            },
            body: None,
        });
    }

    let mut reply_entries = vec![];
    for entry in entries {
        let mut write = Write::try_from(&entry)?;
        write.data_stream = None;

        let initial_write = if write.is_initial()? {
            None
        } else {
            let mut initial = records::initial_write(owner, &write.record_id, provider)
                .await?
                .ok_or_else(|| bad_request!("initial write not found"))?;
            initial.encoded_data = None;
            Some(initial)
        };

        reply_entries.push(QueryReplyEntry {
            write,
            initial_write,
        });
    }

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(QueryReply {
            entries: Some(reply_entries),
            cursor,
        }),
    })
}

/// The [`Query`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// The Query descriptor.
    pub descriptor: QueryDescriptor,

    /// The message authorization. Absent for anonymous queries over
    /// published records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
}

impl Message for Query {
    type Reply = QueryReply;

    fn cid(&self) -> Result<String> {
        cid::from_value(self)
    }

    fn descriptor(&self) -> &Descriptor {
        &self.descriptor.base
    }

    fn authorization(&self) -> Option<&Authorization> {
        self.authorization.as_ref()
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

/// [`QueryReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReply {
    /// The matching records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<QueryReplyEntry>>,

    /// Pagination cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// A record returned by a query.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReplyEntry {
    /// The record's latest `RecordsWrite` message.
    #[serde(flatten)]
    pub write: Write,

    /// The record's initial write, when the latest write is a later
    /// revision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_write: Option<Write>,
}

impl Query {
    // Returns `true` when the caller sees the full result set: the tenant,
    // or a grant holder whose scope admits the query's filter.
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<bool> {
        let Some(authzn) = &self.authorization else {
            return Err(forbidden!("missing authorization"));
        };

        let author = authzn.author()?;
        if author == owner {
            return Ok(true);
        }

        if let Some(grant_id) = authzn.payload()?.permission_grant_id {
            let grant = permissions::fetch_grant(owner, &grant_id, provider).await?;
            grant.verify(owner, &author, self.descriptor(), provider).await?;
            grant.permit_filter(&self.descriptor.filter)?;
            return Ok(true);
        }

        Ok(false)
    }

    fn validate(&self) -> Result<()> {
        let filter = &self.descriptor.filter;

        // sorting on publication date requires published records
        if filter.published == Some(false)
            && matches!(
                self.descriptor.date_sort,
                Some(Sort::PublishedAsc | Sort::PublishedDesc)
            )
        {
            return Err(bad_request!(
                "cannot sort by `datePublished` when querying for unpublished records"
            ));
        }

        Ok(())
    }

    // Whether the query concerns published records only: explicitly, via
    // published-only settings, or by arriving unsigned.
    fn only_published(&self) -> bool {
        if let Some(published) = self.descriptor.filter.published {
            return published;
        }
        if self.descriptor.filter.date_published.is_some() {
            return true;
        }
        if matches!(self.descriptor.date_sort, Some(Sort::PublishedAsc | Sort::PublishedDesc)) {
            return true;
        }
        self.authorization.is_none()
    }
}

/// The [`Query`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// Defines the filter for the query.
    pub filter: RecordsFilter,

    /// Sort property and direction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_sort: Option<Sort>,

    /// Pagination settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

/// Options to use when querying for records.
#[derive(Clone, Debug, Default)]
pub struct QueryBuilder {
    message_timestamp: DateTime<Utc>,
    filter: RecordsFilter,
    date_sort: Option<Sort>,
    pagination: Option<Pagination>,
    permission_grant_id: Option<String>,
    authorize: Option<bool>,
}

impl QueryBuilder {
    /// Returns a new [`QueryBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Utc::now(),
            ..Self::default()
        }
    }

    /// Specify the query's filter.
    #[must_use]
    pub fn filter(mut self, filter: RecordsFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Specify the sort property and direction.
    #[must_use]
    pub fn date_sort(mut self, date_sort: Sort) -> Self {
        self.date_sort = Some(date_sort);
        self
    }

    /// Specify pagination settings.
    #[must_use]
    pub fn pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = Some(pagination);
        self
    }

    /// Specify a permission grant ID to invoke with the query.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Set to `false` to build an anonymous (unsigned) query.
    #[must_use]
    pub const fn authorize(mut self, authorize: bool) -> Self {
        self.authorize = Some(authorize);
        self
    }

    /// Generate the Query message.
    ///
    /// # Errors
    ///
    /// Returns an error when signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Query> {
        let descriptor = QueryDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Query,
                message_timestamp: self.message_timestamp,
            },
            filter: self.filter.normalize()?,
            date_sort: self.date_sort,
            pagination: self.pagination,
        };

        let authorization = if self.authorize.unwrap_or(true) {
            let mut builder =
                AuthorizationBuilder::new().descriptor_cid(cid::from_value(&descriptor)?);
            if let Some(id) = self.permission_grant_id {
                builder = builder.permission_grant_id(id);
            }
            Some(builder.build(signer).await?)
        } else {
            None
        };

        Ok(Query {
            descriptor,
            authorization,
        })
    }
}
