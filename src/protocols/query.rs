//! # Protocols Query
//!
//! The protocols query endpoint handles `ProtocolsQuery` messages —
//! requests to discover the protocol definitions installed for a tenant.
//! Unauthorized callers see published definitions only.

use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::error::Result;
use crate::protocols::Configure;
use crate::provider::{Provider, Signer};
use crate::store::ProtocolsQueryBuilder;
use crate::{Descriptor, Interface, Method, cid, permissions, store, utils};

/// Handle — or process — a [`Query`] message.
///
/// # Errors
///
/// The endpoint will return an error when an invoked grant fails
/// verification or the underlying store fails.
pub async fn handle(
    owner: &str, query: Query, provider: &impl Provider,
) -> Result<Reply<QueryReply>> {
    let unrestricted = query.authorize(owner, provider).await?;

    let mut builder = ProtocolsQueryBuilder::new();
    if let Some(protocol) = query.descriptor.filter.as_ref().and_then(|f| f.protocol.as_ref()) {
        builder = builder.protocol(utils::clean_url(protocol)?);
    }
    if !unrestricted {
        builder = builder.published(true);
    }

    let (entries, _) = store::message::query(owner, &builder.build(), provider).await?;

    let mut configures = vec![];
    for entry in entries {
        let Some(configure) = entry.as_configure() else {
            continue;
        };
        configures.push(configure.clone());
    }
    let entries = if configures.is_empty() { None } else { Some(configures) };

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(QueryReply { entries }),
    })
}

/// The [`Query`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// The Query descriptor.
    pub descriptor: QueryDescriptor,

    /// The message authorization.
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

impl Query {
    // Returns `true` when the caller may see unpublished definitions: the
    // tenant itself, or a grant holder scoped to protocol queries.
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<bool> {
        let Some(authzn) = &self.authorization else {
            return Ok(false);
        };

        let author = authzn.author()?;
        if author == owner {
            return Ok(true);
        }

        if let Some(grant_id) = authzn.payload()?.permission_grant_id {
            let grant = permissions::fetch_grant(owner, &grant_id, provider).await?;
            grant.verify(owner, &author, self.descriptor(), provider).await?;
            return Ok(true);
        }

        Ok(false)
    }
}

/// [`QueryReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct QueryReply {
    /// The matching protocol configurations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<Configure>>,
}

/// The [`Query`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The filter to apply when querying.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<ProtocolFilter>,
}

/// A filter over installed protocols.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolFilter {
    /// The protocol URI to match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Options to use when querying for protocol configurations.
#[derive(Clone, Debug, Default)]
pub struct QueryBuilder {
    message_timestamp: DateTime<Utc>,
    filter: Option<ProtocolFilter>,
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

    /// Restrict the query to a protocol URI.
    #[must_use]
    pub fn filter(mut self, protocol: impl Into<String>) -> Self {
        self.filter = Some(ProtocolFilter {
            protocol: Some(protocol.into()),
        });
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
                interface: Interface::Protocols,
                method: Method::Query,
                message_timestamp: self.message_timestamp,
            },
            filter: self.filter,
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
