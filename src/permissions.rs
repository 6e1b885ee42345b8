//! # Permissions
//!
//! Cross-tenant access delegation. A grant delegates a specific
//! `(interface, method)` scope from the tenant to another DID; a revocation
//! tombstones a grant. Messages invoke a grant by carrying its CID in their
//! signed `permissionsGrantId` payload field.

mod grant;
mod revoke;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use self::grant::{Grant, GrantBuilder, GrantDescriptor, GrantReply};
pub use self::revoke::{Revoke, RevokeBuilder, RevokeDescriptor, RevokeReply};
use crate::error::Result;
use crate::forbidden;
use crate::provider::{BlockStore, KvStore};
use crate::store::{Filter, Matcher, Pagination, Query as StoreQuery, Sort};
use crate::{Interface, Method, store};

/// The batch size used when scanning for a grant's revocation records.
pub const REVOCATION_BATCH: usize = 64;

/// Fetch the grant specified by `grant_id` (the grant message's CID).
///
/// # Errors
///
/// Returns `Error::Forbidden` when no grant exists for the id.
pub(crate) async fn fetch_grant<S: BlockStore + KvStore>(
    owner: &str, grant_id: &str, store: &S,
) -> Result<Grant> {
    let Some(entry) = store::message::get(owner, grant_id, store).await? else {
        return Err(forbidden!("no grant found"));
    };
    let Some(grant) = entry.as_grant() else {
        return Err(forbidden!("message is not a valid grant"));
    };
    Ok(grant.clone())
}

/// Check whether any revocation exists for the grant id.
pub(crate) async fn is_revoked<S: BlockStore + KvStore>(
    owner: &str, grant_id: &str, store: &S,
) -> Result<bool> {
    let filter = Filter::new()
        .add("interface", Matcher::Equal(Value::String(Interface::Permissions.to_string())))
        .add("method", Matcher::Equal(Value::String(Method::Revoke.to_string())))
        .add("permissionsGrantId", Matcher::Equal(Value::String(grant_id.to_string())));

    let query = StoreQuery {
        filters: vec![filter],
        sort: Sort::TimestampAsc,
        pagination: Some(Pagination::new().limit(REVOCATION_BATCH)),
    };

    let matches = store::message::query_indexes(owner, &query, store).await?;
    Ok(!matches.is_empty())
}

/// The scope delegated by a grant: the permitted `(interface, method)` pair
/// plus optional record constraints. A scope with neither `protocol` nor
/// `schema` is unrestricted within its interface and method.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    /// The interface the grant applies to.
    pub interface: Interface,

    /// The method the grant applies to.
    pub method: Method,

    /// Restrict the grant to records of this protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Restrict the grant to records within this context (prefix match).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// Restrict the grant to records at this protocol path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_path: Option<String>,

    /// Restrict the grant to (non-protocol) records of this schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

impl Scope {
    /// A scope over the given interface and method, unrestricted within it.
    #[must_use]
    pub fn new(interface: Interface, method: Method) -> Self {
        Self {
            interface,
            method,
            ..Self::default()
        }
    }

    /// Restrict the scope to a protocol.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Restrict the scope to a context.
    #[must_use]
    pub fn context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Restrict the scope to a protocol path.
    #[must_use]
    pub fn protocol_path(mut self, protocol_path: impl Into<String>) -> Self {
        self.protocol_path = Some(protocol_path.into());
        self
    }

    /// Restrict the scope to a schema.
    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }
}

/// Conditions that must be met when a grant is invoked.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conditions {
    /// Whether a record written under the grant must, or must not, be
    /// published. Unset leaves publication optional.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publication: Option<ConditionPublication>,
}

/// Publication condition for records written under a grant.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ConditionPublication {
    /// The record must be published.
    #[default]
    Required,

    /// The record must not be published.
    Prohibited,
}
