//! # Permissions Revoke
//!
//! The permissions revoke endpoint handles `PermissionsRevoke` messages —
//! requests to revoke a previously issued grant. A revocation tombstones
//! the grant: any later invocation fails.

use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::error::{Error, Result};
use crate::provider::{EventStream, Provider, Signer};
use crate::store::Entry;
use crate::{Descriptor, Interface, Method, bad_request, cid, forbidden, store, unexpected};

/// Handle — or process — a [`Revoke`] message.
///
/// # Errors
///
/// The endpoint will return an error when the referenced grant does not
/// exist or the author may not revoke it.
pub async fn handle(
    owner: &str, revoke: Revoke, provider: &impl Provider,
) -> Result<Reply<RevokeReply>> {
    let grant_id = &revoke.descriptor.permissions_grant_id;
    let Some(entry) = store::message::get(owner, grant_id, provider).await? else {
        return Err(Error::NotFound("no grant found".to_string()));
    };
    let Some(grant) = entry.as_grant() else {
        return Err(bad_request!("message is not a valid grant"));
    };

    // only the grantor (the tenant) may revoke
    let author = revoke.authorization.author()?;
    if author != owner && author != grant.descriptor.granted_by {
        return Err(forbidden!("only the grantor may revoke a grant"));
    }

    // a revocation cannot pre-date the grant
    if revoke.descriptor.base.message_timestamp < grant.descriptor.base.message_timestamp {
        return Err(bad_request!("revocation pre-dates the grant"));
    }

    let entry = Entry::from(&revoke);
    store::message::put(owner, &entry, provider).await?;
    store::event_log::append(owner, &entry, provider).await?;

    if let Err(e) = EventStream::emit(provider, owner, &entry).await {
        tracing::warn!(owner, "issue emitting revoke event: {e}");
    }

    Ok(Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: None,
        },
        body: None,
    })
}

/// The [`Revoke`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Revoke {
    /// The Revoke descriptor.
    pub descriptor: RevokeDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
}

impl Message for Revoke {
    type Reply = RevokeReply;

    fn cid(&self) -> Result<String> {
        cid::from_value(self)
    }

    fn descriptor(&self) -> &Descriptor {
        &self.descriptor.base
    }

    fn authorization(&self) -> Option<&Authorization> {
        Some(&self.authorization)
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

/// [`RevokeReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Debug)]
pub struct RevokeReply;

/// The [`Revoke`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The CID of the grant being revoked.
    #[serde(rename = "permissionsGrantId")]
    pub permissions_grant_id: String,
}

impl Revoke {
    /// Build flattened indexes for the revoke message.
    #[must_use]
    pub(crate) fn build_indexes(&self) -> Map<String, Value> {
        use chrono::SecondsFormat::Micros;

        let mut indexes = Map::new();
        indexes.insert("interface".to_string(), Value::String(Interface::Permissions.to_string()));
        indexes.insert("method".to_string(), Value::String(Method::Revoke.to_string()));
        indexes.insert(
            "messageTimestamp".to_string(),
            Value::String(self.descriptor.base.message_timestamp.to_rfc3339_opts(Micros, true)),
        );
        indexes.insert(
            "author".to_string(),
            Value::String(self.authorization.author().unwrap_or_default()),
        );
        indexes.insert(
            "permissionsGrantId".to_string(),
            Value::String(self.descriptor.permissions_grant_id.clone()),
        );
        indexes
    }
}

/// Options to use when revoking a permission grant.
#[derive(Clone, Debug, Default)]
pub struct RevokeBuilder {
    message_timestamp: DateTime<Utc>,
    permissions_grant_id: Option<String>,
}

/// Builder for creating a grant revocation.
impl RevokeBuilder {
    /// Returns a new [`RevokeBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Utc::now(),
            ..Self::default()
        }
    }

    /// Specify the CID of the grant to revoke.
    #[must_use]
    pub fn permissions_grant_id(mut self, permissions_grant_id: impl Into<String>) -> Self {
        self.permissions_grant_id = Some(permissions_grant_id.into());
        self
    }

    /// The datetime the message was created. Defaults to now.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateTime<Utc>) -> Self {
        self.message_timestamp = message_timestamp;
        self
    }

    /// Generate the Revoke message.
    ///
    /// # Errors
    ///
    /// Returns an error when no grant id has been set or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Revoke> {
        let Some(permissions_grant_id) = self.permissions_grant_id else {
            return Err(unexpected!("`permissions_grant_id` not set"));
        };

        let descriptor = RevokeDescriptor {
            base: Descriptor {
                interface: Interface::Permissions,
                method: Method::Revoke,
                message_timestamp: self.message_timestamp,
            },
            permissions_grant_id,
        };

        let authorization = AuthorizationBuilder::new()
            .descriptor_cid(cid::from_value(&descriptor)?)
            .build(signer)
            .await?;

        Ok(Revoke {
            descriptor,
            authorization,
        })
    }
}
