//! # Records Delete
//!
//! The records delete endpoint handles `RecordsDelete` messages — requests
//! to delete a record. The record is not erased: a `RecordsDelete`
//! tombstone becomes its latest state, earlier writes (except the initial
//! write) are pruned, and the payload is dereferenced.

use chrono::{DateTime, SecondsFormat::Micros, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::error::{Error, Result};
use crate::provider::{EventStream, Provider, Signer};
use crate::records::{Write, protocol};
use crate::store::Entry;
use crate::{Descriptor, Interface, Method, cid, forbidden, permissions, records, store,
    unexpected};

/// Handle — or process — a [`Delete`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails, the
/// record does not exist or is already deleted, or a newer message exists
/// for the record.
pub async fn handle(
    owner: &str, delete: Delete, provider: &impl Provider,
) -> Result<Reply<DeleteReply>> {
    let record_id = &delete.descriptor.record_id;

    let existing = records::existing_entries(owner, record_id, provider).await?;
    let Some(latest) = existing.last() else {
        return Err(Error::NotFound("no matching record".to_string()));
    };
    if latest.descriptor().method == Method::Delete {
        return Err(Error::NotFound("record is already deleted".to_string()));
    }
    let latest_write = Write::try_from(latest)?;

    delete.authorize(owner, &latest_write, provider).await?;

    // the delete must not pre-date the record's latest state
    let incoming = (delete.descriptor.base.message_timestamp.timestamp_micros(), delete.cid()?);
    let latest_key = (latest.descriptor().message_timestamp.timestamp_micros(), latest.cid()?);
    if incoming <= latest_key {
        return Err(Error::Conflict("newer record state exists".to_string()));
    }

    // the tombstone carries the record's searchable indexes so queries over
    // record properties continue to resolve its state
    let mut entry = Entry::from(&delete);
    for (key, value) in latest_write.build_indexes() {
        entry.indexes.entry(key).or_insert(value);
    }

    store::message::put(owner, &entry, provider).await?;
    store::event_log::append(owner, &entry, provider).await?;

    // prune earlier messages and dereference payloads
    for prior in &existing {
        prune_for_delete(owner, prior, provider).await?;
    }

    if let Err(e) = EventStream::emit(provider, owner, &entry).await {
        tracing::warn!(owner, "issue emitting delete event: {e}");
    }

    Ok(Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: None,
        },
        body: None,
    })
}

// Prune a message superseded by a delete: the initial write is archived,
// other writes are removed, and every externally stored payload is
// dereferenced.
async fn prune_for_delete(owner: &str, prior: &Entry, provider: &impl Provider) -> Result<()> {
    let Some(prior_write) = prior.as_write() else {
        return Err(unexpected!("unexpected message type"));
    };

    if prior_write.encoded_data.is_none() {
        store::data::delete(owner, &prior_write.record_id, &prior_write.descriptor.data_cid,
            provider)
        .await?;
    }

    if prior_write.is_initial()? {
        let mut archived = Entry::from(prior_write);
        archived.add_index("archived", true);
        store::message::put(owner, &archived, provider).await?;
    } else {
        let prior_cid = prior.cid()?;
        store::message::delete(owner, &prior_cid, provider).await?;
        store::event_log::delete(owner, &prior_cid, provider).await?;
    }

    Ok(())
}

/// The [`Delete`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delete {
    /// The Delete descriptor.
    pub descriptor: DeleteDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
}

impl Message for Delete {
    type Reply = DeleteReply;

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

/// [`DeleteReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Debug)]
pub struct DeleteReply;

/// The [`Delete`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The id of the record to delete.
    pub record_id: String,
}

impl Delete {
    /// Build flattened indexes for the delete message.
    #[must_use]
    pub(crate) fn build_indexes(&self) -> Map<String, Value> {
        let mut indexes = Map::new();
        indexes.insert("interface".to_string(), Value::String(Interface::Records.to_string()));
        indexes.insert("method".to_string(), Value::String(Method::Delete.to_string()));
        indexes.insert("recordId".to_string(), Value::String(self.descriptor.record_id.clone()));
        indexes.insert(
            "messageTimestamp".to_string(),
            Value::String(self.descriptor.base.message_timestamp.to_rfc3339_opts(Micros, true)),
        );
        indexes.insert(
            "author".to_string(),
            Value::String(self.authorization.author().unwrap_or_default()),
        );
        indexes.insert("archived".to_string(), Value::Bool(false));
        indexes
    }

    // Delete authorization: the tenant, a grant holder, or an author
    // admitted by the rules that governed the record's latest write.
    async fn authorize(&self, owner: &str, write: &Write, provider: &impl Provider) -> Result<()> {
        let author = self.authorization.author()?;

        if let Some(grant_id) = self.authorization.payload()?.permission_grant_id {
            let grant = permissions::fetch_grant(owner, &grant_id, provider).await?;
            grant.verify(owner, &author, self.descriptor(), provider).await?;
            grant.permit_record(write)?;
            return Ok(());
        }

        if author == owner {
            return Ok(());
        }

        if write.descriptor.protocol.is_some() {
            return protocol::permit_delete(owner, &author, write, provider).await;
        }

        Err(forbidden!("delete request failed authorization"))
    }
}

/// Options to use when deleting a record.
#[derive(Clone, Debug, Default)]
pub struct DeleteBuilder {
    message_timestamp: DateTime<Utc>,
    record_id: Option<String>,
    permission_grant_id: Option<String>,
}

impl DeleteBuilder {
    /// Returns a new [`DeleteBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Utc::now(),
            ..Self::default()
        }
    }

    /// Specify the record to delete.
    #[must_use]
    pub fn record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// Specify a permission grant ID to invoke with the delete.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// The datetime the message was created. Defaults to now.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateTime<Utc>) -> Self {
        self.message_timestamp = message_timestamp;
        self
    }

    /// Generate the Delete message.
    ///
    /// # Errors
    ///
    /// Returns an error when no record id has been set or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Delete> {
        let Some(record_id) = self.record_id else {
            return Err(unexpected!("`record_id` not set"));
        };

        let descriptor = DeleteDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Delete,
                message_timestamp: self.message_timestamp,
            },
            record_id,
        };

        let mut builder =
            AuthorizationBuilder::new().descriptor_cid(cid::from_value(&descriptor)?);
        if let Some(id) = self.permission_grant_id {
            builder = builder.permission_grant_id(id);
        }
        let authorization = builder.build(signer).await?;

        Ok(Delete {
            descriptor,
            authorization,
        })
    }
}
