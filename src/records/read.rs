//! # Records Read
//!
//! The records read endpoint handles `RecordsRead` messages — requests to
//! return a single record's latest state together with its payload.

use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use base64ct::{Base64UrlUnpadded, Encoding};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::data::DataStream;
use crate::endpoint::{Message, Reply, Status};
use crate::error::{Error, Result};
use crate::provider::{Provider, Signer};
use crate::records::{RecordsFilter, Write, protocol};
use crate::store::RecordsQueryBuilder;
use crate::{Descriptor, Interface, Method, bad_request, cid, forbidden, permissions, records,
    store};

/// Handle — or process — a [`Read`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails, no
/// record matches, or the record's latest state is a delete.
pub async fn handle(owner: &str, read: Read, provider: &impl Provider) -> Result<Reply<ReadReply>> {
    let filter = read.descriptor.filter.normalize()?;

    // the record's latest state: its latest write or its delete tombstone
    let query =
        RecordsQueryBuilder::new().method(None).add_filter(filter).build();
    let (entries, _) = store::message::query(owner, &query, provider).await?;
    if entries.is_empty() {
        return Err(Error::NotFound("no matching record".to_string()));
    }
    if entries.len() > 1 {
        return Err(bad_request!("filter matched more than one record"));
    }
    let latest = &entries[0];

    // a deleted record reads as not-found, but only for readers that could
    // have read it
    if let Some(delete) = latest.as_delete() {
        let Some(initial) =
            records::initial_write(owner, &delete.descriptor.record_id, provider).await?
        else {
            return Err(bad_request!("initial write not found for deleted record"));
        };
        read.authorize(owner, &initial, provider).await?;
        return Err(Error::NotFound("record is deleted".to_string()));
    }

    let mut write = Write::try_from(latest)?;
    read.authorize(owner, &write, provider).await?;

    let data = if let Some(encoded) = &write.encoded_data {
        let buffer = Base64UrlUnpadded::decode_vec(encoded)?;
        Some(DataStream::from(buffer))
    } else {
        DataStream::from_store(
            owner, &write.descriptor.data_cid, write.descriptor.data_size, provider,
        )
        .await?
    };
    write.encoded_data = None;

    // attach the initial write when the latest write is a later revision
    let initial_write = if write.is_initial()? {
        None
    } else {
        let mut initial = records::initial_write(owner, &write.record_id, provider)
            .await?
            .ok_or_else(|| bad_request!("initial write not found"))?;
        initial.encoded_data = None;
        Some(initial)
    };

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(ReadReply {
            entry: ReadReplyEntry {
                records_write: Some(write),
                initial_write,
                data,
            },
        }),
    })
}

/// The [`Read`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Read {
    /// The Read descriptor.
    pub descriptor: ReadDescriptor,

    /// The message authorization. Absent for anonymous reads of published
    /// records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
}

impl Message for Read {
    type Reply = ReadReply;

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

/// [`ReadReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReply {
    /// The read reply entry.
    pub entry: ReadReplyEntry,
}

/// The record state returned by a read.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReplyEntry {
    /// The record's latest `RecordsWrite` message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_write: Option<Write>,

    /// The record's initial write, when the latest write is a later
    /// revision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_write: Option<Write>,

    /// The record's payload: a lazy reader handle, streamed out-of-band
    /// rather than serialized with the reply.
    #[serde(skip)]
    pub data: Option<DataStream>,
}

impl Read {
    // Read authorization: the tenant, the record's recipient, any reader of
    // published records, a grant holder, or a reader admitted by the
    // record's protocol rules.
    async fn authorize(&self, owner: &str, write: &Write, provider: &impl Provider) -> Result<()> {
        // published records read without authorization
        if write.descriptor.published.unwrap_or_default() {
            return Ok(());
        }

        let Some(authzn) = &self.authorization else {
            return Err(forbidden!("read of unpublished record requires authorization"));
        };
        let author = authzn.author()?;

        if author == owner {
            return Ok(());
        }
        if write.descriptor.recipient.as_ref() == Some(&author) {
            return Ok(());
        }

        if let Some(grant_id) = &authzn.payload()?.permission_grant_id {
            let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
            grant.verify(owner, &author, self.descriptor(), provider).await?;
            grant.permit_record(write)?;
            return Ok(());
        }

        if write.descriptor.protocol.is_some() {
            return protocol::permit_read(owner, &author, write, provider).await;
        }

        Err(forbidden!("read cannot be authorized"))
    }
}

/// The [`Read`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// Defines the filter for the read.
    pub filter: RecordsFilter,
}

/// Options to use when reading a record.
#[derive(Clone, Debug, Default)]
pub struct ReadBuilder {
    message_timestamp: DateTime<Utc>,
    filter: RecordsFilter,
    permission_grant_id: Option<String>,
    authorize: Option<bool>,
}

impl ReadBuilder {
    /// Returns a new [`ReadBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Utc::now(),
            ..Self::default()
        }
    }

    /// Specify the filter identifying the record to read.
    #[must_use]
    pub fn filter(mut self, filter: RecordsFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Specify a permission grant ID to invoke with the read.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Set to `false` to build an anonymous (unsigned) read.
    #[must_use]
    pub const fn authorize(mut self, authorize: bool) -> Self {
        self.authorize = Some(authorize);
        self
    }

    /// Generate the Read message.
    ///
    /// # Errors
    ///
    /// Returns an error when signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Read> {
        let descriptor = ReadDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Read,
                message_timestamp: self.message_timestamp,
            },
            filter: self.filter.normalize()?,
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

        Ok(Read {
            descriptor,
            authorization,
        })
    }
}
