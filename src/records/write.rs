//! # Records Write
//!
//! The records write endpoint handles `RecordsWrite` messages — requests to
//! create or update a record. Competing writes for the same record
//! reconcile under `(message timestamp, message CID)` ordering: the larger
//! key wins, earlier non-initial writes are pruned, and the initial write is
//! retained (archived) as the record's immutable anchor.

use chrono::{DateTime, SecondsFormat::Micros, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::authorization::{Attestation, Authorization, AuthorizationBuilder, Jws};
use crate::data::{DataStream, MAX_ENCODED_SIZE};
use crate::endpoint::{Message, Reply, Status};
use crate::error::{Error, Result};
use crate::provider::{EventStream, Provider, Signer};
use crate::records::{EncryptionProperty, protocol};
use crate::store::{Entry, EntryType};
use crate::{Descriptor, Interface, Method, bad_request, cid, forbidden, permissions, records,
    store, unexpected, utils};

use base64ct::{Base64UrlUnpadded, Encoding};

/// Handle — or process — a [`Write`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails, an
/// integrity CID check fails, an immutable property changes, or a more
/// recent message exists for the record.
pub async fn handle(
    owner: &str, mut write: Write, provider: &impl Provider,
) -> Result<Reply<WriteReply>> {
    write.authorize(owner, provider).await?;
    write.verify_integrity(provider).await?;

    let existing = records::existing_entries(owner, &write.record_id, provider).await?;
    let initial = find_initial(&existing)?;

    if let Some(initial) = &initial {
        write.verify_immutable(initial)?;
    } else if !write.is_initial()? {
        return Err(bad_request!("initial write not found"));
    }

    // the incoming message must be newer than the latest existing message
    let incoming = (write.descriptor.base.message_timestamp.timestamp_micros(), write.cid()?);
    if let Some(latest) = existing.last() {
        let latest_key =
            (latest.descriptor().message_timestamp.timestamp_micros(), latest.cid()?);
        if incoming <= latest_key {
            return Err(Error::Conflict("a more recent update exists".to_string()));
        }

        // a deleted record is revived only by its original author
        if latest.descriptor().method == Method::Delete {
            let Some(initial) = &initial else {
                return Err(bad_request!("initial write not found"));
            };
            if write.authorization.author()? != initial.authorization.author()? {
                return Err(forbidden!("only the original author may revive a deleted record"));
            }
        }
    }

    // protocol records must conform to the installed definition
    if write.descriptor.protocol.is_some() {
        protocol::verify_integrity(owner, &write, provider).await?;
    }

    // payload handling: embed, store, or re-reference prior data
    if let Some(stream) = write.data_stream.take() {
        write.commit_data(owner, stream, provider).await?;
    } else {
        write.reuse_data(owner, &existing, provider).await?;
    }

    let entry = Entry::from(&write);
    store::message::put(owner, &entry, provider).await?;
    store::event_log::append(owner, &entry, provider).await?;

    // prune earlier messages: the initial write is retained but archived,
    // everything else is removed along with its data reference
    for prior in &existing {
        prune_earlier(owner, prior, &write, provider).await?;
    }

    if let Err(e) = EventStream::emit(provider, owner, &entry).await {
        tracing::warn!(owner, "issue emitting write event: {e}");
    }

    Ok(Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: None,
        },
        body: None,
    })
}

/// The [`Write`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Write {
    /// The record's id: the entry id of the initial write.
    pub record_id: String,

    /// The record's context: the chain of entry ids from the protocol root,
    /// joined by `/`. Protocol records only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// The Write descriptor.
    pub descriptor: WriteDescriptor,

    /// The message authorization.
    pub authorization: Authorization,

    /// The attester's signed commitment to the descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation: Option<Jws>,

    /// The record's encryption property, when the payload is encrypted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionProperty>,

    /// The payload, embedded when no larger than the inline threshold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded_data: Option<String>,

    /// The payload stream supplied by the caller. Never serialized.
    #[serde(skip)]
    pub data_stream: Option<DataStream>,
}

impl Message for Write {
    type Reply = WriteReply;

    fn cid(&self) -> Result<String> {
        // the CID covers the message without its embedded payload so a
        // message hashes identically however its data is carried
        let mut message = self.clone();
        message.encoded_data = None;
        cid::from_value(&message)
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

/// [`WriteReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Debug)]
pub struct WriteReply;

impl TryFrom<&Entry> for Write {
    type Error = crate::Error;

    fn try_from(entry: &Entry) -> Result<Self> {
        match &entry.message {
            EntryType::Write(write) => Ok(write.clone()),
            _ => Err(bad_request!("expected `RecordsWrite` message")),
        }
    }
}

/// The [`Write`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WriteDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The DID the record is addressed to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,

    /// The record's protocol URI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// The record's path within the protocol structure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_path: Option<String>,

    /// The record's schema URI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// The record id of the record's parent. Protocol records only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// The CID of the record's payload.
    pub data_cid: String,

    /// The size of the record's payload in bytes.
    pub data_size: u64,

    /// The MIME type of the record's payload.
    pub data_format: String,

    /// When the record was created. Immutable across the record's lifetime.
    #[serde(with = "crate::utils::rfc3339_micros")]
    pub date_created: DateTime<Utc>,

    /// Whether the record is published (readable by anyone).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<bool>,

    /// When the record was published.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(with = "crate::utils::rfc3339_micros_opt")]
    #[serde(default)]
    pub date_published: Option<DateTime<Utc>>,
}

/// Compute a record's entry id: the CID of the descriptor plus the author
/// DID. The initial write's entry id is the record's id for life.
///
/// # Errors
///
/// Returns an error when the input cannot be encoded.
pub fn entry_id(descriptor: &WriteDescriptor, author: &str) -> Result<String> {
    #[derive(Serialize)]
    struct EntryIdInput<'a> {
        #[serde(flatten)]
        descriptor: &'a WriteDescriptor,
        author: &'a str,
    }
    cid::from_value(&EntryIdInput { descriptor, author })
}

impl Write {
    /// Whether this message is the record's initial write.
    ///
    /// # Errors
    ///
    /// Returns an error when the entry id cannot be computed.
    pub fn is_initial(&self) -> Result<bool> {
        let author = self.authorization.author()?;
        Ok(self.record_id == entry_id(&self.descriptor, &author)?)
    }

    /// The attesting DID, when the message carries an attestation.
    #[must_use]
    pub fn attester(&self) -> Option<String> {
        self.attestation.as_ref().and_then(|jws| jws.did(0).ok())
    }

    /// Build flattened indexes for the write message.
    #[must_use]
    pub(crate) fn build_indexes(&self) -> Map<String, Value> {
        let desc = &self.descriptor;
        let mut indexes = Map::new();

        indexes.insert("interface".to_string(), Value::String(Interface::Records.to_string()));
        indexes.insert("method".to_string(), Value::String(Method::Write.to_string()));
        indexes.insert("recordId".to_string(), Value::String(self.record_id.clone()));
        indexes.insert(
            "messageTimestamp".to_string(),
            Value::String(desc.base.message_timestamp.to_rfc3339_opts(Micros, true)),
        );
        indexes.insert(
            "dateCreated".to_string(),
            Value::String(desc.date_created.to_rfc3339_opts(Micros, true)),
        );
        indexes.insert(
            "author".to_string(),
            Value::String(self.authorization.author().unwrap_or_default()),
        );
        indexes.insert("dataCid".to_string(), Value::String(desc.data_cid.clone()));
        indexes.insert("dataSize".to_string(), Value::from(desc.data_size));
        indexes.insert("dataFormat".to_string(), Value::String(desc.data_format.clone()));
        indexes
            .insert("published".to_string(), Value::Bool(desc.published.unwrap_or_default()));
        indexes.insert("archived".to_string(), Value::Bool(false));

        if let Some(recipient) = &desc.recipient {
            indexes.insert("recipient".to_string(), Value::String(recipient.clone()));
        }
        if let Some(protocol) = &desc.protocol {
            indexes.insert("protocol".to_string(), Value::String(protocol.clone()));
        }
        if let Some(protocol_path) = &desc.protocol_path {
            indexes.insert("protocolPath".to_string(), Value::String(protocol_path.clone()));
        }
        if let Some(schema) = &desc.schema {
            indexes.insert("schema".to_string(), Value::String(schema.clone()));
        }
        if let Some(context_id) = &self.context_id {
            indexes.insert("contextId".to_string(), Value::String(context_id.clone()));
        }
        if let Some(parent_id) = &desc.parent_id {
            indexes.insert("parentId".to_string(), Value::String(parent_id.clone()));
        }
        if let Some(date_published) = &desc.date_published {
            indexes.insert(
                "datePublished".to_string(),
                Value::String(date_published.to_rfc3339_opts(Micros, true)),
            );
        }
        if let Some(attester) = self.attester() {
            indexes.insert("attester".to_string(), Value::String(attester));
        }

        indexes
    }

    // Authorize the write: the tenant writes freely, anyone else needs a
    // grant or a protocol action rule.
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        let author = self.authorization.author()?;

        if let Some(grant_id) = self.authorization.payload()?.permission_grant_id {
            let grant = permissions::fetch_grant(owner, &grant_id, provider).await?;
            grant.verify(owner, &author, self.descriptor(), provider).await?;
            grant.permit_record(self)?;
            grant.permit_conditions(self)?;
            return Ok(());
        }

        if author == owner {
            return Ok(());
        }

        if self.descriptor.protocol.is_some() {
            return protocol::permit_write(owner, self, provider).await;
        }

        Err(forbidden!("record write failed authorization"))
    }

    // Verify the CIDs binding the signed payload to the message, and the
    // initial write's identity rules.
    async fn verify_integrity(&self, provider: &impl Provider) -> Result<()> {
        let payload = self.authorization.payload()?;

        if payload.descriptor_cid != cid::from_value(&self.descriptor)? {
            return Err(bad_request!("descriptor CID does not match signed payload"));
        }
        if payload.record_id.as_ref() != Some(&self.record_id) {
            return Err(bad_request!("record id does not match signed payload"));
        }
        if payload.context_id != self.context_id {
            return Err(bad_request!("context id does not match signed payload"));
        }

        match (&self.attestation, &payload.attestation_cid) {
            (None, None) => {}
            (Some(attestation), Some(attestation_cid)) => {
                if attestation_cid != &cid::from_value(attestation)? {
                    return Err(bad_request!("attestation CID does not match signed payload"));
                }
                Attestation::verify(attestation, &cid::from_value(&self.descriptor)?, provider)
                    .await?;
            }
            _ => return Err(bad_request!("attestation does not match signed payload")),
        }

        match (&self.encryption, &payload.encryption_cid) {
            (None, None) => {}
            (Some(encryption), Some(encryption_cid)) => {
                if encryption_cid != &cid::from_value(encryption)? {
                    return Err(bad_request!("encryption CID does not match signed payload"));
                }
            }
            _ => return Err(bad_request!("encryption does not match signed payload")),
        }

        if self.is_initial()? {
            if self.descriptor.date_created.timestamp_micros()
                != self.descriptor.base.message_timestamp.timestamp_micros()
            {
                return Err(bad_request!(
                    "`dateCreated` and `messageTimestamp` must match for the initial write"
                ));
            }
            if self.descriptor.protocol.is_some()
                && self.descriptor.parent_id.is_none()
                && self.context_id.as_ref() != Some(&self.record_id)
            {
                return Err(bad_request!("root record context must be its own entry id"));
            }
        }

        Ok(())
    }

    // Immutable properties must agree with the initial write.
    fn verify_immutable(&self, initial: &Write) -> Result<()> {
        let desc = &self.descriptor;
        let initial_desc = &initial.descriptor;

        if desc.date_created.timestamp_micros() != initial_desc.date_created.timestamp_micros() {
            return Err(bad_request!("immutable property `dateCreated` changed"));
        }
        if desc.schema != initial_desc.schema {
            return Err(bad_request!("immutable property `schema` changed"));
        }
        if desc.data_format != initial_desc.data_format {
            return Err(bad_request!("immutable property `dataFormat` changed"));
        }
        if desc.protocol != initial_desc.protocol {
            return Err(bad_request!("immutable property `protocol` changed"));
        }
        if desc.protocol_path != initial_desc.protocol_path {
            return Err(bad_request!("immutable property `protocolPath` changed"));
        }
        if desc.recipient != initial_desc.recipient {
            return Err(bad_request!("immutable property `recipient` changed"));
        }
        if desc.parent_id != initial_desc.parent_id {
            return Err(bad_request!("immutable property `parentId` changed"));
        }
        if self.context_id != initial.context_id {
            return Err(bad_request!("immutable property `contextId` changed"));
        }

        Ok(())
    }

    // Verify and persist a caller-supplied payload: embedded inline when at
    // or below the threshold, otherwise streamed to the data store.
    async fn commit_data(
        &mut self, owner: &str, mut stream: DataStream, provider: &impl Provider,
    ) -> Result<()> {
        if self.descriptor.data_size as usize <= MAX_ENCODED_SIZE {
            // inlining materializes the payload, bounded by the threshold
            let mut buffer = Vec::new();
            std::io::Read::read_to_end(&mut stream, &mut buffer)
                .map_err(|e| unexpected!("issue reading data: {e}"))?;

            if cid::from_bytes(&buffer) != self.descriptor.data_cid {
                return Err(bad_request!("data CID does not match descriptor `dataCid`"));
            }
            if buffer.len() as u64 != self.descriptor.data_size {
                return Err(bad_request!("data size does not match descriptor `dataSize`"));
            }
            self.encoded_data = Some(Base64UrlUnpadded::encode_string(&buffer));
        } else {
            let data_size = store::data::put(
                owner, &self.record_id, &self.descriptor.data_cid, stream, provider,
            )
            .await?;
            if data_size as u64 != self.descriptor.data_size {
                store::data::delete(owner, &self.record_id, &self.descriptor.data_cid, provider)
                    .await?;
                return Err(bad_request!("data size does not match descriptor `dataSize`"));
            }
        }

        Ok(())
    }

    // No payload was supplied: the write must reference the payload of the
    // latest existing write for the record.
    async fn reuse_data(
        &mut self, owner: &str, existing: &[Entry], provider: &impl Provider,
    ) -> Result<()> {
        let latest_write = existing.iter().rev().find_map(|entry| entry.as_write());
        let Some(latest_write) = latest_write else {
            return Err(bad_request!("data stream not provided"));
        };
        if latest_write.descriptor.data_cid != self.descriptor.data_cid {
            return Err(bad_request!("data stream not provided for new data"));
        }
        if latest_write.descriptor.data_size != self.descriptor.data_size {
            return Err(bad_request!("data size does not match previous write"));
        }

        if let Some(encoded) = &latest_write.encoded_data {
            self.encoded_data = Some(encoded.clone());
        } else {
            store::data::associate(owner, &self.record_id, &self.descriptor.data_cid, provider)
                .await?;
        }

        Ok(())
    }
}

// The record's initial write among its existing messages, if any.
fn find_initial(existing: &[Entry]) -> Result<Option<Write>> {
    for entry in existing {
        if let Some(write) = entry.as_write() {
            if write.is_initial()? {
                return Ok(Some(write.clone()));
            }
        }
    }
    Ok(None)
}

// Prune a message made stale by the incoming write: the initial write is
// retained but archived, other writes are removed together with their event
// and, when no longer referenced, their payload.
async fn prune_earlier(
    owner: &str, prior: &Entry, incoming: &Write, provider: &impl Provider,
) -> Result<()> {
    let Some(prior_write) = prior.as_write() else {
        // delete tombstones being superseded by a revival are removed
        let prior_cid = prior.cid()?;
        store::message::delete(owner, &prior_cid, provider).await?;
        store::event_log::delete(owner, &prior_cid, provider).await?;
        return Ok(());
    };

    if prior_write.is_initial()? {
        let mut archived = Entry::from(prior_write);
        archived.add_index("archived", true);
        store::message::put(owner, &archived, provider).await?;
    } else {
        let prior_cid = prior.cid()?;
        store::message::delete(owner, &prior_cid, provider).await?;
        store::event_log::delete(owner, &prior_cid, provider).await?;
    }

    // release the payload unless the incoming write still references it
    if prior_write.descriptor.data_cid != incoming.descriptor.data_cid
        && prior_write.encoded_data.is_none()
    {
        store::data::delete(owner, &prior_write.record_id, &prior_write.descriptor.data_cid,
            provider)
        .await?;
    }

    Ok(())
}

/// The data for a write: a payload stream, or a reference to an existing
/// payload by CID.
#[derive(Clone, Debug)]
pub enum Data {
    /// A payload to stream to the node.
    Stream(DataStream),

    /// Reference to a payload held by the record's latest write.
    Cid {
        /// The payload's CID.
        data_cid: String,

        /// The payload's size in bytes.
        data_size: u64,
    },
}

impl Default for Data {
    fn default() -> Self {
        Self::Stream(DataStream::default())
    }
}

impl From<Vec<u8>> for Data {
    fn from(data: Vec<u8>) -> Self {
        Self::Stream(DataStream::from(data))
    }
}

/// A protocol setting for a record under construction.
#[derive(Clone, Debug, Default)]
pub struct WriteProtocol {
    /// The protocol URI.
    pub protocol: String,

    /// The record's path within the protocol structure.
    pub protocol_path: String,
}

/// Options to use when creating or updating a record.
#[derive(Clone, Debug, Default)]
pub struct WriteBuilder {
    message_timestamp: DateTime<Utc>,
    date_created: Option<DateTime<Utc>>,
    recipient: Option<String>,
    protocol: Option<WriteProtocol>,
    parent_context_id: Option<String>,
    schema: Option<String>,
    data_format: Option<String>,
    data: Data,
    published: Option<bool>,
    date_published: Option<DateTime<Utc>>,
    record_id: Option<String>,
    context_id: Option<String>,
    permission_grant_id: Option<String>,
    encryption: Option<EncryptionProperty>,
    existing: Option<Box<Write>>,
}

impl WriteBuilder {
    /// Returns a new [`WriteBuilder`] for a record's initial write.
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Utc::now(),
            ..Self::default()
        }
    }

    /// Returns a [`WriteBuilder`] prefilled to update an existing record:
    /// identity and immutable properties are carried over, and the existing
    /// payload is referenced unless new data is provided.
    #[must_use]
    pub fn from(existing: Write) -> Self {
        let desc = &existing.descriptor;
        Self {
            message_timestamp: Utc::now(),
            date_created: Some(desc.date_created),
            recipient: desc.recipient.clone(),
            protocol: desc.protocol.clone().zip(desc.protocol_path.clone()).map(
                |(protocol, protocol_path)| WriteProtocol {
                    protocol,
                    protocol_path,
                },
            ),
            schema: desc.schema.clone(),
            data_format: Some(desc.data_format.clone()),
            data: Data::Cid {
                data_cid: desc.data_cid.clone(),
                data_size: desc.data_size,
            },
            published: desc.published,
            date_published: desc.date_published,
            record_id: Some(existing.record_id.clone()),
            context_id: existing.context_id.clone(),
            existing: Some(Box::new(existing)),
            ..Self::default()
        }
    }

    /// Specify the record's payload.
    #[must_use]
    pub fn data(mut self, data: Data) -> Self {
        self.data = data;
        self
    }

    /// Specify the DID the record is addressed to.
    #[must_use]
    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Make the record a protocol record.
    #[must_use]
    pub fn protocol(mut self, protocol: WriteProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Specify the parent's context id, making the record a child within a
    /// protocol context.
    #[must_use]
    pub fn parent_context_id(mut self, parent_context_id: impl Into<String>) -> Self {
        self.parent_context_id = Some(parent_context_id.into());
        self
    }

    /// Specify the record's schema URI.
    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Specify the payload's MIME type. Defaults to
    /// `application/octet-stream`.
    #[must_use]
    pub fn data_format(mut self, data_format: impl Into<String>) -> Self {
        self.data_format = Some(data_format.into());
        self
    }

    /// Publish (or unpublish) the record.
    #[must_use]
    pub const fn published(mut self, published: bool) -> Self {
        self.published = Some(published);
        self
    }

    /// The datetime the record was published. Defaults to now when the
    /// record is published.
    #[must_use]
    pub const fn date_published(mut self, date_published: DateTime<Utc>) -> Self {
        self.date_published = Some(date_published);
        self
    }

    /// The datetime the message was created. Defaults to now.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateTime<Utc>) -> Self {
        self.message_timestamp = message_timestamp;
        self
    }

    /// The datetime the record was created. Defaults to the message
    /// timestamp.
    #[must_use]
    pub const fn date_created(mut self, date_created: DateTime<Utc>) -> Self {
        self.date_created = Some(date_created);
        self
    }

    /// Specify a permission grant ID to invoke with the write.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Attach an encryption property describing how the payload was
    /// encrypted.
    #[must_use]
    pub fn encryption(mut self, encryption: EncryptionProperty) -> Self {
        self.encryption = Some(encryption);
        self
    }

    /// Generate the Write message, signing with `signer` and optionally
    /// attesting with `attester`.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is inconsistent or signing
    /// fails.
    pub async fn build_attested(
        self, signer: &impl Signer, attester: Option<&impl Signer>,
    ) -> Result<Write> {
        let verification_method = signer.verification_method();
        let Some((author, _)) = verification_method.split_once('#') else {
            return Err(bad_request!("invalid verification method"));
        };

        let (data_cid, data_size) = match &self.data {
            Data::Stream(stream) => {
                let (cid, size) = stream.compute_cid()?;
                (cid, size as u64)
            }
            Data::Cid { data_cid, data_size } => (data_cid.clone(), *data_size),
        };

        let published = self.published;
        let date_published = if published == Some(true) {
            Some(self.date_published.unwrap_or(self.message_timestamp))
        } else {
            None
        };

        let descriptor = WriteDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Write,
                message_timestamp: self.message_timestamp,
            },
            recipient: self.recipient,
            protocol: match &self.protocol {
                Some(write_protocol) => Some(utils::clean_url(&write_protocol.protocol)?),
                None => None,
            },
            protocol_path: self.protocol.as_ref().map(|p| p.protocol_path.clone()),
            schema: match &self.schema {
                Some(schema) => Some(utils::clean_url(schema)?),
                None => None,
            },
            parent_id: self
                .parent_context_id
                .as_ref()
                .and_then(|context| context.rsplit('/').next().map(ToString::to_string))
                .or_else(|| {
                    self.existing.as_ref().and_then(|w| w.descriptor.parent_id.clone())
                }),
            data_cid,
            data_size,
            data_format: self
                .data_format
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            date_created: self.date_created.unwrap_or(self.message_timestamp),
            published,
            date_published,
        };

        let record_id = match self.record_id {
            Some(record_id) => record_id,
            None => entry_id(&descriptor, author)?,
        };

        let context_id = if descriptor.protocol.is_some() {
            match (self.context_id, &self.parent_context_id) {
                (Some(context_id), _) => Some(context_id),
                (None, Some(parent_context)) => Some(format!("{parent_context}/{record_id}")),
                (None, None) => Some(record_id.clone()),
            }
        } else {
            None
        };

        let (attestation, attestation_cid) = if let Some(attester) = attester {
            let attestation = Attestation::sign(&cid::from_value(&descriptor)?, attester).await?;
            let attestation_cid = cid::from_value(&attestation)?;
            (Some(attestation), Some(attestation_cid))
        } else {
            (None, None)
        };

        let mut builder = AuthorizationBuilder::new()
            .descriptor_cid(cid::from_value(&descriptor)?)
            .record_id(&record_id);
        if let Some(context_id) = &context_id {
            builder = builder.context_id(context_id);
        }
        if let Some(attestation_cid) = attestation_cid {
            builder = builder.attestation_cid(attestation_cid);
        }
        if let Some(encryption) = &self.encryption {
            builder = builder.encryption_cid(cid::from_value(encryption)?);
        }
        if let Some(grant_id) = self.permission_grant_id {
            builder = builder.permission_grant_id(grant_id);
        }
        let authorization = builder.build(signer).await?;

        Ok(Write {
            record_id,
            context_id,
            descriptor,
            authorization,
            attestation,
            encryption: self.encryption,
            encoded_data: None,
            data_stream: match self.data {
                Data::Stream(stream) => Some(stream),
                Data::Cid { .. } => None,
            },
        })
    }

    /// Generate the Write message.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is inconsistent or signing
    /// fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Write> {
        self.build_attested(signer, None::<&NoSigner>).await
    }
}

// Placeholder for the unattested path's generic parameter.
struct NoSigner;

impl Signer for NoSigner {
    async fn try_sign(&self, _: &[u8]) -> anyhow::Result<Vec<u8>> {
        unreachable!("no signer configured")
    }

    fn verification_method(&self) -> String {
        unreachable!("no signer configured")
    }
}
