//! # Protocols Configure
//!
//! The protocols configure endpoint handles `ProtocolsConfigure` messages —
//! requests to install (or replace) a protocol definition for a tenant.
//! The newest configuration for a protocol URI wins; older configurations
//! are pruned.

use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::error::{Error, Result};
use crate::protocols::{Actor, Definition};
use crate::provider::{EventStream, Provider, Signer};
use crate::store::{Entry, ProtocolsQueryBuilder};
use crate::{Descriptor, Interface, Method, bad_request, cid, forbidden, permissions, store,
    utils};

/// Handle — or process — a [`Configure`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails, the
/// definition is malformed, or a newer configuration already exists.
pub async fn handle(
    owner: &str, configure: Configure, provider: &impl Provider,
) -> Result<Reply<ConfigureReply>> {
    configure.authorize(owner, provider).await?;
    verify_structure(&configure.descriptor.definition)?;

    // fetch existing configurations for the protocol
    let query = ProtocolsQueryBuilder::new()
        .protocol(&configure.descriptor.definition.protocol)
        .build();
    let (existing, _) = store::message::query(owner, &query, provider).await?;

    // the incoming configuration must be the newest
    let incoming_cid = configure.cid()?;
    let incoming = (configure.descriptor.base.message_timestamp.timestamp_micros(),
        incoming_cid.clone());
    for entry in &existing {
        let entry_key = (entry.descriptor().message_timestamp.timestamp_micros(), entry.cid()?);
        if entry_key >= incoming {
            return Err(Error::Conflict("a more recent configuration exists".to_string()));
        }
    }

    let entry = Entry::from(&configure);
    store::message::put(owner, &entry, provider).await?;
    store::event_log::append(owner, &entry, provider).await?;

    // prune superseded configurations
    for superseded in &existing {
        let superseded_cid = superseded.cid()?;
        store::message::delete(owner, &superseded_cid, provider).await?;
        store::event_log::delete(owner, &superseded_cid, provider).await?;
    }

    if let Err(e) = EventStream::emit(provider, owner, &entry).await {
        tracing::warn!(owner, "issue emitting configure event: {e}");
    }

    Ok(Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: None,
        },
        body: Some(ConfigureReply { message: configure }),
    })
}

/// The [`Configure`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Configure {
    /// The Configure descriptor.
    pub descriptor: ConfigureDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
}

impl Message for Configure {
    type Reply = ConfigureReply;

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

impl Configure {
    /// Build flattened indexes for the configure message.
    #[must_use]
    pub(crate) fn build_indexes(&self) -> Map<String, Value> {
        use chrono::SecondsFormat::Micros;

        let mut indexes = Map::new();
        indexes.insert("interface".to_string(), Value::String(Interface::Protocols.to_string()));
        indexes.insert("method".to_string(), Value::String(Method::Configure.to_string()));
        indexes.insert(
            "messageTimestamp".to_string(),
            Value::String(self.descriptor.base.message_timestamp.to_rfc3339_opts(Micros, true)),
        );
        indexes.insert(
            "author".to_string(),
            Value::String(self.authorization.author().unwrap_or_default()),
        );
        indexes.insert(
            "protocol".to_string(),
            Value::String(self.descriptor.definition.protocol.clone()),
        );
        indexes.insert("published".to_string(), Value::Bool(self.descriptor.definition.published));
        indexes
    }

    /// Check the message has sufficient privileges: the tenant configures
    /// freely, anyone else needs a grant scoped to protocol configuration.
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        let author = self.authorization.author()?;
        if author == owner {
            return Ok(());
        }

        let Some(grant_id) = self.authorization.payload()?.permission_grant_id else {
            return Err(forbidden!("author has no grant"));
        };
        let grant = permissions::fetch_grant(owner, &grant_id, provider).await?;
        grant.verify(owner, &author, self.descriptor(), provider).await?;

        // when the grant scope carries no protocol it is unrestricted
        if let Some(protocol) = &grant.descriptor.scope.protocol {
            if protocol != &self.descriptor.definition.protocol {
                return Err(forbidden!("message protocol does not match grant protocol"));
            }
        }

        Ok(())
    }
}

/// [`ConfigureReply`] is returned by the handler in the [`Reply`] `body`
/// field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ConfigureReply {
    /// The configuration as stored.
    pub message: Configure,
}

/// The [`Configure`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The protocol definition.
    pub definition: Definition,
}

// Validates the definition's structure tree: every node must be a declared
// type, nesting is bounded, and each node's action rules must be coherent.
fn verify_structure(definition: &Definition) -> Result<()> {
    let types = definition.types.keys().collect::<Vec<&String>>();

    for (name, rule_set) in &definition.structure {
        verify_rule_set(name, rule_set, &types, 1)?;
    }

    Ok(())
}

fn verify_rule_set(
    protocol_path: &str, rule_set: &super::RuleSet, types: &[&String], depth: usize,
) -> Result<()> {
    // restrict nesting depth
    if depth > 10 {
        return Err(bad_request!("record nesting depth exceeds 10 levels"));
    }

    let Some(type_name) = protocol_path.split('/').next_back() else {
        return Err(bad_request!("missing type name"));
    };
    if !types.iter().any(|t| t.as_str() == type_name) {
        return Err(bad_request!("rule set {type_name} is not a declared type"));
    }

    let empty = Vec::new();
    let mut rule_iter = rule_set.actions.as_ref().unwrap_or(&empty).iter();

    while let Some(rule) = rule_iter.next() {
        // when `who` is `anyone`, `of` cannot be set
        if rule.who == Actor::Anyone && rule.of.is_some() {
            return Err(bad_request!(
                "`of` must not be set when `who` is \"anyone\" for {protocol_path}"
            ));
        }

        // when `who` is `author`, `of` must be set
        if rule.who == Actor::Author && rule.of.is_none() {
            return Err(bad_request!("`of` must be set when `who` is \"author\""));
        }

        // no two rules may share the same `who` + `of` + `can` combination
        for other in rule_iter.clone() {
            if rule == other {
                return Err(bad_request!(
                    "duplicate action rule within rule set {protocol_path}"
                ));
            }
        }
    }

    for (name, nested) in &rule_set.structure {
        let nested_path = format!("{protocol_path}/{name}");
        verify_rule_set(&nested_path, nested, types, depth + 1)?;
    }

    Ok(())
}

/// Options to use when creating a protocol configuration.
#[derive(Clone, Debug, Default)]
pub struct ConfigureBuilder {
    message_timestamp: DateTime<Utc>,
    definition: Option<Definition>,
    permission_grant_id: Option<String>,
}

/// Builder for creating a protocol configuration.
impl ConfigureBuilder {
    /// Returns a new [`ConfigureBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Utc::now(),
            ..Self::default()
        }
    }

    /// Specify the protocol's definition.
    #[must_use]
    pub fn definition(mut self, definition: Definition) -> Self {
        self.definition = Some(definition);
        self
    }

    /// Specify a permission grant ID to invoke with the configuration.
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

    /// Generate the Configure message.
    ///
    /// # Errors
    ///
    /// Returns an error when the definition is missing or malformed, or
    /// signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Configure> {
        let Some(mut definition) = self.definition else {
            return Err(bad_request!("definition not set"));
        };

        // normalize definition urls
        definition.protocol = utils::clean_url(&definition.protocol)?;
        for t in definition.types.values_mut() {
            if let Some(schema) = &t.schema {
                t.schema = Some(utils::clean_url(schema)?);
            }
        }
        verify_structure(&definition)?;

        let descriptor = ConfigureDescriptor {
            base: Descriptor {
                interface: Interface::Protocols,
                method: Method::Configure,
                message_timestamp: self.message_timestamp,
            },
            definition,
        };

        let mut builder = AuthorizationBuilder::new().descriptor_cid(cid::from_value(&descriptor)?);
        if let Some(id) = self.permission_grant_id {
            builder = builder.permission_grant_id(id);
        }
        let authorization = builder.build(signer).await?;

        Ok(Configure {
            descriptor,
            authorization,
        })
    }
}
