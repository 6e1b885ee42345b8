//! # Permissions Grant
//!
//! The permissions grant endpoint handles `PermissionsGrant` messages —
//! requests to delegate a scoped capability from the tenant to another DID.
//! Stored grants are evaluated when a message invokes them by CID.

use chrono::{DateTime, Duration, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::error::Result;
use crate::permissions::{ConditionPublication, Conditions, Scope, is_revoked};
use crate::provider::{BlockStore, EventStream, KvStore, Provider, Signer};
use crate::records::{RecordsFilter, Write};
use crate::store::Entry;
use crate::{Descriptor, Interface, Method, bad_request, cid, forbidden, store, unexpected};

/// Handle — or process — a [`Grant`] message.
///
/// # Errors
///
/// The endpoint will return an error when the author is not the tenant or
/// the grant's identities are inconsistent.
pub async fn handle(
    owner: &str, grant: Grant, provider: &impl Provider,
) -> Result<Reply<GrantReply>> {
    let author = grant.authorization.author()?;
    if author != owner {
        return Err(forbidden!("grants must be created by the tenant"));
    }

    let desc = &grant.descriptor;
    if desc.granted_by != author {
        return Err(bad_request!("`grantedBy` must match the grant author"));
    }
    if desc.granted_for != owner {
        return Err(bad_request!("`grantedFor` must be the tenant"));
    }
    if desc.granted_to == author {
        return Err(bad_request!("cannot grant to self"));
    }
    if desc.date_expires <= desc.base.message_timestamp {
        return Err(bad_request!("grant expires before it is created"));
    }

    let entry = Entry::from(&grant);
    store::message::put(owner, &entry, provider).await?;
    store::event_log::append(owner, &entry, provider).await?;

    if let Err(e) = EventStream::emit(provider, owner, &entry).await {
        tracing::warn!(owner, "issue emitting grant event: {e}");
    }

    Ok(Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: None,
        },
        body: Some(GrantReply { message: grant }),
    })
}

/// The [`Grant`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    /// The Grant descriptor.
    pub descriptor: GrantDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
}

impl Message for Grant {
    type Reply = GrantReply;

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

/// [`GrantReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GrantReply {
    /// The grant as stored.
    pub message: Grant,
}

/// The [`Grant`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The DID the capability is granted to.
    pub granted_to: String,

    /// The DID granting the capability: always the tenant.
    pub granted_by: String,

    /// The DID whose web node the grant applies to: always the tenant.
    pub granted_for: String,

    /// When the grant expires. Invocations after this instant fail.
    #[serde(with = "crate::utils::rfc3339_micros")]
    pub date_expires: DateTime<Utc>,

    /// An optional human-readable description of the grant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// The delegated scope.
    pub scope: Scope,

    /// Conditions the invoking message must meet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Conditions>,
}

impl Grant {
    /// Build flattened indexes for the grant message.
    #[must_use]
    pub(crate) fn build_indexes(&self) -> Map<String, Value> {
        use chrono::SecondsFormat::Micros;

        let desc = &self.descriptor;
        let mut indexes = Map::new();
        indexes.insert("interface".to_string(), Value::String(Interface::Permissions.to_string()));
        indexes.insert("method".to_string(), Value::String(Method::Grant.to_string()));
        indexes.insert(
            "messageTimestamp".to_string(),
            Value::String(desc.base.message_timestamp.to_rfc3339_opts(Micros, true)),
        );
        indexes.insert(
            "author".to_string(),
            Value::String(self.authorization.author().unwrap_or_default()),
        );
        indexes.insert("grantedTo".to_string(), Value::String(desc.granted_to.clone()));
        indexes.insert("grantedBy".to_string(), Value::String(desc.granted_by.clone()));
        indexes.insert(
            "dateExpires".to_string(),
            Value::String(desc.date_expires.to_rfc3339_opts(Micros, true)),
        );
        indexes
    }

    /// Verify the grant permits the invoking message: identity, expiry,
    /// revocation, and `(interface, method)` scope. Record- and
    /// condition-level checks are separate.
    ///
    /// # Errors
    ///
    /// Returns `Error::Forbidden` describing the first failing check.
    pub(crate) async fn verify<S: BlockStore + KvStore>(
        &self, owner: &str, author: &str, descriptor: &Descriptor, store: &S,
    ) -> Result<()> {
        let desc = &self.descriptor;

        if desc.granted_by != owner || desc.granted_for != owner {
            return Err(forbidden!("grant was not issued by the tenant"));
        }
        if desc.granted_to != author {
            return Err(forbidden!("grant was not granted to {author}"));
        }

        if descriptor.message_timestamp > desc.date_expires {
            return Err(forbidden!("grant has expired"));
        }
        if is_revoked(owner, &cid::from_value(self)?, store).await? {
            return Err(forbidden!("grant has been revoked"));
        }

        if desc.scope.interface != descriptor.interface {
            return Err(forbidden!(
                "interface {} does not match grant scope interface {}",
                descriptor.interface, desc.scope.interface
            ));
        }
        if desc.scope.method != descriptor.method {
            return Err(forbidden!(
                "method {} does not match grant scope method {}",
                descriptor.method, desc.scope.method
            ));
        }

        Ok(())
    }

    /// Verify the grant's record-level scope against the target record.
    ///
    /// # Errors
    ///
    /// Returns `Error::Forbidden` when a scope constraint fails.
    pub(crate) fn permit_record(&self, write: &Write) -> Result<()> {
        let scope = &self.descriptor.scope;

        if let Some(protocol) = &write.descriptor.protocol {
            if scope.protocol.as_ref() != Some(protocol) {
                return Err(forbidden!("record protocol does not match grant protocol"));
            }
            if let Some(scope_context) = &scope.context_id {
                let context_id = write.context_id.as_deref().unwrap_or_default();
                if !context_id.starts_with(scope_context.as_str()) {
                    return Err(forbidden!("record context is not within grant context"));
                }
            }
            if let Some(scope_path) = &scope.protocol_path {
                if write.descriptor.protocol_path.as_ref() != Some(scope_path) {
                    return Err(forbidden!(
                        "record protocol path does not match grant protocol path"
                    ));
                }
            }
        } else {
            if scope.protocol.is_some() {
                return Err(forbidden!("grant is scoped to a protocol"));
            }
            if let Some(schema) = &scope.schema {
                if write.descriptor.schema.as_ref() != Some(schema) {
                    return Err(forbidden!("record schema does not match grant schema"));
                }
            }
        }

        Ok(())
    }

    /// Enforce the grant's conditions against a record write.
    ///
    /// # Errors
    ///
    /// Returns `Error::Forbidden` when a condition fails.
    pub(crate) fn permit_conditions(&self, write: &Write) -> Result<()> {
        let Some(conditions) = &self.descriptor.conditions else {
            return Ok(());
        };

        let published = write.descriptor.published.unwrap_or_default();
        match conditions.publication {
            Some(ConditionPublication::Required) if !published => {
                Err(forbidden!("grant requires the record to be published"))
            }
            Some(ConditionPublication::Prohibited) if published => {
                Err(forbidden!("grant prohibits publishing the record"))
            }
            _ => Ok(()),
        }
    }

    /// Verify a query or subscribe filter stays within the grant's protocol
    /// scope.
    ///
    /// # Errors
    ///
    /// Returns `Error::Forbidden` when the filter's protocol does not match.
    pub(crate) fn permit_filter(&self, filter: &RecordsFilter) -> Result<()> {
        if let Some(protocol) = &self.descriptor.scope.protocol {
            if filter.protocol.as_ref() != Some(protocol) {
                return Err(forbidden!("filter protocol does not match grant protocol"));
            }
        }
        Ok(())
    }
}

/// Options to use when creating a permission grant.
#[derive(Clone, Debug, Default)]
pub struct GrantBuilder {
    message_timestamp: DateTime<Utc>,
    granted_to: Option<String>,
    date_expires: Option<DateTime<Utc>>,
    description: Option<String>,
    scope: Option<Scope>,
    conditions: Option<Conditions>,
}

/// Builder for creating a permission grant.
impl GrantBuilder {
    /// Returns a new [`GrantBuilder`]. The grant expires in 24 hours unless
    /// told otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Utc::now(),
            ..Self::default()
        }
    }

    /// Specify the DID the capability is granted to.
    #[must_use]
    pub fn granted_to(mut self, granted_to: impl Into<String>) -> Self {
        self.granted_to = Some(granted_to.into());
        self
    }

    /// Specify when the grant expires.
    #[must_use]
    pub const fn date_expires(mut self, date_expires: DateTime<Utc>) -> Self {
        self.date_expires = Some(date_expires);
        self
    }

    /// Describe the grant.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Specify the delegated scope.
    #[must_use]
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Specify conditions the invoking message must meet.
    #[must_use]
    pub fn conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// The datetime the message was created. Defaults to now.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateTime<Utc>) -> Self {
        self.message_timestamp = message_timestamp;
        self
    }

    /// Generate the Grant message.
    ///
    /// # Errors
    ///
    /// Returns an error when required fields are missing or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Grant> {
        let Some(granted_to) = self.granted_to else {
            return Err(unexpected!("`granted_to` not set"));
        };
        let Some(scope) = self.scope else {
            return Err(unexpected!("`scope` not set"));
        };

        let verification_method = signer.verification_method();
        let Some((granted_by, _)) = verification_method.split_once('#') else {
            return Err(unexpected!("invalid verification method"));
        };

        let descriptor = GrantDescriptor {
            base: Descriptor {
                interface: Interface::Permissions,
                method: Method::Grant,
                message_timestamp: self.message_timestamp,
            },
            granted_to,
            granted_by: granted_by.to_string(),
            granted_for: granted_by.to_string(),
            date_expires: self
                .date_expires
                .unwrap_or_else(|| self.message_timestamp + Duration::hours(24)),
            description: self.description,
            scope,
            conditions: self.conditions,
        };

        let authorization = AuthorizationBuilder::new()
            .descriptor_cid(cid::from_value(&descriptor)?)
            .build(signer)
            .await?;

        Ok(Grant {
            descriptor,
            authorization,
        })
    }
}
