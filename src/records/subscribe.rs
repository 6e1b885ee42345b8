//! # Records Subscribe
//!
//! The records subscribe endpoint handles `RecordsSubscribe` messages —
//! requests to install a server-side filter and receive a notification for
//! every subsequently committed write matching it. Dropping the returned
//! subscriber closes the channel and detaches the filter.

use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::error::Result;
use crate::event::Subscriber;
use crate::protocols::Action;
use crate::provider::{EventStream, Provider, Signer};
use crate::records::{RecordsFilter, protocol};
use crate::{Descriptor, Interface, Method, cid, forbidden, permissions};

/// Handle — or process — a [`Subscribe`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// the event stream cannot be subscribed to.
pub async fn handle(
    owner: &str, subscribe: Subscribe, provider: &impl Provider,
) -> Result<Reply<SubscribeReply>> {
    let filter = subscribe.authorize(owner, provider).await?;

    let subscriber = EventStream::subscribe(provider, owner, filter).await?;
    tracing::debug!(owner, subscription = %subscriber.id, "subscription installed");

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(SubscribeReply {
            subscription: subscriber,
        }),
    })
}

/// The [`Subscribe`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscribe {
    /// The Subscribe descriptor.
    pub descriptor: SubscribeDescriptor,

    /// The message authorization. Absent for anonymous subscriptions to
    /// published records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
}

impl Message for Subscribe {
    type Reply = SubscribeReply;

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

/// [`SubscribeReply`] is returned by the handler in the [`Reply`] `body`
/// field.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SubscribeReply {
    /// The installed subscription.
    #[serde(skip)]
    pub subscription: Subscriber,
}

/// The [`Subscribe`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The filter events must match to be delivered.
    pub filter: RecordsFilter,
}

impl Subscribe {
    // Subscribe authorization. Returns the (possibly constrained) filter to
    // install: the tenant and grant holders install their filter as-is,
    // protocol rules admit subscribers within a protocol, and anyone else
    // is constrained to published records.
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<RecordsFilter> {
        let filter = self.descriptor.filter.normalize()?;

        let Some(authzn) = &self.authorization else {
            if filter.published == Some(true) {
                return Ok(filter);
            }
            return Err(forbidden!(
                "anonymous subscriptions are limited to published records"
            ));
        };
        let author = authzn.author()?;

        if author == owner {
            return Ok(filter);
        }

        if let Some(grant_id) = authzn.payload()?.permission_grant_id {
            let grant = permissions::fetch_grant(owner, &grant_id, provider).await?;
            grant.verify(owner, &author, self.descriptor(), provider).await?;
            grant.permit_filter(&filter)?;
            return Ok(filter);
        }

        if filter.protocol.is_some() {
            protocol::permit_query(owner, &author, Action::Subscribe, &filter, provider).await?;
            return Ok(filter);
        }

        if filter.published == Some(true) {
            return Ok(filter);
        }

        Err(forbidden!("subscription cannot be authorized"))
    }
}

/// Options to use when subscribing to record events.
#[derive(Clone, Debug, Default)]
pub struct SubscribeBuilder {
    message_timestamp: DateTime<Utc>,
    filter: RecordsFilter,
    permission_grant_id: Option<String>,
    authorize: Option<bool>,
}

impl SubscribeBuilder {
    /// Returns a new [`SubscribeBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Utc::now(),
            ..Self::default()
        }
    }

    /// Specify the filter events must match.
    #[must_use]
    pub fn filter(mut self, filter: RecordsFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Specify a permission grant ID to invoke with the subscription.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Set to `false` to build an anonymous (unsigned) subscription.
    #[must_use]
    pub const fn authorize(mut self, authorize: bool) -> Self {
        self.authorize = Some(authorize);
        self
    }

    /// Generate the Subscribe message.
    ///
    /// # Errors
    ///
    /// Returns an error when signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Subscribe> {
        let descriptor = SubscribeDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Subscribe,
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

        Ok(Subscribe {
            descriptor,
            authorization,
        })
    }
}
