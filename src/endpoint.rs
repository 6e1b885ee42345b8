//! # Endpoint
//!
//! Decentralized Web Node messaging framework: the single entry point
//! through which all messages are handled.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::authorization::Authorization;
use crate::error::Result;
use crate::provider::Provider;
use crate::{Descriptor, schema};

/// Handle an incoming message: structural validation and signature
/// verification, then dispatch to the message's handler for authorization,
/// reconciliation, and persistence.
///
/// # Errors
///
/// Returns `Error::BadRequest` when the message is malformed,
/// `Error::Unauthorized` when a signature fails verification, and whatever
/// the message's handler surfaces.
pub async fn handle<T>(
    owner: &str, message: impl Message<Reply = T>, provider: &impl Provider,
) -> Result<Reply<T>> {
    message.validate(provider).await?;
    message.handle(owner, provider).await
}

/// Methods common to all messages.
pub trait Message: Serialize + Clone + Debug + Send + Sync {
    /// The message's inner reply type.
    type Reply;

    /// Compute the CID of the message.
    ///
    /// # Errors
    ///
    /// Returns an error when the message cannot be encoded.
    fn cid(&self) -> Result<String>;

    /// The component of the message descriptor common to all messages.
    fn descriptor(&self) -> &Descriptor;

    /// The message's authorization, if signed.
    fn authorization(&self) -> Option<&Authorization>;

    /// Handle the message.
    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>>;

    /// Validation common to all messages: structural (JSON schema) checks
    /// followed by signature verification. Message-specific validation is
    /// done in the message handler.
    async fn validate(&self, provider: &impl Provider) -> Result<()> {
        schema::validate(self)?;
        if let Some(authzn) = self.authorization() {
            authzn.verify(provider).await?;
        }
        Ok(())
    }
}

/// Reply used by all endpoints.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Reply<T> {
    /// Status message to accompany the reply.
    pub status: Status,

    /// Endpoint-specific reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(flatten)]
    pub body: Option<T>,
}

/// Reply status.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Status code.
    pub code: u16,

    /// Status detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
