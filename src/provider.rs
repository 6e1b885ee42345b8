//! # Provider
//!
//! Traits implemented by the host to supply storage, DID resolution, event
//! transport, and signing. Handlers receive a single [`Provider`] and no
//! other ambient services.

#![allow(async_fn_in_trait)]

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::event::{Event, SubscribeFilter, Subscriber};

/// The full set of capabilities a web node requires of its host. Providers
/// are owned services: read replies hold a clone of the provider to stream
/// payload chunks on demand.
pub trait Provider:
    BlockStore + KvStore + EventStream + DidResolver + Clone + Send + Sync + 'static
{
}

/// The `BlockStore` trait is used by implementers to provide content-
/// addressed block storage, partitioned by tenant.
pub trait BlockStore: Send + Sync {
    /// Store a block keyed by CID.
    async fn put(&self, owner: &str, cid: &str, block: &[u8]) -> Result<()>;

    /// Fetch a single block by CID, returning `None` if no match was found.
    async fn get(&self, owner: &str, cid: &str) -> Result<Option<Vec<u8>>>;

    /// Delete the block for the specified CID.
    async fn delete(&self, owner: &str, cid: &str) -> Result<()>;

    /// Purge all blocks from the store. Test-only.
    async fn purge(&self) -> Result<()>;
}

/// The `KvStore` trait is used by implementers to provide a sorted
/// key-value engine with prefix iteration, partitioned by tenant. The
/// secondary index, data reference counts, and event log are built on it.
pub trait KvStore: Send + Sync {
    /// Store a value under the given key.
    async fn put(&self, owner: &str, key: &str, value: &[u8]) -> Result<()>;

    /// Fetch the value stored under the given key.
    async fn get(&self, owner: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete the entry for the given key. Deleting a missing key is a no-op.
    async fn delete(&self, owner: &str, key: &str) -> Result<()>;

    /// Return all entries with `lower <= key < upper` in ascending key
    /// order.
    async fn range(&self, owner: &str, lower: &str, upper: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Purge all entries from the store. Test-only.
    async fn purge(&self) -> Result<()>;
}

/// The `EventStream` trait is used by implementers to provide per-tenant
/// publish/subscribe of committed events.
pub trait EventStream: Send + Sync {
    /// Subscribe to a tenant's event stream, receiving events matching the
    /// filter.
    async fn subscribe(&self, owner: &str, filter: SubscribeFilter) -> Result<Subscriber>;

    /// Emit an event to a tenant's event stream. Called after commit;
    /// delivery is best-effort.
    async fn emit(&self, owner: &str, event: &Event) -> Result<()>;
}

/// The `DidResolver` trait is used by implementers to resolve a DID to its
/// DID document, from which signature verification keys are drawn.
pub trait DidResolver: Send + Sync {
    /// Resolve the DID URL to a DID document.
    async fn resolve(&self, url: &str) -> Result<Document>;
}

/// The `Signer` trait provides a detached signing function used when
/// constructing messages. Verification is done by the node against the
/// signer's resolved DID document.
pub trait Signer: Send + Sync {
    /// Sign the message bytes, returning the raw signature.
    async fn try_sign(&self, msg: &[u8]) -> Result<Vec<u8>>;

    /// The verification method (`did#key-id`) to place in the signature's
    /// `kid` header.
    fn verification_method(&self) -> String;

    /// The signing algorithm.
    fn algorithm(&self) -> Algorithm {
        Algorithm::EdDsa
    }
}

/// Signing algorithms supported by the envelope.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, derive_more::Display)]
pub enum Algorithm {
    /// Edwards-curve digital signature (Ed25519).
    #[default]
    #[serde(rename = "EdDSA")]
    #[display("EdDSA")]
    EdDsa,
}

/// A (partial) DID document: the verification methods needed to verify
/// message signatures.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// The DID the document describes.
    pub id: String,

    /// Verification methods (public keys) bound to the DID.
    #[serde(default)]
    pub verification_method: Vec<VerificationMethod>,
}

impl Document {
    /// Find the verification method referenced by a `kid` header, accepting
    /// either an absolute (`did#key`) or relative (`#key`) reference.
    #[must_use]
    pub fn verification_method(&self, kid: &str) -> Option<&VerificationMethod> {
        let fragment = kid.split_once('#').map_or(kid, |(_, f)| f);
        self.verification_method
            .iter()
            .find(|vm| vm.id == kid || vm.id.split_once('#').map(|(_, f)| f) == Some(fragment))
    }
}

/// A DID document verification method.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    /// The method's id: the controlling DID plus a key fragment.
    pub id: String,

    /// The method type, e.g. `JsonWebKey2020`.
    #[serde(rename = "type")]
    pub method_type: String,

    /// The DID controlling the key.
    pub controller: String,

    /// The public key in JWK form.
    pub public_key_jwk: PublicKeyJwk,
}

/// A public key in JSON Web Key form.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyJwk {
    /// Key type, e.g. `OKP`.
    pub kty: String,

    /// Curve, e.g. `Ed25519` or `X25519`.
    pub crv: String,

    /// The base64url-encoded public key.
    pub x: String,

    /// Second coordinate for curves that require one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}
