//! # CID (Content Identifier)
//!
//! Every CID is computed from the deterministic CBOR encoding of the target
//! value: SHA-256 multihash, CIDv1, rendered base32 lower unpadded.

use multihash_codetable::{Code, MultihashDigest};
use serde::Serialize;

use crate::bad_request;
use crate::error::Result;

const DAG_CBOR: u64 = 0x71;
const RAW: u64 = 0x55;
const SHA2_256: u64 = 0x12;

/// Compute the CID of a serializable value.
///
/// # Errors
///
/// Returns `Error::BadRequest` when the value cannot be encoded to CBOR.
pub fn from_value<T: Serialize>(value: &T) -> Result<String> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| bad_request!("issue encoding CBOR: {e}"))?;

    let hash = Code::Sha2_256.digest(&buf);
    Ok(cid::Cid::new_v1(DAG_CBOR, hash).to_string())
}

/// Compute the CID of a raw byte payload.
#[must_use]
pub fn from_bytes(bytes: &[u8]) -> String {
    let hash = Code::Sha2_256.digest(bytes);
    cid::Cid::new_v1(RAW, hash).to_string()
}

/// Wrap a pre-computed SHA-256 digest of a raw payload in a CID. Used when
/// the payload is hashed incrementally while streaming.
///
/// # Errors
///
/// Returns `Error::BadRequest` when `digest` is not 32 bytes.
pub fn from_digest(digest: &[u8]) -> Result<String> {
    let hash = cid::multihash::Multihash::<64>::wrap(SHA2_256, digest)
        .map_err(|e| bad_request!("issue wrapping digest: {e}"))?;
    Ok(cid::Cid::new_v1(RAW, hash).to_string())
}
