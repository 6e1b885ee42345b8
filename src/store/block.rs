//! IPLD block encoding: DAG-CBOR, addressed by SHA-256 CIDs elsewhere.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::unexpected;

/// Encode a value as a DAG-CBOR block.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_ipld_dagcbor::to_vec(value).map_err(|e| unexpected!("issue encoding block: {e}"))
}

/// Decode a DAG-CBOR block.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_ipld_dagcbor::from_slice(bytes).map_err(|e| unexpected!("issue decoding block: {e}"))
}
