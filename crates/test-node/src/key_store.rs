//! Deterministic Ed25519 keyrings for well-known test identities.
//!
//! Keys are the RFC 8032 test vectors, so the derived `did:key` identifiers
//! are stable across runs.

use anyhow::Result;
use dwn_core::provider::Signer;
use ed25519_dalek::{Signer as _, SigningKey};

pub const ALICE_DID: &str = "did:key:z6MktwupdmLXVVqTzCw4i46r4uGyosGXRnR3XjN4Zq7oMMsw";
pub const BOB_DID: &str = "did:key:z6MkiaMbhXHNA4eJVCCj8dbzKzTgYDKf6crKgHVHid1F1WCT";
pub const CAROL_DID: &str = "did:key:z6MkwSD8dBdqcXQzKJZQFPy2hh2izzxskndKCjdmC2dBpfME";
pub const ISSUER_DID: &str = "did:key:z6Mkh7U7jBwoMro3UeHmXes4tKtFbZhMRWejbtunbU4hhvjP";

const ALICE_SEED: [u8; 32] = [
    0x9d, 0x61, 0xb1, 0x9d, 0xef, 0xfd, 0x5a, 0x60,
    0xba, 0x84, 0x4a, 0xf4, 0x92, 0xec, 0x2c, 0xc4,
    0x44, 0x49, 0xc5, 0x69, 0x7b, 0x32, 0x69, 0x19,
    0x70, 0x3b, 0xac, 0x03, 0x1c, 0xae, 0x7f, 0x60,
];
const BOB_SEED: [u8; 32] = [
    0x4c, 0xcd, 0x08, 0x9b, 0x28, 0xff, 0x96, 0xda,
    0x9d, 0xb6, 0xc3, 0x46, 0xec, 0x11, 0x4e, 0x0f,
    0x5b, 0x8a, 0x31, 0x9f, 0x35, 0xab, 0xa6, 0x24,
    0xda, 0x8c, 0xf6, 0xed, 0x4f, 0xb8, 0xa6, 0xfb,
];
const CAROL_SEED: [u8; 32] = [
    0xc5, 0xaa, 0x8d, 0xf4, 0x3f, 0x9f, 0x83, 0x7b,
    0xed, 0xb7, 0x44, 0x2f, 0x31, 0xdc, 0xb7, 0xb1,
    0x66, 0xd3, 0x85, 0x35, 0x07, 0x6f, 0x09, 0x4b,
    0x85, 0xce, 0x3a, 0x2e, 0x0b, 0x44, 0x58, 0xf7,
];
const ISSUER_SEED: [u8; 32] = [
    0xf5, 0xe5, 0x76, 0x7c, 0xf1, 0x53, 0x31, 0x95,
    0x17, 0x63, 0x0f, 0x22, 0x68, 0x76, 0xb8, 0x6c,
    0x81, 0x60, 0xcc, 0x58, 0x3b, 0xc0, 0x13, 0x74,
    0x4c, 0x6b, 0xf2, 0x55, 0xf5, 0xcc, 0x0e, 0xe5,
];

/// A signing keyring bound to one of the test identities.
#[derive(Clone)]
pub struct Keyring {
    did: String,
    signing_key: SigningKey,
}

/// Get the keyring for a well-known test DID.
///
/// # Panics
///
/// Panics when the DID is not one of the test identities.
#[must_use]
pub fn keyring(did: &str) -> Keyring {
    let seed = match did {
        ALICE_DID => &ALICE_SEED,
        BOB_DID => &BOB_SEED,
        CAROL_DID => &CAROL_SEED,
        ISSUER_DID => &ISSUER_SEED,
        _ => panic!("no key material for {did}"),
    };

    Keyring {
        did: did.to_string(),
        signing_key: SigningKey::from_bytes(seed),
    }
}

impl Signer for Keyring {
    async fn try_sign(&self, msg: &[u8]) -> Result<Vec<u8>> {
        Ok(self.signing_key.sign(msg).to_bytes().to_vec())
    }

    fn verification_method(&self) -> String {
        // did:key verification methods use the method-specific id as the
        // key fragment
        let fragment = self.did.trim_start_matches("did:key:");
        format!("{}#{fragment}", self.did)
    }
}
