//! # Record Encryption
//!
//! End-to-end payload encryption. The payload is sealed once with a random
//! content encryption key; that key is then sealed separately for each
//! recipient using an ephemeral X25519 agreement, one entry per key
//! derivation scheme. The node stores the envelope without being able to
//! read the payload.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64ct::{Base64UrlUnpadded, Encoding};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::Result;
use crate::provider::PublicKeyJwk;
use crate::{bad_request, unexpected};

/// The hierarchical key derivation scheme a recipient key was derived
/// under.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum KeyDerivationScheme {
    /// Key derived from the record's data format.
    #[default]
    DataFormats,

    /// Key derived from the record's schema.
    Schemas,

    /// Key derived from the record's protocol path.
    ProtocolPath,

    /// Key derived from the record's protocol context.
    ProtocolContext,
}

/// The `encryption` property of a record write: the payload's
/// initialization vector plus the content key sealed for each recipient.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionProperty {
    /// The base64url-encoded initialization vector the payload was sealed
    /// with.
    pub initialization_vector: String,

    /// The content key sealed for each recipient, one entry per derivation
    /// scheme.
    pub key_encryption: Vec<EncryptedKey>,
}

/// A content encryption key sealed to a single recipient key.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedKey {
    /// The id of the recipient's root key.
    pub root_key_id: String,

    /// The derivation scheme the recipient key was derived under.
    pub derivation_scheme: KeyDerivationScheme,

    /// The base64url-encoded initialization vector the content key was
    /// sealed with.
    pub initialization_vector: String,

    /// The ephemeral agreement public key.
    pub ephemeral_public_key: PublicKeyJwk,

    /// The base64url-encoded sealed content key.
    pub encrypted_key: String,
}

/// A recipient to seal the content key for.
#[derive(Clone, Debug, Default)]
pub struct Recipient {
    /// The id of the recipient's root key.
    pub key_id: String,

    /// The recipient's X25519 public key.
    pub public_key: PublicKeyJwk,

    /// The derivation scheme the key was derived under.
    pub derivation_scheme: KeyDerivationScheme,
}

/// Options for sealing a record payload.
#[derive(Clone, Debug, Default)]
pub struct EncryptOptions {
    recipients: Vec<Recipient>,
}

impl EncryptOptions {
    /// Returns a new [`EncryptOptions`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a recipient to seal the content key for.
    #[must_use]
    pub fn with_recipient(mut self, recipient: Recipient) -> Self {
        self.recipients.push(recipient);
        self
    }

    /// Seal the payload, returning the ciphertext and the encryption
    /// property to attach to the write.
    ///
    /// # Errors
    ///
    /// Returns an error when a recipient key is malformed or sealing fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(EncryptionProperty, Vec<u8>)> {
        if self.recipients.is_empty() {
            return Err(bad_request!("no recipients to seal the content key for"));
        }

        let mut cek = [0u8; 32];
        OsRng.fill_bytes(&mut cek);
        let mut iv = [0u8; 12];
        OsRng.fill_bytes(&mut iv);

        let cipher = Aes256Gcm::new((&cek).into());
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| unexpected!("issue encrypting payload"))?;

        let mut key_encryption = vec![];
        for recipient in &self.recipients {
            key_encryption.push(seal_key(&cek, recipient)?);
        }
        cek.zeroize();

        let property = EncryptionProperty {
            initialization_vector: Base64UrlUnpadded::encode_string(&iv),
            key_encryption,
        };

        Ok((property, ciphertext))
    }
}

// Seal the content key to a recipient using an ephemeral X25519 agreement
// and an HKDF-derived key encryption key.
fn seal_key(cek: &[u8; 32], recipient: &Recipient) -> Result<EncryptedKey> {
    let recipient_key = decode_x25519(&recipient.public_key)?;

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient_key);

    let mut kek = derive_kek(shared.as_bytes(), &recipient.derivation_scheme)?;

    let mut iv = [0u8; 12];
    OsRng.fill_bytes(&mut iv);
    let cipher = Aes256Gcm::new((&kek).into());
    let sealed = cipher
        .encrypt(Nonce::from_slice(&iv), cek.as_slice())
        .map_err(|_| unexpected!("issue sealing content key"))?;
    kek.zeroize();

    Ok(EncryptedKey {
        root_key_id: recipient.key_id.clone(),
        derivation_scheme: recipient.derivation_scheme.clone(),
        initialization_vector: Base64UrlUnpadded::encode_string(&iv),
        ephemeral_public_key: PublicKeyJwk {
            kty: "OKP".to_string(),
            crv: "X25519".to_string(),
            x: Base64UrlUnpadded::encode_string(ephemeral_public.as_bytes()),
            y: None,
        },
        encrypted_key: Base64UrlUnpadded::encode_string(&sealed),
    })
}

/// Unseal a record payload with the recipient's X25519 secret key,
/// identified by `root_key_id`.
///
/// # Errors
///
/// Returns an error when no envelope entry matches the key id or the
/// ciphertext fails to open.
pub fn decrypt(
    property: &EncryptionProperty, root_key_id: &str, secret_key: &[u8; 32], ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let Some(entry) = property.key_encryption.iter().find(|k| k.root_key_id == root_key_id)
    else {
        return Err(bad_request!("no sealed key for root key {root_key_id}"));
    };

    let ephemeral_public = decode_x25519(&entry.ephemeral_public_key)?;
    let secret = StaticSecret::from(*secret_key);
    let shared = secret.diffie_hellman(&ephemeral_public);

    let mut kek = derive_kek(shared.as_bytes(), &entry.derivation_scheme)?;

    let sealed = Base64UrlUnpadded::decode_vec(&entry.encrypted_key)?;
    let key_iv = Base64UrlUnpadded::decode_vec(&entry.initialization_vector)?;
    let cipher = Aes256Gcm::new((&kek).into());
    let mut cek = cipher
        .decrypt(Nonce::from_slice(&key_iv), sealed.as_slice())
        .map_err(|_| bad_request!("issue unsealing content key"))?;
    kek.zeroize();

    let cek_bytes: [u8; 32] =
        cek.as_slice().try_into().map_err(|_| bad_request!("invalid content key"))?;
    let iv = Base64UrlUnpadded::decode_vec(&property.initialization_vector)?;
    let cipher = Aes256Gcm::new((&cek_bytes).into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext)
        .map_err(|_| bad_request!("issue decrypting payload"))?;
    cek.zeroize();

    Ok(plaintext)
}

fn derive_kek(shared: &[u8], scheme: &KeyDerivationScheme) -> Result<[u8; 32]> {
    let info = match scheme {
        KeyDerivationScheme::DataFormats => b"dataFormats".as_slice(),
        KeyDerivationScheme::Schemas => b"schemas".as_slice(),
        KeyDerivationScheme::ProtocolPath => b"protocolPath".as_slice(),
        KeyDerivationScheme::ProtocolContext => b"protocolContext".as_slice(),
    };

    let hkdf = Hkdf::<Sha256>::new(None, shared);
    let mut kek = [0u8; 32];
    hkdf.expand(info, &mut kek).map_err(|_| unexpected!("issue deriving key"))?;
    Ok(kek)
}

fn decode_x25519(jwk: &PublicKeyJwk) -> Result<PublicKey> {
    if jwk.crv != "X25519" {
        return Err(bad_request!("unsupported agreement curve {}", jwk.crv));
    }
    let bytes = Base64UrlUnpadded::decode_vec(&jwk.x)?;
    let bytes: [u8; 32] =
        bytes.try_into().map_err(|_| bad_request!("invalid agreement key length"))?;
    Ok(PublicKey::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_unseal() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        let recipient = Recipient {
            key_id: "did:example:bob#key-x".to_string(),
            public_key: PublicKeyJwk {
                kty: "OKP".to_string(),
                crv: "X25519".to_string(),
                x: Base64UrlUnpadded::encode_string(public.as_bytes()),
                y: None,
            },
            derivation_scheme: KeyDerivationScheme::Schemas,
        };

        let options = EncryptOptions::new().with_recipient(recipient);
        let (property, ciphertext) = options.encrypt(b"a private payload").unwrap();
        assert_ne!(ciphertext.as_slice(), b"a private payload");
        assert_eq!(property.key_encryption.len(), 1);

        let plaintext =
            decrypt(&property, "did:example:bob#key-x", secret.as_bytes(), &ciphertext).unwrap();
        assert_eq!(plaintext, b"a private payload");
    }

    #[test]
    fn unseal_with_wrong_key_fails() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        let recipient = Recipient {
            key_id: "did:example:bob#key-x".to_string(),
            public_key: PublicKeyJwk {
                kty: "OKP".to_string(),
                crv: "X25519".to_string(),
                x: Base64UrlUnpadded::encode_string(public.as_bytes()),
                y: None,
            },
            derivation_scheme: KeyDerivationScheme::ProtocolPath,
        };

        let options = EncryptOptions::new().with_recipient(recipient);
        let (property, ciphertext) = options.encrypt(b"a private payload").unwrap();

        let wrong = StaticSecret::random_from_rng(OsRng);
        let result = decrypt(&property, "did:example:bob#key-x", wrong.as_bytes(), &ciphertext);
        assert!(result.is_err());
    }
}
