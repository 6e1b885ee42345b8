//! # Authorization
//!
//! Message authorization: a general-JWS envelope whose payload commits to
//! the descriptor CID (and, for records, the record identity). Signatures
//! are verified against the signer's resolved DID document.

use base64ct::{Base64UrlUnpadded, Encoding};
use ed25519_dalek::{Verifier, VerifyingKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::provider::{DidResolver, Signer};
use crate::{bad_request, unexpected};

/// A general-JWS structure carrying a detached, base64url-encoded payload
/// and one signature per signer.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Jws {
    /// The base64url-encoded payload.
    pub payload: String,

    /// One entry per signer.
    pub signatures: Vec<JwsSignature>,
}

/// A single signature within a [`Jws`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct JwsSignature {
    /// The base64url-encoded signature header (`alg`, `kid`).
    pub protected: String,

    /// The base64url-encoded signature over `protected`.`payload`.
    pub signature: String,
}

/// The decoded `protected` header of a signature.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Protected {
    /// The signing algorithm.
    pub alg: String,

    /// The signer's verification method: `did#key-id`.
    pub kid: String,
}

impl Jws {
    /// Serialize and sign `payload`, producing an envelope with a single
    /// signature.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload cannot be serialized or the signer
    /// fails to sign.
    pub async fn sign<T: Serialize>(payload: &T, signer: &impl Signer) -> Result<Self> {
        let payload_bytes = serde_json::to_vec(payload)
            .map_err(|e| unexpected!("issue serializing payload: {e}"))?;
        let payload = Base64UrlUnpadded::encode_string(&payload_bytes);

        let protected = Protected {
            alg: signer.algorithm().to_string(),
            kid: signer.verification_method(),
        };
        let protected_bytes = serde_json::to_vec(&protected)
            .map_err(|e| unexpected!("issue serializing header: {e}"))?;
        let protected = Base64UrlUnpadded::encode_string(&protected_bytes);

        let signing_input = format!("{protected}.{payload}");
        let signature = signer
            .try_sign(signing_input.as_bytes())
            .await
            .map_err(|e| unexpected!("issue signing message: {e}"))?;

        Ok(Self {
            payload,
            signatures: vec![JwsSignature {
                protected,
                signature: Base64UrlUnpadded::encode_string(&signature),
            }],
        })
    }

    /// Decode the payload into the expected type.
    ///
    /// # Errors
    ///
    /// Returns `Error::BadRequest` when the payload cannot be decoded.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = Base64UrlUnpadded::decode_vec(&self.payload)
            .map_err(|e| bad_request!("issue decoding payload: {e}"))?;
        serde_json::from_slice(&bytes).map_err(|e| bad_request!("issue decoding payload: {e}"))
    }

    /// The DID of the signer at `index`, extracted from the signature's
    /// `kid` header.
    ///
    /// # Errors
    ///
    /// Returns an error when no signature exists at `index` or the header
    /// carries no DID.
    pub fn did(&self, index: usize) -> Result<String> {
        let Some(signature) = self.signatures.get(index) else {
            return Err(Error::Unauthorized("no signature found".to_string()));
        };
        let protected = signature.decode_protected()?;
        let Some((did, _)) = protected.kid.split_once('#') else {
            return Err(Error::Unauthorized(format!("invalid signer `kid`: {}", protected.kid)));
        };
        Ok(did.to_string())
    }

    /// Verify every signature against the signer's resolved DID document,
    /// returning the signer DIDs.
    ///
    /// # Errors
    ///
    /// Returns `Error::Unauthorized` when any signature fails verification,
    /// a signer cannot be resolved, or a verification key is missing.
    pub async fn verify(&self, resolver: &impl DidResolver) -> Result<Vec<String>> {
        if self.signatures.is_empty() {
            return Err(Error::Unauthorized("message has no signatures".to_string()));
        }

        let mut signers = vec![];
        for signature in &self.signatures {
            let protected = signature.decode_protected()?;
            let Some((did, _)) = protected.kid.split_once('#') else {
                return Err(Error::Unauthorized(format!(
                    "invalid signer `kid`: {}",
                    protected.kid
                )));
            };

            let document = resolver.resolve(did).await.map_err(|e| {
                Error::Unauthorized(format!("unable to resolve signer {did}: {e}"))
            })?;
            let Some(method) = document.verification_method(&protected.kid) else {
                return Err(Error::Unauthorized(format!(
                    "no verification key for {}",
                    protected.kid
                )));
            };

            let key = decode_key(&method.public_key_jwk.x)?;
            let signing_input = format!("{}.{}", signature.protected, self.payload);
            let bytes = Base64UrlUnpadded::decode_vec(&signature.signature)
                .map_err(|e| Error::Unauthorized(format!("issue decoding signature: {e}")))?;
            let signature = ed25519_dalek::Signature::from_slice(&bytes)
                .map_err(|e| Error::Unauthorized(format!("malformed signature: {e}")))?;

            key.verify(signing_input.as_bytes(), &signature)
                .map_err(|_| Error::Unauthorized(format!("signature failed for {did}")))?;

            signers.push(did.to_string());
        }

        Ok(signers)
    }
}

impl JwsSignature {
    fn decode_protected(&self) -> Result<Protected> {
        let bytes = Base64UrlUnpadded::decode_vec(&self.protected)
            .map_err(|e| bad_request!("issue decoding header: {e}"))?;
        serde_json::from_slice(&bytes).map_err(|e| bad_request!("issue decoding header: {e}"))
    }
}

fn decode_key(x: &str) -> Result<VerifyingKey> {
    let bytes = Base64UrlUnpadded::decode_vec(x)
        .map_err(|e| Error::Unauthorized(format!("issue decoding key: {e}")))?;
    let bytes: [u8; 32] =
        bytes.try_into().map_err(|_| Error::Unauthorized("invalid key length".to_string()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| Error::Unauthorized(format!("invalid verification key: {e}")))
}

/// Message authorization: the JWS envelope carried in a message's
/// `authorization` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Authorization {
    /// The envelope itself.
    #[serde(flatten)]
    pub signature: Jws,
}

impl Authorization {
    /// The message author: the DID of the first (and, here, only) signer.
    ///
    /// # Errors
    ///
    /// Returns an error when the envelope carries no valid signer.
    pub fn author(&self) -> Result<String> {
        self.signature.did(0)
    }

    /// Decode the signed payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::BadRequest` when the payload cannot be decoded.
    pub fn payload(&self) -> Result<JwsPayload> {
        self.signature.payload()
    }

    /// Verify all signatures. See [`Jws::verify`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Unauthorized` when verification fails.
    pub async fn verify(&self, resolver: &impl DidResolver) -> Result<()> {
        self.signature.verify(resolver).await.map(|_| ())
    }
}

/// The signed payload of a message's `authorization`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JwsPayload {
    /// The CID of the message descriptor being authorized.
    pub descriptor_cid: String,

    /// The record's id, committed by record writes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,

    /// The record's context, committed by protocol record writes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// The CID of the message's attestation, if attested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation_cid: Option<String>,

    /// The CID of the message's encryption property, if encrypted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_cid: Option<String>,

    /// The id of the permission grant invoked to authorize the message.
    #[serde(rename = "permissionsGrantId")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_grant_id: Option<String>,
}

/// The signed payload of a message's `attestation`: a commitment to the
/// descriptor only.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttestationPayload {
    /// The CID of the attested descriptor.
    pub descriptor_cid: String,
}

/// Helpers for building and verifying message attestations.
pub struct Attestation;

impl Attestation {
    /// Sign an attestation over the given descriptor CID.
    ///
    /// # Errors
    ///
    /// Returns an error when signing fails.
    pub async fn sign(descriptor_cid: &str, attester: &impl Signer) -> Result<Jws> {
        let payload = AttestationPayload {
            descriptor_cid: descriptor_cid.to_string(),
        };
        Jws::sign(&payload, attester).await
    }

    /// Verify an attestation: a single signature committing to the given
    /// descriptor CID.
    ///
    /// # Errors
    ///
    /// Returns `Error::BadRequest` when the attestation's shape or payload
    /// is wrong, `Error::Unauthorized` when its signature fails.
    pub async fn verify(
        attestation: &Jws, descriptor_cid: &str, resolver: &impl DidResolver,
    ) -> Result<()> {
        if attestation.signatures.len() != 1 {
            return Err(bad_request!("a message may have at most one attester"));
        }
        let payload: AttestationPayload = attestation.payload()?;
        if payload.descriptor_cid != descriptor_cid {
            return Err(bad_request!("attestation payload does not match descriptor"));
        }
        attestation.verify(resolver).await.map(|_| ())
    }
}

/// Builds an [`Authorization`] for a message under construction.
#[derive(Clone, Debug, Default)]
pub struct AuthorizationBuilder {
    descriptor_cid: Option<String>,
    record_id: Option<String>,
    context_id: Option<String>,
    attestation_cid: Option<String>,
    encryption_cid: Option<String>,
    permission_grant_id: Option<String>,
}

impl AuthorizationBuilder {
    /// Returns a new [`AuthorizationBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Specify the CID of the descriptor being authorized.
    #[must_use]
    pub fn descriptor_cid(mut self, descriptor_cid: impl Into<String>) -> Self {
        self.descriptor_cid = Some(descriptor_cid.into());
        self
    }

    /// Specify the record id committed to by the signature.
    #[must_use]
    pub fn record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// Specify the context id committed to by the signature.
    #[must_use]
    pub fn context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Specify the CID of the message's attestation.
    #[must_use]
    pub fn attestation_cid(mut self, attestation_cid: impl Into<String>) -> Self {
        self.attestation_cid = Some(attestation_cid.into());
        self
    }

    /// Specify the CID of the message's encryption property.
    #[must_use]
    pub fn encryption_cid(mut self, encryption_cid: impl Into<String>) -> Self {
        self.encryption_cid = Some(encryption_cid.into());
        self
    }

    /// Specify the id of the permission grant being invoked.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Sign the payload and build the [`Authorization`].
    ///
    /// # Errors
    ///
    /// Returns an error when no descriptor CID has been set or signing
    /// fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Authorization> {
        let Some(descriptor_cid) = self.descriptor_cid else {
            return Err(unexpected!("descriptor CID not set"));
        };

        let payload = JwsPayload {
            descriptor_cid,
            record_id: self.record_id,
            context_id: self.context_id,
            attestation_cid: self.attestation_cid,
            encryption_cid: self.encryption_cid,
            permission_grant_id: self.permission_grant_id,
        };

        Ok(Authorization {
            signature: Jws::sign(&payload, signer).await?,
        })
    }
}
