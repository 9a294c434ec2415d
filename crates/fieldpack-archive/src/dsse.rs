//! DSSE envelopes over in-toto statements, signed with Ed25519.
//!
//! ```text
//! PAE(type, body) = "DSSEv1" SP LEN(type) SP type SP LEN(body) SP body
//! ```
//!
//! Key ids are the SHA-256 hex of the raw 32-byte public key.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use fieldpack_core::{
  Hash256,
  canonical::{canonical_line, canonicalize, digest},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

pub const INTOTO_PAYLOAD_TYPE: &str = "application/vnd.in-toto+json";
pub const STATEMENT_TYPE: &str = "https://in-toto.io/Statement/v1";
pub const BUNDLE_PREDICATE_TYPE: &str = "urn:fieldpack:predicate:bundle:v1";
pub const SBOM_PREDICATE_TYPE: &str = "https://cyclonedx.org/bom";

/// Pre-authentication encoding.
pub fn pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
  let mut out = format!("DSSEv1 {} {} {} ", payload_type.len(), payload_type, payload.len())
    .into_bytes();
  out.extend_from_slice(payload);
  out
}

pub fn key_id(key: &VerifyingKey) -> String { digest(key.as_bytes()).to_hex() }

/// Parse a raw public key from hex.
pub fn verifying_key_from_hex(hex_key: &str) -> Result<VerifyingKey> {
  let bytes = hex::decode(hex_key.trim()).map_err(|e| Error::InvalidKey(e.to_string()))?;
  let bytes: [u8; 32] =
    bytes.try_into().map_err(|_| Error::InvalidKey("expected 32 bytes".into()))?;
  Ok(VerifyingKey::from_bytes(&bytes)?)
}

// ─── Statement ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
  pub name:   String,
  pub digest: BTreeMap<String, String>,
}

impl Subject {
  pub fn sha256(name: impl Into<String>, sha256: &Hash256) -> Self {
    Self { name: name.into(), digest: BTreeMap::from([("sha256".to_owned(), sha256.to_hex())]) }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
  #[serde(rename = "_type")]
  pub statement_type: String,
  pub subject:        Vec<Subject>,
  #[serde(rename = "predicateType")]
  pub predicate_type: String,
  pub predicate:      Value,
}

impl Statement {
  pub fn new(subject: Vec<Subject>, predicate_type: &str, predicate: Value) -> Self {
    Self {
      statement_type: STATEMENT_TYPE.to_owned(),
      subject,
      predicate_type: predicate_type.to_owned(),
      predicate,
    }
  }

  /// The sha256 claimed for subject `name`, if any.
  pub fn subject_digest(&self, name: &str) -> Option<Hash256> {
    self
      .subject
      .iter()
      .find(|s| s.name == name)
      .and_then(|s| s.digest.get("sha256"))
      .and_then(|hex| hex.parse().ok())
  }
}

// ─── Envelope ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeSignature {
  pub keyid: String,
  pub sig:   String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
  pub payload_type: String,
  /// Base64 of the exact signed bytes.
  pub payload:      String,
  pub signatures:   Vec<EnvelopeSignature>,
}

impl Envelope {
  pub fn sign(payload_type: &str, payload: &[u8], key: &SigningKey) -> Self {
    let sig = key.sign(&pae(payload_type, payload));
    Self {
      payload_type: payload_type.to_owned(),
      payload:      B64.encode(payload),
      signatures:   vec![EnvelopeSignature {
        keyid: key_id(&key.verifying_key()),
        sig:   B64.encode(sig.to_bytes()),
      }],
    }
  }

  /// Sign the canonical encoding of an in-toto statement.
  pub fn sign_statement(statement: &Statement, key: &SigningKey) -> Result<Self> {
    Ok(Self::sign(INTOTO_PAYLOAD_TYPE, &canonicalize(statement)?, key))
  }

  pub fn key_ids(&self) -> impl Iterator<Item = &str> {
    self.signatures.iter().map(|s| s.keyid.as_str())
  }

  pub fn payload_bytes(&self) -> Result<Vec<u8>> { Ok(B64.decode(&self.payload)?) }

  /// Check the signature made by `key` and return the signed payload.
  pub fn verify(&self, key: &VerifyingKey) -> Result<Vec<u8>> {
    if self.signatures.is_empty() {
      return Err(Error::NoSignatures);
    }
    let wanted = key_id(key);
    let entry = self
      .signatures
      .iter()
      .find(|s| s.keyid == wanted)
      .ok_or_else(|| Error::UnknownKey(wanted.clone()))?;

    let payload = self.payload_bytes()?;
    let sig = Signature::from_slice(&B64.decode(&entry.sig)?)?;
    key.verify_strict(&pae(&self.payload_type, &payload), &sig)?;
    Ok(payload)
  }

  /// Verify, then decode the payload as an in-toto statement.
  pub fn verify_statement(&self, key: &VerifyingKey) -> Result<Statement> {
    let payload = self.verify(key)?;
    Ok(serde_json::from_slice(&payload)?)
  }

  pub fn to_bytes(&self) -> Result<Vec<u8>> { Ok(canonical_line(self)?) }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self> { Ok(serde_json::from_slice(bytes)?) }
}
