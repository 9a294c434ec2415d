//! Canonical JSON encoding and SHA-256 digests.
//!
//! Every hash in the system is computed over the output of [`canonicalize`]:
//! object keys sorted by byte-wise UTF-8 order at every level, no
//! insignificant whitespace, `serde_json` number formatting and UTF-8 strings
//! with only the mandatory JSON escapes. Two values that are equal as JSON
//! trees always produce the same bytes, however they were constructed.

use std::{fmt, str::FromStr};

use serde::{
  Deserialize, Deserializer, Serialize, Serializer,
  ser::{self, Impossible},
};
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::Error;

/// Nesting limit for canonicalised values.
pub const MAX_DEPTH: usize = 128;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanonicalizationError {
  #[error("non-finite float cannot be canonicalized")]
  NonFinite,

  #[error("value nested deeper than {} levels", MAX_DEPTH)]
  TooDeep,

  #[error("unsupported value: {0}")]
  Unsupported(String),
}

impl ser::Error for CanonicalizationError {
  fn custom<T: fmt::Display>(msg: T) -> Self {
    CanonicalizationError::Unsupported(msg.to_string())
  }
}

// ─── Hash256 ─────────────────────────────────────────────────────────────────

/// A SHA-256 digest. Displays and serialises as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash256([u8; 32]);

impl Hash256 {
  pub const fn from_bytes(bytes: [u8; 32]) -> Self { Self(bytes) }

  /// Hash `bytes` with SHA-256.
  pub fn of(bytes: &[u8]) -> Self {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Self(hasher.finalize().into())
  }

  pub fn as_bytes(&self) -> &[u8; 32] { &self.0 }

  pub fn to_hex(&self) -> String { hex::encode(self.0) }

  /// The 12-character prefix used in log lines and refusal messages.
  pub fn short(&self) -> String { self.to_hex()[..12].to_owned() }
}

impl fmt::Display for Hash256 {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.to_hex())
  }
}

impl fmt::Debug for Hash256 {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Hash256({})", self.to_hex())
  }
}

impl FromStr for Hash256 {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(s, &mut bytes)
      .map_err(|_| Error::InvalidDigest(s.to_owned()))?;
    Ok(Self(bytes))
  }
}

impl Serialize for Hash256 {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for Hash256 {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}

// ─── Public API ──────────────────────────────────────────────────────────────

/// SHA-256 of raw bytes.
pub fn digest(bytes: &[u8]) -> Hash256 { Hash256::of(bytes) }

/// Encode `value` canonically.
pub fn canonicalize<T: Serialize + ?Sized>(
  value: &T,
) -> Result<Vec<u8>, CanonicalizationError> {
  value.serialize(Guard { depth: 0 })?;
  let tree = serde_json::to_value(value)
    .map_err(|e| CanonicalizationError::Unsupported(e.to_string()))?;
  let mut out = Vec::with_capacity(128);
  write_value(&mut out, &tree)?;
  Ok(out)
}

/// Canonical encoding terminated by `\n`, the line format of every `.jsonl`
/// artifact.
pub fn canonical_line<T: Serialize + ?Sized>(
  value: &T,
) -> Result<Vec<u8>, CanonicalizationError> {
  let mut out = canonicalize(value)?;
  out.push(b'\n');
  Ok(out)
}

/// SHA-256 of the canonical encoding of `value`.
pub fn digest_canonical<T: Serialize + ?Sized>(
  value: &T,
) -> Result<Hash256, CanonicalizationError> {
  Ok(digest(&canonicalize(value)?))
}

/// A content-derived URN, e.g. `urn:fieldpack:doc:<sha256>`.
pub fn urn(kind: &str, digest: &Hash256) -> String {
  format!("urn:fieldpack:{kind}:{digest}")
}

// ─── Writer ──────────────────────────────────────────────────────────────────

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<(), CanonicalizationError> {
  match value {
    Value::Null => out.extend_from_slice(b"null"),
    Value::Bool(true) => out.extend_from_slice(b"true"),
    Value::Bool(false) => out.extend_from_slice(b"false"),
    Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
    Value::String(s) => write_str(out, s)?,
    Value::Array(items) => {
      out.push(b'[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(b',');
        }
        write_value(out, item)?;
      }
      out.push(b']');
    }
    Value::Object(map) => {
      let mut entries: Vec<(&String, &Value)> = map.iter().collect();
      entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
      out.push(b'{');
      for (i, (key, item)) in entries.into_iter().enumerate() {
        if i > 0 {
          out.push(b',');
        }
        write_str(out, key)?;
        out.push(b':');
        write_value(out, item)?;
      }
      out.push(b'}');
    }
  }
  Ok(())
}

fn write_str(out: &mut Vec<u8>, s: &str) -> Result<(), CanonicalizationError> {
  serde_json::to_writer(&mut *out, s)
    .map_err(|e| CanonicalizationError::Unsupported(e.to_string()))
}

// ─── Guard ───────────────────────────────────────────────────────────────────
//
// `serde_json::to_value` maps NaN and infinities to `null`. The guard walks the
// value first and rejects them, along with anything nested past `MAX_DEPTH`.

#[derive(Clone, Copy)]
struct Guard {
  depth: usize,
}

impl Guard {
  fn nested(self) -> Result<Self, CanonicalizationError> {
    let depth = self.depth + 1;
    if depth > MAX_DEPTH {
      return Err(CanonicalizationError::TooDeep);
    }
    Ok(Guard { depth })
  }

  fn float(self, v: f64) -> Result<(), CanonicalizationError> {
    if v.is_finite() {
      Ok(())
    } else {
      Err(CanonicalizationError::NonFinite)
    }
  }
}

type GuardResult = Result<(), CanonicalizationError>;

impl Serializer for Guard {
  type Ok = ();
  type Error = CanonicalizationError;
  type SerializeSeq = Guard;
  type SerializeTuple = Guard;
  type SerializeTupleStruct = Guard;
  type SerializeTupleVariant = Guard;
  type SerializeMap = Guard;
  type SerializeStruct = Guard;
  type SerializeStructVariant = Guard;

  fn serialize_bool(self, _: bool) -> GuardResult { Ok(()) }
  fn serialize_i8(self, _: i8) -> GuardResult { Ok(()) }
  fn serialize_i16(self, _: i16) -> GuardResult { Ok(()) }
  fn serialize_i32(self, _: i32) -> GuardResult { Ok(()) }
  fn serialize_i64(self, _: i64) -> GuardResult { Ok(()) }
  fn serialize_u8(self, _: u8) -> GuardResult { Ok(()) }
  fn serialize_u16(self, _: u16) -> GuardResult { Ok(()) }
  fn serialize_u32(self, _: u32) -> GuardResult { Ok(()) }
  fn serialize_u64(self, _: u64) -> GuardResult { Ok(()) }
  fn serialize_f32(self, v: f32) -> GuardResult { self.float(f64::from(v)) }
  fn serialize_f64(self, v: f64) -> GuardResult { self.float(v) }
  fn serialize_char(self, _: char) -> GuardResult { Ok(()) }
  fn serialize_str(self, _: &str) -> GuardResult { Ok(()) }
  fn serialize_bytes(self, _: &[u8]) -> GuardResult { Ok(()) }
  fn serialize_none(self) -> GuardResult { Ok(()) }
  fn serialize_unit(self) -> GuardResult { Ok(()) }
  fn serialize_unit_struct(self, _: &'static str) -> GuardResult { Ok(()) }

  fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> GuardResult {
    value.serialize(self)
  }

  fn serialize_unit_variant(
    self,
    _: &'static str,
    _: u32,
    _: &'static str,
  ) -> GuardResult {
    Ok(())
  }

  fn serialize_newtype_struct<T: Serialize + ?Sized>(
    self,
    _: &'static str,
    value: &T,
  ) -> GuardResult {
    value.serialize(self)
  }

  fn serialize_newtype_variant<T: Serialize + ?Sized>(
    self,
    _: &'static str,
    _: u32,
    _: &'static str,
    value: &T,
  ) -> GuardResult {
    value.serialize(self.nested()?)
  }

  fn serialize_seq(self, _: Option<usize>) -> Result<Guard, CanonicalizationError> {
    self.nested()
  }

  fn serialize_tuple(self, _: usize) -> Result<Guard, CanonicalizationError> {
    self.nested()
  }

  fn serialize_tuple_struct(
    self,
    _: &'static str,
    _: usize,
  ) -> Result<Guard, CanonicalizationError> {
    self.nested()
  }

  fn serialize_tuple_variant(
    self,
    _: &'static str,
    _: u32,
    _: &'static str,
    _: usize,
  ) -> Result<Guard, CanonicalizationError> {
    self.nested()?.nested()
  }

  fn serialize_map(self, _: Option<usize>) -> Result<Guard, CanonicalizationError> {
    self.nested()
  }

  fn serialize_struct(
    self,
    _: &'static str,
    _: usize,
  ) -> Result<Guard, CanonicalizationError> {
    self.nested()
  }

  fn serialize_struct_variant(
    self,
    _: &'static str,
    _: u32,
    _: &'static str,
    _: usize,
  ) -> Result<Guard, CanonicalizationError> {
    self.nested()?.nested()
  }
}

impl ser::SerializeSeq for Guard {
  type Ok = ();
  type Error = CanonicalizationError;

  fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> GuardResult {
    value.serialize(*self)
  }

  fn end(self) -> GuardResult { Ok(()) }
}

impl ser::SerializeTuple for Guard {
  type Ok = ();
  type Error = CanonicalizationError;

  fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> GuardResult {
    value.serialize(*self)
  }

  fn end(self) -> GuardResult { Ok(()) }
}

impl ser::SerializeTupleStruct for Guard {
  type Ok = ();
  type Error = CanonicalizationError;

  fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> GuardResult {
    value.serialize(*self)
  }

  fn end(self) -> GuardResult { Ok(()) }
}

impl ser::SerializeTupleVariant for Guard {
  type Ok = ();
  type Error = CanonicalizationError;

  fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> GuardResult {
    value.serialize(*self)
  }

  fn end(self) -> GuardResult { Ok(()) }
}

impl ser::SerializeMap for Guard {
  type Ok = ();
  type Error = CanonicalizationError;

  fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> GuardResult {
    key.serialize(KeyGuard)
  }

  fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> GuardResult {
    value.serialize(*self)
  }

  fn end(self) -> GuardResult { Ok(()) }
}

impl ser::SerializeStruct for Guard {
  type Ok = ();
  type Error = CanonicalizationError;

  fn serialize_field<T: Serialize + ?Sized>(
    &mut self,
    _: &'static str,
    value: &T,
  ) -> GuardResult {
    value.serialize(*self)
  }

  fn end(self) -> GuardResult { Ok(()) }
}

impl ser::SerializeStructVariant for Guard {
  type Ok = ();
  type Error = CanonicalizationError;

  fn serialize_field<T: Serialize + ?Sized>(
    &mut self,
    _: &'static str,
    value: &T,
  ) -> GuardResult {
    value.serialize(*self)
  }

  fn end(self) -> GuardResult { Ok(()) }
}

/// Map keys must be strings (or unit variants / newtypes that become strings).
struct KeyGuard;

fn bad_key(kind: &str) -> CanonicalizationError {
  CanonicalizationError::Unsupported(format!("map key must be a string, got {kind}"))
}

impl Serializer for KeyGuard {
  type Ok = ();
  type Error = CanonicalizationError;
  type SerializeSeq = Impossible<(), CanonicalizationError>;
  type SerializeTuple = Impossible<(), CanonicalizationError>;
  type SerializeTupleStruct = Impossible<(), CanonicalizationError>;
  type SerializeTupleVariant = Impossible<(), CanonicalizationError>;
  type SerializeMap = Impossible<(), CanonicalizationError>;
  type SerializeStruct = Impossible<(), CanonicalizationError>;
  type SerializeStructVariant = Impossible<(), CanonicalizationError>;

  fn serialize_str(self, _: &str) -> GuardResult { Ok(()) }
  fn serialize_char(self, _: char) -> GuardResult { Ok(()) }

  fn serialize_unit_variant(
    self,
    _: &'static str,
    _: u32,
    _: &'static str,
  ) -> GuardResult {
    Ok(())
  }

  fn serialize_newtype_struct<T: Serialize + ?Sized>(
    self,
    _: &'static str,
    value: &T,
  ) -> GuardResult {
    value.serialize(self)
  }

  fn serialize_bool(self, _: bool) -> GuardResult { Err(bad_key("bool")) }
  fn serialize_i8(self, _: i8) -> GuardResult { Err(bad_key("integer")) }
  fn serialize_i16(self, _: i16) -> GuardResult { Err(bad_key("integer")) }
  fn serialize_i32(self, _: i32) -> GuardResult { Err(bad_key("integer")) }
  fn serialize_i64(self, _: i64) -> GuardResult { Err(bad_key("integer")) }
  fn serialize_u8(self, _: u8) -> GuardResult { Err(bad_key("integer")) }
  fn serialize_u16(self, _: u16) -> GuardResult { Err(bad_key("integer")) }
  fn serialize_u32(self, _: u32) -> GuardResult { Err(bad_key("integer")) }
  fn serialize_u64(self, _: u64) -> GuardResult { Err(bad_key("integer")) }
  fn serialize_f32(self, _: f32) -> GuardResult { Err(bad_key("float")) }
  fn serialize_f64(self, _: f64) -> GuardResult { Err(bad_key("float")) }
  fn serialize_bytes(self, _: &[u8]) -> GuardResult { Err(bad_key("bytes")) }
  fn serialize_none(self) -> GuardResult { Err(bad_key("none")) }
  fn serialize_unit(self) -> GuardResult { Err(bad_key("unit")) }

  fn serialize_some<T: Serialize + ?Sized>(self, _: &T) -> GuardResult {
    Err(bad_key("option"))
  }

  fn serialize_unit_struct(self, _: &'static str) -> GuardResult {
    Err(bad_key("unit struct"))
  }

  fn serialize_newtype_variant<T: Serialize + ?Sized>(
    self,
    _: &'static str,
    _: u32,
    _: &'static str,
    _: &T,
  ) -> GuardResult {
    Err(bad_key("enum"))
  }

  fn serialize_seq(
    self,
    _: Option<usize>,
  ) -> Result<Self::SerializeSeq, CanonicalizationError> {
    Err(bad_key("sequence"))
  }

  fn serialize_tuple(
    self,
    _: usize,
  ) -> Result<Self::SerializeTuple, CanonicalizationError> {
    Err(bad_key("tuple"))
  }

  fn serialize_tuple_struct(
    self,
    _: &'static str,
    _: usize,
  ) -> Result<Self::SerializeTupleStruct, CanonicalizationError> {
    Err(bad_key("tuple struct"))
  }

  fn serialize_tuple_variant(
    self,
    _: &'static str,
    _: u32,
    _: &'static str,
    _: usize,
  ) -> Result<Self::SerializeTupleVariant, CanonicalizationError> {
    Err(bad_key("enum"))
  }

  fn serialize_map(
    self,
    _: Option<usize>,
  ) -> Result<Self::SerializeMap, CanonicalizationError> {
    Err(bad_key("map"))
  }

  fn serialize_struct(
    self,
    _: &'static str,
    _: usize,
  ) -> Result<Self::SerializeStruct, CanonicalizationError> {
    Err(bad_key("struct"))
  }

  fn serialize_struct_variant(
    self,
    _: &'static str,
    _: u32,
    _: &'static str,
    _: usize,
  ) -> Result<Self::SerializeStructVariant, CanonicalizationError> {
    Err(bad_key("enum"))
  }
}

#[cfg(test)]
mod tests {
  use std::collections::{BTreeMap, HashMap};

  use proptest::prelude::*;
  use serde_json::json;

  use super::*;

  #[test]
  fn keys_are_sorted_recursively() {
    let value = json!({"b": 1, "a": {"z": [3, {"y": true, "x": null}], "c": "é"}});
    let out = canonicalize(&value).unwrap();
    assert_eq!(
      String::from_utf8(out).unwrap(),
      r#"{"a":{"c":"é","z":[3,{"x":null,"y":true}]},"b":1}"#
    );
  }

  #[test]
  fn struct_field_order_is_irrelevant() {
    #[derive(Serialize)]
    struct Forward {
      alpha: u32,
      beta:  &'static str,
    }
    #[derive(Serialize)]
    struct Backward {
      beta:  &'static str,
      alpha: u32,
    }

    let a = canonicalize(&Forward { alpha: 7, beta: "x" }).unwrap();
    let b = canonicalize(&Backward { beta: "x", alpha: 7 }).unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn control_characters_are_escaped() {
    let out = canonicalize(&json!({"k": "line\n\"quoted\"\t\\"})).unwrap();
    assert_eq!(out, br#"{"k":"line\n\"quoted\"\t\\"}"#.to_vec());
  }

  #[test]
  fn non_finite_floats_are_rejected() {
    let mut map = BTreeMap::new();
    map.insert("ok", 1.5_f64);
    map.insert("bad", f64::NAN);
    assert_eq!(canonicalize(&map), Err(CanonicalizationError::NonFinite));
    assert_eq!(
      canonicalize(&vec![f64::INFINITY]),
      Err(CanonicalizationError::NonFinite)
    );
  }

  #[test]
  fn excessive_nesting_is_rejected() {
    let mut value = json!(0);
    for _ in 0..=MAX_DEPTH {
      value = json!([value]);
    }
    assert_eq!(canonicalize(&value), Err(CanonicalizationError::TooDeep));
  }

  #[test]
  fn non_string_map_keys_are_rejected() {
    let mut map = BTreeMap::new();
    map.insert(1_u32, "one");
    assert!(matches!(
      canonicalize(&map),
      Err(CanonicalizationError::Unsupported(_))
    ));
  }

  #[test]
  fn hash_round_trips_through_hex() {
    let h = digest(b"abc");
    assert_eq!(
      h.to_hex(),
      "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert_eq!(h.to_hex().parse::<Hash256>().unwrap(), h);
    assert_eq!(h.short(), "ba7816bf8f01");
    assert!("zz".parse::<Hash256>().is_err());
  }

  proptest! {
    #[test]
    fn construction_order_does_not_change_bytes(
      entries in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..16),
    ) {
      let forward: HashMap<&String, &i64> = entries.iter().collect();
      let mut backward = HashMap::new();
      for (k, v) in entries.iter().rev() {
        backward.insert(k, v);
      }
      let mut json_map = serde_json::Map::new();
      for (k, v) in entries.iter().rev() {
        json_map.insert(k.clone(), json!(v));
      }

      let a = canonicalize(&forward).unwrap();
      prop_assert_eq!(&a, &canonicalize(&backward).unwrap());
      prop_assert_eq!(&a, &canonicalize(&json_map).unwrap());
    }
  }
}
