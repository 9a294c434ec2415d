//! Minimal CycloneDX inventory.
//!
//! The inventory carries no timestamp or serial number, so resealing the same
//! slice reproduces it byte for byte.

use fieldpack_core::canonical::canonical_line;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const BOM_FORMAT: &str = "CycloneDX";
pub const SPEC_VERSION: &str = "1.5";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tool {
  pub vendor:  String,
  pub name:    String,
  pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
  pub name:  String,
  pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
  pub tools:      Vec<Tool>,
  #[serde(default)]
  pub properties: Vec<Property>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
  #[serde(rename = "type")]
  pub kind:    String,
  pub name:    String,
  pub version: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub purl:    Option<String>,
}

impl Component {
  pub fn library(name: &str, version: &str) -> Self {
    Self {
      kind:    "library".into(),
      name:    name.into(),
      version: version.into(),
      purl:    Some(format!("pkg:cargo/{name}@{version}")),
    }
  }

  pub fn application(name: &str) -> Self {
    Self { kind: "application".into(), name: name.into(), version: "unknown".into(), purl: None }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bom {
  pub bom_format:   String,
  pub spec_version: String,
  pub version:      u32,
  pub metadata:     Metadata,
  pub components:   Vec<Component>,
}

impl Bom {
  /// A BOM for `components`, sorted by name then version.
  pub fn new(tool: Tool, properties: Vec<Property>, mut components: Vec<Component>) -> Self {
    components.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
    components.dedup();
    Self {
      bom_format: BOM_FORMAT.into(),
      spec_version: SPEC_VERSION.into(),
      version: 1,
      metadata: Metadata { tools: vec![tool], properties },
      components,
    }
  }

  pub fn to_bytes(&self) -> Result<Vec<u8>> { Ok(canonical_line(self)?) }

  /// Parse and check the shape every consumer relies on.
  pub fn parse(bytes: &[u8]) -> Result<Self> {
    let bom: Bom = serde_json::from_slice(bytes).map_err(|e| Error::InvalidSbom(e.to_string()))?;
    bom.validate()?;
    Ok(bom)
  }

  pub fn validate(&self) -> Result<()> {
    if self.bom_format != BOM_FORMAT {
      return Err(Error::InvalidSbom(format!("bomFormat is {:?}", self.bom_format)));
    }
    if self.spec_version != SPEC_VERSION {
      return Err(Error::InvalidSbom(format!("unsupported specVersion {:?}", self.spec_version)));
    }
    if self.version < 1 {
      return Err(Error::InvalidSbom("version must be at least 1".into()));
    }
    if let Some(c) = self.components.iter().find(|c| c.name.is_empty() || c.kind.is_empty()) {
      return Err(Error::InvalidSbom(format!("component {:?} is incomplete", c.name)));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tool() -> Tool {
    Tool { vendor: "fieldpack".into(), name: "fieldpack".into(), version: "0.1.0".into() }
  }

  #[test]
  fn components_are_sorted_and_deduplicated() {
    let bom = Bom::new(
      tool(),
      Vec::new(),
      vec![
        Component::library("zeta", "1.0"),
        Component::application("tesseract"),
        Component::library("alpha", "2.0"),
        Component::library("zeta", "1.0"),
      ],
    );
    let names: Vec<_> = bom.components.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "tesseract", "zeta"]);
    assert_eq!(bom.components[0].purl.as_deref(), Some("pkg:cargo/alpha@2.0"));
  }

  #[test]
  fn parse_accepts_own_output() {
    let bom = Bom::new(tool(), Vec::new(), vec![Component::library("a", "1")]);
    let bytes = bom.to_bytes().unwrap();
    assert!(bytes.starts_with(b"{\"bomFormat\":\"CycloneDX\""));
    assert_eq!(Bom::parse(&bytes).unwrap(), bom);
  }

  #[test]
  fn parse_rejects_foreign_documents() {
    assert!(Bom::parse(b"{}").is_err());
    assert!(Bom::parse(b"not json").is_err());

    let mut bom = Bom::new(tool(), Vec::new(), Vec::new());
    bom.spec_version = "1.2".into();
    assert!(matches!(Bom::parse(&bom.to_bytes().unwrap()), Err(Error::InvalidSbom(_))));
  }
}
