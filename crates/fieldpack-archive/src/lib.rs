//! The fieldpack bundle format.
//!
//! A bundle is a ZIP archive whose bytes are a pure function of its entries:
//! entries are sorted by name, DEFLATE-compressed and carry a fixed timestamp
//! and mode. This crate reads and writes that container and the documents
//! inside it (manifest, DSSE attestations, CycloneDX inventory). It knows
//! nothing about the database or the filesystem.

pub mod container;
pub mod dsse;
pub mod error;
pub mod manifest;
pub mod sbom;

pub use container::{Archive, ArchiveWriter, ReadLimits};
pub use error::{Error, Result};
pub use manifest::Manifest;
