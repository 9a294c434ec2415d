//! Core types and algorithms for the fieldpack evidence pipeline.
//!
//! This crate is deliberately free of database, filesystem and archive
//! dependencies. Everything here is a pure function of its inputs, so the
//! sealing side and the verifying side compute hashes with the same code.

pub mod canonical;
pub mod chunking;
pub mod derive;
pub mod document;
pub mod error;
pub mod kg;
pub mod ledger;
pub mod policy;
pub mod records;
pub mod result;
pub mod staging;

pub use canonical::{CanonicalizationError, Hash256, canonicalize, digest};
pub use error::{Error, Result};
pub use ledger::{ChainBreak, LedgerEvent, LedgerKind, LedgerPayload, SliceRange};

