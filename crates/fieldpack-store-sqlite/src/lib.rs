//! SQLite backend for the fieldpack pipeline.
//!
//! One database file holds the four hash-chained ledgers, the document and
//! blob catalog, the knowledge graph and acceptance state. The file runs in WAL
//! mode: each ledger owns a writer connection behind its own mutex, while
//! readers open their own connections and see a consistent snapshot.

mod catalog;
mod encode;
mod graph;
mod ledger;
mod schema;
mod staging;

pub mod error;

pub use catalog::{SealCheckpoint, Store};
pub use error::{Error, Result};
pub use ledger::{EventLedger, EventRange, LedgerTx};
