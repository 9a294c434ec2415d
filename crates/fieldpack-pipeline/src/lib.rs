//! The fieldpack evidence pipeline.
//!
//! [`Pipeline`] ties the ledgers, the content store and the bundle codec
//! together:
//!
//! ```text
//! ingest ──> ledgers + CAS ──seal──> bundle.zip ──verify/replay──> import
//!                                                                    │
//!                               KG <──merge── staged ──approve───────┘
//! ```
//!
//! Verification and replay are pure functions of the bundle bytes and the
//! local policy; see [`verify::verify_bundle`] and [`replay::replay_bundle`].

use std::{path::Path, sync::Arc};

use fieldpack_core::policy::{Allowlist, Policy};
use fieldpack_store_sqlite::Store;

pub mod accept;
pub mod atomic;
pub mod cas;
pub mod config;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod keys;
pub mod replay;
pub mod seal;
pub mod tools;
pub mod verify;

pub use cas::ContentStore;
pub use self::config::FieldpackConfig;
pub use error::{Error, Result};

#[cfg(test)]
mod tests;

/// An open runtime: database, content store and local policy.
pub struct Pipeline {
  config:    FieldpackConfig,
  store:     Arc<Store>,
  cas:       ContentStore,
  policy:    Policy,
  allowlist: Allowlist,
}

impl Pipeline {
  /// Open the runtime described by `config`, creating its directories and
  /// database as needed.
  pub fn open(config: &FieldpackConfig) -> Result<Self> {
    let config = config.resolved();
    config.validate()?;

    for dir in [&config.runtime_root, &config.cas_root, &config.bundles_dir] {
      std::fs::create_dir_all(dir)?;
    }
    if let Some(parent) = config.db_path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let store = Arc::new(Store::open(&config.db_path)?);
    let cas = ContentStore::new(&config.cas_root, Arc::clone(&store));
    let policy = config.load_policy()?;
    let allowlist = config.load_allowlist()?;
    tracing::info!(
      root = %config.runtime_root.display(),
      policy = %policy.policy_id,
      "opened pipeline"
    );

    Ok(Self { config, store, cas, policy, allowlist })
  }

  /// Replace the loaded policy and allowlist.
  pub fn with_policy(mut self, policy: Policy, allowlist: Allowlist) -> Self {
    self.policy = policy;
    self.allowlist = allowlist;
    self
  }

  pub fn config(&self) -> &FieldpackConfig { &self.config }

  pub fn store(&self) -> &Store { &self.store }

  pub fn cas(&self) -> &ContentStore { &self.cas }

  pub fn policy(&self) -> &Policy { &self.policy }

  pub fn allowlist(&self) -> &Allowlist { &self.allowlist }

  pub fn bundles_dir(&self) -> &Path { &self.config.bundles_dir }
}
