//! Ed25519 signing keys, stored as a hex-encoded 32-byte seed.

use std::path::Path;

use ed25519_dalek::{SigningKey, VerifyingKey};
use fieldpack_archive::dsse::key_id;
use fieldpack_core::policy::Signer;
use rand_core::OsRng;

use crate::{Error, Result, atomic::write_new_atomic};

/// Generate a key at `path`. Refuses to replace an existing key.
///
/// The file is created `0600` on Unix.
pub fn generate_key(path: &Path) -> Result<VerifyingKey> {
  if path.exists() {
    return Err(Error::Signing(format!("{} already exists", path.display())));
  }
  let key = SigningKey::generate(&mut OsRng);
  let mut seed = hex::encode(key.to_bytes());
  seed.push('\n');
  write_new_atomic(path, seed.as_bytes())?;
  let public = key.verifying_key();
  tracing::info!(path = %path.display(), key_id = %key_id(&public), "generated signing key");
  Ok(public)
}

/// Load the key at `path`. Never creates one.
pub fn load_key(path: &Path) -> Result<SigningKey> {
  let raw = std::fs::read_to_string(path)
    .map_err(|e| Error::Signing(format!("cannot read {}: {e}", path.display())))?;
  let bytes = hex::decode(raw.trim())
    .map_err(|e| Error::Signing(format!("{} is not a hex seed: {e}", path.display())))?;
  let seed: [u8; 32] = bytes
    .try_into()
    .map_err(|_| Error::Signing(format!("{} does not hold a 32-byte seed", path.display())))?;
  Ok(SigningKey::from_bytes(&seed))
}

/// The allowlist entry that trusts `key`.
pub fn signer_entry(key: &VerifyingKey) -> Signer {
  Signer { key_id: key_id(key), public_key: hex::encode(key.as_bytes()) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn generated_keys_load_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys/signing.key");
    let public = generate_key(&path).unwrap();
    assert_eq!(load_key(&path).unwrap().verifying_key(), public);
    assert!(matches!(generate_key(&path), Err(Error::Signing(_))));

    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt as _;
      let mode = std::fs::metadata(&path).unwrap().permissions().mode();
      assert_eq!(mode & 0o777, 0o600);
    }
  }

  #[test]
  fn bad_key_files_are_signing_errors() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.key");
    assert!(matches!(load_key(&missing), Err(Error::Signing(_))));
    assert!(!missing.exists());

    let short = dir.path().join("short.key");
    std::fs::write(&short, "abcd").unwrap();
    assert!(matches!(load_key(&short), Err(Error::Signing(_))));
  }

  #[test]
  fn signer_entries_match_envelope_key_ids() {
    let key = SigningKey::from_bytes(&[9; 32]);
    let signer = signer_entry(&key.verifying_key());
    assert_eq!(signer.key_id, key_id(&key.verifying_key()));
    assert_eq!(signer.public_key.len(), 64);
  }
}
