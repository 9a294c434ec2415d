//! Crash-safe file writes: temp file in the target directory, fsync, rename,
//! then fsync the directory.

use std::{
  fs,
  io::Write as _,
  path::{Path, PathBuf},
};

use tempfile::NamedTempFile;

use crate::Result;

fn parent_of(path: &Path) -> PathBuf {
  match path.parent() {
    Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
    _ => PathBuf::from("."),
  }
}

fn staged(path: &Path, bytes: &[u8]) -> Result<NamedTempFile> {
  let dir = parent_of(path);
  fs::create_dir_all(&dir)?;
  let mut tmp = NamedTempFile::new_in(&dir)?;
  tmp.write_all(bytes)?;
  tmp.as_file().sync_all()?;
  Ok(tmp)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
  fs::File::open(dir)?.sync_all()?;
  Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> { Ok(()) }

/// Replace `path` with `bytes`. Readers see the old or the new content, never
/// a mix.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
  let tmp = staged(path, bytes)?;
  tmp.persist(path).map_err(|e| e.error)?;
  sync_dir(&parent_of(path))
}

/// Like [`write_atomic`], but fails if `path` already exists.
pub fn write_new_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
  let tmp = staged(path, bytes)?;
  tmp.persist_noclobber(path).map_err(|e| e.error)?;
  sync_dir(&parent_of(path))
}
