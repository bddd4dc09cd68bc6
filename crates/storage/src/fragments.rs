//! Atomic, write-once fragment blob store.
//!
//! Fragments live at `<root>/<object_id>/<index>.bin`. A put writes to a
//! `.tmp` sibling, fsyncs, and renames, so a crash leaves either the full
//! fragment or nothing. Puts are write-once: an existing fragment wins,
//! because the caller has already verified the incoming bytes against the
//! same FPCC and a divergent rewrite can only be equivalent or worse.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FragmentError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid object id: {0:?}")]
    InvalidObjectId(String),
}

/// True iff `id` is usable as an object identifier: non-empty, at most
/// 256 bytes, free of path separators and of `|` (the evidence-key
/// separator in the durable KV).
pub fn valid_object_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 256
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '|', '\0'])
}

/// Local filesystem fragment store rooted at a data directory.
#[derive(Debug, Clone)]
pub struct FragmentStore {
    root: PathBuf,
}

impl FragmentStore {
    /// Create a store rooted at `root`, creating the directory if missing.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, FragmentError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(FragmentStore { root })
    }

    fn object_dir(&self, object: &str) -> Result<PathBuf, FragmentError> {
        if !valid_object_id(object) {
            return Err(FragmentError::InvalidObjectId(object.to_string()));
        }
        Ok(self.root.join(object))
    }

    fn fragment_path(&self, object: &str, index: u32) -> Result<PathBuf, FragmentError> {
        Ok(self.object_dir(object)?.join(format!("{index}.bin")))
    }

    /// Persist a fragment. No-op if the path already holds one.
    pub fn put(&self, object: &str, index: u32, data: &[u8]) -> Result<(), FragmentError> {
        let path = self.fragment_path(object, index)?;
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        atomic_write(&path, data)
    }

    /// Load a fragment, `None` if absent.
    pub fn get(&self, object: &str, index: u32) -> Result<Option<Vec<u8>>, FragmentError> {
        let path = self.fragment_path(object, index)?;
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(Some(buf))
    }

    /// Remove every fragment of `object`. Absent objects are fine.
    pub fn delete(&self, object: &str) -> Result<(), FragmentError> {
        let dir = self.object_dir(object)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write to `<path>.tmp`, fsync, then rename into place.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FragmentError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
