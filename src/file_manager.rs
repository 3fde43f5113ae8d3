//! Name cache of the files stored under the cache directory.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::protocol::{MAX_FILE_ID_LEN, ProtocolError};

/// Known content ids. Seeded from the directory once, then grown by completed uploads.
pub struct FileManager {
    base_dir: PathBuf,
    names: Mutex<HashSet<String>>,
}

impl FileManager {
    /// Creates `base_dir` when missing and loads the names of the regular files in it.
    pub fn init(base_dir: impl AsRef<Path>) -> io::Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        if !base_dir.is_dir() {
            fs::create_dir_all(&base_dir)?;
            tracing::info!(dir = %base_dir.display(), "created file cache directory");
        }

        let mut names = HashSet::new();
        for entry in fs::read_dir(&base_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => {
                    tracing::debug!(file = %name, "cached file");
                    names.insert(name);
                }
                Err(raw) => tracing::warn!(file = ?raw, "skipping non UTF-8 file name"),
            }
        }
        tracing::info!(dir = %base_dir.display(), files = names.len(), "file manager ready");
        Ok(Self {
            base_dir,
            names: Mutex::new(names),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn exists(&self, file_id: &str) -> bool {
        self.names.lock().contains(file_id)
    }

    pub fn add_file(&self, file_id: &str) {
        self.names.lock().insert(file_id.to_string());
    }

    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.lock().is_empty()
    }

    /// On-disk location of `file_id`; ids that could leave the directory are rejected.
    pub fn path_of(&self, file_id: &str) -> Result<PathBuf, ProtocolError> {
        validate_file_id(file_id)?;
        Ok(self.base_dir.join(file_id))
    }
}

pub fn validate_file_id(file_id: &str) -> Result<(), ProtocolError> {
    let bad = file_id.is_empty()
        || file_id.len() > MAX_FILE_ID_LEN
        || file_id == "."
        || file_id.contains("..")
        || file_id.contains(['/', '\\', '\0']);
    if bad {
        return Err(ProtocolError::InvalidFileId(file_id.to_string()));
    }
    Ok(())
}
