//! Per-entity stream files.
//!
//! In stream mode a dirty entity is flushed to `<dir>/<id>.rec` before it is
//! evicted. A stream file holds exactly one frame and shadows whatever the
//! aggregate file says about the same id until the next save folds it in.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::StoreResult;
use crate::id::NeuronId;

const EXTENSION: &str = "rec";

#[derive(Debug, Clone)]
pub(crate) struct StreamDir {
    dir: PathBuf,
}

impl StreamDir {
    pub fn open(dir: &Path) -> StoreResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, id: NeuronId) -> PathBuf {
        self.dir.join(format!("{}.{EXTENSION}", id.get()))
    }

    /// Write one frame, replacing any earlier version atomically.
    pub fn write(&self, id: NeuronId, frame: &[u8]) -> StoreResult<()> {
        let path = self.path_for(id);
        let tmp = path.with_extension("rec.tmp");
        fs::write(&tmp, frame)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn read(&self, id: NeuronId) -> StoreResult<Vec<u8>> {
        Ok(fs::read(self.path_for(id))?)
    }

    pub fn remove(&self, id: NeuronId) {
        if let Err(e) = fs::remove_file(self.path_for(id)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(%id, error = %e, "failed to remove stream file");
            }
        }
    }

    /// Delete every stream file. Returns how many were removed.
    pub fn purge(&self) -> StoreResult<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_record = path
                .extension()
                .is_some_and(|ext| ext == EXTENSION || ext == "tmp");
            if is_record {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
