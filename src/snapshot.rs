use std::{fs, path::Path};

use anyhow::{Context, Result};
use tracing::debug;

use crate::replica::Replica;

/// Writes one tree listing per refresh stage so two runs (or the two
/// sides) can be diffed after the fact.
pub struct SnapshotWriter {
    dir: std::path::PathBuf,
}

impl SnapshotWriter {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create state directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn write(&self, name: &str, replica: &Replica) {
        let path = self.dir.join(format!("{name}.txt"));
        if let Err(err) = fs::write(&path, replica.dump()) {
            debug!(path = %path.display(), error = %err, "failed to write state listing");
        }
    }
}
