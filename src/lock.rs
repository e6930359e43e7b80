use std::{fs::File, path::Path};

use anyhow::{Context, Result, bail};
use fs2::FileExt;

const LOCK_FILE_NAME: &str = ".icloud-sync.lock";

/// Advisory single-instance lock on the sync root. The lock is held for
/// the lifetime of the guard and released by the OS even on a crash.
pub struct LockGuard {
    _file: File,
}

pub fn acquire(root: &Path) -> Result<LockGuard> {
    let path = root.join(LOCK_FILE_NAME);
    let file = File::options()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file {}", path.display()))?;

    if file.try_lock_exclusive().is_err() {
        bail!(
            "another instance is already syncing {} (lock file {})",
            root.display(),
            path.display()
        );
    }

    Ok(LockGuard { _file: file })
}
