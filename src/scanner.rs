use std::{fs, path::Path, sync::atomic::AtomicUsize, sync::atomic::Ordering, thread};

use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use crate::{
    drive::{DriveClient, DriveError, DriveKind},
    filter::PathFilter,
    replica::{Node, Replica, unix_seconds},
};

#[derive(Debug, Error)]
pub enum ScanError {
    /// The candidate's file count disagrees with what the remote root
    /// declared; the candidate must be discarded, never partially
    /// applied.
    #[error("refresh inconsistent: declared {declared} files, counted {counted}")]
    Inconsistent { declared: u64, counted: u64 },
    #[error(transparent)]
    Drive(#[from] DriveError),
}

struct FolderTask {
    path: String,
    handle: String,
}

/// Builds a candidate remote replica by parallel BFS from the drive
/// root. One pool task per subfolder; file entries are recorded inline.
/// The candidate only leaves this function after passing the integrity
/// gate.
pub fn scan_remote(
    client: &dyn DriveClient,
    filter: &PathFilter,
    max_workers: usize,
) -> Result<Replica, ScanError> {
    let root = client.list_root()?;

    let mut candidate = Replica::new();
    candidate.root_handle = Some(root.handle.clone());
    candidate.declared_file_count = Some(root.file_count);
    candidate.trash_count = Some(root.trash_count);

    let candidate = Mutex::new(candidate);
    let first_error: Mutex<Option<DriveError>> = Mutex::new(None);

    let (tx, rx) = unbounded::<Option<FolderTask>>();
    let pending = AtomicUsize::new(1);
    let workers = max_workers.max(1);

    tx.send(Some(FolderTask {
        path: String::new(),
        handle: root.handle,
    }))
    .expect("scan queue open");

    thread::scope(|scope| {
        for _ in 0..workers {
            let rx = rx.clone();
            let tx = tx.clone();
            let candidate = &candidate;
            let first_error = &first_error;
            let pending = &pending;

            scope.spawn(move || {
                while let Ok(Some(task)) = rx.recv() {
                    match client.list_folder(&task.handle) {
                        Ok(items) => {
                            for item in items {
                                let rel_path = if task.path.is_empty() {
                                    item.name.clone()
                                } else {
                                    format!("{}/{}", task.path, item.name)
                                };
                                if !filter.accept(&rel_path) {
                                    continue;
                                }
                                match item.kind {
                                    DriveKind::File => {
                                        let mut node = Node::file(
                                            rel_path,
                                            item.size.unwrap_or(0),
                                            item.mtime.unwrap_or(0),
                                        );
                                        node.handle = Some(item.handle);
                                        candidate.lock().insert(node);
                                    }
                                    DriveKind::Folder => {
                                        let mut node = Node::folder(rel_path.clone());
                                        node.handle = Some(item.handle.clone());
                                        node.child_count = item.child_count;
                                        candidate.lock().insert(node);

                                        pending.fetch_add(1, Ordering::SeqCst);
                                        let _ = tx.send(Some(FolderTask {
                                            path: rel_path,
                                            handle: item.handle,
                                        }));
                                    }
                                    DriveKind::AppLibrary => {}
                                }
                            }
                        }
                        Err(err) => {
                            let mut slot = first_error.lock();
                            if slot.is_none() {
                                *slot = Some(err);
                            }
                        }
                    }

                    if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                        // Last outstanding folder: wake every worker up
                        // so the scope can join.
                        for _ in 0..workers {
                            let _ = tx.send(None);
                        }
                    }
                }
            });
        }
    });

    if let Some(err) = first_error.into_inner() {
        return Err(ScanError::Drive(err));
    }

    let candidate = candidate.into_inner();
    let declared = candidate.declared_file_count.unwrap_or(0);
    let counted = candidate.file_count();
    if counted != declared {
        return Err(ScanError::Inconsistent { declared, counted });
    }

    Ok(candidate)
}

/// Cheap change-check between full refreshes: just the root's declared
/// file count and the trash population.
pub fn check_remote(client: &dyn DriveClient) -> Result<(u64, u64), DriveError> {
    let root = client.list_root()?;
    Ok((root.file_count, root.trash_count))
}

/// Walks the sync root on disk into a fresh replica. Symlinks are not
/// followed; unreadable entries are logged and skipped, so the scan
/// itself cannot fail.
pub fn scan_local(root: &Path, filter: &PathFilter) -> Replica {
    let mut replica = Replica::new();
    walk_local(root, "", filter, &mut replica);
    replica
}

fn walk_local(dir: &Path, prefix: &str, filter: &PathFilter, replica: &mut Replica) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = %dir.display(), error = %err, "skipping unreadable directory");
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(path = %dir.display(), error = %err, "skipping unreadable entry");
                continue;
            }
        };

        let name = entry.file_name().to_string_lossy().into_owned();
        let rel_path = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        if !filter.accept(&rel_path) {
            continue;
        }

        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(err) => {
                warn!(path = %rel_path, error = %err, "skipping entry without file type");
                continue;
            }
        };
        if file_type.is_symlink() {
            continue;
        }

        if file_type.is_dir() {
            replica.insert(Node::folder(rel_path.clone()));
            walk_local(&entry.path(), &rel_path, filter, replica);
        } else if file_type.is_file() {
            match entry.metadata() {
                Ok(metadata) => {
                    let mtime = metadata
                        .modified()
                        .map(unix_seconds)
                        .unwrap_or_default();
                    replica.insert(Node::file(rel_path, metadata.len(), mtime));
                }
                Err(err) => {
                    warn!(path = %rel_path, error = %err, "skipping entry without metadata");
                }
            }
        }
    }
}
