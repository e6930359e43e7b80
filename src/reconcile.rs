use std::{collections::HashMap, fs, path::Path};

use tracing::warn;

use crate::{
    replica::{Node, NodeKind, Replica, unix_seconds},
    watcher::ChangeRecord,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    CreateFolder { path: String, side: Side },
    DeleteNode { path: String, side: Side },
    UploadFile { path: String },
    DownloadFile { path: String },
    MoveNode { from: String, to: String, side: Side },
    SetMTime { path: String, side: Side, mtime: i64 },
}

impl Action {
    pub fn describe(&self) -> String {
        match self {
            Action::CreateFolder { path, side } => format!("create folder {path} ({side:?})"),
            Action::DeleteNode { path, side } => format!("delete {path} ({side:?})"),
            Action::UploadFile { path } => format!("upload {path}"),
            Action::DownloadFile { path } => format!("download {path}"),
            Action::MoveNode { from, to, side } => format!("move {from} -> {to} ({side:?})"),
            Action::SetMTime { path, side, mtime } => {
                format!("set mtime {mtime} on {path} ({side:?})")
            }
        }
    }
}

pub type Plan = Vec<Action>;

/// Two file nodes count as equal when their sizes match and the mtimes
/// are within one second, absorbing the remote's round-up on upload.
fn files_equal(local: &Node, remote: &Node) -> bool {
    local.size == remote.size && (local.mtime - remote.mtime).abs() <= 1
}

/// Cross-side plan: converge a local and a remote replica toward the
/// union with newer-wins. Emits creations parent-first in path order;
/// never deletes (deletions only arise from same-side refresh diffs or
/// watcher records).
pub fn plan_cross(local: &Replica, remote: &Replica) -> Plan {
    let mut plan = Plan::new();
    let mut skip_prefix: Option<String> = None;

    let mut paths: Vec<&String> = local.paths().chain(remote.paths()).collect();
    paths.sort();
    paths.dedup();

    for path in paths {
        if let Some(prefix) = &skip_prefix {
            if path.starts_with(prefix.as_str()) {
                continue;
            }
            skip_prefix = None;
        }

        match (local.get(path), remote.get(path)) {
            (Some(l), Some(r)) => {
                if l.kind != r.kind {
                    warn!(
                        path = %path,
                        local_kind = l.kind.as_str(),
                        remote_kind = r.kind.as_str(),
                        "kind mismatch, leaving both sides untouched"
                    );
                    skip_prefix = Some(format!("{path}/"));
                    continue;
                }
                if l.kind == NodeKind::Folder {
                    continue;
                }
                if files_equal(l, r) {
                    continue;
                }
                if l.mtime == r.mtime {
                    warn!(
                        path = %path,
                        local_size = l.size,
                        remote_size = r.size,
                        mtime = l.mtime,
                        "standoff: same mtime, different size; not touching either side"
                    );
                    continue;
                }
                if l.mtime > r.mtime {
                    plan.push(Action::UploadFile { path: path.clone() });
                } else {
                    plan.push(Action::DownloadFile { path: path.clone() });
                    plan.push(Action::SetMTime {
                        path: path.clone(),
                        side: Side::Local,
                        mtime: r.mtime,
                    });
                }
            }
            (Some(l), None) => match l.kind {
                NodeKind::Folder => plan.push(Action::CreateFolder {
                    path: path.clone(),
                    side: Side::Remote,
                }),
                NodeKind::File => plan.push(Action::UploadFile { path: path.clone() }),
            },
            (None, Some(r)) => match r.kind {
                NodeKind::Folder => plan.push(Action::CreateFolder {
                    path: path.clone(),
                    side: Side::Local,
                }),
                NodeKind::File => {
                    plan.push(Action::DownloadFile { path: path.clone() });
                    plan.push(Action::SetMTime {
                        path: path.clone(),
                        side: Side::Local,
                        mtime: r.mtime,
                    });
                }
            },
            (None, None) => unreachable!("path came from one of the replicas"),
        }
    }

    plan
}

/// Subtree signature used to recognize a moved folder: every contained
/// path relative to the folder, with kind/size/mtime.
fn folder_signature(replica: &Replica, folder: &str) -> Vec<(String, NodeKind, u64, i64)> {
    let prefix = format!("{folder}/");
    let mut signature: Vec<(String, NodeKind, u64, i64)> = replica
        .iter()
        .filter(|node| node.path.starts_with(&prefix))
        .map(|node| {
            (
                node.path[prefix.len()..].to_string(),
                node.kind,
                node.size,
                node.mtime,
            )
        })
        .collect();
    signature.sort();
    signature
}

fn depth_then_path_desc(paths: &mut [String]) {
    paths.sort_by(|a, b| {
        let depth_a = a.matches('/').count();
        let depth_b = b.matches('/').count();
        depth_b.cmp(&depth_a).then_with(|| a.cmp(b))
    });
}

/// Same-side plan between the live remote replica and a freshly scanned
/// candidate. Renames are recognized by unique metadata match and come
/// out as a single remote/local `MoveNode` pair; everything else is
/// mirrored to the local side (deletes, new folders, downloads).
/// Content changes at unchanged paths are left to [`plan_cross`].
pub fn plan_refresh(live: &Replica, candidate: &Replica, local: &Replica) -> Plan {
    let mut moves = Plan::new();
    let mut consumed_vanished: Vec<String> = Vec::new();
    let mut consumed_appeared: Vec<String> = Vec::new();

    let vanished: Vec<&Node> = live
        .iter()
        .filter(|node| !candidate.contains(&node.path))
        .collect();
    let appeared: Vec<&Node> = candidate
        .iter()
        .filter(|node| !live.contains(&node.path))
        .collect();

    // Folder renames first: one matched folder explains its whole
    // subtree on both lists.
    let vanished_folders: Vec<&Node> = vanished
        .iter()
        .copied()
        .filter(|node| node.kind == NodeKind::Folder)
        .collect();
    let appeared_folders: Vec<&Node> = appeared
        .iter()
        .copied()
        .filter(|node| node.kind == NodeKind::Folder)
        .collect();
    for gone in &vanished_folders {
        if consumed_vanished.iter().any(|p| covered(&gone.path, p)) {
            continue;
        }
        let signature = folder_signature(live, &gone.path);
        let matches: Vec<&&Node> = appeared_folders
            .iter()
            .filter(|new| {
                !consumed_appeared.iter().any(|p| covered(&new.path, p))
                    && folder_signature(candidate, &new.path) == signature
            })
            .collect();
        let twins = vanished_folders
            .iter()
            .filter(|other| folder_signature(live, &other.path) == signature)
            .count();
        if matches.len() == 1 && twins == 1 {
            let to = matches[0].path.clone();
            moves.push(Action::MoveNode {
                from: gone.path.clone(),
                to: to.clone(),
                side: Side::Remote,
            });
            moves.push(Action::MoveNode {
                from: gone.path.clone(),
                to: to.clone(),
                side: Side::Local,
            });
            consumed_vanished.push(gone.path.clone());
            consumed_appeared.push(to);
        }
    }

    // File renames by unique (size, mtime) match.
    let mut appeared_files: HashMap<(u64, i64), Vec<&&Node>> = HashMap::new();
    for new in appeared
        .iter()
        .filter(|node| node.kind == NodeKind::File)
        .filter(|node| !consumed_appeared.iter().any(|p| covered(&node.path, p)))
    {
        appeared_files.entry((new.size, new.mtime)).or_default().push(new);
    }
    let mut vanished_file_keys: HashMap<(u64, i64), usize> = HashMap::new();
    for gone in vanished
        .iter()
        .filter(|node| node.kind == NodeKind::File)
        .filter(|node| !consumed_vanished.iter().any(|p| covered(&node.path, p)))
    {
        *vanished_file_keys.entry((gone.size, gone.mtime)).or_default() += 1;
    }
    for gone in &vanished {
        if gone.kind != NodeKind::File {
            continue;
        }
        if consumed_vanished.iter().any(|p| covered(&gone.path, p)) {
            continue;
        }
        let key = (gone.size, gone.mtime);
        let candidates = appeared_files.get(&key);
        if vanished_file_keys.get(&key) == Some(&1)
            && candidates.is_some_and(|list| list.len() == 1)
        {
            let to = candidates.unwrap()[0].path.clone();
            moves.push(Action::MoveNode {
                from: gone.path.clone(),
                to: to.clone(),
                side: Side::Remote,
            });
            moves.push(Action::MoveNode {
                from: gone.path.clone(),
                to: to.clone(),
                side: Side::Local,
            });
            consumed_vanished.push(gone.path.clone());
            consumed_appeared.push(to);
        }
    }

    // Remaining appearances mirror to the local side, unless the local
    // replica already has the path (then newer-wins in the cross plan
    // decides).
    let mut creates = Plan::new();
    let mut downloads = Plan::new();
    for new in &appeared {
        if consumed_appeared.iter().any(|p| covered(&new.path, p)) {
            continue;
        }
        if local.contains(&new.path) {
            continue;
        }
        match new.kind {
            NodeKind::Folder => creates.push(Action::CreateFolder {
                path: new.path.clone(),
                side: Side::Local,
            }),
            NodeKind::File => {
                downloads.push(Action::DownloadFile {
                    path: new.path.clone(),
                });
                downloads.push(Action::SetMTime {
                    path: new.path.clone(),
                    side: Side::Local,
                    mtime: new.mtime,
                });
            }
        }
    }

    // Remaining vanishings delete locally, children before parents.
    let mut delete_paths: Vec<String> = vanished
        .iter()
        .filter(|node| !consumed_vanished.iter().any(|p| covered(&node.path, p)))
        .map(|node| node.path.clone())
        .collect();
    depth_then_path_desc(&mut delete_paths);
    let deletes: Plan = delete_paths
        .into_iter()
        .map(|path| Action::DeleteNode {
            path,
            side: Side::Local,
        })
        .collect();

    let mut plan = moves;
    plan.extend(creates);
    plan.extend(downloads);
    plan.extend(deletes);
    plan
}

fn covered(path: &str, consumed: &str) -> bool {
    path == consumed || path.starts_with(&format!("{consumed}/"))
}

/// Incremental path for released watcher batches: compares each changed
/// path's on-disk state against the live replicas and emits the minimal
/// convergence actions.
pub fn plan_local_changes(
    root: &Path,
    records: &[ChangeRecord],
    local: &Replica,
    remote: &Replica,
) -> Plan {
    let mut upserts = Plan::new();
    let mut moves = Plan::new();
    let mut delete_paths: Vec<String> = Vec::new();

    for record in records {
        match record {
            ChangeRecord::Upsert(path) => {
                plan_upsert(root, path, local, remote, &mut upserts);
            }
            ChangeRecord::Delete(path) => {
                if local.contains(path) || remote.contains(path) {
                    delete_paths.push(path.clone());
                }
            }
            ChangeRecord::Move { from, to } => {
                if remote.contains(from) {
                    moves.push(Action::MoveNode {
                        from: from.clone(),
                        to: to.clone(),
                        side: Side::Remote,
                    });
                    moves.push(Action::MoveNode {
                        from: from.clone(),
                        to: to.clone(),
                        side: Side::Local,
                    });
                } else {
                    // Never saw the source; treat the destination as new.
                    plan_upsert(root, to, local, remote, &mut upserts);
                }
            }
        }
    }

    depth_then_path_desc(&mut delete_paths);
    let mut plan = moves;
    plan.extend(upserts);
    for path in delete_paths {
        if local.contains(&path) {
            plan.push(Action::DeleteNode {
                path: path.clone(),
                side: Side::Local,
            });
        }
        if remote.contains(&path) {
            plan.push(Action::DeleteNode {
                path,
                side: Side::Remote,
            });
        }
    }
    plan
}

fn plan_upsert(root: &Path, path: &str, local: &Replica, remote: &Replica, plan: &mut Plan) {
    let disk_path = root.join(path);
    let metadata = match fs::symlink_metadata(&disk_path) {
        Ok(metadata) => metadata,
        Err(_) => return,
    };

    if metadata.is_dir() {
        if !local.contains(path) {
            plan.push(Action::CreateFolder {
                path: path.to_string(),
                side: Side::Local,
            });
        }
        if !remote.contains(path) {
            plan.push(Action::CreateFolder {
                path: path.to_string(),
                side: Side::Remote,
            });
        }
        return;
    }
    if !metadata.is_file() {
        return;
    }

    let size = metadata.len();
    let mtime = metadata.modified().map(unix_seconds).unwrap_or_default();
    let disk_node = Node::file(path, size, mtime);

    match remote.get(path) {
        None => plan.push(Action::UploadFile {
            path: path.to_string(),
        }),
        Some(r) if r.kind == NodeKind::Folder => {
            warn!(path = %path, "local file shadows a remote folder, skipping");
        }
        Some(r) => {
            if files_equal(&disk_node, r) {
                return;
            }
            if mtime == r.mtime {
                warn!(
                    path = %path,
                    local_size = size,
                    remote_size = r.size,
                    mtime,
                    "standoff: same mtime, different size; not touching either side"
                );
                return;
            }
            if mtime > r.mtime {
                plan.push(Action::UploadFile {
                    path: path.to_string(),
                });
            } else {
                plan.push(Action::DownloadFile {
                    path: path.to_string(),
                });
                plan.push(Action::SetMTime {
                    path: path.to_string(),
                    side: Side::Local,
                    mtime: r.mtime,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_remote() -> (Replica, Replica) {
        (Replica::new(), Replica::new())
    }

    /// Index-level interpreter used to check convergence: applies a
    /// cross-side plan to both replicas the way the executor commits
    /// its actions.
    fn apply_cross(plan: &Plan, local: &mut Replica, remote: &mut Replica) {
        for action in plan {
            match action {
                Action::CreateFolder { path, side } => match side {
                    Side::Local => local.insert(Node::folder(path.clone())),
                    Side::Remote => remote.insert(Node::folder(path.clone())),
                },
                Action::UploadFile { path } => {
                    let node = local.get(path).expect("upload source").clone();
                    remote.insert(Node::file(path.clone(), node.size, node.mtime));
                }
                Action::DownloadFile { path } => {
                    let node = remote.get(path).expect("download source").clone();
                    local.insert(Node::file(path.clone(), node.size, node.mtime));
                }
                Action::SetMTime { path, side, mtime } => {
                    let replica = match side {
                        Side::Local => &mut *local,
                        Side::Remote => &mut *remote,
                    };
                    if let Some(existing) = replica.get(path).cloned() {
                        replica.insert(Node::file(path.clone(), existing.size, *mtime));
                    }
                }
                Action::DeleteNode { path, side } => match side {
                    Side::Local => local.remove(path),
                    Side::Remote => remote.remove(path),
                },
                Action::MoveNode { from, to, side } => match side {
                    Side::Local => local.rename(from, to),
                    Side::Remote => remote.rename(from, to),
                },
            }
        }
    }

    fn assert_converged(local: &Replica, remote: &Replica) {
        let local_paths: Vec<&String> = local.paths().collect();
        let remote_paths: Vec<&String> = remote.paths().collect();
        assert_eq!(local_paths, remote_paths);
        for node in local.iter() {
            let twin = remote.get(&node.path).unwrap();
            assert_eq!(node.kind, twin.kind, "kind of {}", node.path);
            if node.kind == NodeKind::File {
                assert_eq!(node.size, twin.size, "size of {}", node.path);
                assert!((node.mtime - twin.mtime).abs() <= 1, "mtime of {}", node.path);
            }
        }
    }

    #[test]
    fn new_local_file_uploads() {
        let (mut local, mut remote) = local_remote();
        local.insert(Node::folder("A"));
        local.insert(Node::file("A/file.txt", 100, 1_700_000_000));
        remote.insert(Node::folder("A"));

        let plan = plan_cross(&local, &remote);
        assert_eq!(
            plan,
            vec![Action::UploadFile {
                path: "A/file.txt".to_string()
            }]
        );

        apply_cross(&plan, &mut local, &mut remote);
        assert_converged(&local, &remote);
        let uploaded = remote.get("A/file.txt").unwrap();
        assert_eq!((uploaded.size, uploaded.mtime), (100, 1_700_000_000));
    }

    #[test]
    fn standoff_leaves_both_sides_alone() {
        let (mut local, mut remote) = local_remote();
        local.insert(Node::file("notes.md", 50, 1_700_000_000));
        remote.insert(Node::file("notes.md", 60, 1_700_000_000));

        assert!(plan_cross(&local, &remote).is_empty());
    }

    #[test]
    fn rounding_skew_counts_as_equal() {
        let (mut local, mut remote) = local_remote();
        local.insert(Node::file("a.bin", 10, 1_700_000_000));
        remote.insert(Node::file("a.bin", 10, 1_700_000_001));

        assert!(plan_cross(&local, &remote).is_empty());
    }

    #[test]
    fn newer_side_wins_each_way() {
        let (mut local, mut remote) = local_remote();
        local.insert(Node::file("newer_local.txt", 10, 1_700_000_100));
        remote.insert(Node::file("newer_local.txt", 12, 1_700_000_000));
        local.insert(Node::file("newer_remote.txt", 10, 1_700_000_000));
        remote.insert(Node::file("newer_remote.txt", 12, 1_700_000_100));

        let plan = plan_cross(&local, &remote);
        assert_eq!(
            plan,
            vec![
                Action::UploadFile {
                    path: "newer_local.txt".to_string()
                },
                Action::DownloadFile {
                    path: "newer_remote.txt".to_string()
                },
                Action::SetMTime {
                    path: "newer_remote.txt".to_string(),
                    side: Side::Local,
                    mtime: 1_700_000_100,
                },
            ]
        );
    }

    #[test]
    fn kind_mismatch_skips_subtree() {
        let (mut local, mut remote) = local_remote();
        local.insert(Node::folder("clash"));
        local.insert(Node::file("clash/inner.txt", 5, 1_700_000_000));
        remote.insert(Node::file("clash", 9, 1_700_000_000));

        assert!(plan_cross(&local, &remote).is_empty());
    }

    #[test]
    fn cross_plan_converges_arbitrary_trees() {
        let (mut local, mut remote) = local_remote();
        local.insert(Node::folder("docs"));
        local.insert(Node::file("docs/a.txt", 10, 1_700_000_000));
        local.insert(Node::file("docs/local_only.txt", 4, 1_700_000_050));
        remote.insert(Node::folder("docs"));
        remote.insert(Node::file("docs/a.txt", 11, 1_700_000_500));
        remote.insert(Node::folder("music"));
        remote.insert(Node::file("music/song.mp3", 900, 1_700_000_200));

        let plan = plan_cross(&local, &remote);
        apply_cross(&plan, &mut local, &mut remote);
        assert_converged(&local, &remote);
    }

    #[test]
    fn folder_creations_precede_contained_actions() {
        let (mut local, remote) = local_remote();
        local.insert(Node::folder("x"));
        local.insert(Node::folder("x/y"));
        local.insert(Node::file("x/y/z.txt", 1, 1_700_000_000));

        let plan = plan_cross(&local, &remote);
        let create_x = plan
            .iter()
            .position(|a| matches!(a, Action::CreateFolder { path, .. } if path == "x"))
            .unwrap();
        let create_y = plan
            .iter()
            .position(|a| matches!(a, Action::CreateFolder { path, .. } if path == "x/y"))
            .unwrap();
        let upload = plan
            .iter()
            .position(|a| matches!(a, Action::UploadFile { path } if path == "x/y/z.txt"))
            .unwrap();
        assert!(create_x < create_y && create_y < upload);
    }

    #[test]
    fn remote_rename_becomes_single_move_pair() {
        let mut live = Replica::new();
        live.insert(Node::folder("docs"));
        live.insert(Node::file("docs/old.pdf", 500, 1_700_000_000));
        let mut candidate = Replica::new();
        candidate.insert(Node::folder("docs"));
        candidate.insert(Node::file("docs/new.pdf", 500, 1_700_000_000));

        let mut local = Replica::new();
        local.insert(Node::folder("docs"));
        local.insert(Node::file("docs/old.pdf", 500, 1_700_000_000));

        let plan = plan_refresh(&live, &candidate, &local);
        assert_eq!(
            plan,
            vec![
                Action::MoveNode {
                    from: "docs/old.pdf".to_string(),
                    to: "docs/new.pdf".to_string(),
                    side: Side::Remote,
                },
                Action::MoveNode {
                    from: "docs/old.pdf".to_string(),
                    to: "docs/new.pdf".to_string(),
                    side: Side::Local,
                },
            ]
        );
    }

    #[test]
    fn folder_rename_moves_subtree_without_creates_or_deletes() {
        let mut live = Replica::new();
        live.insert(Node::folder("old"));
        live.insert(Node::file("old/a.txt", 1, 1_700_000_000));
        live.insert(Node::file("old/b.txt", 2, 1_700_000_001));
        let mut candidate = Replica::new();
        candidate.insert(Node::folder("new"));
        candidate.insert(Node::file("new/a.txt", 1, 1_700_000_000));
        candidate.insert(Node::file("new/b.txt", 2, 1_700_000_001));

        let plan = plan_refresh(&live, &candidate, &live);
        let moves: Vec<&Action> = plan
            .iter()
            .filter(|a| matches!(a, Action::MoveNode { .. }))
            .collect();
        assert_eq!(moves.len(), 2);
        assert_eq!(
            moves[0],
            &Action::MoveNode {
                from: "old".to_string(),
                to: "new".to_string(),
                side: Side::Remote,
            }
        );
        assert!(!plan.iter().any(|a| matches!(
            a,
            Action::CreateFolder { .. } | Action::DeleteNode { .. } | Action::DownloadFile { .. }
        )));
    }

    #[test]
    fn remote_folder_loss_deletes_children_first() {
        let mut live = Replica::new();
        live.insert(Node::folder("X"));
        live.insert(Node::file("X/a", 1, 1_700_000_000));
        live.insert(Node::file("X/b", 2, 1_700_000_200));
        let candidate = Replica::new();

        let mut local = Replica::new();
        local.insert(Node::folder("X"));
        local.insert(Node::file("X/a", 1, 1_700_000_000));
        local.insert(Node::file("X/b", 2, 1_700_000_200));

        let plan = plan_refresh(&live, &candidate, &local);
        assert_eq!(
            plan,
            vec![
                Action::DeleteNode {
                    path: "X/a".to_string(),
                    side: Side::Local,
                },
                Action::DeleteNode {
                    path: "X/b".to_string(),
                    side: Side::Local,
                },
                Action::DeleteNode {
                    path: "X".to_string(),
                    side: Side::Local,
                },
            ]
        );
    }

    #[test]
    fn appeared_path_already_known_locally_defers_to_cross_plan() {
        let live = Replica::new();
        let mut candidate = Replica::new();
        candidate.insert(Node::file("shared.txt", 10, 1_700_000_000));
        let mut local = Replica::new();
        local.insert(Node::file("shared.txt", 12, 1_700_000_900));

        assert!(plan_refresh(&live, &candidate, &local).is_empty());
    }

    #[test]
    fn watcher_delete_mirrors_to_remote() {
        let dir = tempfile::tempdir().unwrap();
        let mut local = Replica::new();
        local.insert(Node::file("gone.txt", 10, 1_700_000_000));
        let mut remote = Replica::new();
        remote.insert(Node::file("gone.txt", 10, 1_700_000_000));

        let records = vec![ChangeRecord::Delete("gone.txt".to_string())];
        let plan = plan_local_changes(dir.path(), &records, &local, &remote);
        assert_eq!(
            plan,
            vec![
                Action::DeleteNode {
                    path: "gone.txt".to_string(),
                    side: Side::Local,
                },
                Action::DeleteNode {
                    path: "gone.txt".to_string(),
                    side: Side::Remote,
                },
            ]
        );
    }

    #[test]
    fn watcher_upsert_uploads_new_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("fresh.txt"), b"payload").unwrap();

        let local = Replica::new();
        let remote = Replica::new();
        let records = vec![ChangeRecord::Upsert("fresh.txt".to_string())];
        let plan = plan_local_changes(dir.path(), &records, &local, &remote);
        assert_eq!(
            plan,
            vec![Action::UploadFile {
                path: "fresh.txt".to_string()
            }]
        );
    }

    #[test]
    fn watcher_move_pairs_remote_and_local() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = Replica::new();
        remote.insert(Node::file("a.txt", 10, 1_700_000_000));
        let mut local = Replica::new();
        local.insert(Node::file("a.txt", 10, 1_700_000_000));

        let records = vec![ChangeRecord::Move {
            from: "a.txt".to_string(),
            to: "b.txt".to_string(),
        }];
        let plan = plan_local_changes(dir.path(), &records, &local, &remote);
        assert_eq!(
            plan,
            vec![
                Action::MoveNode {
                    from: "a.txt".to_string(),
                    to: "b.txt".to_string(),
                    side: Side::Remote,
                },
                Action::MoveNode {
                    from: "a.txt".to_string(),
                    to: "b.txt".to_string(),
                    side: Side::Local,
                },
            ]
        );
    }
}
