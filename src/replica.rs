use std::{
    collections::BTreeMap,
    fmt::Write as _,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Wall-clock time truncated to whole unix seconds, the resolution the
/// remote side stores.
pub fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(_) => 0,
    }
}

/// Like [`unix_seconds`] but rounded up, matching how the remote
/// service records mtimes on upload.
pub fn ceil_unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => {
            let secs = elapsed.as_secs() as i64;
            if elapsed.subsec_nanos() > 0 { secs + 1 } else { secs }
        }
        Err(_) => 0,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeKind {
    Folder,
    File,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Folder => "folder",
            NodeKind::File => "file",
        }
    }
}

/// A single file or folder, keyed by its slash-separated path relative
/// to the sync root. Folder sizes and mtimes are never compared; the
/// remote handle is required for every mutating drive call.
#[derive(Clone, Debug)]
pub struct Node {
    pub path: String,
    pub kind: NodeKind,
    pub size: u64,
    pub mtime: i64,
    pub handle: Option<String>,
    pub child_count: Option<u64>,
}

impl Node {
    pub fn folder(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: NodeKind::Folder,
            size: 0,
            mtime: 0,
            handle: None,
            child_count: None,
        }
    }

    pub fn file(path: impl Into<String>, size: u64, mtime: i64) -> Self {
        Self {
            path: path.into(),
            kind: NodeKind::File,
            size,
            mtime,
            handle: None,
            child_count: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn parent_path(&self) -> Option<&str> {
        parent_of(&self.path)
    }
}

pub fn parent_of(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

/// One side's tree as a flat path index. Moves rewrite the affected
/// keys, which keeps parent links consistent without pointer chasing.
#[derive(Default, Debug)]
pub struct Replica {
    nodes: BTreeMap<String, Node>,
    pub root_handle: Option<String>,
    pub declared_file_count: Option<u64>,
    pub trash_count: Option<u64>,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&Node> {
        self.nodes.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn insert(&mut self, node: Node) {
        self.nodes.insert(node.path.clone(), node);
    }

    /// Removes a node; for a folder the whole subtree goes with it.
    pub fn remove(&mut self, path: &str) {
        self.nodes.remove(path);
        let prefix = format!("{path}/");
        let descendants: Vec<String> = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in descendants {
            self.nodes.remove(&key);
        }
    }

    /// Atomic rename: rewrites the key of the node at `from` and of
    /// every descendant to live under `to`.
    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some(mut node) = self.nodes.remove(from) {
            node.path = to.to_string();
            self.nodes.insert(to.to_string(), node);
        }

        let prefix = format!("{from}/");
        let moved: Vec<String> = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in moved {
            if let Some(mut node) = self.nodes.remove(&key) {
                let new_path = format!("{to}/{}", &key[prefix.len()..]);
                node.path = new_path.clone();
                self.nodes.insert(new_path, node);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn file_count(&self) -> u64 {
        self.nodes
            .values()
            .filter(|node| node.kind == NodeKind::File)
            .count() as u64
    }

    /// Integrity gate comparison: does the counted file population match
    /// what the remote root declared?
    pub fn matches_declared(&self, declared: u64) -> bool {
        self.file_count() == declared
    }

    /// One `<kind>\t<size>\t<mtime>\t<path>` line per node, sorted by
    /// path. Used for the forensic state listings.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for node in self.nodes.values() {
            let _ = writeln!(
                out,
                "{}\t{}\t{}\t{}",
                node.kind.as_str(),
                node.size,
                node.mtime,
                node.path
            );
        }
        out
    }
}

/// Live replica slot shared between the reconciler (reads), the
/// executor (per-action writes) and the scanner (candidate swap).
#[derive(Clone)]
pub struct SharedReplica {
    inner: Arc<RwLock<Replica>>,
}

impl SharedReplica {
    pub fn new(replica: Replica) -> Self {
        Self {
            inner: Arc::new(RwLock::new(replica)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Replica> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Replica> {
        self.inner.write()
    }

    /// Commits a fully built candidate, returning the previous tree.
    pub fn swap(&self, candidate: Replica) -> Replica {
        std::mem::replace(&mut *self.inner.write(), candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Replica {
        let mut replica = Replica::new();
        replica.insert(Node::folder("docs"));
        replica.insert(Node::file("docs/a.txt", 10, 1_700_000_000));
        replica.insert(Node::folder("docs/sub"));
        replica.insert(Node::file("docs/sub/b.txt", 20, 1_700_000_100));
        replica.insert(Node::file("notes.md", 5, 1_700_000_200));
        replica
    }

    #[test]
    fn insert_and_lookup() {
        let replica = sample();
        assert_eq!(replica.node_count(), 5);
        assert_eq!(replica.file_count(), 3);
        assert_eq!(replica.get("docs/a.txt").unwrap().size, 10);
        assert!(replica.get("missing").is_none());
    }

    #[test]
    fn remove_folder_prunes_subtree() {
        let mut replica = sample();
        replica.remove("docs");
        assert_eq!(replica.node_count(), 1);
        assert!(replica.contains("notes.md"));
        assert!(!replica.contains("docs/sub/b.txt"));
    }

    #[test]
    fn remove_does_not_touch_sibling_prefixes() {
        let mut replica = Replica::new();
        replica.insert(Node::folder("doc"));
        replica.insert(Node::folder("docs"));
        replica.insert(Node::file("docs/a.txt", 1, 0));
        replica.remove("doc");
        assert!(replica.contains("docs"));
        assert!(replica.contains("docs/a.txt"));
    }

    #[test]
    fn rename_rewrites_descendant_paths() {
        let mut replica = sample();
        replica.rename("docs", "papers");
        assert!(!replica.contains("docs"));
        assert!(replica.contains("papers"));
        let node = replica.get("papers/sub/b.txt").unwrap();
        assert_eq!(node.path, "papers/sub/b.txt");
        assert_eq!(node.size, 20);
    }

    #[test]
    fn dump_is_sorted_and_tab_separated() {
        let replica = sample();
        let dump = replica.dump();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines[0], "folder\t0\t0\tdocs");
        assert_eq!(lines[1], "file\t10\t1700000000\tdocs/a.txt");
        assert_eq!(lines[4], "file\t5\t1700000200\tnotes.md");
    }

    #[test]
    fn declared_count_gate() {
        let replica = sample();
        assert!(replica.matches_declared(3));
        assert!(!replica.matches_declared(4));
    }

    #[test]
    fn shared_swap_replaces_tree() {
        let shared = SharedReplica::new(sample());
        let mut candidate = Replica::new();
        candidate.insert(Node::file("only.txt", 1, 0));
        let previous = shared.swap(candidate);
        assert_eq!(previous.node_count(), 5);
        assert_eq!(shared.read().node_count(), 1);
    }

    #[test]
    fn parent_path_helpers() {
        assert_eq!(parent_of("a/b/c"), Some("a/b"));
        assert_eq!(parent_of("top"), None);
        assert_eq!(Node::folder("a/b").name(), "b");
    }
}
