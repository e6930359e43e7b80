use std::{
    collections::HashMap,
    path::Path,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, unbounded};
use notify::{
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{ModifyKind, RenameMode},
};
use tracing::debug;

use crate::{filter::PathFilter, suppress::SuppressionSet};

/// Coalesced change ready for the reconciler's incremental path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeRecord {
    Upsert(String),
    Delete(String),
    Move { from: String, to: String },
}

impl ChangeRecord {
    fn sort_key(&self) -> &str {
        match self {
            ChangeRecord::Upsert(path) | ChangeRecord::Delete(path) => path,
            ChangeRecord::Move { from, .. } => from,
        }
    }
}

/// Normalized raw notification, path relative to the sync root.
#[derive(Clone, Debug)]
pub enum RawChange {
    Created(String),
    Modified(String),
    Deleted(String),
    MovedFrom { path: String, tracker: Option<usize> },
    MovedTo { path: String, tracker: Option<usize> },
    MovedPair { from: String, to: String },
}

/// Keeps the platform watcher alive and converts its events into
/// root-relative [`RawChange`]s on a channel the scheduler drains.
pub struct LocalWatcher {
    _watcher: RecommendedWatcher,
    rx: Receiver<RawChange>,
}

impl LocalWatcher {
    pub fn start(root: &Path) -> Result<Self> {
        let (tx, rx) = unbounded();
        let root_buf = root.to_path_buf();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                let Ok(event) = res else { return };
                for change in normalize(&root_buf, &event) {
                    let _ = tx.send(change);
                }
            },
            notify::Config::default(),
        )
        .context("failed to start filesystem watcher")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", root.display()))?;

        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    pub fn drain(&self) -> Vec<RawChange> {
        self.rx.try_iter().collect()
    }
}

fn relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let joined = rel
        .components()
        .map(|part| part.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    (!joined.is_empty()).then_some(joined)
}

fn normalize(root: &Path, event: &Event) -> Vec<RawChange> {
    let tracker = event.attrs.tracker();
    match &event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter_map(|p| relative(root, p))
            .map(RawChange::Created)
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .filter_map(|p| relative(root, p))
            .map(RawChange::Deleted)
            .collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => event
                .paths
                .first()
                .and_then(|p| relative(root, p))
                .map(|path| vec![RawChange::MovedFrom { path, tracker }])
                .unwrap_or_default(),
            RenameMode::To => event
                .paths
                .first()
                .and_then(|p| relative(root, p))
                .map(|path| vec![RawChange::MovedTo { path, tracker }])
                .unwrap_or_default(),
            _ => {
                if event.paths.len() == 2 {
                    match (
                        relative(root, &event.paths[0]),
                        relative(root, &event.paths[1]),
                    ) {
                        (Some(from), Some(to)) => vec![RawChange::MovedPair { from, to }],
                        _ => Vec::new(),
                    }
                } else {
                    event
                        .paths
                        .iter()
                        .filter_map(|p| relative(root, p))
                        .map(RawChange::Modified)
                        .collect()
                }
            }
        },
        EventKind::Modify(_) => event
            .paths
            .iter()
            .filter_map(|p| relative(root, p))
            .map(RawChange::Modified)
            .collect(),
        _ => Vec::new(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum BucketKind {
    Upsert,
    Delete,
    Move { from: String },
}

struct Bucket {
    kind: BucketKind,
    /// Whether this window saw the path come into existence, so a
    /// create followed by a delete cancels out entirely.
    born: bool,
    last: Instant,
}

/// Per-path accumulate-and-quiet-time buckets. A bucket is released
/// only after the debounce period of silence for its path; a file-write
/// burst collapses into a single record.
pub struct Debouncer {
    debounce: Duration,
    buckets: HashMap<String, Bucket>,
    pending_from: HashMap<usize, (String, Instant)>,
    suppression: SuppressionSet,
}

impl Debouncer {
    pub fn new(debounce: Duration, suppression: SuppressionSet) -> Self {
        Self {
            debounce,
            buckets: HashMap::new(),
            pending_from: HashMap::new(),
            suppression,
        }
    }

    pub fn ingest(&mut self, change: RawChange, now: Instant) {
        match change {
            RawChange::Created(path) => {
                if self.suppression.is_suppressed(&path) {
                    return;
                }
                let born = match self.buckets.get(&path) {
                    // Deleted earlier in the window: the path existed
                    // before it, so this create is a replacement.
                    Some(bucket) if bucket.kind == BucketKind::Delete => false,
                    Some(bucket) => bucket.born,
                    None => true,
                };
                self.buckets.insert(
                    path,
                    Bucket {
                        kind: BucketKind::Upsert,
                        born,
                        last: now,
                    },
                );
            }
            RawChange::Modified(path) => {
                if self.suppression.is_suppressed(&path) {
                    return;
                }
                let born = self
                    .buckets
                    .get(&path)
                    .map(|bucket| bucket.born)
                    .unwrap_or(false);
                self.buckets.insert(
                    path,
                    Bucket {
                        kind: BucketKind::Upsert,
                        born,
                        last: now,
                    },
                );
            }
            RawChange::Deleted(path) => {
                if self.suppression.is_suppressed(&path) {
                    return;
                }
                match self.buckets.get(&path) {
                    Some(bucket) if bucket.born => {
                        // Created and deleted within the window: nothing
                        // ever happened.
                        self.buckets.remove(&path);
                    }
                    _ => {
                        self.buckets.insert(
                            path,
                            Bucket {
                                kind: BucketKind::Delete,
                                born: false,
                                last: now,
                            },
                        );
                    }
                }
            }
            RawChange::MovedFrom { path, tracker } => {
                if self.suppression.is_suppressed(&path) {
                    return;
                }
                match tracker {
                    Some(tracker) => {
                        self.pending_from.insert(tracker, (path, now));
                    }
                    // No pairing cookie; the destination half (if any)
                    // will surface as an upsert.
                    None => self.ingest(RawChange::Deleted(path), now),
                }
            }
            RawChange::MovedTo { path, tracker } => {
                if self.suppression.is_suppressed(&path) {
                    return;
                }
                let paired = tracker.and_then(|tracker| self.pending_from.remove(&tracker));
                match paired {
                    Some((from, _)) => self.record_move(from, path, now),
                    None => self.ingest(RawChange::Created(path), now),
                }
            }
            RawChange::MovedPair { from, to } => {
                if self.suppression.is_suppressed(&from) || self.suppression.is_suppressed(&to) {
                    return;
                }
                self.record_move(from, to, now);
            }
        }
    }

    fn record_move(&mut self, from: String, to: String, now: Instant) {
        // Any accumulated state for the endpoints is superseded by the
        // move itself.
        self.buckets.remove(&from);
        self.buckets.remove(&to);
        self.buckets.insert(
            to,
            Bucket {
                kind: BucketKind::Move { from },
                born: false,
                last: now,
            },
        );
    }

    /// Releases every bucket quiet for at least the debounce period,
    /// filtered and sorted by path. Rename halves whose partner never
    /// arrived degrade to a delete.
    pub fn release(&mut self, now: Instant, filter: &PathFilter) -> Vec<ChangeRecord> {
        let expired_from: Vec<usize> = self
            .pending_from
            .iter()
            .filter(|(_, (_, seen))| now.duration_since(*seen) >= self.debounce)
            .map(|(tracker, _)| *tracker)
            .collect();
        for tracker in expired_from {
            if let Some((path, seen)) = self.pending_from.remove(&tracker) {
                debug!(path = %path, "rename source never paired, treating as delete");
                self.ingest(RawChange::Deleted(path), seen);
            }
        }

        let ready: Vec<String> = self
            .buckets
            .iter()
            .filter(|(_, bucket)| now.duration_since(bucket.last) >= self.debounce)
            .map(|(path, _)| path.clone())
            .collect();

        let mut records = Vec::new();
        for path in ready {
            let Some(bucket) = self.buckets.remove(&path) else {
                continue;
            };
            let record = match bucket.kind {
                BucketKind::Upsert => ChangeRecord::Upsert(path),
                BucketKind::Delete => ChangeRecord::Delete(path),
                BucketKind::Move { from } => ChangeRecord::Move { from, to: path },
            };
            if record_accepted(&record, filter) {
                records.push(record);
            }
        }

        records.sort_by(|a, b| a.sort_key().cmp(b.sort_key()));
        records
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty() && self.pending_from.is_empty()
    }
}

fn record_accepted(record: &ChangeRecord, filter: &PathFilter) -> bool {
    match record {
        ChangeRecord::Upsert(path) | ChangeRecord::Delete(path) => filter.accept(path),
        ChangeRecord::Move { from, to } => filter.accept(from) || filter.accept(to),
    }
}
