use std::{
    fs,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, UNIX_EPOCH},
};

use crossbeam_channel::{Sender, bounded, unbounded};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    drive::{DriveClient, DriveResult},
    reconcile::{Action, Plan, Side},
    replica::{Node, SharedReplica, ceil_unix_seconds, parent_of, unix_seconds},
    suppress::SuppressionSet,
};

#[derive(Clone, Debug)]
pub struct DeadLetter {
    pub action: Action,
    pub error: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub applied: usize,
    pub failed: usize,
}

#[derive(Clone, Debug)]
pub struct ExecutorOptions {
    pub max_workers: usize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub quiescence: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_workers: 32,
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
            quiescence: Duration::from_secs(12),
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-width pool of named worker threads fed over a crossbeam
/// channel. Jobs on a width-1 pool execute strictly in submission
/// order.
struct WorkerPool {
    tx: Sender<Job>,
}

impl WorkerPool {
    fn new(name: &str, width: usize) -> Self {
        let (tx, rx) = unbounded::<Job>();
        for index in 0..width.max(1) {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("failed to spawn pool worker");
        }
        Self { tx }
    }

    fn submit(&self, job: Job) {
        let _ = self.tx.send(job);
    }
}

/// Work units after plan preprocessing: a `SetMTime` immediately
/// following its own download runs inside the same job so the pair
/// cannot reorder on the elastic pool.
enum WorkItem {
    Single(Action),
    DownloadWithMTime { path: String, mtime: i64 },
}

/// Applies ordered plans against the drive and the local disk. Remote
/// mutations ride a width-1 pool because the remote service rejects
/// concurrent zone mutations; downloads and local work fan out on the
/// elastic pool. Successful actions commit to the live replicas.
pub struct Executor {
    core: Arc<Core>,
    serial: WorkerPool,
    elastic: WorkerPool,
}

struct Core {
    client: Arc<dyn DriveClient>,
    root: PathBuf,
    local: SharedReplica,
    remote: SharedReplica,
    suppression: SuppressionSet,
    options: ExecutorOptions,
    cancel: Arc<AtomicBool>,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl Executor {
    pub fn new(
        client: Arc<dyn DriveClient>,
        root: PathBuf,
        local: SharedReplica,
        remote: SharedReplica,
        suppression: SuppressionSet,
        cancel: Arc<AtomicBool>,
        options: ExecutorOptions,
    ) -> Self {
        let elastic_width = options.max_workers;
        Self {
            core: Arc::new(Core {
                client,
                root,
                local,
                remote,
                suppression,
                options,
                cancel,
                dead_letters: Mutex::new(Vec::new()),
            }),
            serial: WorkerPool::new("remote-writer", 1),
            elastic: WorkerPool::new("sync-worker", elastic_width),
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.core.dead_letters.lock().clone()
    }

    /// Executes the plan and blocks until every action has settled.
    /// Phases keep dependent actions apart: moves free paths first,
    /// folders exist before their contents transfer, deletions go last.
    pub fn run(&self, plan: Plan) -> RunSummary {
        let applied = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        let items = fuse_set_mtime(plan);
        for phase in [Phase::Moves, Phase::Creates, Phase::Transfers, Phase::Deletes] {
            if self.core.cancel.load(Ordering::SeqCst) {
                info!("cancelled, abandoning remainder of plan");
                break;
            }

            let (done_tx, done_rx) = bounded::<()>(items.len().max(1));
            let mut in_flight = 0;
            for item in items.iter().filter(|item| phase_of(item) == phase) {
                let core = self.core.clone();
                let item = clone_item(item);
                let applied = applied.clone();
                let failed = failed.clone();
                let done = done_tx.clone();
                let is_remote_mutation = remote_mutation(&item);
                let job: Job = Box::new(move || {
                    if !core.cancel.load(Ordering::SeqCst) {
                        match core.execute(&item) {
                            Ok(()) => {
                                applied.fetch_add(1, Ordering::SeqCst);
                            }
                            Err(message) => {
                                failed.fetch_add(1, Ordering::SeqCst);
                                core.dead_letter(&item, message);
                            }
                        }
                    }
                    let _ = done.send(());
                });
                if is_remote_mutation {
                    self.serial.submit(job);
                } else {
                    self.elastic.submit(job);
                }
                in_flight += 1;
            }
            drop(done_tx);
            for _ in 0..in_flight {
                let _ = done_rx.recv();
            }
        }

        RunSummary {
            applied: applied.load(Ordering::SeqCst),
            failed: failed.load(Ordering::SeqCst),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Moves,
    Creates,
    Transfers,
    Deletes,
}

fn phase_of(item: &WorkItem) -> Phase {
    match item {
        WorkItem::DownloadWithMTime { .. } => Phase::Transfers,
        WorkItem::Single(action) => match action {
            Action::MoveNode { .. } => Phase::Moves,
            Action::CreateFolder { .. } => Phase::Creates,
            Action::UploadFile { .. } | Action::DownloadFile { .. } | Action::SetMTime { .. } => {
                Phase::Transfers
            }
            Action::DeleteNode { .. } => Phase::Deletes,
        },
    }
}

fn remote_mutation(item: &WorkItem) -> bool {
    match item {
        WorkItem::DownloadWithMTime { .. } => false,
        WorkItem::Single(action) => matches!(
            action,
            Action::UploadFile { .. }
                | Action::CreateFolder {
                    side: Side::Remote,
                    ..
                }
                | Action::DeleteNode {
                    side: Side::Remote,
                    ..
                }
                | Action::MoveNode {
                    side: Side::Remote,
                    ..
                }
        ),
    }
}

fn clone_item(item: &WorkItem) -> WorkItem {
    match item {
        WorkItem::Single(action) => WorkItem::Single(action.clone()),
        WorkItem::DownloadWithMTime { path, mtime } => WorkItem::DownloadWithMTime {
            path: path.clone(),
            mtime: *mtime,
        },
    }
}

fn fuse_set_mtime(plan: Plan) -> Vec<WorkItem> {
    let mut items = Vec::with_capacity(plan.len());
    let mut iter = plan.into_iter().peekable();
    while let Some(action) = iter.next() {
        if let Action::DownloadFile { path } = &action {
            if let Some(Action::SetMTime {
                path: mtime_path,
                side: Side::Local,
                mtime,
            }) = iter.peek()
            {
                if mtime_path == path {
                    let item = WorkItem::DownloadWithMTime {
                        path: path.clone(),
                        mtime: *mtime,
                    };
                    iter.next();
                    items.push(item);
                    continue;
                }
            }
        }
        items.push(WorkItem::Single(action));
    }
    items
}

impl Core {
    fn dead_letter(&self, item: &WorkItem, message: String) {
        let action = match item {
            WorkItem::Single(action) => action.clone(),
            WorkItem::DownloadWithMTime { path, .. } => Action::DownloadFile { path: path.clone() },
        };
        error!(action = %action.describe(), error = %message, "action failed for good");
        self.dead_letters.lock().push(DeadLetter {
            action,
            error: message,
        });
    }

    fn execute(&self, item: &WorkItem) -> Result<(), String> {
        match item {
            WorkItem::DownloadWithMTime { path, mtime } => self.download(path, Some(*mtime)),
            WorkItem::Single(action) => match action {
                Action::CreateFolder {
                    path,
                    side: Side::Remote,
                } => self.create_remote_folder(path),
                Action::CreateFolder {
                    path,
                    side: Side::Local,
                } => self.create_local_folder(path),
                Action::UploadFile { path } => self.upload(path),
                Action::DownloadFile { path } => self.download(path, None),
                Action::DeleteNode {
                    path,
                    side: Side::Remote,
                } => self.delete_remote(path),
                Action::DeleteNode {
                    path,
                    side: Side::Local,
                } => self.delete_local(path),
                Action::MoveNode {
                    from,
                    to,
                    side: Side::Remote,
                } => self.move_remote(from, to),
                Action::MoveNode {
                    from,
                    to,
                    side: Side::Local,
                } => self.move_local(from, to),
                Action::SetMTime {
                    path,
                    side: Side::Local,
                    mtime,
                } => self.set_local_mtime(path, *mtime),
                Action::SetMTime {
                    side: Side::Remote, ..
                } => {
                    // The drive only records mtimes at upload time.
                    debug!("ignoring remote set-mtime");
                    Ok(())
                }
            },
        }
    }

    fn with_retry<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> DriveResult<T>,
    ) -> Result<T, String> {
        let mut delay = self.options.retry_delay;
        let mut attempt = 1;
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(format!("{what}: cancelled"));
            }
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.options.max_attempts => {
                    warn!(
                        what,
                        attempt,
                        error = %err,
                        backoff_ms = delay.as_millis() as u64,
                        "transient remote failure, retrying"
                    );
                    thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(format!("{what}: {err}")),
            }
        }
    }

    fn remote_parent_handle(&self, path: &str) -> Result<String, String> {
        let remote = self.remote.read();
        match parent_of(path) {
            Some(parent) => remote
                .get(parent)
                .and_then(|node| node.handle.clone())
                .ok_or_else(|| format!("no handle for parent folder {parent}")),
            None => remote
                .root_handle
                .clone()
                .ok_or_else(|| "remote root handle unknown".to_string()),
        }
    }

    fn create_remote_folder(&self, path: &str) -> Result<(), String> {
        if self.remote.read().contains(path) {
            return Ok(());
        }
        let parent = self.remote_parent_handle(path)?;
        let name = path.rsplit('/').next().unwrap_or(path);
        let handle =
            self.with_retry("create remote folder", || {
                self.client.create_folder(&parent, name)
            })?;
        info!(path, "created remote folder");
        self.remote
            .write()
            .insert(Node::folder(path).with_handle(handle));
        Ok(())
    }

    fn create_local_folder(&self, path: &str) -> Result<(), String> {
        let disk_path = self.root.join(path);
        self.suppression.hold(path);
        let result = fs::create_dir_all(&disk_path)
            .map_err(|err| format!("create {}: {err}", disk_path.display()));
        self.suppression
            .release_after(path, self.options.quiescence);
        result?;
        self.local.write().insert(Node::folder(path));
        debug!(path, "created local folder");
        Ok(())
    }

    fn upload(&self, path: &str) -> Result<(), String> {
        let disk_path = self.root.join(path);
        let metadata =
            fs::metadata(&disk_path).map_err(|err| format!("stat {}: {err}", disk_path.display()))?;
        let modified = metadata
            .modified()
            .map_err(|err| format!("mtime of {}: {err}", disk_path.display()))?;
        // The drive rounds mtimes up to the next whole second on write;
        // record the value it will actually store.
        let remote_mtime = ceil_unix_seconds(modified);

        let parent = self.remote_parent_handle(path)?;
        let name = path.rsplit('/').next().unwrap_or(path);
        let handle = self.with_retry("upload", || {
            self.client.upload(&parent, name, &disk_path, remote_mtime)
        })?;
        info!(path, size = metadata.len(), "uploaded");

        let mut remote = self.remote.write();
        remote.insert(Node::file(path, metadata.len(), remote_mtime).with_handle(handle));
        drop(remote);
        self.local
            .write()
            .insert(Node::file(path, metadata.len(), unix_seconds(modified)));
        Ok(())
    }

    fn download(&self, path: &str, mtime: Option<i64>) -> Result<(), String> {
        let (handle, remote_mtime) = {
            let remote = self.remote.read();
            let node = remote
                .get(path)
                .ok_or_else(|| format!("{path} not in remote replica"))?;
            let handle = node
                .handle
                .clone()
                .ok_or_else(|| format!("no handle for {path}"))?;
            (handle, node.mtime)
        };
        let target_mtime = mtime.unwrap_or(remote_mtime);

        let disk_path = self.root.join(path);
        self.suppression.hold(path);
        let result: Result<(), String> = (|| {
            if let Some(parent) = disk_path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| format!("create {}: {err}", parent.display()))?;
            }
            self.with_retry("download", || self.client.download(&handle, &disk_path))?;
            set_file_mtime(&disk_path, target_mtime)?;
            Ok(())
        })();
        self.suppression
            .release_after(path, self.options.quiescence);
        result?;

        let size = fs::metadata(&disk_path).map(|m| m.len()).unwrap_or(0);
        info!(path, size, "downloaded");
        self.local
            .write()
            .insert(Node::file(path, size, target_mtime));
        Ok(())
    }

    fn delete_remote(&self, path: &str) -> Result<(), String> {
        let handle = match self.remote.read().get(path).and_then(|n| n.handle.clone()) {
            Some(handle) => handle,
            None => return Ok(()),
        };
        match self.with_retry("delete remote", || self.client.delete(&handle)) {
            Ok(()) => {}
            // Already gone remotely; the goal state holds.
            Err(message) if message.contains("not found") => {
                debug!(path, "remote delete target already absent");
            }
            Err(message) => return Err(message),
        }
        info!(path, "deleted remotely");
        self.remote.write().remove(path);
        Ok(())
    }

    fn delete_local(&self, path: &str) -> Result<(), String> {
        let disk_path = self.root.join(path);
        self.suppression.hold(path);
        let result = match fs::symlink_metadata(&disk_path) {
            Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&disk_path)
                .map_err(|err| format!("remove {}: {err}", disk_path.display())),
            Ok(_) => fs::remove_file(&disk_path)
                .map_err(|err| format!("remove {}: {err}", disk_path.display())),
            // Already gone; just retire the index entry.
            Err(_) => Ok(()),
        };
        self.suppression
            .release_after(path, self.options.quiescence);
        result?;
        info!(path, "deleted locally");
        self.local.write().remove(path);
        Ok(())
    }

    fn move_remote(&self, from: &str, to: &str) -> Result<(), String> {
        {
            let remote = self.remote.read();
            if !remote.contains(from) {
                // A refresh already observed the rename on the drive;
                // nothing left to do remotely.
                return Ok(());
            }
        }
        let handle = self
            .remote
            .read()
            .get(from)
            .and_then(|n| n.handle.clone())
            .ok_or_else(|| format!("no handle for {from}"))?;
        let new_parent = self.remote_parent_handle(to)?;
        let new_name = to.rsplit('/').next().unwrap_or(to);
        self.with_retry("move remote", || {
            self.client.rename(&handle, &new_parent, new_name)
        })?;
        info!(from, to, "moved remotely");
        self.remote.write().rename(from, to);
        Ok(())
    }

    fn move_local(&self, from: &str, to: &str) -> Result<(), String> {
        let from_disk = self.root.join(from);
        let to_disk = self.root.join(to);
        self.suppression.hold(from);
        self.suppression.hold(to);
        let result = (|| {
            if !from_disk.exists() {
                // Source already gone (the watcher saw the user do it);
                // only the index needs the rename.
                return Ok(());
            }
            if let Some(parent) = to_disk.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| format!("create {}: {err}", parent.display()))?;
            }
            fs::rename(&from_disk, &to_disk)
                .map_err(|err| format!("rename {} -> {}: {err}", from, to))
        })();
        self.suppression
            .release_after(from, self.options.quiescence);
        self.suppression.release_after(to, self.options.quiescence);
        result?;
        info!(from, to, "moved locally");
        self.local.write().rename(from, to);
        Ok(())
    }

    fn set_local_mtime(&self, path: &str, mtime: i64) -> Result<(), String> {
        let disk_path = self.root.join(path);
        self.suppression.hold(path);
        let result = set_file_mtime(&disk_path, mtime);
        self.suppression
            .release_after(path, self.options.quiescence);
        result?;
        let mut local = self.local.write();
        if let Some(node) = local.get(path).cloned() {
            local.insert(Node {
                mtime,
                ..node
            });
        }
        Ok(())
    }
}

fn set_file_mtime(path: &std::path::Path, mtime: i64) -> Result<(), String> {
    let time = UNIX_EPOCH + Duration::from_secs(mtime.max(0) as u64);
    let file = fs::File::options()
        .write(true)
        .open(path)
        .map_err(|err| format!("open {}: {err}", path.display()))?;
    file.set_modified(time)
        .map_err(|err| format!("set mtime of {}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::{DriveError, DriveItem, DriveResult, MemoryDrive, RootInfo};
    use crate::filter::PathFilter;
    use crate::replica::Replica;
    use crate::scanner::{scan_local, scan_remote};
    use std::path::Path;

    fn pass_all() -> PathFilter {
        PathFilter::new(&[], &[]).unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        drive: MemoryDrive,
        local: SharedReplica,
        remote: SharedReplica,
        suppression: SuppressionSet,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            Self {
                _dir: dir,
                root,
                drive: MemoryDrive::new(),
                local: SharedReplica::new(Replica::new()),
                remote: SharedReplica::new(Replica::new()),
                suppression: SuppressionSet::new(),
            }
        }

        fn rescan(&self) {
            let local = scan_local(&self.root, &pass_all());
            self.local.swap(local);
            let remote = scan_remote(&self.drive, &pass_all(), 2).unwrap();
            self.remote.swap(remote);
        }

        fn executor(&self, options: ExecutorOptions) -> Executor {
            Executor::new(
                Arc::new(self.drive.clone()),
                self.root.clone(),
                self.local.clone(),
                self.remote.clone(),
                self.suppression.clone(),
                Arc::new(AtomicBool::new(false)),
                options,
            )
        }
    }

    fn fast_options() -> ExecutorOptions {
        ExecutorOptions {
            max_workers: 4,
            max_attempts: 3,
            retry_delay: Duration::from_millis(5),
            quiescence: Duration::from_secs(30),
        }
    }

    #[test]
    fn upload_records_rounded_mtime() {
        let fixture = Fixture::new();
        fs::create_dir_all(fixture.root.join("A")).unwrap();
        let file = fixture.root.join("A/file.txt");
        fs::write(&file, vec![0u8; 100]).unwrap();
        let fractional = UNIX_EPOCH + Duration::new(1_700_000_000, 250_000_000);
        fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(fractional)
            .unwrap();

        fixture.drive.add_folder("A");
        fixture.rescan();

        let executor = fixture.executor(fast_options());
        let summary = executor.run(vec![Action::UploadFile {
            path: "A/file.txt".to_string(),
        }]);
        assert_eq!(summary, RunSummary { applied: 1, failed: 0 });

        let remote = fixture.remote.read();
        let node = remote.get("A/file.txt").unwrap();
        assert_eq!(node.size, 100);
        assert_eq!(node.mtime, 1_700_000_001);
        assert!(node.handle.is_some());
        let (_, size, mtime) = fixture
            .drive
            .entry_for_test(node.handle.as_ref().unwrap())
            .unwrap();
        assert_eq!((size, mtime), (100, 1_700_000_001));
    }

    #[test]
    fn download_writes_file_and_sets_mtime() {
        let fixture = Fixture::new();
        fixture.drive.add_file("docs/img.png", 64, 1_700_000_500);
        fixture.rescan();

        let executor = fixture.executor(fast_options());
        let summary = executor.run(vec![
            Action::CreateFolder {
                path: "docs".to_string(),
                side: Side::Local,
            },
            Action::DownloadFile {
                path: "docs/img.png".to_string(),
            },
            Action::SetMTime {
                path: "docs/img.png".to_string(),
                side: Side::Local,
                mtime: 1_700_000_500,
            },
        ]);
        assert_eq!(summary.failed, 0);

        let disk = fixture.root.join("docs/img.png");
        let metadata = fs::metadata(&disk).unwrap();
        assert_eq!(metadata.len(), 64);
        assert_eq!(unix_seconds(metadata.modified().unwrap()), 1_700_000_500);
        assert_eq!(fixture.local.read().get("docs/img.png").unwrap().mtime, 1_700_000_500);
    }

    #[test]
    fn local_mutations_are_suppressed_through_quiescence() {
        let fixture = Fixture::new();
        fixture.drive.add_file("img.png", 16, 1_700_000_000);
        fixture.rescan();

        let executor = fixture.executor(fast_options());
        executor.run(vec![Action::DownloadFile {
            path: "img.png".to_string(),
        }]);

        // Echo events arriving after the download completes must still
        // be masked.
        assert!(fixture.suppression.is_suppressed("img.png"));
    }

    #[test]
    fn transient_failures_retry_then_dead_letter() {
        let fixture = Fixture::new();
        fs::write(fixture.root.join("a.txt"), b"abc").unwrap();
        fixture.rescan();

        for _ in 0..3 {
            fixture.drive.inject_fault(DriveError::ZoneBusy);
        }
        let executor = fixture.executor(fast_options());
        let summary = executor.run(vec![Action::UploadFile {
            path: "a.txt".to_string(),
        }]);
        assert_eq!(summary, RunSummary { applied: 0, failed: 1 });
        let letters = executor.dead_letters();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].error.contains("zone busy"));
        assert!(!fixture.remote.read().contains("a.txt"));
    }

    #[test]
    fn transient_failures_recover_within_attempts() {
        let fixture = Fixture::new();
        fs::write(fixture.root.join("a.txt"), b"abc").unwrap();
        fixture.rescan();

        fixture.drive.inject_fault(DriveError::ZoneBusy);
        fixture
            .drive
            .inject_fault(DriveError::Service("503".to_string()));
        let executor = fixture.executor(fast_options());
        let summary = executor.run(vec![Action::UploadFile {
            path: "a.txt".to_string(),
        }]);
        assert_eq!(summary, RunSummary { applied: 1, failed: 0 });
        assert!(fixture.remote.read().contains("a.txt"));
    }

    #[test]
    fn folder_cascade_executes_before_upload_needs_it() {
        let fixture = Fixture::new();
        fs::create_dir_all(fixture.root.join("x/y")).unwrap();
        fs::write(fixture.root.join("x/y/z.txt"), b"deep").unwrap();
        fixture.rescan();

        let executor = fixture.executor(fast_options());
        let summary = executor.run(vec![
            Action::CreateFolder {
                path: "x".to_string(),
                side: Side::Remote,
            },
            Action::CreateFolder {
                path: "x/y".to_string(),
                side: Side::Remote,
            },
            Action::UploadFile {
                path: "x/y/z.txt".to_string(),
            },
        ]);
        assert_eq!(summary, RunSummary { applied: 3, failed: 0 });
        assert_eq!(fixture.drive.file_count(), 1);
        assert!(fixture.remote.read().contains("x/y/z.txt"));
    }

    #[test]
    fn local_move_renames_on_disk_and_in_index() {
        let fixture = Fixture::new();
        fs::create_dir_all(fixture.root.join("docs")).unwrap();
        fs::write(fixture.root.join("docs/old.pdf"), b"pdf").unwrap();
        fixture.drive.add_file("docs/new.pdf", 3, 1_700_000_000);
        fixture.rescan();

        let executor = fixture.executor(fast_options());
        let summary = executor.run(vec![
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
        ]);
        assert_eq!(summary.failed, 0);
        assert!(!fixture.root.join("docs/old.pdf").exists());
        assert!(fixture.root.join("docs/new.pdf").exists());
        assert!(fixture.local.read().contains("docs/new.pdf"));
        // Remote side had already renamed (candidate swap), so the
        // remote half was an index no-op.
        assert!(fixture.remote.read().contains("docs/new.pdf"));
    }

    /// Wraps the memory drive and counts mutating calls in flight to
    /// check the remote-write pool really is width 1.
    struct ProbeDrive {
        inner: MemoryDrive,
        in_flight: AtomicUsize,
        max_seen: AtomicUsize,
    }

    impl ProbeDrive {
        fn enter(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
        }

        fn exit(&self) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl DriveClient for ProbeDrive {
        fn list_root(&self) -> DriveResult<RootInfo> {
            self.inner.list_root()
        }
        fn list_folder(&self, handle: &str) -> DriveResult<Vec<DriveItem>> {
            self.inner.list_folder(handle)
        }
        fn download(&self, handle: &str, dest: &Path) -> DriveResult<()> {
            self.inner.download(handle, dest)
        }
        fn upload(
            &self,
            parent: &str,
            name: &str,
            source: &Path,
            mtime: i64,
        ) -> DriveResult<String> {
            self.enter();
            let result = self.inner.upload(parent, name, source, mtime);
            self.exit();
            result
        }
        fn create_folder(&self, parent: &str, name: &str) -> DriveResult<String> {
            self.enter();
            let result = self.inner.create_folder(parent, name);
            self.exit();
            result
        }
        fn delete(&self, handle: &str) -> DriveResult<()> {
            self.enter();
            let result = self.inner.delete(handle);
            self.exit();
            result
        }
        fn rename(&self, handle: &str, new_parent: &str, new_name: &str) -> DriveResult<()> {
            self.enter();
            let result = self.inner.rename(handle, new_parent, new_name);
            self.exit();
            result
        }
    }

    #[test]
    fn remote_mutations_never_run_concurrently() {
        let fixture = Fixture::new();
        let mut plan = Plan::new();
        for index in 0..8 {
            let name = format!("file{index}.txt");
            fs::write(fixture.root.join(&name), b"data").unwrap();
            plan.push(Action::UploadFile { path: name });
        }
        fixture.rescan();

        let probe = Arc::new(ProbeDrive {
            inner: fixture.drive.clone(),
            in_flight: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let executor = Executor::new(
            probe.clone(),
            fixture.root.clone(),
            fixture.local.clone(),
            fixture.remote.clone(),
            fixture.suppression.clone(),
            Arc::new(AtomicBool::new(false)),
            fast_options(),
        );

        let summary = executor.run(plan);
        assert_eq!(summary.failed, 0);
        assert_eq!(probe.max_seen.load(Ordering::SeqCst), 1);
    }
}
